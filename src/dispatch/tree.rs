//! The mission behavior-tree interpreter.
//!
//! A mission's flat node list (parent references, declared order) is compiled
//! into an immutable arena rooted at the implicit `"root"` sequence. Ticking
//! walks the tree pre-order, left-to-right, and either surfaces the single
//! active leaf to dispatch or the root's terminal result. Traversal state is
//! a small per-node state vector; completed children keep their state, which
//! gives sequences and selectors their memory.

use crate::error::ValidationError;
use crate::objects::mission::{
    MissionNodeKind, MissionObject, MissionState, MissionStatus, ROOT_NODE,
};

/// Execution state of one tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeState {
    Idle,
    Running,
    Success,
    Failure,
}

impl TreeState {
    pub fn to_mission_state(self) -> MissionState {
        match self {
            TreeState::Idle => MissionState::Pending,
            TreeState::Running => MissionState::Running,
            TreeState::Success => MissionState::Completed,
            TreeState::Failure => MissionState::Failed,
        }
    }

    fn from_mission_state(state: MissionState) -> TreeState {
        match state {
            MissionState::Pending => TreeState::Idle,
            MissionState::Running => TreeState::Running,
            MissionState::Completed => TreeState::Success,
            MissionState::Failed | MissionState::Canceled => TreeState::Failure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Sequence,
    Selector,
    Route,
    Action,
    Constant { success: bool },
}

struct TreeNode {
    name: String,
    kind: NodeKind,
    children: Vec<usize>,
}

/// Result of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// A route or action leaf is active. `node_index` addresses the mission
    /// tree; `newly_started` is set the tick the leaf left IDLE.
    Active {
        node_index: usize,
        newly_started: bool,
    },
    /// The root finished with SUCCESS or FAILURE.
    Done(TreeState),
}

pub struct MissionTree {
    /// Arena node 0 is the implicit root; node i+1 is mission tree node i.
    nodes: Vec<TreeNode>,
    states: Vec<TreeState>,
    active_leaf: Option<usize>,
    started_leaf: bool,
}

impl MissionTree {
    /// Compiles and validates a mission's tree, seeding node states from the
    /// persisted `node_status` so a tree can be rebuilt mid-flight.
    pub fn build(mission: &MissionObject) -> Result<MissionTree, ValidationError> {
        mission.validate()?;

        let mut nodes = vec![TreeNode {
            name: ROOT_NODE.to_string(),
            kind: NodeKind::Sequence,
            children: Vec::new(),
        }];
        for (i, node) in mission.spec.mission_tree.iter().enumerate() {
            let kind = match &node.kind {
                MissionNodeKind::Sequence(_) => NodeKind::Sequence,
                MissionNodeKind::Selector(_) => NodeKind::Selector,
                MissionNodeKind::Route(_) => NodeKind::Route,
                MissionNodeKind::Action(_) => NodeKind::Action,
                MissionNodeKind::Constant(c) => NodeKind::Constant { success: c.success },
            };
            let name = node.name.clone().unwrap_or_else(|| i.to_string());
            let parent = nodes
                .iter()
                .position(|n| n.name == node.parent)
                .ok_or_else(|| ValidationError::UnknownParent {
                    name: name.clone(),
                    parent: node.parent.clone(),
                })?;
            let index = nodes.len();
            nodes.push(TreeNode {
                name,
                kind,
                children: Vec::new(),
            });
            nodes[parent].children.push(index);
        }

        let states = nodes
            .iter()
            .map(|node| {
                mission
                    .status
                    .node_status
                    .get(&node.name)
                    .map(|s| TreeState::from_mission_state(s.state))
                    .unwrap_or(TreeState::Idle)
            })
            .collect();

        let mut tree = MissionTree {
            nodes,
            states,
            active_leaf: None,
            started_leaf: false,
        };
        // The root mirrors the mission state, which may already be terminal;
        // recompute it from the children instead.
        tree.states[0] = TreeState::Idle;
        Ok(tree)
    }

    /// Advances the traversal and reports the active leaf or the terminal
    /// result.
    pub fn tick(&mut self) -> Tick {
        self.active_leaf = None;
        self.started_leaf = false;
        match self.tick_node(0) {
            TreeState::Running => match self.active_leaf {
                Some(arena_index) => Tick::Active {
                    node_index: arena_index - 1,
                    newly_started: self.started_leaf,
                },
                // A leaf flipped to RUNNING is the only source of Running.
                None => Tick::Done(TreeState::Failure),
            },
            state => Tick::Done(state),
        }
    }

    fn tick_node(&mut self, index: usize) -> TreeState {
        match self.nodes[index].kind {
            NodeKind::Sequence => {
                let children = self.nodes[index].children.clone();
                for child in children {
                    match self.child_state(child) {
                        TreeState::Success => continue,
                        TreeState::Failure => {
                            self.states[index] = TreeState::Failure;
                            return TreeState::Failure;
                        }
                        _ => match self.tick_node(child) {
                            TreeState::Success => continue,
                            TreeState::Failure => {
                                self.states[index] = TreeState::Failure;
                                return TreeState::Failure;
                            }
                            running => {
                                self.states[index] = TreeState::Running;
                                return running;
                            }
                        },
                    }
                }
                self.states[index] = TreeState::Success;
                TreeState::Success
            }
            NodeKind::Selector => {
                let children = self.nodes[index].children.clone();
                for child in children {
                    match self.child_state(child) {
                        TreeState::Failure => continue,
                        TreeState::Success => {
                            self.states[index] = TreeState::Success;
                            return TreeState::Success;
                        }
                        _ => match self.tick_node(child) {
                            TreeState::Failure => continue,
                            TreeState::Success => {
                                self.states[index] = TreeState::Success;
                                return TreeState::Success;
                            }
                            running => {
                                self.states[index] = TreeState::Running;
                                return running;
                            }
                        },
                    }
                }
                self.states[index] = TreeState::Failure;
                TreeState::Failure
            }
            NodeKind::Route | NodeKind::Action => {
                if self.states[index] == TreeState::Idle {
                    self.states[index] = TreeState::Running;
                    self.started_leaf = true;
                }
                if self.states[index] == TreeState::Running {
                    self.active_leaf = Some(index);
                }
                self.states[index]
            }
            NodeKind::Constant { success } => {
                if self.states[index] == TreeState::Idle {
                    self.states[index] = if success {
                        TreeState::Success
                    } else {
                        TreeState::Failure
                    };
                }
                self.states[index]
            }
        }
    }

    fn child_state(&self, index: usize) -> TreeState {
        self.states[index]
    }

    /// Records the result of a dispatched leaf (mission tree index).
    pub fn resolve_leaf(&mut self, node_index: usize, success: bool) {
        let arena_index = node_index + 1;
        self.states[arena_index] = if success {
            TreeState::Success
        } else {
            TreeState::Failure
        };
    }

    pub fn leaf_state(&self, node_index: usize) -> TreeState {
        self.states[node_index + 1]
    }

    pub fn node_name(&self, node_index: usize) -> &str {
        &self.nodes[node_index + 1].name
    }

    /// Copies per-node states into the mission status. The root entry is
    /// managed by the caller, mirroring the mission state.
    pub fn sync_status(&self, status: &mut MissionStatus) {
        for (arena_index, node) in self.nodes.iter().enumerate().skip(1) {
            let entry = status.node_status.entry(node.name.clone()).or_default();
            let state = self.states[arena_index].to_mission_state();
            // Terminal node results are never rolled back by a re-tick.
            if !entry.state.is_terminal() {
                entry.state = state;
            }
        }
        status.current_node = self
            .active_leaf
            .map(|arena_index| self.nodes[arena_index].name.clone());
    }
}
