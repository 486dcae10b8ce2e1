//! The persisted mission object: a behavior tree of work for one robot.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::objects::common::{valid_object_name, ObjectLifecycle, Pose2D};

/// Name of the implicit sequence node that roots every mission tree.
pub const ROOT_NODE: &str = "root";

/// Execution state of a mission or of one node in its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionState {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl MissionState {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MissionState::Completed | MissionState::Failed | MissionState::Canceled
        )
    }
}

impl Default for MissionState {
    fn default() -> Self {
        MissionState::Pending
    }
}

/// Machine-readable failure codes surfaced on mission and robot status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ValidationError,
    DeadlineExceeded,
    Timeout,
    RobotOffline,
    RobotUnavailable,
    RobotDeleted,
    OrderRejected,
    ActionFailed,
    NodeFailed,
    CancelFailed,
    TransportBackpressure,
    LostOnRestart,
    StoreConflict,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ValidationError => "validation_error",
            FailureKind::DeadlineExceeded => "deadline_exceeded",
            FailureKind::Timeout => "timeout",
            FailureKind::RobotOffline => "robot_offline",
            FailureKind::RobotUnavailable => "robot_unavailable",
            FailureKind::RobotDeleted => "robot_deleted",
            FailureKind::OrderRejected => "order_rejected",
            FailureKind::ActionFailed => "action_failed",
            FailureKind::NodeFailed => "node_failed",
            FailureKind::CancelFailed => "cancel_failed",
            FailureKind::TransportBackpressure => "transport_backpressure",
            FailureKind::LostOnRestart => "lost_on_restart",
            FailureKind::StoreConflict => "store_conflict",
        }
    }
}

/// A list of waypoints for the robot to traverse in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteNode {
    pub waypoints: Vec<Pose2D>,
}

impl RouteNode {
    pub fn size(&self) -> usize {
        self.waypoints.len()
    }
}

/// A named action for the robot to perform at its current pose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionNode {
    pub action_type: String,
    #[serde(default)]
    pub action_parameters: serde_json::Map<String, serde_json::Value>,
}

/// A leaf that immediately returns a fixed result when started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantNode {
    #[serde(default = "default_constant_success")]
    pub success: bool,
}

fn default_constant_success() -> bool {
    true
}

/// The kind of a mission node. Exactly one is populated per node; the
/// externally-tagged serde form enforces that on ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionNodeKind {
    /// Runs children in order; fails on the first child failure.
    Sequence(serde_json::Map<String, serde_json::Value>),
    /// Runs children in order; succeeds on the first child success.
    Selector(serde_json::Map<String, serde_json::Value>),
    Route(RouteNode),
    Action(ActionNode),
    Constant(ConstantNode),
}

impl MissionNodeKind {
    /// Leaves are the units translated into VDA5050 Orders (or resolved
    /// immediately, for constants).
    pub fn is_leaf(&self) -> bool {
        !matches!(
            self,
            MissionNodeKind::Sequence(_) | MissionNodeKind::Selector(_)
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            MissionNodeKind::Sequence(_) => "sequence",
            MissionNodeKind::Selector(_) => "selector",
            MissionNodeKind::Route(_) => "route",
            MissionNodeKind::Action(_) => "action",
            MissionNodeKind::Constant(_) => "constant",
        }
    }
}

/// One node of the declarative mission tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionNode {
    /// Unique within the mission; assigned the node's index when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_parent")]
    pub parent: String,
    #[serde(flatten)]
    pub kind: MissionNodeKind,
}

fn default_parent() -> String {
    ROOT_NODE.to_string()
}

impl MissionNode {
    pub fn route(name: &str, parent: &str, waypoints: Vec<Pose2D>) -> Self {
        MissionNode {
            name: Some(name.to_string()),
            parent: parent.to_string(),
            kind: MissionNodeKind::Route(RouteNode { waypoints }),
        }
    }

    pub fn action(name: &str, parent: &str, action_type: &str, params: serde_json::Value) -> Self {
        let action_parameters = match params {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        MissionNode {
            name: Some(name.to_string()),
            parent: parent.to_string(),
            kind: MissionNodeKind::Action(ActionNode {
                action_type: action_type.to_string(),
                action_parameters,
            }),
        }
    }

    pub fn sequence(name: &str, parent: &str) -> Self {
        MissionNode {
            name: Some(name.to_string()),
            parent: parent.to_string(),
            kind: MissionNodeKind::Sequence(serde_json::Map::new()),
        }
    }

    pub fn selector(name: &str, parent: &str) -> Self {
        MissionNode {
            name: Some(name.to_string()),
            parent: parent.to_string(),
            kind: MissionNodeKind::Selector(serde_json::Map::new()),
        }
    }
}

/// Desired mission definition, owned by external clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionSpec {
    /// Name of the robot this mission is assigned to.
    pub robot: String,
    pub mission_tree: Vec<MissionNode>,
    /// How long the mission may stay RUNNING before it is failed.
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,
    /// Wall-clock time the mission must complete by.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub needs_canceled: bool,
    /// Pending waypoint replacements for named route nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_nodes: Option<BTreeMap<String, RouteNode>>,
}

fn default_timeout_s() -> u64 {
    300
}

/// Status of one node in the mission tree.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MissionNodeStatus {
    #[serde(default)]
    pub state: MissionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Observed mission progress, written only by this controller.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MissionStatus {
    #[serde(default)]
    pub state: MissionState,
    #[serde(default)]
    pub node_status: BTreeMap<String, MissionNodeStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<DateTime<Utc>>,
    /// Name of the node currently RUNNING, when the mission is RUNNING.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// A mission as persisted in the object store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionObject {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub lifecycle: ObjectLifecycle,
    #[serde(default)]
    pub version: u64,
    pub spec: MissionSpec,
    #[serde(default)]
    pub status: MissionStatus,
}

impl MissionObject {
    pub fn new(name: impl Into<String>, robot: impl Into<String>, tree: Vec<MissionNode>) -> Self {
        let mut mission = MissionObject {
            name: name.into(),
            labels: BTreeMap::new(),
            lifecycle: ObjectLifecycle::Created,
            version: 0,
            spec: MissionSpec {
                robot: robot.into(),
                mission_tree: tree,
                timeout_s: default_timeout_s(),
                deadline: None,
                needs_canceled: false,
                update_nodes: None,
            },
            status: MissionStatus::default(),
        };
        mission.normalize();
        mission
    }

    /// Assigns default node names (the node's index) and seeds `node_status`
    /// entries for every named node plus the implicit root.
    pub fn normalize(&mut self) {
        for (i, node) in self.spec.mission_tree.iter_mut().enumerate() {
            if node.name.is_none() {
                node.name = Some(i.to_string());
            }
        }
        self.status
            .node_status
            .entry(ROOT_NODE.to_string())
            .or_default();
        for node in &self.spec.mission_tree {
            if let Some(name) = &node.name {
                self.status.node_status.entry(name.clone()).or_default();
            }
        }
    }

    /// Validates the envelope names and the mission tree shape on ingest.
    ///
    /// Parents must be declared before their children, which also rules out
    /// cycles: a node can only attach to something that already exists.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !valid_object_name(&self.name) {
            return Err(ValidationError::InvalidObjectName(self.name.clone()));
        }
        if !valid_object_name(&self.spec.robot) {
            return Err(ValidationError::InvalidObjectName(self.spec.robot.clone()));
        }
        let tree = &self.spec.mission_tree;
        if tree.is_empty() {
            return Err(ValidationError::EmptyTree);
        }
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        seen.insert(ROOT_NODE);
        let mut leaves: BTreeSet<&str> = BTreeSet::new();
        for node in tree {
            let name = node.name.as_deref().unwrap_or_default();
            if name == ROOT_NODE {
                return Err(ValidationError::ReservedRoot);
            }
            if !seen.insert(name) {
                return Err(ValidationError::DuplicateName(name.to_string()));
            }
            if !seen.contains(node.parent.as_str()) {
                return Err(ValidationError::UnknownParent {
                    name: name.to_string(),
                    parent: node.parent.clone(),
                });
            }
            if leaves.contains(node.parent.as_str()) {
                return Err(ValidationError::LeafParent {
                    name: name.to_string(),
                    parent: node.parent.clone(),
                });
            }
            match &node.kind {
                MissionNodeKind::Route(route) if route.waypoints.is_empty() => {
                    return Err(ValidationError::EmptyRoute(name.to_string()));
                }
                kind if kind.is_leaf() => {
                    leaves.insert(name);
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Looks up a tree node index by name.
    pub fn node_index(&self, name: &str) -> Option<usize> {
        self.spec
            .mission_tree
            .iter()
            .position(|n| n.name.as_deref() == Some(name))
    }
}
