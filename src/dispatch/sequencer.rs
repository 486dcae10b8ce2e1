//! Order sequencing: the mapping from an active mission leaf to VDA5050
//! Orders for one robot.
//!
//! Owns orderId stability, orderUpdateId increments for retries and route
//! updates, sequenceId arithmetic from the robot's last reported node, and
//! completion/failure detection from inbound State telemetry.

use std::collections::HashMap;

use uuid::Uuid;

use crate::error::ValidationError;
use crate::objects::common::Pose2D;
use crate::objects::mission::{ActionNode, FailureKind};
use crate::vda5050::{
    mission_node_of_id, ActionStatus, InstantActions, Order, State,
};

/// What the in-flight order is waiting on.
#[derive(Debug, Clone)]
enum LeafKind {
    Route { final_sequence_id: u64 },
    Action { action_id: String },
}

/// The order currently executing on the robot.
#[derive(Debug, Clone)]
pub struct InFlightOrder {
    pub mission: String,
    pub node_index: usize,
    pub order: Order,
    kind: LeafKind,
}

/// Progress of the in-flight leaf derived from one State message.
#[derive(Debug, Clone, PartialEq)]
pub enum LeafProgress {
    Pending,
    Succeeded,
    Failed {
        kind: FailureKind,
        message: String,
        /// Mission-tree nodes named by fatal error references.
        node_errors: Vec<(usize, String)>,
    },
}

/// Progress of a pending cancelOrder instant action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAck {
    Pending,
    Finished,
    Failed,
}

#[derive(Debug, Clone)]
struct PendingCancel {
    action_id: String,
}

/// Per-robot order sequencing state.
pub struct OrderSequencer {
    in_flight: Option<InFlightOrder>,
    pending_cancel: Option<PendingCancel>,
    /// Last orderUpdateId issued per orderId; retries and updates continue
    /// the sequence instead of restarting it.
    update_ids: HashMap<String, u32>,
}

impl OrderSequencer {
    pub fn new() -> Self {
        OrderSequencer {
            in_flight: None,
            pending_cancel: None,
            update_ids: HashMap::new(),
        }
    }

    pub fn in_flight(&self) -> Option<&InFlightOrder> {
        self.in_flight.as_ref()
    }

    /// Next orderUpdateId for an orderId: 0 for the first issue, previous+1
    /// for every retry or update.
    fn next_update_id(&mut self, order_id: &str) -> u32 {
        match self.update_ids.get(order_id) {
            Some(prev) => prev + 1,
            None => 0,
        }
    }

    fn track(&mut self, order: &Order) {
        self.update_ids
            .insert(order.order_id.clone(), order.order_update_id);
    }

    /// Builds the order for a route leaf and records it as in flight.
    pub fn start_route(
        &mut self,
        mission: &str,
        node_index: usize,
        waypoints: &[Pose2D],
        robot_pose: &Pose2D,
        last_node_sequence_id: u64,
    ) -> Order {
        let order_id = Order::order_id_for(mission, node_index);
        let update_id = self.next_update_id(&order_id);
        let order = Order::from_route(
            mission,
            node_index,
            waypoints,
            robot_pose,
            last_node_sequence_id,
            update_id,
        );
        self.track(&order);
        self.in_flight = Some(InFlightOrder {
            mission: mission.to_string(),
            node_index,
            kind: LeafKind::Route {
                final_sequence_id: order.final_sequence_id(),
            },
            order: order.clone(),
        });
        order
    }

    /// Builds the order for an action leaf and records it as in flight.
    pub fn start_action(
        &mut self,
        mission: &str,
        node_index: usize,
        action: &ActionNode,
        robot_pose: &Pose2D,
        last_node_sequence_id: u64,
    ) -> Order {
        let order_id = Order::order_id_for(mission, node_index);
        let update_id = self.next_update_id(&order_id);
        let order = Order::from_action(
            mission,
            node_index,
            action,
            robot_pose,
            last_node_sequence_id,
            update_id,
        );
        let action_id = order.nodes[0].actions[0].action_id.clone();
        self.track(&order);
        self.in_flight = Some(InFlightOrder {
            mission: mission.to_string(),
            node_index,
            kind: LeafKind::Action { action_id },
            order: order.clone(),
        });
        order
    }

    /// Re-attaches to an order already executing on the robot, used when
    /// resuming a RUNNING mission after a controller restart.
    pub fn attach_route(
        &mut self,
        mission: &str,
        node_index: usize,
        waypoint_count: usize,
        observed: &State,
    ) {
        let base = observed
            .last_node_sequence_id
            .saturating_sub(observed.last_node_sequence_id % 2);
        // Best effort: the final waypoint is `waypoint_count` even steps past
        // whatever base the original order used. With the original order
        // lost, trust the node states the robot reports instead.
        let final_sequence_id = observed
            .node_states
            .iter()
            .map(|n| n.sequence_id)
            .max()
            .unwrap_or(base + 2 * waypoint_count as u64);
        self.update_ids
            .insert(observed.order_id.clone(), observed.order_update_id);
        self.in_flight = Some(InFlightOrder {
            mission: mission.to_string(),
            node_index,
            kind: LeafKind::Route { final_sequence_id },
            order: Order {
                order_id: observed.order_id.clone(),
                order_update_id: observed.order_update_id,
                ..Order::from_route(mission, node_index, &[], &Pose2D::default(), base, 0)
            },
        });
    }

    /// Re-attaches to an in-flight action order after a restart.
    pub fn attach_action(&mut self, mission: &str, node_index: usize, observed: &State) {
        let action_id = format!("{mission}-n{node_index}-a0");
        self.update_ids
            .insert(observed.order_id.clone(), observed.order_update_id);
        self.in_flight = Some(InFlightOrder {
            mission: mission.to_string(),
            node_index,
            kind: LeafKind::Action {
                action_id: action_id.clone(),
            },
            order: Order {
                order_id: observed.order_id.clone(),
                order_update_id: observed.order_update_id,
                ..Order::from_action(
                    mission,
                    node_index,
                    &ActionNode {
                        action_type: String::new(),
                        action_parameters: serde_json::Map::new(),
                    },
                    &Pose2D::default(),
                    observed.last_node_sequence_id,
                    0,
                )
            },
        });
    }

    /// Stitches a route update into the in-flight order: the released prefix
    /// the robot already passed is kept, the replacement tail is appended,
    /// and the same orderId goes out with `orderUpdateId + 1`.
    pub fn apply_route_update(
        &mut self,
        node_name: &str,
        new_waypoints: &[Pose2D],
        last_node_sequence_id: u64,
    ) -> Result<Order, ValidationError> {
        let (mission, node_index, base, prior_nodes) = match &self.in_flight {
            Some(in_flight) => (
                in_flight.mission.clone(),
                in_flight.node_index,
                in_flight
                    .order
                    .nodes
                    .first()
                    .map(|n| n.sequence_id)
                    .unwrap_or(0),
                in_flight.order.nodes.clone(),
            ),
            None => return Err(ValidationError::NoSuchNode(node_name.to_string())),
        };
        let visited = ((last_node_sequence_id.saturating_sub(base)) / 2) as usize;
        if new_waypoints.len() < visited {
            return Err(ValidationError::ShrinkingUpdate(node_name.to_string()));
        }

        // Rebuild the full geometry, then splice: prefix nodes the robot
        // passed keep their original positions, the tail takes the update.
        let mut order = Order::from_route(
            &mission,
            node_index,
            new_waypoints,
            &Pose2D::default(),
            base,
            0,
        );
        for (i, node) in prior_nodes.iter().enumerate() {
            if node.sequence_id <= last_node_sequence_id {
                if let Some(slot) = order.nodes.get_mut(i) {
                    *slot = node.clone();
                }
            }
        }
        order.order_update_id = self.next_update_id(&order.order_id);
        self.track(&order);
        if let Some(in_flight) = self.in_flight.as_mut() {
            in_flight.order = order.clone();
            in_flight.kind = LeafKind::Route {
                final_sequence_id: order.final_sequence_id(),
            };
        }
        Ok(order)
    }

    /// Derives leaf progress from a State message.
    ///
    /// Returns `None` when the State belongs to another order (stale
    /// telemetry, or a mission this controller no longer tracks). Duplicate
    /// States for the same `(orderId, orderUpdateId)` are idempotent: they
    /// derive the same progress.
    pub fn observe(&self, state: &State) -> Option<LeafProgress> {
        let in_flight = self.in_flight.as_ref()?;
        if state.order_id != in_flight.order.order_id {
            return None;
        }

        let mut node_errors = Vec::new();
        let mut fatal = false;
        let mut order_rejected = false;
        let mut message = String::new();
        for error in state.fatal_errors() {
            fatal = true;
            if message.is_empty() {
                message = error.error_description.clone();
            }
            for reference in error.node_references() {
                if reference == in_flight.order.order_id {
                    order_rejected = true;
                    continue;
                }
                if let Some(node_index) = mission_node_of_id(reference) {
                    node_errors.push((node_index, error.error_description.clone()));
                }
            }
        }
        if fatal {
            let kind = if order_rejected {
                FailureKind::OrderRejected
            } else {
                match in_flight.kind {
                    LeafKind::Action { .. } => FailureKind::ActionFailed,
                    LeafKind::Route { .. } => FailureKind::NodeFailed,
                }
            };
            return Some(LeafProgress::Failed {
                kind,
                message,
                node_errors,
            });
        }

        match &in_flight.kind {
            LeafKind::Route { final_sequence_id } => {
                if state.last_node_sequence_id >= *final_sequence_id {
                    Some(LeafProgress::Succeeded)
                } else {
                    Some(LeafProgress::Pending)
                }
            }
            LeafKind::Action { action_id } => match state.action_status(action_id) {
                Some(ActionStatus::Finished) => Some(LeafProgress::Succeeded),
                Some(ActionStatus::Failed) => {
                    let description = state
                        .action_states
                        .iter()
                        .find(|a| &a.action_id == action_id)
                        .map(|a| a.result_description.clone())
                        .unwrap_or_default();
                    Some(LeafProgress::Failed {
                        kind: FailureKind::ActionFailed,
                        message: description,
                        node_errors: Vec::new(),
                    })
                }
                _ => Some(LeafProgress::Pending),
            },
        }
    }

    /// Builds the cancelOrder instant action and arms ack tracking.
    pub fn request_cancel(&mut self) -> InstantActions {
        let action_id = Uuid::new_v4().to_string();
        self.pending_cancel = Some(PendingCancel {
            action_id: action_id.clone(),
        });
        InstantActions::cancel_order(action_id)
    }

    pub fn cancel_pending(&self) -> bool {
        self.pending_cancel.is_some()
    }

    /// Checks a State message for the cancel acknowledgement.
    pub fn observe_cancel(&self, state: &State) -> CancelAck {
        let Some(pending) = &self.pending_cancel else {
            return CancelAck::Pending;
        };
        match state.action_status(&pending.action_id) {
            Some(ActionStatus::Finished) => CancelAck::Finished,
            Some(ActionStatus::Failed) => CancelAck::Failed,
            _ => CancelAck::Pending,
        }
    }

    /// Clears all in-flight tracking, keeping orderId update counters.
    pub fn clear(&mut self) {
        self.in_flight = None;
        self.pending_cancel = None;
    }
}

impl Default for OrderSequencer {
    fn default() -> Self {
        OrderSequencer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vda5050::{
        ActionState, AgvPosition, Header, StateError, StateErrorLevel, StateErrorReference,
    };

    fn waypoints() -> Vec<Pose2D> {
        vec![
            Pose2D::new(1.5, 1.5, 0.0, "map"),
            Pose2D::new(3.3, 2.1, 0.0, "map"),
        ]
    }

    fn state_for(order: &Order, last_node_sequence_id: u64) -> State {
        State {
            header: Header::default(),
            order_id: order.order_id.clone(),
            order_update_id: order.order_update_id,
            last_node_id: String::new(),
            last_node_sequence_id,
            node_states: vec![],
            edge_states: vec![],
            action_states: vec![],
            battery_state: None,
            driving: false,
            agv_position: AgvPosition {
                position_initialized: true,
                x: 0.0,
                y: 0.0,
                theta: 0.0,
                map_id: "map".to_string(),
            },
            operating_mode: Default::default(),
            errors: vec![],
            information: vec![],
        }
    }

    #[test]
    fn test_route_completion_at_final_sequence() {
        let mut sequencer = OrderSequencer::new();
        let order = sequencer.start_route("m1", 0, &waypoints(), &Pose2D::default(), 0);
        assert_eq!(order.final_sequence_id(), 4);

        let progress = sequencer.observe(&state_for(&order, 2)).unwrap();
        assert_eq!(progress, LeafProgress::Pending);

        let progress = sequencer.observe(&state_for(&order, 4)).unwrap();
        assert_eq!(progress, LeafProgress::Succeeded);
    }

    #[test]
    fn test_duplicate_states_are_idempotent() {
        let mut sequencer = OrderSequencer::new();
        let order = sequencer.start_route("m1", 0, &waypoints(), &Pose2D::default(), 0);
        let state = state_for(&order, 4);
        assert_eq!(sequencer.observe(&state), Some(LeafProgress::Succeeded));
        assert_eq!(sequencer.observe(&state), Some(LeafProgress::Succeeded));
    }

    #[test]
    fn test_foreign_order_states_are_ignored() {
        let mut sequencer = OrderSequencer::new();
        let order = sequencer.start_route("m1", 0, &waypoints(), &Pose2D::default(), 0);
        let mut state = state_for(&order, 4);
        state.order_id = "other-n0".to_string();
        assert_eq!(sequencer.observe(&state), None);
    }

    #[test]
    fn test_retry_increments_update_id() {
        let mut sequencer = OrderSequencer::new();
        let first = sequencer.start_route("m1", 0, &waypoints(), &Pose2D::default(), 0);
        assert_eq!(first.order_update_id, 0);
        let retry = sequencer.start_route("m1", 0, &waypoints(), &Pose2D::default(), 4);
        assert_eq!(retry.order_id, first.order_id);
        assert_eq!(retry.order_update_id, 1);
    }

    #[test]
    fn test_action_progress_from_action_states() {
        let mut sequencer = OrderSequencer::new();
        let action = ActionNode {
            action_type: "dummy_action".to_string(),
            action_parameters: serde_json::Map::new(),
        };
        let order = sequencer.start_action("m1", 1, &action, &Pose2D::default(), 2);
        let action_id = order.nodes[0].actions[0].action_id.clone();

        let mut state = state_for(&order, 2);
        state.action_states = vec![ActionState {
            action_id: action_id.clone(),
            action_type: "dummy_action".to_string(),
            action_status: ActionStatus::Running,
            result_description: String::new(),
        }];
        assert_eq!(sequencer.observe(&state), Some(LeafProgress::Pending));

        state.action_states[0].action_status = ActionStatus::Failed;
        state.action_states[0].result_description = "bad grip".to_string();
        assert_eq!(
            sequencer.observe(&state),
            Some(LeafProgress::Failed {
                kind: FailureKind::ActionFailed,
                message: "bad grip".to_string(),
                node_errors: vec![],
            })
        );

        state.action_states[0].action_status = ActionStatus::Finished;
        assert_eq!(sequencer.observe(&state), Some(LeafProgress::Succeeded));
    }

    #[test]
    fn test_fatal_error_fails_route_and_names_node() {
        let mut sequencer = OrderSequencer::new();
        let order = sequencer.start_route("m1", 2, &waypoints(), &Pose2D::default(), 0);
        let mut state = state_for(&order, 2);
        state.errors = vec![StateError {
            error_type: "navigation".to_string(),
            error_references: vec![StateErrorReference {
                reference_key: "nodeId".to_string(),
                reference_value: "m1-n2-s4".to_string(),
            }],
            error_description: "path blocked".to_string(),
            error_level: StateErrorLevel::Fatal,
        }];
        match sequencer.observe(&state) {
            Some(LeafProgress::Failed {
                kind,
                message,
                node_errors,
            }) => {
                assert_eq!(kind, FailureKind::NodeFailed);
                assert_eq!(message, "path blocked");
                assert_eq!(node_errors, vec![(2, "path blocked".to_string())]);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_order_rejection() {
        let mut sequencer = OrderSequencer::new();
        let order = sequencer.start_route("m1", 0, &waypoints(), &Pose2D::default(), 0);
        let mut state = state_for(&order, 0);
        state.errors = vec![StateError {
            error_type: "orderError".to_string(),
            error_references: vec![StateErrorReference {
                reference_key: "orderId".to_string(),
                reference_value: order.order_id.clone(),
            }],
            error_description: "unknown map".to_string(),
            error_level: StateErrorLevel::Fatal,
        }];
        match sequencer.observe(&state) {
            Some(LeafProgress::Failed { kind, .. }) => {
                assert_eq!(kind, FailureKind::OrderRejected);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_route_update_keeps_released_prefix() {
        let mut sequencer = OrderSequencer::new();
        let ten: Vec<Pose2D> = (0..10)
            .map(|i| Pose2D::new(i as f64, 0.0, 0.0, "map"))
            .collect();
        let order = sequencer.start_route("m1", 0, &ten, &Pose2D::default(), 0);
        assert_eq!(order.final_sequence_id(), 20);

        // Robot reached waypoint 3 (sequence 6); replace the tail.
        let mut updated: Vec<Pose2D> = ten.clone();
        for pose in updated.iter_mut().skip(3) {
            pose.y = 9.0;
        }
        let update = sequencer.apply_route_update("0", &updated, 6).unwrap();
        assert_eq!(update.order_id, order.order_id);
        assert_eq!(update.order_update_id, 1);
        // Prefix positions unchanged, tail replaced.
        assert_eq!(update.nodes[3].node_position.as_ref().unwrap().y, 0.0);
        assert_eq!(update.nodes[4].node_position.as_ref().unwrap().y, 9.0);
        assert_eq!(update.nodes[0].sequence_id, 0);
    }

    #[test]
    fn test_route_update_rejects_shrinking() {
        let mut sequencer = OrderSequencer::new();
        let ten: Vec<Pose2D> = (0..10)
            .map(|i| Pose2D::new(i as f64, 0.0, 0.0, "map"))
            .collect();
        sequencer.start_route("m1", 0, &ten, &Pose2D::default(), 0);
        let shrunk: Vec<Pose2D> = ten.into_iter().take(2).collect();
        assert_eq!(
            sequencer.apply_route_update("0", &shrunk, 6),
            Err(ValidationError::ShrinkingUpdate("0".to_string()))
        );
    }

    #[test]
    fn test_cancel_ack_tracking() {
        let mut sequencer = OrderSequencer::new();
        let order = sequencer.start_route("m1", 0, &waypoints(), &Pose2D::default(), 0);
        let actions = sequencer.request_cancel();
        let action_id = actions.actions[0].action_id.clone();
        assert!(sequencer.cancel_pending());

        let mut state = state_for(&order, 2);
        assert_eq!(sequencer.observe_cancel(&state), CancelAck::Pending);

        state.action_states = vec![ActionState {
            action_id,
            action_type: "cancelOrder".to_string(),
            action_status: ActionStatus::Finished,
            result_description: String::new(),
        }];
        assert_eq!(sequencer.observe_cancel(&state), CancelAck::Finished);
    }
}
