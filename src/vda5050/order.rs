//! Outbound messages: Order and InstantActions.

use serde::{Deserialize, Serialize};

use crate::objects::common::Pose2D;
use crate::objects::mission::ActionNode;
use crate::vda5050::Header;

/// Action type of the standard cancel instant action.
pub const CANCEL_ORDER_ACTION: &str = "cancelOrder";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockingType {
    /// Allows driving and other actions.
    None,
    /// Allows other actions, but not driving.
    Soft,
    /// The only allowed action at that time.
    Hard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionParameter {
    pub key: String,
    pub value: serde_json::Value,
}

/// An action attached to an order node or sent as an instant action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub action_type: String,
    pub action_id: String,
    pub blocking_type: BlockingType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub action_parameters: Vec<ActionParameter>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action_description: String,
}

impl Action {
    /// Builds the VDA5050 action for an `action` mission leaf.
    pub fn from_action_node(node: &ActionNode, action_id: String) -> Action {
        Action {
            action_type: node.action_type.clone(),
            action_id,
            blocking_type: BlockingType::Hard,
            action_parameters: node
                .action_parameters
                .iter()
                .map(|(key, value)| ActionParameter {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
            action_description: String::new(),
        }
    }

    pub fn cancel_order(action_id: String) -> Action {
        Action {
            action_type: CANCEL_ORDER_ACTION.to_string(),
            action_id,
            blocking_type: BlockingType::Hard,
            action_parameters: Vec::new(),
            action_description: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePosition {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub theta: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub map_id: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub allowed_deviation_x_y: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub allowed_deviation_theta: f64,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

impl From<&Pose2D> for NodePosition {
    fn from(pose: &Pose2D) -> Self {
        NodePosition {
            x: pose.x,
            y: pose.y,
            theta: pose.theta,
            map_id: pose.map_id.clone(),
            allowed_deviation_x_y: pose.allowed_deviation_xy,
            allowed_deviation_theta: pose.allowed_deviation_theta,
        }
    }
}

/// A node of an order: a position the robot travels to, plus any actions
/// to execute there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderNode {
    pub node_id: String,
    pub sequence_id: u64,
    pub released: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_position: Option<NodePosition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub edge_id: String,
    pub sequence_id: u64,
    pub released: bool,
    pub start_node_id: String,
    pub end_node_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
}

/// An order published to one robot: a routed path plus attached actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    #[serde(flatten)]
    pub header: Header,
    pub order_id: String,
    pub order_update_id: u32,
    pub nodes: Vec<OrderNode>,
    pub edges: Vec<Edge>,
}

impl Order {
    fn node_id(mission: &str, node_index: usize, sequence_id: u64) -> String {
        format!("{mission}-n{node_index}-s{sequence_id}")
    }

    /// Stable order id for one mission leaf.
    pub fn order_id_for(mission: &str, node_index: usize) -> String {
        format!("{mission}-n{node_index}")
    }

    /// Builds the order for a `route` leaf.
    ///
    /// The first node is the robot's current pose, unreleased, at
    /// `base_sequence_id` (the robot's last reported node sequence). Waypoint
    /// k then takes the even sequence `base + 2k` and the edge leading to it
    /// the odd `base + 2k - 1`. All waypoints are released in one shot.
    pub fn from_route(
        mission: &str,
        node_index: usize,
        waypoints: &[Pose2D],
        robot_pose: &Pose2D,
        base_sequence_id: u64,
        order_update_id: u32,
    ) -> Order {
        let mut nodes = vec![OrderNode {
            node_id: Self::node_id(mission, node_index, base_sequence_id),
            sequence_id: base_sequence_id,
            released: false,
            node_position: Some(NodePosition::from(robot_pose)),
            actions: Vec::new(),
        }];
        let mut edges = Vec::new();
        for (k, pose) in waypoints.iter().enumerate() {
            let node_seq = base_sequence_id + 2 * (k as u64 + 1);
            let edge_seq = node_seq - 1;
            edges.push(Edge {
                edge_id: format!("{mission}-e{edge_seq}"),
                sequence_id: edge_seq,
                released: true,
                start_node_id: Self::node_id(mission, node_index, node_seq - 2),
                end_node_id: Self::node_id(mission, node_index, node_seq),
                actions: Vec::new(),
            });
            nodes.push(OrderNode {
                node_id: Self::node_id(mission, node_index, node_seq),
                sequence_id: node_seq,
                released: true,
                node_position: Some(NodePosition::from(pose)),
                actions: Vec::new(),
            });
        }
        Order {
            header: Header::default(),
            order_id: Self::order_id_for(mission, node_index),
            order_update_id,
            nodes,
            edges,
        }
    }

    /// Builds the order for an `action` leaf: a single current-pose node
    /// carrying the action with HARD blocking.
    pub fn from_action(
        mission: &str,
        node_index: usize,
        action: &ActionNode,
        robot_pose: &Pose2D,
        base_sequence_id: u64,
        order_update_id: u32,
    ) -> Order {
        let action_id = format!("{mission}-n{node_index}-a0");
        Order {
            header: Header::default(),
            order_id: Self::order_id_for(mission, node_index),
            order_update_id,
            nodes: vec![OrderNode {
                node_id: Self::node_id(mission, node_index, base_sequence_id),
                sequence_id: base_sequence_id,
                released: true,
                node_position: Some(NodePosition::from(robot_pose)),
                actions: vec![Action::from_action_node(action, action_id)],
            }],
            edges: Vec::new(),
        }
    }

    /// Sequence id of the final waypoint; completion is reaching this node.
    pub fn final_sequence_id(&self) -> u64 {
        self.nodes.last().map(|n| n.sequence_id).unwrap_or(0)
    }
}

/// Out-of-band actions that do not belong to an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstantActions {
    #[serde(flatten)]
    pub header: Header,
    pub actions: Vec<Action>,
}

impl InstantActions {
    pub fn cancel_order(action_id: String) -> InstantActions {
        InstantActions {
            header: Header::default(),
            actions: vec![Action::cancel_order(action_id)],
        }
    }
}
