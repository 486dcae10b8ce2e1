//! Inbound messages: State, Connection and the enums they carry.

use serde::{Deserialize, Serialize};

use crate::vda5050::order::NodePosition;
use crate::vda5050::Header;

/// Stage of an action's lifecycle as reported by the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Waiting,
    Initializing,
    Running,
    Paused,
    Finished,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionState {
    pub action_id: String,
    #[serde(default)]
    pub action_type: String,
    #[serde(default = "default_action_status")]
    pub action_status: ActionStatus,
    #[serde(default)]
    pub result_description: String,
}

fn default_action_status() -> ActionStatus {
    ActionStatus::Waiting
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    pub node_id: String,
    pub sequence_id: u64,
    #[serde(default)]
    pub released: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_position: Option<NodePosition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeState {
    pub edge_id: String,
    pub sequence_id: u64,
    #[serde(default)]
    pub released: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgvPosition {
    #[serde(default)]
    pub position_initialized: bool,
    pub x: f64,
    pub y: f64,
    pub theta: f64,
    #[serde(default)]
    pub map_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryState {
    /// Charge as a percentage in `[0, 100]`.
    pub battery_charge: f64,
    #[serde(default)]
    pub charging: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateErrorLevel {
    Warning,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateErrorReference {
    pub reference_key: String,
    pub reference_value: String,
}

/// An error reported by the robot, optionally referencing the order node or
/// action it applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateError {
    #[serde(default)]
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_references: Vec<StateErrorReference>,
    #[serde(default)]
    pub error_description: String,
    pub error_level: StateErrorLevel,
}

impl StateError {
    /// Reference values under node/action keys, used to resolve which
    /// mission node a fatal error belongs to.
    pub fn node_references(&self) -> impl Iterator<Item = &str> {
        self.error_references
            .iter()
            .filter(|r| {
                matches!(
                    r.reference_key.as_str(),
                    "node_id" | "nodeId" | "action_id" | "actionId" | "order_id" | "orderId"
                )
            })
            .map(|r| r.reference_value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateInfo {
    pub info_type: String,
    #[serde(default)]
    pub info_description: String,
    #[serde(default)]
    pub info_level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatingMode {
    Automatic,
    Semiautomatic,
    Manual,
    Service,
    Teachin,
}

impl Default for OperatingMode {
    fn default() -> Self {
        OperatingMode::Automatic
    }
}

/// Periodic robot telemetry: order progress, pose, battery and errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    #[serde(flatten)]
    pub header: Header,
    #[serde(default)]
    pub order_id: String,
    #[serde(default)]
    pub order_update_id: u32,
    #[serde(default)]
    pub last_node_id: String,
    #[serde(default)]
    pub last_node_sequence_id: u64,
    #[serde(default)]
    pub node_states: Vec<NodeState>,
    #[serde(default)]
    pub edge_states: Vec<EdgeState>,
    #[serde(default)]
    pub action_states: Vec<ActionState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_state: Option<BatteryState>,
    #[serde(default)]
    pub driving: bool,
    pub agv_position: AgvPosition,
    #[serde(default)]
    pub operating_mode: OperatingMode,
    #[serde(default)]
    pub errors: Vec<StateError>,
    #[serde(default)]
    pub information: Vec<StateInfo>,
}

impl State {
    pub fn action_status(&self, action_id: &str) -> Option<ActionStatus> {
        self.action_states
            .iter()
            .find(|a| a.action_id == action_id)
            .map(|a| a.action_status)
    }

    pub fn fatal_errors(&self) -> impl Iterator<Item = &StateError> {
        self.errors
            .iter()
            .filter(|e| e.error_level == StateErrorLevel::Fatal)
    }
}

/// Robot presence signal, used as the heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Online,
    Offline,
    Connectionbroken,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMessage {
    #[serde(flatten)]
    pub header: Header,
    pub connection_state: ConnectionState,
}
