//! The persisted robot object: desired spec and observed status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::objects::common::{ErrorLevel, ObjectLifecycle, Pose2D};

/// Aggregate state of a robot, derived by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RobotState {
    Idle,
    OnTask,
    Charging,
    MapDeployment,
}

impl RobotState {
    /// Whether the robot is busy executing something on behalf of dispatch.
    pub fn running(&self) -> bool {
        matches!(self, RobotState::OnTask | RobotState::MapDeployment)
    }
}

impl Default for RobotState {
    fn default() -> Self {
        RobotState::Idle
    }
}

/// Battery thresholds configured per robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatterySpec {
    /// Battery fraction below which the robot should charge instead of idle.
    #[serde(default = "default_critical_level")]
    pub critical_level: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_maximum: Option<f64>,
}

fn default_critical_level() -> f64 {
    0.1
}

impl Default for BatterySpec {
    fn default() -> Self {
        BatterySpec {
            critical_level: default_critical_level(),
            recommended_minimum: None,
            recommended_maximum: None,
        }
    }
}

/// Desired configuration of a robot, owned by external clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotSpec {
    #[serde(default)]
    pub battery: BatterySpec,
    /// Maximum silence, in seconds, before the robot is declared offline.
    #[serde(default = "default_heartbeat_timeout_s")]
    pub heartbeat_timeout_s: u64,
}

fn default_heartbeat_timeout_s() -> u64 {
    30
}

impl Default for RobotSpec {
    fn default() -> Self {
        RobotSpec {
            battery: BatterySpec::default(),
            heartbeat_timeout_s: default_heartbeat_timeout_s(),
        }
    }
}

/// An error surfaced on the robot status, merged from VDA5050 State errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotError {
    pub code: String,
    #[serde(default)]
    pub description: String,
    pub level: ErrorLevel,
}

/// Manufacturer/serial pair reported in VDA5050 headers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HardwareVersion {
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub serial_number: String,
}

/// Observed robot state, written only by this controller.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RobotStatus {
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub state: RobotState,
    #[serde(default)]
    pub pose: Pose2D,
    #[serde(default)]
    pub battery_level: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_ts: Option<DateTime<Utc>>,
    /// Name of the last mission dispatched to this robot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_mission: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<RobotError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factsheet_hash: Option<String>,
    #[serde(default, skip_serializing_if = "is_default_hardware")]
    pub hardware_version: HardwareVersion,
    /// Free-form data mirrored from the robot's `user_info` info messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info_messages: Option<serde_json::Value>,
}

fn is_default_hardware(hw: &HardwareVersion) -> bool {
    *hw == HardwareVersion::default()
}

/// A robot as persisted in the object store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotObject {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub lifecycle: ObjectLifecycle,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub spec: RobotSpec,
    #[serde(default)]
    pub status: RobotStatus,
}

impl RobotObject {
    pub fn new(name: impl Into<String>) -> Self {
        RobotObject {
            name: name.into(),
            labels: BTreeMap::new(),
            lifecycle: ObjectLifecycle::Created,
            version: 0,
            spec: RobotSpec::default(),
            status: RobotStatus::default(),
        }
    }
}

/// Server-side list filter for robots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RobotFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_battery: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_battery: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<RobotState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
}

impl RobotFilter {
    pub fn matches(&self, robot: &RobotObject) -> bool {
        if let Some(min) = self.min_battery {
            if robot.status.battery_level < min {
                return false;
            }
        }
        if let Some(max) = self.max_battery {
            if robot.status.battery_level > max {
                return false;
            }
        }
        if let Some(state) = self.state {
            if robot.status.state != state {
                return false;
            }
        }
        if let Some(online) = self.online {
            if robot.status.online != online {
                return false;
            }
        }
        if !self.names.is_empty() && !self.names.iter().any(|n| *n == robot.name) {
            return false;
        }
        true
    }

    /// Query-string pairs for the store's `GET /robot` endpoint.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(min) = self.min_battery {
            pairs.push(("min_battery", min.to_string()));
        }
        if let Some(max) = self.max_battery {
            pairs.push(("max_battery", max.to_string()));
        }
        if let Some(state) = self.state {
            let value = serde_json::to_value(state).unwrap_or_default();
            pairs.push(("state", value.as_str().unwrap_or_default().to_string()));
        }
        if let Some(online) = self.online {
            pairs.push(("online", online.to_string()));
        }
        for name in &self.names {
            pairs.push(("names", name.clone()));
        }
        pairs
    }
}
