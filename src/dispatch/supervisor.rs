//! Per-robot supervision: presence, pose, battery, aggregate state and the
//! error surface.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::objects::common::ErrorLevel;
use crate::objects::robot::{RobotError, RobotSpec, RobotState, RobotStatus};
use crate::vda5050::{ConnectionMessage, ConnectionState, State, StateErrorLevel};

/// How many successive States an error must be absent from before it is
/// cleared from the robot status.
const ERROR_CLEAR_MISSES: u8 = 2;

pub struct RobotSupervisor {
    heartbeat_timeout: Duration,
    critical_battery: f64,
    last_seen: Option<Instant>,
    /// The robot explicitly reported OFFLINE/CONNECTIONBROKEN and has not
    /// come back since.
    explicit_offline: bool,
    /// Consecutive States each known error has been absent from.
    error_misses: HashMap<String, u8>,
}

impl RobotSupervisor {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        RobotSupervisor {
            heartbeat_timeout,
            critical_battery: 0.1,
            last_seen: None,
            explicit_offline: false,
            error_misses: HashMap::new(),
        }
    }

    /// Applies the robot spec whenever the object changes.
    pub fn apply_spec(&mut self, spec: &RobotSpec, default_heartbeat: Duration) {
        self.heartbeat_timeout = if spec.heartbeat_timeout_s > 0 {
            Duration::from_secs(spec.heartbeat_timeout_s)
        } else {
            default_heartbeat
        };
        self.critical_battery = spec.battery.critical_level;
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// Deadline after which silence means offline; `None` before any
    /// telemetry arrived.
    pub fn heartbeat_deadline(&self) -> Option<Instant> {
        self.last_seen.map(|seen| seen + self.heartbeat_timeout)
    }

    /// Folds one State message into the robot status. Returns whether the
    /// status changed.
    pub fn observe_state(
        &mut self,
        status: &mut RobotStatus,
        state: &State,
        mission_running: bool,
    ) -> bool {
        let before = status.clone();
        self.last_seen = Some(Instant::now());
        self.explicit_offline = false;

        if !status.online {
            tracing::info!("robot {} online", state.header.serial_number);
        }
        status.online = true;
        status.last_seen_ts = Some(Utc::now());
        status.pose.x = state.agv_position.x;
        status.pose.y = state.agv_position.y;
        status.pose.theta = state.agv_position.theta;
        if !state.agv_position.map_id.is_empty() {
            status.pose.map_id = state.agv_position.map_id.clone();
        }
        if let Some(battery) = &state.battery_state {
            status.battery_level = (battery.battery_charge / 100.0).clamp(0.0, 1.0);
        }
        status.hardware_version.manufacturer = state.header.manufacturer.clone();
        status.hardware_version.serial_number = state.header.serial_number.clone();
        for info in &state.information {
            if info.info_type == "user_info" {
                status.info_messages = serde_json::from_str(&info.info_description).ok();
                break;
            }
        }

        self.merge_errors(status, state);
        status.state = self.aggregate_state(mission_running, status.battery_level);

        *status != before
    }

    /// Folds a Connection message into the robot status. Flaps are handled
    /// by the caller's heartbeat timer, not here: an OFFLINE alone never
    /// aborts a mission.
    pub fn observe_connection(
        &mut self,
        status: &mut RobotStatus,
        message: &ConnectionMessage,
    ) -> bool {
        let was_online = status.online;
        match message.connection_state {
            ConnectionState::Online => {
                self.explicit_offline = false;
                self.last_seen = Some(Instant::now());
                status.online = true;
            }
            ConnectionState::Offline | ConnectionState::Connectionbroken => {
                self.explicit_offline = true;
                status.online = false;
            }
        }
        status.online != was_online
    }

    /// Marks the robot offline after heartbeat expiry.
    pub fn mark_offline(&mut self, status: &mut RobotStatus) -> bool {
        let was_online = status.online;
        status.online = false;
        was_online
    }

    pub fn is_online(&self) -> bool {
        if self.explicit_offline {
            return false;
        }
        match self.last_seen {
            Some(seen) => seen.elapsed() <= self.heartbeat_timeout,
            None => false,
        }
    }

    /// ON_TASK dominates while a mission runs; CHARGING only competes with
    /// IDLE.
    pub fn aggregate_state(&self, mission_running: bool, battery_level: f64) -> RobotState {
        if mission_running {
            RobotState::OnTask
        } else if battery_level < self.critical_battery {
            RobotState::Charging
        } else {
            RobotState::Idle
        }
    }

    /// Merges State errors by errorType. An error clears after it is absent
    /// from two successive States.
    fn merge_errors(&mut self, status: &mut RobotStatus, state: &State) {
        let mut present: HashMap<&str, RobotError> = HashMap::new();
        for error in &state.errors {
            let level = match error.error_level {
                StateErrorLevel::Fatal => ErrorLevel::Fatal,
                StateErrorLevel::Warning => ErrorLevel::Warning,
            };
            present.insert(
                error.error_type.as_str(),
                RobotError {
                    code: error.error_type.clone(),
                    description: error.error_description.clone(),
                    level,
                },
            );
        }

        for code in present.keys() {
            self.error_misses.insert((*code).to_string(), 0);
        }
        let misses = &mut self.error_misses;
        status.errors.retain(|existing| {
            if present.contains_key(existing.code.as_str()) {
                return true;
            }
            let count = misses.entry(existing.code.clone()).or_insert(0);
            *count += 1;
            if *count >= ERROR_CLEAR_MISSES {
                misses.remove(&existing.code);
                false
            } else {
                true
            }
        });
        for (_, error) in present {
            match status.errors.iter_mut().find(|e| e.code == error.code) {
                Some(existing) => *existing = error,
                None => status.errors.push(error),
            }
        }
    }

    /// Hashes a factsheet payload into the status.
    pub fn observe_factsheet(status: &mut RobotStatus, payload: &serde_json::Value) -> bool {
        let bytes = serde_json::to_vec(payload).unwrap_or_default();
        let hash = format!("{:x}", Sha256::digest(&bytes));
        if status.factsheet_hash.as_deref() == Some(hash.as_str()) {
            return false;
        }
        status.factsheet_hash = Some(hash);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vda5050::{AgvPosition, BatteryState, Header, StateError};

    fn state(battery: f64) -> State {
        State {
            header: Header {
                header_id: 0,
                timestamp: String::new(),
                version: "v1".to_string(),
                manufacturer: "acme".to_string(),
                serial_number: "carter01".to_string(),
            },
            order_id: String::new(),
            order_update_id: 0,
            last_node_id: String::new(),
            last_node_sequence_id: 0,
            node_states: vec![],
            edge_states: vec![],
            action_states: vec![],
            battery_state: Some(BatteryState {
                battery_charge: battery,
                charging: false,
            }),
            driving: false,
            agv_position: AgvPosition {
                position_initialized: true,
                x: 1.0,
                y: 2.0,
                theta: 0.5,
                map_id: "map".to_string(),
            },
            operating_mode: Default::default(),
            errors: vec![],
            information: vec![],
        }
    }

    fn error(code: &str) -> StateError {
        StateError {
            error_type: code.to_string(),
            error_references: vec![],
            error_description: format!("{code} happened"),
            error_level: StateErrorLevel::Warning,
        }
    }

    #[test]
    fn test_state_updates_pose_battery_and_presence() {
        let mut supervisor = RobotSupervisor::new(Duration::from_secs(30));
        let mut status = RobotStatus::default();

        let changed = supervisor.observe_state(&mut status, &state(80.0), false);
        assert!(changed);
        assert!(status.online);
        assert_eq!(status.pose.x, 1.0);
        assert!((status.battery_level - 0.8).abs() < 1e-9);
        assert_eq!(status.state, RobotState::Idle);
        assert_eq!(status.hardware_version.serial_number, "carter01");
        assert!(supervisor.is_online());
    }

    #[test]
    fn test_aggregate_state_prefers_on_task() {
        let mut supervisor = RobotSupervisor::new(Duration::from_secs(30));
        supervisor.critical_battery = 0.5;
        // ON_TASK wins even below the critical battery level.
        assert_eq!(supervisor.aggregate_state(true, 0.2), RobotState::OnTask);
        assert_eq!(supervisor.aggregate_state(false, 0.2), RobotState::Charging);
        assert_eq!(supervisor.aggregate_state(false, 0.8), RobotState::Idle);
    }

    #[test]
    fn test_connection_offline_marks_offline() {
        let mut supervisor = RobotSupervisor::new(Duration::from_secs(30));
        let mut status = RobotStatus::default();
        supervisor.observe_state(&mut status, &state(80.0), false);

        let offline = ConnectionMessage {
            header: Header::default(),
            connection_state: ConnectionState::Offline,
        };
        assert!(supervisor.observe_connection(&mut status, &offline));
        assert!(!status.online);
        assert!(!supervisor.is_online());

        let online = ConnectionMessage {
            header: Header::default(),
            connection_state: ConnectionState::Online,
        };
        assert!(supervisor.observe_connection(&mut status, &online));
        assert!(status.online);
        assert!(supervisor.is_online());
    }

    #[test]
    fn test_errors_clear_after_two_clean_states() {
        let mut supervisor = RobotSupervisor::new(Duration::from_secs(30));
        let mut status = RobotStatus::default();

        let mut with_error = state(80.0);
        with_error.errors = vec![error("motor_hot")];
        supervisor.observe_state(&mut status, &with_error, false);
        assert_eq!(status.errors.len(), 1);

        // One clean State keeps the error.
        supervisor.observe_state(&mut status, &state(80.0), false);
        assert_eq!(status.errors.len(), 1);
        // The second clears it.
        supervisor.observe_state(&mut status, &state(80.0), false);
        assert!(status.errors.is_empty());
    }

    #[test]
    fn test_error_reappearing_resets_the_clear_counter() {
        let mut supervisor = RobotSupervisor::new(Duration::from_secs(30));
        let mut status = RobotStatus::default();

        let mut with_error = state(80.0);
        with_error.errors = vec![error("motor_hot")];
        supervisor.observe_state(&mut status, &with_error, false);
        supervisor.observe_state(&mut status, &state(80.0), false);
        supervisor.observe_state(&mut status, &with_error, false);
        supervisor.observe_state(&mut status, &state(80.0), false);
        // Only one miss since the error reappeared; still present.
        assert_eq!(status.errors.len(), 1);
    }

    #[test]
    fn test_factsheet_hashing_is_stable() {
        let mut status = RobotStatus::default();
        let payload = serde_json::json!({"series": "carter", "maxSpeed": 1.2});
        assert!(RobotSupervisor::observe_factsheet(&mut status, &payload));
        let first = status.factsheet_hash.clone();
        // Same payload, no change.
        assert!(!RobotSupervisor::observe_factsheet(&mut status, &payload));
        assert_eq!(status.factsheet_hash, first);
    }
}
