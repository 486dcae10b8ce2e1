//! Persisted object model shared with the external object store.
//!
//! Every object splits desired state (`spec`, owned by external clients)
//! from observed state (`status`, owned by this controller) under a common
//! envelope of name, labels, lifecycle and version.

pub mod common;
pub mod mission;
pub mod robot;

pub use common::{ErrorLevel, ObjectLifecycle, Pose2D};
pub use mission::{
    ActionNode, ConstantNode, FailureKind, MissionNode, MissionNodeKind, MissionNodeStatus,
    MissionObject, MissionSpec, MissionState, MissionStatus, RouteNode, ROOT_NODE,
};
pub use robot::{
    BatterySpec, HardwareVersion, RobotError, RobotFilter, RobotObject, RobotSpec, RobotState,
    RobotStatus,
};
