//! Environment-driven configuration.

pub mod controller;
pub mod helpers;

pub use controller::{ControllerConfig, MqttTransportKind};
