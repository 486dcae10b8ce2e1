//! Controller configuration resolved from the environment.

use std::time::Duration;

use crate::config::helpers::{env_parse, optional_env};
use crate::error::ConfigError;

/// How the MQTT session reaches the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttTransportKind {
    Tcp,
    Websockets,
}

/// Resolved controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_transport: MqttTransportKind,
    /// Websocket path, used only with the websockets transport.
    pub mqtt_ws_path: Option<String>,
    /// Leading topic segment; full topics are
    /// `{prefix}/{interface_version}/{manufacturer}/{serial}/{channel}`.
    pub mqtt_prefix: String,
    pub manufacturer: String,
    pub interface_version: String,
    /// Base URL of the object store REST API.
    pub database_url: String,
    /// Heartbeat timeout applied to robots that do not configure their own.
    pub heartbeat_timeout_default: Duration,
    /// Bound on waiting for a cancelOrder acknowledgement.
    pub cancel_timeout: Duration,
    /// Bound on re-attaching RUNNING missions after a restart.
    pub resume_timeout: Duration,
    /// Per-robot outbound queue bound while the broker is unreachable.
    pub backpressure_queue_size: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_transport: MqttTransportKind::Tcp,
            mqtt_ws_path: None,
            mqtt_prefix: "uagv".to_string(),
            manufacturer: "robots".to_string(),
            interface_version: "v1".to_string(),
            database_url: "http://localhost:5001".to_string(),
            heartbeat_timeout_default: Duration::from_secs(30),
            cancel_timeout: Duration::from_secs(15),
            resume_timeout: Duration::from_secs(60),
            backpressure_queue_size: 64,
        }
    }
}

impl ControllerConfig {
    /// Resolves configuration from the environment on top of the defaults.
    pub fn resolve() -> Result<Self, ConfigError> {
        let defaults = ControllerConfig::default();
        let mqtt_transport = match optional_env("MQTT_TRANSPORT")?.as_deref() {
            None | Some("tcp") => MqttTransportKind::Tcp,
            Some("websockets") => MqttTransportKind::Websockets,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "MQTT_TRANSPORT".to_string(),
                    message: format!("must be \"tcp\" or \"websockets\", got \"{other}\""),
                })
            }
        };
        let config = ControllerConfig {
            mqtt_host: optional_env("MQTT_HOST")?.unwrap_or(defaults.mqtt_host),
            mqtt_port: env_parse("MQTT_PORT", defaults.mqtt_port)?,
            mqtt_transport,
            mqtt_ws_path: optional_env("MQTT_WS_PATH")?,
            mqtt_prefix: optional_env("MQTT_PREFIX")?.unwrap_or(defaults.mqtt_prefix),
            manufacturer: optional_env("MANUFACTURER")?.unwrap_or(defaults.manufacturer),
            interface_version: optional_env("INTERFACE_VERSION")?
                .unwrap_or(defaults.interface_version),
            database_url: optional_env("DATABASE_URL")?.unwrap_or(defaults.database_url),
            heartbeat_timeout_default: Duration::from_secs(env_parse(
                "HEARTBEAT_TIMEOUT_DEFAULT_SECS",
                defaults.heartbeat_timeout_default.as_secs(),
            )?),
            cancel_timeout: Duration::from_secs(env_parse(
                "CANCEL_TIMEOUT_SECS",
                defaults.cancel_timeout.as_secs(),
            )?),
            resume_timeout: Duration::from_secs(env_parse(
                "RESUME_TIMEOUT_SECS",
                defaults.resume_timeout.as_secs(),
            )?),
            backpressure_queue_size: env_parse(
                "BACKPRESSURE_QUEUE_SIZE",
                defaults.backpressure_queue_size,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.backpressure_queue_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "BACKPRESSURE_QUEUE_SIZE".to_string(),
                message: "must be a positive integer".to_string(),
            });
        }
        if self.heartbeat_timeout_default.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "HEARTBEAT_TIMEOUT_DEFAULT_SECS".to_string(),
                message: "must be a positive integer".to_string(),
            });
        }
        Ok(())
    }
}
