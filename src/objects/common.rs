//! Shared pieces of the persisted object model.

use serde::{Deserialize, Serialize};

/// Lifecycle of a persisted object, owned by the external store.
///
/// The controller reads lifecycle but never writes it; `PendingDelete` is the
/// store's signal that a client deleted the object and the controller must
/// finish with it before the store removes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectLifecycle {
    Created,
    Running,
    Completed,
    PendingDelete,
}

impl Default for ObjectLifecycle {
    fn default() -> Self {
        ObjectLifecycle::Created
    }
}

/// A 2D pose on a named map.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose2D {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    /// Rotation in radians.
    #[serde(default)]
    pub theta: f64,
    #[serde(default)]
    pub map_id: String,
    /// Allowed coordinate deviation radius in meters.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub allowed_deviation_xy: f64,
    /// Allowed theta deviation in radians.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub allowed_deviation_theta: f64,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

impl Pose2D {
    pub fn new(x: f64, y: f64, theta: f64, map_id: impl Into<String>) -> Self {
        Pose2D {
            x,
            y,
            theta,
            map_id: map_id.into(),
            ..Pose2D::default()
        }
    }
}

/// Severity attached to robot/mission surface errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorLevel {
    Warning,
    Fatal,
}

/// Checks the DNS-label shape required of object names: 1-63 characters of
/// lowercase alphanumerics and dashes, not starting or ending with a dash.
pub fn valid_object_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 63 {
        return false;
    }
    let bytes = name.as_bytes();
    if bytes[0] == b'-' || bytes[bytes.len() - 1] == b'-' {
        return false;
    }
    bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}
