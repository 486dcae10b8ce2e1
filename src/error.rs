//! Typed errors for the controller's internal seams.
//!
//! These cover the controller's own plumbing. Failures that belong to a
//! mission or robot (the codes surfaced on their status objects) are data,
//! not errors; see [`crate::objects::mission::FailureKind`].

use thiserror::Error;

/// Configuration resolution failures. Fatal at startup (exit code 1).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors from the object store client.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The object does not exist on the store.
    #[error("{kind} \"{name}\" not found")]
    NotFound { kind: &'static str, name: String },

    /// A version-conditional status patch lost the race.
    #[error("status write conflict on {kind} \"{name}\": stored version {stored} is newer")]
    VersionConflict {
        kind: &'static str,
        name: String,
        stored: u64,
    },

    /// Transport-level request failure. Always retried with backoff.
    #[error("store request failed: {0}")]
    Request(String),

    #[error("store returned a malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The store violated its contract (e.g. watch cursor went backwards).
    /// Unrecoverable; the process exits with code 2.
    #[error("store contract violation: {0}")]
    Contract(String),
}

impl StoreError {
    /// Whether the error is transient and the operation should be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Request(_) | StoreError::VersionConflict { .. })
    }
}

/// Errors from the MQTT transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("mqtt connection failed: {0}")]
    Connection(String),

    /// The per-robot outbound queue is saturated and nothing was droppable.
    #[error("outbound queue for robot \"{robot}\" is full")]
    QueueFull { robot: String },

    #[error("transport is shut down")]
    Closed,
}

/// Errors decoding inbound VDA5050 traffic.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unrecognized topic \"{0}\"")]
    UnknownTopic(String),

    #[error("malformed {channel} payload: {source}")]
    Payload {
        channel: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Mission tree validation failures, reported on ingest.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("mission tree must contain at least one node")]
    EmptyTree,

    #[error("object name \"{0}\" is not a valid DNS label")]
    InvalidObjectName(String),

    #[error("node name \"root\" is reserved for the implicit root sequence")]
    ReservedRoot,

    #[error("node name \"{0}\" is repeated; names must be unique within a mission")]
    DuplicateName(String),

    #[error("node \"{name}\" has parent \"{parent}\" which does not appear before it")]
    UnknownParent { name: String, parent: String },

    #[error("node \"{parent}\" is a leaf and cannot have children (child \"{name}\")")]
    LeafParent { name: String, parent: String },

    #[error("route node \"{0}\" must have at least one waypoint")]
    EmptyRoute(String),

    #[error("node \"{0}\" does not exist in the mission tree")]
    NoSuchNode(String),

    #[error("node \"{0}\" is not a route node and cannot be updated")]
    NotARoute(String),

    #[error("route node \"{0}\" already finished and rejects updates")]
    NodeFinished(String),

    #[error("route update for \"{0}\" would shrink the released prefix")]
    ShrinkingUpdate(String),
}
