//! Typed client for the external object store.
//!
//! The store is an external REST+SQL service owning every persisted object.
//! The controller consumes a narrow contract: typed get/list, status-only
//! version-conditional patches, delete, and a resumable change watch. The
//! contract is a trait so tests can run against [`memory::MemoryStore`].

pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::StoreError;
use crate::objects::mission::{MissionObject, MissionStatus};
use crate::objects::robot::{RobotFilter, RobotObject, RobotStatus};

pub use http::HttpObjectStore;
pub use memory::MemoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchAction {
    Add,
    Update,
    Delete,
}

/// One change observed on the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent<T> {
    pub event: WatchAction,
    pub object: T,
    /// Resume cursor; a watch restarted from here sees no gaps.
    pub cursor: u64,
}

/// The store contract the controller consumes.
///
/// Status patches are version-conditional: `expected_version` is the object
/// version the new status was computed against, and the store rejects the
/// write with [`StoreError::VersionConflict`] when it holds a newer version.
/// All controller writes are status-only; spec fields belong to external
/// clients.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_robot(&self, name: &str) -> Result<RobotObject, StoreError>;

    async fn list_robots(&self, filter: &RobotFilter) -> Result<Vec<RobotObject>, StoreError>;

    async fn get_mission(&self, name: &str) -> Result<MissionObject, StoreError>;

    async fn list_missions(&self) -> Result<Vec<MissionObject>, StoreError>;

    /// Returns the new object version on success.
    async fn patch_robot_status(
        &self,
        name: &str,
        expected_version: u64,
        status: &RobotStatus,
    ) -> Result<u64, StoreError>;

    /// Returns the new object version on success.
    async fn patch_mission_status(
        &self,
        name: &str,
        expected_version: u64,
        status: &MissionStatus,
    ) -> Result<u64, StoreError>;

    async fn delete_robot(&self, name: &str) -> Result<(), StoreError>;

    async fn delete_mission(&self, name: &str) -> Result<(), StoreError>;

    /// Opens a change stream over robots. The stream survives transport
    /// failures internally by resuming from the last delivered cursor; the
    /// only error it ever yields is a terminal
    /// [`StoreError::Contract`] violation, after which it closes.
    async fn watch_robots(
        &self,
    ) -> Result<mpsc::Receiver<Result<WatchEvent<RobotObject>, StoreError>>, StoreError>;

    /// Opens a change stream over missions, with the same resume and error
    /// behavior.
    async fn watch_missions(
        &self,
    ) -> Result<mpsc::Receiver<Result<WatchEvent<MissionObject>, StoreError>>, StoreError>;
}
