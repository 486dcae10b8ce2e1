//! In-memory object store used by tests.
//!
//! Implements the same contract as the REST client, including version
//! counters, conflict detection and watch fanout, plus the spec-side
//! mutations an external client would perform.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::StoreError;
use crate::objects::mission::{MissionObject, MissionStatus};
use crate::objects::robot::{RobotFilter, RobotObject, RobotStatus};
use crate::objects::ObjectLifecycle;
use crate::store::{ObjectStore, WatchAction, WatchEvent};

const WATCH_CHANNEL_SIZE: usize = 256;

struct Inner {
    robots: BTreeMap<String, RobotObject>,
    missions: BTreeMap<String, MissionObject>,
    cursor: u64,
    robot_watchers: Vec<mpsc::Sender<Result<WatchEvent<RobotObject>, StoreError>>>,
    mission_watchers: Vec<mpsc::Sender<Result<WatchEvent<MissionObject>, StoreError>>>,
}

impl Inner {
    fn next_cursor(&mut self) -> u64 {
        self.cursor += 1;
        self.cursor
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            inner: Arc::new(Mutex::new(Inner {
                robots: BTreeMap::new(),
                missions: BTreeMap::new(),
                cursor: 0,
                robot_watchers: Vec::new(),
                mission_watchers: Vec::new(),
            })),
        }
    }

    async fn emit_robot(inner: &mut Inner, event: WatchAction, object: RobotObject) {
        let cursor = inner.next_cursor();
        let mut alive = Vec::new();
        for tx in inner.robot_watchers.drain(..) {
            let ok = tx
                .send(Ok(WatchEvent {
                    event,
                    object: object.clone(),
                    cursor,
                }))
                .await
                .is_ok();
            if ok {
                alive.push(tx);
            }
        }
        inner.robot_watchers = alive;
    }

    async fn emit_mission(inner: &mut Inner, event: WatchAction, object: MissionObject) {
        let cursor = inner.next_cursor();
        let mut alive = Vec::new();
        for tx in inner.mission_watchers.drain(..) {
            let ok = tx
                .send(Ok(WatchEvent {
                    event,
                    object: object.clone(),
                    cursor,
                }))
                .await
                .is_ok();
            if ok {
                alive.push(tx);
            }
        }
        inner.mission_watchers = alive;
    }

    /// Creates or replaces a robot spec, as an external client would.
    pub async fn put_robot(&self, mut robot: RobotObject) {
        let mut inner = self.inner.lock().await;
        let event = match inner.robots.get(&robot.name) {
            Some(existing) => {
                robot.version = existing.version + 1;
                WatchAction::Update
            }
            None => WatchAction::Add,
        };
        inner.robots.insert(robot.name.clone(), robot.clone());
        Self::emit_robot(&mut inner, event, robot).await;
    }

    /// Creates or replaces a mission, as an external client would.
    pub async fn put_mission(&self, mut mission: MissionObject) {
        mission.normalize();
        let mut inner = self.inner.lock().await;
        let event = match inner.missions.get(&mission.name) {
            Some(existing) => {
                mission.version = existing.version + 1;
                WatchAction::Update
            }
            None => WatchAction::Add,
        };
        inner.missions.insert(mission.name.clone(), mission.clone());
        Self::emit_mission(&mut inner, event, mission).await;
    }

    /// Marks a mission for cancellation (`POST /mission/{name}/cancel`).
    pub async fn request_cancel(&self, name: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(mission) = inner.missions.get_mut(name) {
            mission.spec.needs_canceled = true;
            mission.version += 1;
            let snapshot = mission.clone();
            Self::emit_mission(&mut inner, WatchAction::Update, snapshot).await;
        }
    }

    /// Replaces waypoints of named route nodes
    /// (`POST /mission/{name}/update`).
    pub async fn request_update(
        &self,
        name: &str,
        update_nodes: BTreeMap<String, crate::objects::mission::RouteNode>,
    ) {
        let mut inner = self.inner.lock().await;
        if let Some(mission) = inner.missions.get_mut(name) {
            mission.spec.update_nodes = Some(update_nodes);
            mission.version += 1;
            let snapshot = mission.clone();
            Self::emit_mission(&mut inner, WatchAction::Update, snapshot).await;
        }
    }

    /// Marks a mission PENDING_DELETE, as the store does when a client
    /// deletes an unfinished mission.
    pub async fn request_mission_delete(&self, name: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(mission) = inner.missions.get_mut(name) {
            mission.lifecycle = ObjectLifecycle::PendingDelete;
            mission.version += 1;
            let snapshot = mission.clone();
            Self::emit_mission(&mut inner, WatchAction::Update, snapshot).await;
        }
    }

    /// Removes a robot outright, emitting a Delete event.
    pub async fn remove_robot(&self, name: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(robot) = inner.robots.remove(name) {
            Self::emit_robot(&mut inner, WatchAction::Delete, robot).await;
        }
    }

    /// Test accessor for the stored mission.
    pub async fn mission(&self, name: &str) -> Option<MissionObject> {
        self.inner.lock().await.missions.get(name).cloned()
    }

    /// Test accessor for the stored robot.
    pub async fn robot(&self, name: &str) -> Option<RobotObject> {
        self.inner.lock().await.robots.get(name).cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_robot(&self, name: &str) -> Result<RobotObject, StoreError> {
        self.inner
            .lock()
            .await
            .robots
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "robot",
                name: name.to_string(),
            })
    }

    async fn list_robots(&self, filter: &RobotFilter) -> Result<Vec<RobotObject>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .robots
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn get_mission(&self, name: &str) -> Result<MissionObject, StoreError> {
        self.inner
            .lock()
            .await
            .missions
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "mission",
                name: name.to_string(),
            })
    }

    async fn list_missions(&self) -> Result<Vec<MissionObject>, StoreError> {
        Ok(self.inner.lock().await.missions.values().cloned().collect())
    }

    async fn patch_robot_status(
        &self,
        name: &str,
        expected_version: u64,
        status: &RobotStatus,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let robot = inner
            .robots
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound {
                kind: "robot",
                name: name.to_string(),
            })?;
        if robot.version > expected_version {
            return Err(StoreError::VersionConflict {
                kind: "robot",
                name: name.to_string(),
                stored: robot.version,
            });
        }
        robot.status = status.clone();
        robot.version += 1;
        let version = robot.version;
        let snapshot = robot.clone();
        Self::emit_robot(&mut inner, WatchAction::Update, snapshot).await;
        Ok(version)
    }

    async fn patch_mission_status(
        &self,
        name: &str,
        expected_version: u64,
        status: &MissionStatus,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let mission = inner
            .missions
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound {
                kind: "mission",
                name: name.to_string(),
            })?;
        if mission.version > expected_version {
            return Err(StoreError::VersionConflict {
                kind: "mission",
                name: name.to_string(),
                stored: mission.version,
            });
        }
        mission.status = status.clone();
        mission.version += 1;
        let version = mission.version;
        let snapshot = mission.clone();
        Self::emit_mission(&mut inner, WatchAction::Update, snapshot).await;
        Ok(version)
    }

    async fn delete_robot(&self, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(robot) = inner.robots.remove(name) {
            Self::emit_robot(&mut inner, WatchAction::Delete, robot).await;
        }
        Ok(())
    }

    async fn delete_mission(&self, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(mission) = inner.missions.remove(name) {
            Self::emit_mission(&mut inner, WatchAction::Delete, mission).await;
        }
        Ok(())
    }

    async fn watch_robots(
        &self,
    ) -> Result<mpsc::Receiver<Result<WatchEvent<RobotObject>, StoreError>>, StoreError> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_SIZE);
        self.inner.lock().await.robot_watchers.push(tx);
        Ok(rx)
    }

    async fn watch_missions(
        &self,
    ) -> Result<mpsc::Receiver<Result<WatchEvent<MissionObject>, StoreError>>, StoreError> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_SIZE);
        self.inner.lock().await.mission_watchers.push(tx);
        Ok(rx)
    }
}
