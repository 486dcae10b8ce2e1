//! Status reconciliation against the object store.
//!
//! All controller status writes funnel through one writer task per process.
//! Plain telemetry writes coalesce inside a 100 ms window (latest wins per
//! object) to keep store churn down; lifecycle transitions flush the window
//! immediately so PENDING→RUNNING always lands before RUNNING→terminal.
//! Every patch is version-conditional: on conflict the writer re-reads the
//! stored version and retries, since the controller is the only status
//! owner.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::StoreError;
use crate::objects::mission::MissionStatus;
use crate::objects::robot::RobotStatus;
use crate::store::ObjectStore;

/// Coalescing window for non-transition writes.
const COALESCE_WINDOW: Duration = Duration::from_millis(100);
/// Attempts per write before the conflict is surfaced in the log.
const MAX_WRITE_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Key {
    Robot(String),
    Mission(String),
}

#[derive(Debug, Clone)]
enum Payload {
    Robot(RobotStatus),
    Mission(MissionStatus),
}

#[derive(Debug, Clone)]
struct StatusWrite {
    key: Key,
    payload: Payload,
    /// Lifecycle transitions flush immediately and are never coalesced away.
    transition: bool,
}

/// Handle used by workers to enqueue status writes.
#[derive(Clone)]
pub struct StatusWriter {
    tx: mpsc::UnboundedSender<StatusWrite>,
}

impl StatusWriter {
    /// Spawns the writer task.
    pub fn spawn(store: Arc<dyn ObjectStore>) -> StatusWriter {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(store, rx));
        StatusWriter { tx }
    }

    pub fn write_robot(&self, name: &str, status: RobotStatus, transition: bool) {
        let _ = self.tx.send(StatusWrite {
            key: Key::Robot(name.to_string()),
            payload: Payload::Robot(status),
            transition,
        });
    }

    pub fn write_mission(&self, name: &str, status: MissionStatus, transition: bool) {
        let _ = self.tx.send(StatusWrite {
            key: Key::Mission(name.to_string()),
            payload: Payload::Mission(status),
            transition,
        });
    }
}

async fn run_writer(store: Arc<dyn ObjectStore>, mut rx: mpsc::UnboundedReceiver<StatusWrite>) {
    let mut versions: HashMap<Key, u64> = HashMap::new();
    while let Some(first) = rx.recv().await {
        let mut batch: Vec<StatusWrite> = vec![first];
        if !batch[0].transition {
            let window = tokio::time::sleep(COALESCE_WINDOW);
            tokio::pin!(window);
            loop {
                tokio::select! {
                    next = rx.recv() => match next {
                        Some(write) => {
                            let flush_now = write.transition;
                            coalesce(&mut batch, write);
                            if flush_now {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = &mut window => break,
                }
            }
        }
        for write in batch {
            flush(store.as_ref(), &mut versions, write).await;
        }
    }
}

/// Latest-wins per object, preserving each object's first position in the
/// batch so cross-object ordering is stable.
fn coalesce(batch: &mut Vec<StatusWrite>, write: StatusWrite) {
    match batch
        .iter_mut()
        .find(|w| w.key == write.key && !w.transition)
    {
        Some(slot) if !write.transition => *slot = write,
        _ => batch.push(write),
    }
}

async fn flush(
    store: &dyn ObjectStore,
    versions: &mut HashMap<Key, u64>,
    write: StatusWrite,
) {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let expected = match versions.get(&write.key) {
            Some(version) => *version,
            None => match fetch_version(store, &write.key).await {
                Ok(version) => version,
                Err(StoreError::NotFound { .. }) => {
                    // Deleted externally; the watch stream delivers the
                    // deletion to the owning worker separately.
                    tracing::debug!("dropping status write for deleted {:?}", write.key);
                    return;
                }
                Err(e) => {
                    tracing::warn!("failed to read version for {:?}: {e}", write.key);
                    return;
                }
            },
        };

        let result = match (&write.key, &write.payload) {
            (Key::Robot(name), Payload::Robot(status)) => {
                store.patch_robot_status(name, expected, status).await
            }
            (Key::Mission(name), Payload::Mission(status)) => {
                store.patch_mission_status(name, expected, status).await
            }
            _ => return,
        };

        match result {
            Ok(version) => {
                versions.insert(write.key.clone(), version);
                return;
            }
            Err(StoreError::VersionConflict { stored, .. }) => {
                versions.insert(write.key.clone(), stored);
                if attempts >= MAX_WRITE_ATTEMPTS {
                    tracing::warn!(
                        "persistent store conflict on {:?} after {attempts} attempts",
                        write.key
                    );
                    return;
                }
            }
            Err(StoreError::NotFound { .. }) => {
                tracing::debug!("dropping status write for deleted {:?}", write.key);
                return;
            }
            Err(e) => {
                tracing::warn!("status write for {:?} failed: {e}", write.key);
                return;
            }
        }
    }
}

async fn fetch_version(store: &dyn ObjectStore, key: &Key) -> Result<u64, StoreError> {
    match key {
        Key::Robot(name) => Ok(store.get_robot(name).await?.version),
        Key::Mission(name) => Ok(store.get_mission(name).await?.version),
    }
}
