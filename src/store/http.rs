//! REST implementation of the object store contract.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::StoreError;
use crate::objects::mission::{MissionObject, MissionStatus};
use crate::objects::robot::{RobotFilter, RobotObject, RobotStatus};
use crate::store::{ObjectStore, WatchEvent};

/// Initial retry delay for transient store failures.
const RETRY_BASE: Duration = Duration::from_millis(500);
/// Ceiling for the retry backoff.
const RETRY_MAX: Duration = Duration::from_secs(10);
/// Capacity of each watch channel before long-poll reads stop.
const WATCH_CHANNEL_SIZE: usize = 256;

#[derive(Serialize)]
struct StatusPatch<'a, T> {
    version: u64,
    status: &'a T,
}

#[derive(Deserialize)]
struct PatchReply {
    version: u64,
}

#[derive(Deserialize)]
struct ConflictReply {
    stored_version: u64,
}

/// Statuses worth retrying: server-side failures and throttling.
fn transient_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}

/// Object store client over its REST surface.
///
/// Transient transport failures are retried with capped exponential backoff
/// indefinitely; HTTP-level outcomes (404, 409) surface as typed errors.
pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpObjectStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpObjectStore {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Sends a request until it lands, retrying transport failures and
    /// transient HTTP statuses (5xx, 429) with backoff indefinitely. Only
    /// definitive responses reach the caller.
    async fn send_with_retry(
        &self,
        build: impl Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, StoreError> {
        let mut delay = RETRY_BASE;
        loop {
            let error = match build(&self.client).send().await {
                Ok(response) if transient_status(response.status()) => StoreError::Request(
                    format!("store returned {}", response.status()),
                ),
                Ok(response) => return Ok(response),
                // A request that cannot even be built will never succeed.
                Err(e) if e.is_builder() => {
                    return Err(StoreError::Contract(e.to_string()));
                }
                Err(e) => StoreError::Request(e.to_string()),
            };
            if !error.is_transient() {
                return Err(error);
            }
            tracing::warn!("{error}, retrying in {}ms", delay.as_millis());
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(RETRY_MAX);
        }
    }

    async fn get_object<T: DeserializeOwned>(
        &self,
        kind: &'static str,
        name: &str,
    ) -> Result<T, StoreError> {
        let url = self.url(&format!("{kind}/{name}"));
        let response = self.send_with_retry(|c| c.get(&url)).await?;
        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Err(StoreError::NotFound {
                kind,
                name: name.to_string(),
            }),
            status if status.is_success() => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| StoreError::Request(e.to_string()))?;
                Ok(serde_json::from_slice(&body)?)
            }
            status => Err(StoreError::Request(format!(
                "GET {url} returned {status}"
            ))),
        }
    }

    async fn patch_status<T: Serialize + Sync>(
        &self,
        kind: &'static str,
        name: &str,
        expected_version: u64,
        status: &T,
    ) -> Result<u64, StoreError> {
        let url = self.url(&format!("{kind}/{name}/status"));
        let patch = StatusPatch {
            version: expected_version,
            status,
        };
        let body = serde_json::to_vec(&patch)?;
        let response = self
            .send_with_retry(|c| {
                c.patch(&url)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body.clone())
            })
            .await?;
        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Err(StoreError::NotFound {
                kind,
                name: name.to_string(),
            }),
            reqwest::StatusCode::CONFLICT => {
                let reply: ConflictReply = response
                    .json()
                    .await
                    .map_err(|e| StoreError::Request(e.to_string()))?;
                Err(StoreError::VersionConflict {
                    kind,
                    name: name.to_string(),
                    stored: reply.stored_version,
                })
            }
            status if status.is_success() => {
                let reply: PatchReply = response
                    .json()
                    .await
                    .map_err(|e| StoreError::Request(e.to_string()))?;
                Ok(reply.version)
            }
            status => Err(StoreError::Request(format!(
                "PATCH {url} returned {status}"
            ))),
        }
    }

    async fn delete_object(&self, kind: &'static str, name: &str) -> Result<(), StoreError> {
        let url = self.url(&format!("{kind}/{name}"));
        let response = self.send_with_retry(|c| c.delete(&url)).await?;
        match response.status() {
            // Deleting an already-gone object is a no-op.
            reqwest::StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            status => Err(StoreError::Request(format!(
                "DELETE {url} returned {status}"
            ))),
        }
    }

    /// Spawns the long-poll loop feeding one watch channel. The loop resumes
    /// from the last delivered cursor across transport failures and exits
    /// when the receiver is dropped, or terminally when the store violates
    /// the watch contract (cursor not advancing).
    fn spawn_watch<T: DeserializeOwned + Send + 'static>(
        &self,
        kind: &'static str,
    ) -> mpsc::Receiver<Result<WatchEvent<T>, StoreError>> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_SIZE);
        let client = self.client.clone();
        let base = self.base_url.clone();
        tokio::spawn(async move {
            let mut cursor: Option<u64> = None;
            let mut delay = RETRY_BASE;
            loop {
                let mut request = client.get(format!("{base}/watch/{kind}"));
                if let Some(cursor) = cursor {
                    request = request.query(&[("cursor", cursor)]);
                }
                let events: Vec<WatchEvent<T>> = match request.send().await {
                    Ok(response) if response.status().is_success() => {
                        match response.json().await {
                            Ok(events) => {
                                delay = RETRY_BASE;
                                events
                            }
                            Err(e) => {
                                tracing::warn!("watch/{kind} returned bad payload: {e}");
                                tokio::time::sleep(delay).await;
                                delay = (delay * 2).min(RETRY_MAX);
                                continue;
                            }
                        }
                    }
                    Ok(response) => {
                        tracing::warn!("watch/{kind} returned {}", response.status());
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(RETRY_MAX);
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!("watch/{kind} request failed: {e}");
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(RETRY_MAX);
                        continue;
                    }
                };
                for event in events {
                    // The resume cursor must be strictly increasing; a
                    // regression means replayed or rewritten history and
                    // ends the stream with a contract violation.
                    if let Some(last) = cursor {
                        if event.cursor <= last {
                            let error = StoreError::Contract(format!(
                                "watch/{kind} cursor went from {last} to {}",
                                event.cursor
                            ));
                            tracing::error!("{error}");
                            let _ = tx.send(Err(error)).await;
                            return;
                        }
                    }
                    // Acknowledge the cursor only once the event is handed
                    // over, so a crash between poll and delivery replays it.
                    let next_cursor = event.cursor;
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                    cursor = Some(next_cursor);
                }
            }
        });
        rx
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn get_robot(&self, name: &str) -> Result<RobotObject, StoreError> {
        self.get_object("robot", name).await
    }

    async fn list_robots(&self, filter: &RobotFilter) -> Result<Vec<RobotObject>, StoreError> {
        let url = self.url("robot");
        let pairs = filter.query_pairs();
        let response = self
            .send_with_retry(|c| c.get(&url).query(&pairs))
            .await?;
        if !response.status().is_success() {
            return Err(StoreError::Request(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| StoreError::Request(e.to_string()))?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn get_mission(&self, name: &str) -> Result<MissionObject, StoreError> {
        self.get_object("mission", name).await
    }

    async fn list_missions(&self) -> Result<Vec<MissionObject>, StoreError> {
        let url = self.url("mission");
        let response = self.send_with_retry(|c| c.get(&url)).await?;
        if !response.status().is_success() {
            return Err(StoreError::Request(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| StoreError::Request(e.to_string()))?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn patch_robot_status(
        &self,
        name: &str,
        expected_version: u64,
        status: &RobotStatus,
    ) -> Result<u64, StoreError> {
        self.patch_status("robot", name, expected_version, status)
            .await
    }

    async fn patch_mission_status(
        &self,
        name: &str,
        expected_version: u64,
        status: &MissionStatus,
    ) -> Result<u64, StoreError> {
        self.patch_status("mission", name, expected_version, status)
            .await
    }

    async fn delete_robot(&self, name: &str) -> Result<(), StoreError> {
        self.delete_object("robot", name).await
    }

    async fn delete_mission(&self, name: &str) -> Result<(), StoreError> {
        self.delete_object("mission", name).await
    }

    async fn watch_robots(
        &self,
    ) -> Result<mpsc::Receiver<Result<WatchEvent<RobotObject>, StoreError>>, StoreError> {
        Ok(self.spawn_watch("robot"))
    }

    async fn watch_missions(
        &self,
    ) -> Result<mpsc::Receiver<Result<WatchEvent<MissionObject>, StoreError>>, StoreError> {
        Ok(self.spawn_watch("mission"))
    }
}
