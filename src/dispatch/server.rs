//! The top-level dispatch server: store watches in, telemetry in, one
//! worker per robot out.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::ControllerConfig;
use crate::dispatch::reconciler::StatusWriter;
use crate::dispatch::worker::{RobotEvent, RobotHandle, RobotWorker};
use crate::error::StoreError;
use crate::objects::mission::{MissionObject, MissionState};
use crate::objects::robot::{RobotFilter, RobotObject};
use crate::store::{ObjectStore, WatchAction, WatchEvent};
use crate::transport::{InboundMessage, OutboundPublisher};

pub struct DispatchServer {
    config: Arc<ControllerConfig>,
    store: Arc<dyn ObjectStore>,
    publisher: Arc<dyn OutboundPublisher>,
    writer: StatusWriter,
    robots: HashMap<String, RobotHandle>,
}

impl DispatchServer {
    pub fn new(
        config: Arc<ControllerConfig>,
        store: Arc<dyn ObjectStore>,
        publisher: Arc<dyn OutboundPublisher>,
    ) -> Self {
        let writer = StatusWriter::spawn(store.clone());
        DispatchServer {
            config,
            store,
            publisher,
            writer,
            robots: HashMap::new(),
        }
    }

    fn ensure_worker(&mut self, name: &str) -> &RobotHandle {
        if !self.robots.contains_key(name) {
            let handle = RobotWorker::spawn(
                name.to_string(),
                self.config.clone(),
                self.store.clone(),
                self.publisher.clone(),
                self.writer.clone(),
            );
            self.robots.insert(name.to_string(), handle);
        }
        // Just inserted when absent.
        &self.robots[name]
    }

    /// Rebuilds in-memory state from the store, re-attaching RUNNING
    /// missions, then serves watches and telemetry until shutdown.
    pub async fn run(
        &mut self,
        mut inbound: mpsc::Receiver<InboundMessage>,
    ) -> Result<(), StoreError> {
        let robots = self.store.list_robots(&RobotFilter::default()).await?;
        for robot in robots {
            let name = robot.name.clone();
            self.ensure_worker(&name)
                .send(RobotEvent::RobotChanged(Box::new(robot)))
                .await;
        }
        let missions = self.store.list_missions().await?;
        for mission in missions {
            self.route_startup_mission(mission).await;
        }

        let mut robot_watch = self.store.watch_robots().await?;
        let mut mission_watch = self.store.watch_missions().await?;
        tracing::info!("mission dispatch serving");
        loop {
            tokio::select! {
                event = robot_watch.recv() => match event {
                    Some(Ok(event)) => self.on_robot_event(event).await,
                    // The stream only errors on a contract violation, which
                    // is unrecoverable (exit code 2).
                    Some(Err(e)) => return Err(e),
                    None => robot_watch = self.store.watch_robots().await?,
                },
                event = mission_watch.recv() => match event {
                    Some(Ok(event)) => self.on_mission_event(event).await,
                    Some(Err(e)) => return Err(e),
                    None => mission_watch = self.store.watch_missions().await?,
                },
                message = inbound.recv() => match message {
                    Some(message) => self.on_inbound(message).await,
                    None => {
                        tracing::warn!("transport channel closed, shutting down");
                        break;
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown requested");
                    break;
                }
            }
        }
        // Dropping the mailboxes stops the workers. Running missions stay
        // RUNNING on the store; the restart reconciler picks them up.
        self.robots.clear();
        Ok(())
    }

    async fn route_startup_mission(&mut self, mission: MissionObject) {
        if mission.status.state.is_terminal() {
            return;
        }
        let robot = mission.spec.robot.clone();
        let event = if mission.status.state == MissionState::Running {
            RobotEvent::ResumeMission(Box::new(mission))
        } else {
            RobotEvent::MissionChanged(Box::new(mission))
        };
        self.ensure_worker(&robot).send(event).await;
    }

    async fn on_robot_event(&mut self, event: WatchEvent<RobotObject>) {
        let name = event.object.name.clone();
        let robot_event = match event.event {
            WatchAction::Add | WatchAction::Update => {
                RobotEvent::RobotChanged(Box::new(event.object))
            }
            WatchAction::Delete => RobotEvent::RobotDeleted,
        };
        self.ensure_worker(&name).send(robot_event).await;
    }

    async fn on_mission_event(&mut self, event: WatchEvent<MissionObject>) {
        let robot = event.object.spec.robot.clone();
        let mission_event = match event.event {
            WatchAction::Add | WatchAction::Update => {
                RobotEvent::MissionChanged(Box::new(event.object))
            }
            WatchAction::Delete => RobotEvent::MissionDeleted(event.object.name),
        };
        self.ensure_worker(&robot).send(mission_event).await;
    }

    async fn on_inbound(&mut self, message: InboundMessage) {
        let serial = message.serial().to_string();
        let Some(handle) = self.robots.get(&serial) else {
            tracing::warn!("ignoring message from unknown robot \"{serial}\"");
            return;
        };
        let event = match message {
            InboundMessage::State { state, .. } => RobotEvent::State(state),
            InboundMessage::Connection { connection, .. } => RobotEvent::Connection(connection),
            InboundMessage::Factsheet { payload, .. } => RobotEvent::Factsheet(payload),
        };
        handle.send(event).await;
    }
}
