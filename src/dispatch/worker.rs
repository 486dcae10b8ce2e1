//! The per-robot controller loop.
//!
//! One worker task owns everything about a robot: its supervisor, its order
//! sequencer, its mission queue and the currently executing mission. Events
//! arrive on a single mailbox (object-store changes and robot telemetry);
//! timers cover heartbeat, mission timeout, deadline, cancel acks and
//! restart resume. Robots never share state, so workers never talk to each
//! other.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ControllerConfig;
use crate::dispatch::reconciler::StatusWriter;
use crate::dispatch::sequencer::{CancelAck, LeafProgress, OrderSequencer};
use crate::dispatch::supervisor::RobotSupervisor;
use crate::dispatch::tree::{MissionTree, Tick, TreeState};
use crate::error::TransportError;
use crate::objects::mission::{
    FailureKind, MissionNodeKind, MissionObject, MissionState, RouteNode,
};
use crate::objects::robot::RobotObject;
use crate::objects::ObjectLifecycle;
use crate::store::ObjectStore;
use crate::transport::OutboundPublisher;
use crate::vda5050::{ConnectionMessage, State};

/// Everything a worker can receive.
#[derive(Debug)]
pub enum RobotEvent {
    RobotChanged(Box<RobotObject>),
    /// The robot object was deleted on the store.
    RobotDeleted,
    MissionChanged(Box<MissionObject>),
    /// A mission was hard-deleted on the store.
    MissionDeleted(String),
    /// A RUNNING mission found on startup; re-attach or fail it.
    ResumeMission(Box<MissionObject>),
    State(Box<State>),
    Connection(ConnectionMessage),
    Factsheet(serde_json::Value),
}

/// Mailbox handle held by the dispatch server.
pub struct RobotHandle {
    pub tx: mpsc::Sender<RobotEvent>,
    pub task: JoinHandle<()>,
}

impl RobotHandle {
    pub async fn send(&self, event: RobotEvent) {
        let _ = self.tx.send(event).await;
    }
}

struct ResumeInfo {
    expected_order: String,
    node_index: usize,
}

struct ActiveMission {
    mission: MissionObject,
    tree: MissionTree,
    timeout_at: Instant,
    deadline_at: Option<Instant>,
    cancel_deadline: Option<Instant>,
    resume: Option<ResumeInfo>,
    resume_deadline: Option<Instant>,
}

impl ActiveMission {
    fn pending_delete(&self) -> bool {
        self.mission.lifecycle == ObjectLifecycle::PendingDelete
    }
}

pub struct RobotWorker {
    name: String,
    config: Arc<ControllerConfig>,
    store: Arc<dyn ObjectStore>,
    publisher: Arc<dyn OutboundPublisher>,
    writer: StatusWriter,
    rx: mpsc::Receiver<RobotEvent>,

    robot: Option<RobotObject>,
    supervisor: RobotSupervisor,
    sequencer: OrderSequencer,
    /// Queued missions in arrival order; selection is deadline-first.
    queue: Vec<MissionObject>,
    active: Option<ActiveMission>,
    /// Missions this worker already finalized (or parked). Watch echoes for
    /// them carry stale status and must not restart or re-finalize them.
    finished: HashSet<String>,
    last_node_sequence_id: u64,
    /// Set after a failed cancel: hold new missions until the robot reports
    /// a State no longer tied to the canceled order.
    gate_order: Option<String>,
}

impl RobotWorker {
    /// Spawns the worker task for one robot name.
    pub fn spawn(
        name: String,
        config: Arc<ControllerConfig>,
        store: Arc<dyn ObjectStore>,
        publisher: Arc<dyn OutboundPublisher>,
        writer: StatusWriter,
    ) -> RobotHandle {
        let (tx, rx) = mpsc::channel(64);
        let heartbeat = config.heartbeat_timeout_default;
        let worker = RobotWorker {
            name,
            config,
            store,
            publisher,
            writer,
            rx,
            robot: None,
            supervisor: RobotSupervisor::new(heartbeat),
            sequencer: OrderSequencer::new(),
            queue: Vec::new(),
            active: None,
            finished: HashSet::new(),
            last_node_sequence_id: 0,
            gate_order: None,
        };
        let task = tokio::spawn(worker.run());
        RobotHandle { tx, task }
    }

    async fn run(mut self) {
        tracing::debug!("worker for robot {} started", self.name);
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = async { tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)).await },
                    if deadline.is_some() => {
                    self.handle_timers().await;
                }
            }
        }
        tracing::debug!("worker for robot {} stopped", self.name);
    }

    fn next_deadline(&self) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        let mut consider = |candidate: Option<Instant>| {
            if let Some(candidate) = candidate {
                next = Some(match next {
                    Some(current) if current <= candidate => current,
                    _ => candidate,
                });
            }
        };
        if self
            .robot
            .as_ref()
            .map(|r| r.status.online)
            .unwrap_or(false)
        {
            consider(self.supervisor.heartbeat_deadline());
        }
        if let Some(active) = &self.active {
            consider(Some(active.timeout_at));
            consider(active.deadline_at);
            consider(active.cancel_deadline);
            consider(active.resume_deadline);
        }
        next
    }

    async fn handle_event(&mut self, event: RobotEvent) {
        match event {
            RobotEvent::RobotChanged(robot) => self.on_robot_changed(*robot).await,
            RobotEvent::RobotDeleted => self.on_robot_deleted().await,
            RobotEvent::MissionChanged(mission) => self.on_mission_changed(*mission).await,
            RobotEvent::MissionDeleted(name) => self.on_mission_deleted(&name).await,
            RobotEvent::ResumeMission(mission) => self.on_resume_mission(*mission).await,
            RobotEvent::State(state) => self.on_state(*state).await,
            RobotEvent::Connection(message) => self.on_connection(message).await,
            RobotEvent::Factsheet(payload) => self.on_factsheet(payload).await,
        }
    }

    async fn handle_timers(&mut self) {
        let now = Instant::now();

        let online = self
            .robot
            .as_ref()
            .map(|r| r.status.online)
            .unwrap_or(false);
        if online {
            if let Some(deadline) = self.supervisor.heartbeat_deadline() {
                if now >= deadline {
                    self.on_heartbeat_expired().await;
                }
            }
        }

        let (cancel_deadline, resume_deadline, deadline_at, timeout_at) = match &self.active {
            Some(active) => (
                active.cancel_deadline,
                active.resume_deadline,
                active.deadline_at,
                active.timeout_at,
            ),
            None => return,
        };
        if cancel_deadline.map(|d| now >= d).unwrap_or(false) {
            tracing::warn!("[{}] cancel not acknowledged in time", self.name);
            self.finalize_canceled(Some(FailureKind::CancelFailed)).await;
            return;
        }
        if resume_deadline.map(|d| now >= d).unwrap_or(false) {
            self.fail_mission(FailureKind::LostOnRestart, "no state received after restart")
                .await;
            return;
        }
        if deadline_at.map(|d| now >= d).unwrap_or(false) {
            self.fail_mission(FailureKind::DeadlineExceeded, "mission deadline passed")
                .await;
            return;
        }
        if now >= timeout_at {
            self.fail_mission(FailureKind::Timeout, "mission timed out")
                .await;
        }
    }

    async fn on_heartbeat_expired(&mut self) {
        tracing::info!("robot {} offline (heartbeat expired)", self.name);
        if let Some(robot) = &mut self.robot {
            self.supervisor.mark_offline(&mut robot.status);
            self.writer.write_robot(&self.name, robot.status.clone(), true);
        }
        if self.active.is_some() {
            self.fail_mission(FailureKind::RobotOffline, "robot went offline mid-mission")
                .await;
        }
    }

    async fn on_robot_changed(&mut self, incoming: RobotObject) {
        let first = self.robot.is_none();
        self.supervisor
            .apply_spec(&incoming.spec, self.config.heartbeat_timeout_default);
        match &mut self.robot {
            Some(existing) => {
                // The controller owns status; take spec and lifecycle from
                // the store, keep the locally observed status.
                existing.spec = incoming.spec;
                existing.lifecycle = incoming.lifecycle;
                existing.labels = incoming.labels;
                existing.version = incoming.version;
            }
            None => self.robot = Some(incoming),
        }

        if first {
            tracing::info!("robot {} registered", self.name);
            self.try_start_mission().await;
        }
        self.maybe_delete_robot().await;
    }

    async fn on_robot_deleted(&mut self) {
        tracing::info!("robot {} deleted from store", self.name);
        self.robot = None;
        if self.active.is_some() {
            self.fail_mission(FailureKind::RobotDeleted, "robot was deleted")
                .await;
        }
        // The worker stays alive: queued missions stay PENDING until a robot
        // with this name reappears or they are deleted.
    }

    /// Deletes the robot object once it is PENDING_DELETE and not busy.
    /// Busy covers both a mission this worker is running and states other
    /// controllers own (map deployment).
    async fn maybe_delete_robot(&mut self) {
        let deletable = self
            .robot
            .as_ref()
            .map(|r| {
                r.lifecycle == ObjectLifecycle::PendingDelete
                    && self.active.is_none()
                    && !r.status.state.running()
            })
            .unwrap_or(false);
        if deletable {
            tracing::info!("robot {} is idle and pending delete, removing", self.name);
            if let Err(e) = self.store.delete_robot(&self.name).await {
                tracing::warn!("failed to delete robot {}: {e}", self.name);
            }
        }
    }

    async fn on_mission_changed(&mut self, mut incoming: MissionObject) {
        if incoming.spec.robot != self.name {
            return;
        }
        // A watch echo for a mission this worker already finalized carries
        // stale status; a cancel racing a completion must lose.
        if self.finished.contains(&incoming.name) {
            return;
        }
        incoming.normalize();

        // Refresh external signals on the currently running mission without
        // touching its in-memory status, which this worker owns.
        let is_active = self
            .active
            .as_ref()
            .map(|a| a.mission.name == incoming.name)
            .unwrap_or(false);
        if is_active {
            let updates = incoming.spec.update_nodes;
            if let Some(active) = &mut self.active {
                active.mission.lifecycle = incoming.lifecycle;
                active.mission.spec.needs_canceled = incoming.spec.needs_canceled;
            }
            if let Some(updates) = updates {
                self.apply_route_updates(updates).await;
            }
            if self
                .active
                .as_ref()
                .map(|a| a.mission.spec.needs_canceled)
                .unwrap_or(false)
            {
                self.initiate_cancel().await;
            }
            return;
        }

        if incoming.status.state.is_terminal() {
            return;
        }

        // Cancel or delete a queued mission without ever dispatching it.
        if incoming.spec.needs_canceled {
            tracing::info!("[{}] canceling queued mission {}", self.name, incoming.name);
            let mut mission = incoming;
            self.queue.retain(|m| m.name != mission.name);
            self.finished.insert(mission.name.clone());
            Self::finalize_status(&mut mission, MissionState::Canceled, None, None);
            self.writer
                .write_mission(&mission.name, mission.status.clone(), true);
            return;
        }
        if incoming.lifecycle == ObjectLifecycle::PendingDelete {
            self.queue.retain(|m| m.name != incoming.name);
            if let Err(e) = self.store.delete_mission(&incoming.name).await {
                tracing::warn!("failed to delete mission {}: {e}", incoming.name);
            }
            return;
        }

        match self.queue.iter_mut().find(|m| m.name == incoming.name) {
            Some(existing) => *existing = incoming,
            None => {
                tracing::info!("[{}] queued mission {}", self.name, incoming.name);
                self.queue.push(incoming);
            }
        }
        self.try_start_mission().await;
    }

    async fn on_mission_deleted(&mut self, name: &str) {
        self.queue.retain(|m| m.name != name);
        // Deletion frees the name for reuse by a future mission.
        self.finished.remove(name);
        let is_active = self
            .active
            .as_ref()
            .map(|a| a.mission.name == name)
            .unwrap_or(false);
        if is_active {
            tracing::warn!(
                "[{}] running mission {name} disappeared from store, stopping it",
                self.name
            );
            self.gate_order = self
                .sequencer
                .in_flight()
                .map(|f| f.order.order_id.clone());
            let actions = self.sequencer.request_cancel();
            if let Err(e) = self.publisher.publish_instant_actions(&self.name, actions).await {
                tracing::warn!("[{}] cancel publish failed: {e}", self.name);
            }
            self.active = None;
            self.sequencer.clear();
            self.update_robot_after_mission().await;
        }
    }

    async fn on_resume_mission(&mut self, mut mission: MissionObject) {
        if mission.spec.robot != self.name || self.active.is_some() {
            return;
        }
        mission.normalize();
        tracing::info!("[{}] resuming mission {} after restart", self.name, mission.name);
        let tree = match MissionTree::build(&mission) {
            Ok(tree) => tree,
            Err(e) => {
                let mut mission = mission;
                self.finished.insert(mission.name.clone());
                Self::finalize_status(
                    &mut mission,
                    MissionState::Failed,
                    Some(FailureKind::LostOnRestart),
                    Some(&e.to_string()),
                );
                self.writer
                    .write_mission(&mission.name, mission.status.clone(), true);
                return;
            }
        };
        let Some(current) = mission.status.current_node.clone() else {
            self.queue.push(mission);
            self.try_start_mission().await;
            return;
        };
        let Some(node_index) = mission.node_index(&current) else {
            let mut mission = mission;
            self.finished.insert(mission.name.clone());
            Self::finalize_status(
                &mut mission,
                MissionState::Failed,
                Some(FailureKind::LostOnRestart),
                Some("current node no longer exists"),
            );
            self.writer
                .write_mission(&mission.name, mission.status.clone(), true);
            return;
        };

        let now = Instant::now();
        let elapsed = mission
            .status
            .start_ts
            .map(|start| (Utc::now() - start).to_std().unwrap_or_default())
            .unwrap_or_default();
        let total = Duration::from_secs(mission.spec.timeout_s);
        let timeout_at = now + total.saturating_sub(elapsed);
        let expected_order = crate::vda5050::Order::order_id_for(&mission.name, node_index);
        self.active = Some(ActiveMission {
            deadline_at: deadline_instant(&mission),
            mission,
            tree,
            timeout_at,
            cancel_deadline: None,
            resume: Some(ResumeInfo {
                expected_order,
                node_index,
            }),
            resume_deadline: Some(now + self.config.resume_timeout),
        });
    }

    async fn on_connection(&mut self, message: ConnectionMessage) {
        let Some(robot) = &mut self.robot else { return };
        if self.supervisor.observe_connection(&mut robot.status, &message) {
            self.writer.write_robot(&self.name, robot.status.clone(), true);
            if robot.status.online {
                self.try_start_mission().await;
            }
            // Going offline alone does not abort the mission; the heartbeat
            // timer decides that.
        }
    }

    async fn on_factsheet(&mut self, payload: serde_json::Value) {
        let Some(robot) = &mut self.robot else { return };
        if RobotSupervisor::observe_factsheet(&mut robot.status, &payload) {
            self.writer
                .write_robot(&self.name, robot.status.clone(), false);
        }
    }

    async fn on_state(&mut self, state: State) {
        self.last_node_sequence_id = state.last_node_sequence_id;

        if let Some(robot) = &mut self.robot {
            let was_online = robot.status.online;
            let mission_running = self.active.is_some();
            let changed =
                self.supervisor
                    .observe_state(&mut robot.status, &state, mission_running);
            if changed {
                let online_flip = robot.status.online != was_online;
                self.writer
                    .write_robot(&self.name, robot.status.clone(), online_flip);
            }
        }

        // A clean State (no longer reporting the canceled order) lifts the
        // post-cancel gate.
        if let Some(gated) = &self.gate_order {
            if state.order_id != *gated {
                self.gate_order = None;
            }
        }

        let resume_pending = self
            .active
            .as_ref()
            .and_then(|a| a.resume.as_ref().map(|r| (r.expected_order.clone(), r.node_index)));
        if let Some((expected_order, node_index)) = resume_pending {
            if state.order_id != expected_order {
                // Still waiting for the robot to talk about our order.
                return;
            }
            if let Some(active) = &mut self.active {
                match &active.mission.spec.mission_tree[node_index].kind {
                    MissionNodeKind::Route(route) => self.sequencer.attach_route(
                        &active.mission.name,
                        node_index,
                        route.size(),
                        &state,
                    ),
                    _ => self
                        .sequencer
                        .attach_action(&active.mission.name, node_index, &state),
                }
                active.resume = None;
                active.resume_deadline = None;
            }
            tracing::info!(
                "[{}] re-attached to order {} after restart",
                self.name,
                state.order_id
            );
        }

        if self.sequencer.cancel_pending() {
            match self.sequencer.observe_cancel(&state) {
                CancelAck::Finished => {
                    self.finalize_canceled(None).await;
                }
                CancelAck::Failed => {
                    self.finalize_canceled(Some(FailureKind::CancelFailed)).await;
                }
                CancelAck::Pending => {}
            }
            return;
        }

        match self.sequencer.observe(&state) {
            Some(LeafProgress::Succeeded) => {
                if let Some(in_flight) = self.sequencer.in_flight() {
                    let node_index = in_flight.node_index;
                    if let Some(active) = &mut self.active {
                        active.tree.resolve_leaf(node_index, true);
                    }
                }
                self.sequencer.clear();
                self.advance().await;
            }
            Some(LeafProgress::Failed {
                kind,
                message,
                node_errors,
            }) => {
                if let Some(in_flight) = self.sequencer.in_flight() {
                    let node_index = in_flight.node_index;
                    if let Some(active) = &mut self.active {
                        for (index, description) in &node_errors {
                            let name = active.tree.node_name(*index).to_string();
                            if let Some(entry) = active.mission.status.node_status.get_mut(&name)
                            {
                                entry.message = Some(description.clone());
                            }
                        }
                        let leaf_name = active.tree.node_name(node_index).to_string();
                        if let Some(entry) =
                            active.mission.status.node_status.get_mut(&leaf_name)
                        {
                            entry.error = Some(kind);
                            if entry.message.is_none() && !message.is_empty() {
                                entry.message = Some(message.clone());
                            }
                        }
                        active.tree.resolve_leaf(node_index, false);
                        active.mission.status.failure_reason = Some(if message.is_empty() {
                            kind.as_str().to_string()
                        } else {
                            message
                        });
                    }
                    self.sequencer.clear();
                    self.advance().await;
                }
            }
            Some(LeafProgress::Pending) => {}
            None => {
                // The robot is executing (or acking) some other order. If we
                // have one in flight, repeat it; duplicates are idempotent.
                if let Some(in_flight) = self.sequencer.in_flight() {
                    let mission = in_flight.mission.clone();
                    let order = in_flight.order.clone();
                    tracing::debug!(
                        "[{}] state reports order {}, expected {}; re-publishing",
                        self.name,
                        state.order_id,
                        order.order_id
                    );
                    self.publish_order(&mission, order).await;
                }
            }
        }

        if self.active.is_none() {
            self.try_start_mission().await;
        }
    }

    /// Applies `update_nodes` to the running mission: replaces waypoints of
    /// unfinished route nodes and stitches an order update when the node is
    /// currently in flight.
    async fn apply_route_updates(
        &mut self,
        updates: std::collections::BTreeMap<String, RouteNode>,
    ) {
        for (node_name, route) in updates {
            let Some(active) = &mut self.active else { return };
            let Some(node_index) = active.mission.node_index(&node_name) else {
                tracing::warn!(
                    "[{}] update for unknown node {node_name} rejected",
                    self.name
                );
                continue;
            };
            if route.waypoints.is_empty() {
                tracing::warn!("[{}] empty update for node {node_name} rejected", self.name);
                continue;
            }
            let finished = active
                .mission
                .status
                .node_status
                .get(&node_name)
                .map(|s| s.state.is_terminal())
                .unwrap_or(false);
            if finished {
                tracing::warn!(
                    "[{}] update for completed node {node_name} rejected",
                    self.name
                );
                continue;
            }
            match &mut active.mission.spec.mission_tree[node_index].kind {
                MissionNodeKind::Route(existing) => {
                    let in_flight = self
                        .sequencer
                        .in_flight()
                        .map(|f| f.node_index == node_index)
                        .unwrap_or(false);
                    existing.waypoints = route.waypoints.clone();
                    if in_flight {
                        match self.sequencer.apply_route_update(
                            &node_name,
                            &route.waypoints,
                            self.last_node_sequence_id,
                        ) {
                            Ok(order) => {
                                let mission = active.mission.name.clone();
                                self.publish_order(&mission, order).await;
                            }
                            Err(e) => {
                                tracing::warn!(
                                    "[{}] update for node {node_name} rejected: {e}",
                                    self.name
                                );
                            }
                        }
                    }
                }
                _ => {
                    tracing::warn!(
                        "[{}] update for non-route node {node_name} rejected",
                        self.name
                    );
                }
            }
        }
        if let Some(active) = &mut self.active {
            active.mission.spec.update_nodes = None;
        }
    }

    /// Publishes the cancelOrder instant action and arms the ack timer.
    async fn initiate_cancel(&mut self) {
        let Some(active) = &mut self.active else { return };
        if active.cancel_deadline.is_some() {
            return;
        }
        tracing::info!("[{}] canceling mission {}", self.name, active.mission.name);
        if self.sequencer.in_flight().is_none() {
            // Nothing dispatched yet; cancel synchronously.
            self.finalize_canceled(None).await;
            return;
        }
        active.cancel_deadline = Some(Instant::now() + self.config.cancel_timeout);
        let actions = self.sequencer.request_cancel();
        if let Err(e) = self
            .publisher
            .publish_instant_actions(&self.name, actions)
            .await
        {
            tracing::warn!("[{}] cancel publish failed: {e}", self.name);
        }
    }

    /// Picks and starts the next eligible mission, looping past missions
    /// that finalize without dispatch (expired deadline, pre-canceled,
    /// invalid trees).
    fn try_start_mission<'a>(
        &'a mut self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
        loop {
            if self.active.is_some() || self.gate_order.is_some() {
                return;
            }
            let ready = self
                .robot
                .as_ref()
                .map(|r| r.lifecycle != ObjectLifecycle::PendingDelete && r.status.online)
                .unwrap_or(false);
            if !ready || !self.supervisor.is_online() {
                return;
            }

            // Earliest deadline first, nulls last, ties by arrival order.
            let Some(selected) = self
                .queue
                .iter()
                .enumerate()
                .min_by_key(|(index, m)| {
                    (
                        m.spec.deadline.unwrap_or(chrono::DateTime::<Utc>::MAX_UTC),
                        *index,
                    )
                })
                .map(|(index, _)| index)
            else {
                return;
            };
            let mut mission = self.queue.remove(selected);

            if mission.spec.needs_canceled {
                self.finished.insert(mission.name.clone());
                Self::finalize_status(&mut mission, MissionState::Canceled, None, None);
                self.writer
                    .write_mission(&mission.name, mission.status.clone(), true);
                continue;
            }
            if let Some(deadline) = mission.spec.deadline {
                if deadline <= Utc::now() {
                    tracing::info!(
                        "[{}] mission {} failed before start: deadline passed",
                        self.name,
                        mission.name
                    );
                    self.finished.insert(mission.name.clone());
                    Self::finalize_status(
                        &mut mission,
                        MissionState::Failed,
                        Some(FailureKind::DeadlineExceeded),
                        Some("deadline passed before dispatch"),
                    );
                    self.writer
                        .write_mission(&mission.name, mission.status.clone(), true);
                    continue;
                }
            }

            let tree = match MissionTree::build(&mission) {
                Ok(tree) => tree,
                Err(e) => {
                    tracing::warn!(
                        "[{}] mission {} has an invalid tree: {e}",
                        self.name,
                        mission.name
                    );
                    // Invalid missions never leave PENDING; they are parked
                    // with the validation error and dropped from the queue.
                    self.finished.insert(mission.name.clone());
                    mission.status.failure_reason = Some(e.to_string());
                    if let Some(root) = mission
                        .status
                        .node_status
                        .get_mut(crate::objects::ROOT_NODE)
                    {
                        root.error = Some(FailureKind::ValidationError);
                        root.message = Some(e.to_string());
                    }
                    self.writer
                        .write_mission(&mission.name, mission.status.clone(), true);
                    continue;
                }
            };

            tracing::info!("[{}] starting mission {}", self.name, mission.name);
            let now = Instant::now();
            mission.status.state = MissionState::Running;
            mission.status.start_ts = Some(Utc::now());
            if let Some(root) = mission.status.node_status.get_mut(crate::objects::ROOT_NODE) {
                root.state = MissionState::Running;
            }
            self.writer
                .write_mission(&mission.name, mission.status.clone(), true);

            self.active = Some(ActiveMission {
                timeout_at: now + Duration::from_secs(mission.spec.timeout_s),
                deadline_at: deadline_instant(&mission),
                mission,
                tree,
                cancel_deadline: None,
                resume: None,
                resume_deadline: None,
            });
            if let Some(robot) = &mut self.robot {
                robot.status.state = self
                    .supervisor
                    .aggregate_state(true, robot.status.battery_level);
                robot.status.last_mission =
                    self.active.as_ref().map(|a| a.mission.name.clone());
                self.writer.write_robot(&self.name, robot.status.clone(), true);
            }
            self.advance().await;
            return;
        }
        })
    }

    /// Ticks the tree and dispatches the next leaf, or finalizes the
    /// mission when the root finished.
    async fn advance(&mut self) {
        loop {
            let Some(active) = &mut self.active else { return };
            match active.tree.tick() {
                Tick::Done(TreeState::Success) => {
                    self.complete_mission().await;
                    return;
                }
                Tick::Done(_) => {
                    let (kind, message) = self
                        .active
                        .as_ref()
                        .and_then(|a| {
                            a.mission
                                .status
                                .failure_reason
                                .clone()
                                .map(|m| (FailureKind::NodeFailed, m))
                        })
                        .unwrap_or((FailureKind::NodeFailed, "a mission node failed".to_string()));
                    self.fail_mission(kind, &message).await;
                    return;
                }
                Tick::Active {
                    node_index,
                    newly_started,
                } => {
                    if !newly_started {
                        // The leaf is already on the robot; sync progress.
                        self.sync_active_status(false);
                        return;
                    }
                    let dispatched = self.dispatch_leaf(node_index).await;
                    if dispatched {
                        self.sync_active_status(false);
                        return;
                    }
                    // Dispatch failure resolved the leaf; tick again.
                }
            }
        }
    }

    /// Publishes the order for a newly started leaf. Returns false when the
    /// leaf resolved immediately (dispatch failure).
    async fn dispatch_leaf(&mut self, node_index: usize) -> bool {
        let Some(active) = &mut self.active else { return true };
        let mission_name = active.mission.name.clone();
        let robot_pose = self
            .robot
            .as_ref()
            .map(|r| r.status.pose.clone())
            .unwrap_or_default();
        let node = &active.mission.spec.mission_tree[node_index];
        let node_name = active.tree.node_name(node_index).to_string();

        let order = match &node.kind {
            MissionNodeKind::Route(route) => self.sequencer.start_route(
                &mission_name,
                node_index,
                &route.waypoints,
                &robot_pose,
                self.last_node_sequence_id,
            ),
            MissionNodeKind::Action(action) => self.sequencer.start_action(
                &mission_name,
                node_index,
                action,
                &robot_pose,
                self.last_node_sequence_id,
            ),
            // Control and constant nodes never reach dispatch.
            _ => return true,
        };
        tracing::info!(
            "[{}] [{}] dispatching node {} as order {} update {}",
            self.name,
            mission_name,
            node_name,
            order.order_id,
            order.order_update_id
        );
        self.publish_order(&mission_name, order).await
    }

    /// Publishes one order, handling backpressure drops. Returns false when
    /// the publish failed the current mission.
    async fn publish_order(&mut self, mission_name: &str, order: crate::vda5050::Order) -> bool {
        match self
            .publisher
            .publish_order(&self.name, mission_name, order)
            .await
        {
            Ok(outcome) => {
                if let Some(dropped) = outcome.dropped_mission {
                    if dropped == mission_name
                        || self
                            .active
                            .as_ref()
                            .map(|a| a.mission.name == dropped)
                            .unwrap_or(false)
                    {
                        self.fail_mission(
                            FailureKind::TransportBackpressure,
                            "outbound queue overflowed",
                        )
                        .await;
                        return false;
                    }
                }
                true
            }
            Err(TransportError::QueueFull { .. }) => {
                self.fail_mission(
                    FailureKind::TransportBackpressure,
                    "outbound queue overflowed",
                )
                .await;
                false
            }
            Err(e) => {
                tracing::warn!("[{}] order publish failed: {e}", self.name);
                // The transport queues across reconnects; other errors are
                // transient and the order will be repeated on the next
                // mismatched State.
                true
            }
        }
    }

    /// Writes the running mission's node status snapshot.
    fn sync_active_status(&mut self, transition: bool) {
        if let Some(active) = &mut self.active {
            active.tree.sync_status(&mut active.mission.status);
            self.writer
                .write_mission(&active.mission.name, active.mission.status.clone(), transition);
        }
    }

    async fn complete_mission(&mut self) {
        let Some(mut active) = self.active.take() else { return };
        active.tree.sync_status(&mut active.mission.status);
        Self::finalize_status(&mut active.mission, MissionState::Completed, None, None);
        tracing::info!("[{}] mission {} completed", self.name, active.mission.name);
        self.writer
            .write_mission(&active.mission.name, active.mission.status.clone(), true);
        self.after_mission(active).await;
    }

    async fn fail_mission(&mut self, kind: FailureKind, message: &str) {
        let Some(mut active) = self.active.take() else { return };
        active.tree.sync_status(&mut active.mission.status);
        // The current leaf carries the failure unless it already has one.
        if let Some(current) = active.mission.status.current_node.clone() {
            if let Some(entry) = active.mission.status.node_status.get_mut(&current) {
                if entry.error.is_none() {
                    entry.error = Some(kind);
                    entry.message = Some(message.to_string());
                }
                if !entry.state.is_terminal() {
                    entry.state = MissionState::Failed;
                }
            }
        }
        Self::finalize_status(
            &mut active.mission,
            MissionState::Failed,
            Some(kind),
            Some(message),
        );
        tracing::info!(
            "[{}] mission {} failed: {}",
            self.name,
            active.mission.name,
            message
        );
        self.writer
            .write_mission(&active.mission.name, active.mission.status.clone(), true);
        self.after_mission(active).await;
    }

    async fn finalize_canceled(&mut self, error: Option<FailureKind>) {
        let Some(mut active) = self.active.take() else { return };
        active.tree.sync_status(&mut active.mission.status);
        Self::finalize_status(
            &mut active.mission,
            MissionState::Canceled,
            error,
            error.map(|e| e.as_str()),
        );
        tracing::info!("[{}] mission {} canceled", self.name, active.mission.name);
        if error == Some(FailureKind::CancelFailed) {
            // Gate the next mission until the robot reports a clean State.
            self.gate_order = self
                .sequencer
                .in_flight()
                .map(|f| f.order.order_id.clone());
        }
        self.writer
            .write_mission(&active.mission.name, active.mission.status.clone(), true);
        self.after_mission(active).await;
    }

    /// Common tail of every terminal transition.
    async fn after_mission(&mut self, active: ActiveMission) {
        self.finished.insert(active.mission.name.clone());
        self.sequencer.clear();
        if active.pending_delete() {
            if let Err(e) = self.store.delete_mission(&active.mission.name).await {
                tracing::warn!("failed to delete mission {}: {e}", active.mission.name);
            }
        }
        self.update_robot_after_mission().await;
        self.maybe_delete_robot().await;
        self.try_start_mission().await;
    }

    async fn update_robot_after_mission(&mut self) {
        if let Some(robot) = &mut self.robot {
            robot.status.state = self
                .supervisor
                .aggregate_state(false, robot.status.battery_level);
            self.writer.write_robot(&self.name, robot.status.clone(), true);
        }
    }

    /// Applies a terminal (or parked) state to a mission status snapshot.
    fn finalize_status(
        mission: &mut MissionObject,
        state: MissionState,
        error: Option<FailureKind>,
        message: Option<&str>,
    ) {
        mission.status.state = state;
        mission.status.end_ts = Some(Utc::now());
        mission.status.current_node = None;
        if let Some(root) = mission.status.node_status.get_mut(crate::objects::ROOT_NODE) {
            root.state = state;
            if let Some(error) = error {
                root.error = Some(error);
            }
        }
        if let Some(message) = message {
            if mission.status.failure_reason.is_none() {
                mission.status.failure_reason = Some(message.to_string());
            }
        }
    }
}

fn deadline_instant(mission: &MissionObject) -> Option<Instant> {
    mission.spec.deadline.map(|deadline| {
        let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();
        Instant::now() + remaining
    })
}
