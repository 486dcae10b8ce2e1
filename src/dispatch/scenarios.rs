//! End-to-end scenarios: a worker driven through the in-memory store and a
//! recording publisher standing in for the broker.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::ControllerConfig;
use crate::dispatch::reconciler::StatusWriter;
use crate::dispatch::testutil::{
    action_result, order_progress, telemetry, RecordingPublisher,
};
use crate::dispatch::worker::{RobotEvent, RobotHandle, RobotWorker};
use crate::objects::mission::{
    FailureKind, MissionNode, MissionObject, MissionState, RouteNode,
};
use crate::objects::robot::RobotObject;
use crate::objects::{ObjectLifecycle, Pose2D, ROOT_NODE};
use crate::store::MemoryStore;
use crate::vda5050::ActionStatus;

const ROBOT: &str = "carter01";

struct Harness {
    store: Arc<MemoryStore>,
    publisher: Arc<RecordingPublisher>,
    handle: RobotHandle,
}

impl Harness {
    async fn spawn() -> Harness {
        Self::spawn_with(ControllerConfig::default()).await
    }

    async fn spawn_with(config: ControllerConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let publisher = RecordingPublisher::new();
        let writer = StatusWriter::spawn(store.clone());
        let handle = RobotWorker::spawn(
            ROBOT.to_string(),
            Arc::new(config),
            store.clone(),
            publisher.clone(),
            writer,
        );
        Harness {
            store,
            publisher,
            handle,
        }
    }

    async fn add_robot(&self, heartbeat_timeout_s: u64) {
        let mut robot = RobotObject::new(ROBOT);
        robot.spec.heartbeat_timeout_s = heartbeat_timeout_s;
        self.store.put_robot(robot.clone()).await;
        self.handle
            .send(RobotEvent::RobotChanged(Box::new(robot)))
            .await;
    }

    /// First telemetry brings the robot online at pose (0, 0).
    async fn bring_online(&self) {
        self.handle
            .send(RobotEvent::State(Box::new(telemetry(ROBOT, 0.0, 0.0, 80.0))))
            .await;
        self.settle().await;
    }

    async fn add_mission(&self, mission: MissionObject) {
        self.store.put_mission(mission).await;
    }

    /// Forwards the store's current view of a mission, as the watch would.
    async fn notify_mission(&self, name: &str) {
        if let Some(mission) = self.store.mission(name).await {
            self.handle
                .send(RobotEvent::MissionChanged(Box::new(mission)))
                .await;
        }
        self.settle().await;
    }

    async fn send_state(&self, state: crate::vda5050::State) {
        self.handle.send(RobotEvent::State(Box::new(state))).await;
        self.settle().await;
    }

    /// Lets the worker and the status writer drain.
    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    async fn mission_state(&self, name: &str) -> MissionState {
        self.store.mission(name).await.map(|m| m.status.state).unwrap_or(MissionState::Pending)
    }
}

fn route_mission(name: &str, waypoints: Vec<Pose2D>) -> MissionObject {
    MissionObject::new(name, ROBOT, vec![MissionNode::route("go", ROOT_NODE, waypoints)])
}

fn two_waypoints() -> Vec<Pose2D> {
    vec![
        Pose2D::new(1.5, 1.5, 0.0, "map"),
        Pose2D::new(3.3, 2.1, 0.0, "map"),
    ]
}

#[tokio::test(start_paused = true)]
async fn s1_simple_route_completes() {
    let harness = Harness::spawn().await;
    harness.add_robot(30).await;
    harness.bring_online().await;

    harness.add_mission(route_mission("m1", two_waypoints())).await;
    harness.notify_mission("m1").await;

    // One order: current pose plus both waypoints, all waypoints released.
    let orders = harness.publisher.orders().await;
    assert_eq!(orders.len(), 1);
    let order = &orders[0].1;
    assert_eq!(order.order_update_id, 0);
    assert_eq!(order.nodes.len(), 3);
    assert_eq!(order.edges.len(), 2);
    assert!(!order.nodes[0].released);
    assert!(order.nodes[1].released && order.nodes[2].released);
    assert_eq!(harness.mission_state("m1").await, MissionState::Running);

    // The robot reaches the final waypoint.
    harness
        .send_state(order_progress(ROBOT, order, order.final_sequence_id()))
        .await;

    assert_eq!(harness.mission_state("m1").await, MissionState::Completed);
    let stored = harness.store.mission("m1").await.unwrap();
    assert_eq!(stored.status.node_status["go"].state, MissionState::Completed);
    assert_eq!(stored.status.node_status[ROOT_NODE].state, MissionState::Completed);
    assert!(stored.status.start_ts.is_some() && stored.status.end_ts.is_some());

    let robot = harness.store.robot(ROBOT).await.unwrap();
    assert_eq!(robot.status.last_mission.as_deref(), Some("m1"));
}

#[tokio::test(start_paused = true)]
async fn s2_action_failure_fails_mission() {
    let harness = Harness::spawn().await;
    harness.add_robot(30).await;
    harness.bring_online().await;

    let mission = MissionObject::new(
        "m2",
        ROBOT,
        vec![MissionNode::action(
            "pick",
            ROOT_NODE,
            "dummy_action",
            serde_json::json!({"should_fail": 1, "time": 1}),
        )],
    );
    harness.add_mission(mission).await;
    harness.notify_mission("m2").await;

    let order = harness.publisher.last_order().await.unwrap();
    let action_id = order.nodes[0].actions[0].action_id.clone();
    harness
        .send_state(action_result(ROBOT, &order, &action_id, ActionStatus::Failed))
        .await;

    assert_eq!(harness.mission_state("m2").await, MissionState::Failed);
    let stored = harness.store.mission("m2").await.unwrap();
    assert_eq!(
        stored.status.node_status["pick"].error,
        Some(FailureKind::ActionFailed)
    );
}

#[tokio::test(start_paused = true)]
async fn s3_selector_fallback_skips_recovery_branch() {
    let harness = Harness::spawn().await;
    harness.add_robot(30).await;
    harness.bring_online().await;

    let mission = MissionObject::new(
        "m3",
        ROBOT,
        vec![
            MissionNode::selector("route_fallback", ROOT_NODE),
            MissionNode::route("goto_dropoff", "route_fallback", two_waypoints()),
            MissionNode::sequence("goto_dropoff_seq", "route_fallback"),
            MissionNode::route("retry-leg", "goto_dropoff_seq", two_waypoints()),
            MissionNode::action(
                "dropoff_book_at_goal",
                ROOT_NODE,
                "dummy_action",
                serde_json::json!({"should_fail": 1, "time": 1}),
            ),
        ],
    );
    harness.add_mission(mission).await;
    harness.notify_mission("m3").await;

    // goto_dropoff succeeds.
    let order = harness.publisher.last_order().await.unwrap();
    harness
        .send_state(order_progress(ROBOT, &order, order.final_sequence_id()))
        .await;

    // dropoff_book_at_goal fails.
    let order = harness.publisher.last_order().await.unwrap();
    let action_id = order.nodes[0].actions[0].action_id.clone();
    harness
        .send_state(action_result(ROBOT, &order, &action_id, ActionStatus::Failed))
        .await;

    let stored = harness.store.mission("m3").await.unwrap();
    assert_eq!(stored.status.state, MissionState::Failed);
    assert_eq!(
        stored.status.node_status["route_fallback"].state,
        MissionState::Completed
    );
    // The recovery branch was never dispatched.
    assert_eq!(stored.status.node_status["retry-leg"].state, MissionState::Pending);
    let orders = harness.publisher.orders().await;
    assert!(orders
        .iter()
        .all(|(_, o)| !o.order_id.contains(&format!("-n{}", 3))));
}

#[tokio::test(start_paused = true)]
async fn s4_cancel_during_route() {
    let harness = Harness::spawn().await;
    harness.add_robot(30).await;
    harness.bring_online().await;

    let ten: Vec<Pose2D> = (0..10)
        .map(|i| Pose2D::new(i as f64, 0.0, 0.0, "map"))
        .collect();
    harness.add_mission(route_mission("m4", ten)).await;
    harness.notify_mission("m4").await;

    let order = harness.publisher.last_order().await.unwrap();
    // Robot reaches waypoint 3.
    harness.send_state(order_progress(ROBOT, &order, 6)).await;
    assert_eq!(harness.mission_state("m4").await, MissionState::Running);

    // The client cancels; the controller sends cancelOrder.
    harness.store.request_cancel("m4").await;
    harness.notify_mission("m4").await;
    let cancel = harness.publisher.last_instant_actions().await.unwrap();
    assert_eq!(cancel.actions[0].action_type, "cancelOrder");
    assert_eq!(harness.publisher.instant_actions().await.len(), 1);

    // Robot acks the cancel.
    let orders_before = harness.publisher.order_count().await;
    harness
        .send_state(action_result(
            ROBOT,
            &order,
            &cancel.actions[0].action_id,
            ActionStatus::Finished,
        ))
        .await;

    assert_eq!(harness.mission_state("m4").await, MissionState::Canceled);
    assert_eq!(harness.publisher.order_count().await, orders_before);
}

#[tokio::test(start_paused = true)]
async fn s5_offline_mid_mission() {
    let harness = Harness::spawn().await;
    harness.add_robot(1).await;
    harness.bring_online().await;

    harness.add_mission(route_mission("m5", two_waypoints())).await;
    harness.notify_mission("m5").await;
    assert_eq!(harness.mission_state("m5").await, MissionState::Running);

    // Silence past the heartbeat timeout.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(harness.mission_state("m5").await, MissionState::Failed);
    let stored = harness.store.mission("m5").await.unwrap();
    assert_eq!(
        stored.status.node_status[ROOT_NODE].error,
        Some(FailureKind::RobotOffline)
    );
    assert!(!harness.store.robot(ROBOT).await.unwrap().status.online);

    // The next mission stays PENDING while the robot is offline.
    harness.add_mission(route_mission("m5b", two_waypoints())).await;
    harness.notify_mission("m5b").await;
    assert_eq!(harness.mission_state("m5b").await, MissionState::Pending);

    // Telemetry returns; the queued mission starts.
    harness.bring_online().await;
    assert_eq!(harness.mission_state("m5b").await, MissionState::Running);
}

#[tokio::test(start_paused = true)]
async fn s6_restart_resume_continues() {
    let harness = Harness::spawn().await;

    // A mission left RUNNING by the previous controller instance.
    let mut mission = route_mission("m6", two_waypoints());
    mission.status.state = MissionState::Running;
    mission.status.start_ts = Some(Utc::now());
    mission.status.current_node = Some("go".to_string());
    mission.status.node_status.get_mut(ROOT_NODE).unwrap().state = MissionState::Running;
    mission.status.node_status.get_mut("go").unwrap().state = MissionState::Running;
    harness.store.put_mission(mission.clone()).await;

    harness.add_robot(30).await;
    harness
        .handle
        .send(RobotEvent::ResumeMission(Box::new(
            harness.store.mission("m6").await.unwrap(),
        )))
        .await;
    harness.settle().await;

    // State for the expected order re-attaches execution.
    let mut state = telemetry(ROBOT, 1.5, 1.5, 80.0);
    state.order_id = "m6-n0".to_string();
    state.last_node_sequence_id = 2;
    state.node_states = vec![
        crate::vda5050::NodeState {
            node_id: "m6-n0-s2".to_string(),
            sequence_id: 2,
            released: true,
            node_position: None,
        },
        crate::vda5050::NodeState {
            node_id: "m6-n0-s4".to_string(),
            sequence_id: 4,
            released: true,
            node_position: None,
        },
    ];
    harness.send_state(state.clone()).await;
    assert_eq!(harness.mission_state("m6").await, MissionState::Running);

    // Progress to the final waypoint completes the mission.
    state.last_node_sequence_id = 4;
    harness.send_state(state).await;
    assert_eq!(harness.mission_state("m6").await, MissionState::Completed);
}

#[tokio::test(start_paused = true)]
async fn s6_restart_without_state_fails_lost_on_restart() {
    let config = ControllerConfig {
        resume_timeout: Duration::from_secs(5),
        ..ControllerConfig::default()
    };
    let harness = Harness::spawn_with(config).await;

    let mut mission = route_mission("m6b", two_waypoints());
    mission.status.state = MissionState::Running;
    mission.status.start_ts = Some(Utc::now());
    mission.status.current_node = Some("go".to_string());
    mission.status.node_status.get_mut("go").unwrap().state = MissionState::Running;
    harness.store.put_mission(mission.clone()).await;

    harness.add_robot(30).await;
    harness
        .handle
        .send(RobotEvent::ResumeMission(Box::new(
            harness.store.mission("m6b").await.unwrap(),
        )))
        .await;
    harness.settle().await;

    tokio::time::sleep(Duration::from_secs(6)).await;
    harness.settle().await;

    let stored = harness.store.mission("m6b").await.unwrap();
    assert_eq!(stored.status.state, MissionState::Failed);
    assert_eq!(
        stored.status.node_status[ROOT_NODE].error,
        Some(FailureKind::LostOnRestart)
    );
}

#[tokio::test(start_paused = true)]
async fn precanceled_mission_never_publishes() {
    let harness = Harness::spawn().await;
    harness.add_robot(30).await;
    harness.bring_online().await;

    let mut mission = route_mission("m7", two_waypoints());
    mission.spec.needs_canceled = true;
    harness.add_mission(mission).await;
    harness.notify_mission("m7").await;

    assert_eq!(harness.mission_state("m7").await, MissionState::Canceled);
    assert_eq!(harness.publisher.order_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn expired_deadline_fails_without_publish() {
    let harness = Harness::spawn().await;
    harness.add_robot(30).await;
    harness.bring_online().await;

    let mut mission = route_mission("m8", two_waypoints());
    mission.spec.deadline = Some(Utc::now());
    harness.add_mission(mission).await;
    harness.notify_mission("m8").await;

    let stored = harness.store.mission("m8").await.unwrap();
    assert_eq!(stored.status.state, MissionState::Failed);
    assert_eq!(
        stored.status.node_status[ROOT_NODE].error,
        Some(FailureKind::DeadlineExceeded)
    );
    assert_eq!(harness.publisher.order_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn deadline_ordering_prefers_earliest() {
    let harness = Harness::spawn().await;
    harness.add_robot(30).await;

    let mut later = route_mission("later", two_waypoints());
    later.spec.deadline = Some(Utc::now() + chrono::Duration::hours(2));
    let mut sooner = route_mission("sooner", two_waypoints());
    sooner.spec.deadline = Some(Utc::now() + chrono::Duration::hours(1));
    let unbounded = route_mission("unbounded", two_waypoints());

    // Queue them all before the robot comes online.
    for mission in [unbounded, later, sooner] {
        let name = mission.name.clone();
        harness.add_mission(mission).await;
        harness.notify_mission(&name).await;
    }
    harness.bring_online().await;

    // The earliest deadline wins; deadline-free missions go last.
    assert_eq!(harness.mission_state("sooner").await, MissionState::Running);
    assert_eq!(harness.mission_state("later").await, MissionState::Pending);
    assert_eq!(harness.mission_state("unbounded").await, MissionState::Pending);
}

#[tokio::test(start_paused = true)]
async fn mission_for_unknown_robot_stays_pending() {
    let harness = Harness::spawn().await;
    // No robot object: the mission waits indefinitely.
    harness.add_mission(route_mission("m9", two_waypoints())).await;
    harness.notify_mission("m9").await;

    assert_eq!(harness.mission_state("m9").await, MissionState::Pending);
    assert_eq!(harness.publisher.order_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn invalid_tree_stays_pending_with_validation_error() {
    let harness = Harness::spawn().await;
    harness.add_robot(30).await;
    harness.bring_online().await;

    let mission = MissionObject::new(
        "bad",
        ROBOT,
        vec![MissionNode::route("go", "missing-parent", two_waypoints())],
    );
    harness.add_mission(mission).await;
    harness.notify_mission("bad").await;

    let stored = harness.store.mission("bad").await.unwrap();
    assert_eq!(stored.status.state, MissionState::Pending);
    assert_eq!(
        stored.status.node_status[ROOT_NODE].error,
        Some(FailureKind::ValidationError)
    );
    assert_eq!(harness.publisher.order_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn route_update_reissues_order_with_incremented_update_id() {
    let harness = Harness::spawn().await;
    harness.add_robot(30).await;
    harness.bring_online().await;

    let ten: Vec<Pose2D> = (0..10)
        .map(|i| Pose2D::new(i as f64, 0.0, 0.0, "map"))
        .collect();
    harness.add_mission(route_mission("m10", ten.clone())).await;
    harness.notify_mission("m10").await;

    let order = harness.publisher.last_order().await.unwrap();
    harness.send_state(order_progress(ROBOT, &order, 6)).await;

    // Replace the tail beyond the visited prefix.
    let mut replacement = ten.clone();
    for pose in replacement.iter_mut().skip(3) {
        pose.y = 5.0;
    }
    let mut updates = BTreeMap::new();
    updates.insert("go".to_string(), RouteNode { waypoints: replacement });
    harness.store.request_update("m10", updates).await;
    harness.notify_mission("m10").await;

    let updated = harness.publisher.last_order().await.unwrap();
    assert_eq!(updated.order_id, order.order_id);
    assert_eq!(updated.order_update_id, order.order_update_id + 1);
    assert_eq!(updated.nodes[4].node_position.as_ref().unwrap().y, 5.0);

    // orderUpdateId stays strictly increasing per orderId.
    let orders = harness.publisher.orders().await;
    let mut seen: Option<u32> = None;
    for (_, o) in orders.iter().filter(|(_, o)| o.order_id == order.order_id) {
        if let Some(prev) = seen {
            assert!(o.order_update_id > prev);
        }
        seen = Some(o.order_update_id);
    }
}

#[tokio::test(start_paused = true)]
async fn update_on_completed_node_is_rejected_and_mission_continues() {
    let harness = Harness::spawn().await;
    harness.add_robot(30).await;
    harness.bring_online().await;

    let mission = MissionObject::new(
        "m11",
        ROBOT,
        vec![
            MissionNode::route("first", ROOT_NODE, two_waypoints()),
            MissionNode::route("second", ROOT_NODE, two_waypoints()),
        ],
    );
    harness.add_mission(mission).await;
    harness.notify_mission("m11").await;

    // Complete the first leg.
    let first = harness.publisher.last_order().await.unwrap();
    harness
        .send_state(order_progress(ROBOT, &first, first.final_sequence_id()))
        .await;
    let second = harness.publisher.last_order().await.unwrap();
    assert_ne!(second.order_id, first.order_id);
    let count_before = harness.publisher.order_count().await;

    // An update naming the finished node is rejected; nothing is re-issued.
    let mut updates = BTreeMap::new();
    updates.insert(
        "first".to_string(),
        RouteNode {
            waypoints: vec![Pose2D::new(9.0, 9.0, 0.0, "map")],
        },
    );
    harness.store.request_update("m11", updates).await;
    harness.notify_mission("m11").await;
    assert_eq!(harness.publisher.order_count().await, count_before);
    assert_eq!(harness.mission_state("m11").await, MissionState::Running);

    // The mission still completes on the second leg.
    harness
        .send_state(order_progress(ROBOT, &second, second.final_sequence_id()))
        .await;
    assert_eq!(harness.mission_state("m11").await, MissionState::Completed);
}

#[tokio::test(start_paused = true)]
async fn robot_deletion_fails_running_mission() {
    let harness = Harness::spawn().await;
    harness.add_robot(30).await;
    harness.bring_online().await;

    harness.add_mission(route_mission("m12", two_waypoints())).await;
    harness.notify_mission("m12").await;
    assert_eq!(harness.mission_state("m12").await, MissionState::Running);

    harness.handle.send(RobotEvent::RobotDeleted).await;
    harness.settle().await;

    let stored = harness.store.mission("m12").await.unwrap();
    assert_eq!(stored.status.state, MissionState::Failed);
    assert_eq!(
        stored.status.node_status[ROOT_NODE].error,
        Some(FailureKind::RobotDeleted)
    );
}

#[tokio::test(start_paused = true)]
async fn pending_delete_mission_runs_to_completion_then_disappears() {
    let harness = Harness::spawn().await;
    harness.add_robot(30).await;
    harness.bring_online().await;

    harness.add_mission(route_mission("m13", two_waypoints())).await;
    harness.notify_mission("m13").await;
    let order = harness.publisher.last_order().await.unwrap();

    // Client deletes the running mission; it must finish first.
    harness.store.request_mission_delete("m13").await;
    harness.notify_mission("m13").await;
    assert_eq!(
        harness.store.mission("m13").await.unwrap().lifecycle,
        ObjectLifecycle::PendingDelete
    );

    harness
        .send_state(order_progress(ROBOT, &order, order.final_sequence_id()))
        .await;
    // Finalized, then removed from the store.
    assert!(harness.store.mission("m13").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn cancel_racing_completion_loses() {
    let harness = Harness::spawn().await;
    harness.add_robot(30).await;
    harness.bring_online().await;

    harness.add_mission(route_mission("m14", two_waypoints())).await;
    harness.notify_mission("m14").await;
    let order = harness.publisher.last_order().await.unwrap();

    // The robot finishes; a cancel with a stale RUNNING snapshot arrives
    // right behind it. Completion wins.
    let mut stale = harness.store.mission("m14").await.unwrap();
    stale.spec.needs_canceled = true;
    harness
        .send_state(order_progress(ROBOT, &order, order.final_sequence_id()))
        .await;
    harness
        .handle
        .send(RobotEvent::MissionChanged(Box::new(stale)))
        .await;
    harness.settle().await;

    assert_eq!(harness.mission_state("m14").await, MissionState::Completed);
}

#[tokio::test(start_paused = true)]
async fn consecutive_missions_publish_monotonic_header_ids() {
    let harness = Harness::spawn().await;
    harness.add_robot(30).await;
    harness.bring_online().await;

    for name in ["a1", "a2"] {
        harness.add_mission(route_mission(name, two_waypoints())).await;
        harness.notify_mission(name).await;
        let order = harness.publisher.last_order().await.unwrap();
        harness
            .send_state(order_progress(ROBOT, &order, order.final_sequence_id()))
            .await;
        assert_eq!(harness.mission_state(name).await, MissionState::Completed);
    }

    let orders = harness.publisher.orders().await;
    assert_eq!(orders.len(), 2);
    // headerId is monotonic per topic, and node 0 of each order starts at
    // the robot's last reported sequence id.
    assert!(orders[1].1.header.header_id > orders[0].1.header.header_id);
    assert_eq!(orders[0].1.nodes[0].sequence_id, 0);
    assert_eq!(
        orders[1].1.nodes[0].sequence_id,
        orders[0].1.final_sequence_id()
    );
}
