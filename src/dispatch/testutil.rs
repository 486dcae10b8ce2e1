//! Shared fixtures for dispatch tests: a recording stand-in for the broker
//! and builders for robot telemetry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::TransportError;
use crate::transport::{OutboundPublisher, PublishOutcome};
use crate::vda5050::{
    ActionState, ActionStatus, AgvPosition, BatteryState, Header, InstantActions, Order, State,
    TopicSpace,
};

#[derive(Default)]
struct Recorded {
    orders: Vec<(String, Order)>,
    instant_actions: Vec<(String, InstantActions)>,
    headers: HashMap<String, u64>,
}

/// Records everything the dispatch core publishes, stamping headers the way
/// the real transport does.
pub struct RecordingPublisher {
    space: TopicSpace,
    recorded: Mutex<Recorded>,
}

impl RecordingPublisher {
    pub fn new() -> Arc<RecordingPublisher> {
        Arc::new(RecordingPublisher {
            space: TopicSpace::new("uagv", "v1", "acme"),
            recorded: Mutex::new(Recorded::default()),
        })
    }

    pub async fn orders(&self) -> Vec<(String, Order)> {
        self.recorded.lock().await.orders.clone()
    }

    pub async fn instant_actions(&self) -> Vec<(String, InstantActions)> {
        self.recorded.lock().await.instant_actions.clone()
    }

    pub async fn order_count(&self) -> usize {
        self.recorded.lock().await.orders.len()
    }

    pub async fn last_order(&self) -> Option<Order> {
        self.recorded
            .lock()
            .await
            .orders
            .last()
            .map(|(_, order)| order.clone())
    }

    pub async fn last_instant_actions(&self) -> Option<InstantActions> {
        self.recorded
            .lock()
            .await
            .instant_actions
            .last()
            .map(|(_, actions)| actions.clone())
    }
}

#[async_trait]
impl OutboundPublisher for RecordingPublisher {
    async fn publish_order(
        &self,
        serial: &str,
        _mission: &str,
        mut order: Order,
    ) -> Result<PublishOutcome, TransportError> {
        let mut recorded = self.recorded.lock().await;
        let topic = format!("{serial}/order");
        let counter = recorded.headers.entry(topic).or_insert(0);
        let header_id = *counter;
        *counter += 1;
        self.space.stamp(&mut order.header, header_id, serial);
        recorded.orders.push((serial.to_string(), order));
        Ok(PublishOutcome::default())
    }

    async fn publish_instant_actions(
        &self,
        serial: &str,
        mut actions: InstantActions,
    ) -> Result<(), TransportError> {
        let mut recorded = self.recorded.lock().await;
        let topic = format!("{serial}/instantActions");
        let counter = recorded.headers.entry(topic).or_insert(0);
        let header_id = *counter;
        *counter += 1;
        self.space.stamp(&mut actions.header, header_id, serial);
        recorded
            .instant_actions
            .push((serial.to_string(), actions));
        Ok(())
    }
}

/// A State message carrying plain telemetry: pose, battery, no order.
pub fn telemetry(serial: &str, x: f64, y: f64, battery: f64) -> State {
    State {
        header: Header {
            header_id: 0,
            timestamp: String::new(),
            version: "v1".to_string(),
            manufacturer: "acme".to_string(),
            serial_number: serial.to_string(),
        },
        order_id: String::new(),
        order_update_id: 0,
        last_node_id: String::new(),
        last_node_sequence_id: 0,
        node_states: vec![],
        edge_states: vec![],
        action_states: vec![],
        battery_state: Some(BatteryState {
            battery_charge: battery,
            charging: false,
        }),
        driving: false,
        agv_position: AgvPosition {
            position_initialized: true,
            x,
            y,
            theta: 0.0,
            map_id: "map".to_string(),
        },
        operating_mode: Default::default(),
        errors: vec![],
        information: vec![],
    }
}

/// Telemetry reporting progress on an order.
pub fn order_progress(serial: &str, order: &Order, last_node_sequence_id: u64) -> State {
    let mut state = telemetry(serial, 0.0, 0.0, 80.0);
    state.order_id = order.order_id.clone();
    state.order_update_id = order.order_update_id;
    state.last_node_sequence_id = last_node_sequence_id;
    state
}

/// Telemetry reporting an action result on an order.
pub fn action_result(
    serial: &str,
    order: &Order,
    action_id: &str,
    status: ActionStatus,
) -> State {
    let mut state = order_progress(serial, order, 0);
    state.action_states = vec![ActionState {
        action_id: action_id.to_string(),
        action_type: String::new(),
        action_status: status,
        result_description: "simulated".to_string(),
    }];
    state
}
