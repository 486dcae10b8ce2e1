//! The rumqttc-backed broker session.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS, Transport};
use tokio::sync::{mpsc, watch, Mutex};

use crate::config::{ControllerConfig, MqttTransportKind};
use crate::error::TransportError;
use crate::transport::{decode_inbound, InboundMessage, OutboundPublisher, PublishOutcome};
use crate::vda5050::{Channel, ConnectionMessage, ConnectionState, Header, InstantActions, Order, TopicSpace};

/// Reconnect backoff bounds.
const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
/// Capacity of the inbound channel toward the dispatch server.
const INBOUND_CHANNEL_SIZE: usize = 1024;
const CLIENT_ID: &str = "mission-dispatch";

struct QueuedPublish {
    topic: String,
    payload: Vec<u8>,
    /// Owning mission for droppable orders; `None` marks critical traffic.
    mission: Option<String>,
}

struct Shared {
    /// Per-robot publish queues, drained in order on reconnect.
    queues: Mutex<HashMap<String, VecDeque<QueuedPublish>>>,
    /// Per-topic outbound header counters.
    headers: Mutex<HashMap<String, u64>>,
}

/// The controller's single MQTT session.
///
/// Publishes at QoS 1, retained=false. While the broker is unreachable,
/// publishes queue per robot up to the configured bound; on overflow the
/// oldest order is dropped and its mission reported back to the caller.
pub struct MqttTransport {
    client: AsyncClient,
    space: TopicSpace,
    shared: Arc<Shared>,
    connected: watch::Receiver<bool>,
    queue_bound: usize,
}

impl MqttTransport {
    /// Connects to the broker and starts the receive loop. Returns the
    /// transport and the channel carrying decoded inbound messages.
    pub fn connect(
        config: &ControllerConfig,
        space: TopicSpace,
    ) -> (Arc<MqttTransport>, mpsc::Receiver<InboundMessage>) {
        let mut options = match config.mqtt_transport {
            MqttTransportKind::Tcp => {
                MqttOptions::new(CLIENT_ID, config.mqtt_host.clone(), config.mqtt_port)
            }
            MqttTransportKind::Websockets => {
                let path = config.mqtt_ws_path.clone().unwrap_or_default();
                let url = format!("ws://{}:{}{}", config.mqtt_host, config.mqtt_port, path);
                let mut options = MqttOptions::new(CLIENT_ID, url, config.mqtt_port);
                options.set_transport(Transport::Ws);
                options
            }
        };
        options.set_keep_alive(Duration::from_secs(5));
        options.set_last_will(LastWill::new(
            space.presence_topic(),
            presence_payload(&space, ConnectionState::Offline),
            QoS::AtLeastOnce,
            false,
        ));

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        let (connected_tx, connected_rx) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);

        let shared = Arc::new(Shared {
            queues: Mutex::new(HashMap::new()),
            headers: Mutex::new(HashMap::new()),
        });
        let transport = Arc::new(MqttTransport {
            client: client.clone(),
            space: space.clone(),
            shared: shared.clone(),
            connected: connected_rx,
            queue_bound: config.backpressure_queue_size,
        });

        let loop_transport = transport.clone();
        tokio::spawn(async move {
            let mut backoff = BACKOFF_BASE;
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::info!("connected to mqtt broker");
                        backoff = BACKOFF_BASE;
                        let _ = connected_tx.send(true);
                        loop_transport.on_connected().await;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        match decode_inbound(&space, &publish.topic, &publish.payload) {
                            Ok(message) => {
                                if inbound_tx.send(message).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => tracing::warn!("dropping inbound message: {e}"),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = connected_tx.send(false);
                        let jitter = 1.0 + rand::random::<f64>() * 0.25;
                        let delay = backoff.mul_f64(jitter).min(BACKOFF_MAX);
                        tracing::warn!(
                            "mqtt connection error ({e}), reconnecting in {}ms",
                            delay.as_millis()
                        );
                        tokio::time::sleep(delay).await;
                        backoff = (backoff * 2).min(BACKOFF_MAX);
                    }
                }
            }
        });

        (transport, inbound_rx)
    }

    /// Resubscribes, announces presence and drains queued publishes.
    async fn on_connected(&self) {
        for channel in [Channel::State, Channel::Connection, Channel::Factsheet] {
            let topic = self.space.subscription(channel);
            if let Err(e) = self.client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
                tracing::warn!("subscribe to {topic} failed: {e}");
            }
        }
        let _ = self
            .client
            .publish(
                self.space.presence_topic(),
                QoS::AtLeastOnce,
                false,
                presence_payload(&self.space, ConnectionState::Online),
            )
            .await;

        let mut queues = self.shared.queues.lock().await;
        for (serial, queue) in queues.iter_mut() {
            while let Some(entry) = queue.pop_front() {
                if let Err(e) = self
                    .client
                    .publish(entry.topic, QoS::AtLeastOnce, false, entry.payload)
                    .await
                {
                    tracing::warn!("flush for robot {serial} failed: {e}");
                    break;
                }
            }
        }
    }

    async fn next_header_id(&self, topic: &str) -> u64 {
        let mut headers = self.shared.headers.lock().await;
        let counter = headers.entry(topic.to_string()).or_insert(0);
        let id = *counter;
        *counter += 1;
        id
    }

    async fn publish_or_queue(
        &self,
        serial: &str,
        topic: String,
        payload: Vec<u8>,
        mission: Option<String>,
    ) -> Result<PublishOutcome, TransportError> {
        if *self.connected.borrow() {
            self.client
                .publish(topic, QoS::AtLeastOnce, false, payload)
                .await
                .map_err(|e| TransportError::Connection(e.to_string()))?;
            return Ok(PublishOutcome::default());
        }

        let mut queues = self.shared.queues.lock().await;
        let queue = queues.entry(serial.to_string()).or_default();
        let mut outcome = PublishOutcome::default();
        if queue.len() >= self.queue_bound {
            let droppable = queue.iter().position(|entry| entry.mission.is_some());
            match droppable {
                Some(index) => {
                    let dropped = queue.remove(index);
                    outcome.dropped_mission = dropped.and_then(|entry| entry.mission);
                    tracing::warn!(
                        "outbound queue for {serial} overflowed, dropped an order"
                    );
                }
                None => {
                    return Err(TransportError::QueueFull {
                        robot: serial.to_string(),
                    })
                }
            }
        }
        queue.push_back(QueuedPublish {
            topic,
            payload,
            mission,
        });
        Ok(outcome)
    }
}

fn presence_payload(space: &TopicSpace, state: ConnectionState) -> Vec<u8> {
    let mut message = ConnectionMessage {
        header: Header::default(),
        connection_state: state,
    };
    space.stamp(&mut message.header, 0, CLIENT_ID);
    serde_json::to_vec(&message).unwrap_or_default()
}

#[async_trait]
impl OutboundPublisher for MqttTransport {
    async fn publish_order(
        &self,
        serial: &str,
        mission: &str,
        mut order: Order,
    ) -> Result<PublishOutcome, TransportError> {
        let topic = self.space.topic(serial, Channel::Order);
        let header_id = self.next_header_id(&topic).await;
        self.space.stamp(&mut order.header, header_id, serial);
        let payload = serde_json::to_vec(&order)
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        self.publish_or_queue(serial, topic, payload, Some(mission.to_string()))
            .await
    }

    async fn publish_instant_actions(
        &self,
        serial: &str,
        mut actions: InstantActions,
    ) -> Result<(), TransportError> {
        let topic = self.space.topic(serial, Channel::InstantActions);
        let header_id = self.next_header_id(&topic).await;
        self.space.stamp(&mut actions.header, header_id, serial);
        let payload = serde_json::to_vec(&actions)
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        self.publish_or_queue(serial, topic, payload, None)
            .await
            .map(|_| ())
    }
}
