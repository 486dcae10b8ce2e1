//! MQTT transport: the controller's single broker session.
//!
//! Outbound traffic goes through [`OutboundPublisher`], a seam the dispatch
//! core depends on so tests can swap the broker for a recorder. The real
//! implementation is [`mqtt::MqttTransport`]; inbound traffic arrives as
//! decoded [`InboundMessage`]s on a single channel and is fanned out to
//! per-robot mailboxes by the dispatch server.

pub mod mqtt;

use async_trait::async_trait;

use crate::error::{CodecError, TransportError};
use crate::vda5050::{Channel, ConnectionMessage, InstantActions, Order, State, TopicSpace};

pub use mqtt::MqttTransport;

/// A decoded message from one robot.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    State {
        serial: String,
        state: Box<State>,
    },
    Connection {
        serial: String,
        connection: ConnectionMessage,
    },
    Factsheet {
        serial: String,
        payload: serde_json::Value,
    },
}

impl InboundMessage {
    pub fn serial(&self) -> &str {
        match self {
            InboundMessage::State { serial, .. }
            | InboundMessage::Connection { serial, .. }
            | InboundMessage::Factsheet { serial, .. } => serial,
        }
    }
}

/// Decodes an inbound publish into a typed message.
pub fn decode_inbound(
    space: &TopicSpace,
    topic: &str,
    payload: &[u8],
) -> Result<InboundMessage, CodecError> {
    let (serial, channel) = space.parse(topic)?;
    match channel {
        Channel::State => {
            let state = serde_json::from_slice(payload).map_err(|source| CodecError::Payload {
                channel: "state",
                source,
            })?;
            Ok(InboundMessage::State {
                serial,
                state: Box::new(state),
            })
        }
        Channel::Connection => {
            let connection =
                serde_json::from_slice(payload).map_err(|source| CodecError::Payload {
                    channel: "connection",
                    source,
                })?;
            Ok(InboundMessage::Connection { serial, connection })
        }
        Channel::Factsheet => {
            let payload =
                serde_json::from_slice(payload).map_err(|source| CodecError::Payload {
                    channel: "factsheet",
                    source,
                })?;
            Ok(InboundMessage::Factsheet { serial, payload })
        }
        Channel::Order | Channel::InstantActions => Err(CodecError::UnknownTopic(topic.to_string())),
    }
}

/// Result of queueing an order publish.
#[derive(Debug, Default)]
pub struct PublishOutcome {
    /// Mission whose oldest queued order was dropped to make room, if the
    /// robot's queue overflowed while the broker was unreachable.
    pub dropped_mission: Option<String>,
}

/// Outbound seam between the dispatch core and the broker.
///
/// Implementations own header stamping: `headerId` is monotonically
/// increasing per topic, assigned at publish (or enqueue) time.
#[async_trait]
pub trait OutboundPublisher: Send + Sync {
    /// Publishes an order to one robot. Orders are droppable under
    /// backpressure; the owning mission is recorded so overflow can fail it.
    async fn publish_order(
        &self,
        serial: &str,
        mission: &str,
        order: Order,
    ) -> Result<PublishOutcome, TransportError>;

    /// Publishes instant actions to one robot. Never dropped.
    async fn publish_instant_actions(
        &self,
        serial: &str,
        actions: InstantActions,
    ) -> Result<(), TransportError>;
}
