//! VDA5050 wire model and topic conventions.
//!
//! Implements the message subset exchanged with robots: Order and
//! InstantActions outbound, State / Connection / Factsheet inbound. Field
//! names and casing follow the VDA5050 standard, so every struct here is
//! `camelCase` on the wire.

pub mod order;
pub mod state;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

pub use order::{
    Action, ActionParameter, BlockingType, Edge, InstantActions, NodePosition, Order, OrderNode,
    CANCEL_ORDER_ACTION,
};
pub use state::{
    ActionState, ActionStatus, AgvPosition, BatteryState, ConnectionMessage, ConnectionState,
    EdgeState, NodeState, OperatingMode, State, StateError, StateErrorLevel, StateErrorReference,
    StateInfo,
};

/// The five VDA5050 channels this controller speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Order,
    InstantActions,
    State,
    Connection,
    Factsheet,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Order => "order",
            Channel::InstantActions => "instantActions",
            Channel::State => "state",
            Channel::Connection => "connection",
            Channel::Factsheet => "factsheet",
        }
    }

    fn from_str(s: &str) -> Option<Channel> {
        match s {
            "order" => Some(Channel::Order),
            "instantActions" => Some(Channel::InstantActions),
            "state" => Some(Channel::State),
            "connection" => Some(Channel::Connection),
            "factsheet" => Some(Channel::Factsheet),
            _ => None,
        }
    }
}

/// Header fields shared by every VDA5050 message, flattened into each
/// payload. `header_id` is monotonically increasing per sender per topic.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    #[serde(default)]
    pub header_id: u64,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub serial_number: String,
}

/// Topic construction and parsing for one configured namespace:
/// `{prefix}/{interface_version}/{manufacturer}/{serial}/{channel}`.
#[derive(Debug, Clone)]
pub struct TopicSpace {
    prefix: String,
    interface_version: String,
    manufacturer: String,
}

impl TopicSpace {
    pub fn new(
        prefix: impl Into<String>,
        interface_version: impl Into<String>,
        manufacturer: impl Into<String>,
    ) -> Self {
        TopicSpace {
            prefix: prefix.into(),
            interface_version: interface_version.into(),
            manufacturer: manufacturer.into(),
        }
    }

    pub fn interface_version(&self) -> &str {
        &self.interface_version
    }

    pub fn manufacturer(&self) -> &str {
        &self.manufacturer
    }

    fn base(&self) -> String {
        format!(
            "{}/{}/{}",
            self.prefix, self.interface_version, self.manufacturer
        )
    }

    /// The topic for one robot and channel. `serial` is the robot name.
    pub fn topic(&self, serial: &str, channel: Channel) -> String {
        format!("{}/{}/{}", self.base(), serial, channel.as_str())
    }

    /// Wildcard subscription matching every robot on a channel.
    pub fn subscription(&self, channel: Channel) -> String {
        format!("{}/+/{}", self.base(), channel.as_str())
    }

    /// Topic the controller publishes its own presence (and last will) on.
    pub fn presence_topic(&self) -> String {
        self.topic("mission-dispatch", Channel::Connection)
    }

    /// Resolves an inbound topic to `(serial, channel)`.
    pub fn parse(&self, topic: &str) -> Result<(String, Channel), CodecError> {
        let base = self.base();
        let rest = topic
            .strip_prefix(base.as_str())
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(|| CodecError::UnknownTopic(topic.to_string()))?;
        let mut parts = rest.split('/');
        let serial = parts.next().filter(|s| !s.is_empty());
        let channel = parts.next().and_then(Channel::from_str);
        match (serial, channel, parts.next()) {
            (Some(serial), Some(channel), None) => Ok((serial.to_string(), channel)),
            _ => Err(CodecError::UnknownTopic(topic.to_string())),
        }
    }

    /// Fills in the header fields for an outbound message.
    pub fn stamp(&self, header: &mut Header, header_id: u64, serial: &str) {
        header.header_id = header_id;
        header.timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        header.version = self.interface_version.clone();
        header.manufacturer = self.manufacturer.clone();
        header.serial_number = serial.to_string();
    }
}

/// Extracts the mission-tree node index embedded in an order, node or action
/// id of the `{mission}-n{index}[-s{seq}|-a{n}]` scheme.
pub fn mission_node_of_id(id: &str) -> Option<usize> {
    let (_, tail) = id.rsplit_once("-n")?;
    let digits: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Extracts the mission name from an order id of the `{mission}-n{index}`
/// scheme.
pub fn mission_of_order_id(order_id: &str) -> Option<&str> {
    order_id.rsplit_once("-n").map(|(mission, _)| mission)
}
