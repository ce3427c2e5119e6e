//! Broker transport seam.
//!
//! The connection manager drives a [`Transport`]; it never talks to an MQTT
//! client library directly. [`RumqttTransport`] is the production
//! implementation. `MemoryTransport`, an in-process broker stand-in, is
//! compiled for tests and behind the `testing` feature.

#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod rumqtt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::BrokerConfig;

#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryTransport;
pub use rumqtt::RumqttTransport;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Error type for transport operations.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Broker refused the connection
    #[error("connection refused: {0}")]
    Refused(String),

    /// Broker rejected the subscription filter
    #[error("subscription rejected: {0}")]
    Rejected(String),

    /// No session is open
    #[error("transport is not connected")]
    NotConnected,

    /// Session closed before the operation completed
    #[error("session closed")]
    Closed,

    /// No acknowledgment arrived in time
    #[error("no acknowledgment within {0}ms")]
    Timeout(u64),

    /// Invalid endpoint or options
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Network or client error
    #[error("{0}")]
    Io(String),
}

/// MQTT QoS level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Qos {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl From<Qos> for rumqttc::QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            Qos::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

impl From<rumqttc::QoS> for Qos {
    fn from(qos: rumqttc::QoS) -> Self {
        match qos {
            rumqttc::QoS::AtMostOnce => Qos::AtMostOnce,
            rumqttc::QoS::AtLeastOnce => Qos::AtLeastOnce,
            rumqttc::QoS::ExactlyOnce => Qos::ExactlyOnce,
        }
    }
}

/// Protocol-level details of a received publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PacketMetadata {
    pub qos: Qos,
    pub retain: bool,
    pub dup: bool,
    pub pkid: u16,
    pub received_at: chrono::DateTime<chrono::Utc>,
}

impl PacketMetadata {
    pub fn new(qos: Qos) -> Self {
        Self {
            qos,
            retain: false,
            dup: false,
            pkid: 0,
            received_at: chrono::Utc::now(),
        }
    }
}

/// A message delivered by the broker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub metadata: PacketMetadata,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            metadata: PacketMetadata::new(Qos::AtMostOnce),
        }
    }
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
}

/// A wire-level subscription filter and its QoS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub topic: String,
    pub qos: Qos,
}

impl SubscriptionFilter {
    pub fn new(topic: impl Into<String>, qos: Qos) -> Self {
        Self {
            topic: topic.into(),
            qos,
        }
    }
}

/// Events emitted by an open transport session.
#[derive(Debug)]
pub enum TransportEvent {
    Message(InboundMessage),
    /// The session ended. `reason` is `None` for a local disconnect.
    Closed { reason: Option<String> },
}

/// A broker connection.
///
/// Implementations hold at most one session. `connect` replaces any previous
/// session and returns the receiving end of its event stream; the stream ends
/// with [`TransportEvent::Closed`] or by the sender being dropped.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a session and wait for the broker's connection acknowledgment.
    async fn connect(&self, config: &BrokerConfig) -> TransportResult<mpsc::Receiver<TransportEvent>>;

    /// Subscribe and wait for the broker's acknowledgment.
    async fn subscribe(&self, filters: &[SubscriptionFilter]) -> TransportResult<()>;

    /// Publish and wait for the acknowledgment the QoS level requires.
    async fn publish(&self, message: OutboundMessage) -> TransportResult<()>;

    /// Close the current session, if any.
    async fn disconnect(&self) -> TransportResult<()>;
}
