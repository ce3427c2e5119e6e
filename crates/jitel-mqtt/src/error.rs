//! Error types for the MQTT dispatch engine.

use thiserror::Error;

use crate::pattern::PatternError;
use crate::transport::TransportError;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, MqttError>;

/// Error type for the connection manager, registry and publisher.
#[derive(Debug, Error)]
pub enum MqttError {
    /// Malformed subscription pattern or topic template
    #[error("Invalid pattern: {0}")]
    InvalidPattern(#[from] PatternError),

    /// Broker refused the connection or the transport failed while connecting
    #[error("Failed to connect to {broker}: {source}")]
    Connect {
        broker: String,
        #[source]
        source: TransportError,
    },

    /// Broker did not acknowledge the connection in time
    #[error("Connection to {broker} timed out after {timeout_ms}ms")]
    ConnectTimeout { broker: String, timeout_ms: u64 },

    /// A connect attempt is already running
    #[error("Connection attempt already in progress")]
    ConnectionInProgress,

    /// Operation requires a live broker connection
    #[error("MQTT client is not connected")]
    NotConnected,

    /// Broker rejected a subscription or it was never acknowledged
    #[error("Subscribe to [{topics}] failed: {source}")]
    Subscribe {
        topics: String,
        #[source]
        source: TransportError,
    },

    /// Publish was not accepted by the transport
    #[error("Publish to {topic} failed: {source}")]
    Publish {
        topic: String,
        #[source]
        source: TransportError,
    },

    /// Payload could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Registration attempted after dispatch started
    #[error("Registry is sealed; handlers must be registered during startup")]
    RegistrySealed,

    /// The inbound message stream has already been handed to a consumer
    #[error("Inbound message stream already taken")]
    MessagesTaken,
}

impl MqttError {
    /// Whether the error means the broker is currently unreachable.
    ///
    /// Callers serving HTTP map these to a service-unavailable response.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::NotConnected
                | Self::Connect { .. }
                | Self::ConnectTimeout { .. }
                | Self::ConnectionInProgress
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_classification() {
        assert!(MqttError::NotConnected.is_unavailable());
        assert!(MqttError::ConnectTimeout {
            broker: "localhost:1883".to_string(),
            timeout_ms: 3000,
        }
        .is_unavailable());
        assert!(!MqttError::RegistrySealed.is_unavailable());
    }

    #[test]
    fn test_error_messages() {
        let err = MqttError::Subscribe {
            topics: "a/+/c".to_string(),
            source: TransportError::Rejected("a/+/c".to_string()),
        };
        assert!(err.to_string().contains("a/+/c"));
        assert_eq!(MqttError::NotConnected.to_string(), "MQTT client is not connected");
    }
}
