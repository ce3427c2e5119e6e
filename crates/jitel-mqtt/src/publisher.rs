//! Outbound device commands.
//!
//! Commands go to `<ns>/<gatewayId>/<nodeId>/command` when a gateway is
//! given and to `<ns>/<nodeId>/command` otherwise, JSON encoded, at QoS 2.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::env_vars;
use crate::connection::{ConnectionManager, PublishOptions};
use crate::error::{MqttError, Result};
use crate::pattern::{TopicParams, TopicPattern};
use crate::transport::Qos;

fn default_namespace() -> String {
    "JI/v2".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPublisherConfig {
    /// Topic prefix shared by every command topic.
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for CommandPublisherConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
        }
    }
}

impl CommandPublisherConfig {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Read `MQTT_COMMAND_NAMESPACE`, falling back to the default.
    pub fn from_env() -> Self {
        std::env::var(env_vars::MQTT_COMMAND_NAMESPACE)
            .ok()
            .map(|ns| ns.trim_matches('/').to_string())
            .filter(|ns| !ns.is_empty())
            .map(Self::new)
            .unwrap_or_default()
    }
}

/// Publishes commands addressed to a node, optionally behind a gateway.
pub struct CommandPublisher {
    connection: Arc<ConnectionManager>,
    gateway_topic: TopicPattern,
    node_topic: TopicPattern,
}

impl CommandPublisher {
    pub fn new(connection: Arc<ConnectionManager>, config: CommandPublisherConfig) -> Result<Self> {
        let ns = config.namespace;
        Ok(Self {
            connection,
            gateway_topic: TopicPattern::compile(&format!("{}/+gatewayId/+nodeId/command", ns))?,
            node_topic: TopicPattern::compile(&format!("{}/+nodeId/command", ns))?,
        })
    }

    /// Topic a command for `node_id` is published to.
    pub fn command_topic(&self, gateway_id: Option<&str>, node_id: &str) -> Result<String> {
        let params = TopicParams::new().with("nodeId", node_id);
        let topic = match gateway_id.filter(|g| !g.is_empty()) {
            Some(gateway_id) => self.gateway_topic.fill(&params.with("gatewayId", gateway_id))?,
            None => self.node_topic.fill(&params)?,
        };
        Ok(topic)
    }

    /// Encode `data` as JSON and publish it at QoS 2.
    ///
    /// Fails with `NotConnected` when the broker is unreachable; nothing is
    /// queued for later delivery.
    pub async fn publish_command<T: Serialize + ?Sized>(
        &self,
        gateway_id: Option<&str>,
        node_id: &str,
        data: &T,
    ) -> Result<()> {
        if !self.connection.is_connected() {
            return Err(MqttError::NotConnected);
        }

        let topic = self.command_topic(gateway_id, node_id)?;
        let payload = serde_json::to_vec(data)?;
        debug!(topic = %topic, bytes = payload.len(), "Publishing command");
        self.connection
            .publish(&topic, payload, PublishOptions::qos(Qos::ExactlyOnce))
            .await
    }
}
