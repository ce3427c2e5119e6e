//! Broker connection lifecycle.
//!
//! The [`ConnectionManager`] is the only owner of the transport. Its state
//! machine:
//!
//! ```text
//! Disconnected --connect()--> Connecting --ack--> Connected
//!      ^                          |                   |
//!      +------ timeout/refused ---+            transport closed
//!                                                     v
//!          Connecting <--fixed delay elapsed-- ReconnectPending
//! ```
//!
//! A single supervisor task forwards inbound messages and, after an
//! unexpected close, retries every `reconnect_delay_ms` until it succeeds or
//! the manager is disconnected. Every subscription acknowledged so far is
//! re-issued once a new session is up.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::error::{MqttError, Result};
use crate::transport::{
    InboundMessage, OutboundMessage, Qos, SubscriptionFilter, Transport, TransportError,
    TransportEvent,
};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ReconnectPending,
}

/// Options for an outbound publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub qos: Qos,
    pub retain: bool,
}

impl PublishOptions {
    pub fn qos(qos: Qos) -> Self {
        Self { qos, retain: false }
    }
}

/// Owner of the single broker connection.
pub struct ConnectionManager {
    config: BrokerConfig,
    broker: String,
    transport: Arc<dyn Transport>,
    state: watch::Sender<ConnectionState>,
    /// Acknowledged subscribe calls, in call order.
    subscriptions: Mutex<Vec<Vec<SubscriptionFilter>>>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    /// Serializes connect() and disconnect().
    lifecycle: tokio::sync::Mutex<()>,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a manager in the `Disconnected` state.
    ///
    /// A missing client id is generated here so every reconnect presents the
    /// same identity.
    pub fn new(mut config: BrokerConfig, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        config.validate()?;
        let broker = config.endpoint()?.to_string();
        config.client_id = Some(config.resolved_client_id());

        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            broker,
            transport,
            state,
            subscriptions: Mutex::new(Vec::new()),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            lifecycle: tokio::sync::Mutex::new(()),
            shutdown,
            supervisor: Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Broker address as `host:port`.
    pub fn broker(&self) -> &str {
        &self.broker
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Health signal for collaborators that must refuse work while offline.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Wait until the manager reaches `target`, up to `timeout`.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.watch_state();
        tokio::time::timeout(timeout, rx.wait_for(|state| *state == target))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Filters that will be re-issued after a reconnect.
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .iter()
            .flatten()
            .map(|f| f.topic.clone())
            .collect()
    }

    /// Hand out the inbound message stream. Only one consumer may exist.
    pub fn take_messages(&self) -> Result<mpsc::Receiver<InboundMessage>> {
        self.inbound_rx.lock().take().ok_or(MqttError::MessagesTaken)
    }

    /// Connect to the broker.
    ///
    /// Fails with `ConnectTimeout` or `Connect` and returns to `Disconnected`
    /// when the broker does not accept the session in time. Succeeds
    /// immediately when already connected.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Connecting | ConnectionState::ReconnectPending => {
                return Err(MqttError::ConnectionInProgress)
            }
            ConnectionState::Disconnected => {}
        }

        self.shutdown.send_replace(false);
        let events = match self.open_session().await {
            Ok(events) => events,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                error!(broker = %self.broker, "MQTT connect failed: {}", e);
                return Err(e);
            }
        };

        self.resubscribe().await;
        let supervisor = tokio::spawn(Arc::clone(self).supervise(events));
        *self.supervisor.lock() = Some(supervisor);
        Ok(())
    }

    /// Close the connection and stop reconnecting.
    pub async fn disconnect(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.shutdown.send_replace(true);

        let supervisor = self.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            if let Err(e) = supervisor.await {
                warn!("MQTT supervisor ended abnormally: {}", e);
            }
        }

        if let Err(e) = self.transport.disconnect().await {
            warn!(broker = %self.broker, "MQTT transport disconnect failed: {}", e);
        }
        self.set_state(ConnectionState::Disconnected);
        info!(broker = %self.broker, "MQTT client disconnected");
        Ok(())
    }

    /// Publish a message. Fails with `NotConnected` unless `Connected`.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        options: PublishOptions,
    ) -> Result<()> {
        if !self.is_connected() {
            return Err(MqttError::NotConnected);
        }

        let message = OutboundMessage {
            topic: topic.to_string(),
            payload: payload.into(),
            qos: options.qos,
            retain: options.retain,
        };
        let timeout_ms = self.config.operation_timeout_ms;
        let source = match tokio::time::timeout(
            self.config.operation_timeout(),
            self.transport.publish(message),
        )
        .await
        {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(source)) => source,
            Err(_) => TransportError::Timeout(timeout_ms),
        };
        Err(MqttError::Publish {
            topic: topic.to_string(),
            source,
        })
    }

    /// Subscribe to wire-level filters.
    ///
    /// Acknowledged filters are remembered and re-issued after every
    /// reconnect; rejected ones are not.
    pub async fn subscribe(&self, filters: &[SubscriptionFilter]) -> Result<()> {
        if !self.is_connected() {
            return Err(MqttError::NotConnected);
        }
        self.send_subscribe(filters).await?;
        self.subscriptions.lock().push(filters.to_vec());
        Ok(())
    }

    /// Stop re-issuing a previously acknowledged subscribe group.
    pub(crate) fn forget(&self, filters: &[SubscriptionFilter]) {
        let mut subscriptions = self.subscriptions.lock();
        if let Some(position) = subscriptions
            .iter()
            .rposition(|group| group.as_slice() == filters)
        {
            subscriptions.remove(position);
        }
    }

    async fn send_subscribe(&self, filters: &[SubscriptionFilter]) -> Result<()> {
        let timeout_ms = self.config.operation_timeout_ms;
        let source = match tokio::time::timeout(
            self.config.operation_timeout(),
            self.transport.subscribe(filters),
        )
        .await
        {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(source)) => source,
            Err(_) => TransportError::Timeout(timeout_ms),
        };
        Err(MqttError::Subscribe {
            topics: filters
                .iter()
                .map(|f| f.topic.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            source,
        })
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(broker = %self.broker, "MQTT state {:?} -> {:?}", previous, next);
        }
    }

    async fn open_session(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        self.set_state(ConnectionState::Connecting);
        let attempt =
            tokio::time::timeout(self.config.connect_timeout(), self.transport.connect(&self.config))
                .await;

        match attempt {
            Ok(Ok(events)) => {
                self.set_state(ConnectionState::Connected);
                info!(broker = %self.broker, "MQTT client connected to {}", self.broker);
                Ok(events)
            }
            Ok(Err(source)) => Err(MqttError::Connect {
                broker: self.broker.clone(),
                source,
            }),
            Err(_) => Err(MqttError::ConnectTimeout {
                broker: self.broker.clone(),
                timeout_ms: self.config.connect_timeout_ms,
            }),
        }
    }

    async fn resubscribe(&self) {
        let groups = self.subscriptions.lock().clone();
        if groups.is_empty() {
            return;
        }

        let mut restored = 0;
        for filters in &groups {
            match self.send_subscribe(filters).await {
                Ok(()) => restored += filters.len(),
                Err(e) => error!(broker = %self.broker, "Re-subscribe failed: {}", e),
            }
        }
        info!(
            broker = %self.broker,
            "Re-subscribed {} of {} topics",
            restored,
            groups.iter().map(Vec::len).sum::<usize>()
        );
    }

    async fn supervise(self: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let reason = tokio::select! {
                reason = self.forward(&mut events) => reason,
                _ = shutdown_requested(&mut shutdown) => break,
            };
            if *shutdown.borrow() {
                break;
            }

            self.set_state(ConnectionState::ReconnectPending);
            warn!(
                broker = %self.broker,
                "MQTT client is disconnected ({}); reconnecting every {}ms",
                reason,
                self.config.reconnect_delay_ms
            );

            events = match self.reconnect(&mut shutdown).await {
                Some(events) => events,
                None => break,
            };
            self.resubscribe().await;
        }
        debug!(broker = %self.broker, "MQTT supervisor stopped");
    }

    /// Forward inbound messages until the session closes.
    ///
    /// Until a consumer takes the stream, messages are buffered up to
    /// `inbound_capacity` without waiting, so retained messages delivered
    /// during registration reach the dispatcher once it starts.
    async fn forward(&self, events: &mut mpsc::Receiver<TransportEvent>) -> String {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Message(message) => {
                    if self.inbound_rx.lock().is_some() {
                        if let Err(mpsc::error::TrySendError::Full(message)) =
                            self.inbound_tx.try_send(message)
                        {
                            warn!(
                                topic = %message.topic,
                                "Inbound buffer full before dispatch started, dropping"
                            );
                        }
                        continue;
                    }
                    if self.inbound_tx.send(message).await.is_err() {
                        debug!("Message consumer gone, dropping");
                    }
                }
                TransportEvent::Closed { reason } => {
                    return reason.unwrap_or_else(|| "session closed".to_string())
                }
            }
        }
        "event stream ended".to_string()
    }

    async fn reconnect(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<mpsc::Receiver<TransportEvent>> {
        let mut attempt: u64 = 0;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay()) => {}
                _ = shutdown_requested(shutdown) => return None,
            }

            attempt += 1;
            info!(broker = %self.broker, attempt, "Attempting to reconnect...");
            let result = tokio::select! {
                result = self.open_session() => result,
                _ = shutdown_requested(shutdown) => return None,
            };

            match result {
                Ok(events) => return Some(events),
                Err(e) => {
                    warn!(broker = %self.broker, attempt, "Reconnect failed: {}", e);
                    self.set_state(ConnectionState::ReconnectPending);
                }
            }
        }
    }
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    fn manager(transport: Arc<MemoryTransport>) -> Arc<ConnectionManager> {
        let config = BrokerConfig::new("mqtt://broker.test:1883")
            .with_client_id("test")
            .with_connect_timeout(Duration::from_millis(50))
            .with_reconnect_delay(Duration::from_millis(20));
        ConnectionManager::new(config, transport).unwrap()
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager(transport.clone());

        let result = manager.publish("a/b", b"x".to_vec(), PublishOptions::default()).await;
        assert!(matches!(result, Err(MqttError::NotConnected)));
        assert!(transport.published().is_empty());
        assert_eq!(transport.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_and_publish() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager(transport.clone());

        manager.connect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(manager.is_connected());

        manager
            .publish("a/b", b"x".to_vec(), PublishOptions::qos(Qos::AtLeastOnce))
            .await
            .unwrap();
        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].qos, Qos::AtLeastOnce);

        manager.disconnect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_refused_connect_returns_to_disconnected() {
        let transport = Arc::new(MemoryTransport::new());
        transport.set_refusing(true);
        let manager = manager(transport.clone());

        let result = manager.connect().await;
        assert!(matches!(result, Err(MqttError::Connect { .. })));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let transport = Arc::new(MemoryTransport::new());
        transport.set_stalled(true);
        let manager = manager(transport.clone());

        let result = manager.connect().await;
        assert!(matches!(
            result,
            Err(MqttError::ConnectTimeout { timeout_ms: 50, .. })
        ));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_subscribe_records_only_acknowledged() {
        let transport = Arc::new(MemoryTransport::new());
        transport.reject_filter("bad/+");
        let manager = manager(transport.clone());
        manager.connect().await.unwrap();

        manager
            .subscribe(&[SubscriptionFilter::new("good/+", Qos::AtLeastOnce)])
            .await
            .unwrap();
        let rejected = manager
            .subscribe(&[SubscriptionFilter::new("bad/+", Qos::AtLeastOnce)])
            .await;
        assert!(matches!(rejected, Err(MqttError::Subscribe { .. })));
        assert_eq!(manager.subscribed_topics(), vec!["good/+".to_string()]);
    }

    #[tokio::test]
    async fn test_messages_taken_once() {
        let manager = manager(Arc::new(MemoryTransport::new()));
        assert!(manager.take_messages().is_ok());
        assert!(matches!(
            manager.take_messages(),
            Err(MqttError::MessagesTaken)
        ));
    }

    #[tokio::test]
    async fn test_messages_before_consumer_are_buffered() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager(transport.clone());
        manager.connect().await.unwrap();
        manager
            .subscribe(&[SubscriptionFilter::new("JI/v2/+/status", Qos::AtLeastOnce)])
            .await
            .unwrap();

        assert!(transport.inject("JI/v2/N1/status", b"online".to_vec()).await);
        // let the supervisor forward it before anyone consumes
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut messages = manager.take_messages().unwrap();
        let message = tokio::time::timeout(Duration::from_millis(200), messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.topic, "JI/v2/N1/status");
        assert_eq!(message.payload, b"online".to_vec());
    }

    #[tokio::test]
    async fn test_full_buffer_does_not_stall_supervisor() {
        let transport = Arc::new(MemoryTransport::new());
        let mut config = BrokerConfig::new("mqtt://broker.test:1883")
            .with_client_id("test")
            .with_reconnect_delay(Duration::from_millis(20));
        config.inbound_capacity = 2;
        let manager = ConnectionManager::new(config, transport.clone()).unwrap();
        manager.connect().await.unwrap();
        manager
            .subscribe(&[SubscriptionFilter::new("a/+", Qos::AtMostOnce)])
            .await
            .unwrap();

        for i in 0..5 {
            assert!(transport.inject(&format!("a/{}", i), b"x".to_vec()).await);
        }
        transport.close("network down").await;
        assert!(
            manager
                .wait_for_state(ConnectionState::ReconnectPending, Duration::from_secs(1))
                .await
        );

        let mut messages = manager.take_messages().unwrap();
        assert_eq!(messages.recv().await.map(|m| m.topic).as_deref(), Some("a/0"));
        assert_eq!(messages.recv().await.map(|m| m.topic).as_deref(), Some("a/1"));
        assert!(messages.try_recv().is_err());
        manager.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_forget_drops_group_from_replay() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager(transport);
        manager.connect().await.unwrap();
        let group = [SubscriptionFilter::new("a/+", Qos::AtMostOnce)];
        manager.subscribe(&group).await.unwrap();
        manager
            .subscribe(&[SubscriptionFilter::new("b/+", Qos::AtMostOnce)])
            .await
            .unwrap();

        manager.forget(&group);
        assert_eq!(manager.subscribed_topics(), vec!["b/+".to_string()]);
    }

    #[tokio::test]
    async fn test_disconnect_does_not_reconnect() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager(transport.clone());
        manager.connect().await.unwrap();

        manager.disconnect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(transport.connect_count(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}
