//! In-process transport.
//!
//! Behaves like a single-client broker: subscriptions are per session and
//! are forgotten when the session closes, and publishes are looped back to
//! the session when an active filter matches. Every call is recorded so tests
//! can assert on connect attempts, subscribe calls and publishes, and the
//! failure knobs simulate refused connections, stalled handshakes, rejected
//! filters and dropped sessions.

use std::collections::HashSet;
use std::future;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{
    InboundMessage, OutboundMessage, PacketMetadata, SubscriptionFilter, Transport,
    TransportError, TransportEvent, TransportResult,
};
use crate::config::BrokerConfig;
use crate::pattern::TopicPattern;

#[derive(Default)]
struct MemoryState {
    events: Option<mpsc::Sender<TransportEvent>>,
    active: Vec<SubscriptionFilter>,
    connect_attempts: usize,
    connect_times: Vec<Instant>,
    connect_delay: Duration,
    refuse_next: usize,
    refusing: bool,
    stalled: bool,
    rejected: HashSet<String>,
    failing_publishes: bool,
    subscribe_log: Vec<Vec<String>>,
    published: Vec<OutboundMessage>,
}

/// In-process broker stand-in.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_next(&self, count: usize) {
        self.state.lock().refuse_next = count;
    }

    /// Refuse every connection attempt until turned off.
    pub fn set_refusing(&self, refusing: bool) {
        self.state.lock().refusing = refusing;
    }

    /// Never complete the connection handshake until turned off.
    pub fn set_stalled(&self, stalled: bool) {
        self.state.lock().stalled = stalled;
    }

    /// Hold every connection handshake for `delay` before it completes.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = delay;
    }

    /// Reject any subscribe call that includes `topic`.
    pub fn reject_filter(&self, topic: impl Into<String>) {
        self.state.lock().rejected.insert(topic.into());
    }

    pub fn set_failing_publishes(&self, failing: bool) {
        self.state.lock().failing_publishes = failing;
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().events.is_some()
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connect_attempts
    }

    /// When each connection attempt started.
    pub fn connect_times(&self) -> Vec<Instant> {
        self.state.lock().connect_times.clone()
    }

    /// Topics of every successful subscribe call, in call order.
    pub fn subscribe_log(&self) -> Vec<Vec<String>> {
        self.state.lock().subscribe_log.clone()
    }

    /// Filters active in the current session.
    pub fn active_filters(&self) -> Vec<String> {
        self.state.lock().active.iter().map(|f| f.topic.clone()).collect()
    }

    pub fn published(&self) -> Vec<OutboundMessage> {
        self.state.lock().published.clone()
    }

    /// Drop the session as a network failure would.
    pub async fn close(&self, reason: impl Into<String>) {
        let events = {
            let mut state = self.state.lock();
            state.active.clear();
            state.events.take()
        };
        if let Some(events) = events {
            let _ = events
                .send(TransportEvent::Closed {
                    reason: Some(reason.into()),
                })
                .await;
        }
    }

    /// Deliver a message from another client.
    ///
    /// Returns `false` when no session is open or no active filter matches.
    pub async fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        let mut message = InboundMessage::new(topic, payload);
        let Some((events, qos)) = self.route(topic) else {
            return false;
        };
        message.metadata = PacketMetadata::new(qos);
        events.send(TransportEvent::Message(message)).await.is_ok()
    }

    fn route(&self, topic: &str) -> Option<(mpsc::Sender<TransportEvent>, super::Qos)> {
        let state = self.state.lock();
        let events = state.events.clone()?;
        state
            .active
            .iter()
            .find(|filter| {
                TopicPattern::compile(&filter.topic)
                    .map(|p| p.matches(topic))
                    .unwrap_or(false)
            })
            .map(|filter| (events, filter.qos))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, config: &BrokerConfig) -> TransportResult<mpsc::Receiver<TransportEvent>> {
        let (stalled, delay) = {
            let mut state = self.state.lock();
            state.connect_attempts += 1;
            state.connect_times.push(Instant::now());
            if state.refusing {
                return Err(TransportError::Refused("NotAuthorized".to_string()));
            }
            if state.refuse_next > 0 {
                state.refuse_next -= 1;
                return Err(TransportError::Refused("ServiceUnavailable".to_string()));
            }
            (state.stalled, state.connect_delay)
        };
        if stalled {
            future::pending::<()>().await;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let (tx, rx) = mpsc::channel(config.inbound_capacity.max(1));
        let mut state = self.state.lock();
        state.active.clear();
        state.events = Some(tx);
        Ok(rx)
    }

    async fn subscribe(&self, filters: &[SubscriptionFilter]) -> TransportResult<()> {
        let mut state = self.state.lock();
        if state.events.is_none() {
            return Err(TransportError::NotConnected);
        }
        if let Some(rejected) = filters.iter().find(|f| state.rejected.contains(&f.topic)) {
            return Err(TransportError::Rejected(rejected.topic.clone()));
        }
        state
            .subscribe_log
            .push(filters.iter().map(|f| f.topic.clone()).collect());
        for filter in filters {
            if !state.active.iter().any(|f| f.topic == filter.topic) {
                state.active.push(filter.clone());
            }
        }
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> TransportResult<()> {
        {
            let mut state = self.state.lock();
            if state.events.is_none() {
                return Err(TransportError::NotConnected);
            }
            if state.failing_publishes {
                return Err(TransportError::Io("publish failed".to_string()));
            }
            state.published.push(message.clone());
        }
        let payload = message.payload.clone();
        self.inject(&message.topic, payload).await;
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        let events = {
            let mut state = self.state.lock();
            state.active.clear();
            state.events.take()
        };
        if let Some(events) = events {
            let _ = events.send(TransportEvent::Closed { reason: None }).await;
        }
        Ok(())
    }
}
