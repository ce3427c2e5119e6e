//! MQTT transport using rumqttc.
//!
//! Each `connect` builds a fresh `AsyncClient`/`EventLoop` pair and spawns
//! one pump task that owns the event loop. rumqttc's own reconnect is never
//! used: when polling fails the session is reported closed and the connection
//! manager decides what to do next.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, SubscribeReasonCode,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{
    InboundMessage, OutboundMessage, PacketMetadata, Qos, SubscriptionFilter, Transport,
    TransportError, TransportEvent, TransportResult,
};
use crate::config::BrokerConfig;

/// Maximum packet size in both directions.
const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

/// Capacity of the request channel between `AsyncClient` and `EventLoop`.
const REQUEST_CAPACITY: usize = 10;

type AckSender = oneshot::Sender<TransportResult<()>>;

/// Correlates subscribe and publish requests with broker acknowledgments.
///
/// Requests are queued in send order; the event loop reports the packet id
/// assigned to each one through `Outgoing::Subscribe`/`Outgoing::Publish` in
/// the same order.
#[derive(Default)]
struct AckTracker {
    queued_subscribes: VecDeque<AckSender>,
    subscribes: HashMap<u16, AckSender>,
    queued_publishes: VecDeque<(Qos, AckSender)>,
    publishes: HashMap<u16, AckSender>,
}

impl AckTracker {
    fn subscribe_sent(&mut self, pkid: u16) {
        if let Some(tx) = self.queued_subscribes.pop_front() {
            self.subscribes.insert(pkid, tx);
        }
    }

    fn subscribe_acked(&mut self, pkid: u16, codes: &[SubscribeReasonCode]) {
        let Some(tx) = self.subscribes.remove(&pkid) else {
            return;
        };
        let rejected = codes
            .iter()
            .filter(|code| matches!(code, SubscribeReasonCode::Failure))
            .count();
        let result = if rejected == 0 {
            Ok(())
        } else {
            Err(TransportError::Rejected(format!(
                "{} of {} filters refused by broker",
                rejected,
                codes.len()
            )))
        };
        let _ = tx.send(result);
    }

    fn publish_sent(&mut self, pkid: u16) {
        if let Some((qos, tx)) = self.queued_publishes.pop_front() {
            if qos == Qos::AtMostOnce {
                let _ = tx.send(Ok(()));
            } else {
                self.publishes.insert(pkid, tx);
            }
        }
    }

    fn publish_acked(&mut self, pkid: u16) {
        if let Some(tx) = self.publishes.remove(&pkid) {
            let _ = tx.send(Ok(()));
        }
    }

    fn fail_all(&mut self) {
        let pending = self
            .queued_subscribes
            .drain(..)
            .chain(self.subscribes.drain().map(|(_, tx)| tx))
            .chain(self.queued_publishes.drain(..).map(|(_, tx)| tx))
            .chain(self.publishes.drain().map(|(_, tx)| tx));
        for tx in pending {
            let _ = tx.send(Err(TransportError::Closed));
        }
    }
}

struct Session {
    client: AsyncClient,
    acks: Arc<Mutex<AckTracker>>,
    pump: JoinHandle<()>,
}

/// Production transport backed by rumqttc.
#[derive(Default)]
pub struct RumqttTransport {
    session: Mutex<Option<Session>>,
    /// Keeps tracker queue order identical to request order.
    request_lock: tokio::sync::Mutex<()>,
}

impl RumqttTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn options(config: &BrokerConfig) -> TransportResult<MqttOptions> {
        let endpoint = config
            .endpoint()
            .map_err(|e| TransportError::Configuration(e.to_string()))?;

        let mut options =
            MqttOptions::new(config.resolved_client_id(), endpoint.host.clone(), endpoint.port);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_clean_session(config.clean_session);

        if let Some((username, password)) = config.credentials() {
            options.set_credentials(username, password);
        }
        if endpoint.tls {
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }

        Ok(options)
    }

    fn current(&self) -> TransportResult<(AsyncClient, Arc<Mutex<AckTracker>>)> {
        self.session
            .lock()
            .as_ref()
            .map(|s| (s.client.clone(), s.acks.clone()))
            .ok_or(TransportError::NotConnected)
    }

    async fn close_session(&self) {
        let session = self.session.lock().take();
        if let Some(mut session) = session {
            let _ = session.client.disconnect().await;
            if tokio::time::timeout(Duration::from_secs(1), &mut session.pump)
                .await
                .is_err()
            {
                session.pump.abort();
            }
            session.acks.lock().fail_all();
        }
    }
}

fn connection_error(e: ConnectionError) -> TransportError {
    match e {
        ConnectionError::ConnectionRefused(code) => TransportError::Refused(format!("{:?}", code)),
        other => TransportError::Io(other.to_string()),
    }
}

/// Drive the event loop until the session ends.
async fn pump(
    mut eventloop: EventLoop,
    events: mpsc::Sender<TransportEvent>,
    acks: Arc<Mutex<AckTracker>>,
) {
    let reason = loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                    metadata: PacketMetadata {
                        qos: publish.qos.into(),
                        retain: publish.retain,
                        dup: publish.dup,
                        pkid: publish.pkid,
                        received_at: chrono::Utc::now(),
                    },
                };
                if events.send(TransportEvent::Message(message)).await.is_err() {
                    debug!("Event receiver dropped, stopping MQTT pump");
                    break None;
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                acks.lock().subscribe_acked(ack.pkid, &ack.return_codes)
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => acks.lock().publish_acked(ack.pkid),
            Ok(Event::Incoming(Packet::PubComp(ack))) => acks.lock().publish_acked(ack.pkid),
            Ok(Event::Incoming(Packet::Disconnect)) => {
                break Some("broker sent DISCONNECT".to_string())
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => acks.lock().subscribe_sent(pkid),
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => acks.lock().publish_sent(pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break None,
            Ok(_) => {}
            Err(e) => break Some(e.to_string()),
        }
    };

    acks.lock().fail_all();
    let _ = events.send(TransportEvent::Closed { reason }).await;
}

#[async_trait]
impl Transport for RumqttTransport {
    async fn connect(&self, config: &BrokerConfig) -> TransportResult<mpsc::Receiver<TransportEvent>> {
        let options = Self::options(config)?;
        self.close_session().await;

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(TransportError::Refused(format!("{:?}", ack.code)));
                    }
                    break;
                }
                Ok(_) => {}
                Err(e) => return Err(connection_error(e)),
            }
        }

        let (events_tx, events_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let acks = Arc::new(Mutex::new(AckTracker::default()));
        let pump = tokio::spawn(pump(eventloop, events_tx, acks.clone()));

        *self.session.lock() = Some(Session { client, acks, pump });
        Ok(events_rx)
    }

    async fn subscribe(&self, filters: &[SubscriptionFilter]) -> TransportResult<()> {
        if filters.is_empty() {
            return Ok(());
        }

        let (client, acks) = self.current()?;
        let (tx, rx) = oneshot::channel();
        {
            let _order = self.request_lock.lock().await;
            acks.lock().queued_subscribes.push_back(tx);
            let request = filters
                .iter()
                .map(|f| rumqttc::SubscribeFilter::new(f.topic.clone(), f.qos.into()));
            if let Err(e) = client.subscribe_many(request).await {
                acks.lock().queued_subscribes.pop_back();
                return Err(TransportError::Io(e.to_string()));
            }
        }

        rx.await.map_err(|_| TransportError::Closed)?
    }

    async fn publish(&self, message: OutboundMessage) -> TransportResult<()> {
        let (client, acks) = self.current()?;
        let (tx, rx) = oneshot::channel();
        {
            let _order = self.request_lock.lock().await;
            acks.lock().queued_publishes.push_back((message.qos, tx));
            if let Err(e) = client
                .publish(message.topic, message.qos.into(), message.retain, message.payload)
                .await
            {
                acks.lock().queued_publishes.pop_back();
                return Err(TransportError::Io(e.to_string()));
            }
        }

        rx.await.map_err(|_| TransportError::Closed)?
    }

    async fn disconnect(&self) -> TransportResult<()> {
        if self.session.lock().is_none() {
            warn!("Disconnect requested without an open MQTT session");
            return Ok(());
        }
        self.close_session().await;
        Ok(())
    }
}
