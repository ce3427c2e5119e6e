//! Inbound message dispatch.
//!
//! Each message goes to the first registered entry whose pattern matches its
//! topic. Arguments are assembled from the entry's bindings and the handler
//! is invoked in isolation: an error or a panic is logged and counted, and
//! the loop moves on to the next message.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use crate::handler::{Argument, Arguments};
use crate::pattern::TopicParams;
use crate::registry::{ArgKind, Registry, SubscriberEntry};
use crate::transport::InboundMessage;

/// How handler invocations are scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Await each handler before taking the next message.
    #[default]
    Sequential,
    /// Run each invocation on its own task. No ordering between invocations.
    Concurrent,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub mode: DispatchMode,
}

impl DispatchConfig {
    pub fn concurrent() -> Self {
        Self {
            mode: DispatchMode::Concurrent,
        }
    }
}

/// Result of dispatching one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler ran to completion.
    Delivered { handler: String },
    /// The handler was started on its own task.
    Spawned { handler: String },
    /// The handler returned an error or panicked.
    Failed { handler: String, error: String },
    /// No registered pattern matches the topic.
    Miss,
}

impl DispatchOutcome {
    pub fn handler(&self) -> Option<&str> {
        match self {
            Self::Delivered { handler } | Self::Spawned { handler } | Self::Failed { handler, .. } => {
                Some(handler.as_str())
            }
            Self::Miss => None,
        }
    }
}

/// Dispatch counters.
#[derive(Debug, Default)]
pub struct DispatchStats {
    delivered: AtomicU64,
    missed: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStatsSnapshot {
    pub delivered: u64,
    pub missed: u64,
    pub failed: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            missed: self.missed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Routes inbound messages to registered handlers.
pub struct Dispatcher {
    registry: Arc<Registry>,
    config: DispatchConfig,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, config: DispatchConfig) -> Self {
        Self {
            registry,
            config,
            stats: Arc::new(DispatchStats::default()),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }

    /// Dispatch messages in arrival order until the channel closes.
    pub async fn run(&self, mut messages: mpsc::Receiver<InboundMessage>) {
        info!(
            entries = self.registry.len(),
            mode = ?self.config.mode,
            "Message dispatcher started"
        );
        while let Some(message) = messages.recv().await {
            self.dispatch(message).await;
        }
        info!("Message dispatcher stopped");
    }

    /// Run the dispatch loop on its own task.
    pub fn spawn(self: Arc<Self>, messages: mpsc::Receiver<InboundMessage>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(messages).await })
    }

    /// Dispatch a single message to the first matching handler.
    pub async fn dispatch(&self, message: InboundMessage) -> DispatchOutcome {
        let Some((entry, params)) = self.registry.first_match(&message.topic) else {
            self.stats.missed.fetch_add(1, Ordering::Relaxed);
            debug!(topic = %message.topic, "No handler matches topic, dropping message");
            return DispatchOutcome::Miss;
        };

        let handler = entry.handler_name().to_string();
        trace!(topic = %message.topic, handler = %handler, "Dispatching message");
        let args = assemble(&entry, &message, &params);

        match self.config.mode {
            DispatchMode::Sequential => {
                invoke(entry, message.topic, args, Arc::clone(&self.stats)).await
            }
            DispatchMode::Concurrent => {
                let stats = Arc::clone(&self.stats);
                tokio::spawn(invoke(entry, message.topic, args, stats));
                DispatchOutcome::Spawned { handler }
            }
        }
    }
}

/// Build the argument list for `entry` from a matched message.
///
/// The list always has `entry.arity()` positions; unbound positions and
/// parameters the topic did not supply are [`Argument::Absent`].
pub fn assemble(
    entry: &SubscriberEntry,
    message: &InboundMessage,
    params: &TopicParams,
) -> Arguments {
    let mut values = vec![Argument::Absent; entry.arity()];
    for binding in entry.bindings().iter() {
        let value = match &binding.kind {
            ArgKind::Topic => Argument::Topic(message.topic.clone()),
            ArgKind::Payload => Argument::Payload(message.payload.clone()),
            ArgKind::Metadata => Argument::Metadata(message.metadata.clone()),
            ArgKind::Param(Some(key)) => params
                .get(key)
                .map(|value| Argument::Param(value.to_string()))
                .unwrap_or(Argument::Absent),
            ArgKind::Param(None) => Argument::Params(params.clone()),
        };
        if let Some(slot) = values.get_mut(binding.index) {
            *slot = value;
        }
    }
    Arguments::new(values)
}

async fn invoke(
    entry: Arc<SubscriberEntry>,
    topic: String,
    args: Arguments,
    stats: Arc<DispatchStats>,
) -> DispatchOutcome {
    let handler = entry.handler_name().to_string();
    let call = {
        let entry = Arc::clone(&entry);
        async move { entry.handler().invoke(args).await }
    };

    let error = match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(())) => {
            stats.delivered.fetch_add(1, Ordering::Relaxed);
            return DispatchOutcome::Delivered { handler };
        }
        Ok(Err(e)) => {
            error!(topic = %topic, handler = %handler, "Handler failed: {:#}", e);
            format!("{:#}", e)
        }
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            error!(topic = %topic, handler = %handler, "Handler panicked: {}", reason);
            format!("panicked: {}", reason)
        }
    };
    stats.failed.fetch_add(1, Ordering::Relaxed);
    DispatchOutcome::Failed { handler, error }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::connection::ConnectionManager;
    use crate::registry::Registration;
    use crate::transport::MemoryTransport;

    async fn registry_with(registrations: Vec<Registration>) -> Arc<Registry> {
        let connection =
            ConnectionManager::new(BrokerConfig::default(), Arc::new(MemoryTransport::new()))
                .unwrap();
        connection.connect().await.unwrap();
        let registry = Arc::new(Registry::new());
        let report = registry.register_all(&connection, registrations).await;
        assert!(report.failed.is_empty());
        registry.seal();
        registry
    }

    #[tokio::test]
    async fn test_assemble_binds_positions() {
        let registry = registry_with(vec![Registration::handler(
            "JI/v2/+gatewayId/+nodeId/telemetry",
            "telemetry",
            |_args: Arguments| async { Ok::<_, anyhow::Error>(()) },
        )
        .payload(0)
        .param(1, "nodeId")
        .param(2, "missing")
        .params(3)
        .topic(5)])
        .await;

        let message = InboundMessage::new("JI/v2/G1/N1/telemetry", br#"{"t":20}"#.to_vec());
        let (entry, params) = registry.first_match(&message.topic).unwrap();
        let args = assemble(&entry, &message, &params);

        assert_eq!(args.len(), 6);
        assert_eq!(args.payload(0), Some(&br#"{"t":20}"#[..]));
        assert_eq!(args.param(1), Some("N1"));
        assert!(args.get(2).is_absent());
        assert_eq!(args.params(3).and_then(|p| p.get("gatewayId")), Some("G1"));
        assert!(args.get(4).is_absent());
        assert_eq!(args.topic(5), Some("JI/v2/G1/N1/telemetry"));
    }

    #[tokio::test]
    async fn test_miss_is_counted() {
        let registry = registry_with(vec![]).await;
        let dispatcher = Dispatcher::new(registry, DispatchConfig::default());

        let outcome = dispatcher.dispatch(InboundMessage::new("x/y", b"".to_vec())).await;
        assert_eq!(outcome, DispatchOutcome::Miss);
        assert_eq!(dispatcher.stats().missed, 1);
    }

    #[tokio::test]
    async fn test_error_and_panic_are_isolated() {
        let registry = registry_with(vec![
            Registration::handler("fail/+id", "failing", |_args: Arguments| async {
                Err::<(), _>(anyhow::anyhow!("bad payload"))
            }),
            Registration::handler("panic/+id", "panicking", |args: Arguments| async move {
                if args.is_empty() {
                    panic!("boom");
                }
                Ok::<_, anyhow::Error>(())
            }),
            Registration::handler("ok/+id", "ok", |_args: Arguments| async {
                Ok::<_, anyhow::Error>(())
            }),
        ])
        .await;
        let dispatcher = Dispatcher::new(registry, DispatchConfig::default());

        let failed = dispatcher.dispatch(InboundMessage::new("fail/1", b"".to_vec())).await;
        assert!(matches!(
            failed,
            DispatchOutcome::Failed { ref handler, ref error } if handler == "failing" && error.contains("bad payload")
        ));

        let panicked = dispatcher.dispatch(InboundMessage::new("panic/1", b"".to_vec())).await;
        assert!(matches!(
            panicked,
            DispatchOutcome::Failed { ref error, .. } if error.contains("boom")
        ));

        let ok = dispatcher.dispatch(InboundMessage::new("ok/1", b"".to_vec())).await;
        assert_eq!(
            ok,
            DispatchOutcome::Delivered {
                handler: "ok".to_string()
            }
        );

        let stats = dispatcher.stats();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.delivered, 1);
    }

    #[tokio::test]
    async fn test_concurrent_mode_spawns() {
        let (tx, mut rx) = mpsc::channel::<String>(4);
        let registry = registry_with(vec![Registration::handler(
            "c/+id",
            "concurrent",
            move |args: Arguments| {
                let tx = tx.clone();
                async move {
                    let id = args.param(0).unwrap_or_default().to_string();
                    tx.send(id).await?;
                    Ok::<_, anyhow::Error>(())
                }
            },
        )
        .param(0, "id")])
        .await;
        let dispatcher = Dispatcher::new(registry, DispatchConfig::concurrent());

        let outcome = dispatcher.dispatch(InboundMessage::new("c/7", b"".to_vec())).await;
        assert_eq!(outcome.handler(), Some("concurrent"));
        assert!(matches!(outcome, DispatchOutcome::Spawned { .. }));
        assert_eq!(rx.recv().await.as_deref(), Some("7"));
    }

    #[test]
    fn test_mode_from_config() {
        let config: DispatchConfig = serde_json::from_str(r#"{"mode":"concurrent"}"#).unwrap();
        assert_eq!(config.mode, DispatchMode::Concurrent);
        let config: DispatchConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.mode, DispatchMode::Sequential);
    }
}
