//! Startup wiring.
//!
//! One [`MqttService`] per process: it owns the connection manager, runs the
//! registration pass, seals the registry and drives the dispatcher.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::BrokerConfig;
use crate::connection::ConnectionManager;
use crate::dispatcher::{DispatchConfig, DispatchStatsSnapshot, Dispatcher};
use crate::error::Result;
use crate::publisher::{CommandPublisher, CommandPublisherConfig};
use crate::registry::{Registration, Registry};
use crate::transport::Transport;

pub struct MqttService {
    connection: Arc<ConnectionManager>,
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttService {
    /// Connect, register every declaration in order and start dispatching.
    ///
    /// A failed initial connect is returned. Declarations whose subscribe
    /// fails are logged and skipped; their handlers never receive messages.
    pub async fn start(
        config: BrokerConfig,
        transport: Arc<dyn Transport>,
        registrations: Vec<Registration>,
        dispatch: DispatchConfig,
    ) -> Result<Self> {
        let connection = ConnectionManager::new(config, transport)?;
        connection.connect().await?;

        let registry = Arc::new(Registry::new());
        let report = registry.register_all(&connection, registrations).await;
        registry.seal();
        if report.failed.is_empty() {
            info!("Registered {} subscriber entries", report.registered);
        } else {
            warn!(
                "Registered {} subscriber entries, {} declarations inactive",
                report.registered,
                report.failed.len()
            );
        }

        let messages = connection.take_messages()?;
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), dispatch));
        let dispatch_task = Arc::clone(&dispatcher).spawn(messages);

        Ok(Self {
            connection,
            registry,
            dispatcher,
            dispatch_task: Mutex::new(Some(dispatch_task)),
        })
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// A command publisher sharing this service's connection.
    pub fn publisher(&self, config: CommandPublisherConfig) -> Result<CommandPublisher> {
        CommandPublisher::new(Arc::clone(&self.connection), config)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.dispatcher.stats()
    }

    /// Disconnect and stop the dispatcher.
    ///
    /// Messages already queued are dropped.
    pub async fn shutdown(&self) -> Result<()> {
        self.connection.disconnect().await?;
        let task = self.dispatch_task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        info!("MQTT service stopped");
        Ok(())
    }
}
