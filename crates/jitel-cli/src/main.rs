//! Command-line interface for the Jitel MQTT dispatcher.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jitel_mqtt::{
    collect_registrations, Arguments, BrokerConfig, CommandPublisher, CommandPublisherConfig,
    ConnectionManager, DispatchConfig, MqttService, Registration, RumqttTransport,
    SubscriptionProvider,
};
use tracing::{info, warn};

/// Jitel MQTT dispatcher.
#[derive(Parser, Debug)]
#[command(name = "jitel")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Connect and log device telemetry and status traffic until Ctrl-C.
    Serve {
        /// Run each handler invocation on its own task.
        #[arg(long)]
        concurrent: bool,
    },
    /// Publish a single command to a node and exit.
    Command {
        /// Target node id.
        #[arg(short, long)]
        node: String,
        /// Gateway the node sits behind.
        #[arg(short, long)]
        gateway: Option<String>,
        /// Command body as JSON.
        #[arg(short, long)]
        data: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Serve { concurrent } => run_serve(concurrent).await,
        Command::Command {
            node,
            gateway,
            data,
        } => run_command(&node, gateway.as_deref(), &data).await,
    }
}

fn init_logging(verbose: bool) {
    // JSON output for container environments
    let json_logging = std::env::var("JITEL_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if verbose {
        "jitel=debug,jitel_mqtt=debug"
    } else {
        "jitel=info,jitel_mqtt=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(default_level).add_directive(tracing::Level::WARN.into())
    });

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .init();
    }
}

async fn run_serve(concurrent: bool) -> Result<()> {
    let config = BrokerConfig::from_env()?;
    let namespace = CommandPublisherConfig::from_env().namespace;
    let monitor = Arc::new(TelemetryMonitor::new(namespace));
    let providers: Vec<Arc<dyn SubscriptionProvider>> = vec![monitor.clone()];

    let dispatch = if concurrent {
        DispatchConfig::concurrent()
    } else {
        DispatchConfig::default()
    };
    let service = MqttService::start(
        config,
        Arc::new(RumqttTransport::new()),
        collect_registrations(providers),
        dispatch,
    )
    .await
    .context("failed to start MQTT service")?;

    info!("Jitel dispatcher running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    let stats = service.stats();
    info!(
        delivered = stats.delivered,
        missed = stats.missed,
        failed = stats.failed,
        telemetry = monitor.telemetry_count(),
        status = monitor.status_count(),
        "Shutting down"
    );
    service.shutdown().await?;
    Ok(())
}

async fn run_command(node: &str, gateway: Option<&str>, data: &str) -> Result<()> {
    let data: serde_json::Value =
        serde_json::from_str(data).context("command data must be valid JSON")?;

    let connection =
        ConnectionManager::new(BrokerConfig::from_env()?, Arc::new(RumqttTransport::new()))?;
    let topic = send_command(
        connection,
        CommandPublisherConfig::from_env(),
        gateway,
        node,
        &data,
    )
    .await?;
    info!("Command published to {}", topic);
    Ok(())
}

/// Publish one command over a fresh session and close it again.
///
/// The topic is resolved before connecting, so bad ids never open a session.
async fn send_command(
    connection: Arc<ConnectionManager>,
    config: CommandPublisherConfig,
    gateway: Option<&str>,
    node: &str,
    data: &serde_json::Value,
) -> Result<String> {
    let publisher = CommandPublisher::new(connection.clone(), config)?;
    let topic = publisher.command_topic(gateway, node)?;

    connection.connect().await?;
    let result = publisher.publish_command(gateway, node, data).await;
    connection.disconnect().await?;

    result?;
    Ok(topic)
}

/// Logs device telemetry and status messages under the command namespace.
struct TelemetryMonitor {
    namespace: String,
    telemetry: AtomicU64,
    status: AtomicU64,
}

impl TelemetryMonitor {
    fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            telemetry: AtomicU64::new(0),
            status: AtomicU64::new(0),
        }
    }

    fn telemetry_count(&self) -> u64 {
        self.telemetry.load(Ordering::Relaxed)
    }

    fn status_count(&self) -> u64 {
        self.status.load(Ordering::Relaxed)
    }

    /// Arguments: node id, gateway id, payload, metadata.
    async fn on_telemetry(self: Arc<Self>, args: Arguments) -> Result<()> {
        self.telemetry.fetch_add(1, Ordering::Relaxed);
        let body: serde_json::Value = args.json(2)?;
        let received_at = args
            .metadata(3)
            .map(|m| m.received_at)
            .unwrap_or_else(chrono::Utc::now);
        info!(
            node = args.param(0).unwrap_or("?"),
            gateway = args.param(1).unwrap_or("-"),
            received_at = %received_at.to_rfc3339(),
            "Telemetry: {}",
            body
        );
        Ok(())
    }

    /// Arguments: node id, payload.
    async fn on_status(self: Arc<Self>, args: Arguments) -> Result<()> {
        self.status.fetch_add(1, Ordering::Relaxed);
        let status = args
            .payload(1)
            .map(String::from_utf8_lossy)
            .unwrap_or_default();
        if status.is_empty() {
            warn!(node = args.param(0).unwrap_or("?"), "Empty status message");
        } else {
            info!(node = args.param(0).unwrap_or("?"), "Status: {}", status);
        }
        Ok(())
    }
}

impl SubscriptionProvider for TelemetryMonitor {
    fn subscriptions(self: Arc<Self>) -> Vec<Registration> {
        let ns = self.namespace.clone();
        vec![
            Registration::method(
                format!("{}/+gatewayId/+nodeId/telemetry", ns),
                self.clone(),
                "on_telemetry",
                TelemetryMonitor::on_telemetry,
            )
            .also(format!("{}/+nodeId/telemetry", ns))
            .param(0, "nodeId")
            .param(1, "gatewayId")
            .payload(2)
            .metadata(3),
            Registration::method(
                format!("{}/+nodeId/status", ns),
                self,
                "on_status",
                TelemetryMonitor::on_status,
            )
            .param(0, "nodeId")
            .payload(1),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jitel_mqtt::{DispatchOutcome, Dispatcher, InboundMessage, MemoryTransport, Registry};

    #[test]
    fn test_parse_command() {
        let args = Args::try_parse_from([
            "jitel", "command", "--node", "N1", "--gateway", "G1", "--data", r#"{"x":1}"#,
        ])
        .unwrap();
        match args.command {
            Command::Command {
                node,
                gateway,
                data,
            } => {
                assert_eq!(node, "N1");
                assert_eq!(gateway.as_deref(), Some("G1"));
                assert_eq!(data, r#"{"x":1}"#);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_serve_verbose() {
        let args = Args::try_parse_from(["jitel", "serve", "-v"]).unwrap();
        assert!(args.verbose);
        assert!(matches!(args.command, Command::Serve { concurrent: false }));
    }

    #[test]
    fn test_command_requires_node() {
        assert!(Args::try_parse_from(["jitel", "command", "--data", "{}"]).is_err());
    }

    #[tokio::test]
    async fn test_monitor_routes_both_telemetry_topics() {
        let connection =
            ConnectionManager::new(BrokerConfig::default(), Arc::new(MemoryTransport::new()))
                .unwrap();
        connection.connect().await.unwrap();

        let monitor = Arc::new(TelemetryMonitor::new("JI/v2"));
        let providers: Vec<Arc<dyn SubscriptionProvider>> = vec![monitor.clone()];
        let registry = Arc::new(Registry::new());
        registry
            .register_all(&connection, collect_registrations(providers))
            .await;
        assert_eq!(
            registry.compiled_topics(),
            vec!["JI/v2/+/+/telemetry", "JI/v2/+/telemetry", "JI/v2/+/status"]
        );

        let dispatcher = Dispatcher::new(registry, DispatchConfig::default());
        let outcome = dispatcher
            .dispatch(InboundMessage::new("JI/v2/G1/N1/telemetry", br#"{"t":1}"#.to_vec()))
            .await;
        assert!(matches!(outcome, DispatchOutcome::Delivered { .. }));
        dispatcher
            .dispatch(InboundMessage::new("JI/v2/N2/telemetry", br#"{"t":2}"#.to_vec()))
            .await;
        dispatcher
            .dispatch(InboundMessage::new("JI/v2/N2/status", b"online".to_vec()))
            .await;

        assert_eq!(monitor.telemetry_count(), 2);
        assert_eq!(monitor.status_count(), 1);
    }

    #[tokio::test]
    async fn test_send_command_rejects_bad_node_before_connecting() {
        let transport = Arc::new(MemoryTransport::new());
        let connection = ConnectionManager::new(BrokerConfig::default(), transport.clone()).unwrap();

        let result = send_command(
            connection.clone(),
            CommandPublisherConfig::default(),
            Some("G1"),
            "a/b",
            &serde_json::json!({"x": 1}),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(transport.connect_count(), 0);
        assert!(!transport.is_open());
        assert!(!connection.is_connected());
    }

    #[tokio::test]
    async fn test_send_command_closes_session() {
        let transport = Arc::new(MemoryTransport::new());
        let connection = ConnectionManager::new(BrokerConfig::default(), transport.clone()).unwrap();

        let topic = send_command(
            connection,
            CommandPublisherConfig::default(),
            Some("G1"),
            "N1",
            &serde_json::json!({"x": 1}),
        )
        .await
        .unwrap();
        assert_eq!(topic, "JI/v2/G1/N1/command");
        assert_eq!(transport.published().len(), 1);
        assert_eq!(transport.published()[0].topic, topic);
        assert!(!transport.is_open());
    }
}
