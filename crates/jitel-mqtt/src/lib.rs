//! Topic-routed MQTT dispatch for Jitel devices.
//!
//! Handlers declare the topic patterns they serve with named wildcards
//! (`JI/v2/+gatewayId/+nodeId/telemetry`). At startup every declaration is
//! compiled to a broker filter and subscribed through the single
//! [`ConnectionManager`]; afterwards each inbound message is routed to the
//! first matching handler with its arguments bound from the topic, payload
//! and packet metadata. [`CommandPublisher`] sends commands the other way.
//!
//! ```no_run
//! use std::sync::Arc;
//! use jitel_mqtt::{
//!     Arguments, BrokerConfig, DispatchConfig, MqttService, Registration, RumqttTransport,
//! };
//!
//! # async fn run() -> jitel_mqtt::Result<()> {
//! let status = Registration::handler("JI/v2/+nodeId/status", "status", |args: Arguments| async move {
//!     tracing::info!(node = ?args.param(0), "status update");
//!     Ok::<_, anyhow::Error>(())
//! })
//! .param(0, "nodeId")
//! .payload(1);
//!
//! let service = MqttService::start(
//!     BrokerConfig::from_env()?,
//!     Arc::new(RumqttTransport::new()),
//!     vec![status],
//!     DispatchConfig::default(),
//! )
//! .await?;
//! service.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod pattern;
pub mod publisher;
pub mod registry;
pub mod service;
pub mod transport;

pub use config::{env_vars, BrokerConfig, BrokerEndpoint};
pub use connection::{ConnectionManager, ConnectionState, PublishOptions};
pub use dispatcher::{
    DispatchConfig, DispatchMode, DispatchOutcome, DispatchStatsSnapshot, Dispatcher,
};
pub use error::{MqttError, Result};
pub use handler::{Argument, Arguments, FnHandler, HandlerFuture, MessageHandler, MethodHandler};
pub use pattern::{PatternError, Segment, TopicParams, TopicPattern};
pub use publisher::{CommandPublisher, CommandPublisherConfig};
pub use registry::{
    collect_registrations, ArgKind, Bindings, ParameterBinding, Registration, RegistrationReport,
    Registry, SubscribeOptions, SubscriberEntry, SubscriptionProvider,
};
pub use service::MqttService;
pub use transport::{
    InboundMessage, PacketMetadata, Qos, RumqttTransport, Transport, TransportError,
    TransportEvent,
};

#[cfg(any(test, feature = "testing"))]
pub use transport::MemoryTransport;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
