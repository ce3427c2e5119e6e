//! Subscriber registration.
//!
//! Handlers are declared as [`Registration`] values, usually produced by a
//! [`SubscriptionProvider`], and registered once at startup. The registry is
//! append-only until [`Registry::seal`] and read-only afterwards. Lookup
//! walks entries in registration order and the first matching pattern wins.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::connection::ConnectionManager;
use crate::error::{MqttError, Result};
use crate::handler::{Arguments, FnHandler, MessageHandler, MethodHandler};
use crate::pattern::{TopicParams, TopicPattern};
use crate::transport::{Qos, SubscriptionFilter};

/// What a handler argument position receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgKind {
    /// The raw topic string.
    Topic,
    /// The raw payload bytes.
    Payload,
    /// Protocol metadata of the publish packet.
    Metadata,
    /// One named parameter, or all parameters when no key is given.
    Param(Option<String>),
}

/// Binding of one argument position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterBinding {
    pub index: usize,
    pub kind: ArgKind,
}

/// Argument bindings keyed by position; at most one per position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings(BTreeMap<usize, ArgKind>);

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `index`, replacing any earlier binding for it.
    pub fn bind(&mut self, index: usize, kind: ArgKind) {
        self.0.insert(index, kind);
    }

    pub fn get(&self, index: usize) -> Option<&ArgKind> {
        self.0.get(&index)
    }

    /// Bindings in position order.
    pub fn iter(&self) -> impl Iterator<Item = ParameterBinding> + '_ {
        self.0.iter().map(|(index, kind)| ParameterBinding {
            index: *index,
            kind: kind.clone(),
        })
    }

    /// One past the highest bound position.
    pub fn arity(&self) -> usize {
        self.0.keys().next_back().map_or(0, |index| index + 1)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn param_keys(&self) -> impl Iterator<Item = &str> {
        self.0.values().filter_map(|kind| match kind {
            ArgKind::Param(Some(key)) => Some(key.as_str()),
            _ => None,
        })
    }
}

impl FromIterator<ParameterBinding> for Bindings {
    fn from_iter<I: IntoIterator<Item = ParameterBinding>>(iter: I) -> Self {
        let mut bindings = Bindings::new();
        for binding in iter {
            bindings.bind(binding.index, binding.kind);
        }
        bindings
    }
}

/// Options passed with the subscribe request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeOptions {
    #[serde(default)]
    pub qos: Qos,
}

/// A handler declaration waiting to be registered.
#[derive(Clone)]
pub struct Registration {
    patterns: Vec<String>,
    options: SubscribeOptions,
    bindings: Bindings,
    arity: Option<usize>,
    handler: Arc<dyn MessageHandler>,
}

impl Registration {
    pub fn new(pattern: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            patterns: vec![pattern.into()],
            options: SubscribeOptions::default(),
            bindings: Bindings::new(),
            arity: None,
            handler,
        }
    }

    /// Declare a handler bound to `owner`.
    pub fn method<O, F, Fut>(
        pattern: impl Into<String>,
        owner: Arc<O>,
        name: impl Into<String>,
        method: F,
    ) -> Self
    where
        O: Send + Sync + 'static,
        F: Fn(Arc<O>, Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::new(pattern, Arc::new(MethodHandler::new(owner, name, method)))
    }

    /// Declare a free-standing async closure handler.
    pub fn handler<F, Fut>(pattern: impl Into<String>, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::new(pattern, Arc::new(FnHandler::new(name, f)))
    }

    /// Route an additional pattern to the same handler.
    pub fn also(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    pub fn qos(mut self, qos: Qos) -> Self {
        self.options.qos = qos;
        self
    }

    pub fn options(mut self, options: SubscribeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn bind(mut self, index: usize, kind: ArgKind) -> Self {
        self.bindings.bind(index, kind);
        self
    }

    pub fn topic(self, index: usize) -> Self {
        self.bind(index, ArgKind::Topic)
    }

    pub fn payload(self, index: usize) -> Self {
        self.bind(index, ArgKind::Payload)
    }

    pub fn metadata(self, index: usize) -> Self {
        self.bind(index, ArgKind::Metadata)
    }

    pub fn param(self, index: usize, key: impl Into<String>) -> Self {
        self.bind(index, ArgKind::Param(Some(key.into())))
    }

    /// Bind the whole parameter map to `index`.
    pub fn params(self, index: usize) -> Self {
        self.bind(index, ArgKind::Param(None))
    }

    /// Declare the handler's argument count when it exceeds the bound positions.
    pub fn arity(mut self, arity: usize) -> Self {
        self.arity = Some(arity);
        self
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn handler_name(&self) -> &str {
        self.handler.name()
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("patterns", &self.patterns)
            .field("options", &self.options)
            .field("bindings", &self.bindings)
            .field("handler", &self.handler.name())
            .finish()
    }
}

/// Supplies handler declarations for the startup registration pass.
pub trait SubscriptionProvider: Send + Sync + 'static {
    fn subscriptions(self: Arc<Self>) -> Vec<Registration>;
}

/// Gather declarations from providers in the order given.
///
/// Combined with first-match-wins, this order decides which handler receives
/// a topic matched by more than one pattern.
pub fn collect_registrations(providers: Vec<Arc<dyn SubscriptionProvider>>) -> Vec<Registration> {
    providers
        .into_iter()
        .flat_map(|provider| provider.subscriptions())
        .collect()
}

/// A registered handler.
pub struct SubscriberEntry {
    pattern: TopicPattern,
    bindings: Bindings,
    arity: usize,
    options: SubscribeOptions,
    handler: Arc<dyn MessageHandler>,
}

impl SubscriberEntry {
    pub fn pattern(&self) -> &TopicPattern {
        &self.pattern
    }

    pub fn compiled_topic(&self) -> &str {
        self.pattern.compiled_topic()
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    /// Size of the argument list the handler receives.
    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn options(&self) -> SubscribeOptions {
        self.options
    }

    pub fn handler(&self) -> &Arc<dyn MessageHandler> {
        &self.handler
    }

    pub fn handler_name(&self) -> &str {
        self.handler.name()
    }

    pub fn owner(&self) -> Option<&str> {
        self.handler.owner()
    }
}

impl fmt::Debug for SubscriberEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberEntry")
            .field("pattern", &self.pattern.as_str())
            .field("topic", &self.compiled_topic())
            .field("arity", &self.arity)
            .field("handler", &self.handler.name())
            .finish()
    }
}

/// Outcome of registering a batch of declarations.
#[derive(Debug, Default)]
pub struct RegistrationReport {
    /// Entries added.
    pub registered: usize,
    /// Handler name and error for each declaration that stayed inert.
    pub failed: Vec<(String, MqttError)>,
}

/// Ordered collection of subscriber entries.
#[derive(Default)]
pub struct Registry {
    entries: RwLock<Vec<Arc<SubscriberEntry>>>,
    sealed: AtomicBool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile, subscribe and append a declaration.
    ///
    /// All patterns are compiled before anything is sent; the compiled
    /// topics go out in one subscribe call. If the broker does not
    /// acknowledge it, nothing is appended and the handler stays inert.
    /// Returns the number of entries added.
    pub async fn register(
        &self,
        connection: &ConnectionManager,
        registration: Registration,
    ) -> Result<usize> {
        if self.is_sealed() {
            return Err(MqttError::RegistrySealed);
        }

        let Registration {
            patterns,
            options,
            bindings,
            arity,
            handler,
        } = registration;

        let compiled = patterns
            .iter()
            .map(|pattern| TopicPattern::compile(pattern))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for pattern in &compiled {
            for key in bindings.param_keys() {
                if !pattern.param_names().any(|name| name == key) {
                    warn!(
                        pattern = %pattern,
                        handler = handler.name(),
                        "Parameter '{}' is not bound by the pattern and will be absent",
                        key
                    );
                }
            }
        }

        let filters: Vec<SubscriptionFilter> = compiled
            .iter()
            .map(|pattern| SubscriptionFilter::new(pattern.compiled_topic(), options.qos))
            .collect();

        if let Err(e) = connection.subscribe(&filters).await {
            error!(handler = handler.name(), "Subscribe failed, handler is inactive: {}", e);
            return Err(e);
        }

        let arity = arity.unwrap_or(0).max(bindings.arity());
        let mut entries = self.entries.write();
        if self.is_sealed() {
            // Sealed while the subscribe was in flight. Nothing will serve
            // these filters after a reconnect.
            drop(entries);
            connection.forget(&filters);
            warn!(
                handler = handler.name(),
                "Registry sealed during registration, subscription discarded"
            );
            return Err(MqttError::RegistrySealed);
        }
        for pattern in compiled {
            info!(
                "Subscribe to: {} with handler {}",
                pattern.compiled_topic(),
                handler.name()
            );
            entries.push(Arc::new(SubscriberEntry {
                pattern,
                bindings: bindings.clone(),
                arity,
                options,
                handler: handler.clone(),
            }));
        }
        Ok(patterns.len())
    }

    /// Register declarations in order, logging and skipping failures.
    pub async fn register_all(
        &self,
        connection: &ConnectionManager,
        registrations: impl IntoIterator<Item = Registration>,
    ) -> RegistrationReport {
        let mut report = RegistrationReport::default();
        for registration in registrations {
            let name = registration.handler_name().to_string();
            match self.register(connection, registration).await {
                Ok(added) => report.registered += added,
                Err(e) => {
                    warn!(handler = %name, "Registration skipped: {}", e);
                    report.failed.push((name, e));
                }
            }
        }
        report
    }

    /// End the registration phase.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// First entry, in registration order, whose pattern matches `topic`.
    pub fn first_match(&self, topic: &str) -> Option<(Arc<SubscriberEntry>, TopicParams)> {
        self.entries.read().iter().find_map(|entry| {
            entry
                .pattern
                .extract(topic)
                .map(|params| (entry.clone(), params))
        })
    }

    pub fn entries(&self) -> Vec<Arc<SubscriberEntry>> {
        self.entries.read().clone()
    }

    pub fn compiled_topics(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .map(|entry| entry.compiled_topic().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::transport::{
        MemoryTransport, OutboundMessage, Transport, TransportEvent, TransportResult,
    };
    use tokio::sync::mpsc;

    fn noop(pattern: &str, name: &str) -> Registration {
        Registration::handler(pattern, name, |_args: Arguments| async {
            Ok::<_, anyhow::Error>(())
        })
    }

    async fn connected(transport: Arc<MemoryTransport>) -> Arc<ConnectionManager> {
        let manager = ConnectionManager::new(BrokerConfig::default(), transport).unwrap();
        manager.connect().await.unwrap();
        manager
    }

    #[test]
    fn test_last_binding_per_index_wins() {
        let registration = noop("a/+id", "h").payload(0).param(0, "id").topic(2);
        assert_eq!(
            registration.bindings.get(0),
            Some(&ArgKind::Param(Some("id".to_string())))
        );
        assert_eq!(registration.bindings.arity(), 3);
        assert_eq!(registration.bindings.len(), 2);
    }

    #[tokio::test]
    async fn test_register_subscribes_compiled_topics() {
        let transport = Arc::new(MemoryTransport::new());
        let connection = connected(transport.clone()).await;
        let registry = Registry::new();

        let added = registry
            .register(
                &connection,
                noop("JI/v2/+gatewayId/+nodeId/telemetry", "telemetry")
                    .also("JI/v2/+nodeId/telemetry")
                    .qos(Qos::AtLeastOnce),
            )
            .await
            .unwrap();

        assert_eq!(added, 2);
        assert_eq!(
            transport.subscribe_log(),
            vec![vec![
                "JI/v2/+/+/telemetry".to_string(),
                "JI/v2/+/telemetry".to_string()
            ]]
        );
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.entries()[0].options().qos, Qos::AtLeastOnce);
    }

    #[tokio::test]
    async fn test_invalid_pattern_sends_nothing() {
        let transport = Arc::new(MemoryTransport::new());
        let connection = connected(transport.clone()).await;
        let registry = Registry::new();

        let result = registry
            .register(&connection, noop("a/+x", "h").also("a/#/b"))
            .await;
        assert!(matches!(result, Err(MqttError::InvalidPattern(_))));
        assert!(transport.subscribe_log().is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_subscribe_leaves_entry_out() {
        let transport = Arc::new(MemoryTransport::new());
        transport.reject_filter("denied/+");
        let connection = connected(transport.clone()).await;
        let registry = Registry::new();

        let report = registry
            .register_all(
                &connection,
                vec![noop("denied/+id", "denied"), noop("allowed/+id", "allowed")],
            )
            .await;

        assert_eq!(report.registered, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "denied");
        assert_eq!(registry.compiled_topics(), vec!["allowed/+".to_string()]);
        assert!(registry.first_match("denied/1").is_none());
    }

    #[tokio::test]
    async fn test_first_match_in_registration_order() {
        let transport = Arc::new(MemoryTransport::new());
        let connection = connected(transport).await;
        let registry = Registry::new();

        registry
            .register_all(
                &connection,
                vec![noop("dev/+id/status", "specific"), noop("dev/#", "catch_all")],
            )
            .await;

        let (entry, params) = registry.first_match("dev/N1/status").unwrap();
        assert_eq!(entry.handler_name(), "specific");
        assert_eq!(params.get("id"), Some("N1"));

        let (entry, _) = registry.first_match("dev/N1/telemetry").unwrap();
        assert_eq!(entry.handler_name(), "catch_all");
        assert!(registry.first_match("other/N1").is_none());
    }

    #[tokio::test]
    async fn test_sealed_registry_refuses() {
        let transport = Arc::new(MemoryTransport::new());
        let connection = connected(transport.clone()).await;
        let registry = Registry::new();
        registry.seal();

        let result = registry.register(&connection, noop("a/+b", "h")).await;
        assert!(matches!(result, Err(MqttError::RegistrySealed)));
        assert!(transport.subscribe_log().is_empty());
    }

    /// Seals the registry as soon as the broker acknowledges a subscribe.
    struct SealOnAck {
        inner: MemoryTransport,
        registry: Arc<Registry>,
    }

    #[async_trait::async_trait]
    impl Transport for SealOnAck {
        async fn connect(
            &self,
            config: &BrokerConfig,
        ) -> TransportResult<mpsc::Receiver<TransportEvent>> {
            self.inner.connect(config).await
        }

        async fn subscribe(&self, filters: &[SubscriptionFilter]) -> TransportResult<()> {
            self.inner.subscribe(filters).await?;
            self.registry.seal();
            Ok(())
        }

        async fn publish(&self, message: OutboundMessage) -> TransportResult<()> {
            self.inner.publish(message).await
        }

        async fn disconnect(&self) -> TransportResult<()> {
            self.inner.disconnect().await
        }
    }

    #[tokio::test]
    async fn test_seal_during_subscribe_leaves_no_replay_filter() {
        let registry = Arc::new(Registry::new());
        let transport = Arc::new(SealOnAck {
            inner: MemoryTransport::new(),
            registry: registry.clone(),
        });
        let connection = ConnectionManager::new(BrokerConfig::default(), transport.clone()).unwrap();
        connection.connect().await.unwrap();

        let result = registry.register(&connection, noop("late/+id", "late")).await;
        assert!(matches!(result, Err(MqttError::RegistrySealed)));
        assert_eq!(transport.inner.subscribe_log().len(), 1);
        assert!(registry.is_empty());
        assert!(connection.subscribed_topics().is_empty());
    }

    #[tokio::test]
    async fn test_register_requires_connection() {
        let connection =
            ConnectionManager::new(BrokerConfig::default(), Arc::new(MemoryTransport::new()))
                .unwrap();
        let registry = Registry::new();
        let result = registry.register(&connection, noop("a/+b", "h")).await;
        assert!(matches!(result, Err(MqttError::NotConnected)));
    }

    #[test]
    fn test_explicit_arity() {
        let registration = noop("a", "h").payload(0).arity(4);
        assert_eq!(registration.arity, Some(4));
    }

    struct Provider;

    impl SubscriptionProvider for Provider {
        fn subscriptions(self: Arc<Self>) -> Vec<Registration> {
            vec![noop("p/+x", "first"), noop("p/#", "second")]
        }
    }

    #[test]
    fn test_collect_preserves_order() {
        let providers: Vec<Arc<dyn SubscriptionProvider>> = vec![Arc::new(Provider)];
        let names: Vec<_> = collect_registrations(providers)
            .iter()
            .map(|r| r.handler_name().to_string())
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }
}
