//! Message handlers and the arguments they receive.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::pattern::TopicParams;
use crate::transport::PacketMetadata;

/// Boxed future returned by a handler invocation.
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A value placed in one handler argument position.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    /// Position has no binding, or the bound parameter is not in the topic.
    Absent,
    Topic(String),
    Payload(Vec<u8>),
    Metadata(PacketMetadata),
    /// A single named wildcard value.
    Param(String),
    /// Every parameter extracted from the topic.
    Params(TopicParams),
}

impl Argument {
    pub fn is_absent(&self) -> bool {
        matches!(self, Argument::Absent)
    }

    /// Topic or parameter value as text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Argument::Topic(s) | Argument::Param(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Argument::Payload(bytes) => Some(bytes.as_slice()),
            _ => None,
        }
    }

    pub fn as_params(&self) -> Option<&TopicParams> {
        match self {
            Argument::Params(params) => Some(params),
            _ => None,
        }
    }

    pub fn as_metadata(&self) -> Option<&PacketMetadata> {
        match self {
            Argument::Metadata(metadata) => Some(metadata),
            _ => None,
        }
    }
}

/// Positional argument list passed to a handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments(Vec<Argument>);

static ABSENT: Argument = Argument::Absent;

impl Arguments {
    pub fn new(values: Vec<Argument>) -> Self {
        Self(values)
    }

    /// Argument at `index`; positions past the end read as `Absent`.
    pub fn get(&self, index: usize) -> &Argument {
        self.0.get(index).unwrap_or(&ABSENT)
    }

    pub fn topic(&self, index: usize) -> Option<&str> {
        match self.get(index) {
            Argument::Topic(topic) => Some(topic.as_str()),
            _ => None,
        }
    }

    pub fn payload(&self, index: usize) -> Option<&[u8]> {
        self.get(index).as_bytes()
    }

    pub fn param(&self, index: usize) -> Option<&str> {
        match self.get(index) {
            Argument::Param(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn params(&self, index: usize) -> Option<&TopicParams> {
        self.get(index).as_params()
    }

    pub fn metadata(&self, index: usize) -> Option<&PacketMetadata> {
        self.get(index).as_metadata()
    }

    /// Decode the payload at `index` as JSON.
    pub fn json<T: DeserializeOwned>(&self, index: usize) -> anyhow::Result<T> {
        let payload = self
            .payload(index)
            .ok_or_else(|| anyhow::anyhow!("argument {} is not a payload", index))?;
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Argument> {
        self.0.iter()
    }

    pub fn into_vec(self) -> Vec<Argument> {
        self.0
    }
}

/// Something the dispatcher can invoke with an assembled argument list.
pub trait MessageHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Type name of the object the handler is bound to, if any.
    fn owner(&self) -> Option<&str> {
        None
    }

    fn invoke(&self, args: Arguments) -> HandlerFuture;
}

/// A handler bound to an owner object.
pub struct MethodHandler<O, F> {
    owner: Arc<O>,
    name: String,
    method: F,
}

impl<O, F> MethodHandler<O, F> {
    pub fn new(owner: Arc<O>, name: impl Into<String>, method: F) -> Self {
        Self {
            owner,
            name: name.into(),
            method,
        }
    }
}

impl<O, F, Fut> MessageHandler for MethodHandler<O, F>
where
    O: Send + Sync + 'static,
    F: Fn(Arc<O>, Arguments) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn owner(&self) -> Option<&str> {
        Some(std::any::type_name::<O>())
    }

    fn invoke(&self, args: Arguments) -> HandlerFuture {
        Box::pin((self.method)(Arc::clone(&self.owner), args))
    }
}

/// A free-standing async closure handler.
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Arguments) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, args: Arguments) -> HandlerFuture {
        Box::pin((self.f)(args))
    }
}
