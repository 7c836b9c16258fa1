//! Endpoint dispatch: method lookup, argument binding, result streams.
//!
//! The session engine only knows [`DispatcherFactory`] and
//! [`EndpointDispatcher`]. [`MethodRegistry`] is the stock implementation:
//! a map from method name to [`MethodHandler`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use rxrpc_core::RpcError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::scope::EndpointScope;

/// Lazily produced results of one invocation.
pub type ResultStream = BoxStream<'static, Result<Value, RpcError>>;

/// Named arguments of one subscription, decoded on demand.
#[derive(Clone, Debug, Default)]
pub struct InvocationArguments {
    values: BTreeMap<String, Value>,
}

impl InvocationArguments {
    /// Wrap encoded arguments.
    pub fn new(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }

    /// Decode argument `name` as `T`.
    ///
    /// Fails with `Argument {name} not found` when absent, or with a decode
    /// error when the value does not fit `T`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, RpcError> {
        let value = self
            .values
            .get(name)
            .ok_or_else(|| RpcError::invalid_params(format!("Argument {name} not found")))?;
        decode(name, value)
    }

    /// Decode argument `name` as `T`, treating absence (or `null`) as `None`.
    pub fn get_optional<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, RpcError> {
        match self.values.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => decode(name, value).map(Some),
        }
    }

    /// Whether argument `name` was supplied.
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Number of supplied arguments.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no arguments were supplied.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn decode<T: DeserializeOwned>(name: &str, value: &Value) -> Result<T, RpcError> {
    T::deserialize(value)
        .map_err(|e| RpcError::invalid_params(format!("Argument {name} could not be decoded: {e}")))
}

/// Resolves a method call into a result stream.
pub trait EndpointDispatcher: Send + Sync {
    /// Start `method`. Errors returned here are setup errors: the stream
    /// was never created.
    fn dispatch(&self, method: &str, arguments: &InvocationArguments)
    -> Result<ResultStream, RpcError>;
}

/// Creates dispatchers bound to a session's endpoint scope.
pub trait DispatcherFactory: Send + Sync + 'static {
    /// Build a dispatcher for one subscription on the session owning `scope`.
    fn create(&self, scope: &Arc<EndpointScope>) -> Result<Box<dyn EndpointDispatcher>, RpcError>;
}

/// Handler for a single method.
pub trait MethodHandler: Send + Sync {
    /// Bind arguments, resolve endpoint state, and return the result stream.
    fn invoke(
        &self,
        arguments: &InvocationArguments,
        scope: &EndpointScope,
    ) -> Result<ResultStream, RpcError>;
}

/// Adapts a plain function or closure to [`MethodHandler`].
struct FnHandler<F>(F);

impl<F> MethodHandler for FnHandler<F>
where
    F: Fn(&InvocationArguments, &EndpointScope) -> Result<ResultStream, RpcError> + Send + Sync,
{
    fn invoke(
        &self,
        arguments: &InvocationArguments,
        scope: &EndpointScope,
    ) -> Result<ResultStream, RpcError> {
        (self.0)(arguments, scope)
    }
}

type Handlers = HashMap<String, Arc<dyn MethodHandler>>;

/// Registry mapping method names to handlers.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    handlers: Arc<Handlers>,
}

impl MethodRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a method name, replacing any previous one.
    pub fn register(&mut self, method: &str, handler: impl MethodHandler + 'static) {
        let _ = Arc::make_mut(&mut self.handlers).insert(method.to_owned(), Arc::new(handler));
    }

    /// Register a function or closure for a method name.
    pub fn register_fn<F>(&mut self, method: &str, handler: F)
    where
        F: Fn(&InvocationArguments, &EndpointScope) -> Result<ResultStream, RpcError>
            + Send
            + Sync
            + 'static,
    {
        self.register(method, FnHandler(handler));
    }

    /// List all registered method names (sorted).
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check whether a method is registered.
    pub fn has_method(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }
}

impl DispatcherFactory for MethodRegistry {
    fn create(&self, scope: &Arc<EndpointScope>) -> Result<Box<dyn EndpointDispatcher>, RpcError> {
        Ok(Box::new(ScopedDispatcher {
            handlers: Arc::clone(&self.handlers),
            scope: Arc::clone(scope),
        }))
    }
}

struct ScopedDispatcher {
    handlers: Arc<Handlers>,
    scope: Arc<EndpointScope>,
}

impl EndpointDispatcher for ScopedDispatcher {
    fn dispatch(
        &self,
        method: &str,
        arguments: &InvocationArguments,
    ) -> Result<ResultStream, RpcError> {
        let handler = self
            .handlers
            .get(method)
            .ok_or_else(|| RpcError::MethodNotFound {
                method: method.to_owned(),
            })?;
        handler.invoke(arguments, &self.scope)
    }
}

// ── Result stream helpers ───────────────────────────────────────────

/// Serialize an endpoint value for the wire.
pub fn to_value<T: Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value)
        .map_err(|e| RpcError::internal(format!("failed to serialize result: {e}")))
}

/// A stream producing one value and completing.
pub fn single<T: Serialize>(value: T) -> ResultStream {
    stream::once(futures::future::ready(to_value(value))).boxed()
}

/// A stream producing every item of `values` and completing.
pub fn from_iter<T, I>(values: I) -> ResultStream
where
    T: Serialize + 'static,
    I: IntoIterator<Item = T>,
    I::IntoIter: Send + 'static,
{
    stream::iter(values).map(to_value).boxed()
}

/// A stream completing without values.
pub fn empty() -> ResultStream {
    stream::empty().boxed()
}

/// A stream failing immediately with `error`.
pub fn failed(error: RpcError) -> ResultStream {
    stream::once(futures::future::ready(Err(error))).boxed()
}
