//! Session-scoped endpoint instances.
//!
//! Each session owns one [`EndpointScope`]. Dispatchers resolve stateful
//! endpoint objects through it, so two subscriptions on the same session
//! share an instance while other sessions get their own. The scope is
//! dropped when the session is torn down.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use parking_lot::Mutex;
use rxrpc_core::RpcError;

type Instance = Arc<dyn Any + Send + Sync>;

/// Type-keyed container of endpoint instances.
#[derive(Default)]
pub struct EndpointScope {
    instances: Mutex<HashMap<TypeId, Instance>>,
}

impl EndpointScope {
    /// Create an empty scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the instance of `T`, creating it on first use.
    pub fn resolve<T, F>(&self, create: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        match self.try_resolve::<T, std::convert::Infallible, _>(|| Ok(create())) {
            Ok(instance) => instance,
            Err(never) => match never {},
        }
    }

    /// Get the instance of `T`, creating it with a fallible constructor.
    ///
    /// The constructor runs outside the lock and may itself resolve other
    /// types. If two callers race, the first insertion wins.
    pub fn try_resolve<T, E, F>(&self, create: F) -> Result<Arc<T>, E>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<T, E>,
    {
        if let Some(existing) = self.get::<T>() {
            return Ok(existing);
        }

        let created: Instance = Arc::new(create()?);
        let stored = Arc::clone(
            self.instances
                .lock()
                .entry(TypeId::of::<T>())
                .or_insert(created),
        );
        Ok(downcast(stored))
    }

    /// Resolve an endpoint instance for a dispatcher.
    ///
    /// A failed constructor surfaces as [`RpcError::NotAvailable`] naming
    /// the endpoint type.
    pub fn resolve_endpoint<T, E, F>(&self, create: F) -> Result<Arc<T>, RpcError>
    where
        T: Any + Send + Sync,
        E: Display,
        F: FnOnce() -> Result<T, E>,
    {
        self.try_resolve(create).map_err(|e| {
            RpcError::not_available(format!(
                "Endpoint {} is not available: {e}",
                short_type_name::<T>()
            ))
        })
    }

    /// Get the instance of `T` if it was already created.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let stored = self.instances.lock().get(&TypeId::of::<T>()).cloned()?;
        Some(downcast(stored))
    }

    /// Number of live instances.
    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    /// Whether no instance was created yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

fn downcast<T: Any + Send + Sync>(instance: Instance) -> Arc<T> {
    match instance.downcast::<T>() {
        Ok(typed) => typed,
        // Entries are keyed by `TypeId::of::<T>()`, so the stored value is a `T`.
        Err(_) => unreachable!("endpoint scope entry has mismatched type"),
    }
}
