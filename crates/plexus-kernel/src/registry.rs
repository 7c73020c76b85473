//! Component registry.
//!
//! The registry holds every attached component keyed by its
//! [`Component::name`].  It is read on every message fan-out and written only
//! when components attach or are removed, so it is backed by [`DashMap`]:
//! lock-free concurrent reads and fine-grained write locking, safe to share
//! across tasks without a global `RwLock`.
//!
//! # Example
//!
//! ```rust,ignore
//! let registry = ComponentRegistry::new();
//! registry.register(Arc::new(storage));
//! assert!(registry.contains("Storage"));
//! ```

use std::sync::Arc;

use dashmap::DashMap;

use crate::component::{Component, Service};
use crate::error::{KernelError, Result};

/// Concurrent component registry backed by [`DashMap`].
///
/// The registry is cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    inner: Arc<DashMap<String, Arc<dyn Component>>>,
}

impl ComponentRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component under its name.
    ///
    /// A component with the same name is replaced and returned.
    pub fn register(&self, component: Arc<dyn Component>) -> Option<Arc<dyn Component>> {
        let name = component.name().to_string();
        tracing::info!(component = %name, route = %component.route(), "component registered");
        self.inner.insert(name, component)
    }

    /// Remove a component from the registry.
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Component>> {
        let removed = self.inner.remove(name).map(|(_, c)| c);
        if removed.is_some() {
            tracing::info!(component = %name, "component unregistered");
        }
        removed
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Component>> {
        self.inner
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| KernelError::ComponentNotFound {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    /// Snapshot of every registered component.
    ///
    /// The fan-out works on a snapshot so no map guard is held while
    /// messages are delivered.
    pub fn snapshot(&self) -> Vec<Arc<dyn Component>> {
        self.inner.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Return a list of all registered component names.
    pub fn names(&self) -> Vec<String> {
        self.inner.iter().map(|e| e.key().clone()).collect()
    }

    /// Return the total number of registered components.
    pub fn count(&self) -> usize {
        self.inner.len()
    }
}

impl Service for ComponentRegistry {
    fn add_component(&self, component: Arc<dyn Component>) {
        self.register(component);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
