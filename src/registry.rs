//! Handler registry: (kind, version) → handler, plus bound specifications.
//!
//! Populated once at startup through explicit `register` calls, then frozen
//! behind an `Arc` and read concurrently without locking.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::SpecError;
use crate::handler::{HandlerError, TaskContext, TaskHandler};
use crate::protocol::{TaskAssignment, TaskKey, TaskResult};
use crate::spec::{self, TaskSpecification};

/// Registry of task handlers and specifications.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKey, Arc<dyn TaskHandler>>,
    specifications: HashMap<TaskKey, Arc<TaskSpecification>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler. Last write wins; the replaced handler is returned.
    pub fn register(
        &mut self,
        key: TaskKey,
        handler: Arc<dyn TaskHandler>,
    ) -> Option<Arc<dyn TaskHandler>> {
        let previous = self.handlers.insert(key.clone(), handler);
        if previous.is_some() {
            tracing::warn!(task = %key, "Replaced existing handler registration");
        } else {
            tracing::debug!(task = %key, "Registered handler");
        }
        previous
    }

    /// Bind a closure as a handler.
    pub fn register_fn<F>(&mut self, key: TaskKey, f: F) -> Option<Arc<dyn TaskHandler>>
    where
        F: Fn(&TaskAssignment, &TaskContext) -> Result<TaskResult, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.register(key, Arc::new(f))
    }

    /// Get the handler bound to a key.
    pub fn lookup(&self, key: &TaskKey) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(key).cloned()
    }

    /// Check if a handler is bound.
    pub fn contains(&self, key: &TaskKey) -> bool {
        self.handlers.contains_key(key)
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<TaskKey> {
        let mut keys: Vec<TaskKey> = self.handlers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Attach a specification. Independent of handler registration, so it may
    /// precede or follow the handler it describes.
    pub fn bind_specification(&mut self, key: TaskKey, spec: TaskSpecification) {
        tracing::debug!(task = %key, "Bound specification");
        self.specifications.insert(key, Arc::new(spec));
    }

    /// Get the specification bound to a key.
    pub fn specification(&self, key: &TaskKey) -> Option<Arc<TaskSpecification>> {
        self.specifications.get(key).cloned()
    }

    /// Load a JSON binding document and bind every entry. Returns the count bound.
    pub fn bind_specifications_from_file(&mut self, path: &Path) -> Result<usize, SpecError> {
        let bindings = spec::load_bindings(path)?;
        let count = bindings.len();
        for binding in bindings {
            self.bind_specification(binding.key(), binding.spec);
        }
        tracing::info!(path = %path.display(), count, "Loaded specification bindings");
        Ok(count)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.keys())
            .field("specifications", &self.specifications.len())
            .finish()
    }
}
