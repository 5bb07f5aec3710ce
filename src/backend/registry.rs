//! Backend registry and dispatch.
//!
//! Model names map to backends by exact, case-sensitive match. There is no
//! default backend: an unknown name is an error and nothing is invoked.

use crate::backend::{Backend, CommandBackend};
use crate::models::{Batch, Config, MaskflowError, ModelSpec, Result, RunResult};
use crate::pool::WorkerPool;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Registry of model backends.
///
/// Thread-safe: backends are wrapped in `Arc<dyn Backend>` for shared access.
///
/// # Example
///
/// ```ignore
/// use maskflow::{BackendRegistry, Config};
///
/// let config = Config::from_file("maskflow.toml".as_ref())?;
/// let registry = BackendRegistry::from_config(&config);
/// let result = registry.dispatch(&model, &batch).await?;
/// ```
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a command backend for every configured (or built-in) entry.
    ///
    /// Each backend gets its own worker pool of `workers.size` permits and
    /// forwards `run.executor` to the commands it launches.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        for (name, backend_config) in config.backend_configs() {
            let backend = CommandBackend::new(
                name.clone(),
                backend_config,
                WorkerPool::new(config.workers.size),
                config.run.executor.clone(),
            );
            registry.register(name, Arc::new(backend));
        }
        debug!(backends = ?registry.names(), "Backend registry built");
        registry
    }

    /// Register a backend, replacing any previous one with the same name.
    pub fn register(&mut self, name: impl Into<String>, backend: Arc<dyn Backend>) {
        self.backends.insert(name.into(), backend);
    }

    /// Get backend by exact model name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Backend>> {
        self.backends.get(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// Backend registered for `model.name`, or `UnsupportedModel`.
    pub fn require(&self, model: &ModelSpec) -> Result<&Arc<dyn Backend>> {
        self.get(&model.name)
            .ok_or_else(|| MaskflowError::UnsupportedModel {
                model: model.name.clone(),
                available: self.names(),
            })
    }

    /// Hand the whole batch to the backend registered for `model.name`.
    pub async fn dispatch(&self, model: &ModelSpec, batch: &Batch) -> Result<RunResult> {
        let backend = self.require(model)?;

        info!(
            backend = backend.name(),
            variant = %model.variant,
            records = batch.len(),
            output_dir = %batch.output_dir.display(),
            "Dispatching batch"
        );
        backend.run(batch).await
    }
}
