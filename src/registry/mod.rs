//! 模型注册表 — 根据配置加载后端，并按名称解析与分发
//!
//! Model registry. Owns every configured backend, resolves model names, wraps a
//! backend in a chain on request, and frees everything at shutdown.
//!
//! The name map is written once while loading and only read while serving, so
//! lookups take no lock.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendFactory};
use crate::chain::{ChainRegistry, ChainedBackend};
use crate::config::ModelDescriptor;
use crate::{Error, ErrorContext, Result};

#[derive(Debug, Default)]
pub struct ModelRegistry {
    backends: HashMap<String, Arc<dyn Backend>>,
}

impl ModelRegistry {
    /// Build and initialize a backend for every descriptor.
    ///
    /// Fail-fast: the first failure aborts the load, backends built so far are freed,
    /// and the error comes back as [`Error::Configuration`].
    pub async fn load(descriptors: &[ModelDescriptor], factory: &BackendFactory) -> Result<Self> {
        let mut registry = Self::default();
        for desc in descriptors {
            let built = if registry.backends.contains_key(&desc.name) {
                Err(duplicate(&desc.name))
            } else {
                factory
                    .create(desc)
                    .await
                    .map_err(|e| as_configuration(&desc.name, e))
            };
            match built {
                Ok(backend) => {
                    info!(model = %desc.name, kind = %backend.kind(), "model loaded");
                    registry.backends.insert(desc.name.clone(), backend);
                }
                Err(e) => {
                    warn!(
                        model = %desc.name,
                        error = %e,
                        "model load failed, releasing loaded models"
                    );
                    registry.free().await;
                    return Err(e);
                }
            }
        }
        Ok(registry)
    }

    /// Registry over already-constructed backends.
    pub fn from_backends(backends: Vec<Arc<dyn Backend>>) -> Result<Self> {
        let mut map = HashMap::with_capacity(backends.len());
        for backend in backends {
            let name = backend.name().to_string();
            if map.insert(name.clone(), backend).is_some() {
                return Err(duplicate(&name));
            }
        }
        Ok(Self { backends: map })
    }

    /// The backend serving `name`; the same `Arc` on every call.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Backend>> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| Error::model_not_found(name))
    }

    /// Resolve `name` and wrap it in a fresh instance of `chain` when one is registered.
    ///
    /// An unknown chain name falls back to the raw backend.
    pub fn dispatch(
        &self,
        name: &str,
        chain: Option<&str>,
        chains: &ChainRegistry,
    ) -> Result<Arc<dyn Backend>> {
        let backend = self.resolve(name)?;
        let Some(chain_name) = chain.filter(|c| !c.is_empty()) else {
            return Ok(backend);
        };
        match chains.create(chain_name) {
            Some(instance) => {
                debug!(model = name, chain = chain_name, "dispatching through chain");
                Ok(Arc::new(ChainedBackend::new(instance, backend)))
            }
            None => {
                debug!(model = name, chain = chain_name, "unknown chain, using raw backend");
                Ok(backend)
            }
        }
    }

    /// Free every backend. Failures are logged and teardown continues.
    pub async fn free(&self) {
        for (name, backend) in &self.backends {
            if let Err(e) = backend.free().await {
                warn!(model = %name, error = %e, "failed to free backend");
            }
        }
    }

    /// Snapshot of the configured names, unordered.
    pub fn list(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

fn duplicate(name: &str) -> Error {
    Error::configuration_with_context(
        format!("duplicate model '{}'", name),
        ErrorContext::new().with_field_path("models").with_source("model_registry"),
    )
}

fn as_configuration(name: &str, e: Error) -> Error {
    match e {
        Error::Configuration { .. } => e,
        other => Error::configuration_with_context(
            format!("failed to initialize '{}'", name),
            ErrorContext::new()
                .with_details(other.to_string())
                .with_source("model_registry"),
        ),
    }
}
