//! Runtime backend registry for selecting backends by name.
//!
//! The model builder resolves its backend through this registry, so new
//! backends can be added from any crate without the pipeline knowing their
//! concrete types. `"cpu"` is registered on first use.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use vole_core::{Backend, BackendConfig, Error, Result};
use vole_cpu::CpuBackend;

/// Factory that builds a configured backend instance.
/// Shared so a factory can run after the registry lock is released.
pub type BackendFactory = Arc<dyn Fn(&BackendConfig) -> Result<Box<dyn Backend>> + Send + Sync>;

/// Name → factory table behind the global registry.
struct BackendRegistry {
    backends: RwLock<HashMap<String, BackendFactory>>,
}

impl BackendRegistry {
    fn with_defaults() -> Self {
        let mut backends: HashMap<String, BackendFactory> = HashMap::new();
        backends.insert(
            vole_cpu::BACKEND_NAME.to_string(),
            Arc::new(|config| Ok(Box::new(CpuBackend::from_config(config)?) as Box<dyn Backend>)),
        );
        Self {
            backends: RwLock::new(backends),
        }
    }

    fn register(&self, name: String, factory: BackendFactory) {
        self.backends
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, factory);
    }

    fn create(&self, name: &str, config: &BackendConfig) -> Result<Box<dyn Backend>> {
        let factory = self
            .backends
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::InvalidBackendName(name.to_string()))?;
        factory(config)
    }

    fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .backends
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn contains(&self, name: &str) -> bool {
        self.backends
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }
}

static GLOBAL_REGISTRY: OnceLock<BackendRegistry> = OnceLock::new();

fn global_registry() -> &'static BackendRegistry {
    GLOBAL_REGISTRY.get_or_init(BackendRegistry::with_defaults)
}

/// Register a backend factory under `name`, replacing any previous one.
///
/// # Example
/// ```ignore
/// vole::registry::register_backend("my_backend", |config| {
///     Ok(Box::new(MyBackend::from_config(config)?))
/// });
/// ```
pub fn register_backend<F>(name: impl Into<String>, factory: F)
where
    F: Fn(&BackendConfig) -> Result<Box<dyn Backend>> + Send + Sync + 'static,
{
    let name = name.into();
    tracing::debug!(backend = %name, "registered backend");
    global_registry().register(name, Arc::new(factory));
}

/// Create a configured backend instance.
///
/// Unknown names fail with `InvalidBackendName`; configuration problems are
/// reported by the backend's factory.
pub fn create_backend(name: &str, config: &BackendConfig) -> Result<Box<dyn Backend>> {
    global_registry().create(name, config)
}

/// All registered backend names, sorted.
pub fn list_backends() -> Vec<String> {
    global_registry().list()
}

pub fn has_backend(name: &str) -> bool {
    global_registry().contains(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vole_core::ErrorKind;

    #[test]
    fn test_cpu_is_registered() {
        assert!(has_backend("cpu"));
        assert!(list_backends().contains(&"cpu".to_string()));
        let backend = create_backend("cpu", &BackendConfig::default()).unwrap();
        assert_eq!(backend.name(), "cpu");
    }

    #[test]
    fn test_unknown_backend() {
        let err = create_backend("nonexistent", &BackendConfig::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidBackendName);
        assert_eq!(err.to_string(), "invalid backend name: 'nonexistent'");
    }

    #[test]
    fn test_register_custom_backend() {
        register_backend("cpu-alias", |config| {
            Ok(Box::new(CpuBackend::from_config(config)?) as Box<dyn Backend>)
        });
        assert!(has_backend("cpu-alias"));
        let config = BackendConfig::parse("cpu-alias", r#"{"num_threads": 0}"#).unwrap();
        let err = create_backend("cpu-alias", &config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailedToConfigureOperator);
    }

    #[test]
    fn test_factory_may_register_backends() {
        register_backend("cpu-lazy", |config| {
            register_backend("cpu-lazy-child", |config| {
                Ok(Box::new(CpuBackend::from_config(config)?) as Box<dyn Backend>)
            });
            Ok(Box::new(CpuBackend::from_config(config)?) as Box<dyn Backend>)
        });
        let backend = create_backend("cpu-lazy", &BackendConfig::default()).unwrap();
        assert_eq!(backend.name(), "cpu");
        assert!(has_backend("cpu-lazy-child"));
    }
}
