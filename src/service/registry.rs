use super::{Service, ServiceDefinition};
use crate::backend::SharedBackend;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;

/// Process-level cache of service engines, keyed by service name.
///
/// Tests that share a registry share engines, and with them the cached image,
/// sandbox and snapshot of each service. Construct one per test binary
/// (typically in a `OnceLock` in a shared test module).
#[derive(Debug)]
pub struct ServiceRegistry {
    backend: SharedBackend,
    services: Mutex<Vec<(String, Arc<Service>)>>,
}

impl ServiceRegistry {
    pub fn new(backend: SharedBackend) -> Self {
        Self {
            backend,
            services: Mutex::new(Vec::new()),
        }
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    /// The engine registered under `definition.name()`, creating it on first use.
    ///
    /// A later call with a different definition under the same name gets the
    /// existing engine; the new definition is ignored.
    pub fn get_or_create(&self, definition: ServiceDefinition) -> Arc<Service> {
        let mut services = self.services.lock();
        if let Some((_, existing)) = services.iter().find(|(name, _)| name == definition.name()) {
            return Arc::clone(existing);
        }
        tracing::debug!("Registering service '{}'", definition.name());
        let name = definition.name().to_string();
        let service = Arc::new(Service::new(definition, self.backend.clone()));
        services.push((name, Arc::clone(&service)));
        service
    }

    pub fn get(&self, name: &str) -> Option<Arc<Service>> {
        self.services
            .lock()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, service)| Arc::clone(service))
    }

    pub fn len(&self) -> usize {
        self.services.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.lock().is_empty()
    }

    /// Stop every registered service, in registration order.
    ///
    /// Keeps going after a failure; all failures are returned together.
    pub async fn stop_all(&self) -> Result<()> {
        let services: Vec<Arc<Service>> = self
            .services
            .lock()
            .iter()
            .map(|(_, service)| Arc::clone(service))
            .collect();

        let mut errors = Vec::new();
        for service in services {
            if let Err(e) = service.stop().await {
                tracing::warn!("Failed to stop service '{}': {}", service.name(), e);
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::CleanupFailed(errors))
        }
    }
}
