use super::IdentityPolicy;
use crate::backend::{IoConfig, Mount, NetworkMode};
use crate::error::{Error, Result};
use crate::readiness::ReadinessProbe;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Setup callback run once after a fresh start, before any snapshot is taken.
pub type SetupFn = Arc<dyn Fn(ServiceContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// What a setup callback gets to know about the service it prepares.
///
/// The service's own lock is held while setup runs, so the callback receives
/// this detached view instead of the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceContext {
    pub name: String,
    pub hostname: String,
    pub sandbox_id: String,
}

/// Immutable description of a dependency service.
///
/// Built once with [`ServiceDefinition::builder`] and shared freely; all
/// mutable state lives in the [`Service`](super::Service) engine.
#[derive(Clone)]
pub struct ServiceDefinition {
    name: String,
    image: String,
    mounts: Vec<Mount>,
    env: Vec<(String, String)>,
    setup: Option<SetupFn>,
    readiness: Option<ReadinessProbe>,
    readiness_timeout: Option<Duration>,
    stop_grace: Option<Duration>,
    snapshot: bool,
    network: NetworkMode,
    identity: IdentityPolicy,
    io: IoConfig,
}

impl ServiceDefinition {
    pub fn builder(name: impl Into<String>, image: impl Into<String>) -> ServiceDefinitionBuilder {
        ServiceDefinitionBuilder {
            definition: ServiceDefinition {
                name: name.into(),
                image: image.into(),
                mounts: Vec::new(),
                env: Vec::new(),
                setup: None,
                readiness: None,
                readiness_timeout: None,
                stop_grace: None,
                snapshot: false,
                network: NetworkMode::default(),
                identity: IdentityPolicy::default(),
                io: IoConfig::default(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Image reference as given, before canonicalization.
    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn setup(&self) -> Option<&SetupFn> {
        self.setup.as_ref()
    }

    pub fn readiness(&self) -> Option<&ReadinessProbe> {
        self.readiness.as_ref()
    }

    /// Readiness timeout, if set on this definition rather than inherited from the engine config.
    pub fn readiness_timeout(&self) -> Option<Duration> {
        self.readiness_timeout
    }

    pub fn stop_grace(&self) -> Option<Duration> {
        self.stop_grace
    }

    pub fn snapshot_enabled(&self) -> bool {
        self.snapshot
    }

    pub fn network(&self) -> NetworkMode {
        self.network
    }

    pub fn identity(&self) -> IdentityPolicy {
        self.identity
    }

    pub fn io(&self) -> IoConfig {
        self.io
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Error::InvalidDefinition {
            service: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("service name is empty".to_string()));
        }
        if self.image.trim().is_empty() {
            return Err(invalid("image reference is empty".to_string()));
        }
        for mount in &self.mounts {
            if mount.source.is_empty() {
                return Err(invalid(format!(
                    "mount for '{}' has an empty source",
                    mount.target
                )));
            }
            if !Path::new(&mount.target).is_absolute() {
                return Err(invalid(format!(
                    "mount target '{}' must be an absolute path",
                    mount.target
                )));
            }
        }
        for (key, _) in &self.env {
            if key.is_empty() || key.contains('=') {
                return Err(invalid(format!("invalid environment variable name '{}'", key)));
            }
        }
        if self.stop_grace == Some(Duration::ZERO) {
            tracing::debug!(
                "Service '{}' has a zero stop grace; units will be force-deleted immediately",
                self.name
            );
        }
        Ok(())
    }
}

impl fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDefinition")
            .field("name", &self.name)
            .field("image", &self.image)
            .field("mounts", &self.mounts)
            .field("env", &self.env)
            .field("setup", &self.setup.is_some())
            .field("readiness", &self.readiness)
            .field("readiness_timeout", &self.readiness_timeout)
            .field("stop_grace", &self.stop_grace)
            .field("snapshot", &self.snapshot)
            .field("network", &self.network)
            .field("identity", &self.identity)
            .finish()
    }
}

/// Builder for [`ServiceDefinition`]. Setting a field twice keeps the last value.
#[derive(Debug, Clone)]
pub struct ServiceDefinitionBuilder {
    definition: ServiceDefinition,
}

impl ServiceDefinitionBuilder {
    pub fn mount(mut self, mount: Mount) -> Self {
        self.definition.mounts.push(mount);
        self
    }

    /// Set an environment variable. Setting the same key again replaces its value.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.definition.env.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.definition.env.push((key, value)),
        }
        self
    }

    pub fn setup<F, Fut>(mut self, setup: F) -> Self
    where
        F: Fn(ServiceContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.definition.setup = Some(Arc::new(move |ctx| Box::pin(setup(ctx))));
        self
    }

    /// Readiness probe, with an optional timeout overriding the engine default.
    pub fn readiness(mut self, probe: ReadinessProbe, timeout: Option<Duration>) -> Self {
        self.definition.readiness = Some(probe);
        self.definition.readiness_timeout = timeout;
        self
    }

    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.definition.stop_grace = Some(grace);
        self
    }

    pub fn snapshot(mut self, enabled: bool) -> Self {
        self.definition.snapshot = enabled;
        self
    }

    pub fn network(mut self, network: NetworkMode) -> Self {
        self.definition.network = network;
        self
    }

    pub fn identity(mut self, identity: IdentityPolicy) -> Self {
        self.definition.identity = identity;
        self
    }

    pub fn io(mut self, io: IoConfig) -> Self {
        self.definition.io = io;
        self
    }

    pub fn build(self) -> Result<ServiceDefinition> {
        self.definition.validate()?;
        Ok(self.definition)
    }
}
