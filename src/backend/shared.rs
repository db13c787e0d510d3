use super::{BackendError, DockerBackend, RuntimeBackend};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;

type ConnectFn =
    Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<Arc<dyn RuntimeBackend>, BackendError>> + Send + Sync>;

/// Shared, lazily connected handle to a runtime backend.
///
/// Construct one per test binary and hand clones to every service and
/// harness. The connect function runs at most once successfully, even when
/// many services start concurrently; a failed connect is retried on the next
/// call to [`get`](Self::get).
#[derive(Clone)]
pub struct SharedBackend {
    inner: Arc<Inner>,
}

struct Inner {
    label: String,
    config: EngineConfig,
    connect: ConnectFn,
    backend: OnceCell<Arc<dyn RuntimeBackend>>,
}

impl SharedBackend {
    /// Create a handle that connects on first use.
    pub fn new<F, Fut>(label: impl Into<String>, config: EngineConfig, connect: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Arc<dyn RuntimeBackend>, BackendError>>
            + Send
            + 'static,
    {
        let connect: ConnectFn = Arc::new(move || Box::pin(connect()));
        Self {
            inner: Arc::new(Inner {
                label: label.into(),
                config,
                connect,
                backend: OnceCell::new(),
            }),
        }
    }

    /// Wrap an already-connected backend.
    pub fn from_backend(backend: Arc<dyn RuntimeBackend>, config: EngineConfig) -> Self {
        let label = format!("{:?}", backend);
        let connect: ConnectFn = Arc::new(|| {
            Box::pin(async { Err(BackendError::other("backend was provided pre-connected")) })
        });
        Self {
            inner: Arc::new(Inner {
                label,
                config,
                connect,
                backend: OnceCell::new_with(Some(backend)),
            }),
        }
    }

    /// Docker CLI backend configured from `config`, connected on first use.
    pub fn docker(config: EngineConfig) -> Self {
        let connect_config = config.clone();
        Self::new("docker", config, move || {
            let config = connect_config.clone();
            async move {
                let backend = DockerBackend::connect(config).await?;
                Ok(Arc::new(backend) as Arc<dyn RuntimeBackend>)
            }
        })
    }

    /// Docker backend configured from `FIXTURES_*` environment variables.
    pub fn docker_from_env() -> Result<Self> {
        Ok(Self::docker(EngineConfig::from_env()?))
    }

    /// Get the connected backend, connecting if this is the first use.
    pub async fn get(&self) -> Result<Arc<dyn RuntimeBackend>> {
        let backend = self
            .inner
            .backend
            .get_or_try_init(|| async {
                tracing::debug!("Connecting to runtime backend '{}'", self.inner.label);
                (self.inner.connect)().await
            })
            .await
            .map_err(|e| {
                Error::BackendUnavailable(format!("{} ({})", e, self.inner.label))
            })?;
        Ok(Arc::clone(backend))
    }

    pub fn is_connected(&self) -> bool {
        self.inner.backend.initialized()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }
}

impl fmt::Debug for SharedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBackend")
            .field("label", &self.inner.label)
            .field("connected", &self.is_connected())
            .finish()
    }
}
