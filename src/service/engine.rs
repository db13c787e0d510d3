use super::image_ref::resolve_image_ref;
use super::state::{RuntimeSnapshot, RuntimeState};
use super::{ServiceContext, ServiceDefinition};
use crate::backend::{
    BackendError, ImageHandle, NetworkMode, RuntimeBackend, SandboxHandle, SandboxSpec,
    SharedBackend, Signal, UnitHandle,
};
use crate::error::{Error, Result};
use crate::readiness::{wait_ready, ProbeContext};
use crate::snapshot::{self, StartPlan};
use crate::trace;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

const MANAGED_LABEL: &str = "com.service-fixtures.managed";
const SERVICE_LABEL: &str = "com.service-fixtures.service";

const HOST_NETWORK_HOSTNAME: &str = "localhost";

/// Lifecycle engine for one dependency service.
///
/// Every transition (start, stop, restore, status checks) runs under a single
/// async lock that is held across the backend calls, so concurrent callers
/// observe each transition as atomic. Distinct services have distinct locks
/// and provision in parallel.
///
/// # Failed starts
///
/// Any failing start step triggers a compensating teardown that follows the
/// [`stop`](Self::stop) rules: the unit is removed, and the sandbox is removed
/// too unless snapshotting is enabled. The original error is returned; a
/// failure of the compensating teardown is attached with
/// [`Error::WithCleanupFailure`].
#[derive(Debug)]
pub struct Service {
    definition: ServiceDefinition,
    backend: SharedBackend,
    state: Mutex<RuntimeState>,
}

impl Service {
    pub fn new(definition: ServiceDefinition, backend: SharedBackend) -> Self {
        Self {
            definition,
            backend,
            state: Mutex::new(RuntimeState::default()),
        }
    }

    pub fn name(&self) -> &str {
        self.definition.name()
    }

    pub fn definition(&self) -> &ServiceDefinition {
        &self.definition
    }

    /// Start the service unless it is already running.
    ///
    /// The check and the start happen under one lock acquisition, so any
    /// number of concurrent callers cause at most one provisioning sequence.
    pub async fn ensure_running(&self) -> Result<()> {
        async {
            let mut state = self.state.lock().await;
            self.start_locked(&mut state).await
        }
        .instrument(self.span("ensure_running"))
        .await
    }

    /// Start the service.
    ///
    /// A running service is left alone. With a snapshot present the restore
    /// path is taken; otherwise the fresh path runs pull, create, start,
    /// readiness, setup and (when enabled) snapshot capture.
    pub async fn start(&self) -> Result<()> {
        async {
            let mut state = self.state.lock().await;
            self.start_locked(&mut state).await
        }
        .instrument(self.span("start"))
        .await
    }

    /// Stop the service. A no-op when no unit is held.
    ///
    /// Sends SIGTERM, waits up to the stop grace for the unit to exit, then
    /// force-deletes it. With snapshotting disabled the sandbox and its
    /// storage are deleted as well.
    pub async fn stop(&self) -> Result<()> {
        async {
            let mut state = self.state.lock().await;
            if state.task.is_none() {
                tracing::debug!("Service '{}' is not running, nothing to stop", self.name());
                return Ok(());
            }
            let backend = self.backend.get().await?;
            let remove_sandbox = !self.definition.snapshot_enabled();
            self.teardown_locked(&mut state, backend.as_ref(), remove_sandbox)
                .await?;
            tracing::info!("Service '{}' stopped", self.name());
            Ok(())
        }
        .instrument(self.span("stop"))
        .await
    }

    /// Whether the service's unit is running.
    ///
    /// Returns `false` without asking the backend when no unit is held.
    pub async fn is_running(&self) -> Result<bool> {
        let state = self.state.lock().await;
        self.is_running_locked(&state).await
    }

    /// Host name tests should use to reach the service.
    ///
    /// `localhost` on the host network; on a bridge network, the sandbox
    /// address reported by the backend (falling back to `localhost`).
    pub async fn hostname(&self) -> Result<String> {
        let state = self.state.lock().await;
        match state.container.as_ref() {
            Some(container) => {
                let backend = self.backend.get().await?;
                self.resolve_hostname(backend.as_ref(), container).await
            }
            None => Ok(HOST_NETWORK_HOSTNAME.to_string()),
        }
    }

    /// Discard any running unit and start a new one from the snapshot.
    ///
    /// Fails with [`Error::RestoreUnavailable`] when snapshotting is disabled
    /// or nothing has been captured yet, and with [`Error::NoContainer`] when
    /// the sandbox is gone.
    pub async fn restore(&self) -> Result<()> {
        async {
            let mut state = self.state.lock().await;
            if !self.definition.snapshot_enabled() {
                return Err(self.restore_unavailable("snapshotting is disabled"));
            }
            if state.snapshot.is_none() {
                return Err(self.restore_unavailable("no snapshot has been captured yet"));
            }
            let backend = self.backend.get().await?;
            if state.task.is_some() {
                self.teardown_locked(&mut state, backend.as_ref(), false)
                    .await?;
            }
            let plan = snapshot::plan_start(
                self.name(),
                true,
                state.container.as_ref(),
                state.snapshot.as_ref(),
            )?;
            match self.run_plan(&mut state, backend.as_ref(), plan).await {
                Ok(()) => Ok(()),
                Err(error) => Err(self.compensate(&mut state, backend.as_ref(), error).await),
            }
        }
        .instrument(self.span("restore"))
        .await
    }

    /// Full teardown: stop the unit, delete the sandbox with its storage, and
    /// forget the snapshot and the cached image.
    ///
    /// The next start after this is a fresh start, including the pull.
    pub async fn teardown(&self) -> Result<()> {
        async {
            let mut state = self.state.lock().await;
            if state.task.is_none() && state.container.is_none() {
                state.snapshot = None;
                state.image = None;
                return Ok(());
            }
            let backend = self.backend.get().await?;
            self.teardown_locked(&mut state, backend.as_ref(), true)
                .await?;
            state.snapshot = None;
            state.image = None;
            tracing::info!("Service '{}' torn down", self.name());
            Ok(())
        }
        .instrument(self.span("teardown"))
        .await
    }

    /// Copy of the current runtime handles.
    pub async fn snapshot_state(&self) -> RuntimeSnapshot {
        self.state.lock().await.to_snapshot()
    }

    fn span(&self, operation: &'static str) -> tracing::Span {
        tracing::info_span!("service", name = %self.name(), operation)
    }

    fn restore_unavailable(&self, reason: &str) -> Error {
        Error::RestoreUnavailable {
            service: self.name().to_string(),
            reason: reason.to_string(),
        }
    }

    fn readiness_timeout(&self) -> Duration {
        self.definition
            .readiness_timeout()
            .unwrap_or(self.backend.config().default_readiness_timeout)
    }

    fn stop_grace(&self) -> Duration {
        self.definition
            .stop_grace()
            .unwrap_or(self.backend.config().default_stop_grace)
    }

    async fn is_running_locked(&self, state: &RuntimeState) -> Result<bool> {
        let Some(task) = state.task.as_ref() else {
            return Ok(false);
        };
        let backend = self.backend.get().await?;
        let status = backend
            .unit_status(task)
            .await
            .map_err(|source| Error::StatusFailed {
                service: self.name().to_string(),
                source,
            })?;
        Ok(status.is_running())
    }

    async fn start_locked(&self, state: &mut RuntimeState) -> Result<()> {
        let backend = self.backend.get().await?;
        let backend = backend.as_ref();

        if let Some(task) = state.task.clone() {
            if self.is_running_locked(state).await? {
                tracing::debug!("Service '{}' already running, start is a no-op", self.name());
                return Ok(());
            }
            tracing::debug!(
                "Service '{}' unit {} has exited, removing it before starting",
                self.name(),
                task.id
            );
            self.delete_unit(backend, &task).await?;
            state.task = None;
        }

        let result = match snapshot::plan_start(
            self.name(),
            self.definition.snapshot_enabled(),
            state.container.as_ref(),
            state.snapshot.as_ref(),
        ) {
            Ok(plan) => self.run_plan(state, backend, plan).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => Ok(()),
            Err(error) => Err(self.compensate(state, backend, error).await),
        }
    }

    async fn run_plan(
        &self,
        state: &mut RuntimeState,
        backend: &dyn RuntimeBackend,
        plan: StartPlan,
    ) -> Result<()> {
        match plan {
            StartPlan::Fresh => self.fresh_start(state, backend).await,
            StartPlan::Restore { sandbox, snapshot } => {
                let unit = backend
                    .create_unit(&sandbox, self.definition.io(), Some(&snapshot))
                    .await
                    .map_err(|e| self.start_failed(e))?;
                state.task = Some(unit.clone());
                backend
                    .start_unit(&unit)
                    .await
                    .map_err(|e| self.start_failed(e))?;
                tracing::info!(
                    "Service '{}' restored from snapshot '{}'",
                    self.name(),
                    snapshot.name
                );
                Ok(())
            }
        }
    }

    async fn fresh_start(&self, state: &mut RuntimeState, backend: &dyn RuntimeBackend) -> Result<()> {
        let image = match state.image.clone() {
            Some(image) => {
                tracing::debug!("Using cached image '{}'", image.reference);
                image
            }
            None => {
                let reference = resolve_image_ref(self.definition.image());
                tracing::info!("Pulling image '{}' for service '{}'", reference, self.name());
                let image = backend.pull_image(&reference).await.map_err(|source| {
                    Error::PullFailed {
                        service: self.name().to_string(),
                        image: reference.clone(),
                        source,
                    }
                })?;
                state.image = Some(image.clone());
                image
            }
        };

        let sandbox = match state.container.clone() {
            Some(sandbox) => {
                tracing::debug!("Reusing sandbox '{}'", sandbox.id);
                sandbox
            }
            None => {
                let spec = self.sandbox_spec(image);
                let sandbox = backend.create_sandbox(&spec).await.map_err(|source| {
                    Error::ProvisionFailed {
                        service: self.name().to_string(),
                        source,
                    }
                })?;
                state.container = Some(sandbox.clone());
                sandbox
            }
        };

        let unit = backend
            .create_unit(&sandbox, self.definition.io(), None)
            .await
            .map_err(|e| self.start_failed(e))?;
        state.task = Some(unit.clone());
        backend
            .start_unit(&unit)
            .await
            .map_err(|e| self.start_failed(e))?;

        let hostname = self.resolve_hostname(backend, &sandbox).await?;

        if let Some(probe) = self.definition.readiness() {
            let timeout = self.readiness_timeout();
            tracing::debug!(
                "Waiting up to {:?} for service '{}' ({})",
                timeout,
                self.name(),
                probe.label()
            );
            let ctx = ProbeContext {
                service: self.name().to_string(),
                hostname: hostname.clone(),
                cancel: CancellationToken::new(),
            };
            wait_ready(probe, ctx, timeout)
                .await
                .into_result(self.name(), timeout)?;
        }

        if let Some(setup) = self.definition.setup() {
            let ctx = ServiceContext {
                name: self.name().to_string(),
                hostname,
                sandbox_id: sandbox.id.clone(),
            };
            setup(ctx).await.map_err(|cause| Error::SetupFailed {
                service: self.name().to_string(),
                cause,
            })?;
        }

        if self.definition.snapshot_enabled() {
            state.snapshot = Some(snapshot::capture(backend, self.name(), &unit).await?);
        }

        tracing::info!("Service '{}' started", self.name());
        Ok(())
    }

    fn sandbox_spec(&self, image: ImageHandle) -> SandboxSpec {
        let mut env = self.definition.env().to_vec();
        env.extend(trace::service_env(
            self.name(),
            self.backend.config().trace_sink.as_ref(),
        ));

        SandboxSpec {
            id: self.definition.identity().sandbox_id(self.name()),
            image,
            mounts: self.definition.mounts().to_vec(),
            env,
            network: self.definition.network(),
            labels: vec![
                (MANAGED_LABEL.to_string(), "true".to_string()),
                (SERVICE_LABEL.to_string(), self.name().to_string()),
            ],
        }
    }

    async fn resolve_hostname(
        &self,
        backend: &dyn RuntimeBackend,
        sandbox: &SandboxHandle,
    ) -> Result<String> {
        if sandbox.network == NetworkMode::Host {
            return Ok(HOST_NETWORK_HOSTNAME.to_string());
        }
        let address = backend
            .sandbox_address(sandbox)
            .await
            .map_err(|source| Error::StatusFailed {
                service: self.name().to_string(),
                source,
            })?;
        Ok(address.unwrap_or_else(|| HOST_NETWORK_HOSTNAME.to_string()))
    }

    /// Best-effort teardown after a failed start. The original error always wins.
    async fn compensate(
        &self,
        state: &mut RuntimeState,
        backend: &dyn RuntimeBackend,
        error: Error,
    ) -> Error {
        tracing::debug!(
            "Start of service '{}' failed ({}), tearing down",
            self.name(),
            error
        );
        let remove_sandbox = !self.definition.snapshot_enabled();
        match self.teardown_locked(state, backend, remove_sandbox).await {
            Ok(()) => error,
            Err(cleanup) => {
                tracing::warn!(
                    "Cleanup after failed start of service '{}' also failed: {}",
                    self.name(),
                    cleanup
                );
                error.with_cleanup(cleanup)
            }
        }
    }

    /// Terminate and delete the held unit, then optionally the sandbox with its storage.
    ///
    /// Handles are cleared only once their backend object is gone, so a
    /// failed teardown can be retried.
    async fn teardown_locked(
        &self,
        state: &mut RuntimeState,
        backend: &dyn RuntimeBackend,
        remove_sandbox: bool,
    ) -> Result<()> {
        if let Some(task) = state.task.clone() {
            self.terminate(backend, &task).await?;
            state.task = None;
        }

        if remove_sandbox {
            if let Some(container) = state.container.clone() {
                match backend.delete_sandbox(&container, true).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {
                        tracing::debug!("Sandbox '{}' already gone", container.id);
                    }
                    Err(source) => {
                        return Err(Error::StopFailed {
                            service: self.name().to_string(),
                            source,
                        })
                    }
                }
                state.container = None;
            }
        }
        Ok(())
    }

    /// SIGTERM and wait for exit, both bounded by the stop grace, then forced delete.
    async fn terminate(&self, backend: &dyn RuntimeBackend, unit: &UnitHandle) -> Result<()> {
        let grace = self.stop_grace();
        let poll_interval = self.backend.config().status_poll_interval;

        let graceful = async {
            match backend.signal_unit(unit, Signal::Term).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => tracing::warn!(
                    "Failed to signal unit {} of service '{}': {}, forcing",
                    unit.id,
                    self.name(),
                    e
                ),
            }
            wait_for_exit(backend, unit, poll_interval).await;
        };

        if tokio::time::timeout(grace, graceful).await.is_err() {
            tracing::warn!(
                "Service '{}' did not exit within {:?}, force-deleting",
                self.name(),
                grace
            );
        }

        self.delete_unit(backend, unit).await
    }

    async fn delete_unit(&self, backend: &dyn RuntimeBackend, unit: &UnitHandle) -> Result<()> {
        match backend.delete_unit(unit, true).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(source) => Err(Error::StopFailed {
                service: self.name().to_string(),
                source,
            }),
        }
    }

    fn start_failed(&self, source: BackendError) -> Error {
        Error::StartFailed {
            service: self.name().to_string(),
            source,
        }
    }
}

async fn wait_for_exit(backend: &dyn RuntimeBackend, unit: &UnitHandle, poll_interval: Duration) {
    loop {
        match backend.unit_status(unit).await {
            Ok(status) if !status.is_running() => return,
            Ok(_) => {}
            Err(e) if e.is_not_found() => return,
            Err(e) => tracing::debug!("Status check for unit {} failed: {}", unit.id, e),
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InMemoryBackend, Operation};
    use crate::config::EngineConfig;
    use crate::error::ErrorKind;
    use std::sync::Arc;

    fn service(definition: ServiceDefinition) -> (Service, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        let shared = SharedBackend::from_backend(backend.clone(), EngineConfig::default());
        (Service::new(definition, shared), backend)
    }

    #[tokio::test]
    async fn test_sandbox_gets_labels_and_trace_env() {
        let def = ServiceDefinition::builder("redis", "redis")
            .env("REDIS_ARGS", "--save ''")
            .build()
            .unwrap();
        let (svc, backend) = service(def);
        svc.start().await.unwrap();

        let env = backend.sandbox_env("redis").unwrap();
        assert!(env.contains(&("REDIS_ARGS".to_string(), "--save ''".to_string())));
        assert!(env.contains(&(trace::TRACE_SERVICE_ENV.to_string(), "redis".to_string())));
        assert_eq!(
            svc.snapshot_state().await.image.map(|i| i.reference),
            Some("docker.io/library/redis:latest".to_string())
        );
    }

    #[tokio::test]
    async fn test_start_on_running_service_is_noop() {
        let def = ServiceDefinition::builder("redis", "redis").build().unwrap();
        let (svc, backend) = service(def);
        svc.start().await.unwrap();
        svc.start().await.unwrap();
        assert_eq!(backend.calls(Operation::CreateUnit), 1);
    }

    #[tokio::test]
    async fn test_exited_unit_is_replaced_on_start() {
        let def = ServiceDefinition::builder("redis", "redis").build().unwrap();
        let (svc, backend) = service(def);
        svc.start().await.unwrap();

        let first = svc.snapshot_state().await.task.unwrap();
        backend.crash_unit(&first.id);
        assert!(!svc.is_running().await.unwrap());

        svc.ensure_running().await.unwrap();
        let second = svc.snapshot_state().await.task.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(backend.unit_ids(), vec![second.id]);
        assert_eq!(backend.calls(Operation::CreateSandbox), 1);
    }

    #[tokio::test]
    async fn test_bridge_network_resolves_sandbox_address() {
        let def = ServiceDefinition::builder("pg", "postgres")
            .network(NetworkMode::Bridge)
            .build()
            .unwrap();
        let (svc, _backend) = service(def);
        assert_eq!(svc.hostname().await.unwrap(), "localhost");

        svc.start().await.unwrap();
        assert!(svc.hostname().await.unwrap().starts_with("10.88.0."));
    }

    #[tokio::test]
    async fn test_restore_requires_snapshotting() {
        let def = ServiceDefinition::builder("pg", "postgres").build().unwrap();
        let (svc, _backend) = service(def);
        let err = svc.restore().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RestoreUnavailable);

        let def = ServiceDefinition::builder("pg", "postgres")
            .snapshot(true)
            .build()
            .unwrap();
        let (svc, _backend) = service(def);
        let err = svc.restore().await.unwrap_err();
        assert!(err.to_string().contains("no snapshot"));
    }

    #[tokio::test]
    async fn test_stop_failure_keeps_unit_handle() {
        let def = ServiceDefinition::builder("redis", "redis")
            .stop_grace(Duration::from_millis(10))
            .build()
            .unwrap();
        let (svc, backend) = service(def);
        svc.start().await.unwrap();

        backend.fail_next(Operation::DeleteUnit, "daemon busy");
        let err = svc.stop().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StopFailed);
        assert!(svc.snapshot_state().await.task.is_some());

        svc.stop().await.unwrap();
        assert!(svc.snapshot_state().await.task.is_none());
    }
}
