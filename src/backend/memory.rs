//! Deterministic in-process backend.
//!
//! Used by this crate's own tests and exported so test authors can exercise
//! setup callbacks and readiness probes without a container runtime. Every
//! operation is counted, and failures, delays and stubborn units can be
//! scripted per operation.

use super::{
    BackendError, ImageHandle, IoConfig, NetworkMode, RuntimeBackend, SandboxHandle, SandboxSpec,
    Signal, SnapshotHandle, UnitHandle, UnitStatus,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

/// Backend operations, for counting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Pull,
    CreateSandbox,
    CreateUnit,
    StartUnit,
    SignalUnit,
    DeleteUnit,
    UnitStatus,
    SnapshotUnit,
    DeleteSandbox,
}

#[derive(Debug, Clone)]
struct SandboxRecord {
    spec: SandboxSpec,
    address: Option<String>,
}

#[derive(Debug, Clone)]
struct UnitRecord {
    sandbox_id: String,
    status: UnitStatus,
}

#[derive(Debug, Default)]
struct State {
    calls: HashMap<Operation, usize>,
    failures: HashMap<Operation, VecDeque<String>>,
    delays: HashMap<Operation, Duration>,
    ignore_termination: bool,
    sandboxes: HashMap<String, SandboxRecord>,
    units: HashMap<String, UnitRecord>,
    snapshots: HashSet<String>,
    signals: Vec<(String, Signal)>,
    next_id: u64,
}

/// In-memory [`RuntimeBackend`] with call counters and scripted failures.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    state: Mutex<State>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times `op` was invoked (including failed invocations).
    pub fn calls(&self, op: Operation) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Make the next invocation of `op` fail with `message`. Queues if called repeatedly.
    pub fn fail_next(&self, op: Operation, message: impl Into<String>) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(message.into());
    }

    /// Delay every invocation of `op` by `delay` before it takes effect.
    pub fn set_delay(&self, op: Operation, delay: Duration) {
        self.state.lock().delays.insert(op, delay);
    }

    /// Make units ignore graceful termination signals (only `Kill` or forced delete stops them).
    pub fn ignore_termination(&self, ignore: bool) {
        self.state.lock().ignore_termination = ignore;
    }

    /// Simulate a unit exiting on its own.
    pub fn crash_unit(&self, unit_id: &str) {
        if let Some(unit) = self.state.lock().units.get_mut(unit_id) {
            unit.status = UnitStatus::Stopped;
        }
    }

    pub fn sandbox_exists(&self, sandbox_id: &str) -> bool {
        self.state.lock().sandboxes.contains_key(sandbox_id)
    }

    pub fn sandbox_count(&self) -> usize {
        self.state.lock().sandboxes.len()
    }

    /// Environment a sandbox was created with.
    pub fn sandbox_env(&self, sandbox_id: &str) -> Option<Vec<(String, String)>> {
        self.state
            .lock()
            .sandboxes
            .get(sandbox_id)
            .map(|s| s.spec.env.clone())
    }

    /// Ids of units that currently exist, running or not.
    pub fn unit_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().units.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn running_units(&self) -> usize {
        self.state
            .lock()
            .units
            .values()
            .filter(|u| u.status.is_running())
            .count()
    }

    /// Signals delivered so far, as (unit id, signal).
    pub fn signals(&self) -> Vec<(String, Signal)> {
        self.state.lock().signals.clone()
    }

    /// Count the call, apply any scripted delay, then pop a scripted failure.
    async fn enter(&self, op: Operation) -> Result<(), BackendError> {
        let delay = {
            let mut state = self.state.lock();
            *state.calls.entry(op).or_insert(0) += 1;
            state.delays.get(&op).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self
            .state
            .lock()
            .failures
            .get_mut(&op)
            .and_then(VecDeque::pop_front);
        match failure {
            Some(message) => Err(BackendError::other(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RuntimeBackend for InMemoryBackend {
    async fn pull_image(&self, reference: &str) -> Result<ImageHandle, BackendError> {
        self.enter(Operation::Pull).await?;
        Ok(ImageHandle {
            reference: reference.to_string(),
            id: Some(format!("sha256:{:016x}", crate::service::fnv1a_64(reference.as_bytes()))),
        })
    }

    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<SandboxHandle, BackendError> {
        self.enter(Operation::CreateSandbox).await?;
        let mut state = self.state.lock();
        if state.sandboxes.contains_key(&spec.id) {
            return Err(BackendError::other(format!(
                "sandbox name '{}' is already in use",
                spec.id
            )));
        }
        state.next_id += 1;
        let address = match spec.network {
            NetworkMode::Host => None,
            NetworkMode::Bridge => Some(format!("10.88.0.{}", state.next_id % 250 + 2)),
        };
        state.sandboxes.insert(
            spec.id.clone(),
            SandboxRecord {
                spec: spec.clone(),
                address,
            },
        );
        Ok(SandboxHandle {
            id: spec.id.clone(),
            image: spec.image.reference.clone(),
            network: spec.network,
        })
    }

    async fn create_unit(
        &self,
        sandbox: &SandboxHandle,
        _io: IoConfig,
        snapshot: Option<&SnapshotHandle>,
    ) -> Result<UnitHandle, BackendError> {
        self.enter(Operation::CreateUnit).await?;
        let mut state = self.state.lock();
        if !state.sandboxes.contains_key(&sandbox.id) {
            return Err(BackendError::not_found(&sandbox.id));
        }
        if let Some(snapshot) = snapshot {
            if !state.snapshots.contains(&snapshot.name) {
                return Err(BackendError::not_found(&snapshot.name));
            }
        }
        state.next_id += 1;
        let id = format!("{}-task-{}", sandbox.id, state.next_id);
        state.units.insert(
            id.clone(),
            UnitRecord {
                sandbox_id: sandbox.id.clone(),
                status: UnitStatus::Created,
            },
        );
        Ok(UnitHandle {
            id,
            sandbox_id: sandbox.id.clone(),
            restored_from: snapshot.map(|s| s.name.clone()),
        })
    }

    async fn start_unit(&self, unit: &UnitHandle) -> Result<(), BackendError> {
        self.enter(Operation::StartUnit).await?;
        let mut state = self.state.lock();
        let record = state
            .units
            .get_mut(&unit.id)
            .ok_or_else(|| BackendError::not_found(&unit.id))?;
        match record.status {
            UnitStatus::Created => {
                record.status = UnitStatus::Running;
                Ok(())
            }
            other => Err(BackendError::other(format!(
                "unit {} cannot be started from state {}",
                unit.id, other
            ))),
        }
    }

    async fn signal_unit(&self, unit: &UnitHandle, signal: Signal) -> Result<(), BackendError> {
        self.enter(Operation::SignalUnit).await?;
        let mut state = self.state.lock();
        let ignore = state.ignore_termination && signal != Signal::Kill;
        let record = state
            .units
            .get_mut(&unit.id)
            .ok_or_else(|| BackendError::not_found(&unit.id))?;
        if !ignore && record.status.is_running() {
            record.status = UnitStatus::Stopped;
        }
        state.signals.push((unit.id.clone(), signal));
        Ok(())
    }

    async fn delete_unit(&self, unit: &UnitHandle, force: bool) -> Result<(), BackendError> {
        self.enter(Operation::DeleteUnit).await?;
        let mut state = self.state.lock();
        let running = state.units.get(&unit.id).map(|u| u.status.is_running());
        match running {
            None => Err(BackendError::not_found(&unit.id)),
            Some(true) if !force => Err(BackendError::other(format!(
                "unit {} is still running",
                unit.id
            ))),
            Some(_) => {
                state.units.remove(&unit.id);
                Ok(())
            }
        }
    }

    async fn unit_status(&self, unit: &UnitHandle) -> Result<UnitStatus, BackendError> {
        self.enter(Operation::UnitStatus).await?;
        let state = self.state.lock();
        Ok(state
            .units
            .get(&unit.id)
            .map(|u| u.status)
            .unwrap_or(UnitStatus::Unknown))
    }

    async fn snapshot_unit(&self, unit: &UnitHandle) -> Result<SnapshotHandle, BackendError> {
        self.enter(Operation::SnapshotUnit).await?;
        let mut state = self.state.lock();
        let sandbox_id = match state.units.get(&unit.id) {
            Some(record) if record.status.is_running() => record.sandbox_id.clone(),
            Some(_) => {
                return Err(BackendError::other(format!(
                    "unit {} is not running",
                    unit.id
                )))
            }
            None => return Err(BackendError::not_found(&unit.id)),
        };
        state.next_id += 1;
        let name = format!("{}-checkpoint-{}", sandbox_id, state.next_id);
        state.snapshots.insert(name.clone());
        Ok(SnapshotHandle { name, sandbox_id })
    }

    async fn delete_sandbox(
        &self,
        sandbox: &SandboxHandle,
        cleanup_storage: bool,
    ) -> Result<(), BackendError> {
        self.enter(Operation::DeleteSandbox).await?;
        let mut state = self.state.lock();
        if state.sandboxes.remove(&sandbox.id).is_none() {
            return Err(BackendError::not_found(&sandbox.id));
        }
        state.units.retain(|_, u| u.sandbox_id != sandbox.id);
        if cleanup_storage {
            let prefix = format!("{}-checkpoint-", sandbox.id);
            state.snapshots.retain(|name| !name.starts_with(&prefix));
        }
        Ok(())
    }

    async fn sandbox_address(
        &self,
        sandbox: &SandboxHandle,
    ) -> Result<Option<String>, BackendError> {
        let state = self.state.lock();
        Ok(state
            .sandboxes
            .get(&sandbox.id)
            .and_then(|s| s.address.clone()))
    }
}
