//! Container runtime backends.
//!
//! The lifecycle engine talks to the container runtime exclusively through the
//! narrow [`RuntimeBackend`] trait. Two implementations ship with the crate:
//!
//! - [`DockerBackend`]: drives the `docker` CLI (checkpoint/restore needs an
//!   experimental daemon with CRIU installed)
//! - [`InMemoryBackend`]: deterministic, scriptable backend for tests
//!
//! Engines never hold a backend directly; they hold a [`SharedBackend`], which
//! connects lazily and exactly once.

mod docker;
mod error;
mod memory;
mod shared;
mod types;

pub use docker::DockerBackend;
pub use error::BackendError;
pub use memory::{InMemoryBackend, Operation};
pub use shared::SharedBackend;
pub use types::*;

use async_trait::async_trait;

/// Narrow capability the engine needs from a container runtime.
///
/// Every call may be slow (network or filesystem bound) and every call may
/// fail. Implementations must not assume calls for one sandbox are serialized
/// by anyone but the engine.
#[async_trait]
pub trait RuntimeBackend: Send + Sync + std::fmt::Debug {
    /// Pull an image by its canonical reference.
    async fn pull_image(&self, reference: &str) -> Result<ImageHandle, BackendError>;

    /// Create a sandbox from a pulled image. Does not start any process.
    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<SandboxHandle, BackendError>;

    /// Create an execution unit in a sandbox, optionally restoring it from a snapshot.
    async fn create_unit(
        &self,
        sandbox: &SandboxHandle,
        io: IoConfig,
        snapshot: Option<&SnapshotHandle>,
    ) -> Result<UnitHandle, BackendError>;

    async fn start_unit(&self, unit: &UnitHandle) -> Result<(), BackendError>;

    async fn signal_unit(&self, unit: &UnitHandle, signal: Signal) -> Result<(), BackendError>;

    /// Delete an execution unit. With `force`, a still-running unit is killed first.
    async fn delete_unit(&self, unit: &UnitHandle, force: bool) -> Result<(), BackendError>;

    async fn unit_status(&self, unit: &UnitHandle) -> Result<UnitStatus, BackendError>;

    /// Checkpoint a running unit. The unit keeps running.
    async fn snapshot_unit(&self, unit: &UnitHandle) -> Result<SnapshotHandle, BackendError>;

    /// Delete a sandbox. With `cleanup_storage`, its backing storage is released too.
    async fn delete_sandbox(
        &self,
        sandbox: &SandboxHandle,
        cleanup_storage: bool,
    ) -> Result<(), BackendError>;

    /// Network address of a sandbox, if the backend can resolve one.
    async fn sandbox_address(
        &self,
        _sandbox: &SandboxHandle,
    ) -> Result<Option<String>, BackendError> {
        Ok(None)
    }
}
