use crate::backend::{ImageHandle, SandboxHandle, SnapshotHandle, UnitHandle};

/// Mutable runtime handles of one service, guarded by the engine's lock.
///
/// - `task` set ⇒ the service is considered running
/// - `snapshot` set ⇒ the next start may take the restore path
/// - `container` is only cleared together with `task` when snapshotting is off
#[derive(Debug, Default)]
pub(crate) struct RuntimeState {
    pub(crate) image: Option<ImageHandle>,
    pub(crate) container: Option<SandboxHandle>,
    pub(crate) task: Option<UnitHandle>,
    pub(crate) snapshot: Option<SnapshotHandle>,
}

impl RuntimeState {
    pub(crate) fn to_snapshot(&self) -> RuntimeSnapshot {
        RuntimeSnapshot {
            image: self.image.clone(),
            container: self.container.clone(),
            task: self.task.clone(),
            snapshot: self.snapshot.clone(),
        }
    }
}

/// Point-in-time copy of a service's runtime handles, for tests and diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeSnapshot {
    pub image: Option<ImageHandle>,
    pub container: Option<SandboxHandle>,
    pub task: Option<UnitHandle>,
    pub snapshot: Option<SnapshotHandle>,
}

impl RuntimeSnapshot {
    /// Whether the held unit (if any) was created from a snapshot.
    pub fn is_restored(&self) -> bool {
        self.task
            .as_ref()
            .is_some_and(|task| task.restored_from.is_some())
    }
}
