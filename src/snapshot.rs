//! Snapshot policy.
//!
//! Decides which path a start takes and captures the checkpoint after a
//! fresh start. Snapshotting is all-or-nothing per service: a service either
//! snapshots after its first fresh start and restores from then on, or never
//! snapshots at all.

use crate::backend::{RuntimeBackend, SandboxHandle, SnapshotHandle, UnitHandle};
use crate::error::{Error, Result};

/// How the next start of a service proceeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPlan {
    /// Pull (if needed), create the sandbox (if needed), start, wait for
    /// readiness, run setup, then capture a snapshot when enabled.
    Fresh,
    /// Create a unit from the snapshot in the existing sandbox and start it.
    /// Pull, sandbox creation, readiness and setup are all skipped.
    Restore {
        sandbox: SandboxHandle,
        snapshot: SnapshotHandle,
    },
}

/// Pick the start path from the current handles.
///
/// A snapshot without a sandbox can't be restored; that is reported as
/// [`Error::NoContainer`] rather than silently falling back to a fresh start.
pub fn plan_start(
    service: &str,
    snapshot_enabled: bool,
    container: Option<&SandboxHandle>,
    snapshot: Option<&SnapshotHandle>,
) -> Result<StartPlan> {
    match (snapshot_enabled, snapshot) {
        (true, Some(snapshot)) => {
            let sandbox = container.ok_or_else(|| Error::NoContainer(service.to_string()))?;
            Ok(StartPlan::Restore {
                sandbox: sandbox.clone(),
                snapshot: snapshot.clone(),
            })
        }
        (false, Some(_)) => {
            tracing::warn!(
                "Service '{}' holds a snapshot but snapshotting is disabled; ignoring it",
                service
            );
            Ok(StartPlan::Fresh)
        }
        (_, None) => Ok(StartPlan::Fresh),
    }
}

/// Checkpoint a freshly started unit.
pub async fn capture(
    backend: &dyn RuntimeBackend,
    service: &str,
    unit: &UnitHandle,
) -> Result<SnapshotHandle> {
    let snapshot = backend
        .snapshot_unit(unit)
        .await
        .map_err(|source| Error::SnapshotFailed {
            service: service.to_string(),
            source,
        })?;
    tracing::info!(
        "Captured snapshot '{}' for service '{}'",
        snapshot.name,
        service
    );
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NetworkMode;
    use crate::error::ErrorKind;

    fn sandbox() -> SandboxHandle {
        SandboxHandle {
            id: "pg".to_string(),
            image: "docker.io/library/postgres:16".to_string(),
            network: NetworkMode::Host,
        }
    }

    fn checkpoint() -> SnapshotHandle {
        SnapshotHandle {
            name: "pg-checkpoint-1".to_string(),
            sandbox_id: "pg".to_string(),
        }
    }

    #[test]
    fn test_fresh_without_snapshot() {
        assert_eq!(
            plan_start("pg", true, Some(&sandbox()), None).unwrap(),
            StartPlan::Fresh
        );
        assert_eq!(plan_start("pg", false, None, None).unwrap(), StartPlan::Fresh);
    }

    #[test]
    fn test_restore_with_snapshot_and_sandbox() {
        let plan = plan_start("pg", true, Some(&sandbox()), Some(&checkpoint())).unwrap();
        assert_eq!(
            plan,
            StartPlan::Restore {
                sandbox: sandbox(),
                snapshot: checkpoint(),
            }
        );
    }

    #[test]
    fn test_snapshot_without_sandbox_is_no_container() {
        let err = plan_start("pg", true, None, Some(&checkpoint())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoContainer);
    }

    #[test]
    fn test_disabled_snapshotting_never_restores() {
        assert_eq!(
            plan_start("pg", false, Some(&sandbox()), Some(&checkpoint())).unwrap(),
            StartPlan::Fresh
        );
    }
}
