// Allow unused_assignments at module level because thiserror's generated code
// for struct variants triggers false positive warnings - the fields ARE used
// in the Display impl but rustc's lint pass doesn't see this.
#![allow(unused_assignments)]

use crate::backend::BackendError;
use miette::Diagnostic;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    #[diagnostic(code(fixtures::config::error))]
    Config(String),

    #[error("Invalid definition for service '{service}': {reason}")]
    #[diagnostic(code(fixtures::service::invalid_definition))]
    InvalidDefinition { service: String, reason: String },

    #[error("Runtime backend unavailable: {0}")]
    #[diagnostic(
        code(fixtures::backend::unavailable),
        help("Check that the container runtime is running (e.g. `docker info`) and that FIXTURES_DOCKER_HOST points at it")
    )]
    BackendUnavailable(String),

    #[error("Service '{service}' couldn't pull image '{image}': {source}")]
    #[diagnostic(
        code(fixtures::service::pull_failed),
        help("Verify the image reference and registry credentials")
    )]
    PullFailed {
        service: String,
        image: String,
        source: BackendError,
    },

    #[error("Service '{service}' couldn't be provisioned: {source}")]
    #[diagnostic(code(fixtures::service::provision_failed))]
    ProvisionFailed {
        service: String,
        source: BackendError,
    },

    #[error("Service '{service}' failed to start: {source}")]
    #[diagnostic(code(fixtures::service::start_failed))]
    StartFailed {
        service: String,
        source: BackendError,
    },

    #[error("Service '{service}' did not become ready within {timeout:?}")]
    #[diagnostic(
        code(fixtures::service::readiness_timeout),
        help("The service may be slow to start. Increase the readiness timeout or FIXTURES_READINESS_TIMEOUT")
    )]
    ReadinessTimeout { service: String, timeout: Duration },

    #[error("Service '{service}' readiness probe failed: {cause:#}")]
    #[diagnostic(code(fixtures::service::readiness_failed))]
    ReadinessProbeFailed {
        service: String,
        cause: anyhow::Error,
    },

    #[error("Service '{service}' setup failed: {cause:#}")]
    #[diagnostic(code(fixtures::service::setup_failed))]
    SetupFailed {
        service: String,
        cause: anyhow::Error,
    },

    #[error("Service '{service}' couldn't be snapshotted: {source}")]
    #[diagnostic(
        code(fixtures::service::snapshot_failed),
        help("Checkpointing needs runtime support (e.g. Docker experimental mode with CRIU). Disable snapshots for this service otherwise")
    )]
    SnapshotFailed {
        service: String,
        source: BackendError,
    },

    #[error("Service '{service}' failed to stop: {source}")]
    #[diagnostic(code(fixtures::service::stop_failed))]
    StopFailed {
        service: String,
        source: BackendError,
    },

    #[error("Couldn't query status of service '{service}': {source}")]
    #[diagnostic(code(fixtures::service::status_failed))]
    StatusFailed {
        service: String,
        source: BackendError,
    },

    #[error("Service '{service}' can't be restored: {reason}")]
    #[diagnostic(code(fixtures::service::restore_unavailable))]
    RestoreUnavailable { service: String, reason: String },

    #[error("Service '{0}' has no container to restore into")]
    #[diagnostic(code(fixtures::service::no_container))]
    NoContainer(String),

    /// A lifecycle failure whose compensating stop also failed.
    /// `error` is the original cause and always wins.
    #[error("{error} (cleanup also failed: {cleanup})")]
    WithCleanupFailure {
        error: Box<Error>,
        cleanup: Box<Error>,
    },

    #[error("Dependency '{service}' couldn't be started: {source}")]
    #[diagnostic(code(fixtures::harness::dependency_failed))]
    DependencyFailed {
        service: String,
        source: Box<Error>,
    },

    #[error("Test body failed: {0:#}")]
    TestFailed(anyhow::Error),

    #[error("Cleanup failed:\n{}", .0.iter().map(|e| format!("  - {}", e)).collect::<Vec<_>>().join("\n"))]
    #[diagnostic(code(fixtures::harness::cleanup_failed))]
    CleanupFailed(Vec<Error>),

    #[error("Multiple errors occurred:\n{}", .0.iter().map(|e| format!("  - {}", e)).collect::<Vec<_>>().join("\n"))]
    Multiple(Vec<Error>),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Discriminant of [`Error`], ignoring attached cleanup failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    InvalidDefinition,
    BackendUnavailable,
    PullFailed,
    ProvisionFailed,
    StartFailed,
    ReadinessTimeout,
    ReadinessProbeFailed,
    SetupFailed,
    SnapshotFailed,
    StopFailed,
    StatusFailed,
    RestoreUnavailable,
    NoContainer,
    DependencyFailed,
    TestFailed,
    CleanupFailed,
    Multiple,
}

impl Error {
    /// The original cause, looking through an attached cleanup failure.
    pub fn root(&self) -> &Error {
        match self {
            Error::WithCleanupFailure { error, .. } => error.root(),
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WithCleanupFailure { error, .. } => error.kind(),
            Error::Config(_) => ErrorKind::Config,
            Error::InvalidDefinition { .. } => ErrorKind::InvalidDefinition,
            Error::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            Error::PullFailed { .. } => ErrorKind::PullFailed,
            Error::ProvisionFailed { .. } => ErrorKind::ProvisionFailed,
            Error::StartFailed { .. } => ErrorKind::StartFailed,
            Error::ReadinessTimeout { .. } => ErrorKind::ReadinessTimeout,
            Error::ReadinessProbeFailed { .. } => ErrorKind::ReadinessProbeFailed,
            Error::SetupFailed { .. } => ErrorKind::SetupFailed,
            Error::SnapshotFailed { .. } => ErrorKind::SnapshotFailed,
            Error::StopFailed { .. } => ErrorKind::StopFailed,
            Error::StatusFailed { .. } => ErrorKind::StatusFailed,
            Error::RestoreUnavailable { .. } => ErrorKind::RestoreUnavailable,
            Error::NoContainer(_) => ErrorKind::NoContainer,
            Error::DependencyFailed { .. } => ErrorKind::DependencyFailed,
            Error::TestFailed(_) => ErrorKind::TestFailed,
            Error::CleanupFailed(_) => ErrorKind::CleanupFailed,
            Error::Multiple(_) => ErrorKind::Multiple,
        }
    }

    /// The compensating-stop failure attached to this error, if any.
    pub fn cleanup_failure(&self) -> Option<&Error> {
        match self {
            Error::WithCleanupFailure { cleanup, .. } => Some(cleanup),
            _ => None,
        }
    }

    /// Whether retrying (possibly with a longer timeout) could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ReadinessTimeout | ErrorKind::BackendUnavailable
        )
    }

    /// Attach a failed compensating stop to an original error.
    pub(crate) fn with_cleanup(self, cleanup: Error) -> Error {
        Error::WithCleanupFailure {
            error: Box::new(self),
            cleanup: Box::new(cleanup),
        }
    }
}
