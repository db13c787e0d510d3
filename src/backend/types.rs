use serde::{Deserialize, Serialize};
use std::fmt;

/// A pulled image, as resolved by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHandle {
    /// Canonical reference the image was pulled by (e.g. `docker.io/library/redis:latest`).
    pub reference: String,
    /// Backend-specific image id, when the backend reports one.
    pub id: Option<String>,
}

/// A provisioned sandbox (filesystem + namespaces), independent of any process in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub id: String,
    pub image: String,
    pub network: NetworkMode,
}

/// An execution unit: one process instance inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitHandle {
    pub id: String,
    pub sandbox_id: String,
    /// Name of the snapshot this unit was created from, if any.
    pub restored_from: Option<String>,
}

/// A captured, restorable checkpoint of a running unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHandle {
    pub name: String,
    pub sandbox_id: String,
}

/// Host path (or named volume) mounted into the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

impl Mount {
    pub fn bind(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Render as a `src:dst[:ro]` volume spec.
    pub fn to_volume_spec(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.source, self.target)
        } else {
            format!("{}:{}", self.source, self.target)
        }
    }
}

/// Network namespace the sandbox joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Share the host network namespace; the service is reachable on `localhost`.
    #[default]
    Host,
    /// Private network namespace; the service is reachable on the sandbox address.
    Bridge,
}

/// Where a unit's standard streams go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoConfig {
    /// Discard stdio.
    #[default]
    Null,
    /// Forward stdio to the test process.
    Inherit,
}

/// Signals the engine sends to units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Int,
    Kill,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Term => "SIGTERM",
            Signal::Int => "SIGINT",
            Signal::Kill => "SIGKILL",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution-unit status as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    /// Created but never started.
    Created,
    Running,
    Paused,
    /// Exited (gracefully or not).
    Stopped,
    Unknown,
}

impl UnitStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, UnitStatus::Running)
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitStatus::Created => write!(f, "created"),
            UnitStatus::Running => write!(f, "running"),
            UnitStatus::Paused => write!(f, "paused"),
            UnitStatus::Stopped => write!(f, "stopped"),
            UnitStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Everything the backend needs to create a sandbox.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub id: String,
    pub image: ImageHandle,
    pub mounts: Vec<Mount>,
    pub env: Vec<(String, String)>,
    pub network: NetworkMode,
    pub labels: Vec<(String, String)>,
}
