use super::duration::{deserialize_duration, parse_duration_string};
use crate::error::{Error, Result};
use crate::trace::TraceSink;
use serde::Deserialize;
use std::time::Duration;

/// Default timeout for a single backend command (create, start, kill, ...).
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for pulling an image (5 minutes).
pub const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Default time a readiness probe gets before the start fails.
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time a unit gets to exit after the termination signal.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Default interval between status polls while waiting for a unit to exit.
pub const DEFAULT_STATUS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Engine-wide settings shared by every service through the backend handle.
///
/// Service definitions override `default_readiness_timeout` and
/// `default_stop_grace` per service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Docker CLI binary used by [`DockerBackend`](crate::backend::DockerBackend).
    pub docker_binary: String,
    /// Daemon address passed as `--host`. `None` uses the CLI default.
    pub docker_host: Option<String>,
    #[serde(deserialize_with = "deserialize_duration")]
    pub command_timeout: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub pull_timeout: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub default_readiness_timeout: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub default_stop_grace: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub status_poll_interval: Duration,
    /// Where spawned services should send their spans.
    pub trace_sink: Option<TraceSink>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            docker_binary: "docker".to_string(),
            docker_host: None,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            pull_timeout: DEFAULT_PULL_TIMEOUT,
            default_readiness_timeout: DEFAULT_READINESS_TIMEOUT,
            default_stop_grace: DEFAULT_STOP_GRACE,
            status_poll_interval: DEFAULT_STATUS_POLL_INTERVAL,
            trace_sink: None,
        }
    }
}

impl EngineConfig {
    /// Build a config from defaults overlaid with `FIXTURES_*` environment variables.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `FIXTURES_DOCKER_BIN` | `docker_binary` |
    /// | `FIXTURES_DOCKER_HOST` (then `DOCKER_HOST`) | `docker_host` |
    /// | `FIXTURES_COMMAND_TIMEOUT` | `command_timeout` |
    /// | `FIXTURES_PULL_TIMEOUT` | `pull_timeout` |
    /// | `FIXTURES_READINESS_TIMEOUT` | `default_readiness_timeout` |
    /// | `FIXTURES_STOP_GRACE` | `default_stop_grace` |
    /// | `FIXTURES_TRACE_SINK` | `trace_sink` |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(bin) = get("FIXTURES_DOCKER_BIN") {
            config.docker_binary = bin;
        }
        config.docker_host = get("FIXTURES_DOCKER_HOST").or_else(|| get("DOCKER_HOST"));

        let duration = |key: &str, target: &mut Duration| -> Result<()> {
            if let Some(raw) = get(key) {
                *target = parse_duration_string(&raw).ok_or_else(|| {
                    Error::Config(format!("{} has an invalid duration: '{}'", key, raw))
                })?;
            }
            Ok(())
        };
        duration("FIXTURES_COMMAND_TIMEOUT", &mut config.command_timeout)?;
        duration("FIXTURES_PULL_TIMEOUT", &mut config.pull_timeout)?;
        duration(
            "FIXTURES_READINESS_TIMEOUT",
            &mut config.default_readiness_timeout,
        )?;
        duration("FIXTURES_STOP_GRACE", &mut config.default_stop_grace)?;

        if let Some(sink) = get("FIXTURES_TRACE_SINK") {
            config.trace_sink = Some(sink.parse()?);
        }

        Ok(config)
    }
}
