//! Docker CLI backend.
//!
//! All Docker CLI interactions go through [`DockerBackend::run`], which
//! provides consistent timeout handling, error mapping to [`BackendError`], and
//! a single point where the `docker` command is constructed.
//!
//! Docker has no separate task object: a container is both the sandbox and
//! the host of its single execution unit. Units are therefore logical handles
//! onto the container, and "deleting" a unit stops the container's process
//! while leaving the container itself in place.

use super::{
    BackendError, ImageHandle, IoConfig, NetworkMode, RuntimeBackend, SandboxHandle, SandboxSpec,
    Signal, SnapshotHandle, UnitHandle, UnitStatus,
};
use crate::config::EngineConfig;
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Output;
use std::time::Duration;

/// Subset of `docker inspect` `.State` the backend cares about.
#[derive(Debug, Deserialize)]
struct ContainerState {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Running", default)]
    running: bool,
}

/// Runtime backend driving the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerBackend {
    config: EngineConfig,
}

impl DockerBackend {
    /// Create a backend without checking the daemon.
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Create a backend and verify the daemon answers.
    pub async fn connect(config: EngineConfig) -> Result<Self, BackendError> {
        let backend = Self::new(config);
        let output = backend
            .run(
                &["info", "--format", "{{.ServerVersion}}"],
                backend.config.command_timeout,
            )
            .await
            .map_err(|e| BackendError::unavailable(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::unavailable(stderr.trim().to_string()));
        }
        tracing::debug!(
            "Connected to Docker daemon {}",
            String::from_utf8_lossy(&output.stdout).trim()
        );
        Ok(backend)
    }

    // ========================================================================
    // Internal helpers
    // ========================================================================

    fn command_string(&self, args: &[&str]) -> String {
        format!("{} {}", self.config.docker_binary, args.join(" "))
    }

    /// Run a docker command with a timeout, returning raw Output.
    async fn run(&self, args: &[&str], timeout: Duration) -> Result<Output, BackendError> {
        let mut command = tokio::process::Command::new(&self.config.docker_binary);
        if let Some(ref host) = self.config.docker_host {
            command.arg("--host").arg(host);
        }
        command.args(args).kill_on_drop(true);

        let result = tokio::time::timeout(timeout, command.output()).await;
        let cmd_str = self.command_string(args);

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(BackendError::exec_failed(cmd_str, e)),
            Err(_) => Err(BackendError::timeout(cmd_str, timeout)),
        }
    }

    /// Run a docker command, returning Output only if exit 0.
    ///
    /// "No such container" / "No such object" map to [`BackendError::NotFound`].
    async fn run_success(
        &self,
        args: &[&str],
        target: &str,
        timeout: Duration,
    ) -> Result<Output, BackendError> {
        let output = self.run(args, timeout).await?;
        if output.status.success() {
            return Ok(output);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such container") || stderr.contains("No such object") {
            return Err(BackendError::not_found(target));
        }
        Err(BackendError::failed(self.command_string(args), &output))
    }

    /// Force-remove a container. Returns `Ok(())` if container doesn't exist.
    async fn rm_force(&self, container: &str, volumes: bool) -> Result<(), BackendError> {
        let mut args = vec!["rm", "-f"];
        if volumes {
            args.push("-v");
        }
        args.push(container);
        match self
            .run_success(&args, container, self.config.command_timeout)
            .await
        {
            Ok(_) | Err(BackendError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Kill a container with a signal. Not-running and missing containers are not errors.
    async fn kill(&self, container: &str, signal: Signal) -> Result<(), BackendError> {
        let args = ["kill", "--signal", signal.as_str(), container];
        let output = self.run(&args, self.config.command_timeout).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such container") || stderr.contains("is not running") {
            return Ok(());
        }
        Err(BackendError::failed(self.command_string(&args), &output))
    }

    async fn inspect_state(&self, container: &str) -> Result<ContainerState, BackendError> {
        let output = self
            .run_success(
                &["inspect", "--type", "container", "--format", "{{json .State}}", container],
                container,
                self.config.command_timeout,
            )
            .await?;
        let json = String::from_utf8_lossy(&output.stdout);
        serde_json::from_str(json.trim()).map_err(|e| {
            BackendError::other(format!(
                "Unexpected docker inspect output for {}: {}",
                container, e
            ))
        })
    }

    fn sandbox_args(spec: &SandboxSpec) -> Vec<String> {
        let mut args = vec!["create".to_string(), "--name".to_string(), spec.id.clone()];

        if spec.network == NetworkMode::Host {
            args.push("--network".to_string());
            args.push("host".to_string());
        }

        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        for mount in &spec.mounts {
            args.push("-v".to_string());
            args.push(mount.to_volume_spec());
        }

        args.push(spec.image.reference.clone());
        args
    }
}

fn parse_status(state: &ContainerState) -> UnitStatus {
    match state.status.as_str() {
        "running" | "restarting" => UnitStatus::Running,
        "created" => UnitStatus::Created,
        "paused" => UnitStatus::Paused,
        "exited" | "dead" | "removing" => UnitStatus::Stopped,
        _ if state.running => UnitStatus::Running,
        _ => UnitStatus::Unknown,
    }
}

#[async_trait]
impl RuntimeBackend for DockerBackend {
    async fn pull_image(&self, reference: &str) -> Result<ImageHandle, BackendError> {
        let args = ["pull", reference];
        let output = self.run(&args, self.config.pull_timeout).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // "up to date" or "already exists" aren't real failures
            if !stderr.contains("up to date") && !stderr.contains("already exists") {
                return Err(BackendError::failed(self.command_string(&args), &output));
            }
        }

        let id = self
            .run(
                &["image", "inspect", "--format", "{{.Id}}", reference],
                self.config.command_timeout,
            )
            .await
            .ok()
            .filter(|o| o.status.success())
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
            .filter(|id| !id.is_empty());

        Ok(ImageHandle {
            reference: reference.to_string(),
            id,
        })
    }

    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<SandboxHandle, BackendError> {
        // A container left behind by a crashed test process would make the
        // create fail with a name conflict.
        if let Err(e) = self.rm_force(&spec.id, true).await {
            tracing::warn!("Failed to remove stale container {}: {}", spec.id, e);
        }

        let args = Self::sandbox_args(spec);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_success(&arg_refs, &spec.id, self.config.command_timeout)
            .await?;

        Ok(SandboxHandle {
            id: spec.id.clone(),
            image: spec.image.reference.clone(),
            network: spec.network,
        })
    }

    async fn create_unit(
        &self,
        sandbox: &SandboxHandle,
        io: IoConfig,
        snapshot: Option<&SnapshotHandle>,
    ) -> Result<UnitHandle, BackendError> {
        if io == IoConfig::Inherit {
            tracing::debug!(
                "Docker backend does not forward stdio; use `docker logs {}`",
                sandbox.id
            );
        }
        if let Some(snapshot) = snapshot {
            if snapshot.sandbox_id != sandbox.id {
                return Err(BackendError::other(format!(
                    "checkpoint {} belongs to {}, not {}",
                    snapshot.name, snapshot.sandbox_id, sandbox.id
                )));
            }
        }

        // Confirms the container still exists.
        self.inspect_state(&sandbox.id).await?;

        Ok(UnitHandle {
            id: sandbox.id.clone(),
            sandbox_id: sandbox.id.clone(),
            restored_from: snapshot.map(|s| s.name.clone()),
        })
    }

    async fn start_unit(&self, unit: &UnitHandle) -> Result<(), BackendError> {
        let mut args = vec!["start"];
        if let Some(ref checkpoint) = unit.restored_from {
            args.push("--checkpoint");
            args.push(checkpoint);
        }
        args.push(&unit.id);
        self.run_success(&args, &unit.id, self.config.command_timeout)
            .await?;
        Ok(())
    }

    async fn signal_unit(&self, unit: &UnitHandle, signal: Signal) -> Result<(), BackendError> {
        self.kill(&unit.id, signal).await
    }

    async fn delete_unit(&self, unit: &UnitHandle, force: bool) -> Result<(), BackendError> {
        if force {
            return self.kill(&unit.id, Signal::Kill).await;
        }
        match self.inspect_state(&unit.id).await {
            Ok(state) if parse_status(&state).is_running() => Err(BackendError::other(format!(
                "container {} is still running",
                unit.id
            ))),
            Ok(_) | Err(BackendError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn unit_status(&self, unit: &UnitHandle) -> Result<UnitStatus, BackendError> {
        match self.inspect_state(&unit.id).await {
            Ok(state) => Ok(parse_status(&state)),
            Err(BackendError::NotFound { .. }) => Ok(UnitStatus::Unknown),
            Err(e) => Err(e),
        }
    }

    async fn snapshot_unit(&self, unit: &UnitHandle) -> Result<SnapshotHandle, BackendError> {
        let name = format!("fixtures-cp-{:08x}", rand::random::<u32>());
        let args = [
            "checkpoint",
            "create",
            "--leave-running",
            unit.id.as_str(),
            name.as_str(),
        ];
        let output = self.run(&args, self.config.command_timeout).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("experimental") || stderr.contains("not supported") {
                return Err(BackendError::Unsupported {
                    operation: "checkpoint".to_string(),
                });
            }
            return Err(BackendError::failed(self.command_string(&args), &output));
        }
        Ok(SnapshotHandle {
            name,
            sandbox_id: unit.sandbox_id.clone(),
        })
    }

    async fn delete_sandbox(
        &self,
        sandbox: &SandboxHandle,
        cleanup_storage: bool,
    ) -> Result<(), BackendError> {
        self.rm_force(&sandbox.id, cleanup_storage).await
    }

    async fn sandbox_address(
        &self,
        sandbox: &SandboxHandle,
    ) -> Result<Option<String>, BackendError> {
        if sandbox.network == NetworkMode::Host {
            return Ok(None);
        }
        let output = self
            .run_success(
                &[
                    "inspect",
                    "--format",
                    "{{range .NetworkSettings.Networks}}{{.IPAddress}} {{end}}",
                    &sandbox.id,
                ],
                &sandbox.id,
                self.config.command_timeout,
            )
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .next()
            .map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Mount;

    fn state(status: &str, running: bool) -> ContainerState {
        ContainerState {
            status: status.to_string(),
            running,
        }
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status(&state("running", true)), UnitStatus::Running);
        assert_eq!(parse_status(&state("created", false)), UnitStatus::Created);
        assert_eq!(parse_status(&state("exited", false)), UnitStatus::Stopped);
        assert_eq!(parse_status(&state("paused", true)), UnitStatus::Paused);
        assert_eq!(parse_status(&state("weird", false)), UnitStatus::Unknown);
    }

    #[test]
    fn test_inspect_json_shape() {
        let parsed: ContainerState =
            serde_json::from_str(r#"{"Status":"exited","Running":false,"ExitCode":143}"#).unwrap();
        assert_eq!(parse_status(&parsed), UnitStatus::Stopped);
    }

    #[test]
    fn test_sandbox_args() {
        let spec = SandboxSpec {
            id: "redis".to_string(),
            image: ImageHandle {
                reference: "docker.io/library/redis:latest".to_string(),
                id: None,
            },
            mounts: vec![Mount::bind("./fixtures", "/data").read_only()],
            env: vec![("FIXTURES_TRACE_SERVICE".to_string(), "redis".to_string())],
            network: NetworkMode::Host,
            labels: vec![("com.service-fixtures.managed".to_string(), "true".to_string())],
        };
        let args = DockerBackend::sandbox_args(&spec);
        assert_eq!(
            args,
            vec![
                "create",
                "--name",
                "redis",
                "--network",
                "host",
                "--label",
                "com.service-fixtures.managed=true",
                "-e",
                "FIXTURES_TRACE_SERVICE=redis",
                "-v",
                "./fixtures:/data:ro",
                "docker.io/library/redis:latest",
            ]
        );
    }

    #[test]
    fn test_bridge_network_omits_flag() {
        let spec = SandboxSpec {
            id: "pg".to_string(),
            image: ImageHandle {
                reference: "docker.io/library/postgres:16".to_string(),
                id: None,
            },
            mounts: vec![],
            env: vec![],
            network: NetworkMode::Bridge,
            labels: vec![],
        };
        let args = DockerBackend::sandbox_args(&spec);
        assert!(!args.iter().any(|a| a == "--network"));
    }
}
