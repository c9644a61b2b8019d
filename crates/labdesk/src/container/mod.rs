//! Container runtime management module.
//!
//! Drives the container engine through the Docker or Podman CLI. Lab desktops
//! are created, started, signalled, stopped and removed through this module;
//! nothing else in the crate spawns engine processes.

mod container;
mod error;

pub use container::{
    ContainerConfig, ContainerSummary, PortMapping, ResourceLimits, sanitize_name_component,
};
pub use error::{ContainerError, ContainerResult};

use container::validate_image_name;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::{Output, Stdio};
use tokio::process::Command;

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Docker runtime
    #[default]
    Docker,
    /// Podman runtime
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.default_binary())
    }
}

/// Validate a container ID or name.
///
/// Container IDs are hex strings (12 or 64 chars for docker/podman).
/// Container names follow the same rules as container creation.
fn validate_container_id_or_name(id: &str) -> ContainerResult<()> {
    if id.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container ID or name cannot be empty".to_string(),
        ));
    }

    if id.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container ID or name exceeds maximum length".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !id.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container ID or name '{}' contains invalid characters",
            id
        )));
    }

    Ok(())
}

/// Validate a signal name such as `SIGTERM`, `TERM` or `USR1`.
fn validate_signal(signal: &str) -> ContainerResult<()> {
    let valid = !signal.is_empty()
        && signal.len() <= 16
        && signal
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());

    if !valid {
        return Err(ContainerError::InvalidInput(format!(
            "signal '{}' is not a valid signal name",
            signal
        )));
    }

    Ok(())
}

/// Engine stderr that means the container is already gone or already in the
/// requested state. Teardown treats these as success.
pub(crate) fn is_benign_stderr(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    [
        "no such container",
        "no container with name or id",
        "is not running",
        "not running",
        "already stopped",
        "already in progress",
        "container not found",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

/// Engine stderr from `create` that means the image is not present.
fn is_missing_image_stderr(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    [
        "no such image",
        "image not known",
        "unable to find image",
        "pull access denied",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

/// Build the argument vector for `create`.
///
/// Kept separate from process spawning so the exact command line can be
/// checked without an engine.
pub fn build_create_args(config: &ContainerConfig) -> Vec<String> {
    let mut args: Vec<String> = vec!["create".to_string()];

    if let Some(ref name) = config.name {
        args.push("--name".to_string());
        args.push(name.clone());
    }

    for (key, value) in &config.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }

    for port in &config.ports {
        args.push("-p".to_string());
        args.push(format!("{}:{}", port.host_port, port.container_port));
    }

    for (key, value) in &config.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    if let Some(ref limits) = config.limits {
        args.push("--memory".to_string());
        args.push(limits.memory.clone());
        args.push("--cpus".to_string());
        args.push(limits.cpus.to_string());
        args.push("--pids-limit".to_string());
        args.push(limits.pids_limit.to_string());
        if let Some(ref shm) = limits.shm_size {
            args.push("--shm-size".to_string());
            args.push(shm.clone());
        }
    }

    for opt in &config.security_opts {
        args.push("--security-opt".to_string());
        args.push(opt.clone());
    }

    args.push(config.image.clone());
    args
}

/// Parse `ps` output produced with the `{{.ID}}\t{{.Names}}\t{{.State}}`
/// template, keeping only containers whose name starts with `name_prefix`.
pub(crate) fn parse_ps_lines(stdout: &str, name_prefix: Option<&str>) -> Vec<ContainerSummary> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.trim().split('\t');
            let id = parts.next()?.trim();
            // Docker lists every name of a container, comma separated.
            let name = parts.next()?.split(',').next()?.trim();
            let state = parts.next().unwrap_or("").trim();
            if id.is_empty() || name.is_empty() {
                return None;
            }
            Some(ContainerSummary {
                id: id.to_string(),
                name: name.to_string(),
                state: state.to_ascii_lowercase(),
            })
        })
        .filter(|c| name_prefix.is_none_or(|prefix| c.name.starts_with(prefix)))
        .collect()
}

/// Container runtime client for managing containers.
///
/// Supports both Docker and Podman with automatic detection.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    /// The runtime type (docker or podman)
    runtime_type: RuntimeType,
    /// Path to the container binary
    binary: String,
}

/// Container runtime abstraction for testability.
///
/// Teardown-style operations (`signal`, `stop`, `remove`) report success when
/// the container is already gone or already in the requested state.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Create a container without starting it. Returns the engine ID.
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String>;
    async fn start_container(&self, container_id: &str) -> ContainerResult<()>;
    /// Deliver a signal to the container's init process.
    async fn signal_container(&self, container_id: &str, signal: &str) -> ContainerResult<()>;
    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()>;
    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()>;
    /// Engine state string, `Ok(None)` when the container does not exist.
    async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>>;
    /// Combined stdout/stderr, optionally restricted to the last `tail` lines.
    async fn get_logs(&self, container_id: &str, tail: Option<u32>) -> ContainerResult<String>;
    async fn list_containers(
        &self,
        all: bool,
        name_prefix: Option<&str>,
    ) -> ContainerResult<Vec<ContainerSummary>>;

    async fn is_running(&self, id_or_name: &str) -> ContainerResult<bool> {
        let status = self.container_state_status(id_or_name).await?;
        Ok(status.as_deref() == Some("running"))
    }
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        self.create_container(config).await
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        self.start_container(container_id).await
    }

    async fn signal_container(&self, container_id: &str, signal: &str) -> ContainerResult<()> {
        self.signal_container(container_id, signal).await
    }

    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        self.stop_container(container_id, timeout_seconds).await
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        self.remove_container(container_id, force).await
    }

    async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>> {
        self.container_state_status(id_or_name).await
    }

    async fn get_logs(&self, container_id: &str, tail: Option<u32>) -> ContainerResult<String> {
        self.get_logs(container_id, tail).await
    }

    async fn list_containers(
        &self,
        all: bool,
        name_prefix: Option<&str>,
    ) -> ContainerResult<Vec<ContainerSummary>> {
        self.list_containers(all, name_prefix).await
    }
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Create a new container runtime with auto-detection.
    ///
    /// Prefers Docker, falls back to Podman.
    pub fn new() -> Self {
        let runtime_type = if Self::is_binary_available("docker") {
            RuntimeType::Docker
        } else if Self::is_binary_available("podman") {
            RuntimeType::Podman
        } else {
            // Neither found; the startup health check reports it.
            RuntimeType::Docker
        };
        Self::with_type(runtime_type)
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    /// Create a container runtime with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
        }
    }

    /// Build a runtime from optional configuration values.
    pub fn from_settings(runtime_type: Option<RuntimeType>, binary: Option<String>) -> Self {
        match (runtime_type, binary) {
            (Some(rt), Some(bin)) => Self::with_binary(rt, bin),
            (Some(rt), None) => Self::with_type(rt),
            (None, Some(bin)) => {
                let rt = if bin.contains("podman") {
                    RuntimeType::Podman
                } else {
                    RuntimeType::Docker
                };
                Self::with_binary(rt, bin)
            }
            (None, None) => Self::new(),
        }
    }

    /// Get the runtime type.
    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    /// Get the binary used to talk to the engine.
    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Check if a binary is available in PATH.
    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Spawn the engine binary and collect its output.
    async fn run<S: AsRef<std::ffi::OsStr>>(
        &self,
        command: &str,
        args: &[S],
    ) -> ContainerResult<Output> {
        log::trace!("{} {}", self.binary, command);
        Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: command.to_string(),
                message: e.to_string(),
            })
    }

    /// Run a teardown-style command, treating "already gone" as success.
    async fn run_tolerant<S: AsRef<std::ffi::OsStr>>(
        &self,
        command: &str,
        args: &[S],
    ) -> ContainerResult<()> {
        let output = self.run(command, args).await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_benign_stderr(&stderr) {
            log::debug!("{} tolerated: {}", command, stderr.trim());
            return Ok(());
        }

        Err(ContainerError::CommandFailed {
            command: command.to_string(),
            message: stderr.trim().to_string(),
        })
    }

    /// Check if the container runtime is available and working.
    pub async fn health_check(&self) -> ContainerResult<String> {
        let output = self.run("version", &["version", "--format", "json"]).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::CommandFailed {
                command: "version".to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Create a container from the configuration without starting it.
    ///
    /// The configuration is validated before anything is passed to the engine.
    pub async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;

        let args = build_create_args(config);
        let output = self.run("create", &args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_image_stderr(&stderr) {
                return Err(ContainerError::ImageNotFound(config.image.clone()));
            }
            return Err(ContainerError::CommandFailed {
                command: "create".to_string(),
                message: stderr.trim().to_string(),
            });
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(ContainerError::ParseError(
                "create returned no container id".to_string(),
            ));
        }
        Ok(id)
    }

    /// Start a created or stopped container.
    pub async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let output = self.run("start", &["start", container_id]).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::CommandFailed {
                command: "start".to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(())
    }

    /// Send a signal to the container.
    pub async fn signal_container(&self, container_id: &str, signal: &str) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;
        validate_signal(signal)?;

        self.run_tolerant("kill", &["kill", "--signal", signal, container_id])
            .await
    }

    /// Stop a running container.
    pub async fn stop_container(
        &self,
        container_id: &str,
        timeout: Option<u32>,
    ) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut args: Vec<String> = vec!["stop".to_string()];
        if let Some(t) = timeout {
            args.push("-t".to_string());
            args.push(t.to_string());
        }
        args.push(container_id.to_string());

        self.run_tolerant("stop", &args).await
    }

    /// Remove a container.
    pub async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut args = vec!["rm"];
        if force {
            args.push("-f");
        }
        args.push(container_id);

        self.run_tolerant("rm", &args).await
    }

    /// List containers, optionally only those whose name starts with `name_prefix`.
    pub async fn list_containers(
        &self,
        all: bool,
        name_prefix: Option<&str>,
    ) -> ContainerResult<Vec<ContainerSummary>> {
        let mut args = vec!["ps", "--no-trunc", "--format", "{{.ID}}\t{{.Names}}\t{{.State}}"];
        if all {
            args.push("-a");
        }

        let output = self.run("ps", &args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::CommandFailed {
                command: "ps".to_string(),
                message: stderr.trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_ps_lines(&stdout, name_prefix))
    }

    /// Get the container state status string (e.g. "running", "exited") via `inspect`.
    ///
    /// Returns `Ok(None)` when the container does not exist.
    pub async fn container_state_status(
        &self,
        id_or_name: &str,
    ) -> ContainerResult<Option<String>> {
        validate_container_id_or_name(id_or_name)?;

        let output = self
            .run(
                "inspect",
                &["inspect", "--format", "{{.State.Status}}", id_or_name],
            )
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_benign_stderr(&stderr) {
                return Ok(None);
            }
            return Err(ContainerError::CommandFailed {
                command: "inspect".to_string(),
                message: stderr.trim().to_string(),
            });
        }

        let status = String::from_utf8_lossy(&output.stdout)
            .trim()
            .trim_matches('"')
            .to_string();
        if status.is_empty() {
            return Ok(None);
        }

        Ok(Some(status))
    }

    /// Get container logs.
    pub async fn get_logs(&self, container_id: &str, tail: Option<u32>) -> ContainerResult<String> {
        validate_container_id_or_name(container_id)?;

        let mut args: Vec<String> = vec!["logs".to_string()];
        if let Some(n) = tail {
            args.push("--tail".to_string());
            args.push(n.to_string());
        }
        args.push(container_id.to_string());

        let output = self.run("logs", &args).await?;

        // The engine replays the container's stderr on its own stderr.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Err(ContainerError::CommandFailed {
                command: "logs".to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(format!("{}{}", stdout, stderr))
    }

    /// Check if an image exists locally.
    ///
    /// Uses `image inspect`, which both Docker and Podman understand.
    pub async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        validate_image_name(image)?;

        let output = self
            .run("image inspect", &["image", "inspect", image])
            .await?;

        Ok(output.status.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_container_runtime_health_check() {
        let runtime = ContainerRuntime::new();
        // Only meaningful when docker or podman is installed
        if let Ok(version) = runtime.health_check().await {
            assert!(!version.is_empty());
        }
    }

    #[test]
    fn test_from_settings() {
        let rt = ContainerRuntime::from_settings(Some(RuntimeType::Podman), None);
        assert_eq!(rt.runtime_type(), RuntimeType::Podman);
        assert_eq!(rt.binary(), "podman");

        let rt = ContainerRuntime::from_settings(None, Some("/usr/local/bin/podman".to_string()));
        assert_eq!(rt.runtime_type(), RuntimeType::Podman);
        assert_eq!(rt.binary(), "/usr/local/bin/podman");
    }

    #[test]
    fn test_build_create_args() {
        let config = ContainerConfig::new("labdesk-desktop:latest")
            .name("labdesk-7-abcdef12")
            .label("labdesk.user", "7")
            .port(5900, 5901)
            .port(6080, 6080)
            .env("USER_ID", "7")
            .limits(ResourceLimits::default())
            .security_opt("no-new-privileges");

        let args = build_create_args(&config);
        let joined = args.join(" ");

        assert_eq!(args.first().map(String::as_str), Some("create"));
        assert_eq!(args.last().map(String::as_str), Some("labdesk-desktop:latest"));
        assert!(joined.contains("--name labdesk-7-abcdef12"));
        assert!(joined.contains("--label labdesk.user=7"));
        assert!(joined.contains("-p 5900:5901"));
        assert!(joined.contains("-p 6080:6080"));
        assert!(joined.contains("-e USER_ID=7"));
        assert!(joined.contains("--memory 2g"));
        assert!(joined.contains("--cpus 1"));
        assert!(joined.contains("--pids-limit 512"));
        assert!(joined.contains("--shm-size 512m"));
        assert!(joined.contains("--security-opt no-new-privileges"));
    }

    #[test]
    fn test_build_create_args_without_limits() {
        let args = build_create_args(&ContainerConfig::new("img"));
        assert_eq!(args, vec!["create".to_string(), "img".to_string()]);
    }

    #[test]
    fn test_benign_stderr() {
        assert!(is_benign_stderr("Error: No such container: abc"));
        assert!(is_benign_stderr(
            "Error: no container with name or ID \"abc\" found: no such container"
        ));
        assert!(is_benign_stderr("Error response from daemon: container abc is not running"));
        assert!(!is_benign_stderr("permission denied while trying to connect"));
    }

    #[test]
    fn test_missing_image_stderr() {
        assert!(is_missing_image_stderr("Unable to find image 'x:latest' locally"));
        assert!(is_missing_image_stderr("Error: x: image not known"));
        assert!(!is_missing_image_stderr("port is already allocated"));
    }

    #[test]
    fn test_parse_ps_lines() {
        let stdout = "abc123\tlabdesk-7-aaaa\trunning\n\
                      def456\tlabdesk-9-bbbb,alias\texited\n\
                      0a0a0a\tunrelated\trunning\n\
                      \n";

        let all = parse_ps_lines(stdout, None);
        assert_eq!(all.len(), 3);

        let ours = parse_ps_lines(stdout, Some("labdesk-"));
        assert_eq!(ours.len(), 2);
        assert_eq!(ours[1].name, "labdesk-9-bbbb");
        assert!(ours[0].is_running());
        assert!(!ours[1].is_running());
    }

    #[test]
    fn test_validate_signal() {
        assert!(validate_signal("SIGTERM").is_ok());
        assert!(validate_signal("USR1").is_ok());
        assert!(validate_signal("").is_err());
        assert!(validate_signal("TERM; rm").is_err());
    }

    #[test]
    fn test_validate_container_id_or_name() {
        assert!(validate_container_id_or_name("abc123def456").is_ok());
        assert!(validate_container_id_or_name("labdesk-7-aaaa").is_ok());
        assert!(validate_container_id_or_name("").is_err());
        assert!(validate_container_id_or_name("a b").is_err());
    }
}
