//! Container types and configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::error::{ContainerError, ContainerResult};

/// Port mapping configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port on the host.
    pub host_port: u16,
    /// Port in the container.
    pub container_port: u16,
}

impl PortMapping {
    pub fn new(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
        }
    }
}

/// Fixed resource ceilings applied to every lab desktop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling in engine syntax (e.g. `2g`).
    pub memory: String,
    /// CPU share (fractional CPUs).
    pub cpus: f64,
    /// Maximum number of processes inside the container.
    pub pids_limit: u32,
    /// Size of `/dev/shm`; desktop browsers need more than the engine default.
    pub shm_size: Option<String>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: "2g".to_string(),
            cpus: 1.0,
            pids_limit: 512,
            shm_size: Some("512m".to_string()),
        }
    }
}

/// Configuration for creating a new container.
///
/// Maps are ordered so the generated command line is deterministic.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Container name (optional).
    pub name: Option<String>,
    /// Docker/OCI image to use.
    pub image: String,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Port mappings.
    pub ports: Vec<PortMapping>,
    /// Labels for the container.
    pub labels: BTreeMap<String, String>,
    /// Resource ceilings; `None` leaves the engine defaults in place.
    pub limits: Option<ResourceLimits>,
    /// `--security-opt` values (e.g. `no-new-privileges`).
    pub security_opts: Vec<String>,
}

impl ContainerConfig {
    /// Create a new container config with the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Validate all container configuration fields.
    ///
    /// This should be called before creating a container to ensure all inputs
    /// are safe and well-formed.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;

        if let Some(ref name) = self.name {
            validate_container_name(name)?;
        }

        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }

        for (key, value) in &self.labels {
            validate_label(key, value)?;
        }

        for port in &self.ports {
            if port.host_port == 0 || port.container_port == 0 {
                return Err(ContainerError::InvalidInput(
                    "port mappings cannot use port 0".to_string(),
                ));
            }
        }

        if let Some(ref limits) = self.limits {
            validate_limits(limits)?;
        }

        Ok(())
    }

    /// Set the container name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add a port mapping.
    pub fn port(mut self, host_port: u16, container_port: u16) -> Self {
        self.ports.push(PortMapping::new(host_port, container_port));
        self
    }

    /// Add a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Apply resource ceilings.
    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Add a `--security-opt` value.
    pub fn security_opt(mut self, opt: impl Into<String>) -> Self {
        self.security_opts.push(opt.into());
        self
    }
}

/// One row of `ps` output, restricted to what the status reporter needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    /// Container ID.
    pub id: String,
    /// Primary container name.
    pub name: String,
    /// Engine state string (`running`, `exited`, ...).
    pub state: String,
}

impl ContainerSummary {
    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running")
    }
}

/// Reduce an arbitrary identifier to characters that are safe inside
/// container names and labels. Anything else becomes `-`.
pub fn sanitize_name_component(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .take(48)
        .collect();

    if cleaned.is_empty() {
        "anon".to_string()
    } else {
        cleaned
    }
}

// ============================================================================
// Input Validation Functions
// ============================================================================

/// Validate a Docker/OCI image name.
///
/// Image names follow the pattern: `[registry/][namespace/]name[:tag][@digest]`
/// Valid characters: alphanumeric, `.`, `-`, `_`, `/`, `:`, `@`
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric()
            || c == '.'
            || c == '-'
            || c == '_'
            || c == '/'
            || c == ':'
            || c == '@'
    };

    if !image.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{}' contains invalid characters; only alphanumeric, '.', '-', '_', '/', ':', '@' are allowed",
            image
        )));
    }

    if image.contains("..") {
        return Err(ContainerError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}

/// Validate a container name.
///
/// Container names must be alphanumeric with hyphens and underscores.
/// They must start with an alphanumeric character or underscore.
pub(crate) fn validate_container_name(name: &str) -> ContainerResult<()> {
    let Some(first_char) = name.chars().next() else {
        return Err(ContainerError::InvalidInput(
            "container name cannot be empty".to_string(),
        ));
    };

    if name.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container name exceeds maximum length of 128 characters".to_string(),
        ));
    }

    if !first_char.is_ascii_alphanumeric() && first_char != '_' {
        return Err(ContainerError::InvalidInput(
            "container name must start with an alphanumeric character or underscore".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !name.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container name '{}' contains invalid characters; only alphanumeric, '-', '_' are allowed",
            name
        )));
    }

    Ok(())
}

/// Validate an environment variable key.
///
/// Environment variable names follow POSIX conventions:
/// alphanumeric and underscores, starting with a letter or underscore.
fn validate_env_var_key(key: &str) -> ContainerResult<()> {
    let Some(first_char) = key.chars().next() else {
        return Err(ContainerError::InvalidInput(
            "environment variable key cannot be empty".to_string(),
        ));
    };

    if key.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "environment variable key exceeds maximum length of 256 characters".to_string(),
        ));
    }

    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' must start with a letter or underscore",
            key
        )));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '_';
    if !key.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' contains invalid characters; only alphanumeric and '_' are allowed",
            key
        )));
    }

    Ok(())
}

/// Validate a label key/value pair.
fn validate_label(key: &str, value: &str) -> ContainerResult<()> {
    if key.is_empty() {
        return Err(ContainerError::InvalidInput(
            "label key cannot be empty".to_string(),
        ));
    }

    let valid_key = |c: char| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_';
    if !key.chars().all(valid_key) {
        return Err(ContainerError::InvalidInput(format!(
            "label key '{}' contains invalid characters",
            key
        )));
    }

    if value.contains('\0') || value.contains('\n') {
        return Err(ContainerError::InvalidInput(format!(
            "label '{}' has a value with control characters",
            key
        )));
    }

    Ok(())
}

/// Validate resource ceilings.
fn validate_limits(limits: &ResourceLimits) -> ContainerResult<()> {
    let size_ok = |s: &str| {
        let digits = s.trim_end_matches(|c: char| matches!(c, 'b' | 'k' | 'm' | 'g'));
        !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
    };

    if !size_ok(&limits.memory) {
        return Err(ContainerError::InvalidInput(format!(
            "memory limit '{}' must be a number with an optional b/k/m/g suffix",
            limits.memory
        )));
    }

    if let Some(ref shm) = limits.shm_size
        && !size_ok(shm)
    {
        return Err(ContainerError::InvalidInput(format!(
            "shm size '{}' must be a number with an optional b/k/m/g suffix",
            shm
        )));
    }

    if !(limits.cpus > 0.0 && limits.cpus.is_finite()) {
        return Err(ContainerError::InvalidInput(
            "cpu share must be a positive number".to_string(),
        ));
    }

    if limits.pids_limit == 0 {
        return Err(ContainerError::InvalidInput(
            "pids limit must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod validation_tests {
    use super::*;

    #[test]
    fn test_validate_image_name_valid() {
        assert!(validate_image_name("labdesk-desktop").is_ok());
        assert!(validate_image_name("labdesk-desktop:latest").is_ok());
        assert!(validate_image_name("library/ubuntu:22.04").is_ok());
        assert!(validate_image_name("registry.example.io/labs/desktop:v1.0").is_ok());
        assert!(validate_image_name("gcr.io/project/image@sha256:abc123").is_ok());
    }

    #[test]
    fn test_validate_image_name_invalid() {
        assert!(validate_image_name("").is_err());
        assert!(validate_image_name("image with spaces").is_err());
        assert!(validate_image_name("image;rm -rf /").is_err());
        assert!(validate_image_name("image$(whoami)").is_err());
        assert!(validate_image_name("../../../etc/passwd").is_err());
    }

    #[test]
    fn test_validate_container_name() {
        assert!(validate_container_name("labdesk-7-1a2b3c4d").is_ok());
        assert!(validate_container_name("_private").is_ok());
        assert!(validate_container_name("").is_err());
        assert!(validate_container_name("-starts-with-dash").is_err());
        assert!(validate_container_name("has;semicolon").is_err());
    }

    #[test]
    fn test_validate_env_var_key() {
        assert!(validate_env_var_key("USER_ID").is_ok());
        assert!(validate_env_var_key("_PRIVATE").is_ok());
        assert!(validate_env_var_key("123VAR").is_err());
        assert!(validate_env_var_key("MY-VAR").is_err());
        assert!(validate_env_var_key("").is_err());
    }

    #[test]
    fn test_validate_label() {
        assert!(validate_label("labdesk.user", "7").is_ok());
        assert!(validate_label("", "x").is_err());
        assert!(validate_label("bad key", "x").is_err());
        assert!(validate_label("labdesk.user", "a\nb").is_err());
    }

    #[test]
    fn test_validate_limits() {
        assert!(validate_limits(&ResourceLimits::default()).is_ok());

        let bad_memory = ResourceLimits {
            memory: "lots".to_string(),
            ..Default::default()
        };
        assert!(validate_limits(&bad_memory).is_err());

        let bad_cpus = ResourceLimits {
            cpus: 0.0,
            ..Default::default()
        };
        assert!(validate_limits(&bad_cpus).is_err());

        let bad_pids = ResourceLimits {
            pids_limit: 0,
            ..Default::default()
        };
        assert!(validate_limits(&bad_pids).is_err());
    }

    #[test]
    fn test_container_config_validate() {
        let config = ContainerConfig::new("labdesk-desktop:latest")
            .name("labdesk-7-abcdef12")
            .env("USER_ID", "7")
            .port(5900, 5901)
            .label("labdesk.user", "7")
            .limits(ResourceLimits::default())
            .security_opt("no-new-privileges");

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_container_config_rejects_zero_port() {
        let config = ContainerConfig::new("labdesk-desktop").port(0, 5901);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sanitize_name_component() {
        assert_eq!(sanitize_name_component("7"), "7");
        assert_eq!(sanitize_name_component("alice@example.com"), "alice-example-com");
        assert_eq!(sanitize_name_component("../etc"), "---etc");
        assert_eq!(sanitize_name_component("  "), "anon");
    }

    #[test]
    fn test_container_config_validate_invalid_name() {
        let config = ContainerConfig::new("labdesk-desktop").name("invalid;name");
        assert!(config.validate().is_err());
    }
}
