//! Application settings.
//!
//! Layered from built-in defaults, a TOML file and `LABDESK__SECTION__KEY`
//! environment variables.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::backup::BackupLayout;
use crate::container::{ResourceLimits, RuntimeType};
use crate::ports::PortRange;
use crate::session::{PublicEndpoint, SessionServiceConfig};

pub const ENV_PREFIX: &str = "LABDESK";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub container: ContainerSettings,
    pub ports: PortsConfig,
    pub session: SessionSettings,
    pub backup: BackupConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Browser origins allowed to call the API.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// `docker` or `podman`; auto-detected when unset.
    pub runtime: Option<RuntimeType>,
    /// Custom engine binary path.
    pub binary: Option<String>,
    pub image: String,
    pub name_prefix: String,
    pub memory_limit: String,
    pub cpus: f64,
    pub pids_limit: u32,
    pub shm_size: Option<String>,
    pub display_container_port: u16,
    pub proxy_container_port: u16,
    /// 0 disables the cap.
    pub max_sessions: usize,
    pub shutdown_signal: String,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        let session = SessionServiceConfig::default();
        Self {
            runtime: None,
            binary: None,
            image: session.image,
            name_prefix: session.name_prefix,
            memory_limit: session.limits.memory,
            cpus: session.limits.cpus,
            pids_limit: session.limits.pids_limit,
            shm_size: session.limits.shm_size,
            display_container_port: session.display_container_port,
            proxy_container_port: session.proxy_container_port,
            max_sessions: session.max_sessions,
            shutdown_signal: session.shutdown_signal,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    pub display_start: u16,
    pub display_end: u16,
    pub proxy_start: u16,
    pub proxy_end: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            display_start: 5900,
            display_end: 5999,
            proxy_start: 6080,
            proxy_end: 6179,
        }
    }
}

impl PortsConfig {
    pub fn display_range(&self) -> PortRange {
        PortRange::new(self.display_start, self.display_end)
    }

    pub fn proxy_range(&self) -> PortRange {
        PortRange::new(self.proxy_start, self.proxy_end)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub public_host: String,
    pub public_scheme: String,
    pub web_path: String,
    pub inactivity_timeout_secs: u64,
    pub reaper_interval_secs: u64,
    pub readiness_timeout_secs: u64,
    pub readiness_poll_interval_secs: u64,
    pub readiness_log_lines: u32,
    pub ready_markers: Vec<String>,
    pub failure_markers: Vec<String>,
    /// Wait between the shutdown signal and the stop, for the backup upload.
    pub backup_grace_secs: u64,
    pub stop_timeout_secs: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let session = SessionServiceConfig::default();
        let public = PublicEndpoint::default();
        Self {
            public_host: public.host,
            public_scheme: public.scheme,
            web_path: public.web_path,
            inactivity_timeout_secs: session.inactivity_timeout.as_secs(),
            reaper_interval_secs: 30 * 60,
            readiness_timeout_secs: session.readiness_timeout.as_secs(),
            readiness_poll_interval_secs: session.readiness_poll_interval.as_secs(),
            readiness_log_lines: session.readiness_log_lines,
            ready_markers: session.ready_markers,
            failure_markers: session.failure_markers,
            backup_grace_secs: session.backup_grace.as_secs(),
            stop_timeout_secs: session.stop_timeout_secs,
        }
    }
}

impl SessionSettings {
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupBackend {
    #[default]
    S3,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub backend: BackupBackend,
    pub bucket: String,
    pub region: String,
    pub endpoint_url: Option<String>,
    pub prefix: String,
    pub latest_name: String,
    pub max_listed: usize,
    /// Root for the `local` backend. Defaults to `<data dir>/backups`.
    pub local_path: Option<String>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        let layout = BackupLayout::default();
        Self {
            backend: BackupBackend::S3,
            bucket: "labdesk-backups".to_string(),
            region: "us-east-1".to_string(),
            endpoint_url: None,
            prefix: layout.prefix,
            latest_name: layout.latest_name,
            max_listed: layout.max_listed,
            local_path: None,
        }
    }
}

impl BackupConfig {
    pub fn layout(&self) -> BackupLayout {
        BackupLayout {
            prefix: self.prefix.trim_matches('/').to_string(),
            latest_name: self.latest_name.clone(),
            max_listed: self.max_listed,
        }
    }

    /// Environment handed to every desktop so it can reach the store itself.
    pub fn container_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        match self.backend {
            BackupBackend::S3 => {
                env.insert("BACKUP_BACKEND".to_string(), "s3".to_string());
                env.insert("BACKUP_BUCKET".to_string(), self.bucket.clone());
                env.insert("AWS_DEFAULT_REGION".to_string(), self.region.clone());
                if let Some(endpoint) = &self.endpoint_url {
                    env.insert("BACKUP_ENDPOINT_URL".to_string(), endpoint.clone());
                }
            }
            BackupBackend::Local => {
                env.insert("BACKUP_BACKEND".to_string(), "local".to_string());
            }
        }
        env
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// JSONL audit file. Audit events go to the log when unset.
    pub file: Option<String>,
}

impl AppConfig {
    /// Build the orchestrator settings from the file sections.
    pub fn session_service_config(&self) -> SessionServiceConfig {
        let c = &self.container;
        let s = &self.session;
        SessionServiceConfig {
            image: c.image.clone(),
            name_prefix: c.name_prefix.clone(),
            limits: ResourceLimits {
                memory: c.memory_limit.clone(),
                cpus: c.cpus,
                pids_limit: c.pids_limit,
                shm_size: c.shm_size.clone(),
            },
            display_container_port: c.display_container_port,
            proxy_container_port: c.proxy_container_port,
            max_sessions: c.max_sessions,
            shutdown_signal: c.shutdown_signal.clone(),
            inactivity_timeout: s.inactivity_timeout(),
            readiness_timeout: Duration::from_secs(s.readiness_timeout_secs),
            readiness_poll_interval: Duration::from_secs(s.readiness_poll_interval_secs.max(1)),
            readiness_log_lines: s.readiness_log_lines,
            ready_markers: s.ready_markers.clone(),
            failure_markers: s.failure_markers.clone(),
            backup_grace: Duration::from_secs(s.backup_grace_secs),
            stop_timeout_secs: s.stop_timeout_secs,
            public: PublicEndpoint {
                host: s.public_host.clone(),
                scheme: s.public_scheme.clone(),
                web_path: s.web_path.clone(),
            },
            backup_layout: self.backup.layout(),
            backup_env: self.backup.container_env(),
        }
    }
}

/// Load the config file (missing is fine) with environment overrides.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let built = Config::builder()
        .add_source(
            File::from(path)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()
        .with_context(|| format!("loading config from {}", path.display()))?;

    let mut config: AppConfig = built
        .try_deserialize()
        .context("parsing configuration")?;

    if let Some(ref file) = config.audit.file {
        config.audit.file = Some(expand_str_path(file)?.display().to_string());
    }
    if let Some(ref local) = config.backup.local_path {
        config.backup.local_path = Some(expand_str_path(local)?.display().to_string());
    }

    Ok(config)
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}
