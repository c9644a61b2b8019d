//! Session registry and lifecycle orchestration.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::error::{SessionError, SessionResult};
use super::models::{
    PublicEndpoint, Session, SessionStatus, SessionUrls, TerminationOutcome, UserSessionStatus,
};
use super::readiness::{LogMarkerProbe, ReadinessError, ReadinessProbe, wait_until_ready};
use super::teardown::TeardownPlan;
use super::timers::SessionTimers;
use crate::audit::{LogAuditSink, SessionAuditSink};
use crate::backup::BackupLayout;
use crate::container::{
    ContainerConfig, ContainerRuntimeApi, ResourceLimits, sanitize_name_component,
};
use crate::ports::PortAllocator;

/// Default container image.
const DEFAULT_IMAGE: &str = "labdesk-desktop:latest";

/// Default container name prefix.
const DEFAULT_NAME_PREFIX: &str = "labdesk";

/// Session service configuration.
#[derive(Debug, Clone)]
pub struct SessionServiceConfig {
    /// Desktop image.
    pub image: String,
    /// Prefix of every container name this service creates.
    pub name_prefix: String,
    /// Per-container resource ceilings.
    pub limits: ResourceLimits,
    /// Remote-display port inside the container.
    pub display_container_port: u16,
    /// Browser proxy port inside the container.
    pub proxy_container_port: u16,
    /// Maximum number of sessions on this host (0 = unlimited).
    pub max_sessions: usize,
    /// Signal that tells the desktop to upload its backup.
    pub shutdown_signal: String,
    /// Inactivity window after which a session is terminated.
    pub inactivity_timeout: Duration,
    pub readiness_timeout: Duration,
    pub readiness_poll_interval: Duration,
    /// Number of output lines the readiness probe inspects.
    pub readiness_log_lines: u32,
    pub ready_markers: Vec<String>,
    pub failure_markers: Vec<String>,
    /// Fixed wait between the shutdown signal and the stop.
    pub backup_grace: Duration,
    /// Grace the engine gives the container on stop.
    pub stop_timeout_secs: u32,
    /// Host and scheme clients use to reach desktops.
    pub public: PublicEndpoint,
    /// Backup key layout, passed to the desktop.
    pub backup_layout: BackupLayout,
    /// Static storage routing variables (bucket, region, endpoint).
    pub backup_env: BTreeMap<String, String>,
}

impl Default for SessionServiceConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            limits: ResourceLimits::default(),
            display_container_port: 5901,
            proxy_container_port: 6080,
            max_sessions: SessionService::DEFAULT_MAX_SESSIONS,
            shutdown_signal: "SIGTERM".to_string(),
            inactivity_timeout: Duration::from_secs(2 * 60 * 60),
            readiness_timeout: Duration::from_secs(180),
            readiness_poll_interval: Duration::from_secs(3),
            readiness_log_lines: 50,
            ready_markers: vec!["LABDESK_READY".to_string()],
            failure_markers: vec!["LABDESK_FAILED".to_string()],
            backup_grace: Duration::from_secs(30),
            stop_timeout_secs: 10,
            public: PublicEndpoint::default(),
            backup_layout: BackupLayout::default(),
            backup_env: BTreeMap::new(),
        }
    }
}

/// Owns every live session on this host.
///
/// Registry mutation for a user happens under that user's lock. Slow work
/// (readiness polling, the backup grace wait) runs outside the lock; the
/// `starting`/`terminating` status keeps other callers out meanwhile.
#[derive(Clone)]
pub struct SessionService {
    runtime: Arc<dyn ContainerRuntimeApi>,
    readiness: Arc<dyn ReadinessProbe>,
    audit: Arc<dyn SessionAuditSink>,
    ports: Arc<PortAllocator>,
    registry: Arc<DashMap<String, Session>>,
    user_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    timers: Arc<SessionTimers>,
    config: Arc<SessionServiceConfig>,
}

impl SessionService {
    pub const DEFAULT_MAX_SESSIONS: usize = 25;

    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        ports: Arc<PortAllocator>,
        config: SessionServiceConfig,
    ) -> Self {
        let readiness = Arc::new(LogMarkerProbe::new(
            runtime.clone(),
            config.ready_markers.clone(),
            config.failure_markers.clone(),
            config.readiness_log_lines,
        ));

        Self {
            runtime,
            readiness,
            audit: Arc::new(LogAuditSink),
            ports,
            registry: Arc::new(DashMap::new()),
            user_locks: Arc::new(DashMap::new()),
            timers: Arc::new(SessionTimers::new()),
            config: Arc::new(config),
        }
    }

    /// Replace the readiness probe.
    pub fn with_readiness(mut self, readiness: Arc<dyn ReadinessProbe>) -> Self {
        self.readiness = readiness;
        self
    }

    /// Replace the audit sink.
    pub fn with_audit(mut self, audit: Arc<dyn SessionAuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn config(&self) -> &SessionServiceConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntimeApi> {
        &self.runtime
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// Connection URLs for a session.
    pub fn urls(&self, session: &Session) -> SessionUrls {
        self.config.public.urls_for(session)
    }

    /// Number of registry entries, in any state.
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Copy of every registry entry.
    pub fn sessions(&self) -> Vec<Session> {
        self.registry.iter().map(|e| e.value().clone()).collect()
    }

    pub fn has_timer(&self, user_id: &str) -> bool {
        self.timers.is_armed(user_id)
    }

    fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.user_locks
            .entry(user_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Forget the user's lock once nobody holds it and they have no session.
    fn prune_user_lock(&self, user_id: &str) {
        if self.registry.contains_key(user_id) {
            return;
        }
        self.user_locks
            .remove_if(user_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn lookup(&self, user_id: &str) -> Option<Session> {
        self.registry.get(user_id).map(|e| e.value().clone())
    }

    /// Start a desktop for `user_id`, or return the one already running.
    pub async fn create_session(&self, user_id: &str, lab_id: &str) -> SessionResult<Session> {
        validate_identifier("user id", user_id)?;
        validate_identifier("lab id", lab_id)?;

        let result = self.start_session(user_id, lab_id).await;
        self.prune_user_lock(user_id);
        result
    }

    async fn start_session(&self, user_id: &str, lab_id: &str) -> SessionResult<Session> {
        let lock = self.user_lock(user_id);
        let mut session = {
            let _guard = lock.lock().await;

            if let Some(existing) = self.lookup(user_id) {
                if existing.status.is_transitional() {
                    return Err(SessionError::Busy(existing.status.to_string()));
                }
                match self.runtime.is_running(existing.container_ref()).await {
                    Ok(true) => {
                        debug!("Reusing session {} for user {}", existing.id, user_id);
                        return Ok(existing);
                    }
                    Ok(false) => self.evict_stale(&existing).await,
                    Err(e) => {
                        warn!(
                            "Failed to check container {} for user {}: {}",
                            existing.container_ref(),
                            user_id,
                            e
                        );
                        return Ok(existing);
                    }
                }
            }

            let max = self.config.max_sessions;
            if max > 0 && self.registry.len() >= max {
                warn!("Refusing session for user {}: {} sessions running", user_id, max);
                return Err(SessionError::CapacityExceeded(max));
            }

            let lease = self.ports.allocate_pair()?;
            let id = Uuid::new_v4().to_string();
            let now = Utc::now();
            let placeholder = Session {
                container_name: format!(
                    "{}-{}-{}",
                    self.config.name_prefix,
                    sanitize_name_component(user_id),
                    &id[..8]
                ),
                id,
                user_id: user_id.to_string(),
                lab_id: lab_id.to_string(),
                container_id: None,
                display_port: lease.display,
                proxy_port: lease.proxy,
                status: SessionStatus::Starting,
                created_at: now,
                last_accessed_at: now,
            };
            self.registry
                .insert(user_id.to_string(), placeholder.clone());
            placeholder
        };

        info!(
            "Starting desktop {} for user {} lab {} (ports {}/{})",
            session.container_name, user_id, lab_id, session.display_port, session.proxy_port
        );

        if let Err(e) = self.start_desktop(&mut session).await {
            warn!("Desktop {} failed to start: {}", session.container_name, e);
            self.rollback(&session).await;
            return Err(e);
        }

        {
            let _guard = lock.lock().await;
            let still_ours = self
                .registry
                .get(user_id)
                .is_some_and(|e| e.value().id == session.id);
            if !still_ours {
                // Shutdown reclaimed the placeholder and its ports.
                warn!("Desktop {} was abandoned during startup", session.container_name);
                self.remove_abandoned(session.container_ref()).await;
                return Err(SessionError::StartupFailed(
                    "session was abandoned during startup".to_string(),
                ));
            }
            session.status = SessionStatus::Running;
            session.last_accessed_at = Utc::now();
            self.registry.insert(user_id.to_string(), session.clone());
            self.arm_timer(&session);
        }

        info!("Session {} running for user {}", session.id, user_id);
        self.audit.session_created(&session).await;
        Ok(session)
    }

    fn container_config(&self, session: &Session) -> ContainerConfig {
        let layout = &self.config.backup_layout;
        let mut config = ContainerConfig::new(&self.config.image)
            .name(&session.container_name)
            .label("labdesk.managed", "true")
            .label("labdesk.session", &session.id)
            .label("labdesk.user", sanitize_name_component(&session.user_id))
            .port(session.display_port, self.config.display_container_port)
            .port(session.proxy_port, self.config.proxy_container_port)
            .env("USER_ID", &session.user_id)
            .env("LAB_ID", &session.lab_id)
            .env("SESSION_ID", &session.id)
            .env("DISPLAY_PORT", self.config.display_container_port.to_string())
            .env("PROXY_PORT", self.config.proxy_container_port.to_string())
            .env("BACKUP_PREFIX", layout.user_prefix(&session.user_id))
            .env("BACKUP_LATEST_KEY", layout.latest_key(&session.user_id))
            .limits(self.config.limits.clone())
            .security_opt("no-new-privileges");

        for (key, value) in &self.config.backup_env {
            config = config.env(key, value);
        }
        config
    }

    async fn start_desktop(&self, session: &mut Session) -> SessionResult<()> {
        let config = self.container_config(session);
        let container_id = self.runtime.create_container(&config).await?;
        session.container_id = Some(container_id.clone());

        self.runtime.start_container(&container_id).await?;

        wait_until_ready(
            self.readiness.as_ref(),
            &container_id,
            self.config.readiness_timeout,
            self.config.readiness_poll_interval,
        )
        .await
        .map_err(|e| match e {
            ReadinessError::TimedOut(d) => SessionError::ReadinessTimeout(d.as_secs()),
            ReadinessError::Failed(reason) => SessionError::StartupFailed(reason),
        })
    }

    /// Undo a failed start: placeholder, container, ports.
    async fn rollback(&self, session: &Session) {
        let owned = {
            let lock = self.user_lock(&session.user_id);
            let _guard = lock.lock().await;
            self.registry
                .remove_if(&session.user_id, |_, s| s.id == session.id)
                .is_some()
        };
        if !owned {
            // Shutdown already took the placeholder and released its ports.
            self.remove_abandoned(session.container_ref()).await;
            return;
        }

        let report = TeardownPlan::forced()
            .execute(
                self.runtime.as_ref(),
                &self.ports,
                session.container_ref(),
                session.ports(),
            )
            .await;
        if !report.failures.is_empty() {
            warn!(
                "Rollback of {} left {} failed step(s)",
                session.container_name,
                report.failures.len()
            );
        }
    }

    async fn remove_abandoned(&self, container: &str) {
        if let Err(e) = self.runtime.remove_container(container, true).await {
            warn!("Failed to remove abandoned container {}: {}", container, e);
        }
    }

    /// Drop a session whose container is no longer running. Caller holds the
    /// user lock.
    async fn evict_stale(&self, session: &Session) {
        info!(
            "Container {} for user {} is not running, evicting session {}",
            session.container_ref(),
            session.user_id,
            session.id
        );
        self.timers.cancel(&session.user_id);
        TeardownPlan::forced()
            .execute(
                self.runtime.as_ref(),
                &self.ports,
                session.container_ref(),
                session.ports(),
            )
            .await;
        self.registry
            .remove_if(&session.user_id, |_, s| s.id == session.id);

        let mut gone = session.clone();
        gone.status = SessionStatus::Terminated;
        self.audit.session_terminated(&gone, false).await;
    }

    /// Re-check a running session's container. Caller holds the user lock.
    async fn confirm_live(&self, session: Session) -> SessionResult<Session> {
        if session.status != SessionStatus::Running {
            return Ok(session);
        }

        match self.runtime.is_running(session.container_ref()).await {
            Ok(true) => Ok(session),
            Ok(false) => {
                self.evict_stale(&session).await;
                Err(SessionError::NotFound)
            }
            Err(e) => {
                warn!(
                    "Failed to check container {} for session {}: {}",
                    session.container_ref(),
                    session.id,
                    e
                );
                Ok(session)
            }
        }
    }

    /// Arm the inactivity deadline for `session`. Caller holds the user lock.
    fn arm_timer(&self, session: &Session) {
        let service = self.clone();
        let user = session.user_id.clone();
        let session_id = session.id.clone();
        self.timers
            .arm(&session.user_id, self.config.inactivity_timeout, move || {
                async move {
                    match service.terminate_expired(&user, &session_id).await {
                        Ok(Some(outcome)) => info!(
                            "Terminated inactive session of user {} (data persisted: {})",
                            user, outcome.data_persisted
                        ),
                        Ok(None) => debug!("Deadline for user {} was superseded", user),
                        Err(SessionError::NotFound) => {}
                        Err(e) => warn!("Inactivity termination for user {} failed: {}", user, e),
                    }
                }
                .boxed()
            });
    }

    /// Terminate on an expired deadline, unless the deadline was replaced
    /// before the user lock was acquired. Arming also happens under the user
    /// lock, so a fresh deadline means the session was used after this one
    /// was set.
    async fn terminate_expired(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> SessionResult<Option<TerminationOutcome>> {
        let result = match self
            .begin_termination(user_id, |s| {
                s.id == session_id && !self.timers.is_armed(user_id)
            })
            .await
        {
            Ok(Some(session)) => Ok(Some(self.finish_termination(session).await)),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };
        self.prune_user_lock(user_id);
        result
    }

    /// Look up the user's session, evicting it if its container died.
    pub async fn get_session(&self, user_id: &str) -> SessionResult<Session> {
        let result = self.get_session_locked(user_id).await;
        self.prune_user_lock(user_id);
        result
    }

    async fn get_session_locked(&self, user_id: &str) -> SessionResult<Session> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let session = self.lookup(user_id).ok_or(SessionError::NotFound)?;
        self.confirm_live(session).await
    }

    /// Refresh the user's last access time and push back the inactivity deadline.
    pub async fn extend_session(&self, user_id: &str) -> SessionResult<Session> {
        self.extend_session_at(user_id, Utc::now()).await
    }

    /// [`Self::extend_session`] with an explicit access time.
    pub async fn extend_session_at(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> SessionResult<Session> {
        let result = self.extend_session_locked(user_id, at).await;
        self.prune_user_lock(user_id);
        result
    }

    async fn extend_session_locked(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> SessionResult<Session> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let session = self.lookup(user_id).ok_or(SessionError::NotFound)?;
        if session.status.is_transitional() {
            return Err(SessionError::Busy(session.status.to_string()));
        }

        let mut session = self.confirm_live(session).await?;
        session.last_accessed_at = at;
        self.registry.insert(user_id.to_string(), session.clone());
        self.arm_timer(&session);

        debug!("Extended session {} for user {}", session.id, user_id);
        Ok(session)
    }

    /// Terminate the user's session, giving the desktop time to back up.
    pub async fn terminate_session(&self, user_id: &str) -> SessionResult<TerminationOutcome> {
        let result = match self.begin_termination(user_id, |_| true).await {
            Ok(Some(session)) => Ok(self.finish_termination(session).await),
            Ok(None) => Err(SessionError::NotFound),
            Err(e) => Err(e),
        };
        self.prune_user_lock(user_id);
        result
    }

    /// Terminate the user's session only if it has been idle longer than
    /// `window` at `now`. Returns `None` when the session is not idle.
    pub async fn terminate_if_idle(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        window: chrono::Duration,
    ) -> SessionResult<Option<TerminationOutcome>> {
        let result = match self
            .begin_termination(user_id, |s| s.is_idle(now, window))
            .await
        {
            Ok(Some(session)) => Ok(Some(self.finish_termination(session).await)),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };
        self.prune_user_lock(user_id);
        result
    }

    /// Mark the session terminating under the user lock.
    async fn begin_termination<F>(&self, user_id: &str, should: F) -> SessionResult<Option<Session>>
    where
        F: FnOnce(&Session) -> bool,
    {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let mut session = self.lookup(user_id).ok_or(SessionError::NotFound)?;
        if session.status.is_transitional() {
            return Err(SessionError::Busy(session.status.to_string()));
        }
        if !should(&session) {
            return Ok(None);
        }

        session.status = SessionStatus::Terminating;
        self.registry.insert(user_id.to_string(), session.clone());
        self.timers.cancel(user_id);
        Ok(Some(session))
    }

    async fn finish_termination(&self, mut session: Session) -> TerminationOutcome {
        info!(
            "Terminating session {} for user {} ({})",
            session.id,
            session.user_id,
            session.container_ref()
        );

        let plan = TeardownPlan::graceful(
            &self.config.shutdown_signal,
            self.config.backup_grace,
            self.config.stop_timeout_secs,
        );
        let report = plan
            .execute(
                self.runtime.as_ref(),
                &self.ports,
                session.container_ref(),
                session.ports(),
            )
            .await;

        {
            let lock = self.user_lock(&session.user_id);
            let _guard = lock.lock().await;
            self.registry
                .remove_if(&session.user_id, |_, s| s.id == session.id);
        }

        if !report.failures.is_empty() {
            warn!(
                "Session {} terminated with {} failed teardown step(s)",
                session.id,
                report.failures.len()
            );
        }

        session.status = SessionStatus::Terminated;
        self.audit
            .session_terminated(&session, report.signal_delivered)
            .await;

        TerminationOutcome {
            status: SessionStatus::Terminated,
            data_persisted: report.signal_delivered,
        }
    }

    /// Non-destructive status probe for the user.
    pub async fn session_status(&self, user_id: &str) -> UserSessionStatus {
        match self.get_session(user_id).await {
            Ok(session) => UserSessionStatus {
                has_session: true,
                is_running: session.status == SessionStatus::Running,
                session: Some(session),
            },
            Err(_) => UserSessionStatus {
                has_session: false,
                is_running: false,
                session: None,
            },
        }
    }

    /// Remove containers that carry our name prefix but have no registry entry.
    ///
    /// Run once at startup, before any session exists.
    pub async fn startup_cleanup(&self) -> anyhow::Result<usize> {
        info!("Running startup cleanup...");

        let prefix = format!("{}-", self.config.name_prefix);
        let containers = self.runtime.list_containers(true, Some(&prefix)).await?;

        let known: HashSet<String> = self
            .registry
            .iter()
            .flat_map(|e| {
                let s = e.value();
                [Some(s.container_name.clone()), s.container_id.clone()]
            })
            .flatten()
            .collect();

        let mut cleaned = 0;
        for container in containers {
            if known.contains(&container.id) || known.contains(&container.name) {
                continue;
            }
            info!("Removing orphan container {} ({})", container.name, container.id);
            match self.runtime.remove_container(&container.id, true).await {
                Ok(()) => cleaned += 1,
                Err(e) => warn!("Failed to remove orphan container {}: {}", container.name, e),
            }
        }

        info!("Startup cleanup complete ({} orphan(s) removed)", cleaned);
        Ok(cleaned)
    }

    /// Terminate every session, concurrently. Used on shutdown.
    pub async fn shutdown_all_sessions(&self) -> usize {
        let users: Vec<String> = self.registry.iter().map(|e| e.key().clone()).collect();
        if users.is_empty() {
            return 0;
        }

        info!("Terminating {} session(s) before shutdown", users.len());
        let results =
            futures::future::join_all(users.iter().map(|u| self.terminate_session(u))).await;

        let mut terminated = 0;
        for (user, result) in users.iter().zip(results) {
            match result {
                Ok(_) => terminated += 1,
                Err(SessionError::Busy(_)) => match self.lookup(user) {
                    Some(session) if session.status == SessionStatus::Starting => {
                        self.abandon_start(&session).await;
                        terminated += 1;
                    }
                    _ => warn!("Session of user {} is already terminating", user),
                },
                Err(e) => warn!("Failed to terminate session of user {}: {}", user, e),
            }
        }
        self.timers.cancel_all();
        terminated
    }

    /// Force-remove a desktop that is still starting. The creating task sees
    /// its placeholder gone and reports the start as failed.
    async fn abandon_start(&self, session: &Session) {
        info!(
            "Removing desktop {} of user {} mid-start",
            session.container_name, session.user_id
        );
        let lock = self.user_lock(&session.user_id);
        let _guard = lock.lock().await;
        let removed = self
            .registry
            .remove_if(&session.user_id, |_, s| s.id == session.id)
            .is_some();
        if !removed {
            return;
        }
        TeardownPlan::forced()
            .execute(
                self.runtime.as_ref(),
                &self.ports,
                session.container_ref(),
                session.ports(),
            )
            .await;
    }
}

fn validate_identifier(what: &str, value: &str) -> SessionResult<()> {
    if value.trim().is_empty() {
        return Err(SessionError::InvalidInput(format!("{} is required", what)));
    }
    if value.len() > 128 {
        return Err(SessionError::InvalidInput(format!("{} is too long", what)));
    }
    if value.chars().any(|c| c.is_control()) {
        return Err(SessionError::InvalidInput(format!(
            "{} contains control characters",
            what
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::readiness::Readiness;
    use crate::session::test_support::{ScriptedProbe, test_config, test_service};

    #[tokio::test]
    async fn create_allocates_first_ports_and_runs() {
        let (service, runtime) = test_service(test_config());

        let session = service.create_session("7", "12").await.unwrap();

        assert_eq!(session.status, SessionStatus::Running);
        assert_eq!((session.display_port, session.proxy_port), (5900, 6080));
        assert!(session.container_name.starts_with("labdesk-7-"));
        assert!(service.has_timer("7"));

        let config = runtime.last_config().unwrap();
        assert_eq!(config.env.get("USER_ID").map(String::as_str), Some("7"));
        assert_eq!(config.env.get("LAB_ID").map(String::as_str), Some("12"));
        assert_eq!(
            config.env.get("BACKUP_PREFIX").map(String::as_str),
            Some("backups/7/")
        );
        assert!(config.security_opts.contains(&"no-new-privileges".to_string()));
        assert_eq!(config.ports[0].container_port, 5901);

        let urls = service.urls(&session);
        assert_eq!(urls.display_url, "vnc://localhost:5900");
        assert_eq!(urls.web_url, "http://localhost:6080/vnc.html");
    }

    #[tokio::test]
    async fn create_is_idempotent_for_live_session() {
        let (service, runtime) = test_service(test_config());

        let first = service.create_session("7", "12").await.unwrap();
        let second = service.create_session("7", "99").await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.lab_id, "12");
        assert_eq!(runtime.created_count(), 1);
        assert!(!service.ports().is_allocated(5901));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_create_gets_busy_and_allocates_nothing() {
        let (service, runtime) = test_service(test_config());
        let service = service.with_readiness(Arc::new(ScriptedProbe::delayed(
            Readiness::Ready,
            Duration::from_secs(5),
        )));

        let (a, b) = tokio::join!(
            service.create_session("7", "12"),
            service.create_session("7", "99")
        );

        let a = a.unwrap();
        assert!(matches!(b, Err(SessionError::Busy(_))));
        assert_eq!((a.display_port, a.proxy_port), (5900, 6080));
        assert!(!service.ports().is_allocated(5901));
        assert!(!service.ports().is_allocated(6081));
        assert_eq!(runtime.created_count(), 1);
        assert_eq!(service.session_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_timeout_rolls_back() {
        let config = SessionServiceConfig {
            readiness_timeout: Duration::from_secs(10),
            ..test_config()
        };
        let (service, runtime) = test_service(config);
        let service = service.with_readiness(Arc::new(ScriptedProbe::new(Readiness::Pending)));

        let err = service.create_session("7", "12").await.unwrap_err();

        assert!(matches!(err, SessionError::ReadinessTimeout(10)));
        assert_eq!(service.session_count(), 0);
        assert!(!service.ports().is_allocated(5900));
        assert_eq!(runtime.container_count(), 0);
        assert!(!service.has_timer("7"));
    }

    #[tokio::test]
    async fn failure_marker_is_startup_failed() {
        let (service, runtime) = test_service(test_config());
        let service = service.with_readiness(Arc::new(ScriptedProbe::new(Readiness::Failed(
            "LABDESK_FAILED: vnc".to_string(),
        ))));

        let err = service.create_session("7", "12").await.unwrap_err();

        assert!(matches!(err, SessionError::StartupFailed(ref m) if m.contains("vnc")));
        assert_eq!(service.session_count(), 0);
        assert_eq!(runtime.container_count(), 0);
    }

    #[tokio::test]
    async fn admission_failure_releases_ports() {
        let (service, runtime) = test_service(test_config());
        runtime.set_fail_create(true);

        let err = service.create_session("7", "12").await.unwrap_err();
        assert!(matches!(err, SessionError::Admission(_)));
        assert!(!service.ports().is_allocated(5900));
        assert_eq!(service.session_count(), 0);

        runtime.set_fail_create(false);
        let session = service.create_session("7", "12").await.unwrap();
        assert_eq!(session.display_port, 5900);
    }

    #[tokio::test]
    async fn capacity_cap_is_enforced() {
        let config = SessionServiceConfig {
            max_sessions: 1,
            ..test_config()
        };
        let (service, _runtime) = test_service(config);

        service.create_session("7", "12").await.unwrap();
        let err = service.create_session("8", "12").await.unwrap_err();

        assert!(matches!(err, SessionError::CapacityExceeded(1)));
        assert!(!service.ports().is_allocated(5901));
    }

    #[tokio::test]
    async fn get_session_evicts_dead_container() {
        let (service, runtime) = test_service(test_config());
        let session = service.create_session("7", "12").await.unwrap();

        runtime.kill(session.container_id.as_deref().unwrap());

        assert!(matches!(
            service.get_session("7").await,
            Err(SessionError::NotFound)
        ));
        assert_eq!(service.session_count(), 0);
        assert!(!service.ports().is_allocated(5900));
        assert!(!service.has_timer("7"));
        assert_eq!(runtime.container_count(), 0);
    }

    #[tokio::test]
    async fn engine_error_leaves_entry_alone() {
        let (service, runtime) = test_service(test_config());
        service.create_session("7", "12").await.unwrap();

        runtime.set_inspect_error(true);
        assert!(service.get_session("7").await.is_ok());
        assert_eq!(service.session_count(), 1);
    }

    #[tokio::test]
    async fn create_replaces_stale_session() {
        let (service, runtime) = test_service(test_config());
        let old = service.create_session("7", "12").await.unwrap();
        runtime.kill(old.container_id.as_deref().unwrap());

        let new = service.create_session("7", "13").await.unwrap();

        assert_ne!(old.id, new.id);
        assert_eq!(new.lab_id, "13");
        // The stale session's ports were released first and handed out again.
        assert_eq!(new.display_port, 5900);
        assert_eq!(runtime.container_count(), 1);
    }

    #[tokio::test]
    async fn extend_refreshes_access_time() {
        let (service, _runtime) = test_service(test_config());
        let session = service.create_session("7", "12").await.unwrap();

        let later = session.last_accessed_at + chrono::Duration::seconds(600);
        let extended = service.extend_session_at("7", later).await.unwrap();

        assert_eq!(extended.last_accessed_at, later);
        assert_eq!(service.get_session("7").await.unwrap().last_accessed_at, later);
        assert!(service.has_timer("7"));
        assert!(matches!(
            service.extend_session("8").await,
            Err(SessionError::NotFound)
        ));
    }

    #[tokio::test]
    async fn terminate_then_not_found_and_ports_reused() {
        let (service, runtime) = test_service(test_config());
        service.create_session("7", "12").await.unwrap();

        let outcome = service.terminate_session("7").await.unwrap();
        assert_eq!(outcome.status, SessionStatus::Terminated);
        assert!(outcome.data_persisted);
        assert_eq!(runtime.signals(), vec!["SIGTERM".to_string()]);

        assert!(matches!(
            service.terminate_session("7").await,
            Err(SessionError::NotFound)
        ));
        assert!(!service.has_timer("7"));

        let next = service.create_session("8", "12").await.unwrap();
        assert_eq!((next.display_port, next.proxy_port), (5900, 6080));
    }

    #[tokio::test]
    async fn terminate_with_engine_down_still_clears_registry() {
        let (service, runtime) = test_service(test_config());
        service.create_session("7", "12").await.unwrap();

        runtime.set_fail_teardown(true);
        let outcome = service.terminate_session("7").await.unwrap();

        assert!(!outcome.data_persisted);
        assert_eq!(service.session_count(), 0);
        assert!(!service.ports().is_allocated(5900));
        assert!(!service.ports().is_allocated(6080));
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_during_start_is_busy() {
        let (service, _runtime) = test_service(test_config());
        let service = service.with_readiness(Arc::new(ScriptedProbe::delayed(
            Readiness::Ready,
            Duration::from_secs(5),
        )));

        let (created, terminated) = tokio::join!(service.create_session("7", "12"), async {
            tokio::task::yield_now().await;
            service.terminate_session("7").await
        });

        assert!(created.is_ok());
        assert!(matches!(terminated, Err(SessionError::Busy(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn inactivity_timer_terminates() {
        let config = SessionServiceConfig {
            inactivity_timeout: Duration::from_secs(60),
            ..test_config()
        };
        let (service, runtime) = test_service(config);
        service.create_session("7", "12").await.unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(service.session_count(), 0);
        assert!(!service.ports().is_allocated(5900));
        assert_eq!(runtime.container_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn extend_racing_the_deadline_keeps_session() {
        let config = SessionServiceConfig {
            inactivity_timeout: Duration::from_secs(60),
            ..test_config()
        };
        let (service, runtime) = test_service(config);
        service.create_session("7", "12").await.unwrap();

        tokio::time::sleep(Duration::from_millis(59_500)).await;
        // The liveness check is still running when the old deadline passes.
        runtime.set_inspect_delay(Duration::from_secs(1));
        service.extend_session("7").await.unwrap();
        runtime.set_inspect_delay(Duration::ZERO);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(service.session_count(), 1);
        assert!(service.has_timer("7"));
        assert_eq!(runtime.container_count(), 1);

        // The replacement deadline still applies.
        tokio::time::sleep(Duration::from_secs(61)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(service.session_count(), 0);
        assert_eq!(runtime.container_count(), 0);
    }

    #[tokio::test]
    async fn user_locks_are_dropped_with_the_session() {
        let (service, _runtime) = test_service(test_config());

        assert!(service.get_session("ghost").await.is_err());
        assert!(!service.session_status("ghost").await.has_session);
        assert!(service.extend_session("ghost").await.is_err());
        assert!(service.user_locks.is_empty());

        service.create_session("7", "12").await.unwrap();
        assert_eq!(service.user_locks.len(), 1);

        service.terminate_session("7").await.unwrap();
        assert!(service.user_locks.is_empty());
    }

    #[tokio::test]
    async fn similar_user_ids_get_separate_backup_slots() {
        let (service, runtime) = test_service(test_config());

        service.create_session("alice.smith", "12").await.unwrap();
        let first = runtime.last_config().unwrap();
        service.create_session("alice-smith", "12").await.unwrap();
        let second = runtime.last_config().unwrap();

        assert_eq!(
            first.env.get("BACKUP_PREFIX").map(String::as_str),
            Some("backups/alice%2Esmith/")
        );
        assert_eq!(
            second.env.get("BACKUP_PREFIX").map(String::as_str),
            Some("backups/alice-smith/")
        );
        assert_ne!(
            first.env.get("BACKUP_LATEST_KEY"),
            second.env.get("BACKUP_LATEST_KEY")
        );
    }

    #[tokio::test]
    async fn session_status_reports_running() {
        let (service, _runtime) = test_service(test_config());

        let none = service.session_status("7").await;
        assert!(!none.has_session && !none.is_running && none.session.is_none());

        service.create_session("7", "12").await.unwrap();
        let some = service.session_status("7").await;
        assert!(some.has_session && some.is_running);
    }

    #[tokio::test]
    async fn invalid_identifiers_are_rejected() {
        let (service, runtime) = test_service(test_config());
        assert!(matches!(
            service.create_session("", "12").await,
            Err(SessionError::InvalidInput(_))
        ));
        assert!(matches!(
            service.create_session("7", "a\nb").await,
            Err(SessionError::InvalidInput(_))
        ));
        assert_eq!(runtime.created_count(), 0);
    }

    #[tokio::test]
    async fn startup_cleanup_removes_orphans() {
        let (service, runtime) = test_service(test_config());
        runtime.insert_running("orphan1", "labdesk-3-deadbeef");
        runtime.insert_running("other1", "postgres");

        assert_eq!(service.startup_cleanup().await.unwrap(), 1);
        assert_eq!(runtime.container_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_terminates_everything() {
        let (service, runtime) = test_service(test_config());
        service.create_session("7", "12").await.unwrap();
        service.create_session("8", "12").await.unwrap();

        assert_eq!(service.shutdown_all_sessions().await, 2);
        assert_eq!(service.session_count(), 0);
        assert_eq!(runtime.container_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_removes_desktops_still_starting() {
        let (service, runtime) = test_service(test_config());
        let service = service.with_readiness(Arc::new(ScriptedProbe::delayed(
            Readiness::Ready,
            Duration::from_secs(5),
        )));

        let (created, (stopped, left)) = tokio::join!(service.create_session("7", "12"), async {
            tokio::task::yield_now().await;
            let stopped = service.shutdown_all_sessions().await;
            (stopped, runtime.container_count())
        });

        assert_eq!(stopped, 1);
        assert_eq!(left, 0);
        assert!(matches!(created, Err(SessionError::StartupFailed(_))));
        assert_eq!(service.session_count(), 0);
        assert!(!service.ports().is_allocated(5900));
        assert!(!service.ports().is_allocated(6080));
        assert_eq!(runtime.container_count(), 0);
    }

    #[test]
    fn test_session_service_config_default() {
        let config = SessionServiceConfig::default();
        assert_eq!(config.image, "labdesk-desktop:latest");
        assert_eq!(config.max_sessions, 25);
        assert_eq!(config.inactivity_timeout, Duration::from_secs(7200));
        assert_eq!(config.backup_grace, Duration::from_secs(30));
    }
}
