//! Shared fixtures for the HTTP tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use labdesk::api::{self, AppState, USER_ID_HEADER};
use labdesk::backup::{
    BackupClient, BackupError, BackupLayout, BackupObject, BackupResult, BackupStore,
    LocalBackupStore,
};
use labdesk::container::{
    ContainerConfig, ContainerError, ContainerResult, ContainerRuntimeApi, ContainerSummary,
};
use labdesk::observability::SystemStatusReporter;
use labdesk::ports::{PortAllocator, PortRange};
use labdesk::session::{Readiness, ReadinessProbe, SessionService, SessionServiceConfig};

#[derive(Default)]
struct EngineState {
    /// id -> (name, running)
    containers: BTreeMap<String, (String, bool)>,
    next_id: u32,
    fail_create: bool,
}

/// In-memory container engine.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<EngineState>,
}

impl FakeEngine {
    fn state(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap()
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.state().fail_create = fail;
    }

    pub fn stop_all(&self) {
        for (_, running) in self.state().containers.values_mut() {
            *running = false;
        }
    }

    pub fn container_count(&self) -> usize {
        self.state().containers.len()
    }

    fn resolve(state: &EngineState, id_or_name: &str) -> Option<String> {
        if state.containers.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        state
            .containers
            .iter()
            .find(|(_, (name, _))| name == id_or_name)
            .map(|(id, _)| id.clone())
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeEngine {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        let mut state = self.state();
        if state.fail_create {
            return Err(ContainerError::CommandFailed {
                command: "create".to_string(),
                message: "no space left on device".to_string(),
            });
        }
        state.next_id += 1;
        let id = format!("c{:03}", state.next_id);
        let name = config.name.clone().unwrap_or_else(|| id.clone());
        state.containers.insert(id.clone(), (name, false));
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        let mut state = self.state();
        if let Some(id) = Self::resolve(&state, container_id)
            && let Some(entry) = state.containers.get_mut(&id)
        {
            entry.1 = true;
        }
        Ok(())
    }

    async fn signal_container(&self, _container_id: &str, _signal: &str) -> ContainerResult<()> {
        Ok(())
    }

    async fn stop_container(
        &self,
        container_id: &str,
        _timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        let mut state = self.state();
        if let Some(id) = Self::resolve(&state, container_id)
            && let Some(entry) = state.containers.get_mut(&id)
        {
            entry.1 = false;
        }
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> ContainerResult<()> {
        let mut state = self.state();
        if let Some(id) = Self::resolve(&state, container_id) {
            state.containers.remove(&id);
        }
        Ok(())
    }

    async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>> {
        let state = self.state();
        Ok(Self::resolve(&state, id_or_name).and_then(|id| {
            state.containers.get(&id).map(|(_, running)| {
                if *running { "running" } else { "exited" }.to_string()
            })
        }))
    }

    async fn get_logs(&self, _container_id: &str, _tail: Option<u32>) -> ContainerResult<String> {
        Ok("LABDESK_READY\n".to_string())
    }

    async fn list_containers(
        &self,
        all: bool,
        name_prefix: Option<&str>,
    ) -> ContainerResult<Vec<ContainerSummary>> {
        Ok(self
            .state()
            .containers
            .iter()
            .filter(|(_, (_, running))| all || *running)
            .filter(|(_, (name, _))| name_prefix.is_none_or(|p| name.starts_with(p)))
            .map(|(id, (name, running))| ContainerSummary {
                id: id.clone(),
                name: name.clone(),
                state: if *running { "running" } else { "exited" }.to_string(),
            })
            .collect())
    }
}

struct ReadyProbe;

#[async_trait]
impl ReadinessProbe for ReadyProbe {
    async fn probe(&self, _container_id: &str) -> Readiness {
        Readiness::Ready
    }
}

/// Store whose backend is unreachable.
pub struct UnreachableStore;

#[async_trait]
impl BackupStore for UnreachableStore {
    fn kind(&self) -> &'static str {
        "s3"
    }

    async fn list(&self, _prefix: &str) -> BackupResult<Vec<BackupObject>> {
        Err(BackupError::Backend("Could not connect to the endpoint URL".to_string()))
    }

    async fn copy(&self, _src: &str, _dst: &str) -> BackupResult<()> {
        Err(BackupError::Backend("Could not connect to the endpoint URL".to_string()))
    }
}

pub struct TestApp {
    pub router: Router,
    pub engine: Arc<FakeEngine>,
    pub sessions: SessionService,
    pub backup_dir: TempDir,
}

pub fn test_config() -> SessionServiceConfig {
    SessionServiceConfig {
        backup_grace: Duration::ZERO,
        readiness_poll_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

pub fn test_app() -> TestApp {
    build_app(test_config(), None)
}

pub fn build_app(config: SessionServiceConfig, store: Option<Arc<dyn BackupStore>>) -> TestApp {
    let engine = Arc::new(FakeEngine::default());
    let ports = Arc::new(
        PortAllocator::new(PortRange::new(5900, 5999), PortRange::new(6080, 6179)).unwrap(),
    );
    let prefix = config.name_prefix.clone();
    let sessions = SessionService::new(engine.clone(), ports, config)
        .with_readiness(Arc::new(ReadyProbe));

    let backup_dir = tempfile::tempdir().unwrap();
    let store = store.unwrap_or_else(|| Arc::new(LocalBackupStore::new(backup_dir.path())));
    let backups = BackupClient::new(store, BackupLayout::default());
    let status = Arc::new(SystemStatusReporter::new(engine.clone(), prefix));

    let state = AppState::new(sessions.clone(), backups, status);
    TestApp {
        router: api::create_router(state),
        engine,
        sessions,
        backup_dir,
    }
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Send as `user` and decode the JSON body.
    pub async fn call(
        &self,
        method: &str,
        uri: &str,
        user: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(USER_ID_HEADER, user);
        }
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.send(request).await;
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    /// Drop an archive into the local store for `user`.
    pub fn write_backup(&self, user: &str, name: &str, contents: &[u8]) {
        let dir = self.backup_dir.path().join("backups").join(user);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(name), contents).unwrap();
    }

    pub fn backup_path(&self, key: &str) -> std::path::PathBuf {
        key.split('/')
            .fold(self.backup_dir.path().to_path_buf(), |p, seg| p.join(seg))
    }
}

pub fn exists(path: &Path) -> bool {
    path.is_file()
}
