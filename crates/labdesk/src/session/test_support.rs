//! In-memory engine and probes for session tests.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::readiness::{Readiness, ReadinessProbe};
use super::service::{SessionService, SessionServiceConfig};
use crate::container::{
    ContainerConfig, ContainerError, ContainerResult, ContainerRuntimeApi, ContainerSummary,
};
use crate::ports::{PortAllocator, PortRange};

#[derive(Debug, Clone)]
struct FakeContainer {
    name: String,
    running: bool,
}

#[derive(Default)]
struct FakeState {
    containers: BTreeMap<String, FakeContainer>,
    next_id: u32,
    created: usize,
    signals: Vec<String>,
    last_config: Option<ContainerConfig>,
    fail_create: bool,
    fail_teardown: bool,
    inspect_error: bool,
    list_error: bool,
    inspect_delay: Duration,
}

/// Engine double keeping containers in a map.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn resolve(state: &FakeState, id_or_name: &str) -> Option<String> {
        if state.containers.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        state
            .containers
            .iter()
            .find(|(_, c)| c.name == id_or_name)
            .map(|(id, _)| id.clone())
    }

    fn teardown_error(command: &str) -> ContainerError {
        ContainerError::CommandFailed {
            command: command.to_string(),
            message: "Cannot connect to the engine".to_string(),
        }
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.state().fail_create = fail;
    }

    pub fn set_fail_teardown(&self, fail: bool) {
        self.state().fail_teardown = fail;
    }

    pub fn set_inspect_error(&self, fail: bool) {
        self.state().inspect_error = fail;
    }

    /// Make every state lookup take `delay`, like a slow engine.
    pub fn set_inspect_delay(&self, delay: Duration) {
        self.state().inspect_delay = delay;
    }

    pub fn set_list_error(&self, fail: bool) {
        self.state().list_error = fail;
    }

    /// Simulate the desktop process exiting on its own.
    pub fn kill(&self, id: &str) {
        if let Some(c) = self.state().containers.get_mut(id) {
            c.running = false;
        }
    }

    pub fn insert_running(&self, id: &str, name: &str) {
        self.state().containers.insert(
            id.to_string(),
            FakeContainer {
                name: name.to_string(),
                running: true,
            },
        );
    }

    pub fn container_count(&self) -> usize {
        self.state().containers.len()
    }

    pub fn created_count(&self) -> usize {
        self.state().created
    }

    pub fn signals(&self) -> Vec<String> {
        self.state().signals.clone()
    }

    pub fn last_config(&self) -> Option<ContainerConfig> {
        self.state().last_config.clone()
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        let mut state = self.state();
        if state.fail_create {
            return Err(ContainerError::CommandFailed {
                command: "create".to_string(),
                message: "port is already allocated".to_string(),
            });
        }
        state.next_id += 1;
        state.created += 1;
        let id = format!("fake{:04}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                name: config.name.clone().unwrap_or_else(|| id.clone()),
                running: false,
            },
        );
        state.last_config = Some(config.clone());
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        let mut state = self.state();
        let id = Self::resolve(&state, container_id)
            .ok_or_else(|| Self::teardown_error("start"))?;
        if let Some(c) = state.containers.get_mut(&id) {
            c.running = true;
        }
        Ok(())
    }

    async fn signal_container(&self, _container_id: &str, signal: &str) -> ContainerResult<()> {
        let mut state = self.state();
        if state.fail_teardown {
            return Err(Self::teardown_error("kill"));
        }
        state.signals.push(signal.to_string());
        Ok(())
    }

    async fn stop_container(
        &self,
        container_id: &str,
        _timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        let mut state = self.state();
        if state.fail_teardown {
            return Err(Self::teardown_error("stop"));
        }
        if let Some(id) = Self::resolve(&state, container_id)
            && let Some(c) = state.containers.get_mut(&id)
        {
            c.running = false;
        }
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> ContainerResult<()> {
        let mut state = self.state();
        if state.fail_teardown {
            return Err(Self::teardown_error("rm"));
        }
        if let Some(id) = Self::resolve(&state, container_id) {
            state.containers.remove(&id);
        }
        Ok(())
    }

    async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>> {
        let delay = self.state().inspect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let state = self.state();
        if state.inspect_error {
            return Err(Self::teardown_error("inspect"));
        }
        Ok(Self::resolve(&state, id_or_name).and_then(|id| {
            state.containers.get(&id).map(|c| {
                if c.running {
                    "running".to_string()
                } else {
                    "exited".to_string()
                }
            })
        }))
    }

    async fn get_logs(&self, _container_id: &str, _tail: Option<u32>) -> ContainerResult<String> {
        Ok(String::new())
    }

    async fn list_containers(
        &self,
        all: bool,
        name_prefix: Option<&str>,
    ) -> ContainerResult<Vec<ContainerSummary>> {
        let state = self.state();
        if state.list_error {
            return Err(Self::teardown_error("ps"));
        }
        Ok(state
            .containers
            .iter()
            .filter(|(_, c)| all || c.running)
            .filter(|(_, c)| name_prefix.is_none_or(|p| c.name.starts_with(p)))
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                name: c.name.clone(),
                state: if c.running { "running" } else { "exited" }.to_string(),
            })
            .collect())
    }
}

/// Probe returning a fixed verdict, optionally after a delay.
pub struct ScriptedProbe {
    verdict: Readiness,
    delay: Duration,
}

impl ScriptedProbe {
    pub fn new(verdict: Readiness) -> Self {
        Self {
            verdict,
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(verdict: Readiness, delay: Duration) -> Self {
        Self { verdict, delay }
    }
}

#[async_trait]
impl ReadinessProbe for ScriptedProbe {
    async fn probe(&self, _container_id: &str) -> Readiness {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.verdict.clone()
    }
}

/// Defaults with the waits shortened for tests.
pub fn test_config() -> SessionServiceConfig {
    SessionServiceConfig {
        backup_grace: Duration::ZERO,
        readiness_poll_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

/// A service over a fresh [`FakeRuntime`] whose probe reports ready at once.
pub fn test_service(config: SessionServiceConfig) -> (SessionService, Arc<FakeRuntime>) {
    let runtime = Arc::new(FakeRuntime::default());
    let ports = Arc::new(
        PortAllocator::new(PortRange::new(5900, 5999), PortRange::new(6080, 6179)).unwrap(),
    );
    let service = SessionService::new(runtime.clone(), ports, config)
        .with_readiness(Arc::new(ScriptedProbe::new(Readiness::Ready)));
    (service, runtime)
}
