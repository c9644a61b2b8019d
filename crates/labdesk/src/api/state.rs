//! Application state shared across handlers.

use std::sync::Arc;

use crate::backup::BackupClient;
use crate::observability::SystemStatusReporter;
use crate::session::SessionService;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionService,
    pub backups: BackupClient,
    pub status: Arc<SystemStatusReporter>,
    /// Origins allowed to call the API from a browser. Empty denies all.
    pub cors_origins: Arc<Vec<String>>,
}

impl AppState {
    pub fn new(
        sessions: SessionService,
        backups: BackupClient,
        status: Arc<SystemStatusReporter>,
    ) -> Self {
        Self {
            sessions,
            backups,
            status,
            cors_origins: Arc::new(Vec::new()),
        }
    }

    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Arc::new(origins);
        self
    }
}
