//! Shared server state

use std::sync::Arc;

use bf_core::config::ServerConfig;

use crate::jobs::JobManager;

/// State shared by every request handler
#[derive(Clone)]
pub struct ServerState {
    /// Job manager
    pub jobs: Arc<JobManager>,
}

impl ServerState {
    /// Create server state from configuration
    pub fn new(config: ServerConfig) -> Self {
        Self {
            jobs: Arc::new(JobManager::new(config)),
        }
    }

    /// Get the job manager
    pub fn job_manager(&self) -> &Arc<JobManager> {
        &self.jobs
    }
}
