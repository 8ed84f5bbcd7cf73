use std::collections::{BTreeMap, BTreeSet};

use tether_models::{PullEvent, Service};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("instance not found")]
    InstanceNotFound,
    #[error("engine {operation} failed: {message}")]
    Operation {
        operation: &'static str,
        message: String,
    },
}

impl EngineError {
    pub fn operation(operation: &'static str, message: impl Into<String>) -> Self {
        EngineError::Operation {
            operation,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub labels: BTreeMap<String, String>,
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectResponse {
    pub pid: i64,
    pub running: bool,
}

/// Receives per-layer progress while an image is pulled.
pub trait PullProgressSink: Send + Sync {
    fn on_event(&self, event: PullEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardProgress;

impl PullProgressSink for DiscardProgress {
    fn on_event(&self, _event: PullEvent) {}
}

/// Container runtime seam used by the supervisor and the updater.
#[async_trait::async_trait]
pub trait Engine: Send + Sync {
    /// Creates a container from `spec`; an empty `name` lets the runtime pick one.
    async fn create_container(&self, name: &str, spec: &Service) -> Result<String, EngineError>;
    async fn inspect_container(&self, id: &str) -> Result<InspectResponse, EngineError>;
    async fn start_container(&self, id: &str) -> Result<(), EngineError>;
    /// Containers matching every id in `ids` (when non-empty) and every label
    /// pair in `labels`.
    async fn list_containers(
        &self,
        ids: &BTreeSet<String>,
        labels: &BTreeMap<String, String>,
        running_only: bool,
    ) -> Result<Vec<Instance>, EngineError>;
    async fn stop_container(&self, id: &str) -> Result<(), EngineError>;
    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;
    async fn fetch_container_logs(&self, id: &str) -> Result<String, EngineError>;
    async fn pull_image(
        &self,
        image: &str,
        registry_auth: Option<&str>,
        progress: &dyn PullProgressSink,
    ) -> Result<(), EngineError>;
}
