use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, RwLock, Weak},
    time::Duration,
};

use tether_models::{AGENT_VERSION_LABEL, PROJECT_PLACEHOLDER, Service};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{Instrument, info_span};

use crate::engine::{DiscardProgress, Engine};

pub const UPDATE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    NoSpec,
    InvalidImage,
    UpToDate,
    AlreadyRunning,
    Launched(String),
    Failed,
}

/// Version token of an image reference: the second of exactly two
/// `:`-separated parts.
pub fn desired_version(image: &str) -> Option<&str> {
    let mut parts = image.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(version), None) => Some(version),
        _ => None,
    }
}

fn launch_spec(desired: &Service, version: &str, project_id: &str) -> Service {
    let mut spec = desired.clone();
    spec.labels
        .insert(AGENT_VERSION_LABEL.to_string(), version.to_string());
    spec.command = spec
        .command
        .iter()
        .map(|arg| arg.replace(PROJECT_PLACEHOLDER, project_id))
        .collect();
    spec
}

/// Replaces the running agent with the centrally desired version.
pub struct Updater {
    engine: Arc<dyn Engine>,
    project_id: String,
    version: String,
    interval: Duration,
    desired: RwLock<Option<Service>>,
    registry_auth: RwLock<Option<String>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Updater {
    pub fn new(engine: Arc<dyn Engine>, project_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self::with_interval(engine, project_id, version, UPDATE_INTERVAL)
    }

    pub fn with_interval(
        engine: Arc<dyn Engine>,
        project_id: impl Into<String>,
        version: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            engine,
            project_id: project_id.into(),
            version: version.into(),
            interval,
            desired: RwLock::new(None),
            registry_auth: RwLock::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn desired_spec(&self) -> Option<Service> {
        self.desired
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn registry_auth(&self) -> Option<String> {
        self.registry_auth
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Credentials for pulling the agent image.
    pub fn set_registry_auth(&self, auth: Option<String>) {
        *self.registry_auth.write().unwrap_or_else(|e| e.into_inner()) = auth;
    }

    /// Replaces the desired spec; the first call starts the convergence loop.
    pub fn set_desired_spec(self: &Arc<Self>, spec: Service) {
        *self.desired.write().unwrap_or_else(|e| e.into_inner()) = Some(spec);

        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_none() {
            let span = info_span!("updater", version = %self.version);
            *task = Some(tokio::spawn(
                run(Arc::downgrade(self), self.interval).instrument(span),
            ));
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// One convergence step.
    pub async fn tick(&self) -> TickOutcome {
        let Some(desired) = self.desired_spec() else {
            return TickOutcome::NoSpec;
        };
        let Some(version) = desired_version(&desired.image) else {
            tracing::error!(image = %desired.image, "invalid agent image");
            return TickOutcome::InvalidImage;
        };
        if version.is_empty() || version == self.version {
            return TickOutcome::UpToDate;
        }

        let labels = BTreeMap::from([(AGENT_VERSION_LABEL.to_string(), version.to_string())]);
        match self
            .engine
            .list_containers(&BTreeSet::new(), &labels, true)
            .await
        {
            Ok(instances) if !instances.is_empty() => return TickOutcome::AlreadyRunning,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "failed to list agent containers");
                return TickOutcome::Failed;
            }
        }

        let registry_auth = self.registry_auth();
        if let Err(e) = self
            .engine
            .pull_image(&desired.image, registry_auth.as_deref(), &DiscardProgress)
            .await
        {
            tracing::warn!(image = %desired.image, error = %e, "agent image pull failed");
            return TickOutcome::Failed;
        }

        let spec = launch_spec(&desired, version, &self.project_id);
        let id = match self.engine.create_container("", &spec).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, "failed to create agent container");
                return TickOutcome::Failed;
            }
        };
        if let Err(e) = self.engine.start_container(&id).await {
            tracing::warn!(container = %id, error = %e, "failed to start agent container");
            return TickOutcome::Failed;
        }

        tracing::info!(container = %id, to = %version, "launched agent update");
        TickOutcome::Launched(id)
    }
}

impl Drop for Updater {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}

async fn run(this: Weak<Updater>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(updater) = this.upgrade() else {
            break;
        };
        let outcome = updater.tick().await;
        tracing::debug!(?outcome, "update tick");
    }
}
