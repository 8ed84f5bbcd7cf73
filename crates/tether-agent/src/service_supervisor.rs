use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak},
    time::Duration,
};

use tether_models::{APPLICATION_LABEL, HASH_LABEL, PullEvent, SERVICE_LABEL, Service};
use tokio::{sync::Notify, task::JoinHandle, time::MissedTickBehavior};
use tracing::{Instrument, info_span};

use crate::{
    engine::{Engine, EngineError},
    image_puller::PullTracker,
};

#[derive(Debug, Default)]
struct ServiceState {
    container_id: Option<String>,
    pull: Option<Arc<PullTracker>>,
    desired: Option<Service>,
    registry_auth: Option<String>,
}

/// Owns one service of one application and the container that runs it.
pub struct ServiceSupervisor {
    application: String,
    name: String,
    engine: Arc<dyn Engine>,
    interval: Duration,
    state: RwLock<ServiceState>,
    wake: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceSupervisor {
    pub fn new(
        application: impl Into<String>,
        name: impl Into<String>,
        engine: Arc<dyn Engine>,
        interval: Duration,
    ) -> Self {
        Self {
            application: application.into(),
            name: name.into(),
            engine,
            interval,
            state: RwLock::new(ServiceState::default()),
            wake: Arc::new(Notify::new()),
            task: Mutex::new(None),
        }
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> RwLockReadGuard<'_, ServiceState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ServiceState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Id of the running container. An empty id counts as absent.
    pub fn container_id(&self) -> Option<String> {
        self.read()
            .container_id
            .clone()
            .filter(|id| !id.is_empty())
    }

    pub fn set_container_id(&self, id: impl Into<String>) {
        let id = id.into();
        self.write().container_id = (!id.is_empty()).then_some(id);
    }

    pub fn clear_container_id(&self) {
        self.write().container_id = None;
    }

    /// Installs a fresh tracker for a pull; any previous tracker is finished.
    pub fn begin_pull(&self, image: &str) -> Arc<PullTracker> {
        let tracker = Arc::new(PullTracker::new(image));
        if let Some(prev) = self.write().pull.replace(tracker.clone()) {
            prev.finish();
        }
        tracker
    }

    pub fn end_pull(&self, tracker: &Arc<PullTracker>) {
        tracker.finish();
        let mut state = self.write();
        if state
            .pull
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, tracker))
        {
            state.pull = None;
        }
    }

    pub fn pull_progress(&self) -> Option<BTreeMap<String, PullEvent>> {
        let tracker = self.read().pull.clone()?;
        tracker.progress()
    }

    /// Image of the pull in flight, if any.
    pub fn pulling_image(&self) -> Option<String> {
        self.read()
            .pull
            .as_ref()
            .map(|tracker| tracker.image().to_string())
    }

    pub fn desired(&self) -> Option<Service> {
        self.read().desired.clone()
    }

    /// Credentials used for this service's next image pull.
    pub fn set_registry_auth(&self, auth: Option<String>) {
        self.write().registry_auth = auth;
    }

    pub fn is_reconciling(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Records the desired spec and makes sure the reconcile loop runs.
    pub fn set_desired(self: &Arc<Self>, spec: Service) {
        let changed = {
            let mut state = self.write();
            let changed = state.desired.as_ref() != Some(&spec);
            state.desired = Some(spec);
            changed
        };

        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_none() {
            let span = info_span!(
                "service_supervisor",
                application = %self.application,
                service = %self.name
            );
            *task = Some(tokio::spawn(
                run(Arc::downgrade(self), self.wake.clone(), self.interval).instrument(span),
            ));
        } else if changed {
            self.wake.notify_one();
        }
    }

    /// Stops the reconcile loop and removes every container of this service.
    pub fn stop(&self) -> JoinHandle<()> {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        {
            let mut state = self.write();
            state.desired = None;
            state.container_id = None;
        }

        let engine = self.engine.clone();
        let selector = self.selector();
        let application = self.application.clone();
        let service = self.name.clone();
        tokio::spawn(async move {
            if let Err(e) = remove_all(engine.as_ref(), &selector).await {
                tracing::warn!(%application, %service, error = %e, "failed to remove service containers");
            }
        })
    }

    fn selector(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (APPLICATION_LABEL.to_string(), self.application.clone()),
            (SERVICE_LABEL.to_string(), self.name.clone()),
        ])
    }

    /// One convergence step towards the desired spec.
    pub async fn reconcile(&self) -> Result<(), EngineError> {
        let Some(spec) = self.desired() else {
            return Ok(());
        };
        let hash = spec
            .spec_hash()
            .map_err(|e| EngineError::operation("spec_hash", e.to_string()))?;
        let selector = self.selector();

        let mut instances = self
            .engine
            .list_containers(&BTreeSet::new(), &selector, false)
            .await?;
        instances.sort_by_key(|instance| !instance.running);

        let mut current = None;
        let mut stale = Vec::new();
        for instance in instances {
            if current.is_none() && instance.labels.get(HASH_LABEL) == Some(&hash) {
                current = Some(instance);
            } else {
                stale.push(instance.id);
            }
        }

        for id in &stale {
            tracing::info!(container = %id, "removing stale container");
            discard(self.engine.as_ref(), id).await?;
        }

        if let Some(instance) = current {
            if !instance.running {
                if let Err(e) = self.engine.start_container(&instance.id).await {
                    self.clear_container_id();
                    return Err(e);
                }
                tracing::info!(container = %instance.id, "restarted container");
            }
            self.set_container_id(instance.id);
            return Ok(());
        }

        self.clear_container_id();
        let registry_auth = self.read().registry_auth.clone();
        let tracker = self.begin_pull(&spec.image);
        let pulled = self
            .engine
            .pull_image(&spec.image, registry_auth.as_deref(), tracker.as_ref())
            .await;
        self.end_pull(&tracker);
        pulled?;

        let mut launch = spec;
        launch.labels.extend(selector);
        launch.labels.insert(HASH_LABEL.to_string(), hash);
        let id = self.engine.create_container("", &launch).await?;
        self.engine.start_container(&id).await?;
        tracing::info!(container = %id, image = %launch.image, "started container");
        self.set_container_id(id);
        Ok(())
    }
}

impl Drop for ServiceSupervisor {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}

async fn run(this: Weak<ServiceSupervisor>, wake: Arc<Notify>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        let Some(supervisor) = this.upgrade() else {
            break;
        };
        if let Err(e) = supervisor.reconcile().await {
            tracing::warn!(error = %e, "reconcile failed");
        }
        drop(supervisor);

        tokio::select! {
            _ = ticker.tick() => {}
            _ = wake.notified() => {}
        }
    }
}

async fn discard(engine: &dyn Engine, id: &str) -> Result<(), EngineError> {
    match engine.stop_container(id).await {
        Ok(()) | Err(EngineError::InstanceNotFound) => {}
        Err(e) => return Err(e),
    }
    match engine.remove_container(id).await {
        Ok(()) | Err(EngineError::InstanceNotFound) => Ok(()),
        Err(e) => Err(e),
    }
}

async fn remove_all(
    engine: &dyn Engine,
    selector: &BTreeMap<String, String>,
) -> Result<(), EngineError> {
    let instances = engine
        .list_containers(&BTreeSet::new(), selector, false)
        .await?;
    for instance in instances {
        discard(engine, &instance.id).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::engine::fake::FakeEngine;

    use super::*;

    fn web() -> Service {
        Service {
            image: "shop/web:3".to_string(),
            command: vec!["serve".to_string()],
            ..Service::default()
        }
    }

    fn supervisor(engine: &Arc<FakeEngine>) -> Arc<ServiceSupervisor> {
        Arc::new(ServiceSupervisor::new(
            "shop",
            "web",
            engine.clone(),
            Duration::from_secs(3600),
        ))
    }

    fn seed(supervisor: &ServiceSupervisor, spec: Service) {
        supervisor.write().desired = Some(spec);
    }

    #[tokio::test]
    async fn launches_labelled_container_and_records_it() {
        let engine = Arc::new(FakeEngine::new());
        let svc = supervisor(&engine);
        seed(&svc, web());

        svc.reconcile().await.unwrap();

        let id = svc.container_id().unwrap();
        let container = engine.container(&id).unwrap();
        assert!(container.running);
        assert_eq!(container.spec.labels[APPLICATION_LABEL], "shop");
        assert_eq!(container.spec.labels[SERVICE_LABEL], "web");
        assert_eq!(container.spec.labels[HASH_LABEL], web().spec_hash().unwrap());
        assert_eq!(engine.count("pull shop/web:3"), 1);
        assert!(svc.pull_progress().is_none());
    }

    #[tokio::test]
    async fn keeps_matching_container_on_later_passes() {
        let engine = Arc::new(FakeEngine::new());
        let svc = supervisor(&engine);
        seed(&svc, web());

        svc.reconcile().await.unwrap();
        let first = svc.container_id().unwrap();
        svc.reconcile().await.unwrap();

        assert_eq!(svc.container_id().unwrap(), first);
        assert_eq!(engine.count("create"), 1);
    }

    #[tokio::test]
    async fn restarts_exited_matching_container() {
        let engine = Arc::new(FakeEngine::new());
        let svc = supervisor(&engine);
        seed(&svc, web());
        svc.reconcile().await.unwrap();
        let id = svc.container_id().unwrap();

        engine.stop_container(&id).await.unwrap();
        svc.reconcile().await.unwrap();

        assert_eq!(svc.container_id().unwrap(), id);
        assert!(engine.container(&id).unwrap().running);
        assert_eq!(engine.count("create"), 1);
    }

    #[tokio::test]
    async fn replaces_container_with_stale_spec() {
        let engine = Arc::new(FakeEngine::new());
        let svc = supervisor(&engine);
        seed(&svc, web());
        svc.reconcile().await.unwrap();
        let old = svc.container_id().unwrap();

        let mut next = web();
        next.image = "shop/web:4".to_string();
        seed(&svc, next);
        svc.reconcile().await.unwrap();

        let new = svc.container_id().unwrap();
        assert_ne!(new, old);
        assert!(engine.container(&old).is_none());
        assert_eq!(engine.container(&new).unwrap().spec.image, "shop/web:4");
    }

    #[tokio::test]
    async fn failed_pull_leaves_no_container() {
        let engine = Arc::new(FakeEngine::new());
        *engine.fail_pulls.lock().unwrap() = true;
        let svc = supervisor(&engine);
        seed(&svc, web());

        assert!(svc.reconcile().await.is_err());
        assert!(svc.container_id().is_none());
        assert!(svc.pull_progress().is_none());
        assert_eq!(engine.count("create"), 0);
    }

    #[tokio::test]
    async fn progress_is_visible_only_while_pulling() {
        let engine = Arc::new(FakeEngine::new());
        let hold = Arc::new(Notify::new());
        *engine.hold_pulls.lock().unwrap() = Some(hold.clone());
        let svc = supervisor(&engine);
        seed(&svc, web());

        let pass = tokio::spawn({
            let svc = svc.clone();
            async move { svc.reconcile().await }
        });

        let progress = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(p) = svc.pull_progress() {
                    break p;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(progress["layer1"].current, Some(10));
        assert!(svc.container_id().is_none());

        hold.notify_one();
        pass.await.unwrap().unwrap();
        assert!(svc.pull_progress().is_none());
        assert!(svc.container_id().is_some());
    }

    #[test]
    fn empty_container_id_is_absent() {
        let engine = Arc::new(FakeEngine::new());
        let svc = supervisor(&engine);
        svc.set_container_id("");
        assert!(svc.container_id().is_none());
        svc.set_container_id("abc");
        assert_eq!(svc.container_id().as_deref(), Some("abc"));
        svc.clear_container_id();
        assert!(svc.container_id().is_none());
    }

    #[tokio::test]
    async fn stop_removes_containers() {
        let engine = Arc::new(FakeEngine::new());
        let svc = supervisor(&engine);
        seed(&svc, web());
        svc.reconcile().await.unwrap();
        let id = svc.container_id().unwrap();

        svc.stop().await.unwrap();

        assert!(engine.container(&id).is_none());
        assert!(svc.container_id().is_none());
        assert!(svc.desired().is_none());
    }

    #[tokio::test]
    async fn set_desired_starts_one_loop() {
        let engine = Arc::new(FakeEngine::new());
        let svc = supervisor(&engine);
        svc.set_desired(web());
        svc.set_desired(web());
        assert!(svc.is_reconciling());

        tokio::time::timeout(Duration::from_secs(5), async {
            while svc.container_id().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(engine.count("create"), 1);
    }
}
