use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, RwLock},
    time::Duration,
};

use serde::Serialize;
use tether_models::{DesiredApplication, Service};

use crate::{engine::Engine, service_supervisor::ServiceSupervisor};

/// Services of one application, keyed by service name.
pub struct ApplicationSupervisor {
    id: String,
    engine: Arc<dyn Engine>,
    interval: Duration,
    services: RwLock<HashMap<String, Arc<ServiceSupervisor>>>,
}

impl ApplicationSupervisor {
    pub fn new(id: impl Into<String>, engine: Arc<dyn Engine>, interval: Duration) -> Self {
        Self {
            id: id.into(),
            engine,
            interval,
            services: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn service(&self, name: &str) -> Option<Arc<ServiceSupervisor>> {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn services(&self) -> Vec<Arc<ServiceSupervisor>> {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn ensure_service(&self, name: &str) -> Arc<ServiceSupervisor> {
        self.services
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(ServiceSupervisor::new(
                    self.id.clone(),
                    name,
                    self.engine.clone(),
                    self.interval,
                ))
            })
            .clone()
    }

    /// Adds supervisors for new services, hands every service its spec and
    /// stops the ones no longer listed.
    pub fn set_desired_services(
        &self,
        desired: &BTreeMap<String, Service>,
        registry_auth: Option<&str>,
    ) {
        let removed: Vec<Arc<ServiceSupervisor>> = {
            let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
            let gone: Vec<String> = services
                .keys()
                .filter(|name| !desired.contains_key(*name))
                .cloned()
                .collect();
            gone.iter().filter_map(|name| services.remove(name)).collect()
        };
        for service in removed {
            tracing::info!(application = %self.id, service = %service.name(), "service removed");
            service.stop();
        }

        for (name, spec) in desired {
            let service = self.ensure_service(name);
            service.set_registry_auth(registry_auth.map(str::to_string));
            service.set_desired(spec.clone());
        }
    }

    pub fn stop(&self) {
        let services: Vec<Arc<ServiceSupervisor>> = self
            .services
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, service)| service)
            .collect();
        for service in services {
            service.stop();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub container_id: Option<String>,
    pub image: Option<String>,
    /// Image currently being pulled for the service.
    pub pulling: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub applications: usize,
    pub services: usize,
    pub running: usize,
}

/// Root of the supervision tree: every application assigned to this device.
pub struct Supervisor {
    pub(crate) engine: Arc<dyn Engine>,
    interval: Duration,
    applications: RwLock<HashMap<String, Arc<ApplicationSupervisor>>>,
}

impl Supervisor {
    pub fn new(engine: Arc<dyn Engine>, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            applications: RwLock::new(HashMap::new()),
        }
    }

    pub fn application(&self, id: &str) -> Option<Arc<ApplicationSupervisor>> {
        self.applications
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    fn applications(&self) -> Vec<Arc<ApplicationSupervisor>> {
        self.applications
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn ensure_application(&self, id: &str) -> Arc<ApplicationSupervisor> {
        self.applications
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(id.to_string())
            .or_insert_with(|| {
                Arc::new(ApplicationSupervisor::new(
                    id,
                    self.engine.clone(),
                    self.interval,
                ))
            })
            .clone()
    }

    pub fn set_desired_applications(&self, desired: &[DesiredApplication]) {
        let removed: Vec<Arc<ApplicationSupervisor>> = {
            let mut apps = self.applications.write().unwrap_or_else(|e| e.into_inner());
            let gone: Vec<String> = apps
                .keys()
                .filter(|id| !desired.iter().any(|app| &app.id == *id))
                .cloned()
                .collect();
            gone.iter().filter_map(|id| apps.remove(id)).collect()
        };
        for app in removed {
            tracing::info!(application = %app.id(), "application removed");
            app.stop();
        }

        for app in desired {
            self.ensure_application(&app.id)
                .set_desired_services(&app.services, app.registry_auth.as_deref());
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, ServiceStatus>> {
        let mut out = BTreeMap::new();
        for app in self.applications() {
            let services = app
                .services()
                .into_iter()
                .map(|service| {
                    let status = ServiceStatus {
                        container_id: service.container_id(),
                        image: service.desired().map(|spec| spec.image),
                        pulling: service.pulling_image(),
                    };
                    (service.name().to_string(), status)
                })
                .collect();
            out.insert(app.id().to_string(), services);
        }
        out
    }

    pub fn stats(&self) -> SupervisorStats {
        let mut stats = SupervisorStats::default();
        for app in self.applications() {
            stats.applications += 1;
            for service in app.services() {
                stats.services += 1;
                if service.container_id().is_some() {
                    stats.running += 1;
                }
            }
        }
        stats
    }
}
