use std::{collections::BTreeMap, sync::Arc};

use tether_models::PullEvent;

use crate::{engine::EngineError, service_supervisor::ServiceSupervisor, supervisor::Supervisor};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("service {application}/{service} is not supervised")]
    NotFound { application: String, service: String },
    #[error("service {application}/{service} has no running container")]
    NoContainer { application: String, service: String },
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Read-only queries answered from the supervision tree.
#[async_trait::async_trait]
pub trait Lookup: Send + Sync {
    fn get_container_id(&self, application: &str, service: &str) -> Option<String>;

    fn get_image_pull_progress(
        &self,
        application: &str,
        service: &str,
    ) -> Option<BTreeMap<String, PullEvent>>;

    async fn get_service_logs(&self, application: &str, service: &str)
    -> Result<String, LookupError>;
}

impl Supervisor {
    // Each level hands back a cloned Arc, so no lock is held past this call.
    fn service_supervisor(&self, application: &str, service: &str) -> Option<Arc<ServiceSupervisor>> {
        self.application(application)?.service(service)
    }
}

#[async_trait::async_trait]
impl Lookup for Supervisor {
    fn get_container_id(&self, application: &str, service: &str) -> Option<String> {
        self.service_supervisor(application, service)?.container_id()
    }

    fn get_image_pull_progress(
        &self,
        application: &str,
        service: &str,
    ) -> Option<BTreeMap<String, PullEvent>> {
        self.service_supervisor(application, service)?.pull_progress()
    }

    async fn get_service_logs(
        &self,
        application: &str,
        service: &str,
    ) -> Result<String, LookupError> {
        let supervisor =
            self.service_supervisor(application, service)
                .ok_or_else(|| LookupError::NotFound {
                    application: application.to_string(),
                    service: service.to_string(),
                })?;
        let id = supervisor
            .container_id()
            .ok_or_else(|| LookupError::NoContainer {
                application: application.to_string(),
                service: service.to_string(),
            })?;
        Ok(self.engine.fetch_container_logs(&id).await?)
    }
}
