use std::sync::Arc;

use crate::{
    applications::ApplicationRegistry, broker::Broker, config::ControlConfig,
    ssh_sessions::SessionGauge,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ControlConfig>,
    pub broker: Broker,
    pub applications: ApplicationRegistry,
    pub ssh_sessions: SessionGauge,
}

impl AppState {
    pub fn new(config: ControlConfig, applications: ApplicationRegistry) -> Self {
        let broker = Broker::new(config.reconnect_grace);
        Self {
            config: Arc::new(config),
            broker,
            applications,
            ssh_sessions: SessionGauge::default(),
        }
    }
}
