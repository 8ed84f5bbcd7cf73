use std::sync::Arc;

use tracing_subscriber::EnvFilter;

mod agent_metrics;
mod command_service;
mod config;
mod control_tunnel;
mod docker_engine;
mod engine;
mod image_puller;
mod lookup;
mod service_supervisor;
mod supervisor;
mod updater;

use crate::{
    agent_metrics::AgentMetrics, command_service::CommandService, config::AgentConfig,
    docker_engine::DockerEngine, engine::Engine, supervisor::Supervisor, updater::Updater,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(AgentConfig::from_env()?);

    let (writer, _log_guard) = match &config.log_dir {
        Some(dir) => tracing_appender::non_blocking(tracing_appender::rolling::daily(
            dir,
            "tether-agent.log",
        )),
        None => tracing_appender::non_blocking(std::io::stdout()),
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(writer)
        .init();

    let engine: Arc<dyn Engine> = Arc::new(DockerEngine::connect()?);
    let supervisor = Arc::new(Supervisor::new(engine.clone(), config.reconcile_interval));
    let updater = Arc::new(Updater::new(
        engine,
        config.project_id.clone(),
        config.agent_version.clone(),
    ));
    let service = CommandService::new(
        config.clone(),
        supervisor,
        updater,
        Arc::new(AgentMetrics::new()),
    )?;

    tracing::info!(
        project = %config.project_id,
        device = %config.device_id,
        version = %config.agent_version,
        "tether-agent starting"
    );
    let tunnel = control_tunnel::spawn(config.clone(), service);
    if tunnel.is_none() {
        tracing::warn!("TETHER_CONTROL_WS_URL not set; running without a controller");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("tether-agent shutting down");
    if let Some(tunnel) = tunnel {
        tunnel.abort();
    }
    Ok(())
}
