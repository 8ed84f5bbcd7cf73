use tether_control::applications::ApplicationRegistry;
use tether_control::config::ControlConfig;
use tether_control::router;
use tether_control::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ControlConfig::from_env()?;

    let applications = match &config.applications_file {
        Some(path) => ApplicationRegistry::load(path)?,
        None => ApplicationRegistry::new(),
    };
    tracing::info!(count = applications.len(), "applications loaded");

    let addr = config.listen_addr;
    let state = AppState::new(config, applications);
    let app = router::router(state);

    tracing::info!(%addr, "tether-control HTTP listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
