use std::{sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use tether_tunnel::{Frame, Role, Session};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Message as WsMessage, client::IntoClientRequest};
use tracing::{Instrument, info_span};

use crate::{agent_metrics::AgentMetrics, command_service::CommandService, config::AgentConfig};

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn parse_ws_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(rest) = trimmed.strip_prefix("https://") {
        return Some(format!("wss://{rest}"));
    }
    if let Some(rest) = trimmed.strip_prefix("http://") {
        return Some(format!("ws://{rest}"));
    }
    Some(trimmed.to_string())
}

/// Device connect endpoint under the controller base URL.
pub fn connect_url(base: &str, project: &str, device: &str) -> Option<String> {
    let base = parse_ws_url(base)?;
    Some(format!(
        "{}/projects/{project}/devices/{device}/connect",
        base.trim_end_matches('/')
    ))
}

/// Keeps one channel to the controller open, reconnecting with backoff.
/// Returns `None` when no controller URL is configured.
pub fn spawn(config: Arc<AgentConfig>, service: CommandService) -> Option<JoinHandle<()>> {
    let url = config
        .control_url
        .as_deref()
        .and_then(|base| connect_url(base, &config.project_id, &config.device_id))?;

    let handle = tokio::spawn(async move {
        let span = info_span!(
            "control_tunnel",
            project = %config.project_id,
            device = %config.device_id,
            url = %url
        );
        async move {
            let mut backoff = Duration::from_millis(500);
            loop {
                match run_once(&url, &config, &service).await {
                    Ok(()) => {
                        backoff = Duration::from_millis(500);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "control tunnel disconnected");
                        backoff = (backoff * 2).min(Duration::from_secs(30));
                    }
                }
                tokio::time::sleep(backoff).await;
            }
        }
        .instrument(span)
        .await;
    });
    Some(handle)
}

async fn run_once(url: &str, config: &AgentConfig, service: &CommandService) -> anyhow::Result<()> {
    let mut req = url.into_client_request()?;
    if let Some(tok) = config.device_token.as_deref() {
        let value = format!("Bearer {tok}");
        req.headers_mut().insert("Authorization", value.parse()?);
    }

    let (ws, _) = tokio_tungstenite::connect_async(req).await?;
    let (mut sink, mut source) = ws.split();

    let hello = Frame::Hello {
        project: config.project_id.clone(),
        device: config.device_id.clone(),
        agent_version: config.agent_version.clone(),
    };
    sink.send(WsMessage::Text(hello.encode()?.into())).await?;
    AgentMetrics::inc(&service.metrics().tunnel_connects_total);
    tracing::info!("control tunnel connected");

    let (session, mut outbound) = Session::new(Role::Device);

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let text = match frame.encode() {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to encode frame");
                    continue;
                }
            };
            if sink.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let acceptor = tokio::spawn({
        let session = session.clone();
        let service = service.clone();
        async move {
            while let Some(stream) = session.accept().await {
                let service = service.clone();
                tokio::spawn(async move { service.serve(stream).await });
            }
        }
    });

    let result = async {
        while let Some(msg) = source.next().await {
            match msg? {
                WsMessage::Text(text) => session.handle_frame(Frame::decode(&text)),
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
        anyhow::Ok(())
    }
    .await;

    session.shutdown();
    acceptor.abort();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    result
}
