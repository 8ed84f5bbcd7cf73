use std::time::Duration;

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tether_models::DeviceKey;
use tether_tunnel::{Frame, Role, Session};
use tracing::Instrument;

use crate::{broker::Broker, state::AppState};

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let raw = raw.trim();
    let rest = raw.strip_prefix("Bearer ")?;
    let token = rest.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

fn auth_ok(expected: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    bearer_token(headers).is_some_and(|got| got == expected)
}

/// `GET /projects/{project}/devices/{device}/connect`: the device's single
/// upstream channel.
pub async fn device_connect(
    State(state): State<AppState>,
    Path((project, device)): Path<(String, String)>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !auth_ok(state.config.connect_token.as_deref(), &headers) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }

    let key = DeviceKey::new(project, device);
    let broker = state.broker.clone();
    let hello_timeout = state.config.hello_timeout;
    ws.on_upgrade(move |socket| handle_device_socket(broker, key, hello_timeout, socket))
        .into_response()
}

fn hello_matches(frame: &Frame, key: &DeviceKey) -> Option<String> {
    match frame {
        Frame::Hello {
            project,
            device,
            agent_version,
        } if project.trim() == key.project && device.trim() == key.device => {
            Some(agent_version.clone())
        }
        _ => None,
    }
}

/// Waits for the first message and checks it is a `hello` for `key`.
/// Returns `None` on a mismatch, a closed socket, or when `timeout` passes first.
async fn read_hello<S, E>(receiver: &mut S, key: &DeviceKey, timeout: Duration) -> Option<String>
where
    S: futures_util::Stream<Item = Result<Message, E>> + Unpin,
{
    match tokio::time::timeout(timeout, receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => hello_matches(&Frame::decode(&text), key),
        Ok(_) => None,
        Err(_) => {
            tracing::warn!(?timeout, "device sent no hello in time");
            None
        }
    }
}

async fn handle_device_socket(
    broker: Broker,
    key: DeviceKey,
    hello_timeout: Duration,
    socket: WebSocket,
) {
    let span = tracing::info_span!("device_ws", device = %key);
    async move {
        let (mut sender, mut receiver) = socket.split();

        let agent_version = read_hello(&mut receiver, &key, hello_timeout).await;
        let Some(agent_version) = agent_version else {
            tracing::warn!("device did not send a matching hello");
            let _ = sender.send(Message::Close(None)).await;
            return;
        };

        let (session, mut outbound) = Session::new(Role::Controller);
        broker.register(key.clone(), session.clone()).await;
        tracing::info!(%agent_version, "device connected");

        let mut writer = tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                let text = match frame.encode() {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to encode frame");
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sender.send(Message::Close(None)).await;
        });

        loop {
            tokio::select! {
                _ = session.closed() => {
                    tracing::info!("device session retired");
                    break;
                }
                msg = receiver.next() => {
                    let Some(Ok(msg)) = msg else { break };
                    match msg {
                        Message::Text(text) => session.handle_frame(Frame::decode(&text)),
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            }
        }

        broker.unregister(&key, &session).await;
        session.shutdown();

        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
            .await
            .is_err()
        {
            writer.abort();
        }
        tracing::info!("device disconnected");
    }
    .instrument(span)
    .await
}
