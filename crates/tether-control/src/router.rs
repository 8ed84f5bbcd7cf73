use std::{collections::BTreeMap, future::Future};

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderName, HeaderValue, Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{any, get, post, put},
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tether_models::{Bundle, DeviceKey, DeviceRequest, DeviceResponse, MetricEndpointConfig};
use tether_tunnel::Stream;
use tokio::time::Instant;

use crate::{client, client::ClientError, device_tunnel, security, state::AppState};

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

fn json_error(code: StatusCode, message: impl Into<String>) -> Response {
    (
        code,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
        .into_response()
}

fn device_error(code: u16, err: &dyn std::fmt::Display) -> Response {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY);
    json_error(status, err.to_string())
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection" | "keep-alive" | "transfer-encoding" | "upgrade" | "content-length"
    )
}

/// Copies a device reply to the caller: status, headers and body.
fn proxy_response(resp: DeviceResponse) -> Response {
    let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut out = Response::new(Body::from(resp.body));
    *out.status_mut() = status;
    let headers = out.headers_mut();
    for (name, value) in resp.headers {
        if is_hop_by_hop(&name) {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) else {
            continue;
        };
        headers.append(name, value);
    }
    out
}

impl AppState {
    fn deadline(&self) -> Instant {
        Instant::now() + self.config.request_timeout
    }
}

/// Opens an exchange for `key`, runs one operation on it, and proxies the
/// result. The exchange closes when `op` finishes; the channel stays up.
async fn with_device_connection<F, Fut>(state: &AppState, key: &DeviceKey, op: F) -> Response
where
    F: FnOnce(Stream, Instant) -> Fut,
    Fut: Future<Output = Result<DeviceResponse, ClientError>>,
{
    let deadline = state.deadline();
    let stream = match state.broker.open(key, deadline).await {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(device = %key, error = %e, "device exchange open failed");
            return device_error(e.status_code(), &e);
        }
    };

    match op(stream, deadline).await {
        Ok(resp) => proxy_response(resp),
        Err(e) => {
            tracing::warn!(device = %key, error = %e, "device operation failed");
            device_error(e.status_code(), &e)
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    connected_devices: usize,
    ssh_sessions: i64,
    applications: usize,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        connected_devices: state.broker.connected().await.len(),
        ssh_sessions: state.ssh_sessions.current(),
        applications: state.applications.len(),
    })
}

async fn initiate_ssh(
    State(state): State<AppState>,
    Path((project, device)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    let key = DeviceKey::new(project, device);
    let deadline = state.deadline();

    // Handshake before upgrading so failures still reach the caller as a status.
    let mut stream = match state.broker.open(&key, deadline).await {
        Ok(v) => v,
        Err(e) => return device_error(e.status_code(), &e),
    };
    if let Err(e) = client::initiate_ssh(&mut stream, deadline).await {
        tracing::warn!(device = %key, error = %e, "ssh handshake failed");
        return device_error(e.status_code(), &e);
    }

    ws.on_upgrade(move |socket| relay_ssh(state, key, stream, socket))
}

async fn relay_ssh(state: AppState, key: DeviceKey, stream: Stream, socket: WebSocket) {
    let _guard = state.ssh_sessions.start(&key.project);

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (writer, mut reader) = stream.split();

    let upstream = async {
        while let Some(Ok(msg)) = ws_rx.next().await {
            let sent = match msg {
                Message::Binary(bytes) => writer.send(&bytes).await,
                Message::Text(text) => writer.send(text.as_bytes()).await,
                Message::Close(_) => break,
                _ => continue,
            };
            if sent.is_err() {
                break;
            }
        }
    };

    let downstream = async {
        while let Some(chunk) = reader.recv().await {
            if ws_tx.send(Message::Binary(chunk)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    };

    tokio::select! {
        _ = upstream => {}
        _ = downstream => {}
    }
    tracing::debug!(device = %key, "ssh relay finished");
}

async fn initiate_reboot(
    State(state): State<AppState>,
    Path((project, device)): Path<(String, String)>,
) -> Response {
    let key = DeviceKey::new(project, device);
    with_device_connection(&state, &key, |mut stream, deadline| async move {
        client::initiate_reboot(&mut stream, deadline).await
    })
    .await
}

async fn device_debug(
    State(state): State<AppState>,
    Path((project, device, path)): Path<(String, String, String)>,
    Query(query): Query<BTreeMap<String, String>>,
    method: Method,
    body: Bytes,
) -> Response {
    let path = format!("/debug/{}", path.trim_start_matches('/'));
    let mut req = DeviceRequest::new(method.as_str(), path).with_body(body.to_vec());
    req.query = query;

    let key = DeviceKey::new(project, device);
    with_device_connection(&state, &key, |mut stream, deadline| async move {
        client::proxy_debug(&mut stream, deadline, req).await
    })
    .await
}

async fn host_metrics(
    State(state): State<AppState>,
    Path((project, device)): Path<(String, String)>,
) -> Response {
    let key = DeviceKey::new(project, device);
    with_device_connection(&state, &key, |mut stream, deadline| async move {
        client::get_device_metrics(&mut stream, deadline).await
    })
    .await
}

async fn agent_metrics(
    State(state): State<AppState>,
    Path((project, device)): Path<(String, String)>,
) -> Response {
    let key = DeviceKey::new(project, device);
    with_device_connection(&state, &key, |mut stream, deadline| async move {
        client::get_agent_metrics(&mut stream, deadline).await
    })
    .await
}

#[derive(Debug, serde::Deserialize)]
struct ServicePath {
    project: String,
    application: String,
    device: String,
    service: String,
}

fn resolve_endpoint(state: &AppState, p: &ServicePath) -> Result<MetricEndpointConfig, Response> {
    let Some(app) = state.applications.get(&p.project, &p.application) else {
        return Err(json_error(
            StatusCode::NOT_FOUND,
            format!("application {} not found", p.application),
        ));
    };
    Ok(MetricEndpointConfig::resolve(&app, &p.service))
}

async fn service_metrics(State(state): State<AppState>, Path(p): Path<ServicePath>) -> Response {
    let endpoint = match resolve_endpoint(&state, &p) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let key = DeviceKey::new(p.project, p.device);
    let (application, service) = (p.application, p.service);
    with_device_connection(&state, &key, |mut stream, deadline| async move {
        client::get_service_metrics(
            &mut stream,
            deadline,
            &application,
            &service,
            &endpoint.path,
            endpoint.port,
        )
        .await
    })
    .await
}

async fn service_logs(State(state): State<AppState>, Path(p): Path<ServicePath>) -> Response {
    if let Err(resp) = resolve_endpoint(&state, &p) {
        return resp;
    }

    let key = DeviceKey::new(p.project, p.device);
    let (application, service) = (p.application, p.service);
    with_device_connection(&state, &key, |mut stream, deadline| async move {
        client::get_service_logs(&mut stream, deadline, &application, &service).await
    })
    .await
}

#[derive(Debug, serde::Deserialize)]
struct PullProgressPath {
    project: String,
    device: String,
    application: String,
    service: String,
}

async fn image_pull_progress(
    State(state): State<AppState>,
    Path(p): Path<PullProgressPath>,
) -> Response {
    let key = DeviceKey::new(p.project, p.device);
    let (application, service) = (p.application, p.service);
    with_device_connection(&state, &key, |mut stream, deadline| async move {
        client::get_image_pull_progress(&mut stream, deadline, &application, &service).await
    })
    .await
}

async fn push_bundle(
    State(state): State<AppState>,
    Path((project, device)): Path<(String, String)>,
    Json(bundle): Json<Bundle>,
) -> Response {
    let key = DeviceKey::new(project, device);
    with_device_connection(&state, &key, |mut stream, deadline| async move {
        client::push_bundle(&mut stream, deadline, &bundle).await
    })
    .await
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/projects/:project/devices/:device/connect",
            get(device_tunnel::device_connect),
        )
        .route("/projects/:project/devices/:device/ssh", get(initiate_ssh))
        .route(
            "/projects/:project/devices/:device/reboot",
            post(initiate_reboot),
        )
        .route(
            "/projects/:project/devices/:device/debug/*path",
            any(device_debug),
        )
        .route(
            "/projects/:project/devices/:device/metrics/host",
            get(host_metrics),
        )
        .route(
            "/projects/:project/devices/:device/metrics/agent",
            get(agent_metrics),
        )
        .route(
            "/projects/:project/applications/:application/devices/:device/services/:service/metrics",
            get(service_metrics),
        )
        .route(
            "/projects/:project/applications/:application/devices/:device/services/:service/logs",
            get(service_logs),
        )
        .route(
            "/projects/:project/devices/:device/applications/:application/services/:service/imagepullprogress",
            get(image_pull_progress),
        )
        .route("/projects/:project/devices/:device/bundle", put(push_bundle))
        .layer(middleware::from_fn(security::request_id))
        .with_state(state)
}
