// Answers the exchanges the controller opens over the control tunnel.
//
// Every exchange starts with one encoded `DeviceRequest`. Most operations write
// a single `DeviceResponse` back; `/ssh` turns the exchange into a raw byte
// relay after the handshake reply.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tether_models::{
    Bundle, DEFAULT_METRIC_PATH, DEFAULT_METRIC_PORT, DeviceRequest, DeviceResponse, codes,
};
use tether_tunnel::Stream;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{Instrument, info_span};

use crate::{
    agent_metrics::AgentMetrics, config::AgentConfig, lookup::Lookup, supervisor::Supervisor,
    updater::Updater,
};

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const RELAY_BUF: usize = 16 * 1024;

#[derive(Clone)]
pub struct CommandService {
    config: Arc<AgentConfig>,
    supervisor: Arc<Supervisor>,
    updater: Arc<Updater>,
    metrics: Arc<AgentMetrics>,
    http: reqwest::Client,
}

async fn reply(stream: &Stream, resp: &DeviceResponse) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec(resp)?;
    stream.send(&bytes).await?;
    Ok(())
}

impl CommandService {
    pub fn new(
        config: Arc<AgentConfig>,
        supervisor: Arc<Supervisor>,
        updater: Arc<Updater>,
        metrics: Arc<AgentMetrics>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;
        Ok(Self {
            config,
            supervisor,
            updater,
            metrics,
            http,
        })
    }

    pub fn metrics(&self) -> &AgentMetrics {
        &self.metrics
    }

    pub async fn serve(&self, mut stream: Stream) {
        let Some(raw) = stream.recv().await else {
            return;
        };
        AgentMetrics::inc(&self.metrics.requests_total);

        let req: DeviceRequest = match serde_json::from_slice(&raw) {
            Ok(req) => req,
            Err(e) => {
                AgentMetrics::inc(&self.metrics.request_errors_total);
                let _ = reply(&stream, &DeviceResponse::text(400, format!("invalid request: {e}"))).await;
                return;
            }
        };

        let span = info_span!(
            "command",
            stream = stream.id(),
            method = %req.method,
            path = %req.path
        );
        async move {
            match (req.method.as_str(), req.path.as_str()) {
                ("POST", "/ssh") => self.ssh(stream).await,
                ("POST", "/reboot") => self.reboot(stream).await,
                _ => {
                    let resp = self.dispatch(&req).await;
                    if !resp.is_success() {
                        AgentMetrics::inc(&self.metrics.request_errors_total);
                    }
                    if let Err(e) = reply(&stream, &resp).await {
                        tracing::debug!(error = %e, "failed to write reply");
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Request/response operations.
    pub async fn dispatch(&self, req: &DeviceRequest) -> DeviceResponse {
        let segments: Vec<&str> = req.path.trim_matches('/').split('/').collect();
        match (req.method.as_str(), segments.as_slice()) {
            ("GET", ["metrics", "host"]) => self.fetch(&self.config.host_metrics_url).await,
            ("GET", ["metrics", "agent"]) => {
                let body = self.metrics.render_prometheus(self.supervisor.stats());
                let mut resp = DeviceResponse::text(200, body);
                resp.headers = vec![(
                    "content-type".to_string(),
                    "text/plain; version=0.0.4".to_string(),
                )];
                resp
            }
            ("GET", ["applications", application, "services", service, "metrics"]) => {
                self.service_metrics(application, service, &req.query).await
            }
            ("GET", ["applications", application, "services", service, "logs"]) => {
                match self.supervisor.get_service_logs(application, service).await {
                    Ok(logs) => DeviceResponse::text(200, logs),
                    Err(e) => DeviceResponse::text(codes::SERVICE_LOGS_NOT_AVAILABLE, e.to_string()),
                }
            }
            ("GET", ["applications", application, "services", service, "imagepullprogress"]) => {
                match self.supervisor.get_image_pull_progress(application, service) {
                    Some(progress) => DeviceResponse::json(200, &progress),
                    None => DeviceResponse::text(
                        codes::IMAGE_PULL_PROGRESS_NOT_AVAILABLE,
                        "no image pull in progress",
                    ),
                }
            }
            ("POST", ["bundle"]) => self.apply_bundle(&req.body),
            ("GET", ["debug", "version"]) => DeviceResponse::json(
                200,
                &serde_json::json!({
                    "version": self.updater.version(),
                    "project": self.config.project_id,
                    "device": self.config.device_id,
                    "desired_agent_image": self.updater.desired_spec().map(|spec| spec.image),
                }),
            ),
            ("GET", ["debug", "supervisor"]) => DeviceResponse::json(200, &self.supervisor.snapshot()),
            _ => DeviceResponse::text(404, format!("no handler for {} {}", req.method, req.path)),
        }
    }

    async fn service_metrics(
        &self,
        application: &str,
        service: &str,
        query: &BTreeMap<String, String>,
    ) -> DeviceResponse {
        if self.supervisor.get_container_id(application, service).is_none() {
            return DeviceResponse::text(
                codes::SERVICE_NOT_RUNNING,
                format!("service {application}/{service} is not running"),
            );
        }

        let port = match query.get("port").map(|p| p.trim().parse::<u16>()) {
            None => DEFAULT_METRIC_PORT,
            Some(Ok(port)) => port,
            Some(Err(_)) => return DeviceResponse::text(400, "invalid metrics port"),
        };
        let path = query
            .get("path")
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_METRIC_PATH);
        let sep = if path.starts_with('/') { "" } else { "/" };
        self.fetch(&format!("http://127.0.0.1:{port}{sep}{path}")).await
    }

    async fn fetch(&self, url: &str) -> DeviceResponse {
        let resp = match self.http.get(url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(%url, error = %e, "metrics fetch failed");
                return DeviceResponse::text(502, format!("fetch {url}: {e}"));
            }
        };
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        match resp.bytes().await {
            Ok(body) => DeviceResponse {
                status,
                headers: content_type
                    .map(|ct| vec![("content-type".to_string(), ct)])
                    .unwrap_or_default(),
                body: body.to_vec(),
            },
            Err(e) => DeviceResponse::text(502, format!("read {url}: {e}")),
        }
    }

    fn apply_bundle(&self, body: &[u8]) -> DeviceResponse {
        let bundle: Bundle = match serde_json::from_slice(body) {
            Ok(bundle) => bundle,
            Err(e) => return DeviceResponse::text(400, format!("invalid bundle: {e}")),
        };

        self.supervisor.set_desired_applications(&bundle.applications);
        if let Some(spec) = bundle.desired_agent_spec {
            self.updater.set_registry_auth(bundle.agent_registry_auth);
            self.updater.set_desired_spec(spec);
        }
        AgentMetrics::inc(&self.metrics.bundles_applied_total);
        tracing::info!(applications = bundle.applications.len(), "bundle applied");
        DeviceResponse::json(
            200,
            &serde_json::json!({ "applications": bundle.applications.len() }),
        )
    }

    async fn ssh(&self, stream: Stream) {
        let tcp = match TcpStream::connect(&self.config.ssh_addr).await {
            Ok(tcp) => tcp,
            Err(e) => {
                tracing::warn!(addr = %self.config.ssh_addr, error = %e, "ssh endpoint unavailable");
                AgentMetrics::inc(&self.metrics.request_errors_total);
                let resp = DeviceResponse::text(503, format!("ssh endpoint unavailable: {e}"));
                let _ = reply(&stream, &resp).await;
                return;
            }
        };
        if reply(&stream, &DeviceResponse::ok()).await.is_err() {
            return;
        }

        AgentMetrics::inc(&self.metrics.ssh_sessions);
        tracing::info!("ssh relay started");
        relay(stream, tcp).await;
        AgentMetrics::dec(&self.metrics.ssh_sessions);
        tracing::info!("ssh relay ended");
    }

    async fn reboot(&self, stream: Stream) {
        let _ = reply(&stream, &DeviceResponse::ok()).await;
        drop(stream);

        let Some((program, args)) = self.config.reboot_command.split_first() else {
            return;
        };
        tracing::warn!(command = ?self.config.reboot_command, "rebooting device");
        match tokio::process::Command::new(program).args(args).status().await {
            Ok(status) if status.success() => {}
            Ok(status) => tracing::warn!(%status, "reboot command failed"),
            Err(e) => tracing::warn!(error = %e, "failed to run reboot command"),
        }
    }
}

/// Copies bytes both ways until either side closes.
async fn relay(stream: Stream, tcp: TcpStream) {
    let (writer, mut reader) = stream.split();
    let (mut tcp_read, mut tcp_write) = tcp.into_split();

    let inbound = async move {
        while let Some(chunk) = reader.recv().await {
            if tcp_write.write_all(&chunk).await.is_err() {
                break;
            }
        }
        let _ = tcp_write.shutdown().await;
    };
    let outbound = async move {
        let mut buf = vec![0u8; RELAY_BUF];
        loop {
            match tcp_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if writer.send(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    };

    tokio::select! {
        _ = inbound => {}
        _ = outbound => {}
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tether_models::{DesiredApplication, PullEvent, Service};
    use tether_tunnel::Session;
    use tokio::net::TcpListener;

    use crate::engine::{PullProgressSink, fake::FakeEngine};

    use super::*;

    struct Harness {
        engine: Arc<FakeEngine>,
        supervisor: Arc<Supervisor>,
        updater: Arc<Updater>,
        service: CommandService,
    }

    fn harness(ssh_addr: &str) -> Harness {
        let engine = Arc::new(FakeEngine::new());
        let supervisor = Arc::new(Supervisor::new(engine.clone(), Duration::from_secs(3600)));
        let updater = Arc::new(Updater::new(engine.clone(), "p1", "v1"));
        let config = AgentConfig {
            project_id: "p1".to_string(),
            device_id: "d1".to_string(),
            ssh_addr: ssh_addr.to_string(),
            reboot_command: vec!["true".to_string()],
            ..AgentConfig::default()
        };
        let service = CommandService::new(
            Arc::new(config),
            supervisor.clone(),
            updater.clone(),
            Arc::new(AgentMetrics::new()),
        )
        .unwrap();
        Harness {
            engine,
            supervisor,
            updater,
            service,
        }
    }

    fn get(path: &str) -> DeviceRequest {
        DeviceRequest::new("GET", path)
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let h = harness("127.0.0.1:1");
        assert_eq!(h.service.dispatch(&get("/nope")).await.status, 404);
        assert_eq!(
            h.service
                .dispatch(&DeviceRequest::new("DELETE", "/metrics/agent"))
                .await
                .status,
            404
        );
    }

    #[tokio::test]
    async fn logs_map_lookup_failures_to_not_available() {
        let h = harness("127.0.0.1:1");
        let resp = h.service.dispatch(&get("/applications/shop/services/web/logs")).await;
        assert_eq!(resp.status, codes::SERVICE_LOGS_NOT_AVAILABLE);

        let web = h.supervisor.ensure_application("shop").ensure_service("web");
        let resp = h.service.dispatch(&get("/applications/shop/services/web/logs")).await;
        assert_eq!(resp.status, codes::SERVICE_LOGS_NOT_AVAILABLE);
        assert_eq!(h.engine.count("logs"), 0);

        h.engine.add_container("c1", Service::default(), true);
        h.engine
            .logs
            .lock()
            .unwrap()
            .insert("c1".to_string(), "ready\n".to_string());
        web.set_container_id("c1");
        let resp = h.service.dispatch(&get("/applications/shop/services/web/logs")).await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"ready\n");
    }

    #[tokio::test]
    async fn pull_progress_is_reported_while_pulling() {
        let h = harness("127.0.0.1:1");
        let path = "/applications/shop/services/web/imagepullprogress";
        let resp = h.service.dispatch(&get(path)).await;
        assert_eq!(resp.status, codes::IMAGE_PULL_PROGRESS_NOT_AVAILABLE);

        let web = h.supervisor.ensure_application("shop").ensure_service("web");
        let tracker = web.begin_pull("shop/web:3");
        tracker.on_event(PullEvent {
            id: "l1".to_string(),
            status: "Downloading".to_string(),
            current: Some(5),
            total: Some(10),
            ..PullEvent::default()
        });

        let resp = h.service.dispatch(&get(path)).await;
        assert_eq!(resp.status, 200);
        let progress: BTreeMap<String, PullEvent> = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(progress["l1"].total, Some(10));
    }

    #[tokio::test]
    async fn service_metrics_need_a_running_container() {
        let h = harness("127.0.0.1:1");
        let resp = h
            .service
            .dispatch(&get("/applications/shop/services/web/metrics"))
            .await;
        assert_eq!(resp.status, codes::SERVICE_NOT_RUNNING);
    }

    async fn serve_http_once(body: &'static str) -> u16 {
        let app = axum::Router::new().route(
            "/stats",
            axum::routing::get(move || async move { ([("content-type", "text/plain")], body) }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        port
    }

    #[tokio::test]
    async fn service_metrics_are_fetched_from_the_endpoint() {
        let h = harness("127.0.0.1:1");
        let port = serve_http_once("requests 7\n").await;
        h.supervisor
            .ensure_application("shop")
            .ensure_service("web")
            .set_container_id("c1");

        let req = get("/applications/shop/services/web/metrics")
            .with_query("path", "/stats")
            .with_query("port", port.to_string());
        let resp = h.service.dispatch(&req).await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"requests 7\n");
        assert!(resp.headers.iter().any(|(k, v)| k == "content-type" && v == "text/plain"));
    }

    #[tokio::test]
    async fn bundle_reaches_supervisor_and_updater() {
        let h = harness("127.0.0.1:1");
        let bundle = Bundle {
            applications: vec![DesiredApplication {
                id: "shop".to_string(),
                services: BTreeMap::from([(
                    "web".to_string(),
                    Service {
                        image: "shop/web:3".to_string(),
                        ..Service::default()
                    },
                )]),
                registry_auth: None,
            }],
            desired_agent_spec: Some(Service {
                image: "agent:v1".to_string(),
                ..Service::default()
            }),
            agent_registry_auth: Some("YWdlbnQ=".to_string()),
        };
        let req = DeviceRequest::new("POST", "/bundle").with_body(serde_json::to_vec(&bundle).unwrap());

        let resp = h.service.dispatch(&req).await;
        assert_eq!(resp.status, 200);
        assert!(h.supervisor.application("shop").unwrap().service("web").is_some());
        assert_eq!(h.updater.desired_spec().unwrap().image, "agent:v1");
        assert_eq!(h.updater.registry_auth().as_deref(), Some("YWdlbnQ="));

        let bad = DeviceRequest::new("POST", "/bundle").with_body(b"{".to_vec());
        assert_eq!(h.service.dispatch(&bad).await.status, 400);
    }

    #[tokio::test]
    async fn agent_metrics_and_debug_endpoints() {
        let h = harness("127.0.0.1:1");
        let resp = h.service.dispatch(&get("/metrics/agent")).await;
        assert_eq!(resp.status, 200);
        assert!(String::from_utf8(resp.body).unwrap().contains("tether_agent_services 0"));

        let resp = h.service.dispatch(&get("/debug/version")).await;
        let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(body["version"], "v1");
        assert_eq!(body["device"], "d1");

        h.supervisor.ensure_application("shop").ensure_service("web");
        let resp = h.service.dispatch(&get("/debug/supervisor")).await;
        let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert!(body["shop"]["web"].is_object());
    }

    async fn exchange(session: &Session, req: &DeviceRequest) -> (Stream, DeviceResponse) {
        let mut stream = session.open_stream().await.unwrap();
        stream.send(&serde_json::to_vec(req).unwrap()).await.unwrap();
        let raw = stream.recv().await.unwrap();
        (stream, serde_json::from_slice(&raw).unwrap())
    }

    fn accept_all(device: Session, service: CommandService) {
        tokio::spawn(async move {
            while let Some(stream) = device.accept().await {
                let service = service.clone();
                tokio::spawn(async move { service.serve(stream).await });
            }
        });
    }

    #[tokio::test]
    async fn ssh_exchange_relays_to_local_endpoint() {
        let sshd = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = sshd.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = sshd.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = sock.read(&mut buf).await.unwrap();
            sock.write_all(&buf[..n]).await.unwrap();
        });

        let h = harness(&addr.to_string());
        let (controller, device) = Session::pair();
        accept_all(device, h.service.clone());

        let (mut stream, resp) = exchange(&controller, &DeviceRequest::new("POST", "/ssh")).await;
        assert_eq!(resp.status, 200);
        stream.send(b"SSH-2.0-client").await.unwrap();
        let echoed = tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed, b"SSH-2.0-client");
    }

    #[tokio::test]
    async fn ssh_handshake_fails_without_endpoint() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = closed.local_addr().unwrap();
        drop(closed);

        let h = harness(&addr.to_string());
        let (controller, device) = Session::pair();
        accept_all(device, h.service.clone());

        let (_stream, resp) = exchange(&controller, &DeviceRequest::new("POST", "/ssh")).await;
        assert_eq!(resp.status, 503);
    }

    #[tokio::test]
    async fn reboot_is_acknowledged_and_garbage_rejected() {
        let h = harness("127.0.0.1:1");
        let (controller, device) = Session::pair();
        accept_all(device, h.service.clone());

        let (_stream, resp) = exchange(&controller, &DeviceRequest::new("POST", "/reboot")).await;
        assert_eq!(resp.status, 200);

        let mut stream = controller.open_stream().await.unwrap();
        stream.send(b"not json").await.unwrap();
        let raw = stream.recv().await.unwrap();
        let resp: DeviceResponse = serde_json::from_slice(&raw).unwrap();
        assert_eq!(resp.status, 400);
        assert_eq!(
            h.service
                .metrics()
                .request_errors_total
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }
}
