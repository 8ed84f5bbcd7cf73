// Controller-side stub for operations answered by the device's command service.
//
// Each call writes one encoded request on an already-open exchange and reads
// exactly one encoded response back.

use tether_models::{Bundle, DeviceRequest, DeviceResponse, codes};
use tether_tunnel::{Stream, TunnelError};
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("device closed the exchange before answering")]
    Closed,
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    #[error("invalid device payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("device did not answer in time")]
    Timeout,
    #[error("device refused {operation} (status {status})")]
    Rejected { operation: &'static str, status: u16 },
}

impl ClientError {
    pub fn status_code(&self) -> u16 {
        match self {
            ClientError::Timeout => codes::DEVICE_CONNECTION_TIMEOUT,
            ClientError::Tunnel(TunnelError::SessionClosed) => codes::DEVICE_CHANNEL_DEFUNCT,
            _ => codes::DEVICE_CONNECTION_FAILURE,
        }
    }
}

pub async fn request(
    stream: &mut Stream,
    req: &DeviceRequest,
    deadline: Instant,
) -> Result<DeviceResponse, ClientError> {
    let bytes = serde_json::to_vec(req)?;
    tokio::time::timeout_at(deadline, stream.send(&bytes))
        .await
        .map_err(|_| ClientError::Timeout)??;

    let reply = tokio::time::timeout_at(deadline, stream.recv())
        .await
        .map_err(|_| ClientError::Timeout)?
        .ok_or(ClientError::Closed)?;

    Ok(serde_json::from_slice(&reply)?)
}

/// Handshake that turns the exchange into a raw shell relay.
pub async fn initiate_ssh(stream: &mut Stream, deadline: Instant) -> Result<(), ClientError> {
    let resp = request(stream, &DeviceRequest::new("POST", "/ssh"), deadline).await?;
    if !resp.is_success() {
        return Err(ClientError::Rejected {
            operation: "ssh",
            status: resp.status,
        });
    }
    Ok(())
}

pub async fn initiate_reboot(
    stream: &mut Stream,
    deadline: Instant,
) -> Result<DeviceResponse, ClientError> {
    request(stream, &DeviceRequest::new("POST", "/reboot"), deadline).await
}

pub async fn get_device_metrics(
    stream: &mut Stream,
    deadline: Instant,
) -> Result<DeviceResponse, ClientError> {
    request(stream, &DeviceRequest::new("GET", "/metrics/host"), deadline).await
}

pub async fn get_agent_metrics(
    stream: &mut Stream,
    deadline: Instant,
) -> Result<DeviceResponse, ClientError> {
    request(stream, &DeviceRequest::new("GET", "/metrics/agent"), deadline).await
}

fn service_path(application: &str, service: &str, leaf: &str) -> String {
    format!("/applications/{application}/services/{service}/{leaf}")
}

pub async fn get_service_metrics(
    stream: &mut Stream,
    deadline: Instant,
    application: &str,
    service: &str,
    path: &str,
    port: u16,
) -> Result<DeviceResponse, ClientError> {
    let req = DeviceRequest::new("GET", service_path(application, service, "metrics"))
        .with_query("path", path)
        .with_query("port", port.to_string());
    request(stream, &req, deadline).await
}

pub async fn get_service_logs(
    stream: &mut Stream,
    deadline: Instant,
    application: &str,
    service: &str,
) -> Result<DeviceResponse, ClientError> {
    let req = DeviceRequest::new("GET", service_path(application, service, "logs"));
    request(stream, &req, deadline).await
}

pub async fn get_image_pull_progress(
    stream: &mut Stream,
    deadline: Instant,
    application: &str,
    service: &str,
) -> Result<DeviceResponse, ClientError> {
    let req = DeviceRequest::new("GET", service_path(application, service, "imagepullprogress"));
    request(stream, &req, deadline).await
}

pub async fn push_bundle(
    stream: &mut Stream,
    deadline: Instant,
    bundle: &Bundle,
) -> Result<DeviceResponse, ClientError> {
    let req = DeviceRequest::new("POST", "/bundle").with_body(serde_json::to_vec(bundle)?);
    request(stream, &req, deadline).await
}

pub async fn proxy_debug(
    stream: &mut Stream,
    deadline: Instant,
    req: DeviceRequest,
) -> Result<DeviceResponse, ClientError> {
    request(stream, &req, deadline).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tether_tunnel::Session;

    use super::*;

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn service_metrics_request_carries_endpoint() {
        let (controller, device) = Session::pair();
        let answer = tokio::spawn(async move {
            let mut stream = device.accept().await.unwrap();
            let raw = stream.recv().await.unwrap();
            let req: DeviceRequest = serde_json::from_slice(&raw).unwrap();
            let resp = DeviceResponse::text(200, "ok");
            stream.send(&serde_json::to_vec(&resp).unwrap()).await.unwrap();
            req
        });

        let mut stream = controller.open_stream().await.unwrap();
        let resp = get_service_metrics(&mut stream, soon(), "app", "web", "/stats", 9000)
            .await
            .unwrap();
        assert_eq!(resp.status, 200);

        let req = answer.await.unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/applications/app/services/web/metrics");
        assert_eq!(req.query.get("path").unwrap(), "/stats");
        assert_eq!(req.query.get("port").unwrap(), "9000");
    }

    #[tokio::test]
    async fn ssh_handshake_rejection_is_an_error() {
        let (controller, device) = Session::pair();
        tokio::spawn(async move {
            let mut stream = device.accept().await.unwrap();
            let _ = stream.recv().await;
            let resp = DeviceResponse::text(503, "sshd unavailable");
            let _ = stream.send(&serde_json::to_vec(&resp).unwrap()).await;
        });

        let mut stream = controller.open_stream().await.unwrap();
        let err = initiate_ssh(&mut stream, soon()).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Rejected {
                operation: "ssh",
                status: 503
            }
        ));
        assert_eq!(err.status_code(), codes::DEVICE_CONNECTION_FAILURE);
    }

    #[tokio::test]
    async fn device_closing_exchange_surfaces_closed() {
        let (controller, device) = Session::pair();
        tokio::spawn(async move {
            let mut stream = device.accept().await.unwrap();
            let _ = stream.recv().await;
        });

        let mut stream = controller.open_stream().await.unwrap();
        let err = initiate_reboot(&mut stream, soon()).await.unwrap_err();
        assert!(matches!(err, ClientError::Closed));
    }

    #[tokio::test]
    async fn silent_device_times_out() {
        let (controller, device) = Session::pair();
        let _keep = tokio::spawn(async move {
            let stream = device.accept().await;
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(stream);
        });

        let mut stream = controller.open_stream().await.unwrap();
        let deadline = Instant::now() + Duration::from_millis(50);
        let err = get_agent_metrics(&mut stream, deadline).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
        assert_eq!(err.status_code(), codes::DEVICE_CONNECTION_TIMEOUT);
    }
}
