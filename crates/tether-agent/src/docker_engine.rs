use std::collections::{BTreeMap, BTreeSet, HashMap};

use base64::Engine as _;
use bollard::{
    Docker,
    auth::DockerCredentials,
    errors::Error as BollardError,
    models::{ContainerCreateBody, HostConfig, RestartPolicy, RestartPolicyNameEnum},
    query_parameters::{
        CreateContainerOptionsBuilder, CreateImageOptionsBuilder,
        InspectContainerOptions, ListContainersOptionsBuilder, LogsOptionsBuilder,
        RemoveContainerOptionsBuilder, StartContainerOptions, StopContainerOptionsBuilder,
    },
};
use futures_util::StreamExt;
use tether_models::{PullEvent, Service};

use crate::engine::{Engine, EngineError, InspectResponse, Instance, PullProgressSink};

const LOG_TAIL_LINES: &str = "500";

/// `Engine` backed by the local Docker daemon.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn connect() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::operation("connect", e.to_string()))?;
        Ok(Self { docker })
    }
}

fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn map_err(operation: &'static str) -> impl Fn(BollardError) -> EngineError {
    move |error| {
        if is_not_found(&error) {
            EngineError::InstanceNotFound
        } else {
            EngineError::operation(operation, error.to_string())
        }
    }
}

/// Splits `repo[:tag]`, leaving a registry port in the repository part.
fn split_image(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (image, "latest"),
    }
}

fn container_body(spec: &Service) -> ContainerCreateBody {
    let env: Vec<String> = spec
        .environment
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    let restart_policy = spec.restart.then(|| RestartPolicy {
        name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
        maximum_retry_count: None,
    });

    ContainerCreateBody {
        image: Some(spec.image.clone()),
        cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
        env: (!env.is_empty()).then_some(env),
        labels: Some(spec.labels.clone().into_iter().collect()),
        host_config: Some(HostConfig {
            network_mode: spec.network_mode.clone(),
            privileged: Some(spec.privileged),
            restart_policy,
            ..HostConfig::default()
        }),
        ..ContainerCreateBody::default()
    }
}

fn decode_credentials(raw: &str) -> Option<DockerCredentials> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(raw.trim())
        .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(raw.trim()))
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[async_trait::async_trait]
impl Engine for DockerEngine {
    async fn create_container(&self, name: &str, spec: &Service) -> Result<String, EngineError> {
        let options = (!name.is_empty())
            .then(|| CreateContainerOptionsBuilder::new().name(name).build());
        let created = self
            .docker
            .create_container(options, container_body(spec))
            .await
            .map_err(map_err("create_container"))?;
        Ok(created.id)
    }

    async fn inspect_container(&self, id: &str) -> Result<InspectResponse, EngineError> {
        let inspected = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(map_err("inspect_container"))?;
        let state = inspected.state.unwrap_or_default();
        Ok(InspectResponse {
            pid: state.pid.unwrap_or(0),
            running: state.running.unwrap_or(false),
        })
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(map_err("start_container"))
    }

    async fn list_containers(
        &self,
        ids: &BTreeSet<String>,
        labels: &BTreeMap<String, String>,
        running_only: bool,
    ) -> Result<Vec<Instance>, EngineError> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        if !ids.is_empty() {
            filters.insert("id".to_string(), ids.iter().cloned().collect());
        }
        if !labels.is_empty() {
            filters.insert(
                "label".to_string(),
                labels.iter().map(|(k, v)| format!("{k}={v}")).collect(),
            );
        }
        let options = ListContainersOptionsBuilder::new()
            .all(!running_only)
            .filters(&filters)
            .build();

        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(map_err("list_containers"))?;
        Ok(summaries
            .into_iter()
            .filter_map(|summary| {
                let running = summary
                    .state
                    .as_ref()
                    .is_some_and(|state| state.to_string() == "running");
                Some(Instance {
                    id: summary.id?,
                    labels: summary.labels.unwrap_or_default().into_iter().collect(),
                    running,
                })
            })
            .collect())
    }

    async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .stop_container(id, Some(StopContainerOptionsBuilder::new().t(10).build()))
            .await
            .map_err(map_err("stop_container"))
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .remove_container(id, Some(RemoveContainerOptionsBuilder::new().force(true).build()))
            .await
            .map_err(map_err("remove_container"))
    }

    async fn fetch_container_logs(&self, id: &str) -> Result<String, EngineError> {
        let options = LogsOptionsBuilder::new()
            .stdout(true)
            .stderr(true)
            .tail(LOG_TAIL_LINES)
            .build();
        let mut stream = std::pin::pin!(self.docker.logs(id, Some(options)));
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_err("fetch_container_logs"))?;
            out.push_str(&chunk.to_string());
        }
        Ok(out)
    }

    async fn pull_image(
        &self,
        image: &str,
        registry_auth: Option<&str>,
        progress: &dyn PullProgressSink,
    ) -> Result<(), EngineError> {
        let (from_image, tag) = split_image(image);
        let options = CreateImageOptionsBuilder::new()
            .from_image(from_image)
            .tag(tag)
            .build();
        let credentials = registry_auth.and_then(decode_credentials);

        let mut stream = std::pin::pin!(self.docker.create_image(Some(options), None, credentials));
        while let Some(info) = stream.next().await {
            let info = info.map_err(|e| EngineError::operation("pull_image", e.to_string()))?;
            let detail = info.progress_detail.unwrap_or_default();
            progress.on_event(PullEvent {
                id: info.id.unwrap_or_default(),
                status: info.status.unwrap_or_default(),
                progress: info.progress.unwrap_or_default(),
                current: detail.current,
                total: detail.total,
            });
        }
        tracing::info!(image, "image pulled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_image_keeps_registry_port() {
        assert_eq!(split_image("nginx:1.27"), ("nginx", "1.27"));
        assert_eq!(split_image("nginx"), ("nginx", "latest"));
        assert_eq!(
            split_image("registry.local:5000/shop/web"),
            ("registry.local:5000/shop/web", "latest")
        );
        assert_eq!(
            split_image("registry.local:5000/shop/web:3"),
            ("registry.local:5000/shop/web", "3")
        );
    }

    #[test]
    fn body_carries_launch_spec() {
        let spec = Service {
            image: "shop/web:3".to_string(),
            command: vec!["serve".to_string()],
            environment: BTreeMap::from([("PORT".to_string(), "80".to_string())]),
            labels: BTreeMap::from([("a".to_string(), "b".to_string())]),
            network_mode: Some("host".to_string()),
            privileged: true,
            restart: true,
        };
        let body = container_body(&spec);
        assert_eq!(body.image.as_deref(), Some("shop/web:3"));
        assert_eq!(body.cmd, Some(vec!["serve".to_string()]));
        assert_eq!(body.env, Some(vec!["PORT=80".to_string()]));
        assert_eq!(body.labels.unwrap().get("a").map(String::as_str), Some("b"));
        let host = body.host_config.unwrap();
        assert_eq!(host.network_mode.as_deref(), Some("host"));
        assert_eq!(host.privileged, Some(true));
        assert!(host.restart_policy.is_some());
    }

    #[test]
    fn credentials_decode_from_base64_json() {
        let raw = base64::engine::general_purpose::STANDARD
            .encode(r#"{"username":"bot","password":"s3cret"}"#);
        let creds = decode_credentials(&raw).unwrap();
        assert_eq!(creds.username.as_deref(), Some("bot"));
        assert!(decode_credentials("not base64!").is_none());
    }
}
