use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

pub mod codes;

/// Label carrying the version token of a self-updated agent container.
pub const AGENT_VERSION_LABEL: &str = "com.tether.agent_version";
pub const APPLICATION_LABEL: &str = "com.tether.application";
pub const SERVICE_LABEL: &str = "com.tether.service";
pub const HASH_LABEL: &str = "com.tether.hash";

pub const DEFAULT_METRIC_PATH: &str = "/metrics";
pub const DEFAULT_METRIC_PORT: u16 = 2112;

/// Placeholder in a launch command that is replaced by the real project id.
pub const PROJECT_PLACEHOLDER: &str = "$PROJECT";

/// Identity of one device within one project. The broker keys its registry
/// on this pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey {
    pub project: String,
    pub device: String,
}

impl DeviceKey {
    pub fn new(project: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            device: device.into(),
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.device)
    }
}

/// Launch spec for one container workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub network_mode: Option<String>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub restart: bool,
}

impl Service {
    /// Stable digest of the launch spec, used to tell a current container from
    /// a stale one.
    pub fn spec_hash(&self) -> Result<String, serde_json::Error> {
        use sha2::Digest;
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(sha2::Sha256::digest(&bytes)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricEndpointConfig {
    pub path: String,
    pub port: u16,
}

impl Default for MetricEndpointConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_METRIC_PATH.to_string(),
            port: DEFAULT_METRIC_PORT,
        }
    }
}

impl MetricEndpointConfig {
    /// Declared endpoint for `service`, or the default path/port when the
    /// application declares none.
    pub fn resolve(app: &Application, service: &str) -> Self {
        app.metric_endpoint_configs
            .get(service)
            .cloned()
            .unwrap_or_default()
    }
}

/// Controller-side view of an application: its services and how to scrape them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub services: BTreeMap<String, Service>,
    #[serde(default)]
    pub metric_endpoint_configs: BTreeMap<String, MetricEndpointConfig>,
}

/// Application services as delivered to a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredApplication {
    pub id: String,
    #[serde(default)]
    pub services: BTreeMap<String, Service>,
    /// Base64 JSON registry credentials for pulling this application's images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_auth: Option<String>,
}

/// Deployment push for one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    #[serde(default)]
    pub applications: Vec<DesiredApplication>,
    #[serde(default)]
    pub desired_agent_spec: Option<Service>,
    /// Registry credentials for the agent image, same encoding as
    /// [`DesiredApplication::registry_auth`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_registry_auth: Option<String>,
}

/// Progress of one image layer during a pull.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullEvent {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub progress: String,
    #[serde(default)]
    pub current: Option<i64>,
    #[serde(default)]
    pub total: Option<i64>,
}

/// Request written on an exchange for request/response operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "b64")]
    pub body: Vec<u8>,
}

impl DeviceRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.insert(key.to_string(), value.into());
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }
}

/// Reply read back from an exchange; copied verbatim to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "b64")]
    pub body: Vec<u8>,
}

impl DeviceResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: vec![(
                "content-type".to_string(),
                "text/plain; charset=utf-8".to_string(),
            )],
            body: body.into().into_bytes(),
        }
    }

    pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status,
                headers: vec![("content-type".to_string(), "application/json".to_string())],
                body,
            },
            Err(e) => Self::text(500, format!("failed to encode response: {e}")),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

mod b64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(raw.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
