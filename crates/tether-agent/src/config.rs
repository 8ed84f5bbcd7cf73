use std::{path::PathBuf, time::Duration};

const DEFAULT_SSH_ADDR: &str = "127.0.0.1:22";
const DEFAULT_HOST_METRICS_URL: &str = "http://127.0.0.1:9100/metrics";
const DEFAULT_REBOOT_COMMAND: &str = "reboot";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Controller base URL. Unset keeps the agent offline.
    pub control_url: Option<String>,
    pub project_id: String,
    pub device_id: String,
    pub device_token: Option<String>,
    /// Version token compared against the desired agent image tag.
    pub agent_version: String,
    pub ssh_addr: String,
    pub reboot_command: Vec<String>,
    pub host_metrics_url: String,
    pub reconcile_interval: Duration,
    pub log_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            control_url: None,
            project_id: "default".to_string(),
            device_id: "default".to_string(),
            device_token: None,
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            ssh_addr: DEFAULT_SSH_ADDR.to_string(),
            reboot_command: vec![DEFAULT_REBOOT_COMMAND.to_string()],
            host_metrics_url: DEFAULT_HOST_METRICS_URL.to_string(),
            reconcile_interval: Duration::from_secs(10),
            log_dir: None,
        }
    }
}

fn env_trimmed(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_ms(raw: Option<String>, default_ms: u64, min_ms: u64, max_ms: u64) -> Duration {
    let ms = raw
        .as_deref()
        .unwrap_or_default()
        .trim()
        .parse::<u64>()
        .ok()
        .unwrap_or(default_ms)
        .clamp(min_ms, max_ms);
    Duration::from_millis(ms)
}

fn parse_command(raw: Option<String>) -> Vec<String> {
    let parts: Vec<String> = raw
        .as_deref()
        .unwrap_or(DEFAULT_REBOOT_COMMAND)
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if parts.is_empty() {
        return vec![DEFAULT_REBOOT_COMMAND.to_string()];
    }
    parts
}

impl AgentConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let project_id = env_trimmed("TETHER_PROJECT_ID");
        let device_id = env_trimmed("TETHER_DEVICE_ID").or_else(|| env_trimmed("HOSTNAME"));
        let control_url = env_trimmed("TETHER_CONTROL_WS_URL");
        if control_url.is_some() && project_id.is_none() {
            anyhow::bail!("TETHER_PROJECT_ID is required when TETHER_CONTROL_WS_URL is set");
        }

        Ok(Self {
            control_url,
            project_id: project_id.unwrap_or(defaults.project_id),
            device_id: device_id.unwrap_or(defaults.device_id),
            device_token: env_trimmed("TETHER_DEVICE_TOKEN"),
            agent_version: env_trimmed("TETHER_AGENT_VERSION").unwrap_or(defaults.agent_version),
            ssh_addr: env_trimmed("TETHER_SSH_ADDR").unwrap_or(defaults.ssh_addr),
            reboot_command: parse_command(env_trimmed("TETHER_REBOOT_COMMAND")),
            host_metrics_url: env_trimmed("TETHER_HOST_METRICS_URL")
                .unwrap_or(defaults.host_metrics_url),
            reconcile_interval: parse_ms(
                env_trimmed("TETHER_RECONCILE_INTERVAL_MS"),
                10_000,
                500,
                10 * 60_000,
            ),
            log_dir: env_trimmed("TETHER_LOG_DIR").map(PathBuf::from),
        })
    }
}
