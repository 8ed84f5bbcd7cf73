use std::{net::SocketAddr, path::PathBuf, time::Duration};

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub listen_addr: SocketAddr,
    /// Shared bearer token devices present on connect. Unset disables the check.
    pub connect_token: Option<String>,
    /// Upper bound for one proxied operation, exchange open included.
    pub request_timeout: Duration,
    /// How long an operation waits for a device that is mid-reconnect.
    pub reconnect_grace: Duration,
    /// How long a freshly upgraded device socket may take to send `hello`.
    pub hello_timeout: Duration,
    pub applications_file: Option<PathBuf>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], 8080).into(),
            connect_token: None,
            request_timeout: Duration::from_secs(30),
            reconnect_grace: Duration::from_secs(2),
            hello_timeout: Duration::from_secs(10),
            applications_file: None,
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

impl ControlConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let listen_addr = env_trimmed("TETHER_LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| anyhow::anyhow!("invalid TETHER_LISTEN_ADDR: {e}"))?;

        Ok(Self {
            listen_addr,
            connect_token: env_trimmed("TETHER_DEVICE_CONNECT_TOKEN"),
            request_timeout: parse_ms(
                env_trimmed("TETHER_REQUEST_TIMEOUT_MS"),
                30_000,
                1000,
                10 * 60_000,
            ),
            reconnect_grace: parse_ms(env_trimmed("TETHER_RECONNECT_GRACE_MS"), 2000, 0, 60_000),
            hello_timeout: parse_ms(env_trimmed("TETHER_HELLO_TIMEOUT_MS"), 10_000, 100, 60_000),
            applications_file: env_trimmed("TETHER_APPLICATIONS_FILE").map(PathBuf::from),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ms_clamps_and_defaults() {
        assert_eq!(parse_ms(None, 30_000, 1000, 60_000), Duration::from_secs(30));
        assert_eq!(
            parse_ms(Some("garbage".to_string()), 500, 0, 1000),
            Duration::from_millis(500)
        );
        assert_eq!(
            parse_ms(Some("5".to_string()), 30_000, 1000, 60_000),
            Duration::from_secs(1)
        );
        assert_eq!(
            parse_ms(Some(" 999999999 ".to_string()), 30_000, 1000, 60_000),
            Duration::from_secs(60)
        );
    }
}
