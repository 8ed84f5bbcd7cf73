use std::{
    fmt::Write,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::supervisor::SupervisorStats;

/// Agent counters, rendered in the Prometheus text format.
#[derive(Debug, Default)]
pub struct AgentMetrics {
    pub requests_total: AtomicU64,
    pub request_errors_total: AtomicU64,
    pub bundles_applied_total: AtomicU64,
    pub tunnel_connects_total: AtomicU64,
    pub ssh_sessions: AtomicU64,
}

impl AgentMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(counter: &AtomicU64) {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)))
            .ok();
    }

    pub fn render_prometheus(&self, supervisor: SupervisorStats) -> String {
        let mut out = String::new();
        let counters = [
            ("tether_agent_requests_total", &self.requests_total),
            ("tether_agent_request_errors_total", &self.request_errors_total),
            ("tether_agent_bundles_applied_total", &self.bundles_applied_total),
            ("tether_agent_tunnel_connects_total", &self.tunnel_connects_total),
        ];
        for (name, value) in counters {
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {}", value.load(Ordering::Relaxed));
        }

        let gauges = [
            (
                "tether_agent_ssh_sessions",
                self.ssh_sessions.load(Ordering::Relaxed),
            ),
            ("tether_agent_applications", supervisor.applications as u64),
            ("tether_agent_services", supervisor.services as u64),
            ("tether_agent_services_running", supervisor.running as u64),
        ];
        for (name, value) in gauges {
            let _ = writeln!(out, "# TYPE {name} gauge");
            let _ = writeln!(out, "{name} {value}");
        }
        out
    }
}
