use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicI64, Ordering},
    },
};

pub const CURRENT_SSH_COUNT_NAME: &str = "internal.current_ssh_connection_count";

#[derive(Debug, Default)]
struct GaugeInner {
    total: AtomicI64,
    per_project: Mutex<HashMap<String, i64>>,
}

/// Live interactive relays, overall and per project.
#[derive(Debug, Clone, Default)]
pub struct SessionGauge {
    inner: Arc<GaugeInner>,
}

impl SessionGauge {
    /// Counts a relay until the returned guard drops.
    pub fn start(&self, project: &str) -> SessionGuard {
        let total = self.inner.total.fetch_add(1, Ordering::SeqCst) + 1;
        let for_project = self.adjust(project, 1);
        tracing::info!(
            metric = CURRENT_SSH_COUNT_NAME,
            project,
            value = total,
            project_value = for_project,
            "ssh relay started"
        );
        SessionGuard {
            gauge: self.clone(),
            project: project.to_string(),
        }
    }

    pub fn current(&self) -> i64 {
        self.inner.total.load(Ordering::SeqCst)
    }

    pub fn current_for(&self, project: &str) -> i64 {
        self.inner
            .per_project
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(project)
            .copied()
            .unwrap_or(0)
    }

    fn adjust(&self, project: &str, delta: i64) -> i64 {
        let mut map = self
            .inner
            .per_project
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let entry = map.entry(project.to_string()).or_insert(0);
        *entry += delta;
        let value = *entry;
        if value <= 0 {
            map.remove(project);
        }
        value
    }
}

pub struct SessionGuard {
    gauge: SessionGauge,
    project: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let total = self.gauge.inner.total.fetch_sub(1, Ordering::SeqCst) - 1;
        let for_project = self.gauge.adjust(&self.project, -1);
        tracing::info!(
            metric = CURRENT_SSH_COUNT_NAME,
            project = %self.project,
            value = total,
            project_value = for_project,
            "ssh relay ended"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_track_per_project_counts() {
        let gauge = SessionGauge::default();
        let a1 = gauge.start("a");
        let a2 = gauge.start("a");
        let b = gauge.start("b");

        assert_eq!(gauge.current(), 3);
        assert_eq!(gauge.current_for("a"), 2);
        assert_eq!(gauge.current_for("b"), 1);

        drop(a1);
        drop(b);
        assert_eq!(gauge.current(), 1);
        assert_eq!(gauge.current_for("a"), 1);
        assert_eq!(gauge.current_for("b"), 0);

        drop(a2);
        assert_eq!(gauge.current(), 0);
    }
}
