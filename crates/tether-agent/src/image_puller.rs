use std::{
    collections::BTreeMap,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use tether_models::PullEvent;

use crate::engine::PullProgressSink;

/// Latest event per layer for one in-flight image pull.
#[derive(Debug, Default)]
pub struct PullTracker {
    image: String,
    layers: Mutex<BTreeMap<String, PullEvent>>,
    finished: AtomicBool,
}

impl PullTracker {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            layers: Mutex::new(BTreeMap::new()),
            finished: AtomicBool::new(false),
        }
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    /// Per-layer snapshot, or `None` once the pull has finished.
    pub fn progress(&self) -> Option<BTreeMap<String, PullEvent>> {
        if self.finished.load(Ordering::SeqCst) {
            return None;
        }
        Some(self.snapshot())
    }

    pub fn snapshot(&self) -> BTreeMap<String, PullEvent> {
        self.layers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl PullProgressSink for PullTracker {
    fn on_event(&self, event: PullEvent) {
        // Status lines without a layer id ("Digest: ...", "Status: ...") carry no progress.
        if event.id.trim().is_empty() {
            return;
        }
        self.layers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(event.id.clone(), event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, status: &str, current: i64) -> PullEvent {
        PullEvent {
            id: id.to_string(),
            status: status.to_string(),
            progress: String::new(),
            current: Some(current),
            total: Some(100),
        }
    }

    #[test]
    fn keeps_latest_event_per_layer() {
        let tracker = PullTracker::new("shop/web:3");
        tracker.on_event(event("a", "Downloading", 10));
        tracker.on_event(event("b", "Waiting", 0));
        tracker.on_event(event("a", "Downloading", 60));
        tracker.on_event(event("", "Digest: sha256:abc", 0));

        let snap = tracker.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap["a"].current, Some(60));
        assert_eq!(snap["b"].status, "Waiting");
        assert_eq!(tracker.image(), "shop/web:3");
    }

    #[test]
    fn finished_pull_reports_no_progress() {
        let tracker = PullTracker::new("shop/web:3");
        tracker.on_event(event("a", "Downloading", 10));
        assert!(tracker.progress().is_some());
        tracker.finish();
        assert!(tracker.progress().is_none());
    }
}
