use std::sync::Mutex;

use serde::Serialize;

/// Scan-wide counters shared by concurrently processed segments.
pub struct MetricsRecorder {
    inner: Mutex<MetricsSnapshot>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub segments: usize,
    pub candidates: usize,
    pub errors: usize,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MetricsSnapshot::default()),
        }
    }

    pub fn record_segment(&self, ncands: usize) {
        if let Ok(mut metrics) = self.inner.lock() {
            metrics.segments += 1;
            metrics.candidates += ncands;
        }
    }

    pub fn record_error(&self) {
        if let Ok(mut metrics) = self.inner.lock() {
            metrics.errors += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner
            .lock()
            .map(|metrics| *metrics)
            .unwrap_or_default()
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accumulate() {
        let metrics = MetricsRecorder::new();
        metrics.record_segment(3);
        metrics.record_segment(0);
        metrics.record_error();
        assert_eq!(
            metrics.snapshot(),
            MetricsSnapshot {
                segments: 2,
                candidates: 3,
                errors: 1,
            }
        );
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains("\"candidates\":3"));
    }
}
