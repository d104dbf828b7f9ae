//! Per-stage latency measurement for turn diagnostics.

use std::collections::HashMap;
use std::future::Future;
use std::time::Instant;

/// Individual timing measurement for a named stage.
#[derive(Debug, Clone)]
pub struct StageMeasurement {
    pub stage: String,
    pub duration_ms: f64,
}

/// Collects stage-level latency metrics for one turn.
#[derive(Debug, Default)]
pub struct LatencyProbe {
    measurements: Vec<StageMeasurement>,
}

impl LatencyProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time a future and record it under the stage name.
    pub async fn track<T, F>(&mut self, stage: &str, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let start = Instant::now();
        let output = fut.await;
        self.record(stage, start.elapsed().as_secs_f64() * 1000.0);
        output
    }

    /// Record an externally measured duration.
    pub fn record(&mut self, stage: &str, duration_ms: f64) {
        self.measurements.push(StageMeasurement {
            stage: stage.to_string(),
            duration_ms,
        });
    }

    /// Return and clear collected measurements.
    pub fn flush(&mut self) -> Vec<StageMeasurement> {
        std::mem::take(&mut self.measurements)
    }

    /// Total duration per stage.
    pub fn summary(&self) -> HashMap<String, f64> {
        let mut totals: HashMap<String, f64> = HashMap::new();
        for m in &self.measurements {
            *totals.entry(m.stage.clone()).or_insert(0.0) += m.duration_ms;
        }
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_track_records_elapsed() {
        let mut probe = LatencyProbe::new();

        let value = probe
            .track("stage_a", async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                42
            })
            .await;

        assert_eq!(value, 42);
        let summary = probe.summary();
        assert!(summary["stage_a"] >= 10.0);
    }

    #[tokio::test]
    async fn test_summary_sums_repeated_stages() {
        let mut probe = LatencyProbe::new();
        probe.record("tooling", 5.0);
        probe.record("tooling", 7.0);
        probe.record("generation", 20.0);

        let summary = probe.summary();
        assert_eq!(summary["tooling"], 12.0);
        assert_eq!(summary["generation"], 20.0);
    }

    #[test]
    fn test_flush_clears() {
        let mut probe = LatencyProbe::new();
        probe.record("a", 1.0);

        let flushed = probe.flush();
        assert_eq!(flushed.len(), 1);
        assert!(probe.summary().is_empty());
    }
}
