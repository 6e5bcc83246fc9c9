//! Agent performance counters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub messages_processed: u64,
    pub messages_failed: u64,
    /// Running mean over successful messages, in seconds
    pub average_response_time: f64,
    pub last_activity: Option<DateTime<Utc>>,
    pub uptime_seconds: f64,
    pub memory_usage_mb: f64,
}

impl AgentMetrics {
    /// Count a successful message and fold its latency into the mean
    pub fn record_success(&mut self, elapsed: Duration) {
        let total = self.average_response_time * self.messages_processed as f64;
        self.messages_processed += 1;
        self.average_response_time =
            (total + elapsed.as_secs_f64()) / self.messages_processed as f64;
        self.last_activity = Some(Utc::now());
    }

    pub fn record_failure(&mut self) {
        self.messages_failed += 1;
        self.last_activity = Some(Utc::now());
    }
}

/// Resident set size of this process in MiB, 0 where unavailable
pub async fn sample_memory_mb() -> f64 {
    let Ok(status) = tokio::fs::read_to_string("/proc/self/status").await else {
        return 0.0;
    };
    parse_vm_rss_kb(&status).map_or(0.0, |kb| kb as f64 / 1024.0)
}

fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_average() {
        let mut metrics = AgentMetrics::default();
        metrics.record_success(Duration::from_millis(100));
        metrics.record_success(Duration::from_millis(300));
        assert_eq!(metrics.messages_processed, 2);
        assert!((metrics.average_response_time - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_failure_does_not_touch_average() {
        let mut metrics = AgentMetrics::default();
        metrics.record_success(Duration::from_millis(100));
        metrics.record_failure();
        assert_eq!(metrics.messages_processed, 1);
        assert_eq!(metrics.messages_failed, 1);
        assert!((metrics.average_response_time - 0.1).abs() < 1e-9);
        assert!(metrics.last_activity.is_some());
    }

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\taugur\nVmPeak:\t  9000 kB\nVmRSS:\t  2048 kB\n";
        assert_eq!(parse_vm_rss_kb(status), Some(2048));
        assert_eq!(parse_vm_rss_kb("Name: x\n"), None);
    }
}
