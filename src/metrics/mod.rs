mod types;

pub use types::{MetricsSnapshot, SystemMetrics, TickMetrics};

use std::sync::Arc;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::Mutex;

const MAX_RECENT_TICKS: usize = 20;

/// Rolling window of per-tick timings plus process CPU/RSS.
pub struct TickMetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

struct MetricsState {
    recent_ticks: Vec<TickMetrics>,
    tick_count: u64,
    alert_count: u64,
    system: System,
    pid: Pid,
}

impl TickMetricsCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        let pid = Pid::from_u32(std::process::id());

        // Initial refresh to establish baseline for CPU calculation
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        Self {
            inner: Arc::new(Mutex::new(MetricsState {
                recent_ticks: Vec::with_capacity(MAX_RECENT_TICKS),
                tick_count: 0,
                alert_count: 0,
                system,
                pid,
            })),
        }
    }

    pub async fn record_tick(&self, metrics: TickMetrics) {
        let mut state = self.inner.lock().await;

        state.tick_count += 1;
        state.alert_count += metrics.num_alerts as u64;
        state.recent_ticks.push(metrics);

        if state.recent_ticks.len() > MAX_RECENT_TICKS {
            state.recent_ticks.remove(0);
        }
    }

    pub async fn get_snapshot(&self) -> MetricsSnapshot {
        let mut state = self.inner.lock().await;
        let pid = state.pid;
        state.system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        let system = if let Some(process) = state.system.process(pid) {
            SystemMetrics {
                cpu_percent: process.cpu_usage(),
                memory_mb: process.memory() as f64 / 1024.0 / 1024.0,
            }
        } else {
            SystemMetrics {
                cpu_percent: 0.0,
                memory_mb: 0.0,
            }
        };

        MetricsSnapshot {
            system,
            recent_ticks: state.recent_ticks.clone(),
            tick_count: state.tick_count,
            alert_count: state.alert_count,
        }
    }

    pub async fn reset(&self) {
        let mut state = self.inner.lock().await;
        let pid = state.pid;
        state.recent_ticks.clear();
        state.tick_count = 0;
        state.alert_count = 0;
        state.system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
    }
}

impl Default for TickMetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for TickMetricsCollector {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn tick(num_alerts: usize) -> TickMetrics {
        TickMetrics {
            timestamp: Utc::now(),
            num_bodies: 2,
            num_alerts,
            evaluate_ms: 1,
            total_ms: 2,
        }
    }

    #[tokio::test]
    async fn counters_accumulate_and_window_is_bounded() {
        let collector = TickMetricsCollector::new();
        for _ in 0..25 {
            collector.record_tick(tick(2)).await;
        }

        let snapshot = collector.get_snapshot().await;
        assert_eq!(snapshot.tick_count, 25);
        assert_eq!(snapshot.alert_count, 50);
        assert_eq!(snapshot.recent_ticks.len(), MAX_RECENT_TICKS);

        collector.reset().await;
        let cleared = collector.get_snapshot().await;
        assert_eq!(cleared.tick_count, 0);
        assert!(cleared.recent_ticks.is_empty());
    }
}
