mod types;

pub use types::{CycleMetrics, MetricsSnapshot, SystemMetrics};

use std::collections::VecDeque;
use std::sync::Arc;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::Mutex;

const MAX_RECENT_CYCLES: usize = 20;

/// Rolling per-cycle timings plus process CPU and memory sampling.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

struct MetricsState {
    recent_cycles: VecDeque<CycleMetrics>,
    cycle_count: u64,
    failure_count: u64,
    system: System,
    pid: Pid,
}

impl MetricsState {
    fn sample(&mut self) -> SystemMetrics {
        let pid = self.pid;
        self.system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
        match self.system.process(pid) {
            Some(process) => SystemMetrics {
                cpu_percent: process.cpu_usage(),
                memory_mb: process.memory() as f64 / 1024.0 / 1024.0,
            },
            None => SystemMetrics::default(),
        }
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        let pid = Pid::from_u32(std::process::id());

        // CPU usage is a delta between refreshes; take the first one now
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        Self {
            inner: Arc::new(Mutex::new(MetricsState {
                recent_cycles: VecDeque::with_capacity(MAX_RECENT_CYCLES),
                cycle_count: 0,
                failure_count: 0,
                system,
                pid,
            })),
        }
    }

    pub async fn sample_system_metrics(&self) -> SystemMetrics {
        self.inner.lock().await.sample()
    }

    pub async fn record_cycle(&self, metrics: CycleMetrics) {
        let mut state = self.inner.lock().await;

        state.cycle_count += 1;
        if metrics.failed {
            state.failure_count += 1;
        }

        state.recent_cycles.push_back(metrics);
        if state.recent_cycles.len() > MAX_RECENT_CYCLES {
            state.recent_cycles.pop_front();
        }
    }

    pub async fn get_snapshot(&self) -> MetricsSnapshot {
        let mut state = self.inner.lock().await;
        let system = state.sample();

        let average_cycle_ms = (!state.recent_cycles.is_empty()).then(|| {
            state.recent_cycles.iter().map(|c| c.total_ms as f64).sum::<f64>()
                / state.recent_cycles.len() as f64
        });

        MetricsSnapshot {
            system,
            recent_cycles: state.recent_cycles.iter().cloned().collect(),
            cycle_count: state.cycle_count,
            failure_count: state.failure_count,
            average_cycle_ms,
        }
    }

    pub async fn reset(&self) {
        let mut state = self.inner.lock().await;
        state.recent_cycles.clear();
        state.cycle_count = 0;
        state.failure_count = 0;
        state.sample();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
