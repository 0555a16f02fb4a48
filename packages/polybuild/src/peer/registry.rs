//! Coordinator-side worker registry: tracks every worker's last heartbeat
//! and load, and selects a healthy worker for a new action.

use std::time::Duration;

use dashmap::DashMap;
use polybuild_wire::peer::{HeartBeat, WorkerId, WorkerState};

const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 5;

/// What the coordinator knows about one worker, as of its last heartbeat.
#[derive(Clone, Debug)]
pub struct WorkerInfo {
    pub last_heartbeat: i64,
    pub last_seq: u64,
    pub queue_depth: u32,
    pub cpu_usage: f32,
    pub mem_usage: f32,
    pub state: WorkerState,
}

impl WorkerInfo {
    /// `0.6 * queue_depth + 0.4 * cpu_usage`, mirroring
    /// `polybuild_wire::peer::WorkerMetrics::load`.
    pub fn load(&self) -> f32 {
        0.6 * self.queue_depth as f32 + 0.4 * self.cpu_usage
    }
}

/// `WorkerId -> WorkerInfo`, with heartbeat-timeout-based health.
pub struct Registry {
    workers: DashMap<WorkerId, WorkerInfo>,
    heartbeat_timeout: Duration,
}

impl Registry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            workers: DashMap::new(),
            heartbeat_timeout,
        }
    }

    /// Record a heartbeat, discarding it if its `seq` doesn't exceed the
    /// last one seen from that worker (stale or duplicate delivery).
    pub fn record_heartbeat(&self, heartbeat: &HeartBeat, now: i64) {
        let mut entry = self
            .workers
            .entry(heartbeat.worker.clone())
            .or_insert_with(|| WorkerInfo {
                last_heartbeat: now,
                last_seq: 0,
                queue_depth: 0,
                cpu_usage: 0.0,
                mem_usage: 0.0,
                state: heartbeat.state,
            });

        if heartbeat.seq != 0 && heartbeat.seq <= entry.last_seq {
            return;
        }

        entry.last_heartbeat = now;
        entry.last_seq = heartbeat.seq;
        entry.queue_depth = heartbeat.metrics.queue_depth;
        entry.cpu_usage = heartbeat.metrics.cpu_usage;
        entry.mem_usage = heartbeat.metrics.mem_usage;
        entry.state = heartbeat.state;
    }

    pub fn remove(&self, worker: &WorkerId) {
        self.workers.remove(worker);
    }

    pub fn is_healthy(&self, worker: &WorkerId, now: i64) -> bool {
        self.workers
            .get(worker)
            .map(|info| now - info.last_heartbeat <= self.heartbeat_timeout.as_secs() as i64)
            .unwrap_or(false)
    }

    /// Among healthy workers, the one minimizing `load`, tie-broken by
    /// worker id. `None` if no worker is currently healthy.
    pub fn select_worker(&self, now: i64) -> Option<WorkerId> {
        self.workers
            .iter()
            .filter(|entry| now - entry.last_heartbeat <= self.heartbeat_timeout.as_secs() as i64)
            .min_by(|a, b| {
                a.load()
                    .total_cmp(&b.load())
                    .then_with(|| a.key().cmp(b.key()))
            })
            .map(|entry| entry.key().clone())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polybuild_wire::peer::WorkerMetrics;

    fn heartbeat(worker: &str, seq: u64, queue_depth: u32, cpu_usage: f32) -> HeartBeat {
        HeartBeat::builder()
            .worker(WorkerId::new(worker))
            .seq(seq)
            .state(WorkerState::Idle)
            .metrics(
                WorkerMetrics::builder()
                    .queue_depth(queue_depth)
                    .cpu_usage(cpu_usage)
                    .mem_usage(0.0)
                    .build(),
            )
            .t(0)
            .build()
    }

    #[test]
    fn selects_least_loaded_healthy_worker() {
        let registry = Registry::new(Duration::from_secs(5));
        registry.record_heartbeat(&heartbeat("a", 1, 10, 50.0), 0);
        registry.record_heartbeat(&heartbeat("b", 1, 1, 10.0), 0);
        assert_eq!(registry.select_worker(0), Some(WorkerId::new("b")));
    }

    #[test]
    fn excludes_unhealthy_workers() {
        let registry = Registry::new(Duration::from_secs(5));
        registry.record_heartbeat(&heartbeat("a", 1, 1, 0.0), 0);
        assert_eq!(registry.select_worker(100), None);
    }

    #[test]
    fn discards_stale_sequence_numbers() {
        let registry = Registry::new(Duration::from_secs(5));
        registry.record_heartbeat(&heartbeat("a", 5, 1, 0.0), 0);
        registry.record_heartbeat(&heartbeat("a", 3, 99, 0.0), 1);
        assert_eq!(registry.workers.get(&WorkerId::new("a")).unwrap().queue_depth, 1);
    }

    #[test]
    fn tie_breaks_by_worker_id() {
        let registry = Registry::new(Duration::from_secs(5));
        registry.record_heartbeat(&heartbeat("b", 1, 1, 0.0), 0);
        registry.record_heartbeat(&heartbeat("a", 1, 1, 0.0), 0);
        assert_eq!(registry.select_worker(0), Some(WorkerId::new("a")));
    }
}
