//! Worker-side view of its peers: address, last-seen time, and load, kept
//! in atomics so steal-victim selection can read without taking a lock.

use std::{
    sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering},
    time::Duration,
};

use dashmap::DashMap;
use polybuild_wire::peer::{PeerAddress, WorkerId, WorkerMetrics};

struct PeerEntry {
    address: PeerAddress,
    last_seen: AtomicI64,
    queue_depth: AtomicU32,
    cpu_usage_bits: AtomicU32,
    mem_usage_bits: AtomicU32,
    alive: AtomicBool,
}

/// A point-in-time read of one peer, used by the work-stealing engine to
/// choose a victim without holding any lock.
#[derive(Clone, Debug)]
pub struct PeerSnapshot {
    pub worker: WorkerId,
    pub address: PeerAddress,
    pub queue_depth: u32,
    pub cpu_usage: f32,
    pub mem_usage: f32,
}

impl PeerSnapshot {
    pub fn load(&self) -> f32 {
        0.6 * self.queue_depth as f32 + 0.4 * self.cpu_usage
    }
}

/// A worker's view of its peer mesh. Registering self is a no-op; marking a
/// peer dead is reversible on its next metrics update.
pub struct PeerRegistry {
    self_id: WorkerId,
    peers: DashMap<WorkerId, PeerEntry>,
    stale_threshold: Duration,
}

impl PeerRegistry {
    pub fn new(self_id: WorkerId, stale_threshold: Duration) -> Self {
        Self {
            self_id,
            peers: DashMap::new(),
            stale_threshold,
        }
    }

    /// Register a peer's address if not already known. A no-op for `self`.
    pub fn register(&self, address: PeerAddress, now: i64) {
        if address.worker == self.self_id {
            return;
        }
        self.peers.entry(address.worker.clone()).or_insert_with(|| PeerEntry {
            address,
            last_seen: AtomicI64::new(now),
            queue_depth: AtomicU32::new(0),
            cpu_usage_bits: AtomicU32::new(0f32.to_bits()),
            mem_usage_bits: AtomicU32::new(0f32.to_bits()),
            alive: AtomicBool::new(true),
        });
    }

    /// Apply a fresh heartbeat's metrics, reviving the peer if it had been
    /// marked dead.
    pub fn update_metrics(&self, worker: &WorkerId, metrics: &WorkerMetrics, now: i64) {
        if worker == &self.self_id {
            return;
        }
        if let Some(entry) = self.peers.get(worker) {
            entry.last_seen.store(now, Ordering::Relaxed);
            entry.queue_depth.store(metrics.queue_depth, Ordering::Relaxed);
            entry
                .cpu_usage_bits
                .store(metrics.cpu_usage.to_bits(), Ordering::Relaxed);
            entry
                .mem_usage_bits
                .store(metrics.mem_usage.to_bits(), Ordering::Relaxed);
            entry.alive.store(true, Ordering::Relaxed);
        }
    }

    pub fn mark_dead(&self, worker: &WorkerId) {
        if let Some(entry) = self.peers.get(worker) {
            entry.alive.store(false, Ordering::Relaxed);
        }
    }

    pub fn is_alive(&self, worker: &WorkerId) -> bool {
        self.peers
            .get(worker)
            .map(|e| e.alive.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Drop peers whose last heartbeat is older than `stale_threshold`.
    pub fn prune_stale(&self, now: i64) {
        self.peers.retain(|_, entry| {
            now - entry.last_seen.load(Ordering::Relaxed) <= self.stale_threshold.as_secs() as i64
        });
    }

    /// Snapshot every alive peer whose queue depth meets `min_queue_depth`
    /// (the pool a thief may steal from).
    pub fn alive_with_work(&self, min_queue_depth: u32) -> Vec<PeerSnapshot> {
        self.peers
            .iter()
            .filter(|entry| entry.alive.load(Ordering::Relaxed))
            .filter(|entry| entry.queue_depth.load(Ordering::Relaxed) >= min_queue_depth)
            .map(|entry| PeerSnapshot {
                worker: entry.key().clone(),
                address: entry.address.clone(),
                queue_depth: entry.queue_depth.load(Ordering::Relaxed),
                cpu_usage: f32::from_bits(entry.cpu_usage_bits.load(Ordering::Relaxed)),
                mem_usage: f32::from_bits(entry.mem_usage_bits.load(Ordering::Relaxed)),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(worker: &str) -> PeerAddress {
        PeerAddress::builder()
            .worker(WorkerId::new(worker))
            .host("127.0.0.1".to_string())
            .port(9000)
            .build()
    }

    #[test]
    fn registering_self_is_a_no_op() {
        let registry = PeerRegistry::new(WorkerId::new("self"), Duration::from_secs(30));
        registry.register(addr("self"), 0);
        assert!(registry.alive_with_work(0).is_empty());
    }

    #[test]
    fn marking_dead_is_reversible_on_metrics_update() {
        let registry = PeerRegistry::new(WorkerId::new("self"), Duration::from_secs(30));
        let peer = WorkerId::new("peer");
        registry.register(addr("peer"), 0);
        registry.update_metrics(
            &peer,
            &WorkerMetrics::builder()
                .queue_depth(3)
                .cpu_usage(10.0)
                .mem_usage(0.0)
                .build(),
            0,
        );
        registry.mark_dead(&peer);
        assert!(!registry.is_alive(&peer));

        registry.update_metrics(
            &peer,
            &WorkerMetrics::builder()
                .queue_depth(3)
                .cpu_usage(10.0)
                .mem_usage(0.0)
                .build(),
            1,
        );
        assert!(registry.is_alive(&peer));
    }

    #[test]
    fn prune_stale_removes_old_peers() {
        let registry = PeerRegistry::new(WorkerId::new("self"), Duration::from_secs(10));
        let peer = WorkerId::new("peer");
        registry.register(addr("peer"), 0);
        registry.update_metrics(
            &peer,
            &WorkerMetrics::builder()
                .queue_depth(1)
                .cpu_usage(0.0)
                .mem_usage(0.0)
                .build(),
            0,
        );
        registry.prune_stale(100);
        assert!(!registry.is_alive(&peer));
    }

    #[test]
    fn alive_with_work_filters_by_queue_depth() {
        let registry = PeerRegistry::new(WorkerId::new("self"), Duration::from_secs(30));
        let peer = WorkerId::new("peer");
        registry.register(addr("peer"), 0);
        registry.update_metrics(
            &peer,
            &WorkerMetrics::builder()
                .queue_depth(0)
                .cpu_usage(0.0)
                .mem_usage(0.0)
                .build(),
            0,
        );
        assert!(registry.alive_with_work(1).is_empty());
    }
}
