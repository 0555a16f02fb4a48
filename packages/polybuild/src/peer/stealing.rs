//! Work-stealing engine: victim selection, retry/backoff, and metrics.
//!
//! The engine owns policy (which victim, how many retries) but not
//! transport — callers supply an async `send` closure that actually talks
//! to a victim's ingress server, and an optional `try_steal_local` hook on
//! the victim side that decides how much local work to give away.

use std::{
    future::Future,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use bon::Builder;
use color_eyre::{Result, eyre::bail};
use polybuild_wire::peer::{ActionRequest, StealRequest, StealResponse, StealStrategy, WorkerId};
use rand::Rng;

use super::peer_registry::PeerSnapshot;

const DEFAULT_STEAL_TIMEOUT_SECS: u64 = 2;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 100;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_MIN_LOCAL_QUEUE: u32 = 1;
const DEFAULT_STEAL_THRESHOLD: u32 = 1;
/// Adaptive switches from Random to MostLoaded once the recent success rate
/// falls below this.
const ADAPTIVE_SUCCESS_FLOOR: f64 = 0.3;

#[derive(Copy, Clone, Debug, Builder)]
#[non_exhaustive]
pub struct StealConfig {
    #[builder(default = StealStrategy::Adaptive)]
    pub strategy: StealStrategy,
    #[builder(default = Duration::from_secs(DEFAULT_STEAL_TIMEOUT_SECS))]
    pub steal_timeout: Duration,
    #[builder(default = Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS))]
    pub retry_backoff_base: Duration,
    #[builder(default = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,
    /// A worker only attempts to steal when its own queue depth is below
    /// this.
    #[builder(default = DEFAULT_MIN_LOCAL_QUEUE)]
    pub min_local_queue: u32,
    /// A peer is only considered a victim candidate when its queue depth is
    /// at least this.
    #[builder(default = DEFAULT_STEAL_THRESHOLD)]
    pub steal_threshold: u32,
}

impl Default for StealConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Atomic counters for one worker's steal attempts.
#[derive(Default)]
pub struct StealMetrics {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    network_errors: AtomicU64,
}

impl StealMetrics {
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn success_rate(&self) -> f64 {
        let attempts = self.attempts();
        if attempts == 0 {
            0.0
        } else {
            self.successes() as f64 / attempts as f64
        }
    }
}

pub struct StealEngine {
    config: StealConfig,
    metrics: StealMetrics,
}

impl StealEngine {
    pub fn new(config: StealConfig) -> Self {
        Self {
            config,
            metrics: StealMetrics::default(),
        }
    }

    pub fn metrics(&self) -> &StealMetrics {
        &self.metrics
    }

    /// Whether this worker's own queue is low enough to justify a steal
    /// attempt.
    pub fn should_steal(&self, local_queue_depth: u32) -> bool {
        local_queue_depth < self.config.min_local_queue
    }

    /// Minimum queue depth a peer must report to be considered a victim
    /// candidate, per the configured [`StealConfig::steal_threshold`].
    pub fn steal_threshold(&self) -> u32 {
        self.config.steal_threshold
    }

    /// Attempt to steal one unit of work on behalf of `thief`, trying up to
    /// `max_retries + 1` victims. `send` performs the actual network round
    /// trip to a candidate victim.
    pub async fn try_steal<F, Fut>(
        &self,
        thief: &WorkerId,
        candidates: Vec<PeerSnapshot>,
        send: F,
    ) -> Result<Option<ActionRequest>>
    where
        F: Fn(PeerSnapshot, StealRequest) -> Fut,
        Fut: Future<Output = Result<StealResponse>>,
    {
        let mut pool = candidates;
        if pool.is_empty() {
            self.metrics.failures.fetch_add(1, Ordering::Relaxed);
            bail!("no alive peers with work to steal from");
        }

        let mut backoff = self.config.retry_backoff_base;

        for _ in 0..=self.config.max_retries {
            let Some(index) = self.choose_victim_index(&pool) else {
                break;
            };
            let victim = pool.remove(index);

            self.metrics.attempts.fetch_add(1, Ordering::Relaxed);
            let request = StealRequest::builder()
                .thief(thief.clone())
                .victim(victim.worker.clone())
                .deadline(self.config.steal_timeout)
                .build();

            match tokio::time::timeout(self.config.steal_timeout, send(victim.clone(), request)).await {
                Ok(Ok(response)) if response.has_work => {
                    self.metrics.successes.fetch_add(1, Ordering::Relaxed);
                    return Ok(response.action);
                }
                Ok(Ok(_)) => {
                    self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(_)) => {
                    self.metrics.network_errors.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    self.metrics.timeouts.fetch_add(1, Ordering::Relaxed);
                }
            }

            if pool.is_empty() {
                break;
            }
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }

        Ok(None)
    }

    fn choose_victim_index(&self, pool: &[PeerSnapshot]) -> Option<usize> {
        if pool.is_empty() {
            return None;
        }
        let strategy = self.resolved_strategy();
        match strategy {
            StealStrategy::Random => Some(rand::thread_rng().gen_range(0..pool.len())),
            StealStrategy::LeastLoaded => pool
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| a.load().total_cmp(&b.load()))
                .map(|(i, _)| i),
            StealStrategy::MostLoaded => pool
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.load().total_cmp(&b.load()))
                .map(|(i, _)| i),
            StealStrategy::PowerOfTwo => {
                if pool.len() == 1 {
                    Some(0)
                } else {
                    let mut rng = rand::thread_rng();
                    let i = rng.gen_range(0..pool.len());
                    let mut j = rng.gen_range(0..pool.len());
                    if j == i {
                        j = (j + 1) % pool.len();
                    }
                    if pool[i].queue_depth >= pool[j].queue_depth {
                        Some(i)
                    } else {
                        Some(j)
                    }
                }
            }
            StealStrategy::Adaptive => unreachable!("resolved_strategy never returns Adaptive"),
        }
    }

    /// `Adaptive` resolves to `Random` while recent success rate holds, and
    /// to `MostLoaded` once it falls below [`ADAPTIVE_SUCCESS_FLOOR`].
    fn resolved_strategy(&self) -> StealStrategy {
        match self.config.strategy {
            StealStrategy::Adaptive => {
                if self.metrics.attempts() > 0 && self.metrics.success_rate() < ADAPTIVE_SUCCESS_FLOOR {
                    StealStrategy::MostLoaded
                } else {
                    StealStrategy::Random
                }
            }
            other => other,
        }
    }
}

/// Victim-side handling of an incoming [`StealRequest`]: ask the caller for
/// up to one locally schedulable action and wrap the answer. The engine
/// never decides how much local work to give away; that policy lives in
/// `try_steal_local`.
pub fn handle_steal_request(try_steal_local: impl FnOnce() -> Option<ActionRequest>) -> StealResponse {
    match try_steal_local() {
        Some(action) => StealResponse::with_action(action),
        None => StealResponse::empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polybuild_wire::peer::PeerAddress;

    fn snapshot(worker: &str, queue_depth: u32) -> PeerSnapshot {
        PeerSnapshot {
            worker: WorkerId::new(worker),
            address: PeerAddress::builder()
                .worker(WorkerId::new(worker))
                .host("127.0.0.1".to_string())
                .port(9000)
                .build(),
            queue_depth,
            cpu_usage: 0.0,
            mem_usage: 0.0,
        }
    }

    #[tokio::test]
    async fn try_steal_fails_with_no_candidates() {
        let engine = StealEngine::new(StealConfig::default());
        let result = engine
            .try_steal(&WorkerId::new("thief"), Vec::new(), |_, _| async {
                Ok(StealResponse::empty())
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn try_steal_succeeds_and_records_metrics() {
        let config = StealConfig::builder().strategy(StealStrategy::Random).build();
        let engine = StealEngine::new(config);
        let action = ActionRequest::builder()
            .action_id(polybuild_wire::peer::ActionId::new("a1"))
            .command(vec!["true".to_string()])
            .timeout(Duration::from_secs(1))
            .build();

        let result = engine
            .try_steal(&WorkerId::new("thief"), vec![snapshot("victim", 5)], {
                let action = action.clone();
                move |_, _| {
                    let action = action.clone();
                    async move { Ok(StealResponse::with_action(action)) }
                }
            })
            .await
            .unwrap();

        assert!(result.is_some());
        assert_eq!(engine.metrics().attempts(), 1);
        assert_eq!(engine.metrics().successes(), 1);
        assert_eq!(engine.metrics().success_rate(), 1.0);
    }

    #[tokio::test]
    async fn try_steal_exhausts_retries_on_repeated_misses() {
        let config = StealConfig::builder()
            .strategy(StealStrategy::Random)
            .max_retries(2)
            .retry_backoff_base(Duration::from_millis(1))
            .build();
        let engine = StealEngine::new(config);

        let result = engine
            .try_steal(
                &WorkerId::new("thief"),
                vec![snapshot("a", 1), snapshot("b", 1), snapshot("c", 1)],
                |_, _| async { Ok(StealResponse::empty()) },
            )
            .await
            .unwrap();

        assert!(result.is_none());
        assert_eq!(engine.metrics().attempts(), 3);
    }

    #[test]
    fn adaptive_falls_back_to_most_loaded_under_low_success_rate() {
        let config = StealConfig::builder().strategy(StealStrategy::Adaptive).build();
        let engine = StealEngine::new(config);
        engine.metrics.attempts.store(10, Ordering::Relaxed);
        engine.metrics.successes.store(1, Ordering::Relaxed);
        assert_eq!(engine.resolved_strategy(), StealStrategy::MostLoaded);
    }

    #[test]
    fn handle_steal_request_wraps_hook_result() {
        assert!(!handle_steal_request(|| None).has_work);
        let action = ActionRequest::builder()
            .action_id(polybuild_wire::peer::ActionId::new("a1"))
            .command(vec!["true".to_string()])
            .timeout(Duration::from_secs(1))
            .build();
        assert!(handle_steal_request(|| Some(action)).has_work);
    }
}
