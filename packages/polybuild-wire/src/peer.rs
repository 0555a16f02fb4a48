//! Wire envelopes for peer-to-peer work stealing and worker registration.
//!
//! These types carry no business logic: they are the JSON shapes exchanged
//! between a worker's ingress server, its peers, and an optional coordinator.
//! Selection strategy, staleness thresholds, and retry policy all live in
//! `polybuild::peer`; this module only fixes the shape on the wire.

use std::{collections::BTreeMap, fmt, time::Duration};

use bon::Builder;
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::ArtifactId;

/// The current wire protocol version.
///
/// Bumped whenever an envelope's shape changes in a way that breaks older
/// peers. No cross-version compatibility is required or attempted: a peer
/// receiving an envelope with a version it doesn't recognize simply rejects
/// it.
pub const PROTOCOL_VERSION: u32 = 1;

/// Identifies a worker process in the peer mesh.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, Serialize, Deserialize)]
#[display("{_0}")]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<S: Into<String>> From<S> for WorkerId {
    fn from(s: S) -> Self {
        Self::new(s)
    }
}

/// Identifies a single scheduled unit of work (a build action).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, Serialize, Deserialize)]
#[display("{_0}")]
pub struct ActionId(String);

impl ActionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<S: Into<String>> From<S> for ActionId {
    fn from(s: S) -> Self {
        Self::new(s)
    }
}

/// Lifecycle state a worker reports in its heartbeat.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Executing,
    Stealing,
    Uploading,
    Failed,
    Draining,
}

/// Point-in-time load metrics attached to a heartbeat.
#[derive(Copy, Clone, PartialEq, Debug, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct WorkerMetrics {
    pub queue_depth: u32,
    pub cpu_usage: f32,
    pub mem_usage: f32,
}

impl WorkerMetrics {
    /// The weighted load score used for victim/target selection:
    /// `0.6 * queue_depth + 0.4 * cpu_usage`.
    pub fn load(&self) -> f32 {
        0.6 * self.queue_depth as f32 + 0.4 * self.cpu_usage
    }
}

/// Periodic liveness and load report sent by a worker to its peers and,
/// if configured, to a coordinator.
///
/// `seq` is a monotonic per-worker sequence number; receivers discard stale
/// or duplicate heartbeats (a `seq` not strictly greater than the last one
/// seen from that worker).
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct HeartBeat {
    pub worker: WorkerId,
    pub seq: u64,
    pub state: WorkerState,
    pub metrics: WorkerMetrics,
    pub t: i64,
}

/// A thief's request to steal a unit of work from a victim.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct StealRequest {
    pub thief: WorkerId,
    pub victim: WorkerId,
    #[builder(default = Duration::from_secs(2))]
    pub deadline: Duration,
}

/// A victim's response to a [`StealRequest`].
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct StealResponse {
    pub has_work: bool,
    pub action: Option<ActionRequest>,
}

impl StealResponse {
    pub fn empty() -> Self {
        Self {
            has_work: false,
            action: None,
        }
    }

    pub fn with_action(action: ActionRequest) -> Self {
        Self {
            has_work: true,
            action: Some(action),
        }
    }
}

/// A unit of work dispatched to a worker, either locally scheduled or stolen.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct ActionRequest {
    pub action_id: ActionId,
    pub command: Vec<String>,
    #[builder(default)]
    pub env: BTreeMap<String, String>,
    #[builder(default)]
    pub inputs: Vec<ArtifactId>,
    #[builder(default)]
    pub outputs: Vec<String>,
    #[builder(default)]
    pub capabilities: Vec<String>,
    #[builder(default)]
    pub priority: i32,
    pub timeout: Duration,
}

/// Outcome of executing an [`ActionRequest`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Failure,
    Timeout,
    Cancelled,
    Error,
}

/// Result reported back for a completed [`ActionRequest`].
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct ActionResult {
    pub action_id: ActionId,
    pub status: ActionStatus,
    #[builder(default)]
    pub outputs: Vec<ArtifactId>,
    #[builder(default)]
    pub stderr: String,
}

/// Work-stealing victim/target selection strategy.
///
/// Lives on the wire only insofar as a coordinator or worker may want to
/// report its configured strategy (e.g. in a status endpoint); selection
/// itself runs locally.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StealStrategy {
    Random,
    LeastLoaded,
    MostLoaded,
    PowerOfTwo,
    Adaptive,
}

impl fmt::Display for StealStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Random => write!(f, "random"),
            Self::LeastLoaded => write!(f, "least-loaded"),
            Self::MostLoaded => write!(f, "most-loaded"),
            Self::PowerOfTwo => write!(f, "power-of-two"),
            Self::Adaptive => write!(f, "adaptive"),
        }
    }
}

/// Per-envelope compression indicator.
///
/// Each peer envelope is tagged with the compression applied to any body
/// bytes carried alongside it, so a receiver can decompress without
/// negotiation.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    None,
    Zstd,
    Lz4,
}

/// Information a [`HeartBeat`] sender advertises about itself so peers can
/// reach its ingress server directly.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct PeerAddress {
    pub worker: WorkerId,
    pub host: String,
    pub port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_metrics_load_weighting() {
        let metrics = WorkerMetrics::builder()
            .queue_depth(10)
            .cpu_usage(50.0)
            .mem_usage(30.0)
            .build();
        assert_eq!(metrics.load(), 0.6 * 10.0 + 0.4 * 50.0);
    }

    #[test]
    fn steal_response_shapes() {
        assert!(!StealResponse::empty().has_work);
        let action = ActionRequest::builder()
            .action_id(ActionId::new("a1"))
            .command(vec!["true".into()])
            .timeout(Duration::from_secs(1))
            .build();
        let resp = StealResponse::with_action(action);
        assert!(resp.has_work);
        assert!(resp.action.is_some());
    }

    #[test]
    fn heartbeat_roundtrips_json() {
        let hb = HeartBeat::builder()
            .worker(WorkerId::new("w1"))
            .seq(7)
            .state(WorkerState::Idle)
            .metrics(
                WorkerMetrics::builder()
                    .queue_depth(0)
                    .cpu_usage(0.0)
                    .mem_usage(0.0)
                    .build(),
            )
            .t(12345)
            .build();
        let json = serde_json::to_string(&hb).unwrap();
        let parsed: HeartBeat = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.seq, 7);
    }
}
