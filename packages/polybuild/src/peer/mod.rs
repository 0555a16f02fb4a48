//! Peer coordination (Component H, library side): the coordinator-side
//! worker registry, a worker's view of its peer mesh, and the work-stealing
//! engine that ties them together. Wire shapes live in `polybuild-wire`;
//! this module holds the selection policy and local bookkeeping around them.

mod peer_registry;
mod registry;
mod stealing;

pub use peer_registry::{PeerRegistry, PeerSnapshot};
pub use registry::{Registry, WorkerInfo};
pub use stealing::{StealConfig, StealEngine, StealMetrics, handle_steal_request};
