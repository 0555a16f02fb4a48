//! Entry types for the three logical caches and the on-log record envelope
//! that ties them together.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use polybuild_wire::{ArtifactId, peer::ActionId};

use crate::{
    fingerprint::{Fingerprint, QuickFingerprint},
    graph::TargetId,
};

/// Whole-target skip decision.
///
/// `quick` is compared first (step 1 of the incremental decision
/// procedure); `fingerprint` is the authoritative content hash, compared
/// only when `quick` changed.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct CacheEntry {
    pub target: TargetId,
    pub quick: QuickFingerprint,
    pub fingerprint: Fingerprint,
    pub outputs: Vec<ArtifactId>,
    pub last_access: i64,
}

/// Fine-grained (per-file compile, per-test run) skip decision.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct ActionCacheEntry {
    pub action: ActionId,
    pub fingerprint: Fingerprint,
    pub artifacts: Vec<ArtifactId>,
    pub last_access: i64,
}

/// One record appended to the durable log. Each variant carries the
/// fully-qualified key, since the log is the source of truth and the
/// rusqlite index is rebuilt from it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Record {
    Target(TargetId, CacheEntry),
    Action(ActionId, ActionCacheEntry),
    Dependency(String, BTreeSet<String>),
    TargetTombstone(TargetId),
    ActionTombstone(ActionId),
}
