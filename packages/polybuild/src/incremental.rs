//! Incremental build decision procedure (Component E).
//!
//! Pure decision logic: given a set of sources and the caches, decides
//! which are dirty and must be recompiled, threading through a `--why`
//! reason for each. Owns no IO beyond fingerprinting; the executor drives
//! it per wave.

use std::collections::{BTreeMap, BTreeSet};

use color_eyre::Result;
use polybuild_wire::peer::ActionId;

use crate::{
    cache::Cache,
    fingerprint::{self, Fingerprint, quick},
    graph::TargetId,
    path::AbsFilePath,
};

/// Which decision procedure to run.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Strategy {
    /// Ignore the cache entirely; compile every file. Used when the cache
    /// is cold, corrupt, or the caller forced a clean build.
    Full,
    /// The four-step decision procedure below.
    Incremental,
    /// `Incremental` once the source count reaches `threshold`, `Full`
    /// below it — fingerprinting overhead isn't worth it for tiny builds.
    Hybrid { threshold: usize },
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::Hybrid { threshold: 32 }
    }
}

impl Strategy {
    fn resolve_for(self, source_count: usize) -> ResolvedStrategy {
        match self {
            Strategy::Full => ResolvedStrategy::Full,
            Strategy::Incremental => ResolvedStrategy::Incremental,
            Strategy::Hybrid { threshold } => {
                if source_count >= threshold {
                    ResolvedStrategy::Incremental
                } else {
                    ResolvedStrategy::Full
                }
            }
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum ResolvedStrategy {
    Full,
    Incremental,
}

/// Why a source was (or wasn't) recompiled, for the `--why` diagnostic.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Reason {
    ForcedFull,
    QuickFingerprintChanged,
    FullFingerprintChanged,
    TransitivelyDirty { via: String },
    ActionCacheHit,
    Clean,
}

/// A single source's target plus its derived action id, as supplied by the
/// caller (the executor knows how to derive `ActionId`s per handler).
pub struct SourcePlan {
    pub path: String,
    pub target: TargetId,
    pub action: ActionId,
}

#[derive(Default)]
pub struct Decision {
    pub to_compile: Vec<String>,
    pub cached: Vec<String>,
    pub total: usize,
    pub reason_map: BTreeMap<String, Reason>,
}

/// Run the decision procedure over `sources`, given `changed_files` (a hint
/// from the caller — may be empty for a cold build) and the reverse
/// dependency-cache index for propagating dirtiness transitively.
pub async fn decide(
    strategy: Strategy,
    sources: &[SourcePlan],
    changed_files: &BTreeSet<String>,
    cache: &Cache,
) -> Result<Decision> {
    let resolved = strategy.resolve_for(sources.len());

    let mut decision = Decision {
        total: sources.len(),
        ..Default::default()
    };

    if resolved == ResolvedStrategy::Full {
        for source in sources {
            decision.to_compile.push(source.path.clone());
            decision
                .reason_map
                .insert(source.path.clone(), Reason::ForcedFull);
        }
        return Ok(decision);
    }

    let mut dirty: BTreeSet<String> = changed_files.clone();

    for source in sources {
        if dirty.contains(&source.path) {
            continue;
        }
        let abs = AbsFilePath::try_from(std::path::PathBuf::from(&source.path))?;
        let current_quick = quick(&abs).await?;

        if cache
            .target_quick_hit(source.target, &current_quick)
            .is_some()
        {
            continue;
        }

        let current_full = fingerprint::full(&abs).await?;
        if cache
            .target_full_hit(source.target, &current_quick, &current_full)
            .is_some()
        {
            continue;
        }

        dirty.insert(source.path.clone());
        decision
            .reason_map
            .insert(source.path.clone(), Reason::QuickFingerprintChanged);
    }

    propagate_transitively_dirty(&mut dirty, cache, &mut decision.reason_map);

    for source in sources {
        if !dirty.contains(&source.path) {
            decision.cached.push(source.path.clone());
            decision
                .reason_map
                .entry(source.path.clone())
                .or_insert(Reason::Clean);
            continue;
        }

        let abs = AbsFilePath::try_from(std::path::PathBuf::from(&source.path))?;
        let content_fp = fingerprint::full(&abs).await?;
        let action_fp = action_fingerprint(&source.action, &content_fp);
        if cache.action_lookup(&source.action, &action_fp).is_some() {
            decision.cached.push(source.path.clone());
            decision
                .reason_map
                .insert(source.path.clone(), Reason::ActionCacheHit);
        } else {
            decision.to_compile.push(source.path.clone());
            decision
                .reason_map
                .entry(source.path.clone())
                .or_insert(Reason::FullFingerprintChanged);
        }
    }

    Ok(decision)
}

/// Walk the dependency cache's reverse index: any file importing a dirty
/// file transitively becomes dirty too.
fn propagate_transitively_dirty(
    dirty: &mut BTreeSet<String>,
    cache: &Cache,
    reasons: &mut BTreeMap<String, Reason>,
) {
    let reverse = cache.reverse_dependency_index();
    let mut frontier: Vec<String> = dirty.iter().cloned().collect();

    while let Some(path) = frontier.pop() {
        let Some(dependents) = reverse.get(&path) else {
            continue;
        };
        for dependent in dependents {
            if dirty.insert(dependent.clone()) {
                reasons
                    .entry(dependent.clone())
                    .or_insert_with(|| Reason::TransitivelyDirty { via: path.clone() });
                frontier.push(dependent.clone());
            }
        }
    }
}

/// Derive an action's cache key from its id plus the current content
/// fingerprint of the file it acts on — so a hit is only returned when both
/// the action identity and its input are unchanged.
fn action_fingerprint(action: &ActionId, content: &Fingerprint) -> Fingerprint {
    let mut data = action.as_str().as_bytes().to_vec();
    data.extend_from_slice(content.to_hex().as_bytes());
    fingerprint::of_bytes(&data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hybrid_picks_full_below_threshold() {
        let strategy = Strategy::Hybrid { threshold: 32 };
        assert_eq!(strategy.resolve_for(10), ResolvedStrategy::Full);
        assert_eq!(strategy.resolve_for(32), ResolvedStrategy::Incremental);
    }
}
