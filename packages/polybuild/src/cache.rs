//! Target, action, and dependency caches (Component B).
//!
//! Three logically distinct caches share one storage layer:
//! - **Target cache**: `TargetId -> CacheEntry`, whole-target skip.
//! - **Action cache**: `ActionId -> ActionCacheEntry`, fine-grained skip.
//! - **Dependency cache**: `SourcePath -> set<SourcePath>`, last-extracted
//!   imports, for invalidation propagation.
//!
//! Storage is a durable append-only framed log (`format.rs`) plus a
//! `rusqlite` secondary index (`index.rs`) rebuilt from the log when
//! missing or unreadable — mirroring the teacher's `LocalMetadata`
//! open-or-create posture. The in-memory layer is a `dashmap::DashMap` per
//! cache, which realizes the "lock-striped hash map keyed by the high bits
//! of the key" structure the ecosystem way rather than hand-rolled shards;
//! mutations are buffered and written back once per `flush()`.

mod entry;
mod eviction;
mod format;
mod index;

use std::{
    collections::BTreeSet,
    io::{BufReader, Write},
    path::{Path, PathBuf},
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use color_eyre::{Result, eyre::Context, eyre::eyre};
use dashmap::DashMap;
use directories::ProjectDirs;
use polybuild_wire::peer::ActionId;
use tracing::{instrument, warn};

pub use entry::{ActionCacheEntry, CacheEntry, Record};
pub use eviction::EvictionPolicy;
use index::Index;

use crate::{
    artifact::ArtifactStore,
    fingerprint::{Fingerprint, QuickFingerprint},
    graph::TargetId,
};

const CACHE_DIR_NAME: &str = "polybuild";
const LOG_FILE_NAME: &str = "cache.log";
const INDEX_FILE_NAME: &str = "cache-index.db";

/// Target/action/dependency cache. Cheaply cloneable.
#[derive(Clone)]
pub struct Cache {
    inner: std::sync::Arc<Inner>,
}

struct Inner {
    log_path: PathBuf,
    index: Index,
    targets: DashMap<TargetId, CacheEntry>,
    actions: DashMap<ActionId, ActionCacheEntry>,
    dependencies: DashMap<String, BTreeSet<String>>,
    dirty: Mutex<Vec<Record>>,
    policy: EvictionPolicy,
}

impl Cache {
    /// Open or create a cache at the default location.
    ///
    /// Overridable with the `POLYBUILD_CACHE_DIR` environment variable.
    #[instrument(name = "Cache::open_default")]
    pub fn open_default() -> Result<Self> {
        Self::open(default_cache_dir()?, EvictionPolicy::default())
    }

    #[instrument(name = "Cache::open", skip(cache_dir))]
    pub fn open(cache_dir: impl Into<PathBuf>, policy: EvictionPolicy) -> Result<Self> {
        let cache_dir = cache_dir.into();
        #[allow(clippy::disallowed_methods)]
        std::fs::create_dir_all(&cache_dir)
            .with_context(|| format!("create cache directory {cache_dir:?}"))?;

        let log_path = cache_dir.join(LOG_FILE_NAME);
        let index_path = cache_dir.join(INDEX_FILE_NAME);

        let targets = DashMap::new();
        let actions = DashMap::new();
        let dependencies = DashMap::new();
        let records = load_log(&log_path)?;

        let index = Index::open(&index_path)?;
        index.rebuild(records.iter().cloned())?;

        for record in records {
            apply_in_memory(&targets, &actions, &dependencies, record);
        }

        Ok(Self {
            inner: std::sync::Arc::new(Inner {
                log_path,
                index,
                targets,
                actions,
                dependencies,
                dirty: Mutex::new(Vec::new()),
                policy,
            }),
        })
    }

    #[cfg(test)]
    pub fn open_in_temp() -> Result<(tempfile::TempDir, Self)> {
        let dir = tempfile::tempdir().unwrap();
        let cache = Self::open(dir.path(), EvictionPolicy::default())?;
        Ok((dir, cache))
    }

    /// Step 1 of the incremental decision procedure: a hit here means the
    /// caller can skip computing the full fingerprint entirely.
    pub fn target_quick_hit(&self, id: TargetId, quick: &QuickFingerprint) -> Option<CacheEntry> {
        let mut entry = self.inner.targets.get_mut(&id)?;
        if entry.quick != *quick {
            return None;
        }
        entry.last_access = now();
        let entry = entry.clone();
        self.stage(Record::Target(id, entry.clone()));
        Some(entry)
    }

    /// Step 2: only reached when the quick fingerprint changed. Compares
    /// the authoritative content hash (scheme included, so a hit is never
    /// returned across a scheme change) and, on match, writes back the new
    /// `quick` snapshot so the next build can skip straight to step 1.
    pub fn target_full_hit(
        &self,
        id: TargetId,
        quick: &QuickFingerprint,
        full: &Fingerprint,
    ) -> Option<CacheEntry> {
        let mut entry = self.inner.targets.get_mut(&id)?;
        if entry.fingerprint != *full {
            return None;
        }
        entry.quick = *quick;
        entry.last_access = now();
        let entry = entry.clone();
        self.stage(Record::Target(id, entry.clone()));
        Some(entry)
    }

    pub fn put_target(&self, entry: CacheEntry) {
        let id = entry.target;
        self.inner.targets.insert(id, entry.clone());
        self.stage(Record::Target(id, entry));
    }

    pub fn action_lookup(&self, id: &ActionId, current: &Fingerprint) -> Option<ActionCacheEntry> {
        let mut entry = self.inner.actions.get_mut(id)?;
        if entry.fingerprint != *current {
            return None;
        }
        entry.last_access = now();
        let entry = entry.clone();
        self.stage(Record::Action(id.clone(), entry.clone()));
        Some(entry)
    }

    pub fn put_action(&self, entry: ActionCacheEntry) {
        let id = entry.action.clone();
        self.inner.actions.insert(id.clone(), entry.clone());
        self.stage(Record::Action(id, entry));
    }

    pub fn dependencies_of(&self, source_path: &str) -> Option<BTreeSet<String>> {
        self.inner
            .dependencies
            .get(source_path)
            .map(|r| r.clone())
    }

    pub fn put_dependencies(&self, source_path: String, deps: BTreeSet<String>) {
        self.inner
            .dependencies
            .insert(source_path.clone(), deps.clone());
        self.stage(Record::Dependency(source_path, deps));
    }

    /// Invert the `SourcePath -> set<SourcePath>` dependency cache into
    /// `SourcePath -> [dependents]`, for propagating dirtiness transitively.
    /// The forward map is the thing that's cheap to maintain incrementally
    /// (one entry per source, updated on every scan); a full scan to build
    /// the reverse view on demand is cheaper than keeping a second index in
    /// sync with every dependency-cache write.
    pub fn reverse_dependency_index(&self) -> std::collections::HashMap<String, Vec<String>> {
        let mut reverse: std::collections::HashMap<String, Vec<String>> = std::collections::HashMap::new();
        for entry in self.inner.dependencies.iter() {
            let dependent = entry.key().clone();
            for dep in entry.value() {
                reverse.entry(dep.clone()).or_default().push(dependent.clone());
            }
        }
        reverse
    }

    /// Self-healing check: if any output `ArtifactId` for `id`'s cached
    /// entry is missing from `store`, purge the entry and report a miss.
    #[instrument(skip(self, store))]
    pub async fn verify_target_artifacts(
        &self,
        id: TargetId,
        store: &ArtifactStore,
    ) -> Result<bool> {
        let Some(entry) = self.inner.targets.get(&id).map(|r| r.clone()) else {
            return Ok(false);
        };
        let presence = store.has_many(entry.outputs.iter().cloned()).await?;
        if presence.into_iter().all(|(_, present)| present) {
            return Ok(true);
        }
        warn!(%id, "cache entry references missing artifact(s), purging");
        self.inner.targets.remove(&id);
        self.stage(Record::TargetTombstone(id));
        Ok(false)
    }

    fn stage(&self, record: Record) {
        self.inner
            .dirty
            .lock()
            .expect("cache dirty-buffer mutex poisoned")
            .push(record);
    }

    /// Write all buffered mutations once: append to the durable log, apply
    /// to the sqlite index, then run eviction if a watermark is crossed.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> Result<()> {
        let records = {
            let mut dirty = self
                .inner
                .dirty
                .lock()
                .expect("cache dirty-buffer mutex poisoned");
            std::mem::take(&mut *dirty)
        };
        if records.is_empty() {
            return Ok(());
        }

        append_records(&self.inner.log_path, &records)?;
        for record in &records {
            self.inner.index.apply(record)?;
        }

        self.evict()?;
        Ok(())
    }

    /// Hybrid eviction, evaluated in order until within limits: drop
    /// entries older than `max_age`, then LRU to `max_entries`, then LRU to
    /// `max_size`.
    #[instrument(skip(self))]
    pub fn evict(&self) -> Result<()> {
        let policy = self.inner.policy;

        let cutoff = now() - policy.max_age_secs;
        for target_id in self.inner.index.stale_targets(cutoff)? {
            self.evict_target(&target_id)?;
        }

        while self.inner.index.entry_count()? > policy.max_entries {
            let Some(victim) = self.inner.index.lru_targets()?.into_iter().next() else {
                break;
            };
            self.evict_target(&victim)?;
        }

        while self.inner.index.total_size()? > policy.max_size {
            let Some(victim) = self.inner.index.lru_targets()?.into_iter().next() else {
                break;
            };
            self.evict_target(&victim)?;
        }

        Ok(())
    }

    fn evict_target(&self, target_id_text: &str) -> Result<()> {
        let target_id: TargetId = target_id_text
            .parse()
            .map_err(|_| eyre!("invalid target id in cache index: {target_id_text}"))?;
        // Stage a tombstone so the durable log reflects the eviction; without
        // this, replaying the log on the next open resurrects the entry.
        self.stage(Record::TargetTombstone(target_id));
        self.inner.index.remove_target(target_id_text)?;
        self.inner.targets.remove(&target_id);
        Ok(())
    }
}

fn apply_in_memory(
    targets: &DashMap<TargetId, CacheEntry>,
    actions: &DashMap<ActionId, ActionCacheEntry>,
    dependencies: &DashMap<String, BTreeSet<String>>,
    record: Record,
) {
    match record {
        Record::Target(id, entry) => {
            targets.insert(id, entry);
        }
        Record::Action(id, entry) => {
            actions.insert(id, entry);
        }
        Record::Dependency(path, deps) => {
            dependencies.insert(path, deps);
        }
        Record::TargetTombstone(id) => {
            targets.remove(&id);
        }
        Record::ActionTombstone(id) => {
            actions.remove(&id);
        }
    }
}

/// Load every well-formed record from the log. A corrupted header starts
/// empty. A record that fails its CRC invalidates only itself — the reader
/// resyncs on the next record — while a torn record at the tail (length or
/// payload running off the end of the file) ends the log (see
/// `format::read_record`).
fn load_log(path: &Path) -> Result<Vec<Record>> {
    let Some(file) = open_existing(path)? else {
        return Ok(Vec::new());
    };
    let mut reader = BufReader::new(file);

    let Some(_header) = format::read_header(&mut reader)? else {
        warn!(?path, "cache log header unreadable, starting empty");
        return Ok(Vec::new());
    };

    let mut records = Vec::new();
    loop {
        match format::read_record(&mut reader)? {
            format::RecordOutcome::Record(payload) => match serde_json::from_slice::<Record>(&payload) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(?err, "dropping unreadable cache record");
                }
            },
            format::RecordOutcome::CorruptRecord => {
                warn!("dropping cache record with invalid checksum, continuing past it");
            }
            format::RecordOutcome::Eof => break,
        }
    }
    Ok(records)
}

fn open_existing(path: &Path) -> Result<Option<std::fs::File>> {
    match std::fs::File::open(path) {
        Ok(file) => Ok(Some(file)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("open cache log {path:?}")),
    }
}

/// Append records to the log, writing a fresh header if the file is new.
/// Writes to a temp file and renames only when creating the file fresh;
/// appends in place otherwise, so a write failure never truncates existing
/// data.
fn append_records(path: &Path, records: &[Record]) -> Result<()> {
    let needs_header = !path.exists();

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open cache log for append {path:?}"))?;

    if needs_header {
        format::write_header(
            &mut file,
            &format::Header {
                version: format::VERSION,
                flags: 0,
            },
        )?;
    }

    for record in records {
        let payload = serde_json::to_vec(record).context("serialize cache record")?;
        format::write_record(&mut file, &payload)?;
    }
    file.flush().context("flush cache log")?;
    Ok(())
}

fn default_cache_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("POLYBUILD_CACHE_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let dirs = ProjectDirs::from("", "", CACHE_DIR_NAME)
        .ok_or_else(|| eyre!("could not determine cache directory"))?;
    Ok(dirs.cache_dir().to_path_buf())
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fingerprint::{full_sync, quick},
        graph::Interner,
    };

    /// Writes a temp file and returns its path plus a matching
    /// `(quick, full)` fingerprint pair, for constructing realistic
    /// `CacheEntry` literals.
    async fn sample_fingerprints() -> (QuickFingerprint, Fingerprint) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"contents").unwrap();
        let abs = crate::path::AbsFilePath::try_from(path).unwrap();
        let q = quick(&abs).await.unwrap();
        let fp = full_sync(&abs).unwrap();
        (q, fp)
    }

    #[tokio::test]
    async fn put_then_quick_hit() {
        let (_dir, cache) = Cache::open_in_temp().unwrap();
        let interner = Interner::new();
        let target = interner.intern("//a");
        let (q, fp) = sample_fingerprints().await;

        cache.put_target(CacheEntry {
            target,
            quick: q,
            fingerprint: fp,
            outputs: Vec::new(),
            last_access: 0,
        });

        assert!(cache.target_quick_hit(target, &q).is_some());
    }

    #[tokio::test]
    async fn full_hit_writes_back_quick() {
        let (_dir, cache) = Cache::open_in_temp().unwrap();
        let interner = Interner::new();
        let target = interner.intern("//a");
        let (q, fp) = sample_fingerprints().await;
        let mut stale_quick = q;
        stale_quick.size += 1;

        cache.put_target(CacheEntry {
            target,
            quick: stale_quick,
            fingerprint: fp.clone(),
            outputs: Vec::new(),
            last_access: 0,
        });

        assert!(cache.target_quick_hit(target, &q).is_none());
        assert!(cache.target_full_hit(target, &q, &fp).is_some());
        assert!(cache.target_quick_hit(target, &q).is_some());
    }

    #[tokio::test]
    async fn mismatched_fingerprint_misses() {
        let (_dir, cache) = Cache::open_in_temp().unwrap();
        let interner = Interner::new();
        let target = interner.intern("//a");
        let (q, fp) = sample_fingerprints().await;
        let other_dir = tempfile::tempdir().unwrap();
        let other_path = other_dir.path().join("g");
        std::fs::write(&other_path, b"different contents").unwrap();
        let other_abs = crate::path::AbsFilePath::try_from(other_path).unwrap();
        let other_fp = full_sync(&other_abs).unwrap();
        let mut stale_quick = q;
        stale_quick.size += 1;

        cache.put_target(CacheEntry {
            target,
            quick: stale_quick,
            fingerprint: fp,
            outputs: Vec::new(),
            last_access: 0,
        });

        assert!(cache.target_full_hit(target, &q, &other_fp).is_none());
    }

    #[tokio::test]
    async fn flush_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let interner = Interner::new();
        let target = interner.intern("//a");
        let (q, fp) = sample_fingerprints().await;

        {
            let cache = Cache::open(dir.path(), EvictionPolicy::default()).unwrap();
            cache.put_target(CacheEntry {
                target,
                quick: q,
                fingerprint: fp.clone(),
                outputs: Vec::new(),
                last_access: 0,
            });
            cache.flush().await.unwrap();
        }

        let reopened = Cache::open(dir.path(), EvictionPolicy::default()).unwrap();
        assert!(reopened.target_quick_hit(target, &q).is_some());
    }

    #[tokio::test]
    async fn evicted_target_does_not_resurrect_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let interner = Interner::new();
        let target = interner.intern("//a");
        let (q, fp) = sample_fingerprints().await;

        {
            // max_entries = 0 forces the entry out on the very next flush.
            let tight = EvictionPolicy::builder().max_entries(0).build();
            let cache = Cache::open(dir.path(), tight).unwrap();
            cache.put_target(CacheEntry {
                target,
                quick: q,
                fingerprint: fp,
                outputs: Vec::new(),
                last_access: 0,
            });
            cache.flush().await.unwrap();
            assert!(cache.target_quick_hit(target, &q).is_none());

            // The tombstone staged by eviction must itself reach the log.
            cache.flush().await.unwrap();
        }

        let reopened = Cache::open(dir.path(), EvictionPolicy::default()).unwrap();
        assert!(
            reopened.target_quick_hit(target, &q).is_none(),
            "evicted entry resurrected after replaying the log on reopen"
        );
    }

    #[test]
    fn corrupt_record_mid_log_does_not_drop_records_after_it() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join(LOG_FILE_NAME);

        let bad = Record::Dependency(
            "bad.rs".to_string(),
            BTreeSet::from(["x.rs".to_string()]),
        );
        let good = Record::Dependency(
            "good.rs".to_string(),
            BTreeSet::from(["y.rs".to_string()]),
        );
        append_records(&log_path, &[bad]).unwrap();
        // Flip the CRC of the record just written, which sits in the last
        // 4 bytes of the file.
        {
            let mut bytes = std::fs::read(&log_path).unwrap();
            let last = bytes.len() - 1;
            bytes[last] ^= 0xFF;
            std::fs::write(&log_path, bytes).unwrap();
        }
        append_records(&log_path, &[good]).unwrap();

        let cache = Cache::open(dir.path(), EvictionPolicy::default()).unwrap();
        assert_eq!(cache.dependencies_of("bad.rs"), None);
        assert_eq!(
            cache.dependencies_of("good.rs"),
            Some(BTreeSet::from(["y.rs".to_string()]))
        );
    }

    #[tokio::test]
    async fn dependency_round_trip() {
        let (_dir, cache) = Cache::open_in_temp().unwrap();
        let deps = BTreeSet::from(["a.rs".to_string(), "b.rs".to_string()]);
        cache.put_dependencies("main.rs".to_string(), deps.clone());
        assert_eq!(cache.dependencies_of("main.rs"), Some(deps));
    }
}
