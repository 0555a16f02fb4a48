//! SQLite-backed LRU sidecar index for the artifact store.
//!
//! Tracks size and last-access time per artifact so eviction decisions don't
//! require a filesystem walk. The artifact bytes themselves are the source of
//! truth; this index is rebuildable (a missing or corrupt index is simply
//! repopulated lazily as artifacts are touched).

use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::{SystemTime, UNIX_EPOCH},
};

use bon::Builder;
use color_eyre::{Result, eyre::Context, eyre::eyre};
use derive_more::Debug;
use polybuild_wire::ArtifactId;
use rusqlite::{Connection, params};
use tracing::instrument;

/// Eviction thresholds for the artifact store.
///
/// `max_size_soft` triggers background eviction; `max_size_hard` triggers
/// blocking eviction so a write never leaves the store far over budget.
#[derive(Copy, Clone, Debug, Builder)]
#[non_exhaustive]
pub struct EvictionPolicy {
    #[builder(default = 1024 * 1024 * 1024)]
    pub max_size_soft: u64,
    #[builder(default = 2 * 1024 * 1024 * 1024)]
    pub max_size_hard: u64,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Handle to the sidecar LRU index. Cheaply cloneable; the connection is
/// shared behind a mutex, matching the teacher's `LocalMetadata` pattern.
#[derive(Clone, Debug)]
pub struct Index {
    #[debug("<connection>")]
    conn: Arc<Mutex<Connection>>,
    policy: EvictionPolicy,
}

impl Index {
    #[instrument(name = "artifact::Index::open", skip(path))]
    pub fn open(path: impl AsRef<Path>, policy: EvictionPolicy) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            #[allow(clippy::disallowed_methods)]
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create artifact index directory {parent:?}"))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("open artifact index database at {path:?}"))?;
        let index = Self {
            conn: Arc::new(Mutex::new(conn)),
            policy,
        };
        index.init_schema()?;
        Ok(index)
    }

    #[cfg(test)]
    pub fn in_memory(policy: EvictionPolicy) -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory artifact index")?;
        let index = Self {
            conn: Arc::new(Mutex::new(conn)),
            policy,
        };
        index.init_schema()?;
        Ok(index)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS artifacts (
                id TEXT PRIMARY KEY,
                size INTEGER NOT NULL,
                last_access INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_artifacts_last_access
            ON artifacts(last_access);
            "#,
        )
        .context("initialize artifact index schema")
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| eyre!("lock error: {e}"))
    }

    /// Record a newly written artifact.
    pub fn record(&self, id: &ArtifactId, size: u64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO artifacts (id, size, last_access) VALUES (?1, ?2, ?3)",
            params![id.to_hex(), size as i64, now()],
        )
        .context("record artifact")?;
        Ok(())
    }

    /// Bump an artifact's last-access time.
    pub fn touch(&self, id: &ArtifactId) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE artifacts SET last_access = ?1 WHERE id = ?2",
            params![now(), id.to_hex()],
        )
        .context("touch artifact")?;
        Ok(())
    }

    /// Remove an artifact's index entry (after it has been evicted).
    pub fn forget(&self, id: &ArtifactId) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM artifacts WHERE id = ?1", params![id.to_hex()])
            .context("forget artifact")?;
        Ok(())
    }

    /// Total size of all tracked artifacts.
    pub fn total_size(&self) -> Result<u64> {
        let conn = self.lock()?;
        let size: i64 = conn
            .query_row("SELECT COALESCE(SUM(size), 0) FROM artifacts", [], |row| {
                row.get(0)
            })
            .context("sum artifact sizes")?;
        Ok(size as u64)
    }

    pub fn over_soft_limit(&self) -> Result<bool> {
        Ok(self.total_size()? > self.policy.max_size_soft)
    }

    pub fn over_hard_limit(&self) -> Result<bool> {
        Ok(self.total_size()? > self.policy.max_size_hard)
    }

    /// Select least-recently-used artifacts to evict until the store is back
    /// under the soft limit.
    pub fn select_eviction_victims(&self) -> Result<Vec<ArtifactId>> {
        let total = self.total_size()?;
        if total <= self.policy.max_size_soft {
            return Ok(Vec::new());
        }

        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, size FROM artifacts ORDER BY last_access ASC")
            .context("prepare eviction query")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .context("query eviction candidates")?;

        let mut victims = Vec::new();
        let mut remaining = total;
        for row in rows {
            if remaining <= self.policy.max_size_soft {
                break;
            }
            let (hex, size) = row.context("read eviction row")?;
            let id = ArtifactId::from_hex(&hex).with_context(|| format!("parse id {hex}"))?;
            victims.push(id);
            remaining = remaining.saturating_sub(size as u64);
        }
        Ok(victims)
    }
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

    #[test]
    fn records_and_evicts_lru() {
        let policy = EvictionPolicy::builder()
            .max_size_soft(10)
            .max_size_hard(20)
            .build();
        let index = Index::in_memory(policy).unwrap();

        let a = ArtifactId::from_buffer(b"a");
        let b = ArtifactId::from_buffer(b"b");
        index.record(&a, 6).unwrap();
        index.record(&b, 6).unwrap();

        assert!(index.over_soft_limit().unwrap());
        let victims = index.select_eviction_victims().unwrap();
        assert_eq!(victims, vec![a]);
    }

    #[test]
    fn touch_updates_access_order() {
        let index = Index::in_memory(EvictionPolicy::default()).unwrap();
        let a = ArtifactId::from_buffer(b"a");
        index.record(&a, 1).unwrap();
        index.touch(&a).unwrap();
    }
}
