//! Queryable sqlite secondary index over the cache log.
//!
//! The framed log (`format.rs`) is the durable source of truth; this index
//! exists so callers can ask "all actions for target X" without a linear
//! scan. It is rebuilt from the log whenever it's missing or fails to open,
//! mirroring the teacher's `LocalMetadata` open-or-create posture.

use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use color_eyre::{Result, eyre::Context, eyre::eyre};
use derive_more::Debug;
use rusqlite::{Connection, params};
use tracing::{instrument, warn};

use super::entry::{ActionCacheEntry, CacheEntry, Record};

#[derive(Clone, Debug)]
pub struct Index {
    #[debug("<connection>")]
    conn: Arc<Mutex<Connection>>,
}

impl Index {
    #[instrument(name = "cache::Index::open", skip(path))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            #[allow(clippy::disallowed_methods)]
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create cache index directory {parent:?}"))?;
        }

        let conn = match Connection::open(path) {
            Ok(conn) => conn,
            Err(err) => {
                warn!(?err, ?path, "cache index failed to open, recreating");
                #[allow(clippy::disallowed_methods)]
                let _ = std::fs::remove_file(path);
                Connection::open(path).with_context(|| format!("recreate cache index {path:?}"))?
            }
        };
        let index = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        index.init_schema()?;
        Ok(index)
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory cache index")?;
        let index = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        index.init_schema()?;
        Ok(index)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS targets (
                target_id TEXT PRIMARY KEY,
                last_access INTEGER NOT NULL,
                size INTEGER NOT NULL,
                data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS actions (
                action_id TEXT PRIMARY KEY,
                target_id TEXT,
                last_access INTEGER NOT NULL,
                size INTEGER NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_actions_target ON actions(target_id);
            CREATE TABLE IF NOT EXISTS dependencies (
                source_path TEXT PRIMARY KEY,
                data TEXT NOT NULL
            );
            "#,
        )
        .context("initialize cache index schema")
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| eyre!("lock error: {e}"))
    }

    /// Wipe and rebuild the index from an ordered sequence of log records.
    #[instrument(name = "cache::Index::rebuild", skip(self, records))]
    pub fn rebuild(&self, records: impl IntoIterator<Item = Record>) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().context("begin rebuild transaction")?;
        tx.execute_batch("DELETE FROM targets; DELETE FROM actions; DELETE FROM dependencies;")
            .context("clear cache index")?;

        for record in records {
            apply_record(&tx, &record)?;
        }

        tx.commit().context("commit rebuild transaction")
    }

    pub fn apply(&self, record: &Record) -> Result<()> {
        let conn = self.lock()?;
        apply_record(&conn, record)
    }

    pub fn target(&self, target_id: &str) -> Result<Option<CacheEntry>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT data FROM targets WHERE target_id = ?1",
            params![target_id],
            |row| row.get::<_, String>(0),
        )
        .map(|data| serde_json::from_str(&data).context("deserialize cache entry"))
        .map(Some)
        .or_else(|err| match err {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other).context("query target entry"),
        })?
    }

    pub fn action(&self, action_id: &str) -> Result<Option<ActionCacheEntry>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT data FROM actions WHERE action_id = ?1",
            params![action_id],
            |row| row.get::<_, String>(0),
        )
        .map(|data| serde_json::from_str(&data).context("deserialize action entry"))
        .map(Some)
        .or_else(|err| match err {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other).context("query action entry"),
        })?
    }

    /// All actions recorded for a given target, newest access first.
    pub fn actions_for_target(&self, target_id: &str) -> Result<Vec<ActionCacheEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT data FROM actions WHERE target_id = ?1 ORDER BY last_access DESC",
            )
            .context("prepare actions_for_target query")?;
        let rows = stmt
            .query_map(params![target_id], |row| row.get::<_, String>(0))
            .context("query actions_for_target")?;

        let mut out = Vec::new();
        for row in rows {
            let data = row.context("read actions_for_target row")?;
            out.push(serde_json::from_str(&data).context("deserialize action entry")?);
        }
        Ok(out)
    }

    pub fn dependency(&self, source_path: &str) -> Result<Option<std::collections::BTreeSet<String>>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT data FROM dependencies WHERE source_path = ?1",
            params![source_path],
            |row| row.get::<_, String>(0),
        )
        .map(|data| serde_json::from_str(&data).context("deserialize dependency set"))
        .map(Some)
        .or_else(|err| match err {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other).context("query dependency entry"),
        })?
    }

    pub fn total_size(&self) -> Result<u64> {
        let conn = self.lock()?;
        let targets: i64 = conn
            .query_row("SELECT COALESCE(SUM(size), 0) FROM targets", [], |row| {
                row.get(0)
            })
            .context("sum target sizes")?;
        let actions: i64 = conn
            .query_row("SELECT COALESCE(SUM(size), 0) FROM actions", [], |row| {
                row.get(0)
            })
            .context("sum action sizes")?;
        Ok((targets + actions) as u64)
    }

    pub fn entry_count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let targets: i64 = conn
            .query_row("SELECT COUNT(*) FROM targets", [], |row| row.get(0))
            .context("count targets")?;
        let actions: i64 = conn
            .query_row("SELECT COUNT(*) FROM actions", [], |row| row.get(0))
            .context("count actions")?;
        Ok((targets + actions) as usize)
    }

    /// Entries older than `cutoff_unix_secs`, oldest-access-first, per the
    /// hybrid eviction policy's first pass.
    pub fn stale_targets(&self, cutoff_unix_secs: i64) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT target_id FROM targets WHERE last_access < ?1 ORDER BY last_access ASC")
            .context("prepare stale_targets query")?;
        let rows = stmt
            .query_map(params![cutoff_unix_secs], |row| row.get::<_, String>(0))
            .context("query stale_targets")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("collect stale_targets")
    }

    pub fn lru_targets(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT target_id FROM targets ORDER BY last_access ASC")
            .context("prepare lru_targets query")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("query lru_targets")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("collect lru_targets")
    }

    pub fn remove_target(&self, target_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM targets WHERE target_id = ?1", params![target_id])
            .context("remove target entry")?;
        Ok(())
    }
}

fn apply_record(conn: &Connection, record: &Record) -> Result<()> {
    match record {
        Record::Target(id, entry) => {
            let data = serde_json::to_string(entry).context("serialize cache entry")?;
            conn.execute(
                "INSERT OR REPLACE INTO targets (target_id, last_access, size, data) VALUES (?1, ?2, ?3, ?4)",
                params![id.to_string(), entry.last_access, data.len() as i64, data],
            )
            .context("upsert target entry")?;
        }
        Record::Action(id, entry) => {
            let data = serde_json::to_string(entry).context("serialize action entry")?;
            conn.execute(
                "INSERT OR REPLACE INTO actions (action_id, target_id, last_access, size, data) VALUES (?1, NULL, ?2, ?3, ?4)",
                params![id.as_str(), entry.last_access, data.len() as i64, data],
            )
            .context("upsert action entry")?;
        }
        Record::Dependency(source_path, deps) => {
            let data = serde_json::to_string(deps).context("serialize dependency set")?;
            conn.execute(
                "INSERT OR REPLACE INTO dependencies (source_path, data) VALUES (?1, ?2)",
                params![source_path, data],
            )
            .context("upsert dependency entry")?;
        }
        Record::TargetTombstone(id) => {
            conn.execute("DELETE FROM targets WHERE target_id = ?1", params![id.to_string()])
                .context("delete tombstoned target")?;
        }
        Record::ActionTombstone(id) => {
            conn.execute("DELETE FROM actions WHERE action_id = ?1", params![id.as_str()])
                .context("delete tombstoned action")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::entry::CacheEntry,
        fingerprint::{full_sync, quick_sync},
        graph::Interner,
    };

    fn sample_entry(interner: &Interner, name: &str) -> (String, CacheEntry) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"contents").unwrap();
        let abs = crate::path::AbsFilePath::try_from(path).unwrap();
        let target = interner.intern(name);
        (
            target.to_string(),
            CacheEntry {
                target,
                quick: quick_sync(&abs).unwrap(),
                fingerprint: full_sync(&abs).unwrap(),
                outputs: Vec::new(),
                last_access: 1,
            },
        )
    }

    #[test]
    fn apply_then_query_round_trips() {
        let index = Index::in_memory().unwrap();
        let interner = Interner::new();
        let (key, entry) = sample_entry(&interner, "//a");
        index.apply(&Record::Target(entry.target, entry.clone())).unwrap();

        let fetched = index.target(&key).unwrap().unwrap();
        assert_eq!(fetched, entry);
    }

    #[test]
    fn tombstone_removes_entry() {
        let index = Index::in_memory().unwrap();
        let interner = Interner::new();
        let (key, entry) = sample_entry(&interner, "//a");
        index.apply(&Record::Target(entry.target, entry)).unwrap();
        index
            .apply(&Record::TargetTombstone(interner.intern("//a")))
            .unwrap();
        assert_eq!(index.target(&key).unwrap(), None);
    }

    #[test]
    fn missing_entry_is_none() {
        let index = Index::in_memory().unwrap();
        assert_eq!(index.target("missing").unwrap(), None);
    }
}
