//! Content-addressed local artifact store (Component G).
//!
//! Blobs are stored on the filesystem with zstd compression, using the same
//! two-level hex-prefix sharding as the teacher's Courier `Disk` storage:
//! `{root}/{id[0..2]}/{id[2..4]}/{id}`. A sqlite sidecar index tracks access
//! times and sizes so eviction doesn't require walking the filesystem.

mod eviction;

use std::{
    io::Cursor,
    path::{Path, PathBuf},
};

use async_compression::{
    Level,
    tokio::{bufread::ZstdDecoder, write::ZstdEncoder},
};
use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use derive_more::{Debug, Display};
use polybuild_wire::ArtifactId;
use tokio::{
    fs::{File, create_dir_all, metadata, remove_file, rename},
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader},
};
use tracing::{instrument, warn};
use uuid::Uuid;

pub use eviction::{EvictionPolicy, Index};

/// Default buffer size for read/write operations.
const DEFAULT_BUF_SIZE: usize = 64 * 1024;

/// Local content-addressed artifact store backed by the filesystem.
///
/// ## Atomicity
///
/// Writes use a temp-file-then-rename pattern so bytes are never partially
/// visible: a reader either sees the full blob or `NotFound`.
#[derive(Clone, Debug, Display)]
#[debug("ArtifactStore(root = {})", self.root.display())]
#[display("{}", root.display())]
pub struct ArtifactStore {
    root: PathBuf,
    index: Index,
}

impl ArtifactStore {
    /// Open or create a store rooted at the given directory, with the given
    /// eviction policy.
    #[instrument(name = "ArtifactStore::open")]
    pub async fn open(root: impl Into<PathBuf>, policy: EvictionPolicy) -> Result<Self> {
        let root = root.into();
        create_dir_all(&root)
            .await
            .with_context(|| format!("create artifact store root {root:?}"))?;
        let index = Index::open(root.join("index.db"), policy).context("open artifact index")?;
        Ok(Self { root, index })
    }

    /// The path a given id would be stored at.
    ///
    /// Example: `ArtifactId("abcd1234...")` -> `root/ab/cd/abcd1234...`
    fn id_path(&self, id: &ArtifactId) -> PathBuf {
        let hex = id.to_hex();
        let prefix1 = hex.chars().take(2).collect::<String>();
        let prefix2 = hex.chars().skip(2).take(2).collect::<String>();
        self.root.join(prefix1).join(prefix2).join(&hex)
    }

    /// Check if an artifact exists.
    #[instrument(name = "ArtifactStore::has")]
    pub async fn has(&self, id: &ArtifactId) -> Result<bool> {
        exists_at(&self.id_path(id)).await
    }

    /// Check existence for many ids in one pass.
    pub async fn has_many(
        &self,
        ids: impl IntoIterator<Item = ArtifactId>,
    ) -> Result<Vec<(ArtifactId, bool)>> {
        let mut out = Vec::new();
        for id in ids {
            let present = self.has(&id).await?;
            out.push((id, present));
        }
        Ok(out)
    }

    /// Read an artifact's bytes, recording an access for LRU purposes.
    #[instrument(name = "ArtifactStore::get")]
    pub async fn get(&self, id: &ArtifactId) -> Result<Option<Vec<u8>>> {
        let path = self.id_path(id);
        match File::open(&path).await {
            Ok(file) => {
                let reader = BufReader::new(file);
                let decoder = ZstdDecoder::new(reader);
                let mut buffered = BufReader::with_capacity(DEFAULT_BUF_SIZE, decoder);

                let mut buffer = Vec::new();
                tokio::io::copy(&mut buffered, &mut buffer)
                    .await
                    .context("read decompressed artifact content")?;
                self.index.touch(id)?;
                Ok(Some(buffer))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context(format!("open artifact file {path:?}")),
        }
    }

    /// Read an artifact as a stream, without buffering it in memory.
    #[instrument(name = "ArtifactStore::get_stream")]
    pub async fn get_stream(&self, id: &ArtifactId) -> Result<impl AsyncRead + Unpin + 'static> {
        let path = self.id_path(id);
        let file = File::open(&path)
            .await
            .with_context(|| format!("open artifact file {path:?}"))?;
        self.index.touch(id)?;
        let reader = BufReader::new(file);
        let decoder = ZstdDecoder::new(reader);
        Ok(BufReader::with_capacity(DEFAULT_BUF_SIZE, decoder))
    }

    /// Batch variant of [`Self::get`].
    pub async fn get_many(
        &self,
        ids: impl IntoIterator<Item = ArtifactId>,
    ) -> Result<Vec<(ArtifactId, Option<Vec<u8>>)>> {
        let mut out = Vec::new();
        for id in ids {
            let content = self.get(&id).await?;
            out.push((id, content));
        }
        Ok(out)
    }

    /// Store bytes under their content hash.
    ///
    /// Idempotent: an existing blob with the same id returns its id without
    /// rewriting anything.
    #[instrument(name = "ArtifactStore::put", skip(content))]
    pub async fn put(&self, content: &[u8]) -> Result<ArtifactId> {
        let id = ArtifactId::from_buffer(content);
        if self.write(&id, content).await? {
            self.maybe_evict().await?;
        }
        Ok(id)
    }

    /// Store bytes under an explicit id (used when the id was already
    /// computed upstream, e.g. by a streaming hash).
    ///
    /// Returns `true` if newly written, `false` if it already existed.
    #[instrument(name = "ArtifactStore::write", skip(content))]
    pub async fn write(&self, id: &ArtifactId, content: &[u8]) -> Result<bool> {
        let path = self.id_path(id);

        if exists_at(&path).await? {
            self.index.touch(id)?;
            return Ok(false);
        }

        if let Some(parent) = path.parent() {
            create_dir_all(parent)
                .await
                .with_context(|| format!("create parent directory {parent:?}"))?;
        }

        let temp = temp_path(&path);
        let file = File::create(&temp).await.context("create temporary file")?;

        let mut encoder = ZstdEncoder::with_quality(file, Level::Default);
        let (hash, size) = hashed_copy(&mut Cursor::new(content), &mut encoder)
            .await
            .with_context(|| format!("write content to {temp:?}"))?;

        encoder.shutdown().await.context("flush zstd encoder")?;
        let mut file = encoder.into_inner();
        file.flush().await.context("flush file")?;
        drop(file);

        if id != &hash {
            if let Err(err) = remove_file(&temp).await {
                warn!("failed to remove temp file {temp:?}: {err}");
            }
            bail!("hash mismatch: computed {hash:?} != expected {id:?}");
        }

        match rename(&temp, &path).await {
            Ok(()) => {
                self.index.record(id, size)?;
                Ok(true)
            }
            Err(err) => {
                if let Err(err) = remove_file(&temp).await {
                    warn!("failed to remove temp file {temp:?}: {err}");
                }
                if err.kind() == std::io::ErrorKind::AlreadyExists {
                    self.index.touch(id)?;
                    Ok(false)
                } else {
                    Err(err).context(format!("rename {temp:?} to {path:?}"))
                }
            }
        }
    }

    /// Run eviction if a size watermark has been crossed.
    ///
    /// Soft watermark crossing evicts in the background; hard watermark
    /// crossing evicts inline (callers observe the store back under the hard
    /// limit before returning).
    async fn maybe_evict(&self) -> Result<()> {
        if !self.index.over_soft_limit()? {
            return Ok(());
        }

        let blocking = self.index.over_hard_limit()?;
        let victims = self.index.select_eviction_victims()?;
        let root = self.root.clone();
        let index = self.index.clone();
        let evict = async move {
            for id in victims {
                let path = {
                    let hex = id.to_hex();
                    let p1 = hex.chars().take(2).collect::<String>();
                    let p2 = hex.chars().skip(2).take(2).collect::<String>();
                    root.join(p1).join(p2).join(&hex)
                };
                if let Err(err) = remove_file(&path).await {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        warn!(?err, ?path, "failed to remove evicted artifact");
                        continue;
                    }
                }
                if let Err(err) = index.forget(&id) {
                    warn!(?err, %id, "failed to forget evicted artifact in index");
                }
            }
        };

        if blocking {
            evict.await;
        } else {
            tokio::task::spawn(evict);
        }

        Ok(())
    }
}

async fn exists_at(path: &Path) -> Result<bool> {
    match metadata(path).await {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).context(format!("check if artifact exists at {path:?}")),
    }
}

/// Generate a temporary file path in the same directory as the target.
fn temp_path(target: &Path) -> PathBuf {
    let mut temp = target.as_os_str().to_owned();
    temp.push(".tmp.");
    temp.push(Uuid::new_v4().to_string());
    PathBuf::from(temp)
}

/// Copy content while computing the blake3 hash, returning (hash, bytes copied).
async fn hashed_copy(
    mut source: impl AsyncRead + Unpin,
    mut target: impl tokio::io::AsyncWrite + Unpin,
) -> Result<(blake3::Hash, u64)> {
    let mut buffer = vec![0; 16 * 1024];
    let mut hasher = blake3::Hasher::new();
    let mut copied = 0;

    loop {
        let n = source.read(&mut buffer).await.context("read source")?;
        if n == 0 {
            break;
        }

        let chunk = &buffer[..n];
        hasher.update(chunk);
        target.write_all(chunk).await.context("write target")?;
        copied += n as u64;
    }

    Ok((hasher.finalize(), copied))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, ArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path(), EvictionPolicy::default())
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn round_trip() {
        let (_dir, store) = store().await;
        let content = b"hello world";
        let id = store.put(content).await.unwrap();
        assert!(store.has(&id).await.unwrap());
        let read = store.get(&id).await.unwrap().unwrap();
        assert_eq!(read, content);
    }

    #[tokio::test]
    async fn put_is_idempotent() {
        let (_dir, store) = store().await;
        let id1 = store.put(b"same content").await.unwrap();
        let id2 = store.put(b"same content").await.unwrap();
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn missing_id() {
        let (_dir, store) = store().await;
        let id = ArtifactId::from_buffer(b"nonexistent");
        assert!(!store.has(&id).await.unwrap());
        assert!(store.get(&id).await.unwrap().is_none());
    }
}
