use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_compression::Level;
use async_compression::tokio::bufread::ZstdDecoder;
use async_compression::tokio::write::ZstdEncoder;
use color_eyre::eyre::bail;
use color_eyre::{Result, eyre::Context};
use derive_more::{Debug, Display};
use polybuild_wire::artifact::ArtifactId;
use tokio::fs::{File, create_dir_all, metadata, remove_file, rename};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::warn;
use uuid::Uuid;

/// Implements the artifact store on disk.
///
/// ## File structure
///
/// The store is a two-level directory structure of files where each file is
/// named for the hex encoded representation of the Blake3 hash of the file
/// content. Each file is prefixed with two levels of folders computed from
/// the first two and next two characters of the hex representation of
/// [`ArtifactId`].
///
/// No path details are exposed from the store on purpose: callers must use
/// the methods on this struct to interact with files inside it.
///
/// ## Compression
///
/// The store transparently compresses the content of each file with zstd.
/// Callers should always write the uncompressed content; reads get back the
/// same content that was written.
///
/// ## Idempotency and atomic writes
///
/// The store is idempotent: if a file already exists it is not written
/// again, which is safe because the key is computed from the content of the
/// file. Writes go through a write-then-rename so a concurrent or repeated
/// write can never leave a partial file at the final path.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
#[debug("Disk(root = {})", self.root.display())]
#[display("{}", root.display())]
pub struct Disk {
    root: PathBuf,
}

impl Disk {
    /// The default buffer size to use for reading and writing.
    ///
    /// We use a relatively large buffer size because:
    /// - We assume we're typically reading/writing relatively large blobs (in
    ///   the megabytes) mostly backed by network transfers.
    /// - The `Blake3` hash implementation benefits from SIMD instructions if we
    ///   feed it larger chunks.
    const DEFAULT_BUF_SIZE: usize = 64 * 1024;

    /// Create a new instance in the provided directory.
    ///
    /// If the directory does not already exist, it is created when the first
    /// file is written to the store.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create a new instance in a temporary directory.
    #[cfg(test)]
    pub async fn new_temp() -> Result<(Self, tempfile::TempDir)> {
        let root = tempfile::tempdir().context("create temp directory")?;
        Ok((Self::new(root.path()), root))
    }

    /// Validate that the store is accessible and writable.
    #[tracing::instrument(name = "Disk::ping")]
    pub async fn ping(&self) -> Result<()> {
        static PING_KEY: LazyLock<ArtifactId> =
            LazyLock::new(|| ArtifactId::from_blake3(blake3::hash(b"ping")));
        const PING_CONTENT: &[u8] = b"ping";

        self.write_buffered(&PING_KEY, PING_CONTENT).await?;
        let content = self.read_buffered(&PING_KEY).await?;
        if content != PING_CONTENT {
            bail!(
                "ping artifact store failed; unexpected content: {}",
                String::from_utf8_lossy(&content)
            );
        }

        Ok(())
    }

    /// Get the path to the file for the given key.
    ///
    /// Note: this is a method on `Disk` rather than on `ArtifactId` because in
    /// the future we may add other kinds of storage implementations, and this
    /// is unique to the `Disk` implementation.
    fn key_path(&self, key: &ArtifactId) -> PathBuf {
        // Two-level prefixes keep folder sizes relatively small, since huge
        // folders containing millions of files can have performance issues
        // depending on the filesystem.
        let hex = key.to_hex();
        let prefix1 = hex.chars().take(2).collect::<String>();
        let prefix2 = hex.chars().skip(2).take(2).collect::<String>();
        self.root.join(prefix1).join(prefix2).join(&hex)
    }

    /// Check if a blob exists in storage.
    ///
    /// Returns `Ok(true)` if the key exists, `Ok(false)` if it does not exist,
    /// and `Err` if there was an error checking (e.g., permission denied).
    #[tracing::instrument(name = "Disk::exists")]
    pub async fn exists(&self, key: &ArtifactId) -> Result<bool> {
        let path = self.key_path(key);
        match metadata(&path).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).context(format!("check if blob exists at {path:?}")),
        }
    }

    /// Get the uncompressed size of the content for the provided key.
    #[tracing::instrument(name = "Disk::size")]
    pub async fn size(&self, key: &ArtifactId) -> Result<Option<u64>> {
        let path = self.key_path(key);
        let size_path = path.with_extension("size");
        match tokio::fs::read(&size_path).await {
            Ok(bytes) => match bytes.try_into().map(u64::from_be_bytes) {
                Ok(size) => Ok(Some(size)),
                Err(buf) => bail!("invalid big-endian u64: {buf:?}"),
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error).context(format!("read size of blob at {path:?}")),
        }
    }

    /// Read the content from storage for the provided key.
    ///
    /// Note: the returned reader is buffered with the capacity of
    /// [`Disk::DEFAULT_BUF_SIZE`]; callers should probably not buffer further.
    #[tracing::instrument(name = "Disk::read")]
    pub async fn read(&self, key: &ArtifactId) -> Result<impl AsyncRead + Unpin + 'static> {
        let path = self.key_path(key);
        File::open(&path)
            .await
            .map(BufReader::new)
            .map(ZstdDecoder::new)
            .map(|reader| BufReader::with_capacity(Self::DEFAULT_BUF_SIZE, reader))
            .with_context(|| format!("open blob file {path:?}"))
    }

    /// Write the content to storage for the provided key.
    ///
    /// This method does NOT check if the key already exists first; callers
    /// should check via `exists()` if they want to avoid unnecessary work.
    /// The AlreadyExists case is handled gracefully during the final rename.
    #[tracing::instrument(name = "Disk::write", skip(content))]
    pub async fn write(&self, key: &ArtifactId, content: impl AsyncRead + Unpin) -> Result<()> {
        let path = self.key_path(key);

        if let Some(parent) = path.parent() {
            create_dir_all(parent)
                .await
                .with_context(|| format!("create parent directory {parent:?} for {path:?}"))?;
        }

        let mut content = BufReader::with_capacity(Self::DEFAULT_BUF_SIZE, content);

        // Write to a temp file first and rename atomically: the final path is
        // assumed immutable once it exists, and other writers of the same key
        // may be racing us.
        let temp = temp_path(&path);
        let file = File::create(&temp).await.context("create temporary file")?;
        let mut encoder = ZstdEncoder::with_quality(file, Level::Default);

        let (hash, size) = hashed_copy(&mut content, &mut encoder)
            .await
            .with_context(|| format!("write content to {temp:?}"))?;

        encoder.shutdown().await.context("flush zstd encoder")?;
        let mut file = encoder.into_inner();
        file.flush().await.context("flush file")?;
        drop(file);

        if key != &hash {
            if let Err(err) = remove_file(&temp).await {
                warn!("failed to remove temp file {temp:?}: {err}");
            }
            bail!("hash mismatch: {hash:?} != {key:?}");
        }

        match rename(&temp, &path).await {
            Ok(()) => self
                .write_size(key, size)
                .await
                .with_context(|| format!("write size for {key:?}")),
            Err(err) => {
                if let Err(err) = remove_file(&temp).await {
                    warn!("failed to remove temp file {temp:?}: {err}");
                }
                if err.kind() == std::io::ErrorKind::AlreadyExists {
                    Ok(())
                } else {
                    Err(err).context(format!("rename {temp:?} to {path:?}"))
                }
            }
        }
    }

    /// Best-effort: write the size of the content for the provided key.
    ///
    /// Since files are stored compressed, `size()` needs a side-channel to
    /// report the uncompressed size without decompressing.
    #[tracing::instrument]
    async fn write_size(&self, key: &ArtifactId, size: u64) -> Result<()> {
        let path = self.key_path(key);
        let size_path = path.with_extension("size");
        tokio::fs::write(&size_path, &size.to_be_bytes())
            .await
            .with_context(|| format!("write size file at {size_path:?}"))
    }

    /// Read and buffer the entire content from storage.
    async fn read_buffered(&self, key: &ArtifactId) -> Result<Vec<u8>> {
        let mut content = self.read(key).await?;
        let mut buffer = Vec::new();
        tokio::io::copy(&mut content, &mut buffer)
            .await
            .context("read decompressed blob content")?;
        Ok(buffer)
    }

    /// Write buffered content to storage.
    async fn write_buffered(&self, key: &ArtifactId, content: impl AsRef<[u8]>) -> Result<()> {
        let cursor = Cursor::new(content.as_ref());
        self.write(key, cursor).await
    }
}

/// Generate a temporary file path in the same directory as the target, so the
/// final rename never crosses filesystems.
fn temp_path(target: &Path) -> PathBuf {
    let mut temp = target.as_os_str().to_owned();
    temp.push(".tmp.");
    temp.push(Uuid::new_v4().to_string());
    PathBuf::from(temp)
}

/// Copy the content from the source reader into the target writer while
/// computing the hash of the copied content.
///
/// Returns the hash of the content and the number of bytes copied.
async fn hashed_copy(
    mut source: impl AsyncRead + Unpin,
    mut target: impl AsyncWrite + Unpin,
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
    use super::Disk;
    use color_eyre::Result;
    use polybuild_wire::artifact::ArtifactId;
    use pretty_assertions::assert_eq as pretty_assert_eq;
    use simple_test_case::test_case;
    use std::io::Cursor;

    fn key_for(input: &[u8]) -> ArtifactId {
        ArtifactId::from_blake3(blake3::hash(input))
    }

    #[test_case(Vec::from(b"hello world\n"); "short input")]
    #[test_case(Vec::from(b"hello world\n").repeat(10000); "long input")]
    #[test_case(Vec::new(); "empty input")]
    #[test_log::test(tokio::test)]
    async fn hashed_copy(input: Vec<u8>) -> Result<()> {
        let _ = color_eyre::install();

        let mut output = Vec::new();
        let (hash, _) = super::hashed_copy(Cursor::new(&input), &mut output).await?;

        pretty_assert_eq!(
            hex::encode(&input),
            hex::encode(output),
            "copies content faithfully"
        );

        let expected_hash = blake3::hash(&input);
        pretty_assert_eq!(hash, expected_hash, "computes the correct hash");

        Ok(())
    }

    #[test_case(b"hello".to_vec(); "short content")]
    #[test_case(b"x".repeat(200_000); "content larger than the copy buffer")]
    #[test_log::test(tokio::test)]
    async fn write_read_roundtrip(content: Vec<u8>) -> Result<()> {
        let _ = color_eyre::install();

        let (storage, _temp) = Disk::new_temp().await?;

        let key = key_for(&content);
        storage.write_buffered(&key, &content).await?;
        pretty_assert_eq!(storage.exists(&key).await?, true);

        let read_content = storage.read_buffered(&key).await?;
        pretty_assert_eq!(read_content, content);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn write_idempotent() -> Result<()> {
        let _ = color_eyre::install();

        let (storage, _temp) = Disk::new_temp().await?;

        let content = b"write twice";
        let key = key_for(content);
        storage.write_buffered(&key, content).await?;
        storage.write_buffered(&key, content).await?;

        let read_content = storage.read_buffered(&key).await?;
        pretty_assert_eq!(read_content, content);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn write_concurrent() -> Result<()> {
        let _ = color_eyre::install();

        let (storage, _temp) = Disk::new_temp().await?;

        let content = b"racing writers";
        let key = key_for(content);
        tokio::try_join!(
            storage.write_buffered(&key, content),
            storage.write_buffered(&key, content)
        )?;

        let read_content = storage.read_buffered(&key).await?;
        pretty_assert_eq!(read_content, content);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn nonexistent() -> Result<()> {
        let _ = color_eyre::install();

        let (storage, _temp) = Disk::new_temp().await?;
        let key = key_for(b"nonexistent");

        assert!(!storage.exists(&key).await?);
        assert!(storage.read_buffered(&key).await.is_err());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn size_returns_uncompressed_size() -> Result<()> {
        let _ = color_eyre::install();

        let (storage, _temp) = Disk::new_temp().await?;

        let content = b"some content to size";
        let key = key_for(content);
        storage.write_buffered(&key, content).await?;

        let size = storage.size(&key).await?;
        pretty_assert_eq!(
            size,
            Some(content.len() as u64),
            "size() returns uncompressed size"
        );

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn size_nonexistent() -> Result<()> {
        let _ = color_eyre::install();

        let (storage, _temp) = Disk::new_temp().await?;

        let key = key_for(b"never written");
        let size = storage.size(&key).await?;
        pretty_assert_eq!(size, None, "size() returns None for nonexistent blob");

        Ok(())
    }
}
