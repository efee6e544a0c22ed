//! Content-addressed payload blob store: `<root>/<XX>/<YYYY…>/<hash>[.ext]`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

/// Optional payload compression applied before writing a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadCompression {
    /// Store payloads uncompressed.
    #[default]
    None,
    /// Gzip (via `flate2`).
    Gzip,
    /// LZ4 frame format (via `lz4_flex`).
    Lz4,
    /// Zstandard (via `zstd`).
    Zstd,
}

impl PayloadCompression {
    fn extension(self) -> &'static str {
        match self {
            PayloadCompression::None => "",
            PayloadCompression::Gzip => ".gz",
            PayloadCompression::Lz4 => ".lz4",
            PayloadCompression::Zstd => ".zst",
        }
    }

    fn compress(self, payload: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            PayloadCompression::None => Ok(payload.to_vec()),
            PayloadCompression::Gzip => {
                use flate2::Compression;
                use flate2::write::GzEncoder;
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                std::io::Write::write_all(&mut encoder, payload)?;
                encoder.finish()
            }
            PayloadCompression::Lz4 => Ok(lz4_flex::compress_prepend_size(payload)),
            PayloadCompression::Zstd => zstd::encode_all(payload, 0),
        }
    }
}

/// Default grace period before an orphaned blob (written but never
/// referenced by a metadata row) is eligible for reaping.
pub const ORPHAN_GRACE_PERIOD: Duration = Duration::from_secs(3600);

/// A content-addressed file tree under `root`.
pub struct BlobStore {
    root: PathBuf,
    compression: PayloadCompression,
}

impl BlobStore {
    /// Builds a blob store rooted at `root`, compressing new writes with
    /// `compression`. `root` is created if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if `root` cannot be created.
    pub async fn new(root: PathBuf, compression: PayloadCompression) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root, compression })
    }

    fn hash_hex(payload: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(payload);
        let digest = hasher.finalize();
        hex_encode(&digest)
    }

    fn shard_path(&self, hash_hex: &str) -> PathBuf {
        let (a, rest) = hash_hex.split_at(2);
        let (b, _) = rest.split_at(2);
        self.root.join(a).join(b)
    }

    fn blob_path(&self, hash_hex: &str) -> PathBuf {
        self.shard_path(hash_hex)
            .join(format!("{hash_hex}{}", self.compression.extension()))
    }

    /// Writes `payload`, returning its content-address (`sha256(payload)` in
    /// hex) to be stored as `payload_ref`. A write whose target already
    /// exists is skipped — identical payloads deduplicate naturally.
    ///
    /// # Errors
    ///
    /// Returns an error if the shard directory cannot be created or the
    /// temp-write-then-rename sequence fails.
    pub async fn write(&self, payload: &[u8]) -> std::io::Result<String> {
        let hash_hex = Self::hash_hex(payload);
        let final_path = self.blob_path(&hash_hex);
        if tokio::fs::try_exists(&final_path).await? {
            return Ok(hash_hex);
        }

        let shard_dir = self.shard_path(&hash_hex);
        tokio::fs::create_dir_all(&shard_dir).await?;

        let compressed = self.compression.compress(payload)?;
        let temp_path = shard_dir.join(format!(".{hash_hex}.tmp-{}", std::process::id()));
        {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            file.write_all(&compressed).await?;
            file.flush().await?;
            file.sync_all().await?;
        }
        match tokio::fs::rename(&temp_path, &final_path).await {
            Ok(()) => Ok(hash_hex),
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                if tokio::fs::try_exists(&final_path).await? {
                    Ok(hash_hex)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Reads and decompresses the blob for `hash_hex`.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is missing or cannot be decompressed.
    pub async fn read(&self, hash_hex: &str) -> std::io::Result<Vec<u8>> {
        let path = self.blob_path(hash_hex);
        let compressed = tokio::fs::read(&path).await?;
        match self.compression {
            PayloadCompression::None => Ok(compressed),
            PayloadCompression::Gzip => {
                use flate2::read::GzDecoder;
                use std::io::Read;
                let mut decoder = GzDecoder::new(compressed.as_slice());
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }
            PayloadCompression::Lz4 => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            PayloadCompression::Zstd => zstd::decode_all(compressed.as_slice()),
        }
    }

    /// Walks the blob tree and removes any blob whose hash is not present in
    /// `live_refs` and whose mtime is older than [`ORPHAN_GRACE_PERIOD`].
    ///
    /// # Errors
    ///
    /// Returns an error if the directory tree cannot be walked.
    pub async fn reap_orphans(&self, live_refs: &HashSet<String>) -> std::io::Result<u64> {
        let root = self.root.clone();
        let live_refs = live_refs.clone();
        tokio::task::spawn_blocking(move || reap_orphans_blocking(&root, &live_refs))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
    }
}

fn reap_orphans_blocking(root: &Path, live_refs: &HashSet<String>) -> std::io::Result<u64> {
    let mut removed = 0u64;
    if !root.exists() {
        return Ok(0);
    }
    for shard_a in std::fs::read_dir(root)? {
        let shard_a = shard_a?;
        if !shard_a.file_type()?.is_dir() {
            continue;
        }
        for shard_b in std::fs::read_dir(shard_a.path())? {
            let shard_b = shard_b?;
            if !shard_b.file_type()?.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(shard_b.path())? {
                let entry = entry?;
                let file_name = entry.file_name();
                let name = file_name.to_string_lossy();
                let hash_hex = name.split('.').next().unwrap_or(&name);
                if live_refs.contains(hash_hex) {
                    continue;
                }
                let metadata = entry.metadata()?;
                let age = metadata
                    .modified()?
                    .elapsed()
                    .unwrap_or(Duration::ZERO);
                if age >= ORPHAN_GRACE_PERIOD {
                    std::fs::remove_file(entry.path())?;
                    removed += 1;
                }
            }
        }
    }
    Ok(removed)
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{byte:02x}").expect("writing to a String never fails");
    }
    out
}
