use crate::types::BlobHash;
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::path::PathBuf;

/// Content-addressed storage for captured step output
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Store a blob and return its content hash
    async fn put(&self, data: Bytes) -> Result<BlobHash>;

    /// Retrieve a blob by its content hash
    async fn get(&self, hash: &BlobHash) -> Result<Option<Bytes>>;
}

/// Blobs as gzip files under `<base>/<first two hex chars>/<hash>.gz`.
///
/// Loader output is mostly repeated log lines, so it compresses well. The
/// hash is taken over the uncompressed bytes and checked again on read.
#[derive(Clone)]
pub struct FilesystemBlobStore {
    base_path: PathBuf,
}

impl FilesystemBlobStore {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path)
            .context("Failed to create blob store directory")?;
        Ok(Self { base_path })
    }

    fn blob_path(&self, hash: &BlobHash) -> PathBuf {
        let fan_out = hash.0.get(..2).unwrap_or(&hash.0);
        self.base_path.join(fan_out).join(format!("{}.gz", hash))
    }
}

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("Failed to compress blob")?;
    encoder.finish().context("Failed to finish blob compression")
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .context("Failed to decompress blob")?;
    Ok(out)
}

#[async_trait::async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn put(&self, data: Bytes) -> Result<BlobHash> {
        let hash = BlobHash::from_bytes(&data);
        let path = self.blob_path(&hash);

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(hash);
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create blob directory")?;
        }

        // Steps running side by side may store the same output; each writes
        // its own temp file and the rename settles it
        let staging = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&staging, compress(&data)?)
            .await
            .context("Failed to write blob")?;
        tokio::fs::rename(&staging, &path)
            .await
            .context("Failed to move blob into place")?;

        Ok(hash)
    }

    async fn get(&self, hash: &BlobHash) -> Result<Option<Bytes>> {
        let compressed = match tokio::fs::read(self.blob_path(hash)).await {
            Ok(compressed) => compressed,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("Failed to read blob"),
        };

        let data = decompress(&compressed)?;
        if BlobHash::from_bytes(&data) != *hash {
            return Err(anyhow!("Blob {} does not match its hash", hash));
        }

        Ok(Some(Bytes::from(data)))
    }
}
