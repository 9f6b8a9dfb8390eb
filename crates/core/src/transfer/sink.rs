//! Positioned-write destinations for downloads

use crate::checksum::Sha1Accumulator;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

/// Destination that accepts ranges in any order
#[async_trait]
pub trait DownloadSink: Send + Sync {
    /// Write `data` at byte `offset`
    async fn write_at(&self, offset: u64, data: Bytes) -> Result<()>;

    /// SHA-1 of everything written so far, read back in offset order
    async fn sha1_hex(&self) -> Result<String>;

    /// Called once after every range has been written
    async fn finish(&self, last_modified: Option<DateTime<Utc>>) -> Result<()>;
}

/// Sink that assembles the object in memory
#[derive(Default)]
pub struct MemorySink {
    buf: Mutex<Vec<u8>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(len: u64) -> Self {
        Self {
            buf: Mutex::new(Vec::with_capacity(len as usize)),
        }
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(
            self.buf
                .into_inner()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.buf.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl DownloadSink for MemorySink {
    async fn write_at(&self, offset: u64, data: Bytes) -> Result<()> {
        let mut buf = self.lock();
        let start = offset as usize;
        let end = start + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[start..end].copy_from_slice(&data);
        Ok(())
    }

    async fn sha1_hex(&self) -> Result<String> {
        Ok(crate::checksum::sha1_hex(&self.lock()))
    }

    async fn finish(&self, _last_modified: Option<DateTime<Utc>>) -> Result<()> {
        Ok(())
    }
}

/// Sink writing into a local file, preallocated to the object size
pub struct FileSink {
    path: PathBuf,
    file: AsyncMutex<File>,
}

impl FileSink {
    /// Create (or truncate) `path` and size it to `len` bytes
    pub async fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.set_len(len).await?;

        Ok(Self {
            path,
            file: AsyncMutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DownloadSink for FileSink {
    async fn write_at(&self, offset: u64, data: Bytes) -> Result<()> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&data).await?;
        Ok(())
    }

    async fn sha1_hex(&self) -> Result<String> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        file.seek(SeekFrom::Start(0)).await?;

        let mut hasher = Sha1Accumulator::new();
        let mut buf = vec![0u8; 1024 * 1024];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finish())
    }

    async fn finish(&self, last_modified: Option<DateTime<Utc>>) -> Result<()> {
        {
            let mut file = self.file.lock().await;
            file.flush().await?;
            file.sync_all().await?;
        }

        if let Some(modified) = last_modified {
            let mtime =
                FileTime::from_unix_time(modified.timestamp(), modified.timestamp_subsec_nanos());
            filetime::set_file_mtime(&self.path, mtime).map_err(|e| {
                Error::Other(format!(
                    "Failed to set modification time of {}: {}",
                    self.path.display(),
                    e
                ))
            })?;
            debug!(path = %self.path.display(), %modified, "restored modification time");
        }
        Ok(())
    }
}
