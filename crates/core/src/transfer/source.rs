//! Random-access upload payloads

use crate::error::{Error, Result};
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Payload of an upload.
///
/// Parts read their own slice when they are admitted, so a file source never
/// holds more than the in-flight parts in memory.
#[derive(Debug, Clone)]
pub enum UploadSource {
    Bytes(Bytes),
    File { path: PathBuf, len: u64 },
}

impl UploadSource {
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        UploadSource::Bytes(data.into())
    }

    /// File source sized from the file's current metadata
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(Error::InvalidInput(format!("{} is not a file", path.display())));
        }
        Ok(UploadSource::File {
            path: path.to_path_buf(),
            len: metadata.len(),
        })
    }

    pub fn len(&self) -> u64 {
        match self {
            UploadSource::Bytes(data) => data.len() as u64,
            UploadSource::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read `len` bytes starting at `offset`
    pub async fn read_range(&self, offset: u64, len: u64) -> Result<Bytes> {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= self.len())
            .ok_or_else(|| {
                Error::InvalidInput(format!(
                    "range {}+{} is outside a {} byte source",
                    offset,
                    len,
                    self.len()
                ))
            })?;

        match self {
            UploadSource::Bytes(data) => Ok(data.slice(offset as usize..end as usize)),
            UploadSource::File { path, .. } => {
                let mut file = File::open(path).await?;
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; len as usize];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}
