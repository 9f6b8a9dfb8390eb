//! Large-file session bookkeeping and part planning

use crate::config::MAX_PART_COUNT;
use crate::error::{Error, Result};
use crate::types::ByteRange;

/// Lifecycle of a large-file upload session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Server session allocated, parts not yet started
    Started,
    /// Parts in flight
    Uploading,
    /// Finish call in progress
    Finalizing,
    Finished,
    /// Ended by the caller's cancellation token
    Cancelled,
    /// Ended by an error; the remote session was cancelled best-effort
    Failed,
}

/// Upload state of one part
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartStatus {
    Pending,
    InFlight,
    /// Acknowledged with the given SHA-1
    Done(String),
    Failed,
}

/// A contiguous slice of the payload uploaded as one part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartDescriptor {
    /// 1-based
    pub number: u32,
    pub offset: u64,
    pub length: u64,
    pub status: PartStatus,
}

/// Part size for a payload: at least `configured`, at least `minimum`, and
/// large enough to keep the part count at or below [`MAX_PART_COUNT`]
pub fn effective_part_size(total: u64, configured: u64, minimum: u64) -> u64 {
    let floor = total.div_ceil(MAX_PART_COUNT);
    configured.max(minimum).max(floor).max(1)
}

/// Split `total` bytes into parts of `part_size`; the last part takes the remainder
pub fn plan_parts(total: u64, part_size: u64) -> Result<Vec<PartDescriptor>> {
    if part_size == 0 {
        return Err(Error::InvalidInput("part size must be greater than zero".to_string()));
    }
    let count = total.div_ceil(part_size);
    if count > MAX_PART_COUNT {
        return Err(Error::InvalidInput(format!(
            "{} bytes in parts of {} needs {} parts, more than {}",
            total, part_size, count, MAX_PART_COUNT
        )));
    }

    Ok((0..count)
        .map(|i| {
            let offset = i * part_size;
            PartDescriptor {
                number: i as u32 + 1,
                offset,
                length: part_size.min(total - offset),
                status: PartStatus::Pending,
            }
        })
        .collect())
}

/// Split `total` bytes into inclusive download ranges of `part_size`
pub fn plan_ranges(total: u64, part_size: u64) -> Vec<ByteRange> {
    let part_size = part_size.max(1);
    (0..total.div_ceil(part_size))
        .map(|i| {
            let start = i * part_size;
            ByteRange::new(start, part_size.min(total - start))
        })
        .collect()
}

/// One in-progress large-file upload
#[derive(Debug, Clone)]
pub struct TransferSession {
    pub file_id: String,
    pub bucket_id: String,
    pub file_name: String,
    pub total_size: u64,
    pub part_size: u64,
    pub state: SessionState,
    pub parts: Vec<PartDescriptor>,
}

impl TransferSession {
    pub fn new(
        file_id: impl Into<String>,
        bucket_id: impl Into<String>,
        file_name: impl Into<String>,
        total_size: u64,
        part_size: u64,
    ) -> Result<Self> {
        Ok(Self {
            file_id: file_id.into(),
            bucket_id: bucket_id.into(),
            file_name: file_name.into(),
            total_size,
            part_size,
            state: SessionState::Started,
            parts: plan_parts(total_size, part_size)?,
        })
    }

    pub fn mark_in_flight(&mut self, number: u32) {
        self.set_status(number, PartStatus::InFlight);
    }

    pub fn mark_done(&mut self, number: u32, content_sha1: String) {
        self.set_status(number, PartStatus::Done(content_sha1));
    }

    pub fn mark_failed(&mut self, number: u32) {
        self.set_status(number, PartStatus::Failed);
    }

    /// Acknowledged parts keep their status
    fn set_status(&mut self, number: u32, status: PartStatus) {
        if let Some(part) = self
            .parts
            .iter_mut()
            .find(|p| p.number == number && !matches!(p.status, PartStatus::Done(_)))
        {
            part.status = status;
        }
    }

    pub fn completed_parts(&self) -> usize {
        self.parts
            .iter()
            .filter(|p| matches!(p.status, PartStatus::Done(_)))
            .count()
    }

    /// SHA-1s ordered by part number.
    ///
    /// Fails unless parts 1..=N are all acknowledged and their lengths add up
    /// to the payload size.
    pub fn ordered_checksums(&self) -> Result<Vec<String>> {
        let mut parts: Vec<&PartDescriptor> = self.parts.iter().collect();
        parts.sort_by_key(|p| p.number);

        let mut checksums = Vec::with_capacity(parts.len());
        let mut covered = 0u64;
        for (index, part) in parts.iter().enumerate() {
            if part.number as usize != index + 1 || part.offset != covered {
                return Err(Error::Integrity(format!(
                    "part {} is out of sequence in large file {}",
                    part.number, self.file_id
                )));
            }
            match &part.status {
                PartStatus::Done(sha1) => checksums.push(sha1.clone()),
                status => {
                    return Err(Error::Integrity(format!(
                        "part {} of large file {} is {:?}",
                        part.number, self.file_id, status
                    )))
                }
            }
            covered += part.length;
        }

        if covered != self.total_size {
            return Err(Error::Integrity(format!(
                "parts cover {} of {} bytes",
                covered, self.total_size
            )));
        }
        Ok(checksums)
    }
}
