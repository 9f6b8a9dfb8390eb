//! Progress reporting for uploads and downloads

use std::sync::{Arc, Mutex};

/// Cumulative progress of one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes_transferred: u64,
    pub total_bytes: u64,
}

impl TransferProgress {
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        (self.bytes_transferred as f64 / self.total_bytes as f64) * 100.0
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_transferred >= self.total_bytes
    }
}

/// Receives progress updates; calls for one transfer never overlap and the
/// reported byte count never decreases
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: TransferProgress);
}

impl<F> ProgressSink for F
where
    F: Fn(TransferProgress) + Send + Sync,
{
    fn on_progress(&self, progress: TransferProgress) {
        self(progress)
    }
}

/// Serializes part completions into ordered cumulative updates
pub(crate) struct ProgressTracker {
    sink: Option<Arc<dyn ProgressSink>>,
    total_bytes: u64,
    transferred: Mutex<u64>,
}

impl ProgressTracker {
    pub(crate) fn new(sink: Option<Arc<dyn ProgressSink>>, total_bytes: u64) -> Self {
        Self {
            sink,
            total_bytes,
            transferred: Mutex::new(0),
        }
    }

    /// Add `bytes` and notify the sink while still holding the counter
    pub(crate) fn advance(&self, bytes: u64) {
        let mut transferred = self
            .transferred
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *transferred += bytes;
        if let Some(sink) = &self.sink {
            sink.on_progress(TransferProgress {
                bytes_transferred: *transferred,
                total_bytes: self.total_bytes,
            });
        }
    }

    #[cfg(test)]
    pub(crate) fn transferred(&self) -> u64 {
        *self
            .transferred
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
