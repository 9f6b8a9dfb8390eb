//! Chunked, concurrent, integrity-checked uploads and downloads.
//!
//! Payloads at or below the cutoff go up or down in one request. Larger
//! payloads are split into parts (uploads) or byte ranges (downloads) that run
//! concurrently, each through the shared [`ResiliencePipeline`]. Every part is
//! SHA-1 checked; a mismatch counts as a retryable integrity failure.

mod download;
mod progress;
mod session;
mod sink;
mod source;
mod upload;

pub use progress::{ProgressSink, TransferProgress};
pub use session::{
    effective_part_size, plan_parts, plan_ranges, PartDescriptor, PartStatus, SessionState,
    TransferSession,
};
pub use sink::{DownloadSink, FileSink, MemorySink};
pub use source::UploadSource;

use crate::cache::EphemeralCache;
use crate::config::TransferConfig;
use crate::error::{Error, ErrorKind};
use crate::pipeline::ResiliencePipeline;
use crate::remote::StorageApi;
use crate::types::{UploadCredential, AUTO_CONTENT_TYPE};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Lifetime of a session-scoped part credential; it is dropped when the
/// session ends anyway
const PART_CREDENTIAL_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Key of a cached upload credential
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CredentialKey {
    /// Upload URL for single-shot uploads into a bucket
    Bucket(String),
    /// Part upload URL of one large-file session
    LargeFile(String),
}

/// Per-upload options
#[derive(Clone, Default)]
pub struct UploadOptions {
    /// Defaults to letting the service pick a type from the file name
    pub content_type: Option<String>,
    /// Extra `X-Bz-Info-*` entries
    pub file_info: HashMap<String, String>,
    /// Stored as `src_last_modified_millis`
    pub last_modified_millis: Option<i64>,
    /// Hash the whole payload before a chunked upload and store it as `large_file_sha1`
    pub large_file_sha1: bool,
    pub progress: Option<Arc<dyn ProgressSink>>,
}

impl std::fmt::Debug for UploadOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadOptions")
            .field("content_type", &self.content_type)
            .field("file_info", &self.file_info)
            .field("last_modified_millis", &self.last_modified_millis)
            .field("large_file_sha1", &self.large_file_sha1)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl UploadOptions {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_last_modified_millis(mut self, millis: i64) -> Self {
        self.last_modified_millis = Some(millis);
        self
    }

    pub(crate) fn content_type(&self) -> String {
        self.content_type
            .clone()
            .unwrap_or_else(|| AUTO_CONTENT_TYPE.to_string())
    }

    pub(crate) fn file_info(&self) -> HashMap<String, String> {
        let mut info = self.file_info.clone();
        if let Some(millis) = self.last_modified_millis {
            info.insert(
                crate::types::SRC_LAST_MODIFIED_MILLIS.to_string(),
                millis.to_string(),
            );
        }
        info
    }
}

/// Drives uploads and downloads against a [`StorageApi`]
pub struct TransferEngine {
    api: Arc<dyn StorageApi>,
    pipeline: Arc<ResiliencePipeline>,
    credentials: Arc<EphemeralCache<CredentialKey, UploadCredential>>,
    config: TransferConfig,
    upload_url_ttl: Duration,
    cancel_timeout: Duration,
}

impl TransferEngine {
    pub fn new(
        api: Arc<dyn StorageApi>,
        pipeline: Arc<ResiliencePipeline>,
        credentials: Arc<EphemeralCache<CredentialKey, UploadCredential>>,
        config: TransferConfig,
        upload_url_ttl: Duration,
        cancel_timeout: Duration,
    ) -> Self {
        Self {
            api,
            pipeline,
            credentials,
            config,
            upload_url_ttl,
            cancel_timeout,
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    fn forget_credential(&self, key: &CredentialKey, err: &Error) {
        forget_credential(&self.credentials, key, err);
    }

    /// Owned handles for a part transfer running on its own task
    fn part_context(&self, cancel: &CancellationToken) -> PartContext {
        PartContext {
            api: Arc::clone(&self.api),
            pipeline: Arc::clone(&self.pipeline),
            credentials: Arc::clone(&self.credentials),
            cancel: cancel.clone(),
        }
    }
}

struct PartContext {
    api: Arc<dyn StorageApi>,
    pipeline: Arc<ResiliencePipeline>,
    credentials: Arc<EphemeralCache<CredentialKey, UploadCredential>>,
    cancel: CancellationToken,
}

/// Drop a cached credential after the service rejected it
fn forget_credential(
    credentials: &EphemeralCache<CredentialKey, UploadCredential>,
    key: &CredentialKey,
    err: &Error,
) {
    if matches!(
        err.kind(),
        ErrorKind::Authentication | ErrorKind::TransientNetwork
    ) {
        credentials.invalidate(key);
    }
}
