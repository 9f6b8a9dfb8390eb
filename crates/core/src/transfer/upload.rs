use super::progress::ProgressTracker;
use super::session::{effective_part_size, SessionState, TransferSession};
use super::source::UploadSource;
use super::{
    forget_credential, CredentialKey, PartContext, TransferEngine, UploadOptions,
    PART_CREDENTIAL_TTL,
};
use crate::checksum::{sha1_hex, sha1_hex_blocking, verify_sha1, Sha1Accumulator};
use crate::error::{Error, Result};
use crate::pipeline::OperationClass;
use crate::types::{FileVersion, StartLargeFileRequest, UploadFileRequest, LARGE_FILE_SHA1};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

impl TransferEngine {
    /// Upload `source` as `file_name` into `bucket_id`.
    ///
    /// Payloads up to `upload_cutoff_size` go up in one request; anything
    /// larger becomes a large-file session whose parts upload concurrently.
    /// A failed or cancelled large upload cancels its session before the
    /// error is returned.
    pub async fn upload(
        &self,
        bucket_id: &str,
        file_name: &str,
        source: &UploadSource,
        options: &UploadOptions,
        cancel: &CancellationToken,
    ) -> Result<FileVersion> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let size = source.len();
        let tracker = Arc::new(ProgressTracker::new(options.progress.clone(), size));
        if size <= self.config.upload_cutoff_size {
            self.upload_single(bucket_id, file_name, source, options, &tracker, cancel)
                .await
        } else {
            self.upload_large(bucket_id, file_name, source, options, &tracker, cancel)
                .await
        }
    }

    async fn upload_single(
        &self,
        bucket_id: &str,
        file_name: &str,
        source: &UploadSource,
        options: &UploadOptions,
        tracker: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<FileVersion> {
        let size = source.len();
        let data = source.read_range(0, size).await?;
        let request = UploadFileRequest {
            file_name: file_name.to_string(),
            content_type: options.content_type(),
            content_length: size,
            content_sha1: sha1_hex(&data),
            file_info: options.file_info(),
        };
        debug!(bucket_id, file_name, size, "single-shot upload");

        let key = CredentialKey::Bucket(bucket_id.to_string());
        let key = &key;
        let request = &request;
        let data = &data;
        let version = self
            .pipeline
            .execute(OperationClass::Upload, cancel, || async move {
                let credential = self
                    .credentials
                    .get_or_fetch(key, self.upload_url_ttl, || self.api.get_upload_url(bucket_id))
                    .await?;

                let version = self
                    .api
                    .upload_file(&credential, request, data.clone())
                    .await
                    .inspect_err(|err| self.forget_credential(key, err))?;

                if let Some(stored) = version.whole_object_sha1() {
                    verify_sha1(file_name, &request.content_sha1, stored)?;
                }
                Ok(version)
            })
            .await?;

        tracker.advance(size);
        info!(bucket_id, file_name, size, "upload complete");
        Ok(version)
    }

    async fn upload_large(
        &self,
        bucket_id: &str,
        file_name: &str,
        source: &UploadSource,
        options: &UploadOptions,
        tracker: &Arc<ProgressTracker>,
        cancel: &CancellationToken,
    ) -> Result<FileVersion> {
        let size = source.len();
        let part_size = effective_part_size(
            size,
            self.config.upload_part_size,
            self.config.minimum_part_size,
        );

        let mut file_info = options.file_info();
        if options.large_file_sha1 {
            file_info.insert(
                LARGE_FILE_SHA1.to_string(),
                whole_source_sha1(source, part_size).await?,
            );
        }
        let request = StartLargeFileRequest {
            bucket_id: bucket_id.to_string(),
            file_name: file_name.to_string(),
            content_type: options.content_type(),
            file_info,
        };

        let started = self
            .pipeline
            .execute(OperationClass::Generic, cancel, || {
                self.api.start_large_file(&request)
            })
            .await?;
        let file_id = started
            .file_id
            .ok_or_else(|| Error::Other("start_large_file returned no file id".to_string()))?;

        let session = TransferSession::new(&file_id, bucket_id, file_name, size, part_size);
        let mut session = match session {
            Ok(session) => session,
            Err(err) => {
                self.abandon(&file_id).await;
                return Err(err);
            }
        };
        info!(
            file_id = %session.file_id,
            file_name,
            size,
            part_size,
            parts = session.parts.len(),
            "started large file"
        );

        match self.run_session(&mut session, source, tracker, cancel).await {
            Ok(version) => {
                session.state = SessionState::Finished;
                self.credentials
                    .invalidate(&CredentialKey::LargeFile(file_id.clone()));
                info!(file_id = %file_id, file_name, size, "large file finished");
                Ok(version)
            }
            Err(err) => {
                warn!(
                    file_id = %file_id,
                    completed = session.completed_parts(),
                    parts = session.parts.len(),
                    error = %err,
                    "large file upload failed, cancelling session"
                );
                self.abandon(&file_id).await;
                session.state = if err.is_cancelled() {
                    SessionState::Cancelled
                } else {
                    SessionState::Failed
                };
                Err(err)
            }
        }
    }

    /// Upload every part on its own task, then finish the session
    async fn run_session(
        &self,
        session: &mut TransferSession,
        source: &UploadSource,
        tracker: &Arc<ProgressTracker>,
        cancel: &CancellationToken,
    ) -> Result<FileVersion> {
        session.state = SessionState::Uploading;
        let file_id = session.file_id.clone();

        let parts: Vec<(u32, u64, u64)> = session
            .parts
            .iter()
            .map(|p| (p.number, p.offset, p.length))
            .collect();
        let mut tasks = JoinSet::new();
        for (number, offset, length) in parts {
            session.mark_in_flight(number);
            let ctx = self.part_context(cancel);
            let file_id = file_id.clone();
            let source = source.clone();
            let tracker = Arc::clone(tracker);
            tasks.spawn(async move {
                let result = upload_part(&ctx, &file_id, number, offset, length, &source).await;
                if result.is_ok() {
                    tracker.advance(length);
                    debug!(file_id = %file_id, part = number, bytes = length, "part uploaded");
                }
                (number, result)
            });
        }

        // Dropping the set on an early return aborts the remaining parts
        while let Some(joined) = tasks.join_next().await {
            let (number, result) = joined?;
            match result {
                Ok(sha1) => session.mark_done(number, sha1),
                Err(err) => {
                    session.mark_failed(number);
                    return Err(err);
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        session.state = SessionState::Finalizing;
        let checksums = session.ordered_checksums()?;
        let checksums = &checksums;
        let file_id = &file_id;
        self.pipeline
            .execute(OperationClass::Generic, cancel, || async move {
                self.api.finish_large_file(file_id, checksums).await
            })
            .await
    }

    /// Best-effort cancel of a large-file session, bounded by `cancel_timeout`
    async fn abandon(&self, file_id: &str) {
        // The caller's token may already be cancelled
        let cancel = CancellationToken::new();
        let attempt = self
            .pipeline
            .execute(OperationClass::Generic, &cancel, || {
                self.api.cancel_large_file(file_id)
            });

        match tokio::time::timeout(self.cancel_timeout, attempt).await {
            Ok(Ok(())) => info!(file_id, "cancelled large file"),
            Ok(Err(err)) => warn!(file_id, error = %err, "failed to cancel large file"),
            Err(_) => warn!(
                file_id,
                timeout_secs = self.cancel_timeout.as_secs(),
                "timed out cancelling large file"
            ),
        }
        self.credentials
            .invalidate(&CredentialKey::LargeFile(file_id.to_string()));
    }
}

/// Upload one part; its bytes are read and hashed only once a permit is held
async fn upload_part(
    ctx: &PartContext,
    file_id: &str,
    number: u32,
    offset: u64,
    length: u64,
    source: &UploadSource,
) -> Result<String> {
    let key = CredentialKey::LargeFile(file_id.to_string());
    let key = &key;

    ctx.pipeline
        .execute(OperationClass::Upload, &ctx.cancel, || async move {
            let data = source.read_range(offset, length).await?;
            let sha1 = sha1_hex_blocking(data.clone()).await?;
            let credential = ctx
                .credentials
                .get_or_fetch(key, PART_CREDENTIAL_TTL, || {
                    ctx.api.get_upload_part_url(file_id)
                })
                .await?;

            let ack = ctx
                .api
                .upload_part(&credential, number, &sha1, data)
                .await
                .inspect_err(|err| forget_credential(&ctx.credentials, key, err))?;

            if ack.part_number != number {
                return Err(Error::Integrity(format!(
                    "part {} acknowledged as part {}",
                    number, ack.part_number
                )));
            }
            verify_sha1(&format!("part {}", number), &sha1, &ack.content_sha1)?;
            Ok(sha1)
        })
        .await
}

async fn whole_source_sha1(source: &UploadSource, chunk: u64) -> Result<String> {
    let mut hasher = Sha1Accumulator::new();
    let mut offset = 0;
    while offset < source.len() {
        let len = chunk.min(source.len() - offset);
        hasher.update(&source.read_range(offset, len).await?);
        offset += len;
    }
    Ok(hasher.finish())
}
