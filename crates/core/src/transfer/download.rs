use super::progress::{ProgressSink, ProgressTracker};
use super::session::plan_ranges;
use super::sink::DownloadSink;
use super::{PartContext, TransferEngine};
use crate::checksum::{sha1_hex_blocking, verify_sha1};
use crate::error::{Error, Result};
use crate::pipeline::OperationClass;
use crate::types::{ByteRange, FileVersion};
use bytes::Bytes;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

impl TransferEngine {
    /// Download `file_name` from `bucket_name` into `sink`.
    ///
    /// Objects up to `download_cutoff_size` are fetched in one request;
    /// larger ones as concurrent byte ranges written at their offsets. The
    /// whole-object SHA-1 is verified when the service knows it. The sink is
    /// finished with the uploader's recorded modification time.
    pub async fn download(
        &self,
        bucket_name: &str,
        file_name: &str,
        sink: &dyn DownloadSink,
        progress: Option<Arc<dyn ProgressSink>>,
        cancel: &CancellationToken,
    ) -> Result<FileVersion> {
        let info = self
            .pipeline
            .execute(OperationClass::Generic, cancel, || {
                self.api.head_file(bucket_name, file_name)
            })
            .await?;
        self.download_version(bucket_name, &info, sink, progress, cancel)
            .await?;
        Ok(info)
    }

    /// Download a version whose metadata is already known
    pub async fn download_version(
        &self,
        bucket_name: &str,
        info: &FileVersion,
        sink: &dyn DownloadSink,
        progress: Option<Arc<dyn ProgressSink>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let size = info.content_length;
        let tracker = ProgressTracker::new(progress, size);

        if size <= self.config.download_cutoff_size {
            self.download_single(bucket_name, info, sink, &tracker, cancel)
                .await?;
        } else {
            self.download_ranges(bucket_name, info, sink, &tracker, cancel)
                .await?;
        }

        sink.finish(info.last_modified()).await?;
        info!(bucket_name, file_name = %info.file_name, size, "download complete");
        Ok(())
    }

    async fn download_single(
        &self,
        bucket_name: &str,
        info: &FileVersion,
        sink: &dyn DownloadSink,
        tracker: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let size = info.content_length;
        let file_name = info.file_name.as_str();
        let expected = info.whole_object_sha1();

        let data = self
            .pipeline
            .execute(OperationClass::Download, cancel, || async move {
                let body = self.api.download_file(bucket_name, file_name, None).await?;
                check_length(file_name, size, &body.data)?;

                if let Some(expected) = expected.or(body.content_sha1.as_deref()) {
                    let actual = sha1_hex_blocking(body.data.clone()).await?;
                    verify_sha1(file_name, expected, &actual)?;
                }
                Ok(body.data)
            })
            .await?;

        sink.write_at(0, data).await?;
        tracker.advance(size);
        Ok(())
    }

    async fn download_ranges(
        &self,
        bucket_name: &str,
        info: &FileVersion,
        sink: &dyn DownloadSink,
        tracker: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let ranges = plan_ranges(info.content_length, self.config.download_part_size);
        debug!(
            file_name = %info.file_name,
            size = info.content_length,
            ranges = ranges.len(),
            "ranged download"
        );

        // Ranges are fetched and verified on their own tasks; writes land here
        let mut tasks = JoinSet::new();
        for range in ranges {
            let ctx = self.part_context(cancel);
            let bucket_name = bucket_name.to_string();
            let file_name = info.file_name.clone();
            tasks.spawn(async move {
                let data = download_range(&ctx, &bucket_name, &file_name, range).await?;
                Ok::<_, Error>((range, data))
            });
        }
        while let Some(joined) = tasks.join_next().await {
            let (range, data) = joined??;
            sink.write_at(range.start, data).await?;
            tracker.advance(range.len());
        }

        if let Some(expected) = info.whole_object_sha1() {
            let actual = sink.sha1_hex().await?;
            verify_sha1(&info.file_name, expected, &actual)?;
        }
        Ok(())
    }
}

/// Fetch one byte range, checking its length and any checksum the service sent
async fn download_range(
    ctx: &PartContext,
    bucket_name: &str,
    file_name: &str,
    range: ByteRange,
) -> Result<Bytes> {
    if ctx.cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    ctx.pipeline
        .execute(OperationClass::Download, &ctx.cancel, || async move {
            let body = ctx
                .api
                .download_file(bucket_name, file_name, Some(range))
                .await?;
            check_length(file_name, range.len(), &body.data)?;

            if let Some(expected) = body.content_sha1.as_deref() {
                let actual = sha1_hex_blocking(body.data.clone()).await?;
                verify_sha1(file_name, expected, &actual)?;
            }
            Ok(body.data)
        })
        .await
}

fn check_length(file_name: &str, expected: u64, data: &Bytes) -> Result<()> {
    if data.len() as u64 == expected {
        Ok(())
    } else {
        Err(Error::Integrity(format!(
            "{}: expected {} bytes, received {}",
            file_name,
            expected,
            data.len()
        )))
    }
}
