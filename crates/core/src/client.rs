//! B2 client: transfers, listings and object management behind one handle

use crate::b2::B2Api;
use crate::cache::EphemeralCache;
use crate::config::{validate_config, ConfigFile};
use crate::error::{Error, Result};
use crate::paginator::Paginator;
use crate::pipeline::{OperationClass, PoolLimits, ResiliencePipeline, RetryPolicy};
use crate::remote::{Authenticator, StorageApi};
use crate::transfer::{
    FileSink, MemorySink, ProgressSink, TransferEngine, UploadOptions, UploadSource,
};
use crate::transport::ReqwestTransport;
use crate::types::{Bucket, FileVersion, ListFilesRequest, Page};
use bytes::Bytes;
use futures::FutureExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Key of a cached listing page
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PageKey {
    versions: bool,
    request: ListFilesRequest,
}

/// B2 client for uploading, downloading and listing files
pub struct B2Client {
    api: Arc<dyn StorageApi>,
    pipeline: Arc<ResiliencePipeline>,
    engine: TransferEngine,
    pages: Arc<EphemeralCache<PageKey, Page<FileVersion>>>,
    list_page_ttl: Option<Duration>,
}

impl B2Client {
    /// Create a client from configuration and authorize the account
    pub async fn new(config: &ConfigFile) -> Result<Self> {
        validate_config(config)?;

        let timeout = config.advanced.clone().unwrap_or_default().timeout;
        let transport = Arc::new(ReqwestTransport::new(Duration::from_secs(timeout))?);
        let api = Arc::new(B2Api::new(transport, &config.account));

        let auth = api.authorize_account().await?;
        if config.transfer.minimum_part_size < auth.absolute_minimum_part_size {
            warn!(
                configured = config.transfer.minimum_part_size,
                required = auth.absolute_minimum_part_size,
                "minimum_part_size is below what the account accepts"
            );
        }

        Ok(Self::with_api(api.clone(), api, config))
    }

    /// Create a client over any API implementation
    pub fn with_api(
        api: Arc<dyn StorageApi>,
        authenticator: Arc<dyn Authenticator>,
        config: &ConfigFile,
    ) -> Self {
        let pipeline = Arc::new(ResiliencePipeline::new(
            PoolLimits::from_config(&config.transfer),
            RetryPolicy::from_config(&config.retry),
            authenticator,
        ));
        let engine = TransferEngine::new(
            Arc::clone(&api),
            Arc::clone(&pipeline),
            Arc::new(EphemeralCache::new()),
            config.transfer.clone(),
            config.cache.upload_url_ttl(),
            config.retry.cancel_timeout(),
        );

        Self {
            api,
            pipeline,
            engine,
            pages: Arc::new(EphemeralCache::new()),
            list_page_ttl: config.cache.list_page_ttl(),
        }
    }

    pub fn engine(&self) -> &TransferEngine {
        &self.engine
    }

    pub fn pipeline(&self) -> &Arc<ResiliencePipeline> {
        &self.pipeline
    }

    /// Upload a local file.
    ///
    /// The content type is guessed from the extension and the file's
    /// modification time is recorded unless `options` already set them.
    pub async fn upload_file(
        &self,
        bucket_id: &str,
        key: &str,
        file_path: &Path,
        mut options: UploadOptions,
        cancel: &CancellationToken,
    ) -> Result<FileVersion> {
        let source = UploadSource::from_file(file_path).await?;

        if options.content_type.is_none() {
            let guessed = mime_guess::from_path(file_path).first_or_octet_stream();
            options.content_type = Some(guessed.essence_str().to_string());
        }
        if options.last_modified_millis.is_none() {
            let metadata = tokio::fs::metadata(file_path).await?;
            options.last_modified_millis = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64);
        }

        info!(bucket_id, key, path = %file_path.display(), size = source.len(), "uploading file");
        self.engine
            .upload(bucket_id, key, &source, &options, cancel)
            .await
    }

    /// Upload an in-memory payload
    pub async fn upload_bytes(
        &self,
        bucket_id: &str,
        key: &str,
        body: impl Into<Bytes>,
        content_type: &str,
    ) -> Result<FileVersion> {
        let source = UploadSource::from_bytes(body);
        let options = UploadOptions::default().with_content_type(content_type);
        self.engine
            .upload(bucket_id, key, &source, &options, &CancellationToken::new())
            .await
    }

    /// Download an object to `dest_path`, restoring its recorded modification time
    pub async fn download_file(
        &self,
        bucket_name: &str,
        key: &str,
        dest_path: &Path,
        progress: Option<Arc<dyn ProgressSink>>,
        cancel: &CancellationToken,
    ) -> Result<FileVersion> {
        let info = self.head(bucket_name, key, cancel).await?;
        let sink = FileSink::create(dest_path, info.content_length).await?;

        if let Err(err) = self
            .engine
            .download_version(bucket_name, &info, &sink, progress, cancel)
            .await
        {
            drop(sink);
            if let Err(e) = tokio::fs::remove_file(dest_path).await {
                warn!(path = %dest_path.display(), error = %e, "failed to remove partial download");
            }
            return Err(err);
        }
        Ok(info)
    }

    /// Download an object into memory
    pub async fn download_bytes(&self, bucket_name: &str, key: &str) -> Result<Bytes> {
        let cancel = CancellationToken::new();
        let info = self.head(bucket_name, key, &cancel).await?;
        let sink = MemorySink::with_capacity(info.content_length);
        self.engine
            .download_version(bucket_name, &info, &sink, None, &cancel)
            .await?;
        Ok(sink.into_bytes())
    }

    /// Latest file names in a bucket, one page at a time
    pub fn list_file_names(
        &self,
        request: ListFilesRequest,
        cancel: CancellationToken,
    ) -> Paginator<'static, FileVersion> {
        self.paginate(request, false, cancel)
    }

    /// Every version of every file, including hide markers
    pub fn list_file_versions(
        &self,
        request: ListFilesRequest,
        cancel: CancellationToken,
    ) -> Paginator<'static, FileVersion> {
        self.paginate(request, true, cancel)
    }

    fn paginate(
        &self,
        request: ListFilesRequest,
        versions: bool,
        cancel: CancellationToken,
    ) -> Paginator<'static, FileVersion> {
        let api = Arc::clone(&self.api);
        let pages = Arc::clone(&self.pages);
        let ttl = self.list_page_ttl;
        let start = request.cursor.clone();

        Paginator::starting_at(Arc::clone(&self.pipeline), cancel, start, move |cursor| {
            let api = Arc::clone(&api);
            let pages = Arc::clone(&pages);
            let key = PageKey {
                versions,
                request: request.at(cursor),
            };

            async move {
                let fetch = || async {
                    if key.versions {
                        api.list_file_versions(&key.request).await
                    } else {
                        api.list_file_names(&key.request).await
                    }
                };
                match ttl {
                    Some(ttl) => pages.get_or_fetch(&key, ttl, fetch).await,
                    None => fetch().await,
                }
            }
            .boxed()
        })
    }

    /// All buckets of the account
    pub async fn list_buckets(&self) -> Result<Vec<Bucket>> {
        self.pipeline
            .execute(OperationClass::Generic, &CancellationToken::new(), || {
                self.api.list_buckets()
            })
            .await
    }

    /// Bucket with the given name
    pub async fn find_bucket(&self, bucket_name: &str) -> Result<Bucket> {
        self.list_buckets()
            .await?
            .into_iter()
            .find(|b| b.bucket_name == bucket_name)
            .ok_or_else(|| Error::NotFound(format!("Bucket '{}' not found", bucket_name)))
    }

    /// Metadata of the latest version of `key`
    pub async fn head_object(&self, bucket_name: &str, key: &str) -> Result<FileVersion> {
        self.head(bucket_name, key, &CancellationToken::new()).await
    }

    async fn head(
        &self,
        bucket_name: &str,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<FileVersion> {
        self.pipeline
            .execute(OperationClass::Generic, cancel, || {
                self.api.head_file(bucket_name, key)
            })
            .await
    }

    /// Check if an object exists
    pub async fn object_exists(&self, bucket_name: &str, key: &str) -> Result<bool> {
        match self.head_object(bucket_name, key).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Hide the latest version of `key` so it no longer appears in name listings
    pub async fn hide_file(&self, bucket_id: &str, key: &str) -> Result<FileVersion> {
        self.pipeline
            .execute(OperationClass::Generic, &CancellationToken::new(), || {
                self.api.hide_file(bucket_id, key)
            })
            .await
    }

    /// Permanently delete one version
    pub async fn delete_file_version(&self, key: &str, file_id: &str) -> Result<()> {
        self.pipeline
            .execute(OperationClass::Generic, &CancellationToken::new(), || {
                self.api.delete_file_version(key, file_id)
            })
            .await
    }
}
