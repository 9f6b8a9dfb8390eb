//! Remote operations the transfer engine and paginator are written against.
//!
//! [`B2Api`](crate::b2::B2Api) implements both traits over HTTP. Tests swap in
//! in-memory implementations.

use crate::error::Result;
use crate::types::{
    AuthInfo, Bucket, ByteRange, DownloadedRange, FileVersion, ListFilesRequest, Page,
    StartLargeFileRequest, UploadCredential, UploadFileRequest, UploadedPart,
};
use async_trait::async_trait;
use bytes::Bytes;

/// Obtains a fresh account authorization after the current one was rejected
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn reauthenticate(&self) -> Result<AuthInfo>;
}

/// Object, large-file and listing calls
#[async_trait]
pub trait StorageApi: Send + Sync {
    /// Bucket-scoped upload URL for single-shot uploads
    async fn get_upload_url(&self, bucket_id: &str) -> Result<UploadCredential>;

    async fn upload_file(
        &self,
        credential: &UploadCredential,
        request: &UploadFileRequest,
        body: Bytes,
    ) -> Result<FileVersion>;

    /// Allocate a large-file session; the returned `file_id` identifies it
    async fn start_large_file(&self, request: &StartLargeFileRequest) -> Result<FileVersion>;

    /// Session-scoped upload URL for parts
    async fn get_upload_part_url(&self, file_id: &str) -> Result<UploadCredential>;

    async fn upload_part(
        &self,
        credential: &UploadCredential,
        part_number: u32,
        content_sha1: &str,
        body: Bytes,
    ) -> Result<UploadedPart>;

    /// `part_sha1_array` must be ordered by part number
    async fn finish_large_file(
        &self,
        file_id: &str,
        part_sha1_array: &[String],
    ) -> Result<FileVersion>;

    async fn cancel_large_file(&self, file_id: &str) -> Result<()>;

    /// Metadata of the latest version of `file_name`
    async fn head_file(&self, bucket_name: &str, file_name: &str) -> Result<FileVersion>;

    async fn download_file(
        &self,
        bucket_name: &str,
        file_name: &str,
        range: Option<ByteRange>,
    ) -> Result<DownloadedRange>;

    async fn list_file_names(&self, request: &ListFilesRequest) -> Result<Page<FileVersion>>;

    async fn list_file_versions(&self, request: &ListFilesRequest) -> Result<Page<FileVersion>>;

    async fn list_buckets(&self) -> Result<Vec<Bucket>>;

    async fn hide_file(&self, bucket_id: &str, file_name: &str) -> Result<FileVersion>;

    async fn delete_file_version(&self, file_name: &str, file_id: &str) -> Result<()>;
}
