//! b2pilot-core - Resilient transfer engine for Backblaze B2
//!
//! This library provides chunked, concurrent and integrity-checked uploads
//! and downloads against the B2 native API, lazy pagination over listings,
//! and the retry, bulkhead and caching machinery they share.

pub mod b2;
pub mod cache;
pub mod checksum;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod paginator;
pub mod pipeline;
pub mod remote;
pub mod transfer;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use b2::B2Api;
pub use cache::EphemeralCache;
pub use client::B2Client;
pub use config::{config_exists, get_config_path, load_config, save_config, validate_config};
pub use config::{
    AccountConfig, CacheConfig, Config, ConfigFile, LoggingConfig, RetryConfig, TransferConfig,
};
pub use error::{Error, ErrorKind, Result};
pub use logging::init_logging;
pub use paginator::Paginator;
pub use pipeline::{OperationClass, PoolLimits, ResiliencePipeline, RetryPolicy};
pub use remote::{Authenticator, StorageApi};
pub use transfer::{
    DownloadSink, FileSink, MemorySink, ProgressSink, TransferEngine, TransferProgress,
    UploadOptions, UploadSource,
};
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
pub use types::{Bucket, ByteRange, FileVersion, ListCursor, ListFilesRequest, Page};
pub use tokio_util::sync::CancellationToken;
