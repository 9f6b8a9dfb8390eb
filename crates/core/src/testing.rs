//! In-memory fakes shared by the unit tests

use crate::checksum::sha1_hex;
use crate::error::{Error, Result};
use crate::remote::{Authenticator, StorageApi};
use crate::transport::{HttpRequest, HttpResponse, Transport};
use crate::types::{
    AuthInfo, Bucket, ByteRange, DownloadedRange, FileVersion, ListCursor, ListFilesRequest, Page,
    StartLargeFileRequest, UploadCredential, UploadFileRequest, UploadedPart,
};
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use rand::Rng;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn sample_auth_info() -> AuthInfo {
    AuthInfo {
        account_id: "12f634bf3cbz".to_string(),
        authorization_token: "4_0022623512fc8f80000000001_0186e431_d18d02_acct".to_string(),
        api_url: "https://api001.backblazeb2.com".to_string(),
        download_url: "https://f001.backblazeb2.com".to_string(),
        recommended_part_size: 100_000_000,
        absolute_minimum_part_size: 5_000_000,
    }
}

/// Authenticator that counts calls and optionally fails them
#[derive(Default)]
pub struct CountingAuthenticator {
    calls: AtomicU32,
    fail: bool,
}

impl CountingAuthenticator {
    pub fn failing() -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail: true,
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Authenticator for CountingAuthenticator {
    async fn reauthenticate(&self) -> Result<AuthInfo> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::Validation("bad application key".to_string()));
        }
        Ok(sample_auth_info())
    }
}

/// Tracks the highest number of simultaneously entered sections
#[derive(Clone, Default)]
pub struct ConcurrencyGauge {
    inner: Arc<(AtomicUsize, AtomicUsize)>,
}

pub fn concurrency_gauge() -> ConcurrencyGauge {
    ConcurrencyGauge::default()
}

impl ConcurrencyGauge {
    pub fn enter(&self) -> GaugeGuard {
        let (current, max) = &*self.inner;
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        GaugeGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn max(&self) -> usize {
        self.inner.1.load(Ordering::SeqCst)
    }
}

pub struct GaugeGuard {
    inner: Arc<(AtomicUsize, AtomicUsize)>,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.inner.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Failure injected into a fake call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// 401 expired token
    Auth,
    /// 503
    Transient,
    /// Accept the data but acknowledge a different SHA-1 / flip a byte
    Corrupt,
    /// Return one byte fewer than requested
    Truncate,
    /// 403 cap exceeded
    Cap,
}

impl Fault {
    fn error(self) -> Error {
        match self {
            Fault::Auth => Error::Authentication("expired_auth_token".to_string()),
            Fault::Transient => Error::ServiceUnavailable {
                status: 503,
                message: "service_unavailable".to_string(),
            },
            Fault::Cap => Error::CapacityExceeded("transaction_cap_exceeded".to_string()),
            Fault::Corrupt | Fault::Truncate => Error::Other("not an error fault".to_string()),
        }
    }

    fn is_error(self) -> bool {
        matches!(self, Fault::Auth | Fault::Transient | Fault::Cap)
    }
}

struct StoredFile {
    version: FileVersion,
    data: Bytes,
}

struct LargeFileSession {
    request: StartLargeFileRequest,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Default)]
struct StorageState {
    buckets: Vec<Bucket>,
    files: BTreeMap<String, StoredFile>,
    sessions: HashMap<String, LargeFileSession>,
    upload_faults: VecDeque<Fault>,
    part_faults: HashMap<u32, VecDeque<Fault>>,
    download_faults: VecDeque<Fault>,
    range_faults: HashMap<u64, VecDeque<Fault>>,
    list_faults: VecDeque<Fault>,
    fail_cancel: bool,
    finished: Vec<Vec<String>>,
    cancelled: Vec<String>,
    part_order: Vec<u32>,
    part_tasks: Vec<Option<tokio::task::Id>>,
    calls: HashMap<&'static str, u32>,
}

/// Object store held in memory, with scripted failures
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<StorageState>,
    delay_ms: Option<(u64, u64)>,
    gauge: ConcurrencyGauge,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep a random time in `min..=max` ms inside every part and range call
    pub fn with_delay(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.delay_ms = Some((min_ms, max_ms));
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, StorageState> {
        self.state.lock().unwrap()
    }

    fn record(&self, call: &'static str) {
        *self.state().calls.entry(call).or_insert(0) += 1;
    }

    fn record_task(&self) {
        self.state().part_tasks.push(tokio::task::try_id());
    }

    async fn delay(&self) {
        if let Some((min, max)) = self.delay_ms {
            let ms = rand::thread_rng().gen_range(min..=max);
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    pub fn fail_upload(&self, fault: Fault, times: usize) {
        self.state().upload_faults.extend(std::iter::repeat(fault).take(times));
    }

    pub fn fail_part(&self, part_number: u32, fault: Fault, times: usize) {
        self.state()
            .part_faults
            .entry(part_number)
            .or_default()
            .extend(std::iter::repeat(fault).take(times));
    }

    pub fn fail_download(&self, fault: Fault, times: usize) {
        self.state().download_faults.extend(std::iter::repeat(fault).take(times));
    }

    pub fn fail_range(&self, start: u64, fault: Fault, times: usize) {
        self.state()
            .range_faults
            .entry(start)
            .or_default()
            .extend(std::iter::repeat(fault).take(times));
    }

    pub fn fail_list(&self, fault: Fault, times: usize) {
        self.state().list_faults.extend(std::iter::repeat(fault).take(times));
    }

    pub fn fail_cancel(&self) {
        self.state().fail_cancel = true;
    }

    pub fn add_bucket(&self, bucket_id: &str, bucket_name: &str) {
        self.state().buckets.push(Bucket {
            account_id: sample_auth_info().account_id,
            bucket_id: bucket_id.to_string(),
            bucket_name: bucket_name.to_string(),
            bucket_type: "allPrivate".to_string(),
            bucket_info: HashMap::new(),
            revision: 1,
        });
    }

    /// Store an object directly; `large` stores it the way a finished large file is reported
    pub fn put_object(
        &self,
        file_name: &str,
        data: impl Into<Bytes>,
        file_info: HashMap<String, String>,
        large: bool,
    ) -> FileVersion {
        let data = data.into();
        let content_sha1 = if large {
            "none".to_string()
        } else {
            sha1_hex(&data)
        };
        let version = new_version(
            file_name,
            &data,
            content_sha1,
            "application/octet-stream",
            file_info,
        );
        self.state().files.insert(
            file_name.to_string(),
            StoredFile {
                version: version.clone(),
                data,
            },
        );
        version
    }

    pub fn object(&self, file_name: &str) -> Option<Bytes> {
        self.state().files.get(file_name).map(|f| f.data.clone())
    }

    pub fn version(&self, file_name: &str) -> Option<FileVersion> {
        self.state().files.get(file_name).map(|f| f.version.clone())
    }

    pub fn calls(&self, call: &str) -> u32 {
        self.state().calls.get(call).copied().unwrap_or(0)
    }

    pub fn finish_calls(&self) -> Vec<Vec<String>> {
        self.state().finished.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state().cancelled.clone()
    }

    /// Part numbers in the order their uploads completed
    pub fn part_order(&self) -> Vec<u32> {
        self.state().part_order.clone()
    }

    /// Task id of every part upload and ranged download call, `None` outside a spawned task
    pub fn part_tasks(&self) -> Vec<Option<tokio::task::Id>> {
        self.state().part_tasks.clone()
    }

    pub fn open_sessions(&self) -> usize {
        self.state().sessions.len()
    }

    /// Highest number of concurrent part uploads, single uploads or downloads
    pub fn max_concurrency(&self) -> usize {
        self.gauge.max()
    }

    fn list(&self, request: &ListFilesRequest, with_ids: bool) -> Result<Page<FileVersion>> {
        let mut state = self.state();
        if let Some(fault) = state.list_faults.pop_front() {
            return Err(fault.error());
        }

        let start = request
            .cursor
            .as_ref()
            .and_then(|c| c.start_name.clone())
            .unwrap_or_default();
        let prefix = request.prefix.clone().unwrap_or_default();
        let mut matching = state
            .files
            .range(start..)
            .filter(|(name, _)| name.starts_with(&prefix))
            .map(|(_, f)| f.version.clone());

        let items: Vec<FileVersion> = matching.by_ref().take(request.page_size as usize).collect();
        let next_cursor = matching.next().map(|next| ListCursor {
            start_id: if with_ids { next.file_id.clone() } else { None },
            start_name: Some(next.file_name),
        });
        Ok(Page { items, next_cursor })
    }
}

fn new_version(
    file_name: &str,
    data: &[u8],
    content_sha1: String,
    content_type: &str,
    file_info: HashMap<String, String>,
) -> FileVersion {
    FileVersion {
        file_id: Some(format!("4_z{}", uuid::Uuid::new_v4().simple())),
        file_name: file_name.to_string(),
        account_id: Some(sample_auth_info().account_id),
        bucket_id: None,
        content_length: data.len() as u64,
        content_sha1: Some(content_sha1),
        content_type: Some(content_type.to_string()),
        file_info,
        action: Some("upload".to_string()),
        upload_timestamp: chrono::Utc::now().timestamp_millis(),
    }
}

#[async_trait]
impl StorageApi for MemoryStorage {
    async fn get_upload_url(&self, bucket_id: &str) -> Result<UploadCredential> {
        self.record("get_upload_url");
        Ok(UploadCredential {
            bucket_id: Some(bucket_id.to_string()),
            file_id: None,
            upload_url: format!(
                "https://pod-000-1000-00.backblaze.com/b2api/v2/b2_upload_file/{}",
                bucket_id
            ),
            authorization_token: format!("upload-{}", uuid::Uuid::new_v4()),
            expires_hint: None,
        })
    }

    async fn upload_file(
        &self,
        credential: &UploadCredential,
        request: &UploadFileRequest,
        body: Bytes,
    ) -> Result<FileVersion> {
        self.record("upload_file");
        let fault = self.state().upload_faults.pop_front();
        let _guard = self.gauge.enter();
        self.delay().await;

        if let Some(fault) = fault.filter(|f| f.is_error()) {
            return Err(fault.error());
        }
        if credential.bucket_id.is_none() {
            return Err(Error::Validation("not a bucket upload url".to_string()));
        }
        let actual = sha1_hex(&body);
        if actual != request.content_sha1 {
            return Err(Error::Validation("sha1 did not match data received".to_string()));
        }

        let mut version = new_version(
            &request.file_name,
            &body,
            actual,
            &request.content_type,
            request.file_info.clone(),
        );
        version.bucket_id = credential.bucket_id.clone();
        self.state().files.insert(
            request.file_name.clone(),
            StoredFile {
                version: version.clone(),
                data: body,
            },
        );

        if fault == Some(Fault::Corrupt) {
            version.content_sha1 = Some(sha1_hex(b"corrupt"));
        }
        Ok(version)
    }

    async fn start_large_file(&self, request: &StartLargeFileRequest) -> Result<FileVersion> {
        self.record("start_large_file");
        let mut version = new_version(
            &request.file_name,
            &[],
            "none".to_string(),
            &request.content_type,
            request.file_info.clone(),
        );
        version.action = Some("start".to_string());
        version.bucket_id = Some(request.bucket_id.clone());

        let file_id = version.file_id.clone().unwrap_or_default();
        self.state().sessions.insert(
            file_id,
            LargeFileSession {
                request: request.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(version)
    }

    async fn get_upload_part_url(&self, file_id: &str) -> Result<UploadCredential> {
        self.record("get_upload_part_url");
        if !self.state().sessions.contains_key(file_id) {
            return Err(Error::NotFound(format!("no large file {}", file_id)));
        }
        Ok(UploadCredential {
            bucket_id: None,
            file_id: Some(file_id.to_string()),
            upload_url: "https://pod-000-1000-00.backblaze.com/b2api/v2/b2_upload_part".to_string(),
            authorization_token: format!("part-{}", uuid::Uuid::new_v4()),
            expires_hint: None,
        })
    }

    async fn upload_part(
        &self,
        credential: &UploadCredential,
        part_number: u32,
        content_sha1: &str,
        body: Bytes,
    ) -> Result<UploadedPart> {
        self.record("upload_part");
        self.record_task();
        let fault = self
            .state()
            .part_faults
            .get_mut(&part_number)
            .and_then(VecDeque::pop_front);
        let _guard = self.gauge.enter();
        self.delay().await;

        if let Some(fault) = fault.filter(|f| f.is_error()) {
            return Err(fault.error());
        }
        let file_id = credential
            .file_id
            .clone()
            .ok_or_else(|| Error::Validation("not a part upload url".to_string()))?;
        let actual = sha1_hex(&body);
        if actual != content_sha1 {
            return Err(Error::Validation("sha1 did not match data received".to_string()));
        }

        let content_length = body.len() as u64;
        {
            let mut state = self.state();
            let session = state
                .sessions
                .get_mut(&file_id)
                .ok_or_else(|| Error::NotFound(format!("no large file {}", file_id)))?;
            session.parts.insert(part_number, (actual.clone(), body));
            state.part_order.push(part_number);
        }

        let content_sha1 = if fault == Some(Fault::Corrupt) {
            sha1_hex(b"corrupt")
        } else {
            actual
        };
        Ok(UploadedPart {
            file_id,
            part_number,
            content_length,
            content_sha1,
        })
    }

    async fn finish_large_file(
        &self,
        file_id: &str,
        part_sha1_array: &[String],
    ) -> Result<FileVersion> {
        self.record("finish_large_file");
        let mut state = self.state();
        state.finished.push(part_sha1_array.to_vec());

        let session = state
            .sessions
            .remove(file_id)
            .ok_or_else(|| Error::NotFound(format!("no large file {}", file_id)))?;

        let stored: Vec<&String> = session.parts.values().map(|(sha1, _)| sha1).collect();
        let contiguous = session.parts.keys().copied().eq(1..=session.parts.len() as u32);
        if !contiguous || !stored.iter().copied().eq(part_sha1_array.iter()) {
            return Err(Error::Validation("part sha1 array does not match parts".to_string()));
        }

        let data: Vec<u8> = session
            .parts
            .values()
            .flat_map(|(_, bytes)| bytes.iter().copied())
            .collect();
        let mut version = new_version(
            &session.request.file_name,
            &data,
            "none".to_string(),
            &session.request.content_type,
            session.request.file_info.clone(),
        );
        version.file_id = Some(file_id.to_string());
        version.bucket_id = Some(session.request.bucket_id.clone());
        state.files.insert(
            session.request.file_name.clone(),
            StoredFile {
                version: version.clone(),
                data: Bytes::from(data),
            },
        );
        Ok(version)
    }

    async fn cancel_large_file(&self, file_id: &str) -> Result<()> {
        self.record("cancel_large_file");
        let mut state = self.state();
        state.cancelled.push(file_id.to_string());
        if state.fail_cancel {
            return Err(Error::Network("connection reset".to_string()));
        }
        state.sessions.remove(file_id);
        Ok(())
    }

    async fn head_file(&self, _bucket_name: &str, file_name: &str) -> Result<FileVersion> {
        self.record("head_file");
        self.state()
            .files
            .get(file_name)
            .map(|f| f.version.clone())
            .ok_or_else(|| Error::NotFound(file_name.to_string()))
    }

    async fn download_file(
        &self,
        _bucket_name: &str,
        file_name: &str,
        range: Option<ByteRange>,
    ) -> Result<DownloadedRange> {
        self.record("download_file");
        if range.is_some() {
            self.record_task();
        }
        let (fault, stored) = {
            let mut state = self.state();
            let fault = match range {
                Some(r) => state.range_faults.get_mut(&r.start).and_then(VecDeque::pop_front),
                None => state.download_faults.pop_front(),
            };
            let stored = state
                .files
                .get(file_name)
                .map(|f| (f.data.clone(), f.version.clone()));
            (fault, stored)
        };
        let _guard = self.gauge.enter();
        self.delay().await;

        if let Some(fault) = fault.filter(|f| f.is_error()) {
            return Err(fault.error());
        }
        let (data, version) = stored.ok_or_else(|| Error::NotFound(file_name.to_string()))?;

        let slice = match range {
            Some(r) => {
                let end = (r.end + 1).min(data.len() as u64);
                data.slice(r.start as usize..end as usize)
            }
            None => data.clone(),
        };
        let content_sha1 = match range {
            None if version.content_sha1.as_deref() != Some("none") => Some(sha1_hex(&slice)),
            _ => None,
        };

        let slice = match fault {
            Some(Fault::Corrupt) if !slice.is_empty() => {
                let mut bytes = slice.to_vec();
                bytes[0] ^= 0xff;
                Bytes::from(bytes)
            }
            Some(Fault::Truncate) if !slice.is_empty() => slice.slice(..slice.len() - 1),
            _ => slice,
        };

        Ok(DownloadedRange {
            data: slice,
            content_sha1,
        })
    }

    async fn list_file_names(&self, request: &ListFilesRequest) -> Result<Page<FileVersion>> {
        self.record("list_file_names");
        self.list(request, false)
    }

    async fn list_file_versions(&self, request: &ListFilesRequest) -> Result<Page<FileVersion>> {
        self.record("list_file_versions");
        self.list(request, true)
    }

    async fn list_buckets(&self) -> Result<Vec<Bucket>> {
        self.record("list_buckets");
        Ok(self.state().buckets.clone())
    }

    async fn hide_file(&self, bucket_id: &str, file_name: &str) -> Result<FileVersion> {
        self.record("hide_file");
        let mut state = self.state();
        state
            .files
            .remove(file_name)
            .ok_or_else(|| Error::NotFound(file_name.to_string()))?;

        let mut version = new_version(
            file_name,
            &[],
            "none".to_string(),
            "application/x-bz-hide-marker",
            HashMap::new(),
        );
        version.action = Some("hide".to_string());
        version.bucket_id = Some(bucket_id.to_string());
        Ok(version)
    }

    async fn delete_file_version(&self, file_name: &str, file_id: &str) -> Result<()> {
        self.record("delete_file_version");
        let mut state = self.state();
        let matches = state
            .files
            .get(file_name)
            .is_some_and(|f| f.version.file_id.as_deref() == Some(file_id));
        if !matches {
            return Err(Error::NotFound(format!("{} ({})", file_name, file_id)));
        }
        state.files.remove(file_name);
        Ok(())
    }
}

/// Transport that replays queued responses and records requests
#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<HttpResponse>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, response: HttpResponse) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    pub fn push_json(&self, status: u16, body: serde_json::Value) {
        self.push(response(status, &[("content-type", "application/json")], body.to_string()));
    }

    pub fn push_error(&self, error: Error) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.requests.lock().unwrap().push(request);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Error::Other("no scripted response left".to_string())))
    }
}

pub fn response(status: u16, headers: &[(&str, &str)], body: impl Into<Bytes>) -> HttpResponse {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    HttpResponse {
        status: StatusCode::from_u16(status).unwrap(),
        headers: map,
        body: body.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_storage_large_file_round_trip() {
        let storage = MemoryStorage::new();
        let started = storage
            .start_large_file(&StartLargeFileRequest {
                bucket_id: "bucket".to_string(),
                file_name: "big.bin".to_string(),
                content_type: "application/octet-stream".to_string(),
                file_info: HashMap::new(),
            })
            .await
            .unwrap();
        let file_id = started.file_id.unwrap();
        let credential = storage.get_upload_part_url(&file_id).await.unwrap();

        let mut sha1s = Vec::new();
        for (n, chunk) in [&b"hello "[..], &b"world"[..]].iter().enumerate() {
            let sha1 = sha1_hex(chunk);
            let ack = tokio_test::assert_ok!(
                storage
                    .upload_part(&credential, n as u32 + 1, &sha1, Bytes::copy_from_slice(chunk))
                    .await
            );
            assert_eq!(ack.content_sha1, sha1);
            sha1s.push(sha1);
        }

        storage.finish_large_file(&file_id, &sha1s).await.unwrap();
        assert_eq!(&storage.object("big.bin").unwrap()[..], b"hello world");
        assert_eq!(storage.open_sessions(), 0);
    }

    #[test]
    fn test_gauge_tracks_max() {
        let gauge = concurrency_gauge();
        let a = gauge.enter();
        let b = gauge.enter();
        drop(a);
        let _c = gauge.enter();
        drop(b);
        assert_eq!(gauge.max(), 2);
    }
}
