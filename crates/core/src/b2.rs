//! B2 native API (v2) over a [`Transport`]

use crate::config::AccountConfig;
use crate::error::{Error, Result};
use crate::remote::{Authenticator, StorageApi};
use crate::transport::{HttpRequest, HttpResponse, Transport};
use crate::types::{
    AuthInfo, Bucket, ByteRange, DownloadedRange, FileVersion, ListCursor, ListFilesRequest, Page,
    StartLargeFileRequest, UploadCredential, UploadFileRequest, UploadedPart,
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

const API_PATH: &str = "b2api/v2";

const AUTHORIZATION: &str = "authorization";
const CONTENT_TYPE: &str = "content-type";
const CONTENT_LENGTH: &str = "content-length";
const RANGE: &str = "range";
const X_BZ_FILE_NAME: &str = "x-bz-file-name";
const X_BZ_FILE_ID: &str = "x-bz-file-id";
const X_BZ_CONTENT_SHA1: &str = "x-bz-content-sha1";
const X_BZ_PART_NUMBER: &str = "x-bz-part-number";
const X_BZ_UPLOAD_TIMESTAMP: &str = "x-bz-upload-timestamp";
const X_BZ_INFO_PREFIX: &str = "x-bz-info-";

/// encodeURIComponent, except `/` is kept
static FILE_NAME_ENCODE_SET: AsciiSet = NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

fn encode_file_name(name: &str) -> String {
    utf8_percent_encode(name, &FILE_NAME_ENCODE_SET).to_string()
}

fn decode_file_name(name: &str) -> String {
    percent_decode_str(name)
        .decode_utf8()
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| name.to_string())
}

/// B2 native API client
pub struct B2Api {
    transport: Arc<dyn Transport>,
    application_key_id: String,
    application_key: String,
    auth_url: String,
    auth: RwLock<Option<AuthInfo>>,
}

impl B2Api {
    pub fn new(transport: Arc<dyn Transport>, account: &AccountConfig) -> Self {
        Self {
            transport,
            application_key_id: account.application_key_id.clone(),
            application_key: account.application_key.clone(),
            auth_url: account.api_url.trim_end_matches('/').to_string(),
            auth: RwLock::new(None),
        }
    }

    /// Call `b2_authorize_account` and replace the cached session
    pub async fn authorize_account(&self) -> Result<AuthInfo> {
        let credentials = STANDARD.encode(format!(
            "{}:{}",
            self.application_key_id, self.application_key
        ));
        let url = format!("{}/{}/b2_authorize_account", self.auth_url, API_PATH);
        let request =
            HttpRequest::get(url).header(AUTHORIZATION, format!("Basic {}", credentials));

        let response = self.transport.send(request).await?;
        let body: AuthorizeAccountResponse = match handle_response(response) {
            Ok(body) => body,
            // A rejected key will not start working on retry
            Err(Error::Authentication(message)) => {
                return Err(Error::InvalidConfig(format!(
                    "Application key rejected: {}",
                    message
                )))
            }
            Err(err) => return Err(err),
        };

        let auth = AuthInfo {
            account_id: body.account_id,
            authorization_token: body.authorization_token,
            api_url: body.api_url.trim_end_matches('/').to_string(),
            download_url: body.download_url.trim_end_matches('/').to_string(),
            recommended_part_size: body.recommended_part_size,
            absolute_minimum_part_size: body.absolute_minimum_part_size,
        };
        info!(account_id = %auth.account_id, api_url = %auth.api_url, "authorized account");
        *self.auth.write().await = Some(auth.clone());
        Ok(auth)
    }

    /// Current session, authorizing first if there is none
    pub async fn auth_info(&self) -> Result<AuthInfo> {
        if let Some(auth) = self.auth.read().await.clone() {
            return Ok(auth);
        }
        self.authorize_account().await
    }

    async fn api_call<B: Serialize, T: DeserializeOwned>(&self, name: &str, body: &B) -> Result<T> {
        let auth = self.auth_info().await?;
        let request = HttpRequest::post(format!("{}/{}/{}", auth.api_url, API_PATH, name))
            .header(AUTHORIZATION, &auth.authorization_token)
            .json(body)?;

        debug!(call = name, "b2 api call");
        let response = self.transport.send(request).await?;
        handle_response(response)
    }

    async fn file_url(&self, bucket_name: &str, file_name: &str) -> Result<(AuthInfo, String)> {
        let auth = self.auth_info().await?;
        let url = format!(
            "{}/file/{}/{}",
            auth.download_url,
            bucket_name,
            encode_file_name(file_name)
        );
        Ok((auth, url))
    }

    async fn list(
        &self,
        call: &str,
        request: &ListFilesRequest,
        with_ids: bool,
    ) -> Result<Page<FileVersion>> {
        let mut body = Map::new();
        body.insert("bucketId".into(), json!(request.bucket_id));
        body.insert("maxFileCount".into(), json!(request.page_size));
        if let Some(prefix) = &request.prefix {
            body.insert("prefix".into(), json!(prefix));
        }
        if let Some(delimiter) = &request.delimiter {
            body.insert("delimiter".into(), json!(delimiter));
        }
        if let Some(cursor) = &request.cursor {
            if let Some(name) = &cursor.start_name {
                body.insert("startFileName".into(), json!(name));
            }
            if let (true, Some(id)) = (with_ids, &cursor.start_id) {
                body.insert("startFileId".into(), json!(id));
            }
        }

        let response: ListFilesResponse = self.api_call(call, &Value::Object(body)).await?;
        let next_cursor = response.next_file_name.map(|name| ListCursor {
            start_name: Some(name),
            start_id: if with_ids { response.next_file_id } else { None },
        });
        Ok(Page {
            items: response.files,
            next_cursor,
        })
    }
}

#[async_trait]
impl Authenticator for B2Api {
    async fn reauthenticate(&self) -> Result<AuthInfo> {
        self.authorize_account().await
    }
}

#[async_trait]
impl StorageApi for B2Api {
    async fn get_upload_url(&self, bucket_id: &str) -> Result<UploadCredential> {
        self.api_call("b2_get_upload_url", &json!({ "bucketId": bucket_id }))
            .await
    }

    async fn upload_file(
        &self,
        credential: &UploadCredential,
        request: &UploadFileRequest,
        body: Bytes,
    ) -> Result<FileVersion> {
        let mut http = HttpRequest::post(&credential.upload_url)
            .header(AUTHORIZATION, &credential.authorization_token)
            .header(X_BZ_FILE_NAME, encode_file_name(&request.file_name))
            .header(CONTENT_TYPE, &request.content_type)
            .header(X_BZ_CONTENT_SHA1, &request.content_sha1);
        for (key, value) in &request.file_info {
            http = http.header(
                format!("{}{}", X_BZ_INFO_PREFIX, key),
                encode_file_name(value),
            );
        }

        let response = self.transport.send(http.body(body)).await?;
        handle_response(response)
    }

    async fn start_large_file(&self, request: &StartLargeFileRequest) -> Result<FileVersion> {
        self.api_call("b2_start_large_file", request).await
    }

    async fn get_upload_part_url(&self, file_id: &str) -> Result<UploadCredential> {
        self.api_call("b2_get_upload_part_url", &json!({ "fileId": file_id }))
            .await
    }

    async fn upload_part(
        &self,
        credential: &UploadCredential,
        part_number: u32,
        content_sha1: &str,
        body: Bytes,
    ) -> Result<UploadedPart> {
        let request = HttpRequest::post(&credential.upload_url)
            .header(AUTHORIZATION, &credential.authorization_token)
            .header(X_BZ_PART_NUMBER, part_number.to_string())
            .header(X_BZ_CONTENT_SHA1, content_sha1)
            .body(body);

        let response = self.transport.send(request).await?;
        handle_response(response)
    }

    async fn finish_large_file(
        &self,
        file_id: &str,
        part_sha1_array: &[String],
    ) -> Result<FileVersion> {
        self.api_call(
            "b2_finish_large_file",
            &json!({ "fileId": file_id, "partSha1Array": part_sha1_array }),
        )
        .await
    }

    async fn cancel_large_file(&self, file_id: &str) -> Result<()> {
        let _: Value = self
            .api_call("b2_cancel_large_file", &json!({ "fileId": file_id }))
            .await?;
        Ok(())
    }

    async fn head_file(&self, bucket_name: &str, file_name: &str) -> Result<FileVersion> {
        let (auth, url) = self.file_url(bucket_name, file_name).await?;
        let request = HttpRequest::head(url).header(AUTHORIZATION, &auth.authorization_token);

        let response = self.transport.send(request).await?;
        if !response.status.is_success() {
            return Err(parse_error(&response));
        }
        Ok(version_from_headers(&response, file_name))
    }

    async fn download_file(
        &self,
        bucket_name: &str,
        file_name: &str,
        range: Option<ByteRange>,
    ) -> Result<DownloadedRange> {
        let (auth, url) = self.file_url(bucket_name, file_name).await?;
        let mut request = HttpRequest::get(url).header(AUTHORIZATION, &auth.authorization_token);
        if let Some(range) = range {
            request = request.header(RANGE, range.to_header());
        }

        let response = self.transport.send(request).await?;
        if !response.status.is_success() {
            return Err(parse_error(&response));
        }

        // A ranged response still carries the whole object's SHA-1
        let content_sha1 = match range {
            Some(_) => None,
            None => version_from_headers(&response, file_name)
                .whole_object_sha1()
                .map(str::to_owned),
        };
        Ok(DownloadedRange {
            data: response.body,
            content_sha1,
        })
    }

    async fn list_file_names(&self, request: &ListFilesRequest) -> Result<Page<FileVersion>> {
        self.list("b2_list_file_names", request, false).await
    }

    async fn list_file_versions(&self, request: &ListFilesRequest) -> Result<Page<FileVersion>> {
        self.list("b2_list_file_versions", request, true).await
    }

    async fn list_buckets(&self) -> Result<Vec<Bucket>> {
        let auth = self.auth_info().await?;
        let response: ListBucketsResponse = self
            .api_call("b2_list_buckets", &json!({ "accountId": auth.account_id }))
            .await?;
        Ok(response.buckets)
    }

    async fn hide_file(&self, bucket_id: &str, file_name: &str) -> Result<FileVersion> {
        self.api_call(
            "b2_hide_file",
            &json!({ "bucketId": bucket_id, "fileName": file_name }),
        )
        .await
    }

    async fn delete_file_version(&self, file_name: &str, file_id: &str) -> Result<()> {
        let _: Value = self
            .api_call(
                "b2_delete_file_version",
                &json!({ "fileName": file_name, "fileId": file_id }),
            )
            .await?;
        Ok(())
    }
}

/// Decode a success body or map the B2 error body onto [`Error`]
fn handle_response<T: DeserializeOwned>(response: HttpResponse) -> Result<T> {
    if response.status.is_success() {
        Ok(serde_json::from_slice(&response.body)?)
    } else {
        Err(parse_error(&response))
    }
}

fn parse_error(response: &HttpResponse) -> Error {
    let status = response.status.as_u16();
    let body: ErrorResponse = serde_json::from_slice(&response.body).unwrap_or_default();
    let message = if body.message.is_empty() {
        response
            .status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string()
    } else {
        body.message
    };
    Error::from_status(status, &body.code, &message)
}

/// Object metadata carried by download and HEAD response headers
fn version_from_headers(response: &HttpResponse, file_name: &str) -> FileVersion {
    let file_info: HashMap<String, String> = response
        .headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(X_BZ_INFO_PREFIX)?;
            let value = value.to_str().ok()?;
            Some((key.to_string(), decode_file_name(value)))
        })
        .collect();

    FileVersion {
        file_id: response.header_str(X_BZ_FILE_ID).map(str::to_owned),
        file_name: response
            .header_str(X_BZ_FILE_NAME)
            .map(decode_file_name)
            .unwrap_or_else(|| file_name.to_string()),
        account_id: None,
        bucket_id: None,
        content_length: response
            .header_str(CONTENT_LENGTH)
            .and_then(|v| v.parse().ok())
            .unwrap_or(response.body.len() as u64),
        content_sha1: response.header_str(X_BZ_CONTENT_SHA1).map(str::to_owned),
        content_type: response.header_str(CONTENT_TYPE).map(str::to_owned),
        file_info,
        action: Some("upload".to_string()),
        upload_timestamp: response
            .header_str(X_BZ_UPLOAD_TIMESTAMP)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeAccountResponse {
    account_id: String,
    authorization_token: String,
    api_url: String,
    download_url: String,
    #[serde(default)]
    recommended_part_size: u64,
    #[serde(default)]
    absolute_minimum_part_size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListFilesResponse {
    files: Vec<FileVersion>,
    next_file_name: Option<String>,
    #[serde(default)]
    next_file_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListBucketsResponse {
    buckets: Vec<Bucket>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ErrorResponse {
    code: String,
    message: String,
}
