//! Request and response types shared by the API adapter and the transfer engine

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// File info key holding the source file's modification time in epoch millis
pub const SRC_LAST_MODIFIED_MILLIS: &str = "src_last_modified_millis";

/// File info key holding the whole-object SHA-1 of a large file
pub const LARGE_FILE_SHA1: &str = "large_file_sha1";

/// Content type that asks the service to pick one from the file name
pub const AUTO_CONTENT_TYPE: &str = "b2/x-auto";

/// Session and account data returned by `b2_authorize_account`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    pub account_id: String,
    pub authorization_token: String,
    /// Base URL for every call except uploads and downloads
    pub api_url: String,
    /// Base URL for downloads
    pub download_url: String,
    pub recommended_part_size: u64,
    pub absolute_minimum_part_size: u64,
}

/// Upload URL plus the token that must accompany it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCredential {
    /// Set for bucket-scoped upload URLs
    #[serde(default)]
    pub bucket_id: Option<String>,
    /// Set for large-file part upload URLs
    #[serde(default)]
    pub file_id: Option<String>,
    pub upload_url: String,
    pub authorization_token: String,
    /// When the service stops honouring the token, if known
    #[serde(skip)]
    pub expires_hint: Option<DateTime<Utc>>,
}

/// Metadata of one stored file version (the object descriptor)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileVersion {
    /// Absent for folder entries of a delimited listing
    #[serde(default)]
    pub file_id: Option<String>,
    pub file_name: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub bucket_id: Option<String>,
    #[serde(default)]
    pub content_length: u64,
    #[serde(default)]
    pub content_sha1: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub file_info: HashMap<String, String>,
    /// `upload`, `start`, `hide` or `folder`
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub upload_timestamp: i64,
}

impl FileVersion {
    /// Modification time recorded by the uploader, if any
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        let millis = self.file_info.get(SRC_LAST_MODIFIED_MILLIS)?.parse::<i64>().ok()?;
        Utc.timestamp_millis_opt(millis).single()
    }

    /// SHA-1 of the whole object when the service knows it.
    ///
    /// Large files report `none` as their content SHA-1; for those the
    /// `large_file_sha1` file info entry is used when the uploader set it.
    pub fn whole_object_sha1(&self) -> Option<&str> {
        let stored = self.content_sha1.as_deref().and_then(|sha1| {
            let sha1 = sha1.strip_prefix("unverified:").unwrap_or(sha1);
            (sha1 != "none" && !sha1.is_empty()).then_some(sha1)
        });
        stored.or_else(|| self.file_info.get(LARGE_FILE_SHA1).map(String::as_str))
    }

    pub fn is_folder(&self) -> bool {
        self.action.as_deref() == Some("folder")
    }
}

/// Bucket description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub account_id: String,
    pub bucket_id: String,
    pub bucket_name: String,
    pub bucket_type: String,
    #[serde(default)]
    pub bucket_info: HashMap<String, String>,
    #[serde(default)]
    pub revision: u64,
}

/// Parameters of a single-shot upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFileRequest {
    pub file_name: String,
    pub content_type: String,
    pub content_length: u64,
    pub content_sha1: String,
    pub file_info: HashMap<String, String>,
}

/// Body of `b2_start_large_file`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartLargeFileRequest {
    pub bucket_id: String,
    pub file_name: String,
    pub content_type: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub file_info: HashMap<String, String>,
}

/// Acknowledgement of one uploaded part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedPart {
    pub file_id: String,
    pub part_number: u32,
    pub content_length: u64,
    pub content_sha1: String,
}

/// Inclusive byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

#[allow(clippy::len_without_is_empty)]
impl ByteRange {
    pub fn new(start: u64, len: u64) -> Self {
        debug_assert!(len > 0);
        Self {
            start,
            end: start + len - 1,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value of the HTTP `Range` header
    pub fn to_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Body of a download response
#[derive(Debug, Clone)]
pub struct DownloadedRange {
    pub data: bytes::Bytes,
    /// SHA-1 the server supplied for exactly these bytes
    pub content_sha1: Option<String>,
}

/// Continuation state threaded through list calls
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ListCursor {
    pub start_name: Option<String>,
    pub start_id: Option<String>,
}

impl ListCursor {
    pub fn from_name(start_name: impl Into<String>) -> Self {
        Self {
            start_name: Some(start_name.into()),
            start_id: None,
        }
    }
}

/// One page of a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// `None` on the last page
    pub next_cursor: Option<ListCursor>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
        }
    }
}

/// Parameters of `b2_list_file_names` / `b2_list_file_versions`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListFilesRequest {
    pub bucket_id: String,
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub page_size: u32,
    pub cursor: Option<ListCursor>,
}

impl ListFilesRequest {
    pub fn new(bucket_id: impl Into<String>) -> Self {
        Self {
            bucket_id: bucket_id.into(),
            prefix: None,
            delimiter: None,
            page_size: 1000,
            cursor: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = Some(delimiter.into());
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Same request positioned at `cursor`
    pub fn at(&self, cursor: Option<ListCursor>) -> Self {
        Self {
            cursor,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(sha1: Option<&str>) -> FileVersion {
        FileVersion {
            file_id: Some(
                "4_z27c88f1d182b150646ff0b16_f1004ba650fe24e6b_d20150809_m012853_c100_v0009990_t0000"
                    .to_string(),
            ),
            file_name: "photos/cats.jpg".to_string(),
            account_id: None,
            bucket_id: Some("e73ede9c9c8412db49f60715".to_string()),
            content_length: 1024,
            content_sha1: sha1.map(String::from),
            content_type: Some("image/jpeg".to_string()),
            file_info: HashMap::new(),
            action: Some("upload".to_string()),
            upload_timestamp: 1_439_083_733_000,
        }
    }

    #[test]
    fn test_byte_range() {
        let range = ByteRange::new(100, 50);
        assert_eq!(range.end, 149);
        assert_eq!(range.len(), 50);
        assert_eq!(range.to_header(), "bytes=100-149");
    }

    #[test]
    fn test_whole_object_sha1() {
        let v = version(Some("2aae6c35c94fcfb415dbe95f408b9ce91ee846ed"));
        assert_eq!(v.whole_object_sha1(), Some("2aae6c35c94fcfb415dbe95f408b9ce91ee846ed"));

        let v = version(Some("unverified:2aae6c35c94fcfb415dbe95f408b9ce91ee846ed"));
        assert_eq!(v.whole_object_sha1(), Some("2aae6c35c94fcfb415dbe95f408b9ce91ee846ed"));

        let mut v = version(Some("none"));
        assert_eq!(v.whole_object_sha1(), None);
        v.file_info
            .insert(LARGE_FILE_SHA1.to_string(), "abc".to_string());
        assert_eq!(v.whole_object_sha1(), Some("abc"));
    }

    #[test]
    fn test_last_modified() {
        let mut v = version(None);
        assert!(v.last_modified().is_none());

        v.file_info.insert(
            SRC_LAST_MODIFIED_MILLIS.to_string(),
            "1439083733000".to_string(),
        );
        let ts = v.last_modified().unwrap();
        assert_eq!(ts.timestamp_millis(), 1_439_083_733_000);
    }

    #[test]
    fn test_file_version_from_json() {
        let json = r#"{
            "accountId": "12f634bf3cbz",
            "action": "upload",
            "bucketId": "e73ede9c9c8412db49f60715",
            "contentLength": 46,
            "contentSha1": "bae5ed658ab3546aee12f23f36392f35dba1ebdd",
            "contentType": "text/plain",
            "fileId": "4_h4a48fe8875c6214145260818_f000000000000472a",
            "fileInfo": {"src_last_modified_millis": "1439083733000"},
            "fileName": "typing_test.txt",
            "uploadTimestamp": 1439083733000
        }"#;

        let v: FileVersion = serde_json::from_str(json).unwrap();
        assert_eq!(v.file_name, "typing_test.txt");
        assert_eq!(v.content_length, 46);
        assert!(v.last_modified().is_some());
        assert!(!v.is_folder());
    }

    #[test]
    fn test_list_request_builder() {
        let request = ListFilesRequest::new("bucket")
            .with_prefix("logs/")
            .with_delimiter("/")
            .with_page_size(100);
        let next = request.at(Some(ListCursor::from_name("logs/b")));

        assert_eq!(next.prefix.as_deref(), Some("logs/"));
        assert_eq!(next.page_size, 100);
        assert_eq!(next.cursor.unwrap().start_name.as_deref(), Some("logs/b"));
        assert!(request.cursor.is_none());
    }
}
