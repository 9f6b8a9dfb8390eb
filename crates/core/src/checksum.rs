//! SHA-1 helpers; the storage API identifies content and parts by SHA-1

use crate::error::{Error, Result};
use bytes::Bytes;
use sha1::{Digest, Sha1};

/// Lowercase hex SHA-1 of `data`
pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// [`sha1_hex`] on the blocking pool; part-sized buffers stay off the async workers
pub async fn sha1_hex_blocking(data: Bytes) -> Result<String> {
    Ok(tokio::task::spawn_blocking(move || sha1_hex(&data)).await?)
}

/// Fail with an integrity error unless `actual` equals `expected`
pub fn verify_sha1(what: &str, expected: &str, actual: &str) -> Result<()> {
    if expected.eq_ignore_ascii_case(actual) {
        Ok(())
    } else {
        Err(Error::Integrity(format!(
            "{}: expected sha1 {}, got {}",
            what, expected, actual
        )))
    }
}

/// SHA-1 computed over data fed in order
#[derive(Default, Clone)]
pub struct Sha1Accumulator {
    hasher: Sha1,
    bytes: u64,
}

impl Sha1Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digests() {
        assert_eq!(sha1_hex(b""), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
        assert_eq!(sha1_hex(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_verify_sha1() {
        let sha = sha1_hex(b"abc");
        assert!(verify_sha1("part 1", &sha, &sha.to_uppercase()).is_ok());

        let err = verify_sha1("part 1", &sha, &sha1_hex(b"abd")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Integrity);
    }

    #[test]
    fn test_accumulator_matches_one_shot() {
        let mut acc = Sha1Accumulator::new();
        acc.update(b"hello ");
        acc.update(b"world");
        assert_eq!(acc.bytes(), 11);
        assert_eq!(acc.finish(), sha1_hex(b"hello world"));
    }

    #[tokio::test]
    async fn test_blocking_digest_matches_inline() {
        let data = Bytes::from(vec![42u8; 64 * 1024]);
        let digest = sha1_hex_blocking(data.clone()).await.unwrap();
        assert_eq!(digest, sha1_hex(&data));
    }
}
