//! Content-addressed downloading: fetch a URL to a local path, verifying it
//! against an expected SHA-1 digest, with two distinct retry policies —
//! transient network failures are retried forever on a fixed delay, a
//! checksum mismatch gets exactly one extra attempt before being treated
//! as the server serving the wrong content.

use std::path::Path;
use std::time::Duration;

use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

const BLOCK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("server returned HTTP {0}")]
    PermanentHttp(reqwest::StatusCode),
    #[error("checksum mismatch persisted across a retry: expected {expected}, got {actual} twice")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request build error: {0}")]
    Request(reqwest::Error),
}

pub struct Downloader {
    client: reqwest::Client,
    retry_delay: Duration,
}

impl Downloader {
    pub fn new(client: reqwest::Client, retry_delay: Duration) -> Self {
        Self { client, retry_delay }
    }

    /// Ensure `dest` holds the file named by `url`, verified against
    /// `expected_sha1` if given. No-ops if the file is already present and
    /// correct; otherwise downloads, verifies, and retries a checksum
    /// mismatch exactly once before giving up.
    pub async fn get_missing_file(
        &self,
        url: &str,
        dest: &Path,
        expected_sha1: Option<&str>,
    ) -> Result<(), FetchError> {
        if dest.exists() {
            match expected_sha1 {
                None => return Ok(()),
                Some(expected) => {
                    if sha1_hex(dest).await? == expected.to_lowercase() {
                        return Ok(());
                    }
                    tokio::fs::remove_file(dest).await?;
                }
            }
        }

        let mut bad_digest: Option<String> = None;
        loop {
            self.fetch_once(url, dest).await?;

            let Some(expected) = expected_sha1 else {
                return Ok(());
            };
            let expected = expected.to_lowercase();
            let actual = sha1_hex(dest).await?;
            if actual == expected {
                return Ok(());
            }

            tokio::fs::remove_file(dest).await?;
            if bad_digest.as_deref() == Some(actual.as_str()) {
                return Err(FetchError::ChecksumMismatch { expected, actual });
            }
            warn!(url, expected, actual, "checksum mismatch, retrying once");
            bad_digest = Some(actual);
        }
    }

    /// One fetch attempt: retries forever on transport errors, returns
    /// immediately on a non-2xx HTTP status.
    async fn fetch_once(&self, url: &str, dest: &Path) -> Result<(), FetchError> {
        loop {
            let response = match self.client.get(url).send().await {
                Ok(r) => r,
                Err(e) if e.is_connect() || e.is_timeout() || e.is_request() => {
                    warn!(url, error = %e, "transient network error, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                    continue;
                }
                Err(e) => return Err(FetchError::Request(e)),
            };

            // A 2xx status doesn't mean there's a body to save: 204 (No
            // Content) is how the coordinator signals "no work" on the
            // WU-fetch URL, and must be treated the same as a permanent
            // failure here rather than written out as a zero-byte file.
            if response.status() == reqwest::StatusCode::NO_CONTENT || !response.status().is_success() {
                return Err(FetchError::PermanentHttp(response.status()));
            }

            let bytes = match response.bytes().await {
                Ok(b) => b,
                Err(e) => {
                    warn!(url, error = %e, "transient network error mid-body, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                    continue;
                }
            };
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(dest, &bytes).await?;
            info!(url, bytes = bytes.len(), "downloaded");
            return Ok(());
        }
    }
}

/// Streaming SHA-1 in fixed-size blocks, to bound memory for large files.
async fn sha1_hex(path: &Path) -> Result<String, std::io::Error> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; BLOCK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
