use std::fs::{self, File};
use std::path::Path;
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::error::JoinError;

pub trait ShardDownloader: Send + Sync {
    /// Fetches `url` into `destination`, creating parent directories.
    fn download(&self, url: &str, destination: &Path) -> Result<(), JoinError>;
}

#[derive(Clone)]
pub struct HttpShardDownloader {
    client: Client,
}

impl HttpShardDownloader {
    pub fn new() -> Result<Self, JoinError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("scirex-join/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| JoinError::DownloadHttp(err.to_string()))?,
        );
        // Shards run to several gigabytes, so only the connect phase is bounded.
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .timeout(None)
            .build()
            .map_err(|err| JoinError::DownloadHttp(err.to_string()))?;
        Ok(Self { client })
    }

    fn write_response_to_file(
        &self,
        mut response: reqwest::blocking::Response,
        destination: &Path,
    ) -> Result<(), JoinError> {
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "shard download failed".to_string());
            return Err(JoinError::DownloadStatus { status, message });
        }
        let mut file =
            File::create(destination).map_err(|err| JoinError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| JoinError::DownloadHttp(err.to_string()))?;
        Ok(())
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, JoinError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 500;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        tracing::debug!(status, delay_ms = delay, "retrying shard download");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(JoinError::DownloadHttp(err.to_string()));
                }
            }
        }
    }
}

impl ShardDownloader for HttpShardDownloader {
    fn download(&self, url: &str, destination: &Path) -> Result<(), JoinError> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|err| JoinError::Filesystem(err.to_string()))?;
        }
        let response = self.send_with_retries(|| self.client.get(url))?;
        self.write_response_to_file(response, destination)
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}
