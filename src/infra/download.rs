//! HTTP download functionality
//!
//! Downloads are exposed as lazy streams of [`DownloadProgress`]. Nothing is
//! requested until the stream is first polled. The connection attempt is
//! retried with exponential backoff; the body is hashed while it is written.
//! Dropping the stream before the final element deletes the partial file.

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::config::defaults;
use crate::core::model::DownloadProgress;
use crate::error::DownloadError;

/// Stream of progress elements ending with `is_completed == true`
pub type ProgressStream = BoxStream<'static, Result<DownloadProgress, DownloadError>>;

/// HTTP client with retry settings
#[derive(Debug, Clone)]
pub struct DownloadManager {
    client: reqwest::Client,
    max_retries: u32,
    base_delay_ms: u64,
}

impl DownloadManager {
    /// Create a download manager with default retry settings
    pub fn new() -> Self {
        Self::with_config(
            defaults::MAX_DOWNLOAD_RETRIES,
            defaults::DOWNLOAD_BASE_DELAY_MS,
        )
    }

    /// Create a download manager with custom retry settings
    pub fn with_config(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            max_retries,
            base_delay_ms,
        }
    }

    /// Get max retries
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Stream the body at `url` into `dest`, verifying it against `expected_checksum`
    pub fn transfer(&self, url: &str, dest: PathBuf, expected_checksum: &str) -> ProgressStream {
        let request = Request {
            manager: self.clone(),
            url: url.to_string(),
            dest,
            expected: expected_checksum.trim().to_lowercase(),
        };
        stream::unfold(State::Connect(Box::new(request)), step).boxed()
    }

    /// Issue the GET, retrying connection failures and server errors
    async fn connect(&self, url: &str) -> Result<reqwest::Response, DownloadError> {
        let attempts_allowed = self.max_retries.max(1);
        let mut attempts = 0;
        let mut delay_ms = self.base_delay_ms;

        loop {
            attempts += 1;
            let error = match self.client.get(url).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) if response.status().is_client_error() => {
                    // Retrying will not make a missing or forbidden artifact appear
                    return Err(DownloadError::NetworkError {
                        url: url.to_string(),
                        error: format!("HTTP {}", response.status()),
                    });
                }
                Ok(response) => format!("HTTP {}", response.status()),
                Err(e) => e.to_string(),
            };

            if attempts >= attempts_allowed {
                tracing::warn!("Giving up on {} after {} attempts: {}", url, attempts, error);
                return Err(if attempts_allowed > 1 {
                    DownloadError::MaxRetriesExceeded {
                        url: url.to_string(),
                        retries: self.max_retries,
                    }
                } else {
                    DownloadError::NetworkError {
                        url: url.to_string(),
                        error,
                    }
                });
            }

            tracing::info!("Attempt {} for {} failed ({}), retrying in {}ms", attempts, url, error, delay_ms);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            delay_ms = (delay_ms * 2).min(defaults::DOWNLOAD_MAX_DELAY_MS);
        }
    }
}

impl Default for DownloadManager {
    fn default() -> Self {
        Self::new()
    }
}

struct Request {
    manager: DownloadManager,
    url: String,
    dest: PathBuf,
    expected: String,
}

struct Transfer {
    url: String,
    dest: PathBuf,
    expected: String,
    body: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    file: File,
    hasher: Sha256,
    downloaded: u64,
    total: u64,
    started: Instant,
    completed: bool,
}

impl Transfer {
    fn progress(&self, is_completed: bool) -> DownloadProgress {
        let total = if is_completed && self.total == 0 {
            self.downloaded
        } else {
            self.total
        };
        DownloadProgress {
            bytes_downloaded: self.downloaded,
            total_bytes: total,
            progress: if is_completed {
                100.0
            } else {
                percent(self.downloaded, total)
            },
            speed_bps: speed(self.downloaded, self.started.elapsed()),
            is_completed,
        }
    }

    fn io_error(&self, e: &std::io::Error) -> DownloadError {
        DownloadError::IoError {
            path: self.dest.clone(),
            error: e.to_string(),
        }
    }
}

impl Drop for Transfer {
    fn drop(&mut self) {
        if !self.completed && std::fs::remove_file(&self.dest).is_ok() {
            tracing::debug!("Removed partial download {}", self.dest.display());
        }
    }
}

enum State {
    Connect(Box<Request>),
    Transfer(Box<Transfer>),
    Done,
}

async fn step(state: State) -> Option<(Result<DownloadProgress, DownloadError>, State)> {
    match state {
        State::Done => None,
        State::Connect(request) => Some(match open(*request).await {
            Ok(transfer) => {
                let first = transfer.progress(false);
                (Ok(first), State::Transfer(Box::new(transfer)))
            }
            Err(e) => (Err(e), State::Done),
        }),
        State::Transfer(mut transfer) => Some(match transfer.body.next().await {
            Some(Ok(chunk)) => {
                if let Err(e) = transfer.file.write_all(&chunk).await {
                    (Err(transfer.io_error(&e)), State::Done)
                } else {
                    transfer.hasher.update(&chunk);
                    transfer.downloaded += chunk.len() as u64;
                    (Ok(transfer.progress(false)), State::Transfer(transfer))
                }
            }
            Some(Err(e)) => (
                Err(DownloadError::NetworkError {
                    url: transfer.url.clone(),
                    error: e.to_string(),
                }),
                State::Done,
            ),
            None => (finish(&mut transfer).await, State::Done),
        }),
    }
}

async fn open(request: Request) -> Result<Transfer, DownloadError> {
    let response = request.manager.connect(&request.url).await?;
    let total = response.content_length().unwrap_or(0);

    if let Some(parent) = request.dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::IoError {
                path: parent.to_path_buf(),
                error: e.to_string(),
            })?;
    }
    let file = File::create(&request.dest)
        .await
        .map_err(|e| DownloadError::IoError {
            path: request.dest.clone(),
            error: e.to_string(),
        })?;

    tracing::info!("Downloading {} ({} bytes)", request.url, total);
    Ok(Transfer {
        url: request.url,
        dest: request.dest,
        expected: request.expected,
        body: response.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed(),
        file,
        hasher: Sha256::new(),
        downloaded: 0,
        total,
        started: Instant::now(),
        completed: false,
    })
}

async fn finish(transfer: &mut Transfer) -> Result<DownloadProgress, DownloadError> {
    if let Err(e) = transfer.file.flush().await {
        return Err(transfer.io_error(&e));
    }
    let actual = hex::encode(std::mem::take(&mut transfer.hasher).finalize());
    if actual != transfer.expected {
        tracing::warn!(
            "Checksum mismatch for {}: expected {}, got {}",
            transfer.dest.display(),
            transfer.expected,
            actual
        );
        // Drop removes the corrupt file
        return Err(DownloadError::ChecksumFailed {
            file: transfer.dest.display().to_string(),
        });
    }
    transfer.completed = true;
    tracing::info!("Downloaded {} bytes to {}", transfer.downloaded, transfer.dest.display());
    Ok(transfer.progress(true))
}

#[allow(clippy::cast_precision_loss)]
fn percent(done: u64, total: u64) -> f32 {
    if total == 0 {
        0.0
    } else {
        (done as f32 / total as f32 * 100.0).min(100.0)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn speed(bytes: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs <= f64::EPSILON {
        0
    } else {
        (bytes as f64 / secs) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const HELLO_SHA: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    async fn collect(stream: ProgressStream) -> Vec<Result<DownloadProgress, DownloadError>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_transfer_completes_with_final_element() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rom.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello world".to_vec()))
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("dl/rom.zip");
        let manager = DownloadManager::with_config(1, 10);
        let items = collect(manager.transfer(&format!("{}/rom.zip", server.uri()), dest.clone(), HELLO_SHA)).await;

        let last = items.last().unwrap().as_ref().unwrap();
        assert!(last.is_completed);
        assert_eq!(last.bytes_downloaded, 11);
        assert!((last.progress - 100.0).abs() < f32::EPSILON);
        let progress: Vec<f32> = items.iter().map(|i| i.as_ref().unwrap().progress).collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_checksum_mismatch_deletes_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tampered".to_vec()))
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("rom.zip");
        let manager = DownloadManager::with_config(1, 10);
        let items = collect(manager.transfer(&server.uri(), dest.clone(), HELLO_SHA)).await;

        assert!(matches!(
            items.last().unwrap(),
            Err(DownloadError::ChecksumFailed { .. })
        ));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let manager = DownloadManager::with_config(3, 1);
        let items = collect(manager.transfer(&server.uri(), temp.path().join("x"), HELLO_SHA)).await;

        assert_eq!(items.len(), 1);
        assert!(matches!(
            items[0],
            Err(DownloadError::MaxRetriesExceeded { retries: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let manager = DownloadManager::with_config(3, 1);
        let items = collect(manager.transfer(&server.uri(), temp.path().join("x"), HELLO_SHA)).await;
        assert!(matches!(items[0], Err(DownloadError::NetworkError { .. })));
    }

    #[tokio::test]
    async fn test_dropping_stream_removes_partial_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 64 * 1024]))
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("rom.zip");
        let manager = DownloadManager::with_config(1, 10);
        let mut stream = manager.transfer(&server.uri(), dest.clone(), HELLO_SHA);

        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.is_completed);
        assert!(dest.exists());
        drop(stream);
        assert!(!dest.exists());
    }

    #[test]
    fn test_nothing_happens_until_polled() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("lazy.zip");
        let _stream = DownloadManager::new().transfer("http://127.0.0.1:9/never", dest.clone(), HELLO_SHA);
        assert!(!dest.exists());
    }

    #[test]
    fn test_percent_bounds() {
        assert!((percent(5, 0)).abs() < f32::EPSILON);
        assert!((percent(200, 100) - 100.0).abs() < f32::EPSILON);
    }
}
