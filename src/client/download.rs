//! HTTP download client for checkpoint files.
//!
//! - Retry with exponential backoff on network errors and 5xx responses
//! - No retry on 401/403/404 (the location is wrong, not flaky)
//! - Streams to `<dest>.part`, then renames, so a crash never leaves a
//!   truncated checkpoint at the final path
//! - The timeout bounds connecting and each read, not the whole transfer:
//!   multi-gigabyte checkpoints on a slow link still finish while they make
//!   progress

use crate::models::{MaskflowError, Result, Stage};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Outcome of a single download attempt.
enum AttemptError {
    /// Worth trying again after a backoff
    Retry(MaskflowError),
    /// Give up immediately
    Fatal(MaskflowError),
}

/// Checkpoint download client.
pub struct DownloadClient {
    client: reqwest::Client,
    timeout: Duration,
    max_retries: u32,
}

impl DownloadClient {
    /// Create a new download client.
    pub fn new(timeout_secs: Option<u64>, max_retries: Option<u32>) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_secs.unwrap_or(600));

        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .user_agent(concat!("maskflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(MaskflowError::Network)?;

        Ok(Self {
            client,
            timeout,
            max_retries: max_retries.unwrap_or(3).max(1),
        })
    }

    /// Download `url` to `destination`, returning the number of bytes written.
    pub async fn download(&self, url: &str, destination: &Path) -> Result<u64> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| MaskflowError::io(Stage::Checkpoint, "creating checkpoint dir", e))?;
        }

        let part = part_path(destination);
        let mut last_error: Option<MaskflowError> = None;

        info!(url = %url, destination = %destination.display(), "Downloading checkpoint");

        for attempt in 0..self.max_retries {
            match self.attempt(url, &part).await {
                Ok(bytes) => {
                    fs::rename(&part, destination)
                        .await
                        .map_err(|e| MaskflowError::io(Stage::Checkpoint, "renaming downloaded checkpoint", e))?;
                    info!(bytes = bytes, path = %destination.display(), "Checkpoint saved");
                    return Ok(bytes);
                }
                Err(AttemptError::Fatal(e)) => {
                    let _ = fs::remove_file(&part).await;
                    return Err(match e {
                        MaskflowError::FetchFailed { .. } => e,
                        other => MaskflowError::fetch_failed(url, other),
                    });
                }
                Err(AttemptError::Retry(e)) => {
                    let _ = fs::remove_file(&part).await;
                    warn!(attempt = attempt + 1, error = %e, "Checkpoint download attempt failed");
                    last_error = Some(e);
                    if attempt < self.max_retries - 1 {
                        let backoff = Duration::from_secs(2u64.pow(attempt));
                        debug!(backoff_secs = backoff.as_secs(), "Retrying download");
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt made".to_string());
        Err(MaskflowError::fetch_failed(
            url,
            format!("{reason} (after {} attempts)", self.max_retries),
        ))
    }

    async fn attempt(&self, url: &str, part: &Path) -> std::result::Result<u64, AttemptError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AttemptError::Retry(self.network_error(e)))?;

        let status = response.status();
        if !status.is_success() {
            let error = MaskflowError::fetch_failed(url, format!("HTTP status {status}"));
            return Err(match status.as_u16() {
                401 | 403 | 404 => AttemptError::Fatal(error),
                _ => AttemptError::Retry(error),
            });
        }

        let pb = download_progress(response.content_length());
        let mut response = response;
        let mut file = File::create(part)
            .await
            .map_err(|e| AttemptError::Fatal(MaskflowError::io(Stage::Checkpoint, "creating partial checkpoint", e)))?;
        let mut written = 0u64;

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| AttemptError::Retry(self.network_error(e)))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| AttemptError::Fatal(MaskflowError::io(Stage::Checkpoint, "writing checkpoint", e)))?;
            written += chunk.len() as u64;
            pb.set_position(written);
        }

        file.flush()
            .await
            .map_err(|e| AttemptError::Fatal(MaskflowError::io(Stage::Checkpoint, "flushing checkpoint", e)))?;
        file.sync_all()
            .await
            .map_err(|e| AttemptError::Fatal(MaskflowError::io(Stage::Checkpoint, "syncing checkpoint", e)))?;
        pb.finish_and_clear();

        Ok(written)
    }

    fn network_error(&self, e: reqwest::Error) -> MaskflowError {
        if e.is_timeout() {
            MaskflowError::Timeout(self.timeout)
        } else {
            MaskflowError::Network(e)
        }
    }
}

/// Temporary path a download is streamed into.
pub fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

fn download_progress(content_length: Option<u64>) -> ProgressBar {
    match content_length {
        Some(len) => {
            let pb = ProgressBar::new(len);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] {bar:40.cyan/blue} {bytes}/{total_bytes} ({eta})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("##-"),
            );
            pb
        }
        None => ProgressBar::new_spinner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Serve the same raw HTTP response to every connection.
    async fn serve(status_line: &'static str, body: &'static str) -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "{status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (addr, hits)
    }

    /// Send headers for a `body_len` byte body, then one byte per `gap`.
    async fn serve_slowly(body_len: usize, gap: Duration) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {body_len}\r\nConnection: close\r\n\r\n"
            );
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.flush().await;
            for _ in 0..body_len {
                tokio::time::sleep(gap).await;
                let _ = socket.write_all(b"w").await;
                let _ = socket.flush().await;
            }
            let _ = socket.shutdown().await;
        });

        addr
    }

    #[test]
    fn test_part_path() {
        assert_eq!(
            part_path(Path::new("/cache/sam/checkpoints/sam_vit_b.pth")),
            PathBuf::from("/cache/sam/checkpoints/sam_vit_b.pth.part")
        );
    }

    #[tokio::test]
    async fn test_download_writes_destination() {
        let (addr, hits) = serve("HTTP/1.1 200 OK", "weights").await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("checkpoints").join("sam_vit_b.pth");

        let client = DownloadClient::new(Some(10), Some(1)).unwrap();
        let bytes = client
            .download(&format!("http://{addr}/sam_vit_b.pth"), &dest)
            .await
            .unwrap();

        assert_eq!(bytes, 7);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "weights");
        assert!(!part_path(&dest).exists());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let (addr, hits) = serve("HTTP/1.1 404 Not Found", "").await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("sam_vit_b.pth");

        let client = DownloadClient::new(Some(10), Some(3)).unwrap();
        let err = client
            .download(&format!("http://{addr}/missing.pth"), &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, MaskflowError::FetchFailed { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_unreachable_host_fails() {
        // Bind then drop to get a port nothing listens on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("sam_vit_b.pth");

        let client = DownloadClient::new(Some(5), Some(1)).unwrap();
        let err = client
            .download(&format!("http://{addr}/sam_vit_b.pth"), &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, MaskflowError::FetchFailed { .. }));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_slow_download_outlives_timeout_while_progressing() {
        let addr = serve_slowly(6, Duration::from_millis(400)).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("sam_vit_h.pth");

        let client = DownloadClient::new(Some(1), Some(1)).unwrap();
        let bytes = client
            .download(&format!("http://{addr}/sam_vit_h.pth"), &dest)
            .await
            .unwrap();

        assert_eq!(bytes, 6);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "wwwwww");
    }

    #[tokio::test]
    async fn test_stalled_download_times_out() {
        let addr = serve_slowly(2, Duration::from_secs(3)).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("sam_vit_h.pth");

        let client = DownloadClient::new(Some(1), Some(1)).unwrap();
        let err = client
            .download(&format!("http://{addr}/sam_vit_h.pth"), &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, MaskflowError::FetchFailed { .. }));
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }
}
