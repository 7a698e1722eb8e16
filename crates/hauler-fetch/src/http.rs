//! Reqwest-based implementation of the download executor.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use hauler_core::{control_path, CancelFlag};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::progress::ProgressLedger;
use crate::segment::{plan_ranges, ByteRange};
use crate::{DownloadExecutor, FetchError, FetchOutcome, FetchRequest, UrlRefresh};

/// Bytes streamed between free-space checks.
const FREE_CHECK_INTERVAL: u64 = 32 * 1024 * 1024;

/// Tuning for [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct HttpFetcherConfig {
    /// Minimum size before a download is split into parallel ranges.
    pub segment_min_bytes: u64,
    /// Retries on retriable failure.
    pub retries: u32,
    /// Base backoff between attempts; grows linearly per attempt.
    pub retry_backoff: Duration,
    /// Live free-space guard; 0 disables the check.
    pub min_free_bytes: u64,
    /// Connect timeout.
    pub connect_timeout: Duration,
    /// Per-read socket timeout.
    pub read_timeout: Duration,
}

impl Default for HttpFetcherConfig {
    fn default() -> Self {
        Self {
            segment_min_bytes: 512 * 1024 * 1024,
            retries: 2,
            retry_backoff: Duration::from_secs(1),
            min_free_bytes: 0,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
        }
    }
}

/// Segmented HTTP downloader.
pub struct HttpFetcher {
    http: reqwest::Client,
    config: HttpFetcherConfig,
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
struct Probe {
    total: Option<u64>,
    ranges: bool,
}

impl HttpFetcher {
    /// Build a fetcher with the given tuning.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] if the HTTP client cannot be built.
    pub fn new(config: HttpFetcherConfig) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()
            .map_err(|err| FetchError::Transient(err.to_string()))?;
        Ok(Self { http, config })
    }

    /// Probe size and range support with a one-byte range request.
    async fn probe(&self, url: &str) -> Probe {
        let response = self
            .http
            .get(url)
            .header(reqwest::header::RANGE, "bytes=0-0")
            .send()
            .await;
        match response {
            Ok(response) if response.status().as_u16() == 206 => {
                let total = response
                    .headers()
                    .get(reqwest::header::CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range_total);
                Probe {
                    total,
                    ranges: true,
                }
            }
            Ok(response) => Probe {
                total: response.content_length(),
                ranges: false,
            },
            Err(err) => {
                debug!(error = %err, "size probe failed; falling back to sequential");
                Probe {
                    total: None,
                    ranges: false,
                }
            }
        }
    }

    async fn attempt(
        &self,
        url: &str,
        output: &Path,
        segments: u32,
        cancel: &CancelFlag,
        ledger: &Arc<ProgressLedger>,
    ) -> Result<u64, FetchError> {
        let probe = self.probe(url).await;
        match probe.total {
            Some(total)
                if probe.ranges && segments > 1 && total >= self.config.segment_min_bytes =>
            {
                self.fetch_segmented(url, output, total, segments, cancel, ledger)
                    .await
            }
            _ => self.fetch_sequential(url, output, cancel, ledger).await,
        }
    }

    async fn fetch_sequential(
        &self,
        url: &str,
        output: &Path,
        cancel: &CancelFlag,
        ledger: &ProgressLedger,
    ) -> Result<u64, FetchError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::Transient(err.to_string()))?;
        check_status(response.status().as_u16())?;

        let mut file = File::create(output).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0_u64;
        let mut since_check = 0_u64;
        while let Some(chunk) = stream.next().await {
            if cancel.is_set() {
                let _ = file.flush().await;
                return Err(FetchError::Canceled);
            }
            let chunk = chunk.map_err(|err| FetchError::Transient(err.to_string()))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            since_check += chunk.len() as u64;
            ledger.add(chunk.len() as u64).await;
            if since_check >= FREE_CHECK_INTERVAL {
                since_check = 0;
                self.check_free_space(output)?;
            }
        }
        file.flush().await?;
        Ok(written)
    }

    async fn fetch_segmented(
        &self,
        url: &str,
        output: &Path,
        total: u64,
        segments: u32,
        cancel: &CancelFlag,
        ledger: &Arc<ProgressLedger>,
    ) -> Result<u64, FetchError> {
        // pre-allocate so every segment can seek-and-write in place
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(output)
            .await?;
        file.set_len(total).await?;
        drop(file);

        let ranges = plan_ranges(total, segments);
        debug!(total, segments = ranges.len(), "starting segmented download");
        let mut handles = Vec::with_capacity(ranges.len());
        for range in ranges {
            let http = self.http.clone();
            let url = url.to_owned();
            let output = output.to_owned();
            let cancel = cancel.clone();
            let min_free = self.config.min_free_bytes;
            let ledger = Arc::clone(ledger);
            handles.push(tokio::spawn(async move {
                fetch_range(&http, &url, &output, range, &cancel, min_free, &ledger).await
            }));
        }
        let mut written = 0_u64;
        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(bytes)) => written += bytes,
                Ok(Err(err)) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Err(join) => {
                    if first_error.is_none() {
                        first_error = Some(FetchError::Transient(format!(
                            "segment worker panicked: {join}"
                        )));
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(written),
        }
    }

    fn check_free_space(&self, output: &Path) -> Result<(), FetchError> {
        check_free_space_at(output, self.config.min_free_bytes)
    }
}

async fn fetch_range(
    http: &reqwest::Client,
    url: &str,
    output: &Path,
    range: ByteRange,
    cancel: &CancelFlag,
    min_free_bytes: u64,
    ledger: &ProgressLedger,
) -> Result<u64, FetchError> {
    let response = http
        .get(url)
        .header(reqwest::header::RANGE, range.header_value())
        .send()
        .await
        .map_err(|err| FetchError::Transient(err.to_string()))?;
    let status = response.status().as_u16();
    if status != 206 {
        check_status(status)?;
        return Err(FetchError::Transient(format!(
            "expected partial content, got http {status}"
        )));
    }

    let mut file = OpenOptions::new().write(true).open(output).await?;
    file.seek(std::io::SeekFrom::Start(range.start)).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0_u64;
    let mut since_check = 0_u64;
    while let Some(chunk) = stream.next().await {
        if cancel.is_set() {
            let _ = file.flush().await;
            return Err(FetchError::Canceled);
        }
        let chunk = chunk.map_err(|err| FetchError::Transient(err.to_string()))?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        since_check += chunk.len() as u64;
        ledger.add(chunk.len() as u64).await;
        if since_check >= FREE_CHECK_INTERVAL {
            since_check = 0;
            check_free_space_at(output, min_free_bytes)?;
        }
    }
    file.flush().await?;
    if written != range.len() {
        return Err(FetchError::Transient(format!(
            "range {} returned {written} bytes, expected {}",
            range.header_value(),
            range.len()
        )));
    }
    Ok(written)
}

fn check_free_space_at(output: &Path, min_free_bytes: u64) -> Result<(), FetchError> {
    if min_free_bytes == 0 {
        return Ok(());
    }
    let dir = output.parent().unwrap_or(output);
    if hauler_fsops::disk_free_bytes(dir) < min_free_bytes {
        return Err(FetchError::DiskFull);
    }
    Ok(())
}

fn check_status(status: u16) -> Result<(), FetchError> {
    match status {
        200..=299 => Ok(()),
        403 | 404 | 410 => Err(FetchError::ExpiredLink(status)),
        429 | 500..=599 => Err(FetchError::Transient(format!("upstream http {status}"))),
        other => Err(FetchError::Http(other)),
    }
}

fn parse_content_range_total(value: &str) -> Option<u64> {
    // "bytes 0-0/12345"
    value.rsplit_once('/')?.1.trim().parse().ok()
}

#[async_trait]
impl DownloadExecutor for HttpFetcher {
    async fn fetch(
        &self,
        request: FetchRequest,
        cancel: CancelFlag,
        refresh: Option<Arc<dyn UrlRefresh>>,
    ) -> Result<FetchOutcome, FetchError> {
        tokio::fs::create_dir_all(&request.dir).await?;
        let output: PathBuf = request.dir.join(&request.file_name);
        let ctrl = control_path(&output);
        // sidecar goes up before the first byte lands; it carries the
        // running payload count the monitor reads for progress
        let ledger = Arc::new(ProgressLedger::create(ctrl.clone()).await?);

        let mut url = request.url.clone();
        let mut attempt = 0_u32;
        loop {
            if cancel.is_set() {
                ledger.flush_now().await;
                return Err(FetchError::Canceled);
            }
            match self
                .attempt(&url, &output, request.segments, &cancel, &ledger)
                .await
            {
                Ok(bytes) => {
                    let _ = tokio::fs::remove_file(&ctrl).await;
                    debug!(path = %output.display(), bytes, "download complete");
                    return Ok(FetchOutcome {
                        bytes_written: bytes,
                        path: output,
                    });
                }
                Err(FetchError::Canceled) => {
                    ledger.flush_now().await;
                    return Err(FetchError::Canceled);
                }
                Err(err) if attempt < self.config.retries && err.is_retriable() => {
                    attempt += 1;
                    warn!(
                        url = %request.url,
                        attempt,
                        error = %err,
                        "download attempt failed; backing off"
                    );
                    ledger.flush_now().await;
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                    if err.is_expired_link() {
                        if let Some(refresher) = refresh.as_ref() {
                            if let Some(fresh) = refresher.refresh().await {
                                debug!("refreshed expired download url");
                                url = fresh;
                            }
                        }
                    }
                    // the next attempt truncates and starts over
                    ledger.reset().await;
                }
                Err(err) => {
                    ledger.flush_now().await;
                    return Err(err);
                }
            }
        }
    }
}
