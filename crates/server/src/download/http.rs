//! HTTP(S) fetcher with segmented, resumable transfers.

use super::fetcher::{FetchError, Fetcher, Probe};
use crate::metrics;
use crate::ratelimit::BandwidthLimiter;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, RANGE};
use std::collections::BTreeSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use stowage_core::config::DownloadConfig;
use stowage_core::download::{Segment, plan_segments};
use stowage_core::filename;
use time::OffsetDateTime;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

/// Suffix of the sidecar holding the contiguous completed prefix of a segmented fetch.
const WATERMARK_SUFFIX: &str = "part";

#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    chunk_size: u64,
    max_concurrent: usize,
    max_retries: u32,
    backoff_step: Duration,
    limiter: Option<Arc<BandwidthLimiter>>,
}

impl HttpFetcher {
    pub fn new(config: &DownloadConfig, limiter: Option<Arc<BandwidthLimiter>>) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.timeout())
            .read_timeout(config.timeout())
            .build()
            .map_err(|e| FetchError::Invalid(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            chunk_size: config.chunk_size.max(1),
            max_concurrent: config.max_concurrent.max(1),
            max_retries: config.max_retries,
            backoff_step: Duration::from_secs(2),
            limiter,
        })
    }

    /// Shorten retry backoff. Tests only.
    pub fn with_backoff_step(mut self, step: Duration) -> Self {
        self.backoff_step = step;
        self
    }

    async fn segmented(
        &self,
        url: &str,
        dest: &Path,
        size: u64,
        cancel: CancellationToken,
        progress: Arc<AtomicU64>,
    ) -> Result<u64, FetchError> {
        let watermark_path = watermark_path(dest);
        let existing = read_watermark(&watermark_path).await.min(size);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(dest)
            .await?;
        if file.metadata().await?.len() != size {
            file.set_len(size).await?;
        }
        drop(file);

        let segments = plan_segments(size, self.chunk_size, existing);
        progress.store(existing, Ordering::Relaxed);
        tracing::debug!(segments = segments.len(), existing, size, "starting segmented fetch");

        // Workers stop early on the first hard failure without cancelling the task itself.
        let workers_cancel = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let (tx, mut rx) = mpsc::channel(segments.len().max(1));
        for segment in &segments {
            let worker = SegmentWorker {
                fetcher: self.clone(),
                url: url.to_string(),
                dest: dest.to_path_buf(),
                cancel: workers_cancel.clone(),
                progress: progress.clone(),
            };
            let (segment, semaphore, tx) = (*segment, semaphore.clone(), tx.clone());
            tokio::spawn(async move {
                let result = tokio::select! {
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(_permit) => worker.run(segment).await,
                        Err(_) => Err(FetchError::Cancelled),
                    },
                    _ = worker.cancel.cancelled() => Err(FetchError::Cancelled),
                };
                let _ = tx.send((segment.index, result)).await;
            });
        }
        drop(tx);

        let mut completed = BTreeSet::new();
        let mut watermark = existing;
        let mut failure: Option<FetchError> = None;
        while let Some((index, result)) = rx.recv().await {
            match result {
                Ok(()) => {
                    completed.insert(index);
                    let advanced = contiguous_end(&segments, &completed).unwrap_or(watermark);
                    if advanced > watermark {
                        watermark = advanced;
                        tokio::fs::write(&watermark_path, watermark.to_string()).await?;
                    }
                }
                Err(e) => {
                    if failure.is_none() {
                        tracing::warn!(segment = index, error = %e, "segment failed, stopping workers");
                        workers_cancel.cancel();
                        failure = Some(e);
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        if let Some(e) = failure {
            return Err(e);
        }
        let _ = tokio::fs::remove_file(&watermark_path).await;
        Ok(size)
    }

    async fn single_stream(
        &self,
        url: &str,
        dest: &Path,
        probe: &Probe,
        cancel: CancellationToken,
        progress: Arc<AtomicU64>,
    ) -> Result<u64, FetchError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self
                .single_attempt(url, dest, probe, &cancel, &progress)
                .await
            {
                Ok(len) => return Ok(len),
                Err(e) if e.is_retryable() && attempt <= self.max_retries => {
                    tracing::warn!(attempt, error = %e, "stream fetch failed, retrying");
                    metrics::DOWNLOAD_RETRIES.inc();
                    self.backoff(attempt, &cancel).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn single_attempt(
        &self,
        url: &str,
        dest: &Path,
        probe: &Probe,
        cancel: &CancellationToken,
        progress: &AtomicU64,
    ) -> Result<u64, FetchError> {
        let on_disk = match tokio::fs::metadata(dest).await {
            Ok(meta) => Some(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        if let (Some(len), Some(size)) = (on_disk, probe.size)
            && len >= size
        {
            progress.store(len, Ordering::Relaxed);
            return Ok(len);
        }
        let mut existing = on_disk.unwrap_or(0);

        let mut request = self.client.get(url);
        if existing > 0 && probe.supports_range {
            request = request.header(RANGE, format!("bytes={existing}-"));
        }
        let response = request.send().await.map_err(unreachable)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Unreachable(format!("server answered {status}")));
        }
        if existing > 0 && status != StatusCode::PARTIAL_CONTENT {
            tracing::debug!(existing, "server ignored the resume range, restarting");
            existing = 0;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(existing == 0)
            .open(dest)
            .await?;
        file.seek(SeekFrom::Start(existing)).await?;
        progress.store(existing, Ordering::Relaxed);

        let mut written = existing;
        let mut body = response.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                next = body.next() => next,
            };
            let Some(frame) = next else { break };
            let frame = frame.map_err(unreachable)?;
            if let Some(limiter) = &self.limiter {
                limiter.acquire(frame.len()).await;
            }
            file.write_all(&frame).await?;
            written += frame.len() as u64;
            progress.store(written, Ordering::Relaxed);
            metrics::DOWNLOAD_BYTES.inc_by(frame.len() as u64);
        }
        file.flush().await?;
        file.sync_all().await?;

        if let Some(size) = probe.size
            && written != size
        {
            return Err(FetchError::Unreachable(format!(
                "stream ended at {written} of {size} bytes"
            )));
        }
        Ok(written)
    }

    /// Sleep `attempt × step`, waking early on cancellation.
    async fn backoff(&self, attempt: u32, cancel: &CancellationToken) -> Result<(), FetchError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            _ = tokio::time::sleep(self.backoff_step * attempt) => Ok(()),
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[tracing::instrument(skip(self))]
    async fn probe(&self, url: &str) -> Result<Probe, FetchError> {
        let response = self.client.head(url).send().await.map_err(unreachable)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Unreachable(format!("server answered {status}")));
        }
        let headers = response.headers();
        let supports_range = headers
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.split(',').any(|unit| unit.trim().eq_ignore_ascii_case("bytes")));
        let size = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let disposition = headers.get(CONTENT_DISPOSITION).and_then(|v| v.to_str().ok());
        let file_name = filename::choose(disposition, url, OffsetDateTime::now_utc().unix_timestamp())
            .map_err(|e| FetchError::Invalid(e.to_string()))?;

        tracing::debug!(%file_name, ?size, supports_range, "probed source");
        Ok(Probe {
            file_name,
            size,
            supports_range,
        })
    }

    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        probe: &Probe,
        cancel: CancellationToken,
        progress: Arc<AtomicU64>,
    ) -> Result<u64, FetchError> {
        // A source that fits in one segment gains nothing from ranged requests.
        match probe.size {
            Some(size) if size > self.chunk_size && probe.supports_range => {
                self.segmented(url, dest, size, cancel, progress).await
            }
            _ => self.single_stream(url, dest, probe, cancel, progress).await,
        }
    }
}

/// One segment's ranged GET, retried with linear backoff.
struct SegmentWorker {
    fetcher: HttpFetcher,
    url: String,
    dest: PathBuf,
    cancel: CancellationToken,
    progress: Arc<AtomicU64>,
}

impl SegmentWorker {
    async fn run(&self, segment: Segment) -> Result<(), FetchError> {
        let mut offset = segment.start;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.attempt(segment, &mut offset).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt <= self.fetcher.max_retries => {
                    tracing::debug!(segment = segment.index, attempt, error = %e, "segment retry");
                    metrics::DOWNLOAD_RETRIES.inc();
                    self.fetcher.backoff(attempt, &self.cancel).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fetch `[offset, segment.end]`, advancing `offset` as bytes land.
    async fn attempt(&self, segment: Segment, offset: &mut u64) -> Result<(), FetchError> {
        if *offset > segment.end {
            return Ok(());
        }
        let response = self
            .fetcher
            .client
            .get(&self.url)
            .header(RANGE, format!("bytes={}-{}", *offset, segment.end))
            .send()
            .await
            .map_err(unreachable)?;
        match response.status() {
            StatusCode::PARTIAL_CONTENT => {}
            status if status.is_success() => {
                return Err(FetchError::Invalid(
                    "server ignored the range request".to_string(),
                ));
            }
            status => return Err(FetchError::Unreachable(format!("server answered {status}"))),
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.dest)
            .await?;
        file.seek(SeekFrom::Start(*offset)).await?;

        let mut body = response.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
                next = body.next() => next,
            };
            let Some(frame) = next else { break };
            let frame = frame.map_err(unreachable)?;
            let room = segment.end + 1 - *offset;
            let frame = if frame.len() as u64 > room {
                frame.slice(..room as usize)
            } else {
                frame
            };
            if let Some(limiter) = &self.fetcher.limiter {
                limiter.acquire(frame.len()).await;
            }
            file.write_all(&frame).await?;
            *offset += frame.len() as u64;
            self.progress.fetch_add(frame.len() as u64, Ordering::Relaxed);
            metrics::DOWNLOAD_BYTES.inc_by(frame.len() as u64);
            if *offset > segment.end {
                break;
            }
        }
        file.flush().await?;

        if *offset <= segment.end {
            return Err(FetchError::Unreachable(format!(
                "segment {} ended early at {}",
                segment.index, *offset
            )));
        }
        Ok(())
    }
}

fn unreachable(err: reqwest::Error) -> FetchError {
    FetchError::Unreachable(err.to_string())
}

fn watermark_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(WATERMARK_SUFFIX);
    dest.with_file_name(name)
}

async fn read_watermark(path: &Path) -> u64 {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => text.trim().parse().unwrap_or(0),
        Err(_) => 0,
    }
}

/// End (exclusive) of the completed run starting at the first planned segment.
fn contiguous_end(segments: &[Segment], completed: &BTreeSet<usize>) -> Option<u64> {
    let mut end = None;
    for segment in segments {
        if !completed.contains(&segment.index) {
            break;
        }
        end = Some(segment.end + 1);
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_sits_next_to_the_partial_file() {
        assert_eq!(
            watermark_path(Path::new("/tmp/download_x/movie.mkv")),
            PathBuf::from("/tmp/download_x/movie.mkv.part")
        );
    }

    #[test]
    fn contiguous_end_stops_at_the_first_gap() {
        let segments = plan_segments(100, 10, 0);
        let mut done = BTreeSet::new();
        assert_eq!(contiguous_end(&segments, &done), None);
        done.extend([0, 1, 3]);
        assert_eq!(contiguous_end(&segments, &done), Some(20));
        done.insert(2);
        assert_eq!(contiguous_end(&segments, &done), Some(40));
    }
}
