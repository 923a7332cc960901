//! BitTorrent and magnet downloads.

use super::fetcher::FetchError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use tokio_util::sync::CancellationToken;

/// Downloads every file of a torrent into a directory.
#[async_trait]
pub trait TorrentClient: Send + Sync {
    /// Returns the downloaded files. `progress` tracks bytes completed.
    async fn fetch(
        &self,
        source: &str,
        output_dir: &Path,
        cancel: CancellationToken,
        progress: Arc<AtomicU64>,
    ) -> Result<Vec<PathBuf>, FetchError>;
}

/// Stand-in used when the daemon is built without the `bittorrent` feature.
#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledTorrentClient;

#[async_trait]
impl TorrentClient for DisabledTorrentClient {
    async fn fetch(
        &self,
        _source: &str,
        _output_dir: &Path,
        _cancel: CancellationToken,
        _progress: Arc<AtomicU64>,
    ) -> Result<Vec<PathBuf>, FetchError> {
        Err(FetchError::Unreachable(
            "BitTorrent support is not compiled in (enable the `bittorrent` feature)".to_string(),
        ))
    }
}

/// Every regular file under `dir`, sorted. Blocking.
pub fn collect_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let kind = entry.file_type()?;
            if kind.is_dir() {
                pending.push(entry.path());
            } else if kind.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

/// The default client for this build.
pub fn default_client(scratch: &Path) -> Arc<dyn TorrentClient> {
    #[cfg(feature = "bittorrent")]
    {
        Arc::new(rqbit::RqbitClient::new(scratch.to_path_buf()))
    }
    #[cfg(not(feature = "bittorrent"))]
    {
        let _ = scratch;
        Arc::new(DisabledTorrentClient)
    }
}

#[cfg(feature = "bittorrent")]
mod rqbit {
    use super::{FetchError, TorrentClient, collect_files};
    use async_trait::async_trait;
    use librqbit::{AddTorrent, AddTorrentOptions, AddTorrentResponse, Session};
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;
    use tokio::sync::OnceCell;
    use tokio_util::sync::CancellationToken;

    const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(5);

    /// librqbit session shared by every torrent task, created on first use.
    pub struct RqbitClient {
        default_dir: PathBuf,
        session: OnceCell<Arc<Session>>,
    }

    impl RqbitClient {
        pub fn new(default_dir: PathBuf) -> Self {
            Self {
                default_dir,
                session: OnceCell::new(),
            }
        }

        async fn session(&self) -> Result<&Arc<Session>, FetchError> {
            self.session
                .get_or_try_init(|| async {
                    Session::new(self.default_dir.clone())
                        .await
                        .map_err(|e| FetchError::Invalid(format!("torrent session: {e:#}")))
                })
                .await
        }
    }

    #[async_trait]
    impl TorrentClient for RqbitClient {
        async fn fetch(
            &self,
            source: &str,
            output_dir: &Path,
            cancel: CancellationToken,
            progress: Arc<AtomicU64>,
        ) -> Result<Vec<PathBuf>, FetchError> {
            let session = self.session().await?;
            let add = if source.starts_with("magnet:") || source.contains("://") {
                AddTorrent::from_url(source)
            } else {
                AddTorrent::from_local_filename(source)
                    .map_err(|e| FetchError::Invalid(format!("torrent file: {e:#}")))?
            };
            let options = AddTorrentOptions {
                output_folder: Some(output_dir.to_string_lossy().into_owned()),
                overwrite: true,
                ..Default::default()
            };
            let response = session
                .add_torrent(add, Some(options))
                .await
                .map_err(|e| FetchError::Unreachable(format!("{e:#}")))?;
            let handle = match response {
                AddTorrentResponse::Added(_, handle) | AddTorrentResponse::AlreadyManaged(_, handle) => handle,
                AddTorrentResponse::ListOnly(_) => {
                    return Err(FetchError::Invalid("torrent was only listed".to_string()));
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                ready = handle.wait_until_initialized() => {
                    ready.map_err(|e| FetchError::Unreachable(format!("{e:#}")))?;
                }
            }
            tracing::info!("torrent metadata received");

            let mut ticker = tokio::time::interval(PROGRESS_LOG_INTERVAL);
            let completed = handle.wait_until_completed();
            tokio::pin!(completed);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        if let Err(e) = session.pause(&handle).await {
                            tracing::warn!(error = %e, "failed to pause torrent");
                        }
                        return Err(FetchError::Cancelled);
                    }
                    done = &mut completed => {
                        done.map_err(|e| FetchError::Unreachable(format!("{e:#}")))?;
                        break;
                    }
                    _ = ticker.tick() => {
                        let stats = handle.stats();
                        progress.store(stats.progress_bytes, Ordering::Relaxed);
                        tracing::info!(
                            downloaded = stats.progress_bytes,
                            total = stats.total_bytes,
                            "torrent progress"
                        );
                    }
                }
            }

            let dir = output_dir.to_path_buf();
            let files = tokio::task::spawn_blocking(move || collect_files(&dir))
                .await
                .map_err(|e| FetchError::Invalid(e.to_string()))??;
            Ok(files)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_client_reports_unreachable() {
        let err = DisabledTorrentClient
            .fetch(
                "magnet:?xt=urn:btih:abc",
                Path::new("/tmp"),
                CancellationToken::new(),
                Arc::new(AtomicU64::new(0)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Unreachable(_)));
    }

    #[test]
    fn collect_files_walks_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("album/disc1")).unwrap();
        std::fs::write(dir.path().join("album/disc1/01.flac"), b"a").unwrap();
        std::fs::write(dir.path().join("readme.txt"), b"b").unwrap();
        let files = collect_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().any(|f| f.ends_with("album/disc1/01.flac")));
    }
}
