//! Offline downloads: HTTP(S) with segmented resume, and BitTorrent behind a feature.
//!
//! Each task runs as a small worker graph registered with the
//! [`DownloadSupervisor`]. Pause and cancel persist the new state first and
//! then trip the task's cancellation token; resume re-plans the remaining
//! segments from what is already on disk.

pub mod engine;
pub mod fetcher;
pub mod http;
pub mod progress;
pub mod supervisor;
pub mod torrent;

pub use engine::DownloadEngine;
pub use fetcher::{FetchError, Fetcher, Probe};
pub use http::HttpFetcher;
pub use progress::SpeedTracker;
pub use supervisor::{DownloadSupervisor, Registration};
pub use torrent::{DisabledTorrentClient, TorrentClient};
