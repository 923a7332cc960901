//! Offline download task types and the task state machine.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for an offline download task.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DownloadTaskId(Uuid);

impl DownloadTaskId {
    /// Generate a new random task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::InvalidId(format!("invalid download task id: {e}")))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DownloadTaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DownloadTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DownloadTaskId({})", self.0)
    }
}

impl fmt::Display for DownloadTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Download task state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    Init,
    Downloading,
    Paused,
    Finished,
    Failed,
}

/// Events driving [`DownloadState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DownloadAction {
    Submit,
    Pause,
    Resume,
    Cancel,
    Complete,
    Error,
}

impl DownloadState {
    pub const ALL: [DownloadState; 5] = [
        Self::Init,
        Self::Downloading,
        Self::Paused,
        Self::Finished,
        Self::Failed,
    ];

    /// Parse from the stored string.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "init" => Ok(Self::Init),
            "downloading" => Ok(Self::Downloading),
            "paused" => Ok(Self::Paused),
            "finished" => Ok(Self::Finished),
            "failed" => Ok(Self::Failed),
            _ => Err(Error::UnknownValue(format!("download state: {s}"))),
        }
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }

    /// Only terminal tasks may be deleted.
    pub fn is_deletable(&self) -> bool {
        self.is_terminal()
    }

    /// Apply an action, returning the next state or an invalid-transition error.
    ///
    /// A task that fails before its first byte (probe error or cancel while
    /// still `init`) goes straight to `failed`.
    pub fn transition(self, action: DownloadAction) -> Result<Self> {
        use DownloadAction as A;
        let next = match (self, action) {
            (Self::Init, A::Submit) => Self::Downloading,
            (Self::Init, A::Cancel | A::Error) => Self::Failed,
            (Self::Downloading, A::Pause) => Self::Paused,
            (Self::Downloading, A::Cancel | A::Error) => Self::Failed,
            (Self::Downloading, A::Complete) => Self::Finished,
            (Self::Paused, A::Resume) => Self::Downloading,
            (Self::Paused, A::Cancel) => Self::Failed,
            (from, action) => {
                return Err(Error::InvalidStateTransition {
                    from: from.as_str().to_string(),
                    action: format!("{action:?}").to_lowercase(),
                });
            }
        };
        Ok(next)
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-facing control verbs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadControl {
    Pause,
    Resume,
    Cancel,
    Delete,
}

impl DownloadControl {
    /// Parse from a route segment.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "cancel" => Ok(Self::Cancel),
            "delete" => Ok(Self::Delete),
            _ => Err(Error::UnknownValue(format!("download control: {s}"))),
        }
    }

    /// State-machine action for this control, `None` for delete.
    pub fn action(&self) -> Option<DownloadAction> {
        match self {
            Self::Pause => Some(DownloadAction::Pause),
            Self::Resume => Some(DownloadAction::Resume),
            Self::Cancel => Some(DownloadAction::Cancel),
            Self::Delete => None,
        }
    }
}

/// Persisted source kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadKind {
    Http,
    Bt,
    Magnet,
}

impl DownloadKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "http" => Ok(Self::Http),
            "bt" => Ok(Self::Bt),
            "magnet" => Ok(Self::Magnet),
            _ => Err(Error::UnknownValue(format!("download kind: {s}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Bt => "bt",
            Self::Magnet => "magnet",
        }
    }
}

/// Where a download pulls bytes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DownloadSource {
    /// Plain HTTP(S) URL.
    Http { url: String },
    /// Magnet link, `.torrent` URL or local `.torrent` path.
    Torrent { magnet_or_path: String },
}

impl DownloadSource {
    /// Classify a submitted source string.
    pub fn parse(input: &str) -> Result<Self> {
        let source = input.trim();
        if source.is_empty() {
            return Err(Error::InvalidSource("empty source".to_string()));
        }
        let lower = source.to_ascii_lowercase();
        if lower.starts_with("magnet:") {
            return Ok(Self::Torrent {
                magnet_or_path: source.to_string(),
            });
        }
        let path_part = lower
            .split(['?', '#'])
            .next()
            .unwrap_or_default();
        if path_part.ends_with(".torrent") {
            return Ok(Self::Torrent {
                magnet_or_path: source.to_string(),
            });
        }
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return Ok(Self::Http {
                url: source.to_string(),
            });
        }
        Err(Error::InvalidSource(format!("unsupported source: {source}")))
    }

    /// Kind recorded on the task row.
    pub fn kind(&self) -> DownloadKind {
        match self {
            Self::Http { .. } => DownloadKind::Http,
            Self::Torrent { magnet_or_path } => {
                if magnet_or_path.to_ascii_lowercase().starts_with("magnet:") {
                    DownloadKind::Magnet
                } else {
                    DownloadKind::Bt
                }
            }
        }
    }

    /// The original source string.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Http { url } => url,
            Self::Torrent { magnet_or_path } => magnet_or_path,
        }
    }
}

/// A byte span `[start, end]` fetched by one download worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl Segment {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Split `[0, size)` into `chunk_size` segments and drop what `existing_len` already covers.
///
/// Segments entirely below `existing_len` are skipped; the one straddling it starts at
/// `existing_len`. The remaining segments cover `[existing_len, size)` exactly.
pub fn plan_segments(size: u64, chunk_size: u64, existing_len: u64) -> Vec<Segment> {
    if size == 0 || chunk_size == 0 {
        return Vec::new();
    }
    let count = size.div_ceil(chunk_size);
    (0..count)
        .filter_map(|i| {
            let start = i * chunk_size;
            let end = (start + chunk_size).min(size) - 1;
            if end < existing_len {
                return None;
            }
            Some(Segment {
                index: i as usize,
                start: start.max(existing_len),
                end,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_is_exhaustive() {
        use DownloadAction as A;
        use DownloadState as S;
        let actions = [
            A::Submit,
            A::Pause,
            A::Resume,
            A::Cancel,
            A::Complete,
            A::Error,
        ];
        let allowed = [
            (S::Init, A::Submit, S::Downloading),
            (S::Init, A::Cancel, S::Failed),
            (S::Init, A::Error, S::Failed),
            (S::Downloading, A::Pause, S::Paused),
            (S::Downloading, A::Cancel, S::Failed),
            (S::Downloading, A::Complete, S::Finished),
            (S::Downloading, A::Error, S::Failed),
            (S::Paused, A::Resume, S::Downloading),
            (S::Paused, A::Cancel, S::Failed),
        ];
        for state in S::ALL {
            for action in actions {
                let expected = allowed
                    .iter()
                    .find(|(s, a, _)| *s == state && *a == action)
                    .map(|(_, _, next)| *next);
                match expected {
                    Some(next) => assert_eq!(state.transition(action).unwrap(), next),
                    None => assert!(
                        state.transition(action).is_err(),
                        "{state:?} + {action:?} should be rejected"
                    ),
                }
            }
        }
    }

    #[test]
    fn terminal_states_never_move() {
        assert!(DownloadState::Finished.transition(DownloadAction::Cancel).is_err());
        assert!(DownloadState::Failed.transition(DownloadAction::Resume).is_err());
        assert!(DownloadState::Downloading.transition(DownloadAction::Resume).is_err());
        assert!(DownloadState::Finished.is_deletable());
        assert!(!DownloadState::Paused.is_deletable());
    }

    #[test]
    fn source_classification() {
        let magnet = DownloadSource::parse("magnet:?xt=urn:btih:abc").unwrap();
        assert_eq!(magnet.kind(), DownloadKind::Magnet);

        let torrent = DownloadSource::parse("https://example.com/x.torrent?dl=1").unwrap();
        assert_eq!(torrent.kind(), DownloadKind::Bt);

        let local = DownloadSource::parse("/srv/seed/ubuntu.torrent").unwrap();
        assert_eq!(local.kind(), DownloadKind::Bt);

        let http = DownloadSource::parse("http://example.com/file.iso").unwrap();
        assert_eq!(http.kind(), DownloadKind::Http);
        assert_eq!(http.as_str(), "http://example.com/file.iso");

        assert!(DownloadSource::parse("ftp://example.com/a").is_err());
        assert!(DownloadSource::parse("  ").is_err());
    }

    #[test]
    fn segment_plan_covers_remaining_bytes_exactly() {
        let size = 1000;
        for existing in [0, 1, 255, 256, 700, 999, 1000] {
            let plan = plan_segments(size, 256, existing);
            let mut cursor = existing;
            for seg in &plan {
                assert_eq!(seg.start, cursor);
                cursor = seg.end + 1;
            }
            assert_eq!(cursor, size.max(existing));
        }
    }

    #[test]
    fn segment_plan_skips_covered_segments() {
        let plan = plan_segments(1024, 256, 300);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0], Segment { index: 1, start: 300, end: 511 });
        assert_eq!(plan[2].end, 1023);
        assert!(plan_segments(0, 256, 0).is_empty());
    }

    #[test]
    fn control_parse() {
        assert_eq!(DownloadControl::parse("pause").unwrap().action(), Some(DownloadAction::Pause));
        assert_eq!(DownloadControl::parse("delete").unwrap().action(), None);
        assert!(DownloadControl::parse("stop").is_err());
    }
}
