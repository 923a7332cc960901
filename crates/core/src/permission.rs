//! Group permission characteristics.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A capability granted to a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    /// Upload files.
    #[serde(rename = "file:upload")]
    FileUpload,
    /// Read public files owned by other users.
    #[serde(rename = "file:download")]
    FileDownload,
    /// Submit offline downloads.
    #[serde(rename = "offline:download")]
    OfflineDownload,
    /// Use the WebDAV surface.
    #[serde(rename = "webdav:access")]
    WebdavAccess,
    /// Create share links.
    #[serde(rename = "share:create")]
    ShareCreate,
}

impl Permission {
    pub const ALL: [Permission; 5] = [
        Self::FileUpload,
        Self::FileDownload,
        Self::OfflineDownload,
        Self::WebdavAccess,
        Self::ShareCreate,
    ];

    /// Parse from string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "file:upload" => Ok(Self::FileUpload),
            "file:download" => Ok(Self::FileDownload),
            "offline:download" => Ok(Self::OfflineDownload),
            "webdav:access" => Ok(Self::WebdavAccess),
            "share:create" => Ok(Self::ShareCreate),
            _ => Err(crate::Error::UnknownValue(format!("permission: {s}"))),
        }
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileUpload => "file:upload",
            Self::FileDownload => "file:download",
            Self::OfflineDownload => "offline:download",
            Self::WebdavAccess => "webdav:access",
            Self::ShareCreate => "share:create",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
