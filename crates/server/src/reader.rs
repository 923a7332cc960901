//! Random-access reads over stored files, and play tokens for encrypted ones.

use crate::disks::DiskSet;
use crate::error::{ApiError, ApiResult};
use crate::permissions;
use crate::permits::CryptoPermits;
use crate::users::UserService;
use dashmap::DashMap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stowage_core::crypto::{decrypt_file, open_blob_key, plaintext_len};
use stowage_core::{BlobKey, ByteRange, Permission};
use stowage_metadata::MetadataStore;
use stowage_metadata::models::{FileInfoRow, ShareRow, from_db_size};
use stowage_metadata::repos::{FileRepo, UserFileRepo};
use stowage_storage::{BlobSource, ByteStream, ChunkSpan};
use time::OffsetDateTime;
use uuid::Uuid;

/// What a play token unlocks.
#[derive(Clone)]
pub struct PlayGrant {
    pub user_id: Uuid,
    pub file_id: Uuid,
    key: BlobKey,
    path: PathBuf,
    pub expires_at: OffsetDateTime,
}

impl std::fmt::Debug for PlayGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayGrant")
            .field("user_id", &self.user_id)
            .field("file_id", &self.file_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// In-memory play tokens. Lost on restart; clients simply ask again.
pub struct PlayTokenCache {
    grants: DashMap<String, PlayGrant>,
    ttl: time::Duration,
}

impl PlayTokenCache {
    pub fn new(ttl: time::Duration) -> Self {
        Self {
            grants: DashMap::new(),
            ttl,
        }
    }

    fn issue(&self, user_id: Uuid, file_id: Uuid, key: BlobKey, path: PathBuf) -> PlayToken {
        let expires_at = OffsetDateTime::now_utc() + self.ttl;
        let token = stowage_core::token::generate();
        self.grants.insert(
            token.clone(),
            PlayGrant {
                user_id,
                file_id,
                key,
                path,
                expires_at,
            },
        );
        PlayToken { token, expires_at }
    }

    /// Unexpired grant for `token`. Expired grants are dropped on sight.
    pub fn get(&self, token: &str, now: OffsetDateTime) -> Option<PlayGrant> {
        let grant = self.grants.get(token)?.clone();
        if grant.expires_at <= now {
            self.grants.remove(token);
            return None;
        }
        Some(grant)
    }

    /// Drop expired grants. Returns how many were removed.
    pub fn sweep(&self, now: OffsetDateTime) -> usize {
        let before = self.grants.len();
        self.grants.retain(|_, grant| grant.expires_at > now);
        before - self.grants.len()
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

/// A freshly issued play token.
#[derive(Clone, Debug, Serialize)]
pub struct PlayToken {
    pub token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyStatus {
    Full,
    Partial,
}

/// A readable window of a file, ready to stream.
pub struct RangeReply {
    pub status: ReplyStatus,
    /// `bytes start-end/size`, set for partial replies.
    pub content_range: Option<String>,
    pub content_length: u64,
    pub total_size: u64,
    pub mime: String,
    pub file_name: String,
    pub stream: ByteStream,
}

impl std::fmt::Debug for RangeReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeReply")
            .field("status", &self.status)
            .field("content_range", &self.content_range)
            .field("content_length", &self.content_length)
            .field("total_size", &self.total_size)
            .finish_non_exhaustive()
    }
}

pub struct FileReader {
    metadata: Arc<dyn MetadataStore>,
    disks: Arc<DiskSet>,
    users: Arc<UserService>,
    permits: CryptoPermits,
    tokens: Arc<PlayTokenCache>,
}

impl FileReader {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        disks: Arc<DiskSet>,
        users: Arc<UserService>,
        permits: CryptoPermits,
        tokens: Arc<PlayTokenCache>,
    ) -> Self {
        Self {
            metadata,
            disks,
            users,
            permits,
            tokens,
        }
    }

    pub fn tokens(&self) -> &Arc<PlayTokenCache> {
        &self.tokens
    }

    /// Open `range_header` (or the whole file) of `file_id` for `user_id`.
    ///
    /// Encrypted files need a play token issued to the same user for the same file.
    #[tracing::instrument(skip(self, play_token), fields(user_id = %user_id, file_id = %file_id))]
    pub async fn open_range(
        &self,
        user_id: Uuid,
        file_id: Uuid,
        range_header: Option<&str>,
        play_token: Option<&str>,
    ) -> ApiResult<RangeReply> {
        let (file, name) = self.resolve_access(user_id, file_id).await?;
        let source = if file.is_encrypted {
            let grant = play_token
                .and_then(|t| self.tokens.get(t, OffsetDateTime::now_utc()))
                .filter(|g| g.file_id == file_id && g.user_id == user_id)
                .ok_or_else(|| {
                    ApiError::Forbidden("a valid play token is required for this file".to_string())
                })?;
            BlobSource::Encrypted {
                path: grant.path,
                key: grant.key,
            }
        } else {
            self.plain_source(&file).await?
        };
        self.reply(&file, name, source, range_header)
    }

    /// Read the file a share points at.
    #[tracing::instrument(skip(self, share), fields(share_id = %share.share_id))]
    pub async fn open_shared_range(
        &self,
        share: &ShareRow,
        range_header: Option<&str>,
    ) -> ApiResult<RangeReply> {
        let file = self.file(share.file_id).await?;
        if file.is_encrypted {
            return Err(ApiError::Forbidden(
                "encrypted files cannot be read through a share".to_string(),
            ));
        }
        let name = self
            .metadata
            .get_user_file_by_id(share.user_file_id)
            .await?
            .filter(|link| link.deleted_at.is_none())
            .map(|link| link.name)
            .ok_or_else(|| ApiError::NotFound("shared file".to_string()))?;
        let source = self.plain_source(&file).await?;
        self.reply(&file, name, source, range_header)
    }

    /// Verify the passphrase and issue a play token for an encrypted file the user owns.
    #[tracing::instrument(skip(self, passphrase), fields(user_id = %user_id, file_id = %file_id))]
    pub async fn create_play_token(
        &self,
        user_id: Uuid,
        file_id: Uuid,
        passphrase: &str,
    ) -> ApiResult<PlayToken> {
        let file = self.owned_encrypted(user_id, file_id).await?;
        let secret = self.users.unlock(user_id, passphrase).await?;
        let path = self.encrypted_path(&file).await?;
        let blob = path.clone();
        let key = self
            .permits
            .run(move || open_blob_key(secret.as_bytes(), &blob))
            .await??;
        let token = self.tokens.issue(user_id, file_id, key, path);
        tracing::info!(expires_at = %token.expires_at, "play token issued");
        Ok(token)
    }

    /// Fully decrypt an encrypted file the user owns into `out`, checking its MAC.
    #[tracing::instrument(skip(self, passphrase, out), fields(user_id = %user_id, file_id = %file_id))]
    pub async fn download_decrypted(
        &self,
        user_id: Uuid,
        file_id: Uuid,
        passphrase: &str,
        out: &Path,
    ) -> ApiResult<u64> {
        let file = self.owned_encrypted(user_id, file_id).await?;
        let secret = self.users.unlock(user_id, passphrase).await?;
        let input = self.encrypted_path(&file).await?;
        let output = out.to_path_buf();
        let written = self
            .permits
            .run(move || decrypt_file(&input, &output, secret.as_bytes()))
            .await??;
        Ok(written)
    }

    /// The file plus the name the caller knows it by.
    async fn resolve_access(&self, user_id: Uuid, file_id: Uuid) -> ApiResult<(FileInfoRow, String)> {
        if let Some(link) = self.metadata.get_user_file(user_id, file_id).await? {
            return Ok((self.file(file_id).await?, link.name));
        }
        if let Some(link) = self.metadata.find_public_link(file_id).await? {
            permissions::require(self.metadata.as_ref(), user_id, Permission::FileDownload).await?;
            return Ok((self.file(file_id).await?, link.name));
        }
        Err(ApiError::NotOwned(format!("file {file_id}")))
    }

    async fn owned_encrypted(&self, user_id: Uuid, file_id: Uuid) -> ApiResult<FileInfoRow> {
        if self.metadata.get_user_file(user_id, file_id).await?.is_none() {
            return Err(ApiError::NotOwned(format!("file {file_id}")));
        }
        let file = self.file(file_id).await?;
        if !file.is_encrypted {
            return Err(ApiError::BadRequest("file is not encrypted".to_string()));
        }
        Ok(file)
    }

    async fn file(&self, file_id: Uuid) -> ApiResult<FileInfoRow> {
        self.metadata
            .get_file(file_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("file {file_id}")))
    }

    async fn encrypted_path(&self, file: &FileInfoRow) -> ApiResult<PathBuf> {
        let relative = file.enc_path.as_deref().ok_or_else(|| {
            ApiError::Internal(format!("encrypted file {} has no blob path", file.file_id))
        })?;
        self.disks.resolve(file.disk_id, relative).await
    }

    /// Plaintext source of an unencrypted file.
    pub(crate) async fn plain_source(&self, file: &FileInfoRow) -> ApiResult<BlobSource> {
        if !file.is_chunked {
            let path = self.disks.resolve(file.disk_id, &file.path).await?;
            return Ok(BlobSource::Single { path });
        }
        let rows = self.metadata.get_chunks(file.file_id).await?;
        let mut chunks = Vec::with_capacity(rows.len());
        for row in rows {
            chunks.push(ChunkSpan {
                path: self.disks.resolve(file.disk_id, &row.path).await?,
                size: from_db_size(row.size)?,
            });
        }
        Ok(BlobSource::Chunked { chunks })
    }

    fn reply(
        &self,
        file: &FileInfoRow,
        file_name: String,
        source: BlobSource,
        range_header: Option<&str>,
    ) -> ApiResult<RangeReply> {
        let stored = from_db_size(file.size)?;
        let size = if file.is_encrypted {
            plaintext_len(stored)
        } else {
            stored
        };
        let mime = file.mime.clone();
        let Some(full) = ByteRange::full(size) else {
            if range_header.is_some() {
                return Err(ApiError::RangeInvalid("file is empty".to_string()));
            }
            return Ok(RangeReply {
                status: ReplyStatus::Full,
                content_range: None,
                content_length: 0,
                total_size: 0,
                mime,
                file_name,
                stream: Box::pin(futures::stream::empty()),
            });
        };

        let (status, range) = match range_header {
            Some(header) => (ReplyStatus::Partial, ByteRange::parse(header, size)?),
            None => (ReplyStatus::Full, full),
        };
        Ok(RangeReply {
            status,
            content_range: (status == ReplyStatus::Partial).then(|| range.content_range(size)),
            content_length: range.len(),
            total_size: size,
            mime,
            file_name,
            stream: source.open_range(range),
        })
    }
}
