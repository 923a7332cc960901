//! Upload pipeline service.

use super::inspect::{ContentSniffer, ImageThumbnailer, InferSniffer, Thumbnailer};
use super::normalize_virtual_path;
use crate::disks::{DiskSet, relative_to};
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::permissions;
use crate::permits::CryptoPermits;
use crate::quota::QuotaController;
use crate::ratelimit::BandwidthLimiter;
use crate::users::UserService;
use bytes::Bytes;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use stowage_core::config::AppConfig;
use stowage_core::crypto::{HEADER_LEN, encrypt_file};
use stowage_core::hash::{full_hash, quick_hash};
use stowage_core::upload::{
    FinalizeOptions, PrecheckOutcome, PrecheckRequest, UploadProgress, chunk_file_name, expected_chunk_count,
    progress_fraction,
};
use stowage_core::{
    Permission, QuickSignature, SAMPLE_COUNT, UploadStatus, UploadTaskId,
    UserSecret, filename,
};
use stowage_metadata::models::{
    CommitOutcome, FileChunkRow, FileInfoRow, UploadTaskRow, UserFileRow, from_db_size,
    to_db_size,
};
use stowage_metadata::repos::{FileRepo, UploadTaskRepo, VirtualPathRepo};
use stowage_metadata::{MetadataError, MetadataStore};
use stowage_storage::{BlobInfo, install, remove_artifacts, remove_tree, split_into_chunks, write_atomic};
use time::OffsetDateTime;
use uuid::Uuid;

/// Name of the merged file inside an upload task's temp directory.
const MERGED_NAME: &str = "merged.data";

/// Where stored content ended up for one user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StoredFile {
    pub file_id: Uuid,
    pub user_file_id: Uuid,
    /// Linked to content that was already stored.
    pub deduplicated: bool,
}

/// One file headed for the blob store.
struct Ingest<'a> {
    user_id: Uuid,
    source: &'a Path,
    name: &'a str,
    virtual_path: &'a str,
    signature: QuickSignature,
    size: u64,
    secret: Option<UserSecret>,
    task_id: Option<Uuid>,
}

pub struct UploadPipeline {
    metadata: Arc<dyn MetadataStore>,
    disks: Arc<DiskSet>,
    config: Arc<AppConfig>,
    users: Arc<UserService>,
    permits: CryptoPermits,
    limiter: Option<Arc<BandwidthLimiter>>,
    sniffer: Arc<dyn ContentSniffer>,
    thumbnailer: Arc<dyn Thumbnailer>,
}

impl UploadPipeline {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        disks: Arc<DiskSet>,
        config: Arc<AppConfig>,
        users: Arc<UserService>,
        permits: CryptoPermits,
        limiter: Option<Arc<BandwidthLimiter>>,
    ) -> Self {
        Self {
            metadata,
            disks,
            config,
            users,
            permits,
            limiter,
            sniffer: Arc::new(InferSniffer),
            thumbnailer: Arc::new(ImageThumbnailer::default()),
        }
    }

    /// Replace the MIME sniffer and thumbnailer.
    pub fn with_inspectors(
        mut self,
        sniffer: Arc<dyn ContentSniffer>,
        thumbnailer: Arc<dyn Thumbnailer>,
    ) -> Self {
        self.sniffer = sniffer;
        self.thumbnailer = thumbnailer;
        self
    }

    /// Answer a precheck: instant upload, resumed task or fresh ticket.
    #[tracing::instrument(skip(self, req), fields(user_id = %user_id, size = req.size))]
    pub async fn precheck(
        &self,
        user_id: Uuid,
        req: PrecheckRequest,
    ) -> ApiResult<PrecheckOutcome> {
        permissions::require(self.metadata.as_ref(), user_id, Permission::FileUpload).await?;
        let name = filename::sanitize(&req.filename)?;
        let virtual_path = normalize_virtual_path(&req.virtual_path)?;
        let signature = req
            .quick_signature()
            .map_err(|e| ApiError::BadRequest(format!("chunk signature rejected: {e}")))?;
        let user = self.users.get(user_id).await?;
        QuotaController::check(&user, req.size)?;
        metrics::UPLOADS_PRECHECKED.inc();

        let size = to_db_size(req.size)?;
        match self.instant_candidate(&signature, size).await {
            Ok(Some(file)) => {
                let stored = self
                    .link_instant(user_id, file.file_id, &name, &virtual_path, None)
                    .await?;
                return Ok(PrecheckOutcome::InstantUploaded {
                    file_id: stored.file_id,
                    user_file_id: stored.user_file_id,
                });
            }
            Ok(None) => {}
            Err(ApiError::DedupStale) => {
                tracing::debug!(signature = %signature.signature, "fingerprint candidate diverged, issuing a ticket");
            }
            Err(e) => return Err(e),
        }

        let now = OffsetDateTime::now_utc();
        let signature_hex = signature.signature.to_hex();
        if let Some(task) = self
            .metadata
            .find_resumable_task(user_id, &signature_hex, size, &virtual_path, now)
            .await?
        {
            let received = self.metadata.received_chunks(task.task_id).await?;
            tracing::debug!(task_id = %task.task_id, received = received.len(), "resuming upload task");
            return Ok(PrecheckOutcome::Ticket {
                precheck_id: UploadTaskId::from_uuid(task.task_id),
                sampled_hashes: signature.sampled_hex(SAMPLE_COUNT),
                chunk_size: from_db_size(task.chunk_size)?,
                total_chunks: task_total(&task)?,
                received,
            });
        }

        let chunk_size = req.chunk_size.unwrap_or(self.config.upload.chunk_size);
        if chunk_size == 0 {
            return Err(ApiError::BadRequest("chunk size must be positive".to_string()));
        }
        let total_chunks = u32::try_from(expected_chunk_count(req.size, chunk_size))
            .map_err(|_| ApiError::BadRequest("too many chunks for this chunk size".to_string()))?;

        let (disk_id, layout) = self.disks.select(req.size)?;
        let task_id = UploadTaskId::new();
        let temp = layout.temp_area("upload", &task_id.as_uuid().simple().to_string())?;
        tokio::fs::create_dir_all(&temp).await?;

        let sampled = signature.sampled_hex(SAMPLE_COUNT);
        let row = UploadTaskRow {
            task_id: *task_id.as_uuid(),
            user_id,
            filename: name,
            size,
            chunk_size: to_db_size(chunk_size)?,
            total_chunks: i64::from(total_chunks),
            uploaded_chunks: 0,
            chunk_signature: signature_hex,
            first_chunk_hash: sampled[0].clone(),
            second_chunk_hash: sampled[1].clone(),
            third_chunk_hash: sampled[2].clone(),
            virtual_path,
            disk_id,
            temp_dir: relative_to(layout.root(), &temp)?,
            status: UploadStatus::Pending.as_str().to_string(),
            error: None,
            expire_time: now + self.config.upload.task_ttl(),
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.metadata.create_upload_task(&row).await {
            let _ = remove_tree(&temp).await;
            return Err(e.into());
        }
        tracing::info!(task_id = %row.task_id, total_chunks, chunk_size, "upload ticket issued");

        Ok(PrecheckOutcome::Ticket {
            precheck_id: task_id,
            sampled_hashes: sampled,
            chunk_size,
            total_chunks,
            received: Vec::new(),
        })
    }

    /// Accept chunk `index` after checking its MD5.
    #[tracing::instrument(skip(self, md5_hex, body), fields(user_id = %user_id, task_id = %task_id, len = body.len()))]
    pub async fn receive_chunk(
        &self,
        user_id: Uuid,
        task_id: UploadTaskId,
        index: u32,
        total_chunks: u32,
        md5_hex: &str,
        body: Bytes,
    ) -> ApiResult<UploadProgress> {
        let task = self.active_task(user_id, task_id).await?;
        let total = task_total(&task)?;
        if total_chunks != total {
            return Err(ApiError::BadRequest(format!(
                "task has {total} chunks, request says {total_chunks}"
            )));
        }
        if index >= total {
            return Err(ApiError::BadRequest(format!(
                "chunk index {index} out of range 0..{total}"
            )));
        }
        let expected_len = chunk_len(&task, index)?;
        if body.len() as u64 != expected_len {
            return Err(ApiError::BadRequest(format!(
                "chunk {index} is {} bytes, expected {expected_len}",
                body.len()
            )));
        }

        if let Some(limiter) = &self.limiter {
            limiter.acquire(body.len()).await;
        }

        let actual = format!("{:x}", md5::compute(&body));
        if !actual.eq_ignore_ascii_case(md5_hex.trim()) {
            metrics::CHUNKS_CORRUPT.inc();
            metrics::record_upload_error("chunk_corrupt");
            return Err(ApiError::ChunkCorrupt(format!(
                "chunk {index}: expected md5 {md5_hex}, got {actual}"
            )));
        }

        let dir = self.task_dir(&task).await?;
        write_atomic(&dir.join(chunk_file_name(index)), &body).await?;
        let uploaded = self
            .metadata
            .record_chunk(task.task_id, index, OffsetDateTime::now_utc())
            .await?;
        metrics::CHUNKS_RECEIVED.inc();
        tracing::debug!(index, uploaded, total, "chunk stored");

        self.progress_of(&task).await
    }

    /// Received indices and progress of a task.
    pub async fn status(&self, user_id: Uuid, task_id: UploadTaskId) -> ApiResult<UploadProgress> {
        let task = self.owned_task(user_id, task_id).await?;
        self.progress_of(&task).await
    }

    /// Push the expiry out by the renew period.
    #[tracing::instrument(skip(self), fields(user_id = %user_id, task_id = %task_id))]
    pub async fn renew(&self, user_id: Uuid, task_id: UploadTaskId) -> ApiResult<UploadProgress> {
        let task = self.owned_task(user_id, task_id).await?;
        let status = UploadStatus::parse(&task.status)?;
        if !status.is_active() {
            return Err(ApiError::Conflict(format!("upload task is {status}")));
        }
        let now = OffsetDateTime::now_utc();
        self.metadata
            .renew_upload_task(task.task_id, now + self.config.upload.renew_period(), now)
            .await?;
        self.progress_of(&task).await
    }

    /// Drop the temp tree and mark the task aborted.
    #[tracing::instrument(skip(self), fields(user_id = %user_id, task_id = %task_id))]
    pub async fn abort(&self, user_id: Uuid, task_id: UploadTaskId) -> ApiResult<()> {
        let task = self.owned_task(user_id, task_id).await?;
        if UploadStatus::parse(&task.status)? == UploadStatus::Completed {
            return Err(ApiError::Conflict("upload already completed".to_string()));
        }
        remove_tree(&self.task_dir(&task).await?).await?;
        self.metadata
            .update_upload_status(
                task.task_id,
                UploadStatus::Aborted.as_str(),
                None,
                OffsetDateTime::now_utc(),
            )
            .await?;
        tracing::info!("upload aborted");
        Ok(())
    }

    /// Merge the received chunks and store the result.
    #[tracing::instrument(skip(self, options), fields(user_id = %user_id, task_id = %task_id, encrypt = options.encrypt))]
    pub async fn finalize(
        &self,
        user_id: Uuid,
        task_id: UploadTaskId,
        options: FinalizeOptions,
    ) -> ApiResult<StoredFile> {
        let started = Instant::now();
        let task = self.active_task(user_id, task_id).await?;
        let total = task_total(&task)?;
        let received = self.metadata.received_chunks(task.task_id).await?;
        if received.len() != total as usize {
            return Err(ApiError::BadRequest(format!(
                "incomplete upload: {} of {total} chunks received",
                received.len()
            )));
        }

        let result = self.finalize_task(&task, total, options).await;
        match &result {
            Ok(stored) => {
                if let Err(e) = remove_tree(&self.task_dir(&task).await?).await {
                    tracing::warn!(error = %e, "failed to remove upload temp tree");
                }
                metrics::FINALIZE_DURATION.observe(started.elapsed().as_secs_f64());
                tracing::info!(file_id = %stored.file_id, deduplicated = stored.deduplicated, "upload finalized");
            }
            Err(e @ ApiError::BadRequest(_)) => {
                metrics::record_upload_error(e.code());
                self.metadata
                    .update_upload_status(
                        task.task_id,
                        UploadStatus::Failed.as_str(),
                        Some(&e.to_string()),
                        OffsetDateTime::now_utc(),
                    )
                    .await?;
                tracing::warn!(error = %e, "upload failed permanently");
            }
            Err(e) => {
                // Temp tree stays so the client can retry before the task expires.
                metrics::record_upload_error(e.code());
                tracing::warn!(error = %e, "finalize failed, task left for retry");
            }
        }
        result
    }

    async fn finalize_task(
        &self,
        task: &UploadTaskRow,
        total: u32,
        options: FinalizeOptions,
    ) -> ApiResult<StoredFile> {
        let dir = self.task_dir(task).await?;
        let parts: Vec<PathBuf> = (0..total).map(|i| dir.join(chunk_file_name(i))).collect();
        let merged = dir.join(MERGED_NAME);
        let merged_len = stowage_storage::merge_parts(&parts, &merged).await?;
        let declared = from_db_size(task.size)?;
        if merged_len != declared {
            return Err(ApiError::BadRequest(format!(
                "merged size {merged_len} does not match declared size {declared}"
            )));
        }

        let path = merged.clone();
        let signature = tokio::task::spawn_blocking(move || quick_hash(&path, SAMPLE_COUNT)).await??;
        if signature.signature.to_hex() != task.chunk_signature {
            return Err(ApiError::BadRequest(
                "merged content does not match the precheck signature".to_string(),
            ));
        }

        let secret = if options.encrypt {
            let passphrase = options.passphrase.as_deref().ok_or_else(|| {
                ApiError::BadRequest("a passphrase is required to encrypt".to_string())
            })?;
            Some(self.users.unlock(task.user_id, passphrase).await?)
        } else {
            None
        };

        self.store(Ingest {
            user_id: task.user_id,
            source: &merged,
            name: &task.filename,
            virtual_path: &task.virtual_path,
            signature,
            size: declared,
            secret,
            task_id: Some(task.task_id),
        })
        .await
    }

    /// Store a file already on local disk for `user_id`.
    ///
    /// A single-blob file is moved into the blob store. Chunked, encrypted and
    /// deduplicated files leave `path` in place for the caller to remove.
    #[tracing::instrument(skip(self, path, secret), fields(user_id = %user_id, encrypt = secret.is_some()))]
    pub async fn ingest_local_file(
        &self,
        user_id: Uuid,
        path: &Path,
        name: &str,
        virtual_path: &str,
        secret: Option<UserSecret>,
    ) -> ApiResult<StoredFile> {
        let name = filename::sanitize(name)?;
        let virtual_path = normalize_virtual_path(virtual_path)?;
        let size = tokio::fs::metadata(path).await?.len();
        QuotaController::check(&self.users.get(user_id).await?, size)?;

        let source = path.to_path_buf();
        let signature =
            tokio::task::spawn_blocking(move || quick_hash(&source, SAMPLE_COUNT)).await??;

        if secret.is_none() {
            match self.instant_candidate(&signature, to_db_size(size)?).await {
                Ok(Some(file)) => {
                    return self
                        .link_instant(user_id, file.file_id, &name, &virtual_path, None)
                        .await;
                }
                Ok(None) | Err(ApiError::DedupStale) => {}
                Err(e) => return Err(e),
            }
        }

        self.store(Ingest {
            user_id,
            source: path,
            name: &name,
            virtual_path: &virtual_path,
            signature,
            size,
            secret,
            task_id: None,
        })
        .await
    }

    /// Stored file agreeing with `signature` on every sampled block, if any.
    async fn instant_candidate(
        &self,
        signature: &QuickSignature,
        size: i64,
    ) -> ApiResult<Option<FileInfoRow>> {
        let Some(file) = self
            .metadata
            .find_by_fingerprint(&signature.signature.to_hex(), size)
            .await?
        else {
            return Ok(None);
        };
        let stored =
            QuickSignature::from_stored(&file.sampled_hashes()).map_err(|_| ApiError::DedupStale)?;
        if stored.samples_agree(signature) {
            Ok(Some(file))
        } else {
            Err(ApiError::DedupStale)
        }
    }

    async fn link_instant(
        &self,
        user_id: Uuid,
        file_id: Uuid,
        name: &str,
        virtual_path: &str,
        task_id: Option<Uuid>,
    ) -> ApiResult<StoredFile> {
        let now = OffsetDateTime::now_utc();
        let dir = self.metadata.ensure_path(user_id, virtual_path).await?;
        let link = new_link(user_id, file_id, name, dir.path_id, now);
        let outcome = self.metadata.link_existing(&link, task_id, now).await?;
        metrics::INSTANT_UPLOADS.inc();
        Ok(StoredFile {
            file_id,
            user_file_id: outcome.user_file_id(),
            deduplicated: true,
        })
    }

    /// Place, write and commit one file. Staged artifacts never outlive a failure.
    async fn store(&self, job: Ingest<'_>) -> ApiResult<StoredFile> {
        let mut staged = Vec::new();
        match self.store_staged(&job, &mut staged).await {
            Ok((CommitOutcome::Created, stored)) => {
                metrics::BYTES_INGESTED.inc_by(job.size);
                Ok(stored)
            }
            Ok((CommitOutcome::Duplicate(existing), _)) => {
                tracing::info!(existing = %existing, "lost the commit race, linking existing content");
                remove_artifacts(&staged).await;
                self.link_instant(job.user_id, existing, job.name, job.virtual_path, job.task_id)
                    .await
            }
            Err(e) => {
                let report = remove_artifacts(&staged).await;
                if !report.is_clean() {
                    tracing::warn!(failed = report.failed.len(), "staged artifacts left behind");
                }
                Err(e)
            }
        }
    }

    async fn store_staged(
        &self,
        job: &Ingest<'_>,
        staged: &mut Vec<PathBuf>,
    ) -> ApiResult<(CommitOutcome, StoredFile)> {
        let sniffer = self.sniffer.clone();
        let (source, name) = (job.source.to_path_buf(), job.name.to_string());
        let mime = tokio::task::spawn_blocking(move || sniffer.sniff(&source, &name)).await?;

        let thumb_staging = (self.config.file.thumbnail && self.thumbnailer.accepts(&mime))
            .then(|| job.source.with_extension("thumb.jpg"));
        let hash_source = job.source.to_path_buf();
        let hashing = tokio::task::spawn_blocking(move || full_hash(&hash_source));
        let thumbnailing = async {
            let dest = thumb_staging.clone()?;
            let thumbnailer = self.thumbnailer.clone();
            let source = job.source.to_path_buf();
            Some(tokio::task::spawn_blocking(move || thumbnailer.thumbnail(&source, &dest)).await)
        };
        let (hash, thumbnail) = tokio::join!(hashing, thumbnailing);
        let hash = hash??;
        let thumbnail = match thumbnail {
            Some(Ok(Ok(()))) => thumb_staging,
            Some(Ok(Err(e))) => {
                tracing::warn!(error = %e, "thumbnail generation failed");
                None
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "thumbnail task failed");
                None
            }
            None => None,
        };

        let requested = if job.secret.is_some() {
            job.size + HEADER_LEN as u64
        } else {
            job.size
        };
        let (disk_id, layout) = self.disks.select(requested)?;
        let paths = layout.allocate()?;
        tokio::fs::create_dir_all(&paths.dir).await?;

        let file_id = Uuid::new_v4();
        let mut path = String::new();
        let mut enc_path = None;
        let mut enc_hash = None;
        let mut chunk_rows = Vec::new();
        // Encrypted blobs carry a header, so the stored size is what lands on disk.
        let mut stored_size = job.size;

        if let Some(secret) = &job.secret {
            let (source, dest, key) = (job.source.to_path_buf(), paths.encrypted.clone(), secret.clone());
            staged.push(paths.encrypted.clone());
            stored_size = self
                .permits
                .run(move || encrypt_file(&source, &dest, key.as_bytes()))
                .await??;
            let encrypted = paths.encrypted.clone();
            enc_hash = Some(
                tokio::task::spawn_blocking(move || full_hash(&encrypted))
                    .await??
                    .to_hex(),
            );
            enc_path = Some(relative_to(layout.root(), &paths.encrypted)?);
        } else if job.size > 0 && job.size > self.config.file.big_file_threshold() {
            let (source, chunk_paths, chunk_size) = (
                job.source.to_path_buf(),
                paths.clone(),
                self.config.file.big_chunk_size(),
            );
            let chunks = tokio::task::spawn_blocking(move || {
                split_into_chunks(&source, &chunk_paths, chunk_size)
            })
            .await??;
            staged.extend(chunks.iter().map(|c| c.path.clone()));
            for chunk in &chunks {
                chunk_rows.push(FileChunkRow {
                    file_id,
                    chunk_index: i64::from(chunk.index),
                    path: relative_to(layout.root(), &chunk.path)?,
                    size: to_db_size(chunk.size)?,
                    hash: chunk.hash.to_hex(),
                });
            }
        } else {
            install(job.source, &paths.blob).await?;
            staged.push(paths.blob.clone());
            path = relative_to(layout.root(), &paths.blob)?;
        }

        let mut thumbnail_path = None;
        if let Some(thumb) = thumbnail {
            match install(&thumb, &paths.thumbnail).await {
                Ok(()) => {
                    staged.push(paths.thumbnail.clone());
                    thumbnail_path = Some(relative_to(layout.root(), &paths.thumbnail)?);
                }
                Err(e) => tracing::warn!(error = %e, "failed to place thumbnail"),
            }
        }

        BlobInfo {
            file_hash: hash.to_hex(),
            file_enc_hash: enc_hash,
        }
        .write(&paths.info)
        .await?;
        staged.push(paths.info.clone());

        let now = OffsetDateTime::now_utc();
        let sampled = job.signature.sampled_hex(SAMPLE_COUNT);
        let file = FileInfoRow {
            file_id,
            name: job.name.to_string(),
            stored_name: paths.stem.clone(),
            size: to_db_size(stored_size)?,
            mime,
            disk_id,
            path,
            thumbnail_path,
            full_hash: Some(hash.to_hex()),
            has_full_hash: true,
            chunk_signature: job.signature.signature.to_hex(),
            first_chunk_hash: sampled[0].clone(),
            second_chunk_hash: sampled[1].clone(),
            third_chunk_hash: sampled[2].clone(),
            is_encrypted: job.secret.is_some(),
            enc_path,
            is_chunked: !chunk_rows.is_empty(),
            chunk_count: chunk_rows.len() as i64,
            created_at: now,
        };

        let dir = self.metadata.ensure_path(job.user_id, job.virtual_path).await?;
        let link = new_link(job.user_id, file_id, job.name, dir.path_id, now);
        let outcome = self
            .metadata
            .commit_upload(&file, &chunk_rows, &link, job.task_id, now)
            .await
            .map_err(|e| match e {
                MetadataError::QuotaExceeded { .. } => ApiError::from(e),
                other => ApiError::TransactionFailed(other.to_string()),
            })?;

        Ok((
            outcome,
            StoredFile {
                file_id,
                user_file_id: link.user_file_id,
                deduplicated: false,
            },
        ))
    }

    async fn owned_task(&self, user_id: Uuid, task_id: UploadTaskId) -> ApiResult<UploadTaskRow> {
        let id = *task_id.as_uuid();
        self.metadata
            .get_upload_task(id)
            .await?
            .filter(|t| t.user_id == user_id)
            .ok_or_else(|| ApiError::NotFound(format!("upload task {id}")))
    }

    /// An owned task that still accepts chunks and finalize.
    async fn active_task(&self, user_id: Uuid, task_id: UploadTaskId) -> ApiResult<UploadTaskRow> {
        let task = self.owned_task(user_id, task_id).await?;
        match UploadStatus::parse(&task.status)? {
            UploadStatus::Pending | UploadStatus::Uploading => {}
            UploadStatus::Aborted => return Err(ApiError::TaskCancelled),
            other => return Err(ApiError::Conflict(format!("upload task is {other}"))),
        }
        if task.is_expired(OffsetDateTime::now_utc()) {
            return Err(ApiError::TaskExpired);
        }
        Ok(task)
    }

    async fn task_dir(&self, task: &UploadTaskRow) -> ApiResult<PathBuf> {
        self.disks.resolve(task.disk_id, &task.temp_dir).await
    }

    async fn progress_of(&self, task: &UploadTaskRow) -> ApiResult<UploadProgress> {
        let received = self.metadata.received_chunks(task.task_id).await?;
        let current = self
            .metadata
            .get_upload_task(task.task_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("upload task {}", task.task_id)))?;
        let total = task_total(&current)?;
        let uploaded = received.len() as u32;
        Ok(UploadProgress {
            precheck_id: UploadTaskId::from_uuid(current.task_id),
            status: UploadStatus::parse(&current.status)?,
            total_chunks: total,
            uploaded_chunks: uploaded,
            progress: progress_fraction(uploaded, total),
            received,
        })
    }
}

fn new_link(
    user_id: Uuid,
    file_id: Uuid,
    name: &str,
    path_id: Uuid,
    now: OffsetDateTime,
) -> UserFileRow {
    UserFileRow {
        user_file_id: Uuid::new_v4(),
        user_id,
        file_id,
        name: name.to_string(),
        path_id,
        is_public: false,
        is_copy: false,
        deleted_at: None,
        created_at: now,
    }
}

fn task_total(task: &UploadTaskRow) -> ApiResult<u32> {
    u32::try_from(task.total_chunks)
        .map_err(|_| ApiError::Internal(format!("task {} has invalid chunk count", task.task_id)))
}

/// Expected byte length of chunk `index`; the last chunk carries the remainder.
fn chunk_len(task: &UploadTaskRow, index: u32) -> ApiResult<u64> {
    let size = from_db_size(task.size)?;
    let chunk_size = from_db_size(task.chunk_size)?;
    let start = u64::from(index) * chunk_size;
    Ok(size.saturating_sub(start).min(chunk_size))
}
