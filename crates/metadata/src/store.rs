//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{
    DiskRepo, DownloadTaskRepo, FileRepo, GroupRepo, RecycleRepo, ShareRepo, UploadTaskRepo,
    UserFileRepo, UserRepo, VirtualPathRepo,
};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqliteConnection};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    UserRepo
    + GroupRepo
    + DiskRepo
    + FileRepo
    + UserFileRepo
    + VirtualPathRepo
    + RecycleRepo
    + ShareRepo
    + UploadTaskRepo
    + DownloadTaskRepo
    + Send
    + Sync
{
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    query_timeout_secs: u64,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let query_timeout_secs = query_timeout_secs.unwrap_or(600);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // One connection serializes writers; concurrent commits queue on the pool.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            query_timeout_secs,
        };
        store.migrate().await?;

        tracing::debug!(
            path = %path.display(),
            query_timeout_secs,
            "opened SQLite metadata store"
        );

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Advisory query timeout.
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Debit `size` bytes from a bounded user. Unlimited users are untouched.
async fn debit_quota(conn: &mut SqliteConnection, user_id: Uuid, size: i64) -> MetadataResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE users
        SET free_space = CASE WHEN space = 0 THEN free_space ELSE free_space - ? END
        WHERE user_id = ? AND (space = 0 OR free_space >= ?)
        "#,
    )
    .bind(size)
    .bind(user_id)
    .bind(size)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM users WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await?;
        return Err(match exists {
            Some(_) => MetadataError::QuotaExceeded {
                user_id: user_id.to_string(),
                requested: u64::try_from(size).unwrap_or_default(),
            },
            None => MetadataError::NotFound(format!("user {user_id}")),
        });
    }
    Ok(())
}

/// Credit `size` bytes back to a bounded user, capped at `space`. Returns the bytes credited.
async fn credit_quota(conn: &mut SqliteConnection, user_id: Uuid, size: i64) -> MetadataResult<i64> {
    let result = sqlx::query(
        "UPDATE users SET free_space = MIN(space, free_space + ?) WHERE user_id = ? AND space > 0",
    )
    .bind(size)
    .bind(user_id)
    .execute(&mut *conn)
    .await?;
    Ok(if result.rows_affected() > 0 { size } else { 0 })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn path_segments(path: &str) -> MetadataResult<Vec<&str>> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    for segment in &segments {
        if *segment == "." || *segment == ".." || segment.contains('\\') {
            return Err(MetadataError::Constraint(format!(
                "invalid path segment {segment:?} in {path:?}"
            )));
        }
    }
    Ok(segments)
}

mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use std::collections::HashSet;

    const SUBTREE_SQL: &str = r#"
        WITH RECURSIVE sub(path_id) AS (
            SELECT path_id FROM virtual_paths WHERE path_id = ?
            UNION
            SELECT v.path_id FROM virtual_paths v JOIN sub ON v.parent_id = sub.path_id
        )
        SELECT path_id FROM sub
    "#;

    #[async_trait]
    impl UserRepo for SqliteStore {
        async fn create_user(&self, user: &UserRow) -> MetadataResult<()> {
            let result = sqlx::query(
                r#"
                INSERT INTO users (
                    user_id, username, group_id, space, free_space,
                    file_passphrase_hash, file_salt, state, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(user.user_id)
            .bind(&user.username)
            .bind(user.group_id)
            .bind(user.space)
            .bind(user.free_space)
            .bind(&user.file_passphrase_hash)
            .bind(&user.file_salt)
            .bind(&user.state)
            .bind(user.created_at)
            .bind(user.updated_at)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => Ok(()),
                Err(e) if is_unique_violation(&e) => Err(MetadataError::AlreadyExists(format!(
                    "username '{}' already exists",
                    user.username
                ))),
                Err(e) => Err(e.into()),
            }
        }

        async fn get_user(&self, user_id: Uuid) -> MetadataResult<Option<UserRow>> {
            let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn get_user_by_name(&self, username: &str) -> MetadataResult<Option<UserRow>> {
            let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE username = ?")
                .bind(username)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn set_file_passphrase(
            &self,
            user_id: Uuid,
            passphrase_hash: &str,
            salt_hex: &str,
            updated_at: OffsetDateTime,
        ) -> MetadataResult<()> {
            let result = sqlx::query(
                "UPDATE users SET file_passphrase_hash = ?, file_salt = ?, updated_at = ? WHERE user_id = ?",
            )
            .bind(passphrase_hash)
            .bind(salt_hex)
            .bind(updated_at)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("user {user_id}")));
            }
            Ok(())
        }

        async fn encrypted_file_count(&self, user_id: Uuid) -> MetadataResult<u64> {
            let count: i64 = sqlx::query_scalar(
                r#"
                SELECT COUNT(*) FROM user_files uf
                JOIN file_infos f ON f.file_id = uf.file_id
                WHERE uf.user_id = ? AND f.is_encrypted = 1
                "#,
            )
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
            Ok(count as u64)
        }

        async fn effective_permissions(&self, user_id: Uuid) -> MetadataResult<Vec<String>> {
            let rows: Vec<String> = sqlx::query_scalar(
                r#"
                SELECT DISTINCT gp.characteristic FROM users u
                JOIN group_permissions gp ON gp.group_id = u.group_id
                WHERE u.user_id = ?
                ORDER BY gp.characteristic
                "#,
            )
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }

    #[async_trait]
    impl GroupRepo for SqliteStore {
        async fn create_group(&self, group: &GroupRow) -> MetadataResult<()> {
            let result = sqlx::query(
                "INSERT INTO groups (group_id, name, is_default, default_space, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(group.group_id)
            .bind(&group.name)
            .bind(group.is_default)
            .bind(group.default_space)
            .bind(group.created_at)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => Ok(()),
                Err(e) if is_unique_violation(&e) => Err(MetadataError::AlreadyExists(format!(
                    "group '{}' conflicts with an existing name or default flag",
                    group.name
                ))),
                Err(e) => Err(e.into()),
            }
        }

        async fn get_group(&self, group_id: Uuid) -> MetadataResult<Option<GroupRow>> {
            let row = sqlx::query_as::<_, GroupRow>("SELECT * FROM groups WHERE group_id = ?")
                .bind(group_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn get_default_group(&self) -> MetadataResult<Option<GroupRow>> {
            let row = sqlx::query_as::<_, GroupRow>("SELECT * FROM groups WHERE is_default = 1")
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn set_default_group(&self, group_id: Uuid) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;

            let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM groups WHERE group_id = ?")
                .bind(group_id)
                .fetch_optional(&mut *tx)
                .await?;
            if exists.is_none() {
                tx.rollback().await?;
                return Err(MetadataError::NotFound(format!("group {group_id}")));
            }

            sqlx::query("UPDATE groups SET is_default = 0 WHERE is_default = 1")
                .execute(&mut *tx)
                .await?;
            sqlx::query("UPDATE groups SET is_default = 1 WHERE group_id = ?")
                .bind(group_id)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(())
        }

        async fn grant_permission(
            &self,
            group_id: Uuid,
            characteristic: &str,
        ) -> MetadataResult<()> {
            sqlx::query(
                "INSERT OR IGNORE INTO group_permissions (group_id, characteristic) VALUES (?, ?)",
            )
            .bind(group_id)
            .bind(characteristic)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn revoke_permission(
            &self,
            group_id: Uuid,
            characteristic: &str,
        ) -> MetadataResult<()> {
            sqlx::query("DELETE FROM group_permissions WHERE group_id = ? AND characteristic = ?")
                .bind(group_id)
                .bind(characteristic)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn group_permissions(&self, group_id: Uuid) -> MetadataResult<Vec<String>> {
            let rows: Vec<String> = sqlx::query_scalar(
                "SELECT characteristic FROM group_permissions WHERE group_id = ? ORDER BY characteristic",
            )
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }

    #[async_trait]
    impl DiskRepo for SqliteStore {
        async fn register_disk(&self, disk: &DiskRow) -> MetadataResult<DiskRow> {
            sqlx::query(
                "INSERT OR IGNORE INTO disks (disk_id, root, data_dir, size, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(disk.disk_id)
            .bind(&disk.root)
            .bind(&disk.data_dir)
            .bind(disk.size)
            .bind(disk.created_at)
            .execute(&self.pool)
            .await?;

            let row = sqlx::query_as::<_, DiskRow>("SELECT * FROM disks WHERE root = ?")
                .bind(&disk.root)
                .fetch_one(&self.pool)
                .await?;
            Ok(row)
        }

        async fn list_disks(&self) -> MetadataResult<Vec<DiskRow>> {
            let rows = sqlx::query_as::<_, DiskRow>("SELECT * FROM disks ORDER BY rowid")
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }

        async fn get_disk(&self, disk_id: Uuid) -> MetadataResult<Option<DiskRow>> {
            let row = sqlx::query_as::<_, DiskRow>("SELECT * FROM disks WHERE disk_id = ?")
                .bind(disk_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }
    }

    async fn fingerprint_owner(
        conn: &mut SqliteConnection,
        chunk_signature: &str,
        size: i64,
    ) -> MetadataResult<Option<Uuid>> {
        let id: Option<Uuid> = sqlx::query_scalar(
            "SELECT file_id FROM file_infos WHERE chunk_signature = ? AND size = ? AND is_encrypted = 0",
        )
        .bind(chunk_signature)
        .bind(size)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(id)
    }

    async fn insert_user_file(conn: &mut SqliteConnection, link: &UserFileRow) -> MetadataResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO user_files (
                user_file_id, user_id, file_id, name, path_id,
                is_public, is_copy, deleted_at, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, NULL, ?)
            "#,
        )
        .bind(link.user_file_id)
        .bind(link.user_id)
        .bind(link.file_id)
        .bind(&link.name)
        .bind(link.path_id)
        .bind(link.is_public)
        .bind(link.is_copy)
        .bind(link.created_at)
        .execute(&mut *conn)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(MetadataError::AlreadyExists(format!(
                "user {} already links file {}",
                link.user_id, link.file_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn complete_task(
        conn: &mut SqliteConnection,
        task_id: Option<Uuid>,
        now: OffsetDateTime,
    ) -> MetadataResult<()> {
        if let Some(task_id) = task_id {
            sqlx::query(
                "UPDATE upload_tasks SET status = 'completed', error = NULL, updated_at = ? WHERE task_id = ?",
            )
            .bind(now)
            .bind(task_id)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    #[async_trait]
    impl FileRepo for SqliteStore {
        async fn find_by_fingerprint(
            &self,
            chunk_signature: &str,
            size: i64,
        ) -> MetadataResult<Option<FileInfoRow>> {
            let row = sqlx::query_as::<_, FileInfoRow>(
                "SELECT * FROM file_infos WHERE chunk_signature = ? AND size = ? AND is_encrypted = 0",
            )
            .bind(chunk_signature)
            .bind(size)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn get_file(&self, file_id: Uuid) -> MetadataResult<Option<FileInfoRow>> {
            let row = sqlx::query_as::<_, FileInfoRow>("SELECT * FROM file_infos WHERE file_id = ?")
                .bind(file_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn get_chunks(&self, file_id: Uuid) -> MetadataResult<Vec<FileChunkRow>> {
            let rows = sqlx::query_as::<_, FileChunkRow>(
                "SELECT * FROM file_chunks WHERE file_id = ? ORDER BY chunk_index",
            )
            .bind(file_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn commit_upload(
            &self,
            file: &FileInfoRow,
            chunks: &[FileChunkRow],
            link: &UserFileRow,
            task_id: Option<Uuid>,
            now: OffsetDateTime,
        ) -> MetadataResult<CommitOutcome> {
            if file.is_chunked {
                let contiguous = chunks
                    .iter()
                    .enumerate()
                    .all(|(i, c)| c.chunk_index == i as i64 && c.file_id == file.file_id);
                let total: i64 = chunks.iter().map(|c| c.size).sum();
                if chunks.is_empty()
                    || !contiguous
                    || file.chunk_count != chunks.len() as i64
                    || (!file.is_encrypted && total != file.size)
                {
                    return Err(MetadataError::Constraint(format!(
                        "chunk records of file {} are not contiguous or do not sum to its size",
                        file.file_id
                    )));
                }
            }

            let mut tx = self.pool.begin().await?;

            if !file.is_encrypted {
                if let Some(existing) =
                    fingerprint_owner(&mut tx, &file.chunk_signature, file.size).await?
                {
                    tx.rollback().await?;
                    return Ok(CommitOutcome::Duplicate(existing));
                }
            }

            let inserted = sqlx::query(
                r#"
                INSERT INTO file_infos (
                    file_id, name, stored_name, size, mime, disk_id, path, thumbnail_path,
                    full_hash, has_full_hash, chunk_signature,
                    first_chunk_hash, second_chunk_hash, third_chunk_hash,
                    is_encrypted, enc_path, is_chunked, chunk_count, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(file.file_id)
            .bind(&file.name)
            .bind(&file.stored_name)
            .bind(file.size)
            .bind(&file.mime)
            .bind(file.disk_id)
            .bind(&file.path)
            .bind(&file.thumbnail_path)
            .bind(&file.full_hash)
            .bind(file.has_full_hash)
            .bind(&file.chunk_signature)
            .bind(&file.first_chunk_hash)
            .bind(&file.second_chunk_hash)
            .bind(&file.third_chunk_hash)
            .bind(file.is_encrypted)
            .bind(&file.enc_path)
            .bind(file.is_chunked)
            .bind(file.chunk_count)
            .bind(file.created_at)
            .execute(&mut *tx)
            .await;

            match inserted {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => {
                    tx.rollback().await?;
                    let mut conn = self.pool.acquire().await?;
                    let existing = fingerprint_owner(&mut conn, &file.chunk_signature, file.size)
                        .await?
                        .ok_or_else(|| {
                            MetadataError::Internal(format!(
                                "fingerprint conflict for {} without an owner",
                                file.chunk_signature
                            ))
                        })?;
                    return Ok(CommitOutcome::Duplicate(existing));
                }
                Err(e) => return Err(e.into()),
            }

            for chunk in chunks {
                sqlx::query(
                    "INSERT INTO file_chunks (file_id, chunk_index, path, size, hash) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(chunk.file_id)
                .bind(chunk.chunk_index)
                .bind(&chunk.path)
                .bind(chunk.size)
                .bind(&chunk.hash)
                .execute(&mut *tx)
                .await?;
            }

            insert_user_file(&mut tx, link).await?;
            debit_quota(&mut tx, link.user_id, file.size).await?;
            complete_task(&mut tx, task_id, now).await?;

            tx.commit().await?;
            Ok(CommitOutcome::Created)
        }

        async fn link_existing(
            &self,
            link: &UserFileRow,
            task_id: Option<Uuid>,
            now: OffsetDateTime,
        ) -> MetadataResult<LinkOutcome> {
            let mut tx = self.pool.begin().await?;

            let existing: Option<Uuid> = sqlx::query_scalar(
                r#"
                SELECT user_file_id FROM user_files
                WHERE user_id = ? AND file_id = ? AND deleted_at IS NULL AND is_copy = 0
                "#,
            )
            .bind(link.user_id)
            .bind(link.file_id)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(existing) = existing {
                complete_task(&mut tx, task_id, now).await?;
                tx.commit().await?;
                return Ok(LinkOutcome::AlreadyLinked(existing));
            }

            let size: Option<i64> =
                sqlx::query_scalar("SELECT size FROM file_infos WHERE file_id = ?")
                    .bind(link.file_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            let Some(size) = size else {
                tx.rollback().await?;
                return Err(MetadataError::NotFound(format!("file {}", link.file_id)));
            };

            insert_user_file(&mut tx, link).await?;
            debit_quota(&mut tx, link.user_id, size).await?;
            complete_task(&mut tx, task_id, now).await?;

            tx.commit().await?;
            Ok(LinkOutcome::Linked(link.user_file_id))
        }

        async fn count_references(&self, file_id: Uuid) -> MetadataResult<u64> {
            let mut conn = self.pool.acquire().await?;
            count_refs(&mut conn, file_id).await
        }
    }

    async fn count_refs(conn: &mut SqliteConnection, file_id: Uuid) -> MetadataResult<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT
                (SELECT COUNT(*) FROM user_files WHERE file_id = ? AND deleted_at IS NULL)
              + (SELECT COUNT(*) FROM recycled WHERE file_id = ?)
            "#,
        )
        .bind(file_id)
        .bind(file_id)
        .fetch_one(&mut *conn)
        .await?;
        Ok(count as u64)
    }

    #[async_trait]
    impl UserFileRepo for SqliteStore {
        async fn get_user_file(
            &self,
            user_id: Uuid,
            file_id: Uuid,
        ) -> MetadataResult<Option<UserFileRow>> {
            let row = sqlx::query_as::<_, UserFileRow>(
                r#"
                SELECT * FROM user_files
                WHERE user_id = ? AND file_id = ? AND deleted_at IS NULL
                ORDER BY is_copy, created_at
                LIMIT 1
                "#,
            )
            .bind(user_id)
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn get_user_file_by_id(
            &self,
            user_file_id: Uuid,
        ) -> MetadataResult<Option<UserFileRow>> {
            let row =
                sqlx::query_as::<_, UserFileRow>("SELECT * FROM user_files WHERE user_file_id = ?")
                    .bind(user_file_id)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn find_public_link(&self, file_id: Uuid) -> MetadataResult<Option<UserFileRow>> {
            let row = sqlx::query_as::<_, UserFileRow>(
                "SELECT * FROM user_files WHERE file_id = ? AND is_public = 1 AND deleted_at IS NULL LIMIT 1",
            )
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn list_in_path(
            &self,
            user_id: Uuid,
            path_id: Uuid,
        ) -> MetadataResult<Vec<UserFileRow>> {
            let rows = sqlx::query_as::<_, UserFileRow>(
                "SELECT * FROM user_files WHERE user_id = ? AND path_id = ? AND deleted_at IS NULL ORDER BY name",
            )
            .bind(user_id)
            .bind(path_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn names_in_path(&self, user_id: Uuid, path_id: Uuid) -> MetadataResult<Vec<String>> {
            let rows: Vec<String> = sqlx::query_scalar(
                "SELECT name FROM user_files WHERE user_id = ? AND path_id = ? AND deleted_at IS NULL",
            )
            .bind(user_id)
            .bind(path_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn set_public(&self, user_file_id: Uuid, is_public: bool) -> MetadataResult<()> {
            let result = sqlx::query(
                "UPDATE user_files SET is_public = ? WHERE user_file_id = ? AND deleted_at IS NULL",
            )
            .bind(is_public)
            .bind(user_file_id)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("user file {user_file_id}")));
            }
            Ok(())
        }

        async fn copy_user_file(
            &self,
            source: Uuid,
            new_id: Uuid,
            name: &str,
            path_id: Uuid,
        ) -> MetadataResult<UserFileRow> {
            let mut tx = self.pool.begin().await?;

            let original = sqlx::query_as::<_, UserFileRow>(
                "SELECT * FROM user_files WHERE user_file_id = ? AND deleted_at IS NULL",
            )
            .bind(source)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("user file {source}")))?;

            let size: i64 = sqlx::query_scalar("SELECT size FROM file_infos WHERE file_id = ?")
                .bind(original.file_id)
                .fetch_one(&mut *tx)
                .await?;

            let copy = UserFileRow {
                user_file_id: new_id,
                name: name.to_string(),
                path_id,
                is_public: false,
                is_copy: true,
                deleted_at: None,
                created_at: OffsetDateTime::now_utc(),
                ..original
            };
            insert_user_file(&mut tx, &copy).await?;
            debit_quota(&mut tx, copy.user_id, size).await?;

            tx.commit().await?;
            Ok(copy)
        }

        async fn referenced_bytes(&self, user_id: Uuid) -> MetadataResult<i64> {
            let total: i64 = sqlx::query_scalar(
                r#"
                SELECT COALESCE(SUM(f.size), 0) FROM user_files uf
                JOIN file_infos f ON f.file_id = uf.file_id
                WHERE uf.user_id = ?
                "#,
            )
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
            Ok(total)
        }
    }

    async fn find_child(
        conn: &mut SqliteConnection,
        user_id: Uuid,
        parent_id: Uuid,
        name: &str,
    ) -> MetadataResult<Option<VirtualPathRow>> {
        let row = sqlx::query_as::<_, VirtualPathRow>(
            "SELECT * FROM virtual_paths WHERE user_id = ? AND parent_id = ? AND name = ?",
        )
        .bind(user_id)
        .bind(parent_id)
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row)
    }

    async fn root_of(
        conn: &mut SqliteConnection,
        user_id: Uuid,
    ) -> MetadataResult<VirtualPathRow> {
        let existing = sqlx::query_as::<_, VirtualPathRow>(
            "SELECT * FROM virtual_paths WHERE user_id = ? AND parent_id IS NULL",
        )
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(root) = existing {
            return Ok(root);
        }

        let root = VirtualPathRow {
            path_id: Uuid::new_v4(),
            user_id,
            name: String::new(),
            is_dir: true,
            parent_id: None,
            deleted_at: None,
            created_at: OffsetDateTime::now_utc(),
        };
        insert_path(conn, &root).await?;
        Ok(root)
    }

    async fn insert_path(conn: &mut SqliteConnection, row: &VirtualPathRow) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO virtual_paths (path_id, user_id, name, is_dir, parent_id, deleted_at, created_at)
            VALUES (?, ?, ?, ?, ?, NULL, ?)
            "#,
        )
        .bind(row.path_id)
        .bind(row.user_id)
        .bind(&row.name)
        .bind(row.is_dir)
        .bind(row.parent_id)
        .bind(row.created_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Clear `deleted_at` on a directory and every ancestor.
    async fn revive_chain(conn: &mut SqliteConnection, path_id: Uuid) -> MetadataResult<()> {
        let mut seen = HashSet::new();
        let mut cursor = Some(path_id);
        while let Some(id) = cursor {
            if !seen.insert(id) {
                return Err(MetadataError::Cycle(format!("directory {id} is its own ancestor")));
            }
            sqlx::query("UPDATE virtual_paths SET deleted_at = NULL WHERE path_id = ?")
                .bind(id)
                .execute(&mut *conn)
                .await?;
            cursor = sqlx::query_scalar::<_, Option<Uuid>>(
                "SELECT parent_id FROM virtual_paths WHERE path_id = ?",
            )
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .flatten();
        }
        Ok(())
    }

    #[async_trait]
    impl VirtualPathRepo for SqliteStore {
        async fn ensure_root(&self, user_id: Uuid) -> MetadataResult<VirtualPathRow> {
            let mut tx = self.pool.begin().await?;
            let root = root_of(&mut tx, user_id).await?;
            tx.commit().await?;
            Ok(root)
        }

        async fn ensure_path(&self, user_id: Uuid, path: &str) -> MetadataResult<VirtualPathRow> {
            let segments = path_segments(path)?;
            let mut tx = self.pool.begin().await?;

            let mut current = root_of(&mut tx, user_id).await?;
            for segment in segments {
                current = match find_child(&mut tx, user_id, current.path_id, segment).await? {
                    Some(mut child) => {
                        if child.deleted_at.is_some() {
                            sqlx::query(
                                "UPDATE virtual_paths SET deleted_at = NULL WHERE path_id = ?",
                            )
                            .bind(child.path_id)
                            .execute(&mut *tx)
                            .await?;
                            child.deleted_at = None;
                        }
                        child
                    }
                    None => {
                        let child = VirtualPathRow {
                            path_id: Uuid::new_v4(),
                            user_id,
                            name: segment.to_string(),
                            is_dir: true,
                            parent_id: Some(current.path_id),
                            deleted_at: None,
                            created_at: OffsetDateTime::now_utc(),
                        };
                        insert_path(&mut tx, &child).await?;
                        child
                    }
                };
            }

            tx.commit().await?;
            Ok(current)
        }

        async fn get_path(&self, path_id: Uuid) -> MetadataResult<Option<VirtualPathRow>> {
            let row =
                sqlx::query_as::<_, VirtualPathRow>("SELECT * FROM virtual_paths WHERE path_id = ?")
                    .bind(path_id)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn list_children(&self, path_id: Uuid) -> MetadataResult<Vec<VirtualPathRow>> {
            let rows = sqlx::query_as::<_, VirtualPathRow>(
                "SELECT * FROM virtual_paths WHERE parent_id = ? AND deleted_at IS NULL ORDER BY name",
            )
            .bind(path_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn move_path(
            &self,
            user_id: Uuid,
            path_id: Uuid,
            new_parent: Uuid,
        ) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;

            let node = sqlx::query_as::<_, VirtualPathRow>(
                "SELECT * FROM virtual_paths WHERE path_id = ? AND user_id = ?",
            )
            .bind(path_id)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("directory {path_id}")))?;
            if node.is_root() {
                return Err(MetadataError::Constraint("cannot move the root".to_string()));
            }

            // Walk from the new parent up to the root; meeting the node means a cycle.
            let mut seen = HashSet::new();
            let mut cursor = Some(new_parent);
            while let Some(id) = cursor {
                if id == path_id {
                    return Err(MetadataError::Cycle(format!(
                        "cannot move {path_id} under its own descendant {new_parent}"
                    )));
                }
                if !seen.insert(id) {
                    return Err(MetadataError::Cycle(format!("directory {id} is its own ancestor")));
                }
                let parent = sqlx::query_as::<_, VirtualPathRow>(
                    "SELECT * FROM virtual_paths WHERE path_id = ? AND user_id = ?",
                )
                .bind(id)
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| MetadataError::NotFound(format!("directory {id}")))?;
                cursor = parent.parent_id;
            }

            let result = sqlx::query("UPDATE virtual_paths SET parent_id = ? WHERE path_id = ?")
                .bind(new_parent)
                .bind(path_id)
                .execute(&mut *tx)
                .await;
            match result {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => {
                    return Err(MetadataError::AlreadyExists(format!(
                        "a directory named '{}' already exists there",
                        node.name
                    )));
                }
                Err(e) => return Err(e.into()),
            }

            tx.commit().await?;
            Ok(())
        }

        async fn subtree_ids(&self, path_id: Uuid) -> MetadataResult<Vec<Uuid>> {
            let ids: Vec<Uuid> = sqlx::query_scalar(SUBTREE_SQL)
                .bind(path_id)
                .fetch_all(&self.pool)
                .await?;
            Ok(ids)
        }
    }

    #[async_trait]
    impl RecycleRepo for SqliteStore {
        async fn soft_delete(
            &self,
            user_id: Uuid,
            user_file_id: Uuid,
            recycled_id: Uuid,
            now: OffsetDateTime,
        ) -> MetadataResult<RecycledRow> {
            let mut tx = self.pool.begin().await?;

            let file_id: Option<Uuid> = sqlx::query_scalar(
                "SELECT file_id FROM user_files WHERE user_file_id = ? AND user_id = ? AND deleted_at IS NULL",
            )
            .bind(user_file_id)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;
            let Some(file_id) = file_id else {
                tx.rollback().await?;
                return Err(MetadataError::NotFound(format!("user file {user_file_id}")));
            };

            sqlx::query("UPDATE user_files SET deleted_at = ? WHERE user_file_id = ?")
                .bind(now)
                .bind(user_file_id)
                .execute(&mut *tx)
                .await?;

            let row = RecycledRow {
                recycled_id,
                user_id,
                user_file_id,
                file_id,
                deleted_at: now,
            };
            insert_recycled(&mut tx, &row).await?;

            tx.commit().await?;
            Ok(row)
        }

        async fn soft_delete_directory(
            &self,
            user_id: Uuid,
            path_id: Uuid,
            now: OffsetDateTime,
        ) -> MetadataResult<Vec<RecycledRow>> {
            let mut tx = self.pool.begin().await?;

            let node = sqlx::query_as::<_, VirtualPathRow>(
                "SELECT * FROM virtual_paths WHERE path_id = ? AND user_id = ?",
            )
            .bind(path_id)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("directory {path_id}")))?;
            if node.is_root() {
                return Err(MetadataError::Constraint("cannot delete the root".to_string()));
            }

            let subtree: Vec<Uuid> = sqlx::query_scalar(SUBTREE_SQL)
                .bind(path_id)
                .fetch_all(&mut *tx)
                .await?;

            let mut recycled = Vec::new();
            for dir in &subtree {
                let links: Vec<(Uuid, Uuid)> = sqlx::query_as(
                    "SELECT user_file_id, file_id FROM user_files WHERE path_id = ? AND deleted_at IS NULL",
                )
                .bind(dir)
                .fetch_all(&mut *tx)
                .await?;

                for (user_file_id, file_id) in links {
                    sqlx::query("UPDATE user_files SET deleted_at = ? WHERE user_file_id = ?")
                        .bind(now)
                        .bind(user_file_id)
                        .execute(&mut *tx)
                        .await?;
                    let row = RecycledRow {
                        recycled_id: Uuid::new_v4(),
                        user_id,
                        user_file_id,
                        file_id,
                        deleted_at: now,
                    };
                    insert_recycled(&mut tx, &row).await?;
                    recycled.push(row);
                }

                sqlx::query("UPDATE virtual_paths SET deleted_at = ? WHERE path_id = ?")
                    .bind(now)
                    .bind(dir)
                    .execute(&mut *tx)
                    .await?;
            }

            tx.commit().await?;
            Ok(recycled)
        }

        async fn restore(&self, user_id: Uuid, recycled_id: Uuid) -> MetadataResult<UserFileRow> {
            let mut tx = self.pool.begin().await?;

            let entry = sqlx::query_as::<_, RecycledRow>(
                "SELECT * FROM recycled WHERE recycled_id = ? AND user_id = ?",
            )
            .bind(recycled_id)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("recycled entry {recycled_id}")))?;

            let result = sqlx::query("UPDATE user_files SET deleted_at = NULL WHERE user_file_id = ?")
                .bind(entry.user_file_id)
                .execute(&mut *tx)
                .await;
            match result {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => {
                    return Err(MetadataError::AlreadyExists(format!(
                        "file {} is already present for this user",
                        entry.file_id
                    )));
                }
                Err(e) => return Err(e.into()),
            }

            let link = sqlx::query_as::<_, UserFileRow>(
                "SELECT * FROM user_files WHERE user_file_id = ?",
            )
            .bind(entry.user_file_id)
            .fetch_one(&mut *tx)
            .await?;
            revive_chain(&mut tx, link.path_id).await?;

            sqlx::query("DELETE FROM recycled WHERE recycled_id = ?")
                .bind(recycled_id)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(link)
        }

        async fn get_recycled(&self, recycled_id: Uuid) -> MetadataResult<Option<RecycledRow>> {
            let row =
                sqlx::query_as::<_, RecycledRow>("SELECT * FROM recycled WHERE recycled_id = ?")
                    .bind(recycled_id)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn list_recycled(&self, user_id: Uuid) -> MetadataResult<Vec<RecycledRow>> {
            let rows = sqlx::query_as::<_, RecycledRow>(
                "SELECT * FROM recycled WHERE user_id = ? ORDER BY julianday(deleted_at) DESC",
            )
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn list_recycled_before(
            &self,
            cutoff: OffsetDateTime,
        ) -> MetadataResult<Vec<RecycledRow>> {
            let rows = sqlx::query_as::<_, RecycledRow>(
                r#"
                SELECT * FROM recycled
                WHERE julianday(deleted_at) < julianday(?)
                ORDER BY julianday(deleted_at)
                "#,
            )
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn purge_recycled(
            &self,
            user_id: Uuid,
            recycled_id: Uuid,
        ) -> MetadataResult<PurgeOutcome> {
            let mut tx = self.pool.begin().await?;

            let entry = sqlx::query_as::<_, RecycledRow>(
                "SELECT * FROM recycled WHERE recycled_id = ? AND user_id = ?",
            )
            .bind(recycled_id)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("recycled entry {recycled_id}")))?;

            let file = sqlx::query_as::<_, FileInfoRow>("SELECT * FROM file_infos WHERE file_id = ?")
                .bind(entry.file_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| MetadataError::NotFound(format!("file {}", entry.file_id)))?;

            let references = count_refs(&mut tx, entry.file_id).await?;

            sqlx::query("DELETE FROM recycled WHERE recycled_id = ?")
                .bind(recycled_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM user_files WHERE user_file_id = ?")
                .bind(entry.user_file_id)
                .execute(&mut *tx)
                .await?;

            let refunded = credit_quota(&mut tx, user_id, file.size).await?;

            let released = if references <= 1 {
                let chunks = sqlx::query_as::<_, FileChunkRow>(
                    "SELECT * FROM file_chunks WHERE file_id = ? ORDER BY chunk_index",
                )
                .bind(file.file_id)
                .fetch_all(&mut *tx)
                .await?;
                sqlx::query("DELETE FROM file_chunks WHERE file_id = ?")
                    .bind(file.file_id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM file_infos WHERE file_id = ?")
                    .bind(file.file_id)
                    .execute(&mut *tx)
                    .await?;
                Some(ReleasedFile { file, chunks })
            } else {
                None
            };

            tx.commit().await?;
            Ok(PurgeOutcome { released, refunded })
        }
    }

    async fn insert_recycled(conn: &mut SqliteConnection, row: &RecycledRow) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO recycled (recycled_id, user_id, user_file_id, file_id, deleted_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(row.recycled_id)
        .bind(row.user_id)
        .bind(row.user_file_id)
        .bind(row.file_id)
        .bind(row.deleted_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    #[async_trait]
    impl ShareRepo for SqliteStore {
        async fn create_share(&self, share: &ShareRow) -> MetadataResult<()> {
            let result = sqlx::query(
                r#"
                INSERT INTO shares (
                    share_id, user_id, user_file_id, file_id, token,
                    password_hash, expires_at, download_count, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)
                "#,
            )
            .bind(share.share_id)
            .bind(share.user_id)
            .bind(share.user_file_id)
            .bind(share.file_id)
            .bind(&share.token)
            .bind(&share.password_hash)
            .bind(share.expires_at)
            .bind(share.created_at)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => Ok(()),
                Err(e) if is_unique_violation(&e) => Err(MetadataError::AlreadyExists(
                    "share token already in use".to_string(),
                )),
                Err(e) => Err(e.into()),
            }
        }

        async fn get_share_by_token(&self, token: &str) -> MetadataResult<Option<ShareRow>> {
            let row = sqlx::query_as::<_, ShareRow>("SELECT * FROM shares WHERE token = ?")
                .bind(token)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn increment_share_downloads(&self, share_id: Uuid) -> MetadataResult<()> {
            sqlx::query("UPDATE shares SET download_count = download_count + 1 WHERE share_id = ?")
                .bind(share_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn list_shares(&self, user_id: Uuid) -> MetadataResult<Vec<ShareRow>> {
            let rows = sqlx::query_as::<_, ShareRow>(
                "SELECT * FROM shares WHERE user_id = ? ORDER BY julianday(created_at) DESC",
            )
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn delete_share(&self, user_id: Uuid, share_id: Uuid) -> MetadataResult<()> {
            let result = sqlx::query("DELETE FROM shares WHERE share_id = ? AND user_id = ?")
                .bind(share_id)
                .bind(user_id)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("share {share_id}")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl UploadTaskRepo for SqliteStore {
        async fn create_upload_task(&self, task: &UploadTaskRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO upload_tasks (
                    task_id, user_id, filename, size, chunk_size, total_chunks, uploaded_chunks,
                    chunk_signature, first_chunk_hash, second_chunk_hash, third_chunk_hash,
                    virtual_path, disk_id, temp_dir, status, error, expire_time,
                    created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(task.task_id)
            .bind(task.user_id)
            .bind(&task.filename)
            .bind(task.size)
            .bind(task.chunk_size)
            .bind(task.total_chunks)
            .bind(task.uploaded_chunks)
            .bind(&task.chunk_signature)
            .bind(&task.first_chunk_hash)
            .bind(&task.second_chunk_hash)
            .bind(&task.third_chunk_hash)
            .bind(&task.virtual_path)
            .bind(task.disk_id)
            .bind(&task.temp_dir)
            .bind(&task.status)
            .bind(&task.error)
            .bind(task.expire_time)
            .bind(task.created_at)
            .bind(task.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn get_upload_task(&self, task_id: Uuid) -> MetadataResult<Option<UploadTaskRow>> {
            let row =
                sqlx::query_as::<_, UploadTaskRow>("SELECT * FROM upload_tasks WHERE task_id = ?")
                    .bind(task_id)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn find_resumable_task(
            &self,
            user_id: Uuid,
            chunk_signature: &str,
            size: i64,
            virtual_path: &str,
            now: OffsetDateTime,
        ) -> MetadataResult<Option<UploadTaskRow>> {
            let row = sqlx::query_as::<_, UploadTaskRow>(
                r#"
                SELECT * FROM upload_tasks
                WHERE user_id = ? AND chunk_signature = ? AND size = ? AND virtual_path = ?
                  AND status IN ('pending', 'uploading')
                  AND julianday(expire_time) >= julianday(?)
                ORDER BY julianday(created_at) DESC
                LIMIT 1
                "#,
            )
            .bind(user_id)
            .bind(chunk_signature)
            .bind(size)
            .bind(virtual_path)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn record_chunk(
            &self,
            task_id: Uuid,
            index: u32,
            now: OffsetDateTime,
        ) -> MetadataResult<u32> {
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                "INSERT OR IGNORE INTO upload_task_chunks (task_id, chunk_index, received_at) VALUES (?, ?, ?)",
            )
            .bind(task_id)
            .bind(i64::from(index))
            .bind(now)
            .execute(&mut *tx)
            .await?;

            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM upload_task_chunks WHERE task_id = ?")
                    .bind(task_id)
                    .fetch_one(&mut *tx)
                    .await?;

            let result = sqlx::query(
                r#"
                UPDATE upload_tasks
                SET uploaded_chunks = ?,
                    status = CASE WHEN status = 'pending' THEN 'uploading' ELSE status END,
                    updated_at = ?
                WHERE task_id = ?
                "#,
            )
            .bind(count)
            .bind(now)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                tx.rollback().await?;
                return Err(MetadataError::NotFound(format!("upload task {task_id}")));
            }

            tx.commit().await?;
            u32::try_from(count).map_err(|_| MetadataError::Internal("chunk count overflow".into()))
        }

        async fn received_chunks(&self, task_id: Uuid) -> MetadataResult<Vec<u32>> {
            let rows: Vec<i64> = sqlx::query_scalar(
                "SELECT chunk_index FROM upload_task_chunks WHERE task_id = ? ORDER BY chunk_index",
            )
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows
                .into_iter()
                .filter_map(|i| u32::try_from(i).ok())
                .collect())
        }

        async fn update_upload_status(
            &self,
            task_id: Uuid,
            status: &str,
            error: Option<&str>,
            now: OffsetDateTime,
        ) -> MetadataResult<()> {
            let result = sqlx::query(
                "UPDATE upload_tasks SET status = ?, error = ?, updated_at = ? WHERE task_id = ?",
            )
            .bind(status)
            .bind(error)
            .bind(now)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("upload task {task_id}")));
            }
            Ok(())
        }

        async fn renew_upload_task(
            &self,
            task_id: Uuid,
            expire_time: OffsetDateTime,
            now: OffsetDateTime,
        ) -> MetadataResult<()> {
            let result = sqlx::query(
                r#"
                UPDATE upload_tasks SET expire_time = ?, updated_at = ?
                WHERE task_id = ? AND status IN ('pending', 'uploading')
                "#,
            )
            .bind(expire_time)
            .bind(now)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::InvalidStateTransition {
                    from: "terminal".to_string(),
                    to: "renewed".to_string(),
                });
            }
            Ok(())
        }

        async fn list_stale_upload_tasks(
            &self,
            now: OffsetDateTime,
        ) -> MetadataResult<Vec<UploadTaskRow>> {
            let rows = sqlx::query_as::<_, UploadTaskRow>(
                r#"
                SELECT * FROM upload_tasks
                WHERE (status IN ('pending', 'uploading') AND julianday(expire_time) < julianday(?))
                   OR status IN ('failed', 'aborted')
                ORDER BY julianday(expire_time)
                "#,
            )
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn delete_upload_task(&self, task_id: Uuid) -> MetadataResult<()> {
            sqlx::query("DELETE FROM upload_tasks WHERE task_id = ?")
                .bind(task_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }
    }

    #[async_trait]
    impl DownloadTaskRepo for SqliteStore {
        async fn create_download_task(&self, task: &DownloadTaskRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO download_tasks (
                    task_id, user_id, kind, source, virtual_path, encrypt, file_name, file_size,
                    downloaded_bytes, progress, speed, state, supports_range, local_path,
                    file_id, error, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(task.task_id)
            .bind(task.user_id)
            .bind(&task.kind)
            .bind(&task.source)
            .bind(&task.virtual_path)
            .bind(task.encrypt)
            .bind(&task.file_name)
            .bind(task.file_size)
            .bind(task.downloaded_bytes)
            .bind(task.progress)
            .bind(task.speed)
            .bind(&task.state)
            .bind(task.supports_range)
            .bind(&task.local_path)
            .bind(task.file_id)
            .bind(&task.error)
            .bind(task.created_at)
            .bind(task.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn get_download_task(
            &self,
            task_id: Uuid,
        ) -> MetadataResult<Option<DownloadTaskRow>> {
            let row = sqlx::query_as::<_, DownloadTaskRow>(
                "SELECT * FROM download_tasks WHERE task_id = ?",
            )
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn list_download_tasks(&self, user_id: Uuid) -> MetadataResult<Vec<DownloadTaskRow>> {
            let rows = sqlx::query_as::<_, DownloadTaskRow>(
                "SELECT * FROM download_tasks WHERE user_id = ? ORDER BY julianday(created_at) DESC",
            )
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn transition_download(
            &self,
            task_id: Uuid,
            from: &str,
            to: &str,
            error: Option<&str>,
            now: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                UPDATE download_tasks
                SET state = ?, error = COALESCE(?, error), updated_at = ?,
                    speed = CASE WHEN ? = 'downloading' THEN speed ELSE 0 END
                WHERE task_id = ? AND state = ?
                "#,
            )
            .bind(to)
            .bind(error)
            .bind(now)
            .bind(to)
            .bind(task_id)
            .bind(from)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn set_download_probe(
            &self,
            task_id: Uuid,
            file_name: &str,
            file_size: Option<i64>,
            supports_range: bool,
            local_path: &str,
            now: OffsetDateTime,
        ) -> MetadataResult<()> {
            sqlx::query(
                r#"
                UPDATE download_tasks
                SET file_name = ?, file_size = ?, supports_range = ?, local_path = ?, updated_at = ?
                WHERE task_id = ?
                "#,
            )
            .bind(file_name)
            .bind(file_size)
            .bind(supports_range)
            .bind(local_path)
            .bind(now)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn update_download_progress(
            &self,
            task_id: Uuid,
            update: DownloadProgressUpdate,
            now: OffsetDateTime,
        ) -> MetadataResult<()> {
            sqlx::query(
                r#"
                UPDATE download_tasks
                SET downloaded_bytes = ?, progress = ?, speed = ?, updated_at = ?
                WHERE task_id = ?
                "#,
            )
            .bind(update.downloaded_bytes)
            .bind(update.progress)
            .bind(update.speed)
            .bind(now)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn finish_download(
            &self,
            task_id: Uuid,
            file_id: Option<Uuid>,
            now: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                UPDATE download_tasks
                SET state = 'finished', file_id = ?, progress = 100.0, speed = 0, updated_at = ?
                WHERE task_id = ? AND state IN ('downloading', 'paused')
                "#,
            )
            .bind(file_id)
            .bind(now)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn delete_download_task(&self, task_id: Uuid) -> MetadataResult<()> {
            sqlx::query("DELETE FROM download_tasks WHERE task_id = ?")
                .bind(task_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn pause_interrupted_downloads(&self, now: OffsetDateTime) -> MetadataResult<u64> {
            let result = sqlx::query(
                "UPDATE download_tasks SET state = 'paused', speed = 0, updated_at = ? WHERE state = 'downloading'",
            )
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        }
    }
}

impl std::convert::From<std::io::Error> for crate::MetadataError {
    fn from(e: std::io::Error) -> Self {
        crate::MetadataError::Config(e.to_string())
    }
}

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
-- Groups and permissions
CREATE TABLE IF NOT EXISTS groups (
    group_id BLOB PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    is_default INTEGER NOT NULL DEFAULT 0,
    default_space INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
-- Exactly one default group
CREATE UNIQUE INDEX IF NOT EXISTS idx_groups_default ON groups(is_default) WHERE is_default = 1;

CREATE TABLE IF NOT EXISTS permissions (
    characteristic TEXT PRIMARY KEY,
    description TEXT NOT NULL DEFAULT ''
);
INSERT OR IGNORE INTO permissions (characteristic, description) VALUES
    ('file:upload', 'Upload files'),
    ('file:download', 'Read public files of other users'),
    ('offline:download', 'Submit offline downloads'),
    ('webdav:access', 'Use the WebDAV surface'),
    ('share:create', 'Create share links');

CREATE TABLE IF NOT EXISTS group_permissions (
    group_id BLOB NOT NULL REFERENCES groups(group_id) ON DELETE CASCADE,
    characteristic TEXT NOT NULL REFERENCES permissions(characteristic) ON DELETE CASCADE,
    PRIMARY KEY (group_id, characteristic)
);

-- Users
CREATE TABLE IF NOT EXISTS users (
    user_id BLOB PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    group_id BLOB NOT NULL REFERENCES groups(group_id),
    space INTEGER NOT NULL DEFAULT 0,
    free_space INTEGER NOT NULL DEFAULT 0,
    file_passphrase_hash TEXT,
    file_salt TEXT,
    state TEXT NOT NULL DEFAULT 'normal',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    CHECK (space = 0 OR (free_space >= 0 AND free_space <= space))
);

-- Disks (rowid order is the tie-break order for placement)
CREATE TABLE IF NOT EXISTS disks (
    disk_id BLOB PRIMARY KEY,
    root TEXT NOT NULL UNIQUE,
    data_dir TEXT NOT NULL,
    size INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

-- Physical files
CREATE TABLE IF NOT EXISTS file_infos (
    file_id BLOB PRIMARY KEY,
    name TEXT NOT NULL,
    stored_name TEXT NOT NULL,
    size INTEGER NOT NULL,
    mime TEXT NOT NULL,
    disk_id BLOB NOT NULL REFERENCES disks(disk_id),
    path TEXT NOT NULL,
    thumbnail_path TEXT,
    full_hash TEXT,
    has_full_hash INTEGER NOT NULL DEFAULT 0,
    chunk_signature TEXT NOT NULL,
    first_chunk_hash TEXT NOT NULL DEFAULT '',
    second_chunk_hash TEXT NOT NULL DEFAULT '',
    third_chunk_hash TEXT NOT NULL DEFAULT '',
    is_encrypted INTEGER NOT NULL DEFAULT 0,
    enc_path TEXT,
    is_chunked INTEGER NOT NULL DEFAULT 0,
    chunk_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
-- Dedup fingerprint; encrypted blobs are per-user and never shared
CREATE UNIQUE INDEX IF NOT EXISTS idx_file_infos_fingerprint
ON file_infos(chunk_signature, size) WHERE is_encrypted = 0;

CREATE TABLE IF NOT EXISTS file_chunks (
    file_id BLOB NOT NULL REFERENCES file_infos(file_id) ON DELETE CASCADE,
    chunk_index INTEGER NOT NULL,
    path TEXT NOT NULL,
    size INTEGER NOT NULL,
    hash TEXT NOT NULL,
    PRIMARY KEY (file_id, chunk_index)
);

-- Virtual directory trees
CREATE TABLE IF NOT EXISTS virtual_paths (
    path_id BLOB PRIMARY KEY,
    user_id BLOB NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    is_dir INTEGER NOT NULL DEFAULT 1,
    parent_id BLOB REFERENCES virtual_paths(path_id),
    deleted_at TEXT,
    created_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_virtual_paths_root ON virtual_paths(user_id) WHERE parent_id IS NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_virtual_paths_sibling ON virtual_paths(user_id, parent_id, name);

-- Per-user links
CREATE TABLE IF NOT EXISTS user_files (
    user_file_id BLOB PRIMARY KEY,
    user_id BLOB NOT NULL REFERENCES users(user_id),
    file_id BLOB NOT NULL REFERENCES file_infos(file_id),
    name TEXT NOT NULL,
    path_id BLOB NOT NULL REFERENCES virtual_paths(path_id),
    is_public INTEGER NOT NULL DEFAULT 0,
    is_copy INTEGER NOT NULL DEFAULT 0,
    deleted_at TEXT,
    created_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_user_files_live
ON user_files(user_id, file_id) WHERE deleted_at IS NULL AND is_copy = 0;
CREATE INDEX IF NOT EXISTS idx_user_files_file ON user_files(file_id);
CREATE INDEX IF NOT EXISTS idx_user_files_path ON user_files(user_id, path_id);

-- Recycle bin
CREATE TABLE IF NOT EXISTS recycled (
    recycled_id BLOB PRIMARY KEY,
    user_id BLOB NOT NULL REFERENCES users(user_id),
    user_file_id BLOB NOT NULL UNIQUE REFERENCES user_files(user_file_id) ON DELETE CASCADE,
    file_id BLOB NOT NULL,
    deleted_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_recycled_user ON recycled(user_id);
CREATE INDEX IF NOT EXISTS idx_recycled_file ON recycled(file_id);

-- Shares
CREATE TABLE IF NOT EXISTS shares (
    share_id BLOB PRIMARY KEY,
    user_id BLOB NOT NULL REFERENCES users(user_id),
    user_file_id BLOB NOT NULL REFERENCES user_files(user_file_id) ON DELETE CASCADE,
    file_id BLOB NOT NULL,
    token TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL DEFAULT '',
    expires_at TEXT,
    download_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

-- Upload tasks
CREATE TABLE IF NOT EXISTS upload_tasks (
    task_id BLOB PRIMARY KEY,
    user_id BLOB NOT NULL REFERENCES users(user_id),
    filename TEXT NOT NULL,
    size INTEGER NOT NULL,
    chunk_size INTEGER NOT NULL,
    total_chunks INTEGER NOT NULL,
    uploaded_chunks INTEGER NOT NULL DEFAULT 0,
    chunk_signature TEXT NOT NULL,
    first_chunk_hash TEXT NOT NULL DEFAULT '',
    second_chunk_hash TEXT NOT NULL DEFAULT '',
    third_chunk_hash TEXT NOT NULL DEFAULT '',
    virtual_path TEXT NOT NULL,
    disk_id BLOB NOT NULL REFERENCES disks(disk_id),
    temp_dir TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    error TEXT,
    expire_time TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_upload_tasks_resume ON upload_tasks(user_id, chunk_signature, size);
CREATE INDEX IF NOT EXISTS idx_upload_tasks_status ON upload_tasks(status);

CREATE TABLE IF NOT EXISTS upload_task_chunks (
    task_id BLOB NOT NULL REFERENCES upload_tasks(task_id) ON DELETE CASCADE,
    chunk_index INTEGER NOT NULL,
    received_at TEXT NOT NULL,
    PRIMARY KEY (task_id, chunk_index)
);

-- Offline download tasks
CREATE TABLE IF NOT EXISTS download_tasks (
    task_id BLOB PRIMARY KEY,
    user_id BLOB NOT NULL REFERENCES users(user_id),
    kind TEXT NOT NULL,
    source TEXT NOT NULL,
    virtual_path TEXT NOT NULL,
    encrypt INTEGER NOT NULL DEFAULT 0,
    file_name TEXT,
    file_size INTEGER,
    downloaded_bytes INTEGER NOT NULL DEFAULT 0,
    progress REAL NOT NULL DEFAULT 0,
    speed INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL DEFAULT 'init',
    supports_range INTEGER NOT NULL DEFAULT 0,
    local_path TEXT,
    file_id BLOB,
    error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_download_tasks_user ON download_tasks(user_id);
CREATE INDEX IF NOT EXISTS idx_download_tasks_state ON download_tasks(state);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::*;

    struct Fixture {
        store: SqliteStore,
        group: Uuid,
        disk: Uuid,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("meta.db"), None).await.unwrap();
        let now = OffsetDateTime::now_utc();
        let group = GroupRow {
            group_id: Uuid::new_v4(),
            name: "default".to_string(),
            is_default: true,
            default_space: 0,
            created_at: now,
        };
        store.create_group(&group).await.unwrap();
        let disk = store
            .register_disk(&DiskRow {
                disk_id: Uuid::new_v4(),
                root: dir.path().join("disk0").display().to_string(),
                data_dir: "data".to_string(),
                size: 1 << 40,
                created_at: now,
            })
            .await
            .unwrap();
        Fixture {
            store,
            group: group.group_id,
            disk: disk.disk_id,
            _dir: dir,
        }
    }

    async fn user(f: &Fixture, name: &str, space: i64) -> Uuid {
        let now = OffsetDateTime::now_utc();
        let id = Uuid::new_v4();
        f.store
            .create_user(&UserRow {
                user_id: id,
                username: name.to_string(),
                group_id: f.group,
                space,
                free_space: space,
                file_passphrase_hash: None,
                file_salt: None,
                state: "normal".to_string(),
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        id
    }

    fn file_row(f: &Fixture, signature: &str, size: i64) -> FileInfoRow {
        FileInfoRow {
            file_id: Uuid::new_v4(),
            name: "a.bin".to_string(),
            stored_name: Uuid::new_v4().simple().to_string(),
            size,
            mime: "application/octet-stream".to_string(),
            disk_id: f.disk,
            path: "/blob".to_string(),
            thumbnail_path: None,
            full_hash: Some("ff".repeat(32)),
            has_full_hash: true,
            chunk_signature: signature.to_string(),
            first_chunk_hash: "aa".repeat(32),
            second_chunk_hash: String::new(),
            third_chunk_hash: String::new(),
            is_encrypted: false,
            enc_path: None,
            is_chunked: false,
            chunk_count: 0,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    async fn link_row(f: &Fixture, user_id: Uuid, file_id: Uuid) -> UserFileRow {
        let root = f.store.ensure_root(user_id).await.unwrap();
        UserFileRow {
            user_file_id: Uuid::new_v4(),
            user_id,
            file_id,
            name: "a.bin".to_string(),
            path_id: root.path_id,
            is_public: false,
            is_copy: false,
            deleted_at: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    async fn free(f: &Fixture, user_id: Uuid) -> i64 {
        f.store.get_user(user_id).await.unwrap().unwrap().free_space
    }

    #[tokio::test]
    async fn commit_debits_quota_and_reports_duplicates() {
        let f = fixture().await;
        let a = user(&f, "a", 1000).await;
        let b = user(&f, "b", 1000).await;
        let now = OffsetDateTime::now_utc();

        let file = file_row(&f, "sig", 300);
        let link = link_row(&f, a, file.file_id).await;
        let outcome = f.store.commit_upload(&file, &[], &link, None, now).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Created);
        assert_eq!(free(&f, a).await, 700);

        // A second commit of the same fingerprint writes nothing.
        let racer = file_row(&f, "sig", 300);
        let racer_link = link_row(&f, b, racer.file_id).await;
        let outcome = f
            .store
            .commit_upload(&racer, &[], &racer_link, None, now)
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Duplicate(file.file_id));
        assert_eq!(free(&f, b).await, 1000);
        assert!(f.store.get_file(racer.file_id).await.unwrap().is_none());

        // The loser links the winner instead.
        let instant = link_row(&f, b, file.file_id).await;
        let linked = f.store.link_existing(&instant, None, now).await.unwrap();
        assert_eq!(linked, LinkOutcome::Linked(instant.user_file_id));
        assert_eq!(free(&f, b).await, 700);
        assert_eq!(f.store.count_references(file.file_id).await.unwrap(), 2);

        // Linking again is a no-op.
        let again = link_row(&f, b, file.file_id).await;
        let outcome = f.store.link_existing(&again, None, now).await.unwrap();
        assert_eq!(outcome, LinkOutcome::AlreadyLinked(instant.user_file_id));
        assert_eq!(free(&f, b).await, 700);
    }

    #[tokio::test]
    async fn quota_refusal_rolls_back_commit() {
        let f = fixture().await;
        let a = user(&f, "small", 100).await;
        let file = file_row(&f, "big", 500);
        let link = link_row(&f, a, file.file_id).await;

        let err = f
            .store
            .commit_upload(&file, &[], &link, None, OffsetDateTime::now_utc())
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::QuotaExceeded { .. }));
        assert!(f.store.get_file(file.file_id).await.unwrap().is_none());
        assert_eq!(free(&f, a).await, 100);
    }

    #[tokio::test]
    async fn commit_rejects_gapped_chunks() {
        let f = fixture().await;
        let a = user(&f, "chunky", 0).await;
        let mut file = file_row(&f, "chunked", 20);
        file.is_chunked = true;
        file.chunk_count = 2;
        let chunk = |i: i64| FileChunkRow {
            file_id: file.file_id,
            chunk_index: i,
            path: format!("/c_{i}"),
            size: 10,
            hash: "00".repeat(32),
        };
        let link = link_row(&f, a, file.file_id).await;
        let now = OffsetDateTime::now_utc();

        let err = f
            .store
            .commit_upload(&file, &[chunk(0), chunk(2)], &link, None, now)
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::Constraint(_)));

        f.store
            .commit_upload(&file, &[chunk(0), chunk(1)], &link, None, now)
            .await
            .unwrap();
        let chunks = f.store.get_chunks(file.file_id).await.unwrap();
        assert_eq!(chunks.iter().map(|c| c.chunk_index).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[tokio::test]
    async fn purge_is_reference_counted() {
        let f = fixture().await;
        let a = user(&f, "a", 1000).await;
        let b = user(&f, "b", 1000).await;
        let now = OffsetDateTime::now_utc();

        let file = file_row(&f, "shared", 400);
        let link_a = link_row(&f, a, file.file_id).await;
        f.store.commit_upload(&file, &[], &link_a, None, now).await.unwrap();
        let link_b = link_row(&f, b, file.file_id).await;
        f.store.link_existing(&link_b, None, now).await.unwrap();

        let rec_a = f
            .store
            .soft_delete(a, link_a.user_file_id, Uuid::new_v4(), now)
            .await
            .unwrap();
        // Recycled files still count against quota.
        assert_eq!(free(&f, a).await, 600);

        let outcome = f.store.purge_recycled(a, rec_a.recycled_id).await.unwrap();
        assert!(outcome.released.is_none());
        assert_eq!(outcome.refunded, 400);
        assert_eq!(free(&f, a).await, 1000);
        assert_eq!(free(&f, b).await, 600);
        assert!(f.store.get_file(file.file_id).await.unwrap().is_some());

        let rec_b = f
            .store
            .soft_delete(b, link_b.user_file_id, Uuid::new_v4(), now)
            .await
            .unwrap();
        let outcome = f.store.purge_recycled(b, rec_b.recycled_id).await.unwrap();
        let released = outcome.released.expect("last reference releases the file");
        assert_eq!(released.file.file_id, file.file_id);
        assert_eq!(free(&f, b).await, 1000);
        assert!(f.store.get_file(file.file_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn restore_clears_soft_delete() {
        let f = fixture().await;
        let a = user(&f, "a", 0).await;
        let now = OffsetDateTime::now_utc();
        let file = file_row(&f, "restore", 10);
        let link = link_row(&f, a, file.file_id).await;
        f.store.commit_upload(&file, &[], &link, None, now).await.unwrap();

        let rec = f
            .store
            .soft_delete(a, link.user_file_id, Uuid::new_v4(), now)
            .await
            .unwrap();
        assert!(f.store.get_user_file(a, file.file_id).await.unwrap().is_none());

        // Someone else cannot restore it.
        let other = user(&f, "other", 0).await;
        assert!(f.store.restore(other, rec.recycled_id).await.is_err());

        let restored = f.store.restore(a, rec.recycled_id).await.unwrap();
        assert!(restored.deleted_at.is_none());
        assert!(f.store.get_recycled(rec.recycled_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn directory_delete_cascades_and_restore_revives_parents() {
        let f = fixture().await;
        let a = user(&f, "a", 0).await;
        let now = OffsetDateTime::now_utc();

        let top = f.store.ensure_path(a, "/docs").await.unwrap();
        let leaf = f.store.ensure_path(a, "/docs/2024").await.unwrap();
        let file = file_row(&f, "nested", 10);
        let mut link = link_row(&f, a, file.file_id).await;
        link.path_id = leaf.path_id;
        f.store.commit_upload(&file, &[], &link, None, now).await.unwrap();

        let recycled = f
            .store
            .soft_delete_directory(a, top.path_id, now)
            .await
            .unwrap();
        assert_eq!(recycled.len(), 1);
        let root = f.store.ensure_root(a).await.unwrap();
        assert!(f.store.list_children(root.path_id).await.unwrap().is_empty());

        f.store.restore(a, recycled[0].recycled_id).await.unwrap();
        let children = f.store.list_children(root.path_id).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "docs");
    }

    #[tokio::test]
    async fn move_path_rejects_cycles() {
        let f = fixture().await;
        let a = user(&f, "a", 0).await;
        let top = f.store.ensure_path(a, "/a").await.unwrap();
        let child = f.store.ensure_path(a, "/a/b").await.unwrap();
        let grandchild = f.store.ensure_path(a, "/a/b/c").await.unwrap();

        let err = f
            .store
            .move_path(a, top.path_id, grandchild.path_id)
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::Cycle(_)));
        assert!(matches!(
            f.store.move_path(a, top.path_id, top.path_id).await,
            Err(MetadataError::Cycle(_))
        ));

        let other = f.store.ensure_path(a, "/z").await.unwrap();
        f.store.move_path(a, child.path_id, other.path_id).await.unwrap();
        let subtree = f.store.subtree_ids(other.path_id).await.unwrap();
        assert_eq!(subtree.len(), 3);
        assert!(f.store.ensure_path(a, "/../etc").await.is_err());
    }

    #[tokio::test]
    async fn default_group_stays_unique() {
        let f = fixture().await;
        let second = GroupRow {
            group_id: Uuid::new_v4(),
            name: "staff".to_string(),
            is_default: false,
            default_space: 0,
            created_at: OffsetDateTime::now_utc(),
        };
        f.store.create_group(&second).await.unwrap();

        let duplicate_default = GroupRow {
            group_id: Uuid::new_v4(),
            name: "other".to_string(),
            is_default: true,
            ..second.clone()
        };
        assert!(f.store.create_group(&duplicate_default).await.is_err());

        f.store.set_default_group(second.group_id).await.unwrap();
        let default = f.store.get_default_group().await.unwrap().unwrap();
        assert_eq!(default.group_id, second.group_id);
        assert!(!f.store.get_group(f.group).await.unwrap().unwrap().is_default);
    }

    #[tokio::test]
    async fn permissions_are_group_union() {
        let f = fixture().await;
        let a = user(&f, "a", 0).await;
        f.store.grant_permission(f.group, "file:upload").await.unwrap();
        f.store.grant_permission(f.group, "file:upload").await.unwrap();
        f.store.grant_permission(f.group, "share:create").await.unwrap();
        assert_eq!(
            f.store.effective_permissions(a).await.unwrap(),
            vec!["file:upload".to_string(), "share:create".to_string()]
        );
        assert!(f.store.grant_permission(f.group, "bogus").await.is_err());
    }

    #[tokio::test]
    async fn upload_task_chunks_are_idempotent() {
        let f = fixture().await;
        let a = user(&f, "a", 0).await;
        let now = OffsetDateTime::now_utc();
        let task = UploadTaskRow {
            task_id: Uuid::new_v4(),
            user_id: a,
            filename: "x".to_string(),
            size: 30,
            chunk_size: 10,
            total_chunks: 3,
            uploaded_chunks: 0,
            chunk_signature: "sig".to_string(),
            first_chunk_hash: String::new(),
            second_chunk_hash: String::new(),
            third_chunk_hash: String::new(),
            virtual_path: "/".to_string(),
            disk_id: f.disk,
            temp_dir: "/tmp/x".to_string(),
            status: "pending".to_string(),
            error: None,
            expire_time: now + time::Duration::days(7),
            created_at: now,
            updated_at: now,
        };
        f.store.create_upload_task(&task).await.unwrap();

        assert_eq!(f.store.record_chunk(task.task_id, 2, now).await.unwrap(), 1);
        assert_eq!(f.store.record_chunk(task.task_id, 2, now).await.unwrap(), 1);
        assert_eq!(f.store.record_chunk(task.task_id, 0, now).await.unwrap(), 2);
        assert_eq!(f.store.received_chunks(task.task_id).await.unwrap(), vec![0, 2]);
        let row = f.store.get_upload_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(row.status, "uploading");

        let found = f
            .store
            .find_resumable_task(a, "sig", 30, "/", now)
            .await
            .unwrap();
        assert_eq!(found.unwrap().task_id, task.task_id);

        let later = now + time::Duration::days(8);
        assert!(f.store.find_resumable_task(a, "sig", 30, "/", later).await.unwrap().is_none());
        let stale = f.store.list_stale_upload_tasks(later).await.unwrap();
        assert_eq!(stale.len(), 1);
    }

    #[tokio::test]
    async fn interrupted_downloads_are_paused() {
        let f = fixture().await;
        let a = user(&f, "a", 0).await;
        let now = OffsetDateTime::now_utc();
        let task = DownloadTaskRow {
            task_id: Uuid::new_v4(),
            user_id: a,
            kind: "http".to_string(),
            source: "http://example.com/x".to_string(),
            virtual_path: "/".to_string(),
            encrypt: false,
            file_name: None,
            file_size: None,
            downloaded_bytes: 0,
            progress: 0.0,
            speed: 0,
            state: "init".to_string(),
            supports_range: false,
            local_path: None,
            file_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        f.store.create_download_task(&task).await.unwrap();

        assert!(
            f.store
                .transition_download(task.task_id, "init", "downloading", None, now)
                .await
                .unwrap()
        );
        // Stale compare-and-set loses.
        assert!(
            !f.store
                .transition_download(task.task_id, "init", "downloading", None, now)
                .await
                .unwrap()
        );
        assert_eq!(f.store.pause_interrupted_downloads(now).await.unwrap(), 1);
        let row = f.store.get_download_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(row.state, "paused");

        // Ingest already ran when the pause landed.
        assert!(f.store.finish_download(task.task_id, None, now).await.unwrap());
        let row = f.store.get_download_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(row.state, "finished");

        let failed = DownloadTaskRow {
            task_id: Uuid::new_v4(),
            state: "failed".to_string(),
            ..task
        };
        f.store.create_download_task(&failed).await.unwrap();
        assert!(!f.store.finish_download(failed.task_id, None, now).await.unwrap());
    }
}
