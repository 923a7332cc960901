//! On-disk blob layout.
//!
//! A blob lives at `<root>/<data_dir>/<basename>/<random>.data`. Its siblings
//! share the `<random>` stem: chunk files `<random>_<i>.data`, the encrypted
//! blob `<random>.enc`, the `<random>.info` sidecar and the `<random>.jpg`
//! thumbnail. Scratch space lives at `<root>/<temp_dir>/<kind>_<session>/`.

use crate::error::{StorageError, StorageResult};
use crate::placer::DiskSpec;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Path builder bound to one disk.
#[derive(Clone, Debug)]
pub struct BlobLayout {
    root: PathBuf,
    data_dir: String,
    temp_dir: String,
}

/// Every path a stored blob may occupy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobPaths {
    pub dir: PathBuf,
    pub stem: String,
    pub blob: PathBuf,
    pub encrypted: PathBuf,
    pub info: PathBuf,
    pub thumbnail: PathBuf,
}

impl BlobPaths {
    /// Path of chunk `index`.
    pub fn chunk(&self, index: u32) -> PathBuf {
        self.dir.join(format!("{}_{index}.data", self.stem))
    }
}

impl BlobLayout {
    pub fn new(disk: &DiskSpec, temp_dir: &str) -> StorageResult<Self> {
        check_relative(&disk.data_dir)?;
        check_relative(temp_dir)?;
        Ok(Self {
            root: disk.root.clone(),
            data_dir: disk.data_dir.clone(),
            temp_dir: temp_dir.to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reserve fresh paths for a new blob. Nothing is created on disk.
    pub fn allocate(&self) -> StorageResult<BlobPaths> {
        let basename = Uuid::new_v4().simple().to_string();
        let stem = stowage_core::token::random_hex(16);
        self.paths_for(&basename, &stem)
    }

    /// Paths for a known `basename`/`stem` pair.
    pub fn paths_for(&self, basename: &str, stem: &str) -> StorageResult<BlobPaths> {
        check_segment(basename)?;
        check_segment(stem)?;
        let dir = self.root.join(&self.data_dir).join(basename);
        Ok(BlobPaths {
            blob: dir.join(format!("{stem}.data")),
            encrypted: dir.join(format!("{stem}.enc")),
            info: dir.join(format!("{stem}.info")),
            thumbnail: dir.join(format!("{stem}.jpg")),
            stem: stem.to_string(),
            dir,
        })
    }

    /// Scratch directory for one session, e.g. `upload_<task id>`.
    pub fn temp_area(&self, kind: &str, session: &str) -> StorageResult<PathBuf> {
        let name = format!("{kind}_{session}");
        check_segment(&name)?;
        Ok(self.root.join(&self.temp_dir).join(name))
    }

    /// Resolve a path relative to the disk root, refusing anything that escapes it.
    pub async fn resolve(&self, relative: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let relative = relative.to_string();
        tokio::task::spawn_blocking(move || resolve_sync(&root, &relative))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }

    /// Verify that an absolute path recorded in metadata lies under this disk.
    pub async fn check_contains(&self, path: &Path) -> StorageResult<()> {
        let relative = path
            .strip_prefix(&self.root)
            .map_err(|_| {
                StorageError::InvalidPath(format!(
                    "{} is outside disk {}",
                    path.display(),
                    self.root.display()
                ))
            })?
            .to_string_lossy()
            .to_string();
        self.resolve(&relative).await.map(|_| ())
    }
}

fn check_segment(segment: &str) -> StorageResult<()> {
    let mut components = Path::new(segment).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !segment.contains('\\') => Ok(()),
        _ => Err(StorageError::InvalidPath(format!(
            "not a plain path segment: {segment:?}"
        ))),
    }
}

fn check_relative(dir: &str) -> StorageResult<()> {
    let plain = !dir.is_empty()
        && !dir.contains('\\')
        && Path::new(dir)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if plain {
        Ok(())
    } else {
        Err(StorageError::InvalidPath(format!(
            "not a plain relative directory: {dir:?}"
        )))
    }
}

/// Join `relative` onto `root`, rejecting traversal and symlinks that lead outside.
fn resolve_sync(root: &Path, relative: &str) -> StorageResult<PathBuf> {
    if relative.contains("..") || relative.starts_with('/') || relative.starts_with('\\') {
        return Err(StorageError::InvalidPath(format!(
            "path traversal not allowed: {relative}"
        )));
    }
    for component in Path::new(relative).components() {
        if !matches!(component, Component::Normal(_)) {
            return Err(StorageError::InvalidPath(format!(
                "contains unsafe path component: {relative}"
            )));
        }
    }

    let path = root.join(relative);
    let root_canonical = root.canonicalize().map_err(|e| {
        StorageError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to canonicalize root: {e}"),
        ))
    })?;

    // Check the path itself if present, else its nearest existing ancestor.
    let mut probe = path.as_path();
    loop {
        match std::fs::symlink_metadata(probe) {
            Ok(meta) => {
                let canonical = probe.canonicalize().map_err(|e| {
                    if meta.file_type().is_symlink() {
                        StorageError::InvalidPath(format!(
                            "symlink target missing or invalid: {relative}"
                        ))
                    } else {
                        StorageError::Io(e)
                    }
                })?;
                if !canonical.starts_with(&root_canonical) {
                    return Err(StorageError::InvalidPath(format!(
                        "resolved path escapes disk root: {relative}"
                    )));
                }
                return Ok(path);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(StorageError::Io(err)),
        }
        match probe.parent() {
            Some(parent) if parent.starts_with(root) => probe = parent,
            _ => return Ok(path),
        }
    }
}

/// Temp sibling used while writing `path`.
pub fn temp_sibling(path: &Path) -> PathBuf {
    let suffix = format!(".tmp.{}", Uuid::new_v4());
    path.with_file_name(
        path.file_name()
            .map(|n| format!("{}{suffix}", n.to_string_lossy()))
            .unwrap_or(suffix),
    )
}

/// Write `data` to `path` through a temp sibling and a rename.
pub async fn write_atomic(path: &Path, data: &[u8]) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let temp = temp_sibling(path);
    let result = async {
        let mut file = fs::File::create(&temp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        fs::rename(&temp, path).await
    }
    .await;
    if result.is_err() {
        let _ = fs::remove_file(&temp).await;
    }
    Ok(result?)
}

/// Move a staged file to its final location.
///
/// Renames when source and destination share a filesystem, otherwise copies
/// through a temp sibling and removes the source.
pub async fn install(source: &Path, dest: &Path) -> StorageResult<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    match fs::rename(source, dest).await {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StorageError::NotFound(source.display().to_string()));
        }
        Err(e) => {
            tracing::debug!(source = %source.display(), error = %e, "rename failed, copying instead");
        }
    }

    let temp = temp_sibling(dest);
    let copied = async {
        fs::copy(source, &temp).await?;
        fs::File::open(&temp).await?.sync_all().await?;
        fs::rename(&temp, dest).await
    }
    .await;
    if let Err(e) = copied {
        let _ = fs::remove_file(&temp).await;
        return Err(e.into());
    }
    fs::remove_file(source).await?;
    Ok(())
}

/// Outcome of a best-effort artifact removal.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemovalReport {
    pub removed: usize,
    pub missing: usize,
    pub failed: Vec<PathBuf>,
}

impl RemovalReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Remove each file, tolerating ones already gone. Empty parent directories are pruned.
pub async fn remove_artifacts<I, P>(paths: I) -> RemovalReport
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut report = RemovalReport::default();
    let mut parents = Vec::new();
    for path in paths {
        let path = path.as_ref();
        match fs::remove_file(path).await {
            Ok(()) => report.removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => report.missing += 1,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove blob artifact");
                report.failed.push(path.to_path_buf());
            }
        }
        if let Some(parent) = path.parent()
            && !parents.iter().any(|p: &PathBuf| p == parent)
        {
            parents.push(parent.to_path_buf());
        }
    }
    for parent in parents {
        // Only succeeds once the directory is empty.
        let _ = fs::remove_dir(&parent).await;
    }
    report
}

/// Remove a scratch tree. Missing trees are fine.
pub async fn remove_tree(path: &Path) -> StorageResult<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(root: &Path) -> BlobLayout {
        let disk = DiskSpec {
            id: Uuid::new_v4(),
            root: root.to_path_buf(),
            data_dir: "data".to_string(),
            size: 1 << 30,
        };
        BlobLayout::new(&disk, "temp").unwrap()
    }

    #[test]
    fn paths_share_a_stem() {
        let l = layout(Path::new("/mnt/d0"));
        let p = l.paths_for("abc", "f00d").unwrap();
        assert_eq!(p.blob, PathBuf::from("/mnt/d0/data/abc/f00d.data"));
        assert_eq!(p.chunk(2), PathBuf::from("/mnt/d0/data/abc/f00d_2.data"));
        assert_eq!(p.info, PathBuf::from("/mnt/d0/data/abc/f00d.info"));
        assert_eq!(p.thumbnail, PathBuf::from("/mnt/d0/data/abc/f00d.jpg"));
        assert_eq!(
            l.temp_area("upload", "t1").unwrap(),
            PathBuf::from("/mnt/d0/temp/upload_t1")
        );
    }

    #[test]
    fn rejects_unsafe_segments() {
        let l = layout(Path::new("/mnt/d0"));
        assert!(l.paths_for("..", "x").is_err());
        assert!(l.paths_for("a/b", "x").is_err());
        assert!(l.temp_area("upload", "../../etc").is_err());
        let disk = DiskSpec {
            id: Uuid::new_v4(),
            root: PathBuf::from("/mnt/d0"),
            data_dir: "/abs".to_string(),
            size: 1,
        };
        assert!(BlobLayout::new(&disk, "temp").is_err());
    }

    #[tokio::test]
    async fn resolve_refuses_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let l = layout(dir.path());
        assert!(l.resolve("data/abc/x.data").await.is_ok());
        assert!(l.resolve("../x").await.is_err());
        assert!(l.resolve("/etc/passwd").await.is_err());
        assert!(l.check_contains(Path::new("/etc/passwd")).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_refuses_symlink_escape() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("data")).unwrap();
        let l = layout(dir.path());
        assert!(l.resolve("data/abc/x.data").await.is_err());
    }

    #[tokio::test]
    async fn atomic_write_and_install() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b/blob.data");
        write_atomic(&target, b"hello").await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"hello");

        let staged = dir.path().join("staged");
        std::fs::write(&staged, b"moved").unwrap();
        let dest = dir.path().join("c/final.data");
        install(&staged, &dest).await.unwrap();
        assert!(!staged.exists());
        assert_eq!(std::fs::read(&dest).unwrap(), b"moved");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("a/b"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn removal_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let blob_dir = dir.path().join("blob");
        std::fs::create_dir(&blob_dir).unwrap();
        let a = blob_dir.join("a.data");
        std::fs::write(&a, b"x").unwrap();
        let report = remove_artifacts([a.clone(), blob_dir.join("gone.info")]).await;
        assert_eq!(report.removed, 1);
        assert_eq!(report.missing, 1);
        assert!(report.is_clean());
        assert!(!blob_dir.exists());
    }
}
