//! Splitting large blobs into chunk files and merging upload parts.

use crate::error::{StorageError, StorageResult};
use crate::layout::{BlobPaths, temp_sibling};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use stowage_core::ContentHash;
use stowage_core::buffer::HASH_BUFFERS;
use tokio::io::AsyncWriteExt;

/// One written chunk file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkFile {
    pub index: u32,
    pub path: PathBuf,
    pub size: u64,
    pub hash: ContentHash,
}

/// Stream `source` into `chunk_size`-byte chunk files next to `paths.blob`.
///
/// Blocking; run it on the blocking pool. On error every chunk written so far
/// is removed.
pub fn split_into_chunks(
    source: &Path,
    paths: &BlobPaths,
    chunk_size: u64,
) -> StorageResult<Vec<ChunkFile>> {
    if chunk_size == 0 {
        return Err(StorageError::Config("chunk size must be positive".to_string()));
    }
    std::fs::create_dir_all(&paths.dir)?;

    let mut written: Vec<ChunkFile> = Vec::new();
    let result = split_inner(source, paths, chunk_size, &mut written);
    if result.is_err() {
        for chunk in &written {
            let _ = std::fs::remove_file(&chunk.path);
        }
    }
    result.map(|()| written)
}

fn split_inner(
    source: &Path,
    paths: &BlobPaths,
    chunk_size: u64,
    written: &mut Vec<ChunkFile>,
) -> StorageResult<()> {
    let mut input = File::open(source)
        .map_err(|e| StorageError::not_found_or_io(e, source.display()))?;
    let mut buf = HASH_BUFFERS.get();
    let mut index = 0u32;

    loop {
        let path = paths.chunk(index);
        let temp = temp_sibling(&path);
        let mut out = BufWriter::new(File::create(&temp)?);
        let mut hasher = ContentHash::hasher();
        let mut size = 0u64;

        while size < chunk_size {
            let want = (chunk_size - size).min(buf.len() as u64) as usize;
            let n = input.read(&mut buf[..want])?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
            hasher.update(&buf[..n]);
            size += n as u64;
        }

        if size == 0 {
            drop(out);
            std::fs::remove_file(&temp)?;
            break;
        }

        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        std::fs::rename(&temp, &path)?;
        written.push(ChunkFile {
            index,
            path,
            size,
            hash: hasher.finalize(),
        });

        if size < chunk_size {
            break;
        }
        index += 1;
    }

    tracing::debug!(
        source = %source.display(),
        chunks = written.len(),
        "split blob into chunks"
    );
    Ok(())
}

/// Concatenate `parts` in order into `dest`. Returns the merged length.
pub async fn merge_parts(parts: &[PathBuf], dest: &Path) -> StorageResult<u64> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp = temp_sibling(dest);
    let result = async {
        let mut out = tokio::fs::File::create(&temp).await?;
        let mut total = 0u64;
        for part in parts {
            let mut input = tokio::fs::File::open(part)
                .await
                .map_err(|e| StorageError::not_found_or_io(e, part.display()))?;
            total += tokio::io::copy(&mut input, &mut out).await?;
        }
        out.flush().await?;
        out.sync_all().await?;
        tokio::fs::rename(&temp, dest).await?;
        Ok::<_, StorageError>(total)
    }
    .await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(&temp).await;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::BlobLayout;
    use crate::placer::DiskSpec;
    use uuid::Uuid;

    fn paths(root: &Path) -> BlobPaths {
        let disk = DiskSpec {
            id: Uuid::new_v4(),
            root: root.to_path_buf(),
            data_dir: "data".to_string(),
            size: 1 << 30,
        };
        BlobLayout::new(&disk, "temp").unwrap().allocate().unwrap()
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn chunks_cover_the_source_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        let bytes = data(2500);
        std::fs::write(&source, &bytes).unwrap();
        let paths = paths(dir.path());

        let chunks = split_into_chunks(&source, &paths, 1000).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(
            chunks.iter().map(|c| c.size).collect::<Vec<_>>(),
            vec![1000, 1000, 500]
        );
        let mut rebuilt = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i as u32);
            let body = std::fs::read(&chunk.path).unwrap();
            assert_eq!(chunk.hash, ContentHash::compute(&body));
            rebuilt.extend(body);
        }
        assert_eq!(rebuilt, bytes);
    }

    #[test]
    fn exact_multiple_has_no_empty_tail() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        std::fs::write(&source, data(2000)).unwrap();
        let paths = paths(dir.path());
        let chunks = split_into_chunks(&source, &paths, 1000).unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(!paths.chunk(2).exists());
    }

    #[test]
    fn missing_source_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths(dir.path());
        assert!(matches!(
            split_into_chunks(&dir.path().join("nope"), &paths, 10),
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn merge_concatenates_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let parts: Vec<PathBuf> = (0..3)
            .map(|i| {
                let p = dir.path().join(format!("{i}.chunk.data"));
                std::fs::write(&p, format!("part{i};")).unwrap();
                p
            })
            .collect();
        let dest = dir.path().join("merged/out");
        let len = merge_parts(&parts, &dest).await.unwrap();
        assert_eq!(len, 18);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "part0;part1;part2;");

        let missing = vec![dir.path().join("gone")];
        assert!(merge_parts(&missing, &dir.path().join("x")).await.is_err());
    }
}
