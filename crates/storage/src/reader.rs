//! Byte-range streams over stored blobs.

use crate::error::{StorageError, StorageResult};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::pin::Pin;
use stowage_core::crypto::{decrypt_range, plaintext_len};
use stowage_core::{BlobKey, ByteRange, RANGE_PIECE_SIZE};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// One chunk file of a chunked blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkSpan {
    pub path: PathBuf,
    pub size: u64,
}

/// Where a blob's plaintext comes from.
#[derive(Clone)]
pub enum BlobSource {
    Single { path: PathBuf },
    /// Chunk files in index order.
    Chunked { chunks: Vec<ChunkSpan> },
    /// Encrypted blob with its already-derived AES key.
    Encrypted { path: PathBuf, key: BlobKey },
}

impl std::fmt::Debug for BlobSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single { path } => f.debug_struct("Single").field("path", path).finish(),
            Self::Chunked { chunks } => f
                .debug_struct("Chunked")
                .field("chunks", &chunks.len())
                .finish(),
            Self::Encrypted { path, .. } => f
                .debug_struct("Encrypted")
                .field("path", path)
                .finish_non_exhaustive(),
        }
    }
}

impl BlobSource {
    /// Plaintext length.
    pub async fn size(&self) -> StorageResult<u64> {
        match self {
            Self::Single { path } => Ok(tokio::fs::metadata(path)
                .await
                .map_err(|e| StorageError::not_found_or_io(e, path.display()))?
                .len()),
            Self::Chunked { chunks } => Ok(chunks.iter().map(|c| c.size).sum()),
            Self::Encrypted { path, .. } => {
                let len = tokio::fs::metadata(path)
                    .await
                    .map_err(|e| StorageError::not_found_or_io(e, path.display()))?
                    .len();
                Ok(plaintext_len(len))
            }
        }
    }

    /// Stream the inclusive `range` in pieces of up to 2 MiB.
    ///
    /// Nothing is opened until the stream is first polled.
    pub fn open_range(self, range: ByteRange) -> ByteStream {
        match self {
            Self::Single { path } => file_range(path, range.start, range.len()),
            Self::Chunked { chunks } => chunked_range(chunks, range),
            Self::Encrypted { path, key } => encrypted_range(path, key, range),
        }
    }
}

fn file_range(path: PathBuf, start: u64, len: u64) -> ByteStream {
    let stream = async_stream::try_stream! {
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| StorageError::not_found_or_io(e, path.display()))?;
        file.seek(SeekFrom::Start(start)).await?;

        let mut remaining = len;
        let mut buf = vec![0u8; RANGE_PIECE_SIZE.min(len.max(1) as usize)];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = file.read(&mut buf[..want]).await?;
            if n == 0 {
                Err::<(), _>(StorageError::InvalidRange(format!(
                    "{} ended {remaining} bytes early",
                    path.display()
                )))?;
            }
            remaining -= n as u64;
            yield Bytes::copy_from_slice(&buf[..n]);
        }
    };
    Box::pin(stream)
}

fn chunked_range(chunks: Vec<ChunkSpan>, range: ByteRange) -> ByteStream {
    let stream = async_stream::try_stream! {
        let mut offset = 0u64;
        for chunk in chunks {
            let chunk_start = offset;
            let chunk_end = offset + chunk.size;
            offset = chunk_end;
            if chunk_end <= range.start {
                continue;
            }
            if chunk_start > range.end {
                break;
            }
            let from = range.start.max(chunk_start) - chunk_start;
            let to = (range.end + 1).min(chunk_end) - chunk_start;
            let mut piece = file_range(chunk.path, from, to - from);
            while let Some(bytes) = piece.next().await {
                yield bytes?;
            }
        }
        if offset <= range.end {
            Err::<(), _>(StorageError::InvalidRange(format!(
                "range end {} beyond chunked size {offset}",
                range.end
            )))?;
        }
    };
    Box::pin(stream)
}

fn encrypted_range(path: PathBuf, key: BlobKey, range: ByteRange) -> ByteStream {
    let stream = async_stream::try_stream! {
        let (mut writer, reader) = tokio::io::duplex(RANGE_PIECE_SIZE);
        let task = tokio::spawn(async move {
            decrypt_range(&mut writer, &path, &key, range.start, range.end).await
        });

        let mut frames = ReaderStream::with_capacity(reader, RANGE_PIECE_SIZE);
        while let Some(frame) = frames.next().await {
            yield frame?;
        }

        // The writer closes on both success and failure; the task says which.
        task.await
            .map_err(|e| StorageError::Io(std::io::Error::other(format!("decrypt task failed: {e}"))))??;
    };
    Box::pin(stream)
}

/// Drain a stream into memory. Test and small-file helper.
pub async fn collect(mut stream: ByteStream) -> StorageResult<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(piece) = stream.next().await {
        out.extend_from_slice(&piece?);
    }
    Ok(out)
}
