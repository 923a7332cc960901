//! BLAKE3 content hashes, the full-file hash engine and the sampled quick signature.

use crate::buffer::HASH_BUFFERS;
use crate::{BUFFERED_READ_LIMIT, MMAP_READ_LIMIT, SAMPLE_BLOCK_SIZE};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// A BLAKE3-256 content hash represented as 32 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Create a new ContentHash from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Compute the BLAKE3 hash of data.
    pub fn compute(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Create an incremental hasher.
    pub fn hasher() -> ContentHasher {
        ContentHasher(blake3::Hasher::new())
    }

    /// Parse from a 64 character hex string.
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        if s.len() != 64 {
            return Err(crate::Error::InvalidHash(format!(
                "expected 64 hex chars, got {}",
                s.len()
            )));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| crate::Error::InvalidHash(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Encode as lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Incremental BLAKE3 hasher.
pub struct ContentHasher(blake3::Hasher);

impl ContentHasher {
    /// Update the hasher with data.
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> ContentHash {
        ContentHash(*self.0.finalize().as_bytes())
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        ContentHash::hasher()
    }
}

/// How a whole file is read for hashing or encryption.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadStrategy {
    /// Read the file into memory in one go.
    Buffered,
    /// Memory-map the file.
    Mmap,
    /// Stream fixed-size pieces.
    Streamed,
}

impl ReadStrategy {
    /// Pick a strategy from the file size and the currently available RAM.
    pub fn select(size: u64, available_ram: u64) -> Self {
        if size < BUFFERED_READ_LIMIT {
            Self::Buffered
        } else if size <= MMAP_READ_LIMIT && (size as f64) <= 0.4 * available_ram as f64 {
            Self::Mmap
        } else {
            Self::Streamed
        }
    }

    /// Pick a strategy for `path` using live memory figures.
    pub fn for_path(path: &Path) -> crate::Result<Self> {
        let size = std::fs::metadata(path)?.len();
        Ok(Self::select(size, available_memory()))
    }
}

/// Bytes of RAM currently available to new allocations.
pub fn available_memory() -> u64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    sys.available_memory()
}

/// Compute the full BLAKE3 hash of a file, choosing the read strategy by size.
///
/// This is blocking; async callers should run it on the blocking pool.
pub fn full_hash(path: &Path) -> crate::Result<ContentHash> {
    let strategy = ReadStrategy::for_path(path)?;
    full_hash_with(path, strategy)
}

/// Compute the full BLAKE3 hash of a file using an explicit strategy.
pub fn full_hash_with(path: &Path, strategy: ReadStrategy) -> crate::Result<ContentHash> {
    tracing::debug!(path = %path.display(), ?strategy, "hashing file");
    match strategy {
        ReadStrategy::Buffered => {
            let data = std::fs::read(path)?;
            Ok(ContentHash::compute(&data))
        }
        ReadStrategy::Mmap => {
            let file = File::open(path)?;
            // SAFETY: the file is opened read-only and blobs are never modified in place
            // (writes go through temp file + rename).
            let mmap = unsafe { memmap2::Mmap::map(&file)? };
            Ok(ContentHash::compute(&mmap))
        }
        ReadStrategy::Streamed => {
            let mut file = File::open(path)?;
            hash_reader(&mut file)
        }
    }
}

/// Hash everything a reader yields using a pooled 256 KiB buffer.
pub fn hash_reader(reader: &mut impl Read) -> crate::Result<ContentHash> {
    let mut hasher = ContentHash::hasher();
    let mut buf = HASH_BUFFERS.get();
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// Sampled quick signature used as a dedup probe.
///
/// The signature is BLAKE3 over the concatenated lowercase hex of the sampled
/// block hashes, so it can be recomputed from the stored per-block hashes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickSignature {
    /// Hashes of the first sampled 4 MiB blocks, in order.
    pub sampled: Vec<ContentHash>,
    /// Digest over the sampled hashes.
    pub signature: ContentHash,
}

impl QuickSignature {
    /// Derive the signature from sampled block hashes.
    pub fn derive(sampled: Vec<ContentHash>) -> Self {
        let mut hasher = ContentHash::hasher();
        for hash in &sampled {
            hasher.update(hash.to_hex().as_bytes());
        }
        Self {
            signature: hasher.finalize(),
            sampled,
        }
    }

    /// Rebuild from stored hex fields where an empty string marks an absent sample.
    pub fn from_stored(parts: &[&str]) -> crate::Result<Self> {
        let mut sampled = Vec::with_capacity(parts.len());
        let mut ended = false;
        for part in parts {
            if part.is_empty() {
                ended = true;
                continue;
            }
            if ended {
                return Err(crate::Error::InvalidHash(
                    "sampled hashes must be contiguous".to_string(),
                ));
            }
            sampled.push(ContentHash::from_hex(part)?);
        }
        Ok(Self::derive(sampled))
    }

    /// Sampled hashes as hex, padded with empty strings up to `slots`.
    pub fn sampled_hex(&self, slots: usize) -> Vec<String> {
        let mut out: Vec<String> = self.sampled.iter().map(ContentHash::to_hex).collect();
        out.resize(slots.max(out.len()), String::new());
        out
    }

    /// Whether another signature sampled the same blocks with the same content.
    pub fn samples_agree(&self, other: &QuickSignature) -> bool {
        self.sampled == other.sampled
    }
}

/// Compute the quick signature over the first `k` 4 MiB blocks of a file.
pub fn quick_hash(path: &Path, k: usize) -> crate::Result<QuickSignature> {
    let file = File::open(path)?;
    quick_hash_reader(file, k)
}

/// Compute the quick signature over the first `k` 4 MiB blocks of a reader.
pub fn quick_hash_reader(mut reader: impl Read, k: usize) -> crate::Result<QuickSignature> {
    let mut sampled = Vec::with_capacity(k);
    let mut block = Vec::with_capacity(SAMPLE_BLOCK_SIZE as usize);
    for _ in 0..k {
        block.clear();
        (&mut reader).take(SAMPLE_BLOCK_SIZE).read_to_end(&mut block)?;
        if block.is_empty() {
            break;
        }
        sampled.push(ContentHash::compute(&block));
    }
    Ok(QuickSignature::derive(sampled))
}
