//! Core domain types and shared logic for the stowage storage core.
//!
//! This crate defines the pieces every other crate builds on:
//! - BLAKE3 content hashes and the sampled quick signature used for dedup
//! - At-rest blob encryption (PBKDF2 + AES-256-CTR + HMAC-SHA256)
//! - HTTP byte ranges
//! - Upload task and offline download lifecycles
//! - Filename sanitation and permission characteristics
//! - Configuration shared by the daemon and its services

pub mod buffer;
pub mod config;
pub mod crypto;
pub mod download;
pub mod error;
pub mod filename;
pub mod hash;
pub mod permission;
pub mod range;
pub mod token;
pub mod upload;

pub use crypto::{BlobHeader, BlobKey, UserSecret};
pub use download::{DownloadAction, DownloadKind, DownloadSource, DownloadState, DownloadTaskId};
pub use error::{Error, Result};
pub use hash::{ContentHash, ContentHasher, QuickSignature, ReadStrategy};
pub use permission::Permission;
pub use range::ByteRange;
pub use upload::{UploadStatus, UploadTaskId};

/// Size of one sampled block for the quick signature: 4 MiB.
pub const SAMPLE_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

/// Number of sampled blocks recorded per file.
pub const SAMPLE_COUNT: usize = 3;

/// Read buffer used when hashing in streamed mode: 256 KiB.
pub const HASH_BUFFER_SIZE: usize = 256 * 1024;

/// Read buffer used by whole-file encrypt/decrypt: 1 MiB.
pub const CRYPTO_BUFFER_SIZE: usize = 1024 * 1024;

/// Piece size for range reads and range decrypts: 2 MiB.
pub const RANGE_PIECE_SIZE: usize = 2 * 1024 * 1024;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Files below this size are read fully into memory.
pub const BUFFERED_READ_LIMIT: u64 = 500 * MIB;

/// Files up to this size may be memory-mapped.
pub const MMAP_READ_LIMIT: u64 = 2 * GIB;

/// Convert a GiB figure from configuration into bytes.
pub fn gib(n: f64) -> u64 {
    (n * GIB as f64) as u64
}
