//! At-rest blob encryption.
//!
//! Encrypted blobs carry a fixed header followed by the ciphertext:
//!
//! ```text
//! | salt (32B) | iv (16B) | hmac (32B) | ciphertext ... |
//! ```
//!
//! The cipher is AES-256-CTR with the IV as the initial 128-bit big-endian
//! counter block. The MAC is HMAC-SHA256 over the ciphertext only. Keys are
//! derived from a caller secret with PBKDF2-HMAC-SHA256; the MAC key uses the
//! salt with its first byte flipped.
//!
//! Full decrypts verify the MAC before emitting plaintext. Range decrypts do
//! not verify the MAC; they trade integrity for seekability.

use crate::buffer::CRYPTO_BUFFERS;
use crate::hash::ReadStrategy;
use crate::{Error, RANGE_PIECE_SIZE, Result};
use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroizing;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Salt length in bytes.
pub const SALT_LEN: usize = 32;
/// IV length in bytes (one AES block).
pub const IV_LEN: usize = 16;
/// HMAC-SHA256 tag length in bytes.
pub const MAC_LEN: usize = 32;
/// Total header length preceding the ciphertext.
pub const HEADER_LEN: usize = SALT_LEN + IV_LEN + MAC_LEN;
/// AES block size.
pub const BLOCK_LEN: u64 = 16;

/// PBKDF2 rounds for blob keys.
pub const BLOB_KEY_ROUNDS: u32 = 100_000;
/// PBKDF2 rounds for the per-user secret.
pub const USER_KEY_ROUNDS: u32 = 10_000;

/// A 256-bit key that is wiped on drop.
#[derive(Clone)]
pub struct SecretKey(Zeroizing<[u8; 32]>);

impl SecretKey {
    fn derive(password: &[u8], salt: &[u8], rounds: u32) -> Self {
        let mut out = Zeroizing::new([0u8; 32]);
        pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, rounds, out.as_mut());
        Self(out)
    }

    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

/// Per-user secret used as the password for blob key derivation.
pub type UserSecret = SecretKey;

/// AES key of one encrypted blob, cached by play tokens for range reads.
pub type BlobKey = SecretKey;

/// Derive the per-user secret: `PBKDF2-SHA256(passphrase, user_salt, 10_000, 32)`.
pub fn derive_user_key(passphrase: &str, user_salt: &[u8]) -> UserSecret {
    SecretKey::derive(passphrase.as_bytes(), user_salt, USER_KEY_ROUNDS)
}

/// Encryption and authentication keys of one blob.
pub struct BlobKeys {
    /// AES-256 key.
    pub enc: BlobKey,
    /// HMAC-SHA256 key.
    pub mac: SecretKey,
}

/// Derive both blob keys from a secret and the blob salt.
pub fn derive_blob_keys(secret: &[u8], salt: &[u8; SALT_LEN]) -> BlobKeys {
    let mut mac_salt = *salt;
    mac_salt[0] ^= 0xFF;
    BlobKeys {
        enc: SecretKey::derive(secret, salt, BLOB_KEY_ROUNDS),
        mac: SecretKey::derive(secret, &mac_salt, BLOB_KEY_ROUNDS),
    }
}

/// Fixed-size header at the start of every encrypted blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobHeader {
    pub salt: [u8; SALT_LEN],
    pub iv: [u8; IV_LEN],
    pub mac: [u8; MAC_LEN],
}

impl BlobHeader {
    /// Generate a header with a random salt and IV and an empty MAC slot.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut iv);
        Self {
            salt,
            iv,
            mac: [0u8; MAC_LEN],
        }
    }

    /// Serialize to the on-disk layout.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..SALT_LEN].copy_from_slice(&self.salt);
        out[SALT_LEN..SALT_LEN + IV_LEN].copy_from_slice(&self.iv);
        out[SALT_LEN + IV_LEN..].copy_from_slice(&self.mac);
        out
    }

    /// Parse the on-disk layout.
    pub fn from_bytes(bytes: &[u8; HEADER_LEN]) -> Self {
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        let mut mac = [0u8; MAC_LEN];
        salt.copy_from_slice(&bytes[..SALT_LEN]);
        iv.copy_from_slice(&bytes[SALT_LEN..SALT_LEN + IV_LEN]);
        mac.copy_from_slice(&bytes[SALT_LEN + IV_LEN..]);
        Self { salt, iv, mac }
    }

    /// Read the header from the start of a blob.
    pub fn read_from(reader: &mut impl Read) -> Result<Self> {
        let mut bytes = [0u8; HEADER_LEN];
        reader.read_exact(&mut bytes).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::MalformedBlob("blob shorter than header".to_string())
            } else {
                Error::Io(e)
            }
        })?;
        Ok(Self::from_bytes(&bytes))
    }
}

/// Add a block offset to a 128-bit big-endian IV, wrapping on overflow.
pub fn adjusted_iv(iv: &[u8; IV_LEN], block_offset: u64) -> [u8; IV_LEN] {
    u128::from_be_bytes(*iv)
        .wrapping_add(u128::from(block_offset))
        .to_be_bytes()
}

/// Plaintext length of an encrypted blob of `encrypted_len` bytes.
pub fn plaintext_len(encrypted_len: u64) -> u64 {
    encrypted_len.saturating_sub(HEADER_LEN as u64)
}

/// Read the header of the blob at `path` and derive its AES key from `secret`.
pub fn open_blob_key(secret: &[u8], path: &Path) -> Result<BlobKey> {
    let mut file = File::open(path)?;
    let header = BlobHeader::read_from(&mut file)?;
    Ok(derive_blob_keys(secret, &header.salt).enc)
}

/// Encrypt `input` into `output` under `secret`. Returns the encrypted length.
///
/// The header is written with a zeroed MAC slot, ciphertext is streamed while
/// the MAC is computed, then the slot is back-filled.
pub fn encrypt_file(input: &Path, output: &Path, secret: &[u8]) -> Result<u64> {
    let strategy = ReadStrategy::for_path(input)?;
    encrypt_file_with(input, output, secret, strategy)
}

/// Encrypt with an explicit read strategy for the input.
pub fn encrypt_file_with(
    input: &Path,
    output: &Path,
    secret: &[u8],
    strategy: ReadStrategy,
) -> Result<u64> {
    let mut header = BlobHeader::generate();
    let keys = derive_blob_keys(secret, &header.salt);
    let mut cipher = Aes256Ctr::new(keys.enc.as_bytes().into(), (&header.iv).into());
    let mut mac = <HmacSha256 as Mac>::new_from_slice(keys.mac.as_bytes())
        .map_err(|e| Error::MalformedBlob(e.to_string()))?;

    let result = (|| -> Result<u64> {
        let mut out = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(output)?;
        out.write_all(&header.to_bytes())?;

        let mut written = HEADER_LEN as u64;
        let mut emit = |piece: &mut [u8], out: &mut File| -> Result<()> {
            cipher.apply_keystream(piece);
            mac.update(piece);
            out.write_all(piece)?;
            written += piece.len() as u64;
            Ok(())
        };

        match strategy {
            ReadStrategy::Buffered => {
                let mut data = std::fs::read(input)?;
                for piece in data.chunks_mut(crate::CRYPTO_BUFFER_SIZE) {
                    emit(piece, &mut out)?;
                }
            }
            ReadStrategy::Mmap => {
                let file = File::open(input)?;
                // SAFETY: read-only mapping of a staged file nobody else writes.
                let mmap = unsafe { memmap2::Mmap::map(&file)? };
                let mut buf = CRYPTO_BUFFERS.get();
                for piece in mmap.chunks(buf.len()) {
                    let slot = &mut buf[..piece.len()];
                    slot.copy_from_slice(piece);
                    emit(slot, &mut out)?;
                }
            }
            ReadStrategy::Streamed => {
                let mut file = File::open(input)?;
                let mut buf = CRYPTO_BUFFERS.get();
                loop {
                    let n = file.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    emit(&mut buf[..n], &mut out)?;
                }
            }
        }

        header.mac.copy_from_slice(&mac.clone().finalize().into_bytes());
        out.seek(SeekFrom::Start((SALT_LEN + IV_LEN) as u64))?;
        out.write_all(&header.mac)?;
        out.sync_all()?;
        Ok(written)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(output);
    }
    result
}

/// Decrypt `input` into `output`, verifying the MAC before any plaintext is written.
///
/// On failure the output file is removed.
pub fn decrypt_file(input: &Path, output: &Path, secret: &[u8]) -> Result<u64> {
    let result = decrypt_file_inner(input, output, secret);
    if result.is_err() {
        let _ = std::fs::remove_file(output);
    }
    result
}

fn decrypt_file_inner(input: &Path, output: &Path, secret: &[u8]) -> Result<u64> {
    let mut file = File::open(input)?;
    let header = BlobHeader::read_from(&mut file)?;
    let keys = derive_blob_keys(secret, &header.salt);
    let mut buf = CRYPTO_BUFFERS.get();

    let mut mac = <HmacSha256 as Mac>::new_from_slice(keys.mac.as_bytes())
        .map_err(|e| Error::MalformedBlob(e.to_string()))?;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        mac.update(&buf[..n]);
    }
    mac.verify_slice(&header.mac)
        .map_err(|_| Error::MacMismatch)?;

    file.seek(SeekFrom::Start(HEADER_LEN as u64))?;
    let mut cipher = Aes256Ctr::new(keys.enc.as_bytes().into(), (&header.iv).into());
    let mut out = File::create(output)?;
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        out.write_all(&buf[..n])?;
        total += n as u64;
    }
    out.sync_all()?;
    Ok(total)
}

/// Decrypt the plaintext window `[start, end]` (inclusive) of the blob at `path`.
///
/// The caller supplies the blob's AES key so no key derivation happens here.
/// Exactly `end - start + 1` bytes are written, in pieces of up to 2 MiB.
/// The MAC is not checked.
pub async fn decrypt_range<W>(
    writer: &mut W,
    path: &Path,
    key: &BlobKey,
    start: u64,
    end: u64,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    if start > end {
        return Err(Error::InvalidRange(format!("start {start} > end {end}")));
    }
    let mut file = tokio::fs::File::open(path).await?;
    let encrypted_len = file.metadata().await?.len();
    let plain_len = plaintext_len(encrypted_len);
    if end >= plain_len {
        return Err(Error::InvalidRange(format!(
            "end {end} beyond plaintext length {plain_len}"
        )));
    }

    let mut header_bytes = [0u8; HEADER_LEN];
    file.read_exact(&mut header_bytes).await?;
    let header = BlobHeader::from_bytes(&header_bytes);

    let block_offset = start / BLOCK_LEN;
    let byte_offset = (start % BLOCK_LEN) as usize;
    let iv = adjusted_iv(&header.iv, block_offset);
    let mut cipher = Aes256Ctr::new(key.as_bytes().into(), (&iv).into());

    file.seek(SeekFrom::Start(
        HEADER_LEN as u64 + block_offset * BLOCK_LEN,
    ))
    .await?;

    let wanted = end - start + 1;
    decrypt_window(&mut file, &mut cipher, byte_offset, wanted, writer).await?;
    Ok(wanted)
}

/// Decrypt `skip + wanted` bytes from `reader`, which sits on a block boundary,
/// and write all but the first `skip` of them. Short reads are fine.
async fn decrypt_window<R, W>(
    reader: &mut R,
    cipher: &mut Aes256Ctr,
    skip: usize,
    wanted: u64,
    writer: &mut W,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = wanted + skip as u64;
    let mut skip = skip;
    let mut buf = vec![0u8; RANGE_PIECE_SIZE];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(Error::MalformedBlob("unexpected end of ciphertext".to_string()));
        }
        // The keystream must advance over skipped bytes too.
        cipher.apply_keystream(&mut buf[..n]);
        let from = skip.min(n);
        writer.write_all(&buf[from..n]).await?;
        skip -= from;
        remaining -= n as u64;
    }
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn plaintext(len: usize) -> Vec<u8> {
        let mut state = 0x2545F4914F6CDD1Du64;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect()
    }

    fn write_input(dir: &Path, data: &[u8]) -> std::path::PathBuf {
        let path = dir.join("plain.bin");
        let mut f = File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    #[test]
    fn header_roundtrip() {
        let header = BlobHeader::generate();
        assert_eq!(BlobHeader::from_bytes(&header.to_bytes()), header);
    }

    #[test]
    fn adjusted_iv_adds_big_endian_and_wraps() {
        let mut iv = [0u8; IV_LEN];
        iv[15] = 0xFF;
        let out = adjusted_iv(&iv, 1);
        assert_eq!(out[14], 1);
        assert_eq!(out[15], 0);

        let max = [0xFFu8; IV_LEN];
        assert_eq!(adjusted_iv(&max, 1), [0u8; IV_LEN]);
    }

    #[test]
    fn mac_key_uses_flipped_salt() {
        let salt = [7u8; SALT_LEN];
        let keys = derive_blob_keys(b"pw", &salt);
        assert_ne!(keys.enc.as_bytes(), keys.mac.as_bytes());
    }

    #[test]
    fn encrypt_then_decrypt_roundtrip_for_each_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let data = plaintext(3 * 1024 * 1024 + 123);
        let input = write_input(dir.path(), &data);

        for strategy in [
            ReadStrategy::Buffered,
            ReadStrategy::Mmap,
            ReadStrategy::Streamed,
        ] {
            let enc = dir.path().join("blob.data");
            let dec = dir.path().join("out.bin");
            let written = encrypt_file_with(&input, &enc, b"p@ss", strategy).unwrap();
            assert_eq!(written, data.len() as u64 + HEADER_LEN as u64);
            assert_eq!(std::fs::metadata(&enc).unwrap().len(), written);

            let n = decrypt_file(&enc, &dec, b"p@ss").unwrap();
            assert_eq!(n, data.len() as u64);
            assert_eq!(std::fs::read(&dec).unwrap(), data);
        }
    }

    #[test]
    fn wrong_password_is_mac_mismatch_and_removes_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(dir.path(), &plaintext(4096));
        let enc = dir.path().join("blob.data");
        let dec = dir.path().join("out.bin");
        encrypt_file(&input, &enc, b"right").unwrap();

        let err = decrypt_file(&enc, &dec, b"wrong").unwrap_err();
        assert!(err.is_mac_mismatch());
        assert!(!dec.exists());
    }

    #[test]
    fn tampered_ciphertext_fails_full_decrypt() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(dir.path(), &plaintext(10_000));
        let enc = dir.path().join("blob.data");
        encrypt_file(&input, &enc, b"pw").unwrap();

        let mut bytes = std::fs::read(&enc).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 1;
        std::fs::write(&enc, bytes).unwrap();

        let err = decrypt_file(&enc, &dir.path().join("out"), b"pw").unwrap_err();
        assert!(err.is_mac_mismatch());
    }

    #[test]
    fn truncated_blob_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let enc = dir.path().join("short.data");
        std::fs::write(&enc, [0u8; 10]).unwrap();
        let err = decrypt_file(&enc, &dir.path().join("out"), b"pw").unwrap_err();
        assert!(matches!(err, Error::MalformedBlob(_)));
    }

    #[tokio::test]
    async fn range_decrypt_matches_plaintext_slices() {
        let dir = tempfile::tempdir().unwrap();
        let data = plaintext(5 * 1024 * 1024 + 77);
        let input = write_input(dir.path(), &data);
        let enc = dir.path().join("blob.data");
        encrypt_file(&input, &enc, b"p@ss").unwrap();
        let key = open_blob_key(b"p@ss", &enc).unwrap();

        let last = data.len() as u64 - 1;
        let cases = [
            (0, 0),
            (0, 15),
            (1, 16),
            (17, 4095),
            (2 * 1024 * 1024 - 3, 2 * 1024 * 1024 + 700),
            (last - 10, last),
            (0, last),
        ];
        for (start, end) in cases {
            let mut out = Vec::new();
            let n = decrypt_range(&mut out, &enc, &key, start, end).await.unwrap();
            assert_eq!(n, end - start + 1);
            assert_eq!(out, &data[start as usize..=end as usize], "range {start}-{end}");
        }
    }

    /// Hands out at most one byte per read.
    struct Trickle<'a>(&'a [u8]);

    impl tokio::io::AsyncRead for Trickle<'_> {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            if let Some((&first, rest)) = self.0.split_first() {
                buf.put_slice(&[first]);
                self.0 = rest;
            }
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn range_window_survives_short_reads() {
        let dir = tempfile::tempdir().unwrap();
        let data = plaintext(200);
        let input = write_input(dir.path(), &data);
        let enc = dir.path().join("blob.data");
        encrypt_file(&input, &enc, b"pw").unwrap();
        let key = open_blob_key(b"pw", &enc).unwrap();
        let bytes = std::fs::read(&enc).unwrap();
        let header = BlobHeader::from_bytes(bytes[..HEADER_LEN].try_into().unwrap());

        // Bytes 37..=90 sit five bytes into block 2.
        let (start, end) = (37u64, 90u64);
        let block = start / BLOCK_LEN;
        let iv = adjusted_iv(&header.iv, block);
        let mut cipher = Aes256Ctr::new(key.as_bytes().into(), (&iv).into());
        let from = HEADER_LEN + (block * BLOCK_LEN) as usize;
        let mut reader = Trickle(&bytes[from..]);

        let mut out = Vec::new();
        decrypt_window(
            &mut reader,
            &mut cipher,
            (start % BLOCK_LEN) as usize,
            end - start + 1,
            &mut out,
        )
        .await
        .unwrap();
        assert_eq!(out, &data[start as usize..=end as usize]);
    }

    #[tokio::test]
    async fn range_decrypt_ignores_damage_outside_window() {
        let dir = tempfile::tempdir().unwrap();
        let data = plaintext(1024 * 1024);
        let input = write_input(dir.path(), &data);
        let enc = dir.path().join("blob.data");
        encrypt_file(&input, &enc, b"p@ss").unwrap();
        let key = open_blob_key(b"p@ss", &enc).unwrap();

        let mut bytes = std::fs::read(&enc).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xAA;
        std::fs::write(&enc, bytes).unwrap();

        let mut out = Vec::new();
        decrypt_range(&mut out, &enc, &key, 524_288, 524_288 + 511)
            .await
            .unwrap();
        assert_eq!(out, &data[524_288..524_288 + 512]);
    }

    #[tokio::test]
    async fn range_decrypt_rejects_out_of_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(dir.path(), &plaintext(100));
        let enc = dir.path().join("blob.data");
        encrypt_file(&input, &enc, b"pw").unwrap();
        let key = open_blob_key(b"pw", &enc).unwrap();

        let mut out = Vec::new();
        assert!(decrypt_range(&mut out, &enc, &key, 10, 5).await.is_err());
        assert!(decrypt_range(&mut out, &enc, &key, 0, 100).await.is_err());
    }

    #[test]
    fn user_key_is_deterministic_per_salt() {
        let a = derive_user_key("secret", b"salt-a");
        let b = derive_user_key("secret", b"salt-a");
        let c = derive_user_key("secret", b"salt-b");
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }
}
