//! Test fixtures for generating test data.

use bytes::Bytes;
use stowage_core::SAMPLE_COUNT;
use stowage_core::hash::quick_hash_reader;
use stowage_core::upload::PrecheckRequest;

/// Generate deterministic test data based on a seed.
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    for chunk in data.chunks_mut(8) {
        // Simple LCG for deterministic data
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// Hex MD5 as sent in `Content-MD5`.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// The precheck body a client computes for `data`.
#[allow(dead_code)]
pub fn precheck_body(data: &[u8], filename: &str, virtual_path: &str) -> PrecheckRequest {
    let signature = quick_hash_reader(data, SAMPLE_COUNT).expect("quick hash");
    let sampled = signature.sampled_hex(SAMPLE_COUNT);
    PrecheckRequest {
        filename: filename.to_string(),
        size: data.len() as u64,
        chunk_signature: signature.signature.to_hex(),
        first_chunk_hash: sampled[0].clone(),
        second_chunk_hash: sampled[1].clone(),
        third_chunk_hash: sampled[2].clone(),
        virtual_path: virtual_path.to_string(),
        chunk_size: None,
    }
}

/// Split data into chunks of specified size.
#[allow(dead_code)]
pub fn split_into_chunks(data: &[u8], chunk_size: usize) -> Vec<Bytes> {
    data.chunks(chunk_size)
        .map(Bytes::copy_from_slice)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_bytes_deterministic() {
        let a = seeded_bytes(42, 100);
        let b = seeded_bytes(42, 100);
        assert_eq!(a, b);

        let c = seeded_bytes(43, 100);
        assert_ne!(a, c);
    }

    #[test]
    fn test_split_into_chunks() {
        let data = seeded_bytes(1, 100);
        let chunks = split_into_chunks(&data, 30);
        assert_eq!(chunks.len(), 4); // 30 + 30 + 30 + 10

        let reassembled: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(reassembled, data.as_ref());
    }
}
