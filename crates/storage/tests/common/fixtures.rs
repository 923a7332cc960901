use std::path::PathBuf;
use std::sync::Arc;
use stowage_storage::{BlobLayout, DiskPlacer, DiskSpec, FsSpaceProbe};
use tempfile::TempDir;
use uuid::Uuid;

/// BLAKE3 of data as lowercase hex.
pub fn blake3_hex(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Generate deterministic test data using a seeded pseudo-random generator.
/// Same seed produces same output.
pub fn seeded_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    let mut state = seed;
    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }
    data
}

/// A temp-dir backed disk.
pub struct TestDisk {
    pub dir: TempDir,
    pub spec: DiskSpec,
}

impl TestDisk {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let spec = DiskSpec {
            id: Uuid::new_v4(),
            root: dir.path().join("disk0"),
            data_dir: "data".to_string(),
            size: 1 << 40,
        };
        std::fs::create_dir_all(&spec.root).unwrap();
        Self { dir, spec }
    }

    pub fn layout(&self) -> BlobLayout {
        BlobLayout::new(&self.spec, "temp").unwrap()
    }

    pub fn placer(&self) -> DiskPlacer {
        DiskPlacer::new(vec![self.spec.clone()], Arc::new(FsSpaceProbe))
    }

    pub fn write_source(&self, name: &str, data: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_bytes_deterministic() {
        assert_eq!(seeded_bytes(42, 1000), seeded_bytes(42, 1000));
        assert_ne!(seeded_bytes(42, 1000), seeded_bytes(43, 1000));
    }
}
