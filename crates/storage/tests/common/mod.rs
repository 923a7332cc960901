pub mod fixtures;

#[allow(unused_imports)]
pub use fixtures::{TestDisk, blake3_hex, seeded_bytes};
