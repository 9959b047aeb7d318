//! Rolling CRC32 (IEEE 802.3, init `0xFFFFFFFF`, one's-complement finalize).
//!
//! Every persistent component threads bytes through this codec: the main
//! file header CRC, the WAL's per-entry CRC, and the WAL's `db_crc`
//! snapshot all go through the same seed/update/finalize contract.

use crc32fast::Hasher;

/// A running CRC32 accumulator.
///
/// Matches `crc32fast::Hasher`'s own init/finalize semantics exactly, so
/// this wrapper exists purely to give the accumulation a name that reads
/// naturally at call sites (`Crc32::new()` rather than a bare `Hasher`).
pub struct Crc32 {
    hasher: Hasher,
}

impl Crc32 {
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn finalize(self) -> u32 {
        self.hasher.finalize()
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot CRC32 over a single buffer.
pub fn crc32_of(bytes: &[u8]) -> u32 {
    let mut crc = Crc32::new();
    crc.update(bytes);
    crc.finalize()
}
