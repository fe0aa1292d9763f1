//! CRC-audit checksum over raw delta-frame bytes.
//!
//! Divergence detection needs a hash over the saved state plus each
//! connected player's real input, in player-index order; this engine uses
//! FNV-1a via [`crate::hash::DeterministicHasher`] for a deterministic,
//! cross-platform, non-cryptographic digest with little code to maintain.
//! The CRC wire field is `u32`, so the 64-bit FNV-1a digest is truncated
//! before it goes on the wire.

use std::hash::Hasher;

use crate::hash::DeterministicHasher;

/// Hashes a sequence of raw byte slices into a single `u32` CRC.
///
/// Slices are fed to the hasher in the order given; callers are responsible
/// for supplying them in a deterministic order (state, then per-player real
/// input in ascending player-index order).
#[must_use]
pub fn crc32_of_parts<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> u32 {
    let mut hasher = DeterministicHasher::new();
    for part in parts {
        hasher.write(part);
    }
    hasher.finish() as u32
}
