use std::fs::File;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{BLOCK_SIZE, BlockError, BlockSet};

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Checks the first `blocks` blocks of `buffer` against `expected_hex`.
///
/// An empty `expected_hex` never matches, which forces callers down their
/// recompute path.
pub fn verify_sha256(buffer: &[u8], blocks: u64, expected_hex: &str) -> bool {
    if expected_hex.is_empty() {
        return false;
    }
    let len = blocks.saturating_mul(BLOCK_SIZE);
    if (buffer.len() as u64) < len {
        return false;
    }
    checksum_bytes(&buffer[..len as usize]).eq_ignore_ascii_case(expected_hex)
}

/// Reads the blocks named by `descriptor` and compares their digest with
/// `expected_hex`.
pub fn verify_ranges(file: &File, descriptor: &str, expected_hex: &str) -> Result<bool, BlockError> {
    let set = BlockSet::parse(descriptor)?;
    let mut buf = vec![0u8; set.byte_len() as usize];
    if set.read_from_device(file, &mut buf)? == 0 {
        warn!(%descriptor, "ranges unreadable for hash check");
        return Ok(false);
    }
    let matched = verify_sha256(&buf, set.total_blocks(), expected_hex);
    debug!(%descriptor, matched, "range hash checked");
    Ok(matched)
}
