//! Block range sets and positional device I/O.
//!
//! A [`BlockSet`] is parsed from a transfer-list descriptor and addresses a
//! partition image in [`BLOCK_SIZE`] units. Reads and writes walk the ranges
//! in declaration order, so the byte buffer for a set is the concatenation
//! of its ranges.

mod device;
mod hash;
mod range;
mod writer;

pub use device::is_block_device;
pub use hash::{checksum_bytes, verify_ranges, verify_sha256};
pub use range::{BlockRange, BlockSet};
pub use writer::BlockWriter;

use updatekit_patch::PatchError;

/// Size of one addressable block in bytes.
pub const BLOCK_SIZE: u64 = 4096;

/// Errors produced by block set parsing and device access.
#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    #[error("invalid block descriptor: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("erase requested on a file that is not a block device")]
    NotBlockDevice,

    #[error("buffer too small: need {needed} bytes, have {actual}")]
    ShortBuffer { needed: u64, actual: u64 },

    #[error("patch produced {written} of {expected} target bytes")]
    ShortWrite { written: u64, expected: u64 },

    #[error("patch error: {0}")]
    Patch(#[from] PatchError),
}

impl BlockError {
    /// Returns the underlying I/O error, if any.
    pub fn io_error(&self) -> Option<&std::io::Error> {
        match self {
            Self::Io(e) | Self::Patch(PatchError::Io(e)) => Some(e),
            _ => None,
        }
    }

    /// True when the failure was an `EIO` from the device.
    pub fn is_eio(&self) -> bool {
        self.io_error()
            .and_then(std::io::Error::raw_os_error)
            .is_some_and(|code| code == libc::EIO)
    }
}
