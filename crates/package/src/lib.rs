//! Update package access and signed partition manifests.
//!
//! - [`PackageReader`]: named members of an update package, read as streams.
//! - [`tlv`]: little-endian type/length/value records.
//! - [`HashManifest`]: signed list of expected partition digests.
//! - [`verify_partition_hashes`]: checks every partition concurrently.

mod manifest;
mod reader;
mod signer;
pub mod tlv;
mod validation;
mod verify;

pub use manifest::{HashManifest, PartitionHash};
pub use reader::{DirPackage, FileInfo, MemoryPackage, PackageReader};
pub use signer::{Ed25519Oracle, SignatureOracle};
pub use validation::validate_entry_name;
pub use verify::{file_digest, verify_partition_hashes};

/// Errors produced by the package crate.
#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("package member not found: {0}")]
    NotFound(String),

    #[error("invalid member name: {0}")]
    InvalidName(String),

    #[error("malformed record: {0}")]
    Tlv(String),

    #[error("signature error: {0}")]
    Signature(String),

    #[error("hash mismatch for {partition}: expected {expected}, got {actual}")]
    HashMismatch {
        partition: String,
        expected: String,
        actual: String,
    },

    #[error("verification task failed: {0}")]
    Task(String),
}
