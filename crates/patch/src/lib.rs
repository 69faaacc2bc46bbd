//! Binary patch application and generation for block images.
//!
//! Two patch families are supported:
//!
//! - `BSDIFF40` block patches: control triples plus bzip2 compressed diff
//!   and extra streams, applied against an old buffer.
//! - `PKGDIFF0` image patches: a chunk list where each chunk is either a
//!   nested block patch, a raw literal, or a block patch applied to the
//!   decompressed contents of a deflate/gzip/zlib or lz4 member which is then
//!   recompressed.
//!
//! Output always flows through a [`PatchSink`] so callers can stream into a
//! device writer, a compressing adapter, or a plain `Vec<u8>`.

mod bsdiff;
mod bspatch;
mod codec;
mod error;
mod image;
mod le;

pub use bsdiff::generate_block_patch;
pub use bspatch::{BSDIFF_MAGIC, apply_block_patch, block_patch_new_size};
pub use codec::{
    CompressAdapter, CompressedRestore, DeflateAdapter, DeflateContainer, DeflateParams,
    LZ4_LEGACY_MAGIC, Lz4BlockAdapter, Lz4FrameAdapter, Lz4Params, compress_deflate,
    compress_lz4, decompress_deflate, decompress_lz4,
};
pub use error::PatchError;
pub use image::{ChunkType, IMAGE_PATCH_MAGIC, ImagePatchBuilder, apply_image_patch};
pub use le::{LeCursor, read_le16, read_le32, read_le64, read_offtin, write_offtout};

/// Destination for reconstructed bytes.
///
/// Implementations receive output strictly in order and must accept every
/// byte or fail.
pub trait PatchSink {
    /// Accepts the next run of reconstructed bytes.
    fn put(&mut self, data: &[u8]) -> Result<(), PatchError>;
}

impl PatchSink for Vec<u8> {
    fn put(&mut self, data: &[u8]) -> Result<(), PatchError> {
        self.extend_from_slice(data);
        Ok(())
    }
}

impl<S: PatchSink + ?Sized> PatchSink for &mut S {
    fn put(&mut self, data: &[u8]) -> Result<(), PatchError> {
        (**self).put(data)
    }
}
