//! `PKGDIFF0` image patches.
//!
//! # Layout
//!
//! ```text
//! [8 bytes: "PKGDIFF0"]
//! [4 bytes LE: chunk count]
//! per chunk:
//!   [4 bytes LE: chunk type]
//!   NORMAL:  src_start u64, src_len u64, patch_offset u64
//!   RAW:     len u32, len bytes
//!   GZIP / DEFLATE:
//!            src_start u64, src_len u64, patch_offset u64,
//!            expanded_len u64, target_size u64,
//!            level i32, method i32, window_bits i32, mem_level i32, strategy i32
//!   LZ4:     src_start u64, src_len u64, patch_offset u64,
//!            expanded_len u64, target_size u64,
//!            compression_level i32, method i32, block_independence i32,
//!            content_checksum i32, block_size_id i32, auto_flush i32
//! ```
//!
//! `patch_offset` is absolute within the image patch and points at a
//! `BSDIFF40` block patch.

use std::ops::Range;

use tracing::debug;

use crate::codec::{
    CompressedRestore, DeflateAdapter, DeflateContainer, DeflateParams, Lz4BlockAdapter,
    Lz4FrameAdapter, Lz4Params, decompress_deflate, decompress_lz4, inflate_deflate, inflate_lz4,
};
use crate::le::LeCursor;
use crate::{CompressAdapter, PatchError, PatchSink, apply_block_patch, generate_block_patch};

/// Magic prefix of an image patch.
pub const IMAGE_PATCH_MAGIC: &[u8; 8] = b"PKGDIFF0";

/// Chunk kinds inside an image patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChunkType {
    Normal = 0,
    Gzip = 1,
    Deflate = 2,
    Raw = 3,
    Lz4 = 4,
}

impl TryFrom<u32> for ChunkType {
    type Error = PatchError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Normal),
            1 => Ok(Self::Gzip),
            2 => Ok(Self::Deflate),
            3 => Ok(Self::Raw),
            4 => Ok(Self::Lz4),
            other => Err(PatchError::CorruptHeader(format!("unknown chunk type {other}"))),
        }
    }
}

/// Header shared by every container chunk.
#[derive(Debug, Clone, Copy)]
struct ContainerHeader {
    src_start: u64,
    src_len: u64,
    patch_offset: u64,
    expanded_len: u64,
    target_size: u64,
}

impl ContainerHeader {
    fn read(cursor: &mut LeCursor<'_>) -> Result<Self, PatchError> {
        Ok(Self {
            src_start: cursor.u64()?,
            src_len: cursor.u64()?,
            patch_offset: cursor.u64()?,
            expanded_len: cursor.u64()?,
            target_size: cursor.u64()?,
        })
    }
}

fn source_window(old: &[u8], start: u64, len: u64) -> Result<&[u8], PatchError> {
    start
        .checked_add(len)
        .filter(|end| *end <= old.len() as u64)
        .map(|end| &old[start as usize..end as usize])
        .ok_or_else(|| {
            PatchError::OutOfRange(format!(
                "source {start}+{len} exceeds old size {}",
                old.len()
            ))
        })
}

fn sub_patch(patch: &[u8], offset: u64) -> Result<&[u8], PatchError> {
    usize::try_from(offset)
        .ok()
        .and_then(|o| patch.get(o..))
        .filter(|p| !p.is_empty())
        .ok_or_else(|| {
            PatchError::CorruptHeader(format!(
                "block patch offset {offset} outside image patch of {} bytes",
                patch.len()
            ))
        })
}

fn apply_container(
    patch: &[u8],
    header: &ContainerHeader,
    expanded: &[u8],
    adapter: Box<dyn CompressAdapter>,
    sink: &mut dyn PatchSink,
) -> Result<u64, PatchError> {
    let block_patch = sub_patch(patch, header.patch_offset)?;
    let mut restore = CompressedRestore::new(adapter, sink)?;
    apply_block_patch(block_patch, expanded, &mut restore)?;
    let (uncompressed, compressed, digest) = restore.finish()?;
    if uncompressed != header.target_size {
        return Err(PatchError::SizeMismatch {
            expected: header.target_size,
            actual: uncompressed,
        });
    }
    debug!(uncompressed, compressed, sha256 = %digest, "container chunk restored");
    Ok(compressed)
}

/// Applies a `PKGDIFF0` image patch to `old`, streaming into `sink`.
///
/// Returns the number of bytes written to `sink`.
pub fn apply_image_patch(
    patch: &[u8],
    old: &[u8],
    sink: &mut dyn PatchSink,
) -> Result<u64, PatchError> {
    let mut cursor = LeCursor::new(patch);
    if cursor.bytes(IMAGE_PATCH_MAGIC.len())? != IMAGE_PATCH_MAGIC {
        return Err(PatchError::CorruptHeader("bad image patch magic".into()));
    }
    let chunks = cursor.u32()?;

    let mut written = 0u64;
    for index in 0..chunks {
        let kind = ChunkType::try_from(cursor.u32()?)?;
        let produced = match kind {
            ChunkType::Normal => {
                let src_start = cursor.u64()?;
                let src_len = cursor.u64()?;
                let patch_offset = cursor.u64()?;
                let window = source_window(old, src_start, src_len)?;
                apply_block_patch(sub_patch(patch, patch_offset)?, window, sink)?
            }
            ChunkType::Raw => {
                let len = cursor.u32()? as usize;
                let data = cursor.bytes(len)?;
                sink.put(data)?;
                len as u64
            }
            ChunkType::Gzip | ChunkType::Deflate => {
                let header = ContainerHeader::read(&mut cursor)?;
                let params = DeflateParams {
                    level: cursor.i32()?,
                    method: cursor.i32()?,
                    window_bits: cursor.i32()?,
                    mem_level: cursor.i32()?,
                    strategy: cursor.i32()?,
                };
                let container = if kind == ChunkType::Gzip {
                    DeflateContainer::Gzip
                } else {
                    params.container()
                };
                let params = if container == DeflateContainer::Gzip {
                    DeflateParams { window_bits: 31, ..params }
                } else {
                    params
                };
                let window = source_window(old, header.src_start, header.src_len)?;
                let expanded = decompress_deflate(container, window, header.expanded_len)?;
                apply_container(patch, &header, &expanded, Box::new(DeflateAdapter::new(params)), sink)?
            }
            ChunkType::Lz4 => {
                let header = ContainerHeader::read(&mut cursor)?;
                let params = Lz4Params {
                    compression_level: cursor.i32()?,
                    method: cursor.i32()?,
                    block_independence: cursor.i32()?,
                    content_checksum: cursor.i32()?,
                    block_size_id: cursor.i32()?,
                    auto_flush: cursor.i32()?,
                };
                let window = source_window(old, header.src_start, header.src_len)?;
                let expanded = decompress_lz4(&params, window, header.expanded_len)?;
                let adapter: Box<dyn CompressAdapter> = if params.is_legacy() {
                    Box::new(Lz4BlockAdapter::new())
                } else {
                    Box::new(Lz4FrameAdapter::new(params))
                };
                apply_container(patch, &header, &expanded, adapter, sink)?
            }
        };
        debug!(index, ?kind, produced, "image chunk applied");
        written += produced;
    }
    Ok(written)
}

// ---------------------------------------------------------------------------
// ImagePatchBuilder
// ---------------------------------------------------------------------------

enum PendingChunk {
    Normal {
        src: Range<u64>,
        patch: Vec<u8>,
    },
    Raw(Vec<u8>),
    Deflate {
        src: Range<u64>,
        expanded_len: u64,
        target_size: u64,
        params: DeflateParams,
        patch: Vec<u8>,
    },
    Lz4 {
        src: Range<u64>,
        expanded_len: u64,
        target_size: u64,
        params: Lz4Params,
        patch: Vec<u8>,
    },
}

impl PendingChunk {
    fn header_len(&self) -> usize {
        4 + match self {
            Self::Normal { .. } => 24,
            Self::Raw(data) => 4 + data.len(),
            Self::Deflate { .. } => 40 + 20,
            Self::Lz4 { .. } => 40 + 24,
        }
    }

    fn block_patch(&self) -> Option<&[u8]> {
        match self {
            Self::Normal { patch, .. } | Self::Deflate { patch, .. } | Self::Lz4 { patch, .. } => {
                Some(patch)
            }
            Self::Raw(_) => None,
        }
    }
}

/// Assembles an image patch from chunks, in target order.
#[derive(Default)]
pub struct ImagePatchBuilder {
    chunks: Vec<PendingChunk>,
}

impl ImagePatchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn window(old: &[u8], src: &Range<u64>) -> Result<Vec<u8>, PatchError> {
        source_window(old, src.start, src.end.saturating_sub(src.start)).map(<[u8]>::to_vec)
    }

    /// Adds a chunk that diffs `target` against `old[src]`.
    pub fn normal(
        &mut self,
        old: &[u8],
        src: Range<u64>,
        target: &[u8],
    ) -> Result<&mut Self, PatchError> {
        let window = Self::window(old, &src)?;
        let patch = generate_block_patch(&window, target)?;
        self.chunks.push(PendingChunk::Normal { src, patch });
        Ok(self)
    }

    /// Adds literal bytes.
    pub fn raw(&mut self, data: &[u8]) -> &mut Self {
        self.chunks.push(PendingChunk::Raw(data.to_vec()));
        self
    }

    /// Adds a deflate member at `old[src]` whose new uncompressed contents
    /// are `target`.
    pub fn deflate(
        &mut self,
        old: &[u8],
        src: Range<u64>,
        params: DeflateParams,
        target: &[u8],
    ) -> Result<&mut Self, PatchError> {
        let window = Self::window(old, &src)?;
        let expanded = inflate_deflate(params.container(), &window, None)?;
        let patch = generate_block_patch(&expanded, target)?;
        self.chunks.push(PendingChunk::Deflate {
            src,
            expanded_len: expanded.len() as u64,
            target_size: target.len() as u64,
            params,
            patch,
        });
        Ok(self)
    }

    /// Adds an lz4 member at `old[src]` whose new uncompressed contents are
    /// `target`.
    pub fn lz4(
        &mut self,
        old: &[u8],
        src: Range<u64>,
        params: Lz4Params,
        target: &[u8],
    ) -> Result<&mut Self, PatchError> {
        let window = Self::window(old, &src)?;
        let expanded = inflate_lz4(&params, &window, None)?;
        let patch = generate_block_patch(&expanded, target)?;
        self.chunks.push(PendingChunk::Lz4 {
            src,
            expanded_len: expanded.len() as u64,
            target_size: target.len() as u64,
            params,
            patch,
        });
        Ok(self)
    }

    /// Serializes the image patch.
    pub fn build(&self) -> Vec<u8> {
        let headers_len: usize = 12 + self.chunks.iter().map(PendingChunk::header_len).sum::<usize>();
        let mut out = Vec::with_capacity(headers_len);
        out.extend_from_slice(IMAGE_PATCH_MAGIC);
        out.extend_from_slice(&(self.chunks.len() as u32).to_le_bytes());

        let mut next_offset = headers_len as u64;
        for chunk in &self.chunks {
            let patch_offset = next_offset;
            if let Some(p) = chunk.block_patch() {
                next_offset += p.len() as u64;
            }
            match chunk {
                PendingChunk::Normal { src, .. } => {
                    out.extend_from_slice(&(ChunkType::Normal as u32).to_le_bytes());
                    put_u64s(&mut out, &[src.start, src.end - src.start, patch_offset]);
                }
                PendingChunk::Raw(data) => {
                    out.extend_from_slice(&(ChunkType::Raw as u32).to_le_bytes());
                    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
                    out.extend_from_slice(data);
                }
                PendingChunk::Deflate {
                    src,
                    expanded_len,
                    target_size,
                    params,
                    ..
                } => {
                    let kind = if params.container() == DeflateContainer::Gzip {
                        ChunkType::Gzip
                    } else {
                        ChunkType::Deflate
                    };
                    out.extend_from_slice(&(kind as u32).to_le_bytes());
                    put_u64s(
                        &mut out,
                        &[src.start, src.end - src.start, patch_offset, *expanded_len, *target_size],
                    );
                    put_i32s(
                        &mut out,
                        &[params.level, params.method, params.window_bits, params.mem_level, params.strategy],
                    );
                }
                PendingChunk::Lz4 {
                    src,
                    expanded_len,
                    target_size,
                    params,
                    ..
                } => {
                    out.extend_from_slice(&(ChunkType::Lz4 as u32).to_le_bytes());
                    put_u64s(
                        &mut out,
                        &[src.start, src.end - src.start, patch_offset, *expanded_len, *target_size],
                    );
                    put_i32s(
                        &mut out,
                        &[
                            params.compression_level,
                            params.method,
                            params.block_independence,
                            params.content_checksum,
                            params.block_size_id,
                            params.auto_flush,
                        ],
                    );
                }
            }
        }

        for chunk in &self.chunks {
            if let Some(p) = chunk.block_patch() {
                out.extend_from_slice(p);
            }
        }
        out
    }
}

fn put_u64s(out: &mut Vec<u8>, values: &[u64]) {
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

fn put_i32s(out: &mut Vec<u8>, values: &[i32]) {
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
}
