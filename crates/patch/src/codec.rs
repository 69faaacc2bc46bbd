//! Compression adapters used to repack container members.
//!
//! An adapter owns the live codec state and the compressed bytes it has not
//! yet handed to the downstream sink. Output is drained into the sink once the
//! pending buffer grows past [`DRAIN_THRESHOLD`], and fully on
//! [`CompressAdapter::flush_data`].

use std::io::{Read, Write};

use flate2::Compression;
use lz4_flex::frame::{BlockMode, BlockSize, FrameDecoder, FrameEncoder, FrameInfo};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{PatchError, PatchSink};

/// Pending compressed output is handed downstream past this size.
const DRAIN_THRESHOLD: usize = 256 * 1024;

/// Magic number of the legacy lz4 framing.
pub const LZ4_LEGACY_MAGIC: u32 = 0x184C_2102;

/// Uncompressed size of one legacy lz4 block.
const LZ4_LEGACY_BLOCK: usize = 8 * 1024 * 1024;

/// Capability set shared by every compression adapter.
pub trait CompressAdapter {
    /// Initializes codec state. Must be called before `write_data`.
    fn open(&mut self, sink: &mut dyn PatchSink) -> Result<(), PatchError>;

    /// Compresses `data`, handing finished output to `sink` as it accumulates.
    fn write_data(&mut self, data: &[u8], sink: &mut dyn PatchSink) -> Result<(), PatchError>;

    /// Finishes the stream and drains every remaining byte into `sink`.
    ///
    /// Returns the total number of compressed bytes emitted.
    fn flush_data(&mut self, sink: &mut dyn PatchSink) -> Result<u64, PatchError>;

    /// Releases codec state.
    fn close(&mut self);
}

fn drain(pending: &mut Vec<u8>, emitted: &mut u64, sink: &mut dyn PatchSink) -> Result<(), PatchError> {
    if pending.is_empty() {
        return Ok(());
    }
    let out = std::mem::take(pending);
    *emitted += out.len() as u64;
    sink.put(&out)
}

fn not_open(codec: &str) -> PatchError {
    PatchError::Codec(format!("{codec} adapter used before open"))
}

// ---------------------------------------------------------------------------
// Deflate / zlib / gzip
// ---------------------------------------------------------------------------

/// Framing around a deflate stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeflateContainer {
    Raw,
    Zlib,
    Gzip,
}

/// zlib style parameters recorded in a container chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeflateParams {
    pub level: i32,
    pub method: i32,
    pub window_bits: i32,
    pub mem_level: i32,
    pub strategy: i32,
}

impl DeflateParams {
    /// Raw deflate at the given level, as stored in zip members.
    pub fn raw(level: i32) -> Self {
        Self {
            level,
            method: 8,
            window_bits: -15,
            mem_level: 8,
            strategy: 0,
        }
    }

    /// gzip framing at the given level.
    pub fn gzip(level: i32) -> Self {
        Self {
            window_bits: 15 + 16,
            ..Self::raw(level)
        }
    }

    /// Negative window bits mean raw deflate, above 15 means gzip.
    pub fn container(&self) -> DeflateContainer {
        match self.window_bits {
            w if w < 0 => DeflateContainer::Raw,
            w if w > 15 => DeflateContainer::Gzip,
            _ => DeflateContainer::Zlib,
        }
    }

    fn compression(&self) -> Compression {
        if self.level < 0 {
            Compression::default()
        } else {
            Compression::new(self.level.min(9) as u32)
        }
    }
}

enum DeflateStream {
    Raw(flate2::write::DeflateEncoder<Vec<u8>>),
    Zlib(flate2::write::ZlibEncoder<Vec<u8>>),
    Gzip(flate2::write::GzEncoder<Vec<u8>>),
}

impl DeflateStream {
    fn new(params: &DeflateParams) -> Self {
        let level = params.compression();
        match params.container() {
            DeflateContainer::Raw => Self::Raw(flate2::write::DeflateEncoder::new(Vec::new(), level)),
            DeflateContainer::Zlib => Self::Zlib(flate2::write::ZlibEncoder::new(Vec::new(), level)),
            DeflateContainer::Gzip => Self::Gzip(flate2::write::GzEncoder::new(Vec::new(), level)),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Raw(e) => e.write_all(data),
            Self::Zlib(e) => e.write_all(data),
            Self::Gzip(e) => e.write_all(data),
        }
    }

    fn pending(&mut self) -> &mut Vec<u8> {
        match self {
            Self::Raw(e) => e.get_mut(),
            Self::Zlib(e) => e.get_mut(),
            Self::Gzip(e) => e.get_mut(),
        }
    }

    fn finish(self) -> std::io::Result<Vec<u8>> {
        match self {
            Self::Raw(e) => e.finish(),
            Self::Zlib(e) => e.finish(),
            Self::Gzip(e) => e.finish(),
        }
    }
}

/// Deflate family adapter.
pub struct DeflateAdapter {
    params: DeflateParams,
    stream: Option<DeflateStream>,
    emitted: u64,
}

impl DeflateAdapter {
    pub fn new(params: DeflateParams) -> Self {
        Self {
            params,
            stream: None,
            emitted: 0,
        }
    }
}

impl CompressAdapter for DeflateAdapter {
    fn open(&mut self, _sink: &mut dyn PatchSink) -> Result<(), PatchError> {
        if self.params.mem_level != 8 || self.params.strategy != 0 {
            debug!(
                mem_level = self.params.mem_level,
                strategy = self.params.strategy,
                "deflate tuning parameters not applied by encoder"
            );
        }
        self.stream = Some(DeflateStream::new(&self.params));
        self.emitted = 0;
        Ok(())
    }

    fn write_data(&mut self, data: &[u8], sink: &mut dyn PatchSink) -> Result<(), PatchError> {
        let stream = self.stream.as_mut().ok_or_else(|| not_open("deflate"))?;
        stream
            .write_all(data)
            .map_err(|e| PatchError::codec("deflate", e))?;
        if stream.pending().len() >= DRAIN_THRESHOLD {
            drain(stream.pending(), &mut self.emitted, sink)?;
        }
        Ok(())
    }

    fn flush_data(&mut self, sink: &mut dyn PatchSink) -> Result<u64, PatchError> {
        let stream = self.stream.take().ok_or_else(|| not_open("deflate"))?;
        let mut rest = stream
            .finish()
            .map_err(|e| PatchError::codec("deflate finish", e))?;
        drain(&mut rest, &mut self.emitted, sink)?;
        Ok(self.emitted)
    }

    fn close(&mut self) {
        self.stream = None;
    }
}

/// Reads `reader` to the end, stopping one byte past `limit`.
fn read_bounded(mut reader: impl Read, limit: Option<u64>, stage: &str) -> Result<Vec<u8>, PatchError> {
    let mut out = Vec::new();
    let result = match limit {
        Some(limit) => reader.take(limit.saturating_add(1)).read_to_end(&mut out),
        None => reader.read_to_end(&mut out),
    };
    result.map_err(|e| PatchError::codec(stage, e))?;
    check_limit(out.len() as u64, limit)?;
    Ok(out)
}

fn check_limit(len: u64, limit: Option<u64>) -> Result<(), PatchError> {
    match limit {
        Some(expected) if len > expected => Err(PatchError::SizeMismatch { expected, actual: len }),
        _ => Ok(()),
    }
}

/// Inflates a deflate family member, producing at most `limit` bytes when
/// one is given.
pub(crate) fn inflate_deflate(
    container: DeflateContainer,
    data: &[u8],
    limit: Option<u64>,
) -> Result<Vec<u8>, PatchError> {
    match container {
        DeflateContainer::Raw => read_bounded(flate2::read::DeflateDecoder::new(data), limit, "inflate"),
        DeflateContainer::Zlib => read_bounded(flate2::read::ZlibDecoder::new(data), limit, "inflate"),
        DeflateContainer::Gzip => read_bounded(flate2::read::GzDecoder::new(data), limit, "inflate"),
    }
}

fn expect_len(out: Vec<u8>, expected_len: u64) -> Result<Vec<u8>, PatchError> {
    if out.len() as u64 != expected_len {
        return Err(PatchError::SizeMismatch {
            expected: expected_len,
            actual: out.len() as u64,
        });
    }
    Ok(out)
}

/// Decompresses a deflate family member, requiring exactly `expected_len` bytes.
pub fn decompress_deflate(
    container: DeflateContainer,
    data: &[u8],
    expected_len: u64,
) -> Result<Vec<u8>, PatchError> {
    expect_len(inflate_deflate(container, data, Some(expected_len))?, expected_len)
}

/// Compresses `data` with the adapter matching `params`.
pub fn compress_deflate(params: DeflateParams, data: &[u8]) -> Result<Vec<u8>, PatchError> {
    let mut out = Vec::new();
    let mut adapter = DeflateAdapter::new(params);
    adapter.open(&mut out)?;
    adapter.write_data(data, &mut out)?;
    adapter.flush_data(&mut out)?;
    adapter.close();
    Ok(out)
}

// ---------------------------------------------------------------------------
// LZ4
// ---------------------------------------------------------------------------

/// lz4 parameters recorded in a container chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lz4Params {
    pub compression_level: i32,
    /// [`LZ4_LEGACY_MAGIC`] selects legacy block framing, anything else the
    /// standard frame format.
    pub method: i32,
    pub block_independence: i32,
    pub content_checksum: i32,
    pub block_size_id: i32,
    pub auto_flush: i32,
}

impl Lz4Params {
    /// Standard lz4 frame with 64 KiB independent blocks.
    pub fn frame() -> Self {
        Self {
            compression_level: 0,
            method: 0,
            block_independence: 1,
            content_checksum: 0,
            block_size_id: 4,
            auto_flush: 0,
        }
    }

    /// Legacy framing (`0x184C2102`).
    pub fn legacy() -> Self {
        Self {
            method: LZ4_LEGACY_MAGIC as i32,
            ..Self::frame()
        }
    }

    pub fn is_legacy(&self) -> bool {
        self.method as u32 == LZ4_LEGACY_MAGIC
    }

    fn frame_info(&self) -> FrameInfo {
        let block_size = match self.block_size_id {
            5 => BlockSize::Max256KB,
            6 => BlockSize::Max1MB,
            7 => BlockSize::Max4MB,
            _ => BlockSize::Max64KB,
        };
        let block_mode = if self.block_independence != 0 {
            BlockMode::Independent
        } else {
            BlockMode::Linked
        };
        FrameInfo::new()
            .block_size(block_size)
            .block_mode(block_mode)
            .content_checksum(self.content_checksum != 0)
    }
}

/// lz4 frame format adapter.
pub struct Lz4FrameAdapter {
    params: Lz4Params,
    encoder: Option<FrameEncoder<Vec<u8>>>,
    emitted: u64,
}

impl Lz4FrameAdapter {
    pub fn new(params: Lz4Params) -> Self {
        Self {
            params,
            encoder: None,
            emitted: 0,
        }
    }
}

impl CompressAdapter for Lz4FrameAdapter {
    fn open(&mut self, _sink: &mut dyn PatchSink) -> Result<(), PatchError> {
        self.encoder = Some(FrameEncoder::with_frame_info(
            self.params.frame_info(),
            Vec::new(),
        ));
        self.emitted = 0;
        Ok(())
    }

    fn write_data(&mut self, data: &[u8], sink: &mut dyn PatchSink) -> Result<(), PatchError> {
        let encoder = self.encoder.as_mut().ok_or_else(|| not_open("lz4"))?;
        encoder
            .write_all(data)
            .map_err(|e| PatchError::codec("lz4", e))?;
        if encoder.get_mut().len() >= DRAIN_THRESHOLD {
            drain(encoder.get_mut(), &mut self.emitted, sink)?;
        }
        Ok(())
    }

    fn flush_data(&mut self, sink: &mut dyn PatchSink) -> Result<u64, PatchError> {
        let encoder = self.encoder.take().ok_or_else(|| not_open("lz4"))?;
        let mut rest = encoder
            .finish()
            .map_err(|e| PatchError::codec("lz4 finish", e))?;
        drain(&mut rest, &mut self.emitted, sink)?;
        Ok(self.emitted)
    }

    fn close(&mut self) {
        self.encoder = None;
    }
}

/// Legacy lz4 framing: magic, then `[u32 LE compressed size][block]` records
/// of up to 8 MiB uncompressed each.
pub struct Lz4BlockAdapter {
    pending: Vec<u8>,
    input: Vec<u8>,
    emitted: u64,
    open: bool,
}

impl Lz4BlockAdapter {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            input: Vec::new(),
            emitted: 0,
            open: false,
        }
    }

    fn compress_block(&mut self, block: &[u8]) {
        let compressed = lz4_flex::block::compress(block);
        self.pending
            .extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        self.pending.extend_from_slice(&compressed);
    }
}

impl Default for Lz4BlockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressAdapter for Lz4BlockAdapter {
    fn open(&mut self, _sink: &mut dyn PatchSink) -> Result<(), PatchError> {
        self.pending.clear();
        self.input.clear();
        self.pending.extend_from_slice(&LZ4_LEGACY_MAGIC.to_le_bytes());
        self.emitted = 0;
        self.open = true;
        Ok(())
    }

    fn write_data(&mut self, data: &[u8], sink: &mut dyn PatchSink) -> Result<(), PatchError> {
        if !self.open {
            return Err(not_open("lz4 legacy"));
        }
        self.input.extend_from_slice(data);
        while self.input.len() >= LZ4_LEGACY_BLOCK {
            let block: Vec<u8> = self.input.drain(..LZ4_LEGACY_BLOCK).collect();
            self.compress_block(&block);
        }
        if self.pending.len() >= DRAIN_THRESHOLD {
            drain(&mut self.pending, &mut self.emitted, sink)?;
        }
        Ok(())
    }

    fn flush_data(&mut self, sink: &mut dyn PatchSink) -> Result<u64, PatchError> {
        if !self.open {
            return Err(not_open("lz4 legacy"));
        }
        if !self.input.is_empty() {
            let block = std::mem::take(&mut self.input);
            self.compress_block(&block);
        }
        drain(&mut self.pending, &mut self.emitted, sink)?;
        self.open = false;
        Ok(self.emitted)
    }

    fn close(&mut self) {
        self.pending = Vec::new();
        self.input = Vec::new();
        self.open = false;
    }
}

fn decompress_lz4_legacy(data: &[u8], limit: Option<u64>) -> Result<Vec<u8>, PatchError> {
    let magic = crate::read_le32(data, 0)?;
    if magic != LZ4_LEGACY_MAGIC {
        return Err(PatchError::CorruptHeader(format!(
            "bad lz4 legacy magic {magic:#x}"
        )));
    }
    let mut cursor = crate::LeCursor::new(&data[4..]);
    let mut out = Vec::new();
    while cursor.position() < data.len() - 4 {
        let len = cursor.u32()? as usize;
        let block = cursor.bytes(len)?;
        let decoded = lz4_flex::block::decompress(block, LZ4_LEGACY_BLOCK)
            .map_err(|e| PatchError::codec("lz4 legacy block", e))?;
        out.extend_from_slice(&decoded);
        check_limit(out.len() as u64, limit)?;
    }
    Ok(out)
}

/// Decodes an lz4 member, producing at most `limit` bytes when one is given.
pub(crate) fn inflate_lz4(
    params: &Lz4Params,
    data: &[u8],
    limit: Option<u64>,
) -> Result<Vec<u8>, PatchError> {
    if params.is_legacy() {
        return decompress_lz4_legacy(data, limit);
    }
    read_bounded(FrameDecoder::new(data), limit, "lz4 frame")
}

/// Decompresses an lz4 member, requiring exactly `expected_len` bytes.
pub fn decompress_lz4(
    params: &Lz4Params,
    data: &[u8],
    expected_len: u64,
) -> Result<Vec<u8>, PatchError> {
    expect_len(inflate_lz4(params, data, Some(expected_len))?, expected_len)
}

/// Compresses `data` with the adapter matching `params`.
pub fn compress_lz4(params: Lz4Params, data: &[u8]) -> Result<Vec<u8>, PatchError> {
    let mut out = Vec::new();
    let mut adapter: Box<dyn CompressAdapter> = if params.is_legacy() {
        Box::new(Lz4BlockAdapter::new())
    } else {
        Box::new(Lz4FrameAdapter::new(params))
    };
    adapter.open(&mut out)?;
    adapter.write_data(data, &mut out)?;
    adapter.flush_data(&mut out)?;
    adapter.close();
    Ok(out)
}

// ---------------------------------------------------------------------------
// CompressedRestore
// ---------------------------------------------------------------------------

/// Patch sink that recompresses reconstructed member contents.
///
/// Tracks the uncompressed byte count and a running SHA-256 of the
/// uncompressed stream so the caller can validate the declared target size.
pub struct CompressedRestore<'a> {
    adapter: Box<dyn CompressAdapter>,
    sink: &'a mut dyn PatchSink,
    hasher: Sha256,
    uncompressed: u64,
}

impl<'a> CompressedRestore<'a> {
    /// Opens `adapter` in front of `sink`.
    pub fn new(
        mut adapter: Box<dyn CompressAdapter>,
        sink: &'a mut dyn PatchSink,
    ) -> Result<Self, PatchError> {
        adapter.open(sink)?;
        Ok(Self {
            adapter,
            sink,
            hasher: Sha256::new(),
            uncompressed: 0,
        })
    }

    /// Flushes the codec.
    ///
    /// Returns `(uncompressed bytes, compressed bytes, hex SHA-256 of the
    /// uncompressed stream)`.
    pub fn finish(mut self) -> Result<(u64, u64, String), PatchError> {
        let compressed = self.adapter.flush_data(self.sink)?;
        self.adapter.close();
        let digest = hex::encode(self.hasher.finalize());
        Ok((self.uncompressed, compressed, digest))
    }
}

impl PatchSink for CompressedRestore<'_> {
    fn put(&mut self, data: &[u8]) -> Result<(), PatchError> {
        self.hasher.update(data);
        self.uncompressed += data.len() as u64;
        self.adapter.write_data(data, self.sink)
    }
}
