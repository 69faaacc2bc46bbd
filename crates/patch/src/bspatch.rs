//! `BSDIFF40` block patch application.
//!
//! # Layout
//!
//! ```text
//! [8 bytes: "BSDIFF40"]
//! [8 bytes: control stream length, sign-magnitude LE]
//! [8 bytes: diff stream length, sign-magnitude LE]
//! [8 bytes: new size, sign-magnitude LE]
//! [bzip2: control triples (add_len, copy_len, seek)]
//! [bzip2: diff bytes, added to old bytes]
//! [bzip2: extra bytes, copied verbatim]
//! ```

use std::io::Read;

use bzip2::read::BzDecoder;
use tracing::debug;

use crate::le::read_offtin;
use crate::{PatchError, PatchSink};

/// Magic prefix of a block patch.
pub const BSDIFF_MAGIC: &[u8; 8] = b"BSDIFF40";

pub(crate) const HEADER_LEN: usize = 32;

/// Largest run decoded into memory at once.
const RUN_CHUNK: usize = 64 * 1024;

struct Header {
    ctrl_len: usize,
    diff_len: usize,
    new_size: u64,
}

fn parse_header(patch: &[u8]) -> Result<Header, PatchError> {
    if patch.len() < HEADER_LEN {
        return Err(PatchError::CorruptHeader(format!(
            "block patch too short: {} bytes",
            patch.len()
        )));
    }
    if &patch[..8] != BSDIFF_MAGIC {
        return Err(PatchError::CorruptHeader("bad block patch magic".into()));
    }

    let ctrl_len = read_offtin(patch, 8)?;
    let diff_len = read_offtin(patch, 16)?;
    let new_size = read_offtin(patch, 24)?;
    if ctrl_len < 0 || diff_len < 0 || new_size < 0 {
        return Err(PatchError::CorruptHeader(format!(
            "negative length (ctrl {ctrl_len}, diff {diff_len}, new {new_size})"
        )));
    }

    let header = Header {
        ctrl_len: ctrl_len as usize,
        diff_len: diff_len as usize,
        new_size: new_size as u64,
    };
    let streams_end = HEADER_LEN
        .checked_add(header.ctrl_len)
        .and_then(|v| v.checked_add(header.diff_len));
    match streams_end {
        Some(end) if end <= patch.len() => Ok(header),
        _ => Err(PatchError::CorruptHeader(format!(
            "streams exceed patch length {}",
            patch.len()
        ))),
    }
}

/// Returns the output size declared by a block patch header.
pub fn block_patch_new_size(patch: &[u8]) -> Result<u64, PatchError> {
    parse_header(patch).map(|h| h.new_size)
}

/// Applies a `BSDIFF40` patch to `old`, streaming the result into `sink`.
///
/// Returns the number of bytes produced.
pub fn apply_block_patch(
    patch: &[u8],
    old: &[u8],
    sink: &mut dyn PatchSink,
) -> Result<u64, PatchError> {
    let header = parse_header(patch)?;
    let ctrl_end = HEADER_LEN + header.ctrl_len;
    let diff_end = ctrl_end + header.diff_len;

    let mut ctrl = BzDecoder::new(&patch[HEADER_LEN..ctrl_end]);
    let mut diff = BzDecoder::new(&patch[ctrl_end..diff_end]);
    let mut extra = BzDecoder::new(&patch[diff_end..]);

    let mut buf = vec![0u8; RUN_CHUNK];
    let mut triple = [0u8; 24];
    let mut new_pos: u64 = 0;
    let mut old_pos: i64 = 0;

    while new_pos < header.new_size {
        ctrl.read_exact(&mut triple)
            .map_err(|e| PatchError::codec("control stream", e))?;
        let add_len = read_offtin(&triple, 0)?;
        let copy_len = read_offtin(&triple, 8)?;
        let seek = read_offtin(&triple, 16)?;
        if add_len < 0 || copy_len < 0 {
            return Err(PatchError::CorruptHeader(format!(
                "negative control run (add {add_len}, copy {copy_len})"
            )));
        }

        let add_len = add_len as u64;
        if new_pos + add_len > header.new_size {
            return Err(PatchError::OutOfRange(format!(
                "diff run of {add_len} at {new_pos} exceeds new size {}",
                header.new_size
            )));
        }
        let mut remaining = add_len;
        while remaining > 0 {
            let n = remaining.min(RUN_CHUNK as u64) as usize;
            let run_end = old_pos.checked_add(n as i64).ok_or_else(|| {
                PatchError::OutOfRange(format!("diff run of {n} at old offset {old_pos} overflows"))
            })?;
            diff.read_exact(&mut buf[..n])
                .map_err(|e| PatchError::codec("diff stream", e))?;
            for (i, byte) in buf[..n].iter_mut().enumerate() {
                let pos = old_pos + i as i64;
                if pos >= 0 && (pos as u64) < old.len() as u64 {
                    *byte = byte.wrapping_add(old[pos as usize]);
                }
            }
            sink.put(&buf[..n])?;
            old_pos = run_end;
            remaining -= n as u64;
        }
        new_pos += add_len;

        let copy_len = copy_len as u64;
        if new_pos + copy_len > header.new_size {
            return Err(PatchError::OutOfRange(format!(
                "extra run of {copy_len} at {new_pos} exceeds new size {}",
                header.new_size
            )));
        }
        let mut remaining = copy_len;
        while remaining > 0 {
            let n = remaining.min(RUN_CHUNK as u64) as usize;
            extra
                .read_exact(&mut buf[..n])
                .map_err(|e| PatchError::codec("extra stream", e))?;
            sink.put(&buf[..n])?;
            remaining -= n as u64;
        }
        new_pos += copy_len;

        old_pos = old_pos
            .checked_add(seek)
            .ok_or_else(|| PatchError::CorruptHeader(format!("seek overflow: {seek}")))?;
    }

    debug!(new_size = header.new_size, old_size = old.len(), "block patch applied");
    Ok(header.new_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsdiff::bz_compress;
    use crate::generate_block_patch;
    use crate::le::write_offtout;

    /// Assembles a patch from raw control triples and streams.
    fn raw_patch(controls: &[(i64, i64, i64)], diff: &[u8], extra: &[u8], new_size: i64) -> Vec<u8> {
        let mut ctrl = Vec::new();
        for &(add, copy, seek) in controls {
            ctrl.extend_from_slice(&write_offtout(add));
            ctrl.extend_from_slice(&write_offtout(copy));
            ctrl.extend_from_slice(&write_offtout(seek));
        }
        let ctrl = bz_compress("control stream", &ctrl).unwrap();
        let diff = bz_compress("diff stream", diff).unwrap();
        let extra = bz_compress("extra stream", extra).unwrap();

        let mut patch = BSDIFF_MAGIC.to_vec();
        patch.extend_from_slice(&write_offtout(ctrl.len() as i64));
        patch.extend_from_slice(&write_offtout(diff.len() as i64));
        patch.extend_from_slice(&write_offtout(new_size));
        patch.extend_from_slice(&ctrl);
        patch.extend_from_slice(&diff);
        patch.extend_from_slice(&extra);
        patch
    }

    #[test]
    fn raw_patch_applies() {
        // Add two bytes over "ab", then copy "xy" verbatim.
        let patch = raw_patch(&[(2, 2, 0)], &[1, 1], b"xy", 4);
        let mut out = Vec::new();
        assert_eq!(apply_block_patch(&patch, b"ab", &mut out).unwrap(), 4);
        assert_eq!(out, b"bcxy");
    }

    #[test]
    fn seek_to_the_end_of_range_is_rejected() {
        let patch = raw_patch(&[(0, 0, i64::MAX), (4, 0, 0)], &[0; 4], b"", 4);
        let mut out = Vec::new();
        let err = apply_block_patch(&patch, b"old", &mut out).unwrap_err();
        assert!(matches!(err, PatchError::OutOfRange(_)));
        assert!(out.is_empty());

        let patch = raw_patch(&[(0, 0, i64::MAX), (0, 0, 1)], b"", b"", 1);
        let err = apply_block_patch(&patch, b"old", &mut Vec::<u8>::new()).unwrap_err();
        assert!(matches!(err, PatchError::CorruptHeader(_)));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut patch = vec![0u8; HEADER_LEN];
        patch[..8].copy_from_slice(b"BSDIFF41");
        let mut out = Vec::new();
        let err = apply_block_patch(&patch, b"old", &mut out).unwrap_err();
        assert!(matches!(err, PatchError::CorruptHeader(_)));
    }

    #[test]
    fn rejects_truncated_header() {
        let mut out = Vec::new();
        let err = apply_block_patch(b"BSDIFF40", b"", &mut out).unwrap_err();
        assert!(matches!(err, PatchError::CorruptHeader(_)));
    }

    #[test]
    fn rejects_streams_past_end() {
        let patch = generate_block_patch(b"hello world", b"hello there").unwrap();
        let truncated = &patch[..HEADER_LEN + 4];
        let mut out = Vec::new();
        let err = apply_block_patch(truncated, b"hello world", &mut out).unwrap_err();
        assert!(matches!(err, PatchError::CorruptHeader(_)));
    }

    #[test]
    fn reports_declared_size() {
        let patch = generate_block_patch(b"abc", b"abcdef").unwrap();
        assert_eq!(block_patch_new_size(&patch).unwrap(), 6);
    }

    #[test]
    fn corrupt_stream_is_codec_error() {
        let mut patch = generate_block_patch(b"0123456789", b"0123456789abc").unwrap();
        // Flip bytes inside the bzip2 control stream payload.
        for byte in &mut patch[HEADER_LEN + 10..HEADER_LEN + 20] {
            *byte ^= 0xFF;
        }
        let mut out = Vec::new();
        assert!(apply_block_patch(&patch, b"0123456789", &mut out).is_err());
    }
}
