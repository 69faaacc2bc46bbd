//! Little-endian field decoding over validated slices.

use crate::PatchError;

fn field<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N], PatchError> {
    offset
        .checked_add(N)
        .and_then(|end| buf.get(offset..end))
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| {
            PatchError::CorruptHeader(format!(
                "need {N} bytes at offset {offset}, have {}",
                buf.len()
            ))
        })
}

/// Reads a little-endian `u16` at `offset`.
pub fn read_le16(buf: &[u8], offset: usize) -> Result<u16, PatchError> {
    field::<2>(buf, offset).map(u16::from_le_bytes)
}

/// Reads a little-endian `u32` at `offset`.
pub fn read_le32(buf: &[u8], offset: usize) -> Result<u32, PatchError> {
    field::<4>(buf, offset).map(u32::from_le_bytes)
}

/// Reads a little-endian `u64` at `offset`.
pub fn read_le64(buf: &[u8], offset: usize) -> Result<u64, PatchError> {
    field::<8>(buf, offset).map(u64::from_le_bytes)
}

/// Reads a bsdiff sign-magnitude integer: 63 magnitude bits, sign in the top
/// bit of the last byte.
pub fn read_offtin(buf: &[u8], offset: usize) -> Result<i64, PatchError> {
    let bytes = field::<8>(buf, offset)?;
    let magnitude = (u64::from_le_bytes(bytes) & !(1 << 63)) as i64;
    if bytes[7] & 0x80 != 0 {
        Ok(-magnitude)
    } else {
        Ok(magnitude)
    }
}

/// Encodes `value` in bsdiff sign-magnitude form.
pub fn write_offtout(value: i64) -> [u8; 8] {
    let mut bytes = value.unsigned_abs().to_le_bytes();
    if value < 0 {
        bytes[7] |= 0x80;
    }
    bytes
}

/// Sequential reader over a patch blob.
#[derive(Debug)]
pub struct LeCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> LeCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current read offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn u32(&mut self) -> Result<u32, PatchError> {
        let value = read_le32(self.buf, self.pos)?;
        self.pos += 4;
        Ok(value)
    }

    pub fn i32(&mut self) -> Result<i32, PatchError> {
        self.u32().map(|v| v as i32)
    }

    pub fn u64(&mut self) -> Result<u64, PatchError> {
        let value = read_le64(self.buf, self.pos)?;
        self.pos += 8;
        Ok(value)
    }

    /// Borrows the next `len` bytes.
    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], PatchError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                PatchError::CorruptHeader(format!(
                    "need {len} bytes at offset {}, have {}",
                    self.pos,
                    self.buf.len()
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}
