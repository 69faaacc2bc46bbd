//! Little-endian type/length/value records.
//!
//! Two header shapes are used:
//!
//! ```text
//! HH: u16 type | u16 length | value
//! HI: u16 type | u32 length | value
//! ```

use crate::PackageError;

pub const TAG_PARTITION_COUNT: u16 = 0x0001;
pub const TAG_PARTITION_NAME: u16 = 0x0002;
pub const TAG_PARTITION_HASH: u16 = 0x0003;
pub const TAG_DATA_LENGTH: u16 = 0x0004;
pub const TAG_SIGNATURE: u16 = 0x0005;

const HH_LEN: usize = 4;
const HI_LEN: usize = 6;

/// One decoded record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    pub tag: u16,
    pub value: &'a [u8],
    /// Header plus value, as they appeared in the input.
    pub raw: &'a [u8],
}

impl<'a> Record<'a> {
    /// Fails unless the record carries `tag`.
    pub fn expect(self, tag: u16) -> Result<Self, PackageError> {
        if self.tag != tag {
            return Err(PackageError::Tlv(format!(
                "expected tag {tag:#06x}, found {:#06x}",
                self.tag
            )));
        }
        Ok(self)
    }

    pub fn as_u16(&self) -> Result<u16, PackageError> {
        let bytes: [u8; 2] = self
            .value
            .try_into()
            .map_err(|_| PackageError::Tlv(format!("u16 value has {} bytes", self.value.len())))?;
        Ok(u16::from_le_bytes(bytes))
    }

    pub fn as_u64(&self) -> Result<u64, PackageError> {
        let bytes: [u8; 8] = self
            .value
            .try_into()
            .map_err(|_| PackageError::Tlv(format!("u64 value has {} bytes", self.value.len())))?;
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn as_str(&self) -> Result<&'a str, PackageError> {
        std::str::from_utf8(self.value).map_err(|e| PackageError::Tlv(format!("bad string: {e}")))
    }
}

/// Sequential record reader over a byte slice.
#[derive(Debug)]
pub struct TlvReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> TlvReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, header_len: usize, value_len: usize) -> Result<Record<'a>, PackageError> {
        let end = self
            .pos
            .checked_add(header_len + value_len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                PackageError::Tlv(format!(
                    "record at {} needs {} bytes, {} left",
                    self.pos,
                    header_len + value_len,
                    self.remaining()
                ))
            })?;
        let raw = &self.data[self.pos..end];
        self.pos = end;
        Ok(Record {
            tag: u16::from_le_bytes([raw[0], raw[1]]),
            value: &raw[header_len..],
            raw,
        })
    }

    fn header(&self, len: usize) -> Result<&'a [u8], PackageError> {
        self.data
            .get(self.pos..self.pos + len)
            .ok_or_else(|| PackageError::Tlv(format!("truncated header at {}", self.pos)))
    }

    /// Reads a record with a 16-bit length.
    pub fn read_hh(&mut self) -> Result<Record<'a>, PackageError> {
        let h = self.header(HH_LEN)?;
        let len = u16::from_le_bytes([h[2], h[3]]) as usize;
        self.take(HH_LEN, len)
    }

    /// Reads a record with a 32-bit length.
    pub fn read_hi(&mut self) -> Result<Record<'a>, PackageError> {
        let h = self.header(HI_LEN)?;
        let len = u32::from_le_bytes([h[2], h[3], h[4], h[5]]) as usize;
        self.take(HI_LEN, len)
    }
}

pub fn write_hh(out: &mut Vec<u8>, tag: u16, value: &[u8]) -> Result<(), PackageError> {
    let len = u16::try_from(value.len())
        .map_err(|_| PackageError::Tlv(format!("value of {} bytes exceeds u16", value.len())))?;
    out.extend_from_slice(&tag.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(value);
    Ok(())
}

pub fn write_hi(out: &mut Vec<u8>, tag: u16, value: &[u8]) -> Result<(), PackageError> {
    let len = u32::try_from(value.len())
        .map_err(|_| PackageError::Tlv(format!("value of {} bytes exceeds u32", value.len())))?;
    out.extend_from_slice(&tag.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(value);
    Ok(())
}
