use std::fs::File;
use std::io;
use std::os::unix::fs::{FileExt, FileTypeExt};

use tracing::{debug, warn};

use crate::{BLOCK_SIZE, BlockError, BlockSet};

/// Zero writes are issued in runs of this many bytes.
const ZERO_CHUNK: usize = 256 * BLOCK_SIZE as usize;

/// True when `file` refers to a block device node.
pub fn is_block_device(file: &File) -> bool {
    file.metadata()
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false)
}

#[cfg(target_os = "linux")]
fn discard(file: &File, offset: u64, len: u64) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    // _IO(0x12, 119)
    const BLKDISCARD: u64 = 0x1277;
    let range: [u64; 2] = [offset, len];
    // SAFETY: BLKDISCARD reads a `[u64; 2]` that lives for the whole call.
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKDISCARD as _, &range as *const [u64; 2]) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn discard(_file: &File, _offset: u64, _len: u64) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

impl BlockSet {
    fn check_buffer(&self, len: usize) -> Result<(), BlockError> {
        if (len as u64) < self.byte_len() {
            return Err(BlockError::ShortBuffer {
                needed: self.byte_len(),
                actual: len as u64,
            });
        }
        Ok(())
    }

    /// Reads every range, in order, into the front of `buf`.
    ///
    /// A failed read is reported as `Ok(0)`: callers treat that as "could
    /// not load" and decide whether a stash copy can stand in.
    pub fn read_from_device(&self, file: &File, buf: &mut [u8]) -> Result<usize, BlockError> {
        self.check_buffer(buf.len())?;

        let mut pos = 0usize;
        for range in self.ranges() {
            let len = (range.count * BLOCK_SIZE) as usize;
            let offset = range.start * BLOCK_SIZE;
            if let Err(e) = file.read_exact_at(&mut buf[pos..pos + len], offset) {
                warn!(offset, len, error = %e, "block read failed");
                return Ok(0);
            }
            pos += len;
        }
        Ok(pos)
    }

    /// Writes the front of `buf` across every range, in order.
    pub fn write_to_device(&self, file: &File, buf: &[u8]) -> Result<usize, BlockError> {
        self.check_buffer(buf.len())?;

        let mut pos = 0usize;
        for range in self.ranges() {
            let len = (range.count * BLOCK_SIZE) as usize;
            file.write_all_at(&buf[pos..pos + len], range.start * BLOCK_SIZE)?;
            pos += len;
        }
        Ok(pos)
    }

    /// Zero-fills every range.
    ///
    /// With `is_erase` on a block device each range is discarded instead,
    /// falling back to zero writes when the device rejects the discard. An
    /// erase on a regular file is refused unless `allow_file_erase` is set.
    pub fn write_zero(
        &self,
        file: &File,
        is_erase: bool,
        allow_file_erase: bool,
    ) -> Result<(), BlockError> {
        let block_device = is_block_device(file);
        if is_erase && !block_device && !allow_file_erase {
            return Err(BlockError::NotBlockDevice);
        }

        let zeros = vec![0u8; ZERO_CHUNK.min(self.byte_len() as usize)];
        for range in self.ranges() {
            let offset = range.start * BLOCK_SIZE;
            let len = range.count * BLOCK_SIZE;

            if is_erase && block_device {
                match discard(file, offset, len) {
                    Ok(()) => {
                        debug!(offset, len, "range discarded");
                        continue;
                    }
                    Err(e) => warn!(offset, len, error = %e, "discard failed, writing zeros"),
                }
            }

            let mut done = 0u64;
            while done < len {
                let n = (len - done).min(zeros.len() as u64) as usize;
                file.write_all_at(&zeros[..n], offset + done)?;
                done += n as u64;
            }
        }
        Ok(())
    }
}
