use std::fs::File;
use std::os::unix::fs::FileExt;

use updatekit_patch::{PatchError, PatchSink, apply_block_patch, apply_image_patch};

use crate::{BLOCK_SIZE, BlockError, BlockSet};

/// Sequential writer over the ranges of a [`BlockSet`].
///
/// Owns its own handle to the target so it can be handed to another thread.
/// A dry-run writer tracks progress without touching the target.
#[derive(Debug)]
pub struct BlockWriter {
    file: File,
    set: BlockSet,
    range_index: usize,
    range_offset: u64,
    written: u64,
    dry_run: bool,
}

impl BlockWriter {
    pub fn new(file: &File, set: BlockSet) -> Result<Self, BlockError> {
        Ok(Self {
            file: file.try_clone()?,
            set,
            range_index: 0,
            range_offset: 0,
            written: 0,
            dry_run: false,
        })
    }

    /// Creates a writer that accepts data without writing it.
    pub fn dry_run(file: &File, set: BlockSet) -> Result<Self, BlockError> {
        let mut writer = Self::new(file, set)?;
        writer.dry_run = true;
        Ok(writer)
    }

    /// Writes as much of `data` as still fits; returns the bytes consumed.
    pub fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let mut consumed = 0usize;
        while consumed < data.len() {
            let Some(range) = self.set.ranges().get(self.range_index) else {
                break;
            };
            let range_len = range.count * BLOCK_SIZE;
            let room = range_len - self.range_offset;
            let n = room.min((data.len() - consumed) as u64) as usize;
            if !self.dry_run {
                let offset = range.start * BLOCK_SIZE + self.range_offset;
                self.file.write_all_at(&data[consumed..consumed + n], offset)?;
            }
            consumed += n;
            self.written += n as u64;
            self.range_offset += n as u64;
            if self.range_offset == range_len {
                self.range_index += 1;
                self.range_offset = 0;
            }
        }
        Ok(consumed)
    }

    pub fn is_done(&self) -> bool {
        self.written == self.expected_len()
    }

    pub fn total_written(&self) -> u64 {
        self.written
    }

    pub fn expected_len(&self) -> u64 {
        self.set.byte_len()
    }

    pub fn remaining(&self) -> u64 {
        self.expected_len() - self.written
    }

    pub fn block_set(&self) -> &BlockSet {
        &self.set
    }

    /// Checks that every block was written and syncs the target.
    pub fn finish(&self) -> Result<u64, BlockError> {
        if !self.is_done() {
            return Err(BlockError::ShortWrite {
                written: self.written,
                expected: self.expected_len(),
            });
        }
        if !self.dry_run {
            self.file.sync_data()?;
        }
        Ok(self.written)
    }
}

impl PatchSink for BlockWriter {
    fn put(&mut self, data: &[u8]) -> Result<(), PatchError> {
        if data.len() as u64 > self.remaining() {
            return Err(PatchError::OutOfRange(format!(
                "patch output exceeds target by {} bytes",
                data.len() as u64 - self.remaining()
            )));
        }
        self.write(data)?;
        Ok(())
    }
}

impl BlockSet {
    /// Applies a `BSDIFF40` patch against `old`, writing the result across
    /// this set.
    pub fn apply_diff_patch(&self, file: &File, patch: &[u8], old: &[u8]) -> Result<u64, BlockError> {
        let mut writer = BlockWriter::new(file, self.clone())?;
        apply_block_patch(patch, old, &mut writer)?;
        writer.finish()
    }

    /// Applies a `PKGDIFF0` image patch against `old`, writing the result
    /// across this set.
    pub fn apply_file_patch(&self, file: &File, patch: &[u8], old: &[u8]) -> Result<u64, BlockError> {
        let mut writer = BlockWriter::new(file, self.clone())?;
        apply_image_patch(patch, old, &mut writer)?;
        writer.finish()
    }
}
