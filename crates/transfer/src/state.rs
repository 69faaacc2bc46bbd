use tracing::debug;
use updatekit_blockset::BLOCK_SIZE;
use updatekit_stash::ContentStash;

use crate::{NewDataProducer, TransferError};

/// The four header fields that open a transfer list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScriptHeader {
    pub version: u32,
    pub total_blocks: u64,
    /// Zero means unlimited.
    pub max_stash_entries: u64,
    /// Zero means unlimited.
    pub max_stash_blocks: u64,
}

impl ScriptHeader {
    /// Parses the header at the top of `lines`.
    ///
    /// The fields are either on four lines or comma-joined on one line.
    /// Returns the header and the number of lines it occupied.
    pub fn parse<S: AsRef<str>>(lines: &[S]) -> Result<(Self, usize), TransferError> {
        let first = lines
            .first()
            .map(|l| l.as_ref().trim())
            .ok_or_else(|| TransferError::Header("empty transfer list".into()))?;

        let (fields, used): (Vec<&str>, usize) = if first.contains(',') {
            (first.split(',').map(str::trim).collect(), 1)
        } else {
            if lines.len() < 4 {
                return Err(TransferError::Header(format!(
                    "header needs 4 lines, found {}",
                    lines.len()
                )));
            }
            (lines[..4].iter().map(|l| l.as_ref().trim()).collect(), 4)
        };
        if fields.len() != 4 {
            return Err(TransferError::Header(format!(
                "header needs 4 fields, found {}",
                fields.len()
            )));
        }

        let number = |name: &str, value: &str| {
            value
                .parse::<u64>()
                .map_err(|e| TransferError::Header(format!("{name} {value:?}: {e}")))
        };
        let version = number("version", fields[0])?;
        let header = Self {
            version: u32::try_from(version)
                .ok()
                .filter(|&v| v > 0)
                .ok_or_else(|| TransferError::Header(format!("unsupported version {version}")))?,
            total_blocks: number("block count", fields[1])?,
            max_stash_entries: number("max stash entries", fields[2])?,
            max_stash_blocks: number("max stash blocks", fields[3])?,
        };
        debug!(?header, "transfer list header");
        Ok((header, used))
    }
}

/// Mutable state shared by every command of one script run.
#[derive(Debug)]
pub struct TransferState {
    pub header: ScriptHeader,
    /// Blocks written so far; only the interpreter thread updates it.
    pub written: u64,
    /// False for a verification pass that must not touch the target.
    pub can_write: bool,
    pub allow_file_erase: bool,
    pub stash: ContentStash,
    pub patch_data: Vec<u8>,
    pub(crate) new_data: Option<NewDataProducer>,
    stashed_entries: u64,
    stashed_blocks: u64,
}

impl TransferState {
    pub fn new(header: ScriptHeader, stash: ContentStash, can_write: bool) -> Self {
        Self {
            header,
            written: 0,
            can_write,
            allow_file_erase: false,
            stash,
            patch_data: Vec::new(),
            new_data: None,
            stashed_entries: 0,
            stashed_blocks: 0,
        }
    }

    pub fn with_patch_data(mut self, patch_data: Vec<u8>) -> Self {
        self.patch_data = patch_data;
        self
    }

    pub fn with_new_data(mut self, producer: NewDataProducer) -> Self {
        self.new_data = Some(producer);
        self
    }

    pub fn with_file_erase(mut self, allow: bool) -> Self {
        self.allow_file_erase = allow;
        self
    }

    /// Reserves room for a stash entry of `blocks` blocks.
    pub(crate) fn reserve_stash(&mut self, blocks: u64) -> Result<(), String> {
        let entries = self.stashed_entries + 1;
        let total = self.stashed_blocks + blocks;
        let limits = (self.header.max_stash_entries, self.header.max_stash_blocks);
        if limits.0 != 0 && entries > limits.0 {
            return Err(format!("stash would hold {entries} entries, limit {}", limits.0));
        }
        if limits.1 != 0 && total > limits.1 {
            return Err(format!("stash would hold {total} blocks, limit {}", limits.1));
        }
        self.stashed_entries = entries;
        self.stashed_blocks = total;
        Ok(())
    }

    /// Counts entries already on disk toward the stash limits.
    pub(crate) fn count_existing_stash(&mut self) -> Result<(), TransferError> {
        for id in self.stash.entries()? {
            let blocks = self.stash.entry_len(&id).unwrap_or(0) / BLOCK_SIZE;
            self.stashed_entries += 1;
            self.stashed_blocks += blocks;
        }
        debug!(
            entries = self.stashed_entries,
            blocks = self.stashed_blocks,
            "existing stash counted"
        );
        Ok(())
    }

    pub(crate) fn release_stash(&mut self, blocks: u64) {
        self.stashed_entries = self.stashed_entries.saturating_sub(1);
        self.stashed_blocks = self.stashed_blocks.saturating_sub(blocks);
    }

    /// Stops the unpack thread, if one is running.
    pub(crate) fn finish_new_data(&mut self) -> Result<(), TransferError> {
        if let Some(producer) = self.new_data.take() {
            let consumed = producer.finish().map_err(TransferError::Producer)?;
            debug!(consumed, "new data stream closed");
        }
        Ok(())
    }
}
