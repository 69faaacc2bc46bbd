//! Assembly of a command's source buffer from the device and the stash.
//!
//! Accepted forms, starting at the source block count:
//!
//! ```text
//! <blocks> <range>
//! <blocks> - <id>:<locs> [<id>:<locs> ...]
//! <blocks> <range> <locs> [<id>:<locs> ...]
//! ```
//!
//! `<locs>` are block positions inside the source buffer. In the last form
//! the device blocks of `<range>` are scattered to `<locs>` and each stash
//! entry fills its own `<locs>`.

use std::fs::File;

use tracing::{debug, warn};
use updatekit_blockset::{BLOCK_SIZE, BlockSet};
use updatekit_stash::ContentStash;

use crate::handlers::HandlerError;
use crate::{Command, CommandError};

/// Source bytes for one command.
#[derive(Debug)]
pub(crate) struct SourceBuffer {
    pub data: Vec<u8>,
    pub blocks: u64,
    /// Device blocks the buffer was read from, if any.
    pub device: Option<BlockSet>,
}

fn scatter(cmd: &Command, buffer: &mut [u8], locs: &BlockSet, data: &[u8]) -> Result<(), CommandError> {
    let mut pos = 0usize;
    for range in locs.ranges() {
        let start = (range.start * BLOCK_SIZE) as usize;
        let len = (range.count * BLOCK_SIZE) as usize;
        let slot = buffer
            .get_mut(start..start + len)
            .ok_or_else(|| cmd.bad(&locs.to_string(), "locations exceed source buffer"))?;
        let piece = data
            .get(pos..pos + len)
            .ok_or_else(|| cmd.bad(&locs.to_string(), "locations exceed source data"))?;
        slot.copy_from_slice(piece);
        pos += len;
    }
    Ok(())
}

/// Reads the source described at argument `pos` (the block count).
pub(crate) fn load_source(
    cmd: &Command,
    pos: usize,
    file: &File,
    stash: &ContentStash,
) -> Result<SourceBuffer, HandlerError> {
    let blocks = cmd.u64_arg(pos)?;
    let mut data = vec![0u8; (blocks * BLOCK_SIZE) as usize];
    let first = cmd.arg(pos + 1)?;

    let (device, pieces_from) = if first == "-" {
        (None, pos + 2)
    } else {
        let range = BlockSet::parse(first).map_err(CommandError::from)?;
        if range.total_blocks() > blocks {
            return Err(cmd.bad(first, format_args!("more than {blocks} source blocks")).into());
        }
        let mut raw = vec![0u8; range.byte_len() as usize];
        if range.read_from_device(file, &mut raw)? == 0 {
            warn!(index = cmd.index(), range = %range, "source blocks unreadable");
        }

        match cmd.args().get(pos + 2) {
            Some(locs) => {
                let locs = BlockSet::parse(locs).map_err(CommandError::from)?;
                if locs.total_blocks() != range.total_blocks() {
                    return Err(cmd.bad(&locs.to_string(), "location count differs from range").into());
                }
                scatter(cmd, &mut data, &locs, &raw)?;
                (Some(range), pos + 3)
            }
            None => {
                data[..raw.len()].copy_from_slice(&raw);
                (Some(range), pos + 2)
            }
        }
    };

    for piece in cmd.args().iter().skip(pieces_from) {
        let (id, locs) = piece
            .split_once(':')
            .ok_or_else(|| cmd.bad(piece, "expected <id>:<locations>"))?;
        let locs = BlockSet::parse(locs).map_err(CommandError::from)?;
        let mut stashed = vec![0u8; locs.byte_len() as usize];
        if stash.load(id, &mut stashed)? == 0 {
            warn!(index = cmd.index(), id, "stash piece missing");
            continue;
        }
        scatter(cmd, &mut data, &locs, &stashed)?;
        debug!(index = cmd.index(), id, blocks = locs.total_blocks(), "stash piece loaded");
    }

    Ok(SourceBuffer { data, blocks, device })
}
