use std::fs::File;

use tracing::{debug, error, info, warn};
use updatekit_blockset::{BLOCK_SIZE, BlockError, BlockSet, BlockWriter, verify_sha256};
use updatekit_patch::{PatchError, apply_block_patch, apply_image_patch};
use updatekit_stash::StashError;

use crate::source::load_source;
use crate::{Command, CommandError, CommandType, HandoffError, TransferState};

/// Outcome of one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandResult {
    Success,
    Failed,
    /// The device reported `EIO`; a later session should retry.
    NeedRetry,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum HandlerError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    Stash(#[from] StashError),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Handoff(#[from] HandoffError),

    #[error("verification failed: {0}")]
    Verify(String),

    #[error("stash limit reached: {0}")]
    Limit(String),

    #[error("no new data stream attached")]
    NoNewData,
}

impl HandlerError {
    fn is_eio(&self) -> bool {
        let io = match self {
            Self::Block(e) | Self::Command(CommandError::Block(e)) => return e.is_eio(),
            Self::Handoff(e) => return e.is_eio(),
            Self::Stash(StashError::Io(e)) | Self::Patch(PatchError::Io(e)) => e,
            _ => return false,
        };
        io.raw_os_error() == Some(libc::EIO)
    }
}

/// Runs one command against `target`.
///
/// Failures never escape as errors; they are logged and folded into the
/// returned [`CommandResult`].
pub fn execute(cmd: &Command, target: &File, state: &mut TransferState) -> CommandResult {
    let outcome = match cmd.kind() {
        CommandType::Abort | CommandType::Last => Ok(()),
        CommandType::New => write_new_data(cmd, target, state),
        CommandType::Zero | CommandType::Erase => zero_or_erase(cmd, target, state),
        CommandType::Move | CommandType::Copy | CommandType::Bsdiff | CommandType::Imgdiff => {
            diff_or_move(cmd, target, state)
        }
        CommandType::Stash => stash(cmd, target, state),
        CommandType::Free => free(cmd, state),
    };

    match outcome {
        Ok(()) => CommandResult::Success,
        Err(e) if e.is_eio() => {
            error!(index = cmd.index(), verb = %cmd.kind(), error = %e, "device I/O error, retry needed");
            CommandResult::NeedRetry
        }
        Err(e) => {
            error!(index = cmd.index(), line = cmd.line(), error = %e, "command failed");
            CommandResult::Failed
        }
    }
}

// ---------------------------------------------------------------------------
// new / zero / erase
// ---------------------------------------------------------------------------

fn write_new_data(cmd: &Command, target: &File, state: &mut TransferState) -> Result<(), HandlerError> {
    let set = cmd.block_set_arg(0)?;
    let producer = state.new_data.as_ref().ok_or(HandlerError::NoNewData)?;
    let writer = if state.can_write {
        BlockWriter::new(target, set.clone())?
    } else {
        BlockWriter::dry_run(target, set.clone())?
    };

    match producer.write(writer) {
        Ok(bytes) => debug!(index = cmd.index(), bytes, "new data applied"),
        Err(e) => {
            if let HandoffError::Starved { written, expected } = &e {
                error!(index = cmd.index(), lost = expected - written, "new data ran out");
            }
            return Err(e.into());
        }
    }
    state.written += set.total_blocks();
    Ok(())
}

fn zero_or_erase(cmd: &Command, target: &File, state: &mut TransferState) -> Result<(), HandlerError> {
    let set = cmd.block_set_arg(0)?;
    let is_erase = cmd.kind() == CommandType::Erase;
    if state.can_write {
        set.write_zero(target, is_erase, state.allow_file_erase)?;
    }
    // Erased blocks carry no content, so they do not count as written.
    if !is_erase {
        state.written += set.total_blocks();
    }
    debug!(index = cmd.index(), verb = %cmd.kind(), blocks = set.total_blocks(), "blocks cleared");
    Ok(())
}

// ---------------------------------------------------------------------------
// move / copy / bsdiff / imgdiff
// ---------------------------------------------------------------------------

fn patch_window<'a>(cmd: &Command, state: &'a TransferState) -> Result<&'a [u8], HandlerError> {
    let offset = cmd.u64_arg(0)?;
    let len = cmd.u64_arg(1)?;
    offset
        .checked_add(len)
        .and_then(|end| state.patch_data.get(offset as usize..end as usize))
        .ok_or_else(|| {
            cmd.bad(
                &format!("{offset}+{len}"),
                format_args!("outside {} bytes of patch data", state.patch_data.len()),
            )
            .into()
        })
}

fn diff_or_move(cmd: &Command, target: &File, state: &mut TransferState) -> Result<(), HandlerError> {
    let kind = cmd.kind();
    let is_move = matches!(kind, CommandType::Move | CommandType::Copy);
    let (src_hash, tgt_hash, mut pos) = if is_move {
        (cmd.arg(0)?, cmd.arg(0)?, 1)
    } else {
        (cmd.arg(2)?, cmd.arg(3)?, 4)
    };
    let tgt = cmd.block_set_arg(pos)?;
    pos += 1;

    let mut current = vec![0u8; tgt.byte_len() as usize];
    if tgt.read_from_device(target, &mut current)? == 0 {
        return Err(HandlerError::Verify(format!("target {tgt} unreadable")));
    }
    if verify_sha256(&current, tgt.total_blocks(), tgt_hash) {
        info!(index = cmd.index(), verb = %kind, "target already up to date");
        return Ok(());
    }
    drop(current);

    let source = load_source(cmd, pos, target, &state.stash)?;
    let source_data = if verify_sha256(&source.data, source.blocks, src_hash) {
        source.data
    } else {
        recover_from_stash(cmd, state, src_hash, source.blocks)?
    };

    if state.can_write {
        if let Some(device) = &source.device {
            if device.overlaps(&tgt) && !state.stash.contains(src_hash) {
                state
                    .reserve_stash(source.blocks)
                    .map_err(HandlerError::Limit)?;
                state.stash.store(src_hash, &source_data)?;
                debug!(index = cmd.index(), id = src_hash, "overlapping source stashed");
            }
        }

        if is_move {
            tgt.write_to_device(target, &source_data)?;
        } else if kind == CommandType::Imgdiff {
            tgt.apply_file_patch(target, patch_window(cmd, state)?, &source_data)?;
        } else {
            tgt.apply_diff_patch(target, patch_window(cmd, state)?, &source_data)?;
        }
        target.sync_data().map_err(BlockError::from)?;

        let mut written = vec![0u8; tgt.byte_len() as usize];
        tgt.read_from_device(target, &mut written)?;
        if !verify_sha256(&written, tgt.total_blocks(), tgt_hash) {
            return Err(HandlerError::Verify(format!("target {tgt} does not match {tgt_hash} after write")));
        }

        if let Some(len) = state.stash.entry_len(src_hash) {
            state.release_stash(len / BLOCK_SIZE);
            state.stash.free(src_hash)?;
        }
    } else {
        let produced = if is_move {
            source_data
        } else {
            let mut out = Vec::with_capacity(tgt.byte_len() as usize);
            let patch = patch_window(cmd, state)?;
            if kind == CommandType::Imgdiff {
                apply_image_patch(patch, &source_data, &mut out)?;
            } else {
                apply_block_patch(patch, &source_data, &mut out)?;
            }
            out
        };
        if produced.len() as u64 != tgt.byte_len() || !verify_sha256(&produced, tgt.total_blocks(), tgt_hash) {
            return Err(HandlerError::Verify(format!("patched output does not match {tgt_hash}")));
        }
    }

    state.written += tgt.total_blocks();
    info!(index = cmd.index(), verb = %kind, blocks = tgt.total_blocks(), "target written");
    Ok(())
}

fn recover_from_stash(
    cmd: &Command,
    state: &TransferState,
    src_hash: &str,
    blocks: u64,
) -> Result<Vec<u8>, HandlerError> {
    warn!(index = cmd.index(), id = src_hash, "source hash mismatch, trying stash");
    let mut buf = vec![0u8; (blocks * BLOCK_SIZE) as usize];
    if state.stash.load(src_hash, &mut buf)? == buf.len() && verify_sha256(&buf, blocks, src_hash) {
        info!(index = cmd.index(), id = src_hash, "source recovered from stash");
        return Ok(buf);
    }
    Err(HandlerError::Verify(format!("source does not match {src_hash} and no stash copy")))
}

// ---------------------------------------------------------------------------
// stash / free
// ---------------------------------------------------------------------------

fn stash(cmd: &Command, target: &File, state: &mut TransferState) -> Result<(), HandlerError> {
    let id = cmd.arg(0)?;
    let set = cmd.block_set_arg(1)?;

    if state.stash.entry_len(id) == Some(set.byte_len()) {
        info!(index = cmd.index(), id, "already stashed");
        return Ok(());
    }

    let mut buf = vec![0u8; set.byte_len() as usize];
    if set.read_from_device(target, &mut buf)? == 0 {
        return Err(HandlerError::Verify(format!("stash source {set} unreadable")));
    }
    if !verify_sha256(&buf, set.total_blocks(), id) {
        if !state.can_write {
            warn!(index = cmd.index(), id, "stash source mismatch during verification pass, skipped");
            return Ok(());
        }
        return Err(HandlerError::Verify(format!("stash source {set} does not match {id}")));
    }

    state
        .reserve_stash(set.total_blocks())
        .map_err(HandlerError::Limit)?;
    state.stash.store(id, &buf)?;
    info!(index = cmd.index(), id, blocks = set.total_blocks(), "blocks stashed");
    Ok(())
}

fn free(cmd: &Command, state: &mut TransferState) -> Result<(), HandlerError> {
    let id = cmd.arg(0)?;
    if !state.stash.created() {
        debug!(index = cmd.index(), id, "stash predates this session, keeping entry");
        return Ok(());
    }
    if let Some(len) = state.stash.entry_len(id) {
        state.release_stash(len / BLOCK_SIZE);
    }
    state.stash.free(id)?;
    Ok(())
}

/// Blocks named by a command's target argument, for logging and tests.
pub(crate) fn target_blocks(cmd: &Command) -> Option<BlockSet> {
    let pos = match cmd.kind() {
        CommandType::New | CommandType::Zero | CommandType::Erase => 0,
        CommandType::Move | CommandType::Copy => 1,
        CommandType::Bsdiff | CommandType::Imgdiff => 4,
        _ => return None,
    };
    cmd.block_set_arg(pos).ok()
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};
    use std::os::unix::fs::FileExt;

    use updatekit_blockset::checksum_bytes;
    use updatekit_patch::{DeflateParams, ImagePatchBuilder, compress_deflate, generate_block_patch};
    use updatekit_stash::ContentStash;

    use super::*;
    use crate::{NewDataProducer, ScriptHeader};

    const BS: usize = BLOCK_SIZE as usize;

    struct Fixture {
        _image: tempfile::NamedTempFile,
        _work: tempfile::TempDir,
        file: File,
        state: TransferState,
    }

    fn fixture(blocks: usize, can_write: bool) -> Fixture {
        let mut image = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..blocks * BS).map(|i| (i / BS) as u8 + 1).collect();
        image.write_all(&data).unwrap();
        let file = image.reopen().unwrap();

        let work = tempfile::tempdir().unwrap();
        let stash = ContentStash::create_space(work.path().join("stash"), true).unwrap();
        let header = ScriptHeader {
            version: 4,
            total_blocks: blocks as u64,
            max_stash_entries: 0,
            max_stash_blocks: 0,
        };
        Fixture {
            _image: image,
            _work: work,
            file,
            state: TransferState::new(header, stash, can_write),
        }
    }

    fn run(f: &mut Fixture, line: &str) -> CommandResult {
        let cmd = Command::parse(0, line).unwrap().unwrap();
        execute(&cmd, &f.file, &mut f.state)
    }

    fn read(f: &Fixture, descriptor: &str) -> Vec<u8> {
        let set = BlockSet::parse(descriptor).unwrap();
        let mut buf = vec![0u8; set.byte_len() as usize];
        set.read_from_device(&f.file, &mut buf).unwrap();
        buf
    }

    fn hash(f: &Fixture, descriptor: &str) -> String {
        checksum_bytes(&read(f, descriptor))
    }

    #[test]
    fn abort_and_padding_succeed() {
        let mut f = fixture(1, true);
        assert_eq!(run(&mut f, "abort"), CommandResult::Success);
        assert_eq!(run(&mut f, "whatever 1 2 3"), CommandResult::Success);
        assert_eq!(f.state.written, 0);
    }

    #[test]
    fn zero_advances_written_but_erase_does_not() {
        let mut f = fixture(12, true);
        assert_eq!(run(&mut f, "zero 2,0,10"), CommandResult::Success);
        assert!(read(&f, "2,0,10").iter().all(|&b| b == 0));
        assert_eq!(read(&f, "2,10,11")[0], 11);
        assert_eq!(f.state.written, 10);

        // Regular file: erase is refused unless explicitly allowed.
        assert_eq!(run(&mut f, "erase 2,10,12"), CommandResult::Failed);
        f.state.allow_file_erase = true;
        assert_eq!(run(&mut f, "erase 2,10,12"), CommandResult::Success);
        assert!(read(&f, "2,10,12").iter().all(|&b| b == 0));
        assert_eq!(f.state.written, 10);
    }

    #[test]
    fn move_copies_source_to_target() {
        let mut f = fixture(8, true);
        let src_hash = hash(&f, "2,0,2");
        let line = format!("move {src_hash} 2,4,6 2 2,0,2");
        assert_eq!(run(&mut f, &line), CommandResult::Success);
        assert_eq!(read(&f, "2,4,6"), read(&f, "2,0,2"));
        assert_eq!(f.state.written, 2);
    }

    #[test]
    fn move_short_circuits_when_target_matches() {
        let mut f = fixture(8, true);
        let tgt_hash = hash(&f, "2,4,6");
        // The source range is past the end of the image; it must not be read.
        let line = format!("move {tgt_hash} 2,4,6 2 2,100,102");
        assert_eq!(run(&mut f, &line), CommandResult::Success);
        assert_eq!(f.state.written, 0);
    }

    #[test]
    fn move_with_bad_source_and_no_stash_fails() {
        let mut f = fixture(8, true);
        let line = format!("move {} 2,4,6 2 2,0,2", "0".repeat(64));
        assert_eq!(run(&mut f, &line), CommandResult::Failed);
    }

    #[test]
    fn move_recovers_source_from_stash() {
        let mut f = fixture(8, true);
        let original = read(&f, "2,0,2");
        let src_hash = checksum_bytes(&original);
        f.state.stash.store(&src_hash, &original).unwrap();
        f.file.write_all_at(&vec![0xEE; 2 * BS], 0).unwrap();

        let line = format!("move {src_hash} 2,4,6 2 2,0,2");
        assert_eq!(run(&mut f, &line), CommandResult::Success);
        assert_eq!(read(&f, "2,4,6"), original);
        assert!(!f.state.stash.contains(&src_hash));
    }

    #[test]
    fn overlapping_move_is_stashed_then_freed() {
        let mut f = fixture(8, true);
        let original = read(&f, "2,0,3");
        let src_hash = checksum_bytes(&original);
        let line = format!("move {src_hash} 2,1,4 3 2,0,3");

        assert_eq!(run(&mut f, &line), CommandResult::Success);
        assert_eq!(read(&f, "2,1,4"), original);
        assert!(f.state.stash.entries().unwrap().is_empty());
    }

    #[test]
    fn bsdiff_applies_patch_window() {
        let mut f = fixture(8, true);
        let old = read(&f, "2,0,2");
        let mut new = old.clone();
        new[100..200].fill(0xAB);
        let patch = generate_block_patch(&old, &new).unwrap();

        let mut patch_data = vec![0u8; 17];
        patch_data.extend_from_slice(&patch);
        f.state.patch_data = patch_data;

        let line = format!(
            "bsdiff 17 {} {} {} 2,5,7 2 2,0,2",
            patch.len(),
            checksum_bytes(&old),
            checksum_bytes(&new)
        );
        assert_eq!(run(&mut f, &line), CommandResult::Success);
        assert_eq!(read(&f, "2,5,7"), new);
        assert_eq!(f.state.written, 2);
    }

    #[test]
    fn imgdiff_repacks_deflate_member() {
        let mut f = fixture(8, true);
        let member: Vec<u8> = b"old contents ".repeat(300);
        let packed = compress_deflate(DeflateParams::raw(6), &member).unwrap();
        let mut old = packed.clone();
        old.resize(BS, 0);
        f.file.write_all_at(&old, 0).unwrap();

        let updated: Vec<u8> = b"new contents ".repeat(300);
        let repacked = compress_deflate(DeflateParams::raw(6), &updated).unwrap();
        let mut new = repacked.clone();
        new.resize(BS, 0);
        let mut builder = ImagePatchBuilder::new();
        builder
            .deflate(&old, 0..packed.len() as u64, DeflateParams::raw(6), &updated)
            .unwrap();
        builder.raw(&new[repacked.len()..]);
        let patch = builder.build();
        f.state.patch_data = patch.clone();

        let line = format!(
            "imgdiff 0 {} {} {} 2,3,4 1 2,0,1",
            patch.len(),
            checksum_bytes(&old),
            checksum_bytes(&new)
        );
        assert_eq!(run(&mut f, &line), CommandResult::Success);
        assert_eq!(read(&f, "2,3,4"), new);
    }

    #[test]
    fn patch_window_outside_data_fails() {
        let mut f = fixture(4, true);
        let old = read(&f, "2,0,1");
        let line = format!(
            "bsdiff 0 999 {} {} 2,2,3 1 2,0,1",
            checksum_bytes(&old),
            "1".repeat(64)
        );
        assert_eq!(run(&mut f, &line), CommandResult::Failed);
    }

    #[test]
    fn dry_run_verifies_without_writing() {
        let mut f = fixture(8, false);
        let old = read(&f, "2,0,2");
        let mut new = old.clone();
        new[0] = 0;
        let patch = generate_block_patch(&old, &new).unwrap();
        f.state.patch_data = patch.clone();
        let before = read(&f, "2,4,6");

        let line = format!(
            "bsdiff 0 {} {} {} 2,4,6 2 2,0,2",
            patch.len(),
            checksum_bytes(&old),
            checksum_bytes(&new)
        );
        assert_eq!(run(&mut f, &line), CommandResult::Success);
        assert_eq!(read(&f, "2,4,6"), before);
        assert_eq!(f.state.written, 2);

        let wrong = format!(
            "bsdiff 0 {} {} {} 2,4,6 2 2,0,2",
            patch.len(),
            checksum_bytes(&old),
            "2".repeat(64)
        );
        assert_eq!(run(&mut f, &wrong), CommandResult::Failed);
    }

    #[test]
    fn stash_and_free() {
        let mut f = fixture(4, true);
        let id = hash(&f, "2,1,3");
        assert_eq!(run(&mut f, &format!("stash {id} 2,1,3")), CommandResult::Success);
        assert!(f.state.stash.contains(&id));
        assert_eq!(run(&mut f, &format!("stash {id} 2,1,3")), CommandResult::Success);

        assert_eq!(run(&mut f, &format!("free {id}")), CommandResult::Success);
        assert!(!f.state.stash.contains(&id));
    }

    #[test]
    fn stash_mismatch_fails_unless_verifying() {
        let mut f = fixture(4, true);
        let bogus = "3".repeat(64);
        assert_eq!(run(&mut f, &format!("stash {bogus} 2,0,1")), CommandResult::Failed);

        f.state.can_write = false;
        assert_eq!(run(&mut f, &format!("stash {bogus} 2,0,1")), CommandResult::Success);
        assert!(!f.state.stash.contains(&bogus));
    }

    #[test]
    fn stash_limit_enforced() {
        let mut f = fixture(4, true);
        f.state.header.max_stash_blocks = 1;
        let id = hash(&f, "2,0,2");
        assert_eq!(run(&mut f, &format!("stash {id} 2,0,2")), CommandResult::Failed);
    }

    #[test]
    fn free_keeps_entries_of_an_older_stash() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("stash");
        ContentStash::create_space(&base, true).unwrap().store("abcd", b"x").unwrap();

        let mut f = fixture(1, true);
        f.state.stash = ContentStash::create_space(&base, false).unwrap();
        assert_eq!(run(&mut f, "free abcd"), CommandResult::Success);
        assert!(f.state.stash.contains("abcd"));
    }

    #[test]
    fn new_streams_through_producer() {
        let mut f = fixture(4, true);
        let payload: Vec<u8> = (0..2 * BS).map(|i| (i % 7) as u8).collect();
        let producer = NewDataProducer::spawn(Box::new(Cursor::new(payload.clone()))).unwrap();
        f.state.new_data = Some(producer);

        assert_eq!(run(&mut f, "new 2,2,4"), CommandResult::Success);
        assert_eq!(read(&f, "2,2,4"), payload);
        assert_eq!(f.state.written, 2);

        assert_eq!(run(&mut f, "new 2,0,1"), CommandResult::Failed);
    }

    #[test]
    fn new_data_read_eio_needs_retry() {
        struct Unreadable;
        impl std::io::Read for Unreadable {
            fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::from_raw_os_error(libc::EIO))
            }
        }

        let mut f = fixture(2, true);
        f.state.new_data = Some(NewDataProducer::spawn(Box::new(Unreadable)).unwrap());
        assert_eq!(run(&mut f, "new 2,0,1"), CommandResult::NeedRetry);
        assert_eq!(f.state.written, 0);
    }

    #[test]
    fn new_without_stream_fails() {
        let mut f = fixture(2, true);
        assert_eq!(run(&mut f, "new 2,0,1"), CommandResult::Failed);
    }

    #[test]
    fn eio_maps_to_retry_other_errors_do_not() {
        let eio = HandlerError::Block(BlockError::Io(std::io::Error::from_raw_os_error(libc::EIO)));
        assert!(eio.is_eio());
        let stash_eio = HandlerError::Stash(StashError::Io(std::io::Error::from_raw_os_error(libc::EIO)));
        assert!(stash_eio.is_eio());
        let streamed = HandlerError::Handoff(HandoffError::Block(BlockError::Io(
            std::io::Error::from_raw_os_error(libc::EIO),
        )));
        assert!(streamed.is_eio());
        let source = HandlerError::Handoff(HandoffError::Source(std::io::Error::from_raw_os_error(libc::EIO)));
        assert!(source.is_eio());

        let enospc = HandlerError::Block(BlockError::Io(std::io::Error::from_raw_os_error(libc::ENOSPC)));
        assert!(!enospc.is_eio());
        assert!(!HandlerError::Verify("x".into()).is_eio());
    }

    #[test]
    fn full_device_is_a_failure_not_a_retry() {
        let Ok(full) = std::fs::OpenOptions::new().write(true).open("/dev/full") else {
            return;
        };
        let mut f = fixture(1, true);
        let cmd = Command::parse(0, "zero 2,0,1").unwrap().unwrap();
        assert_eq!(execute(&cmd, &full, &mut f.state), CommandResult::Failed);
    }

    #[test]
    fn target_argument_positions() {
        let cmd = Command::parse(0, "bsdiff 0 1 a b 2,7,9 2 2,0,2").unwrap().unwrap();
        assert_eq!(target_blocks(&cmd).unwrap().to_string(), "2,7,9");
        let cmd = Command::parse(0, "move a 2,3,4 1 2,0,1").unwrap().unwrap();
        assert_eq!(target_blocks(&cmd).unwrap().to_string(), "2,3,4");
        assert!(target_blocks(&Command::parse(0, "free a").unwrap().unwrap()).is_none());
    }
}
