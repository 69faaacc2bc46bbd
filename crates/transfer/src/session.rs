use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use tracing::{debug, error, info, info_span, warn};
use updatekit_package::PackageReader;
use updatekit_stash::ContentStash;
use uuid::Uuid;

use crate::handlers::target_blocks;
use crate::{
    Command, CommandResult, CommandType, NewDataProducer, ProgressReporter, RetryMarker, RetrySkip,
    ScriptHeader, TransferError, TransferState, execute, marker_path,
};

/// Per-run settings.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Partition name; keys the stash directory and retry marker.
    pub partition: String,
    /// Directory holding stash space and retry markers.
    pub work_dir: PathBuf,
    /// False for a verification pass that leaves the target untouched.
    pub can_write: bool,
    /// Resume from the retry marker instead of starting over.
    pub retry: bool,
    /// Let `erase` zero regular files.
    pub allow_file_erase: bool,
}

impl TransferOptions {
    pub fn new(partition: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            partition: partition.into(),
            work_dir: work_dir.into(),
            can_write: true,
            retry: false,
            allow_file_erase: false,
        }
    }

    pub fn stash_dir(&self) -> PathBuf {
        self.work_dir.join(format!("{}_tmp", self.partition))
    }

    /// Scratch stash used by verification passes.
    pub fn verify_stash_dir(&self) -> PathBuf {
        self.work_dir.join(format!("{}_verify_tmp", self.partition))
    }

    pub fn marker_path(&self) -> PathBuf {
        marker_path(&self.work_dir, &self.partition)
    }
}

/// Opens the stash space for a run.
///
/// A writing run wipes the partition stash unless it resumes. A
/// verification pass works in a scratch directory so an interrupted
/// update keeps its entries; when resuming, the scratch starts as a copy
/// of them.
fn open_stash(opts: &TransferOptions) -> Result<ContentStash, TransferError> {
    if opts.can_write {
        return Ok(ContentStash::create_space(opts.stash_dir(), !opts.retry)?);
    }

    let scratch = ContentStash::create_space(opts.verify_stash_dir(), true)?;
    let real = opts.stash_dir();
    if opts.retry && real.is_dir() {
        let real = ContentStash::create_space(real, false)?;
        for id in real.entries()? {
            let Some(len) = real.entry_len(&id) else { continue };
            let mut buf = vec![0u8; len as usize];
            if real.load(&id, &mut buf)? == buf.len() {
                scratch.store(&id, &buf)?;
            }
        }
        debug!(entries = scratch.entries()?.len(), "stash copied for verification");
    }
    Ok(scratch)
}

/// Data a script reads besides its own lines.
#[derive(Default)]
pub struct ScriptInputs {
    pub patch_data: Vec<u8>,
    pub new_data: Option<Box<dyn Read + Send>>,
}

/// Package member names for one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageMembers {
    pub transfer_list: String,
    pub new_data: Option<String>,
    pub patch_data: Option<String>,
}

/// What a finished run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    pub session_id: Uuid,
    pub executed: usize,
    pub skipped: usize,
    pub blocks_written: u64,
}

/// Runs transfer lists for one partition.
pub struct TransferSession {
    options: TransferOptions,
    progress: ProgressReporter,
}

impl TransferSession {
    pub fn new(options: TransferOptions, progress: ProgressReporter) -> Self {
        Self { options, progress }
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    /// Reads the transfer list and its data from `package`, then runs it.
    pub fn run_package(
        &self,
        target: &File,
        package: &dyn PackageReader,
        members: &PackageMembers,
    ) -> Result<TransferSummary, TransferError> {
        let list = package.read_file(&members.transfer_list)?;
        let text = String::from_utf8(list)
            .map_err(|e| TransferError::Header(format!("transfer list is not UTF-8: {e}")))?;
        let lines: Vec<&str> = text.lines().collect();

        let patch_data = match &members.patch_data {
            Some(name) => package.read_file(name)?,
            None => Vec::new(),
        };
        let new_data = match &members.new_data {
            Some(name) => Some(package.extract_file(name)?),
            None => None,
        };
        debug!(
            list = %members.transfer_list,
            lines = lines.len(),
            patch_bytes = patch_data.len(),
            "package members loaded"
        );
        self.run_script(target, &lines, ScriptInputs { patch_data, new_data })
    }

    /// Runs `lines` (header included) against `target`.
    pub fn run_script<S: AsRef<str>>(
        &self,
        target: &File,
        lines: &[S],
        inputs: ScriptInputs,
    ) -> Result<TransferSummary, TransferError> {
        let session_id = Uuid::new_v4();
        let opts = &self.options;
        let span = info_span!("transfer", session = %session_id, partition = %opts.partition);
        let _guard = span.enter();

        let (header, header_lines) = ScriptHeader::parse(lines)?;
        let commands = &lines[header_lines..];
        info!(
            version = header.version,
            total_blocks = header.total_blocks,
            commands = commands.len(),
            retry = opts.retry,
            can_write = opts.can_write,
            "transfer list started"
        );

        std::fs::create_dir_all(&opts.work_dir)?;
        let stash = open_stash(opts)?;
        let marker_file = opts.marker_path();
        let skip = if opts.retry {
            let marker = RetryMarker::load(&marker_file)?;
            RetrySkip::resolve(marker.as_ref(), commands)
        } else {
            if opts.can_write {
                RetryMarker::remove(&marker_file)?;
            }
            RetrySkip::none()
        };

        let mut state = TransferState::new(header, stash, opts.can_write)
            .with_patch_data(inputs.patch_data)
            .with_file_erase(opts.allow_file_erase);
        if opts.retry {
            state.count_existing_stash()?;
        }
        if let Some(source) = inputs.new_data {
            state = state.with_new_data(NewDataProducer::spawn(source).map_err(TransferError::Producer)?);
        }

        let mut executed = 0usize;
        let mut skipped = 0usize;
        let mut last_written = state.written;
        for (index, line) in commands.iter().enumerate() {
            let Some(cmd) = Command::parse(index, line.as_ref())? else {
                continue;
            };
            if cmd.kind() == CommandType::Last {
                continue;
            }
            if skip.should_skip(&cmd) {
                debug!(index, line = cmd.line(), "already applied, skipped");
                skipped += 1;
                continue;
            }

            match execute(&cmd, target, &mut state) {
                CommandResult::Success => {
                    executed += 1;
                    if cmd.kind() != CommandType::New && opts.can_write {
                        RetryMarker::for_command(&cmd).save(&marker_file)?;
                    }
                }
                CommandResult::NeedRetry => {
                    warn!(index, line = cmd.line(), "command needs retry");
                    self.progress
                        .sink()
                        .post_message("retry_update", "IO_FAILED_REBOOT");
                    return Err(TransferError::RetryRequested {
                        index,
                        line: cmd.line().to_string(),
                    });
                }
                CommandResult::Failed => {
                    error!(index, line = cmd.line(), target = ?target_blocks(&cmd), "transfer list aborted");
                    return Err(TransferError::CommandFailed {
                        index,
                        line: cmd.line().to_string(),
                    });
                }
            }

            if header.total_blocks != 0 && cmd.kind().counts_progress() {
                let delta = state.written.saturating_sub(last_written);
                self.progress.advance(delta as f32 / header.total_blocks as f32);
                last_written = state.written;
            }
        }

        state.finish_new_data()?;
        state.stash.free_all()?;
        if opts.can_write {
            RetryMarker::remove(&marker_file)?;
        }

        let summary = TransferSummary {
            session_id,
            executed,
            skipped,
            blocks_written: state.written,
        };
        info!(executed, skipped, blocks_written = state.written, "transfer list finished");
        Ok(summary)
    }
}
