//! Block transfer list interpreter.
//!
//! A transfer list is a small script of block-edit commands (`new`, `zero`,
//! `erase`, `move`, `bsdiff`, `imgdiff`, `stash`, `free`) that turns a
//! partition image into its updated form. [`TransferSession`] runs one list
//! against a target, streaming new data from a background thread, stashing
//! blocks that would otherwise be overwritten, and recording a retry marker
//! after every applied command so an interrupted update can resume.

mod command;
mod handlers;
mod handoff;
mod progress;
mod record;
mod retry;
mod session;
mod source;
mod state;

pub use command::{Command, CommandError, CommandType};
pub use handlers::{CommandResult, execute};
pub use handoff::{HandoffError, NewDataProducer};
pub use progress::{LogSink, MemorySink, MessageSink, ProgressReporter};
pub use record::{PartitionRecord, PartitionStatus};
pub use retry::{RetryMarker, RetrySkip, marker_path};
pub use session::{PackageMembers, ScriptInputs, TransferOptions, TransferSession, TransferSummary};
pub use state::{ScriptHeader, TransferState};

use updatekit_package::PackageError;
use updatekit_stash::StashError;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bad transfer list header: {0}")]
    Header(String),

    #[error("bad command: {0}")]
    Command(#[from] CommandError),

    #[error("command {index} failed: {line}")]
    CommandFailed { index: usize, line: String },

    #[error("command {index} needs a retry: {line}")]
    RetryRequested { index: usize, line: String },

    #[error("stash error: {0}")]
    Stash(#[from] StashError),

    #[error("package error: {0}")]
    Package(#[from] PackageError),

    #[error("new data producer: {0}")]
    Producer(std::io::Error),
}
