//! Content-addressed scratch storage for source blocks.
//!
//! Entries are named by the hex digest of their contents and live as plain
//! files under one base directory. A stashed copy lets a later command
//! rebuild its source after the original blocks were overwritten, which is
//! what makes an interrupted update resumable.

mod store;

pub use store::ContentStash;

/// Errors produced by the stash.
#[derive(Debug, thiserror::Error)]
pub enum StashError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid stash id: {0:?}")]
    InvalidId(String),
}
