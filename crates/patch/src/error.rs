//! Error types for patch application.

/// Errors produced while decoding or applying a patch.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("corrupt patch header: {0}")]
    CorruptHeader(String),

    #[error("patch range out of bounds: {0}")]
    OutOfRange(String),

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PatchError {
    pub(crate) fn codec(stage: &str, err: impl std::fmt::Display) -> Self {
        Self::Codec(format!("{stage}: {err}"))
    }
}
