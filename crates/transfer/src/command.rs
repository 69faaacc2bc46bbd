use std::fmt;

use tracing::debug;
use updatekit_blockset::{BlockError, BlockSet};

/// Verb of one transfer-list line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    Abort,
    New,
    Zero,
    Erase,
    Move,
    Bsdiff,
    Imgdiff,
    Stash,
    Free,
    Copy,
    /// Not an instruction; skipped.
    Last,
}

impl CommandType {
    pub fn from_verb(verb: &str) -> Self {
        match verb {
            "abort" => Self::Abort,
            "new" => Self::New,
            "zero" => Self::Zero,
            "erase" => Self::Erase,
            "free" => Self::Free,
            "stash" => Self::Stash,
            "move" => Self::Move,
            "bsdiff" | "pkgdiff" => Self::Bsdiff,
            "imgdiff" => Self::Imgdiff,
            "copy" => Self::Copy,
            _ => Self::Last,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::New => "new",
            Self::Zero => "zero",
            Self::Erase => "erase",
            Self::Move => "move",
            Self::Bsdiff => "bsdiff",
            Self::Imgdiff => "imgdiff",
            Self::Stash => "stash",
            Self::Free => "free",
            Self::Copy => "copy",
            Self::Last => "last",
        }
    }

    /// Minimum number of arguments after the verb.
    fn min_args(self) -> usize {
        match self {
            Self::Abort | Self::Last => 0,
            Self::New | Self::Zero | Self::Erase | Self::Free => 1,
            Self::Stash => 2,
            Self::Move | Self::Copy => 4,
            Self::Bsdiff | Self::Imgdiff => 7,
        }
    }

    /// Verbs whose completion moves the progress bar.
    pub fn counts_progress(self) -> bool {
        matches!(self, Self::New | Self::Imgdiff | Self::Bsdiff | Self::Zero)
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while reading command arguments.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("{verb}: missing argument {position}")]
    MissingArgument { verb: CommandType, position: usize },

    #[error("{verb}: bad argument {value:?}: {reason}")]
    BadArgument {
        verb: CommandType,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Block(#[from] BlockError),
}

/// One parsed transfer-list line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    kind: CommandType,
    args: Vec<String>,
    line: String,
    index: usize,
}

impl Command {
    /// Parses line `index` of the command section.
    ///
    /// Blank lines yield `None`. Unknown verbs parse as [`CommandType::Last`].
    pub fn parse(index: usize, line: &str) -> Result<Option<Self>, CommandError> {
        let mut tokens = line.split_whitespace();
        let Some(verb) = tokens.next() else {
            return Ok(None);
        };

        let kind = CommandType::from_verb(verb);
        if kind == CommandType::Last {
            debug!(index, verb, "ignoring unknown verb");
        }

        let args: Vec<String> = tokens.map(str::to_string).collect();
        if args.len() < kind.min_args() {
            return Err(CommandError::MissingArgument {
                verb: kind,
                position: args.len() + 1,
            });
        }

        Ok(Some(Self {
            kind,
            args,
            line: line.trim().to_string(),
            index,
        }))
    }

    pub fn kind(&self) -> CommandType {
        self.kind
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// The trimmed source line.
    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Argument at `pos`, counting from zero after the verb.
    pub fn arg(&self, pos: usize) -> Result<&str, CommandError> {
        self.args
            .get(pos)
            .map(String::as_str)
            .ok_or(CommandError::MissingArgument {
                verb: self.kind,
                position: pos + 1,
            })
    }

    pub fn u64_arg(&self, pos: usize) -> Result<u64, CommandError> {
        let value = self.arg(pos)?;
        value.parse().map_err(|e: std::num::ParseIntError| CommandError::BadArgument {
            verb: self.kind,
            value: value.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn block_set_arg(&self, pos: usize) -> Result<BlockSet, CommandError> {
        Ok(BlockSet::parse(self.arg(pos)?)?)
    }

    pub(crate) fn bad(&self, value: &str, reason: impl fmt::Display) -> CommandError {
        CommandError::BadArgument {
            verb: self.kind,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}
