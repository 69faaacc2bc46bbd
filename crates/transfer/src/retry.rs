use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{Command, CommandType, TransferError};

/// Last command known to be fully applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryMarker {
    /// Position of the command among the script's command lines.
    pub index: usize,
    /// The command line as it appeared in the script.
    pub line: String,
}

impl RetryMarker {
    pub fn for_command(cmd: &Command) -> Self {
        Self {
            index: cmd.index(),
            line: cmd.line().to_string(),
        }
    }

    /// Reads the marker at `path`. A missing file is `Ok(None)`.
    pub fn load(path: &Path) -> Result<Option<Self>, TransferError> {
        let data = match fs::read(path) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if data.is_empty() {
            return Ok(None);
        }
        let marker: Self = serde_json::from_slice(&data)?;
        debug!(index = marker.index, line = %marker.line, "retry marker loaded");
        Ok(Some(marker))
    }

    /// Overwrites `path` with this marker and syncs it to disk.
    pub fn save(&self, path: &Path) -> Result<(), TransferError> {
        let json = serde_json::to_vec(self)?;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn remove(path: &Path) -> Result<(), TransferError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Decides which commands a resumed session skips.
///
/// Commands up to and including the marked one are skipped, except `new`,
/// whose data has to be streamed again. The marker index is trusted only
/// when the line at that index still matches; otherwise the first line with
/// the same text is taken as the marker.
#[derive(Debug)]
pub struct RetrySkip {
    until: Option<usize>,
}

impl RetrySkip {
    pub fn none() -> Self {
        Self { until: None }
    }

    /// Resolves `marker` against the script's command lines.
    pub fn resolve<S: AsRef<str>>(marker: Option<&RetryMarker>, commands: &[S]) -> Self {
        let Some(marker) = marker else {
            return Self::none();
        };

        let matches = |line: &S| line.as_ref().trim() == marker.line;
        let until = if commands.get(marker.index).is_some_and(matches) {
            Some(marker.index)
        } else if let Some(pos) = commands.iter().position(matches) {
            warn!(
                recorded = marker.index,
                found = pos,
                "retry marker index moved, matched by line"
            );
            Some(pos)
        } else {
            warn!(line = %marker.line, "retry marker not found in script, replaying everything");
            None
        };

        if let Some(index) = until {
            info!(index, "resuming after recorded command");
        }
        Self { until }
    }

    pub fn should_skip(&self, cmd: &Command) -> bool {
        match self.until {
            Some(until) => cmd.index() <= until && cmd.kind() != CommandType::New,
            None => false,
        }
    }
}

/// Marker file for a partition inside `work_dir`.
pub fn marker_path(work_dir: &Path, partition: &str) -> PathBuf {
    work_dir.join(format!("{partition}.retry.json"))
}
