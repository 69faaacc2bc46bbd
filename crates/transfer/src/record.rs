use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::TransferError;

const RECORD_FILE: &str = "partition_record.json";

/// Update status of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionStatus {
    pub updated: bool,
    pub updated_at: DateTime<Utc>,
}

/// Durable record of which partitions a session finished.
///
/// A retried session consults it to skip partitions already written.
#[derive(Debug, Clone)]
pub struct PartitionRecord {
    path: PathBuf,
    entries: BTreeMap<String, PartitionStatus>,
}

impl PartitionRecord {
    /// Loads the record kept in `work_dir`, or starts an empty one.
    pub fn open(work_dir: &Path) -> Result<Self, TransferError> {
        let path = work_dir.join(RECORD_FILE);
        let entries = match fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), partitions = entries.len(), "partition record opened");
        Ok(Self { path, entries })
    }

    pub fn is_updated(&self, partition: &str) -> bool {
        self.entries.get(partition).is_some_and(|s| s.updated)
    }

    pub fn status(&self, partition: &str) -> Option<&PartitionStatus> {
        self.entries.get(partition)
    }

    /// Records `partition` and persists the record.
    pub fn mark(&mut self, partition: &str, updated: bool) -> Result<(), TransferError> {
        self.entries.insert(
            partition.to_string(),
            PartitionStatus {
                updated,
                updated_at: Utc::now(),
            },
        );
        self.save()?;
        info!(partition, updated, "partition status recorded");
        Ok(())
    }

    /// Forgets every partition. Used when a fresh session starts.
    pub fn clear(&mut self) -> Result<(), TransferError> {
        self.entries.clear();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self) -> Result<(), TransferError> {
        let json = serde_json::to_vec_pretty(&self.entries)?;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        Ok(())
    }
}
