use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::StashError;

/// Stash rooted at one directory.
#[derive(Debug, Clone)]
pub struct ContentStash {
    base: PathBuf,
    created: bool,
}

fn validate_id(id: &str) -> Result<(), StashError> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(StashError::InvalidId(id.to_string()));
    }
    Ok(())
}

fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

impl ContentStash {
    /// Ensures the base directory exists.
    ///
    /// With `wipe_existing` any previous contents are removed first. The
    /// returned stash reports [`created`](Self::created) when the directory
    /// was made or wiped by this call.
    pub fn create_space(base: impl Into<PathBuf>, wipe_existing: bool) -> Result<Self, StashError> {
        let base = base.into();
        let existed = base.is_dir();
        if existed && wipe_existing {
            fs::remove_dir_all(&base)?;
        }
        fs::create_dir_all(&base)?;

        let created = !existed || wipe_existing;
        info!(path = %base.display(), created, "stash space ready");
        Ok(Self { base, created })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// True when this session made (or wiped) the stash directory.
    pub fn created(&self) -> bool {
        self.created
    }

    fn entry_path(&self, id: &str) -> Result<PathBuf, StashError> {
        validate_id(id)?;
        Ok(self.base.join(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entry_path(id).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Size of an entry in bytes, if present.
    pub fn entry_len(&self, id: &str) -> Option<u64> {
        let path = self.entry_path(id).ok()?;
        fs::metadata(path).ok().map(|m| m.len())
    }

    /// Loads entry `id` into `out`, which must be exactly the entry size.
    ///
    /// Returns 0 when the entry is missing or its size differs.
    pub fn load(&self, id: &str, out: &mut [u8]) -> Result<usize, StashError> {
        let path = self.entry_path(id)?;
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(id, "stash entry not present");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata()?.len();
        if len != out.len() as u64 {
            warn!(id, len, expected = out.len(), "stash entry size mismatch");
            return Ok(0);
        }
        file.read_exact(out)?;
        debug!(id, len, "stash entry loaded");
        Ok(out.len())
    }

    /// Stores `data` as entry `id`, replacing any previous entry.
    ///
    /// The data is written to a temporary file, synced, and renamed into
    /// place so a crash leaves either the old entry or the complete new one.
    pub fn store(&self, id: &str, data: &[u8]) -> Result<(), StashError> {
        let path = self.entry_path(id)?;
        let tmp = self.base.join(format!(".{id}.partial"));

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &path)?;
        sync_dir(&self.base)?;
        debug!(id, len = data.len(), "stash entry stored");
        Ok(())
    }

    /// Removes entry `id`. A missing entry is logged, not an error.
    pub fn free(&self, id: &str) -> Result<(), StashError> {
        let path = self.entry_path(id)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(id, "stash entry freed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(id, "stash entry already absent");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Names of every committed entry.
    pub fn entries(&self) -> Result<Vec<String>, StashError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.base)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if validate_id(name).is_ok() && entry.file_type()?.is_file() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Removes the whole stash directory.
    pub fn free_all(&self) -> Result<(), StashError> {
        match fs::remove_dir_all(&self.base) {
            Ok(()) => {
                info!(path = %self.base.display(), "stash space freed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stash() -> (tempfile::TempDir, ContentStash) {
        let tmp = tempfile::tempdir().unwrap();
        let stash = ContentStash::create_space(tmp.path().join("system_tmp"), true).unwrap();
        (tmp, stash)
    }

    #[test]
    fn store_then_load() {
        let (_tmp, stash) = stash();
        let data: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        stash.store("abc123", &data).unwrap();
        assert!(stash.contains("abc123"));
        assert_eq!(stash.entry_len("abc123"), Some(8192));

        let mut out = vec![0u8; data.len()];
        assert_eq!(stash.load("abc123", &mut out).unwrap(), data.len());
        assert_eq!(out, data);
    }

    #[test]
    fn free_then_load_is_not_found() {
        let (_tmp, stash) = stash();
        stash.store("deadbeef", b"payload").unwrap();
        stash.free("deadbeef").unwrap();

        let mut out = vec![0u8; 7];
        assert_eq!(stash.load("deadbeef", &mut out).unwrap(), 0);
        assert!(!stash.contains("deadbeef"));
    }

    #[test]
    fn free_missing_is_ok() {
        let (_tmp, stash) = stash();
        stash.free("0000").unwrap();
    }

    #[test]
    fn size_mismatch_loads_nothing() {
        let (_tmp, stash) = stash();
        stash.store("feed", b"four").unwrap();
        let mut out = vec![0u8; 8];
        assert_eq!(stash.load("feed", &mut out).unwrap(), 0);
    }

    #[test]
    fn store_replaces_and_leaves_no_partials() {
        let (_tmp, stash) = stash();
        stash.store("cafe", b"first").unwrap();
        stash.store("cafe", b"second").unwrap();
        let mut out = vec![0u8; 6];
        stash.load("cafe", &mut out).unwrap();
        assert_eq!(&out, b"second");
        assert_eq!(stash.entries().unwrap(), vec!["cafe".to_string()]);
    }

    #[test]
    fn rejects_path_like_ids() {
        let (_tmp, stash) = stash();
        for id in ["", "../escape", "a/b", ".hidden", "a b"] {
            assert!(matches!(
                stash.store(id, b"x").unwrap_err(),
                StashError::InvalidId(_)
            ));
        }
        assert!(!stash.contains("../escape"));
    }

    #[test]
    fn created_marker_tracks_wipe() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("vendor_tmp");

        let first = ContentStash::create_space(&base, false).unwrap();
        assert!(first.created());
        first.store("aa", b"kept").unwrap();

        let reused = ContentStash::create_space(&base, false).unwrap();
        assert!(!reused.created());
        assert!(reused.contains("aa"));

        let wiped = ContentStash::create_space(&base, true).unwrap();
        assert!(wiped.created());
        assert!(!wiped.contains("aa"));
    }

    #[test]
    fn free_all_removes_directory() {
        let (_tmp, stash) = stash();
        stash.store("ab", b"x").unwrap();
        stash.free_all().unwrap();
        assert!(!stash.base().exists());
        stash.free_all().unwrap();
    }
}
