use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::{PackageError, validate_entry_name};

/// Sizes of one package member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub packed_size: u64,
    pub unpacked_size: u64,
}

/// Read access to the named members of an update package.
///
/// Implementations are shared with the new-data producer thread, so they
/// must be `Send + Sync` and hand out owned readers.
pub trait PackageReader: Send + Sync {
    fn file_info(&self, name: &str) -> Result<FileInfo, PackageError>;

    /// Opens a member as a stream.
    fn extract_file(&self, name: &str) -> Result<Box<dyn Read + Send>, PackageError>;

    /// Reads a whole member into memory.
    fn read_file(&self, name: &str) -> Result<Vec<u8>, PackageError> {
        let info = self.file_info(name)?;
        let mut out = Vec::with_capacity(info.unpacked_size as usize);
        self.extract_file(name)?.read_to_end(&mut out)?;
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Directory-backed package
// ---------------------------------------------------------------------------

/// A package unpacked into a directory, one file per member.
#[derive(Debug, Clone)]
pub struct DirPackage {
    root: PathBuf,
}

impl DirPackage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn member_path(&self, name: &str) -> Result<PathBuf, PackageError> {
        validate_entry_name(name)?;
        let path = self.root.join(name);
        if !path.is_file() {
            return Err(PackageError::NotFound(name.to_string()));
        }
        Ok(path)
    }
}

impl PackageReader for DirPackage {
    fn file_info(&self, name: &str) -> Result<FileInfo, PackageError> {
        let len = std::fs::metadata(self.member_path(name)?)?.len();
        Ok(FileInfo {
            packed_size: len,
            unpacked_size: len,
        })
    }

    fn extract_file(&self, name: &str) -> Result<Box<dyn Read + Send>, PackageError> {
        let path = self.member_path(name)?;
        debug!(member = name, path = %path.display(), "opening package member");
        let file = File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => PackageError::NotFound(name.to_string()),
            _ => PackageError::Io(e),
        })?;
        Ok(Box::new(file))
    }
}

// ---------------------------------------------------------------------------
// In-memory package
// ---------------------------------------------------------------------------

/// A package held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryPackage {
    files: HashMap<String, Arc<[u8]>>,
}

impl MemoryPackage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> &mut Self {
        self.files.insert(name.into(), Arc::from(data.into()));
        self
    }

    fn member(&self, name: &str) -> Result<&Arc<[u8]>, PackageError> {
        validate_entry_name(name)?;
        self.files
            .get(name)
            .ok_or_else(|| PackageError::NotFound(name.to_string()))
    }
}

impl PackageReader for MemoryPackage {
    fn file_info(&self, name: &str) -> Result<FileInfo, PackageError> {
        let len = self.member(name)?.len() as u64;
        Ok(FileInfo {
            packed_size: len,
            unpacked_size: len,
        })
    }

    fn extract_file(&self, name: &str) -> Result<Box<dyn Read + Send>, PackageError> {
        Ok(Box::new(Cursor::new(Arc::clone(self.member(name)?))))
    }
}
