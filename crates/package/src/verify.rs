use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use futures_util::future::join_all;
use sha2::{Digest, Sha256};
use tracing::{error, info};

use crate::{HashManifest, PackageError, PartitionHash};

const READ_CHUNK: usize = 50 * 1024;

/// SHA-256 hex digest of the first `len` bytes of `path`.
pub fn file_digest(path: &Path, len: u64) -> Result<String, PackageError> {
    let mut reader = File::open(path)?.take(len);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    if total < len {
        return Err(PackageError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("{} holds {total} of {len} bytes", path.display()),
        )));
    }
    Ok(hex::encode(hasher.finalize()))
}

fn verify_one(entry: &PartitionHash, path: &Path) -> Result<(), PackageError> {
    let actual = file_digest(path, entry.data_len)?;
    if !actual.eq_ignore_ascii_case(&entry.sha256) {
        return Err(PackageError::HashMismatch {
            partition: entry.name.clone(),
            expected: entry.sha256.clone(),
            actual,
        });
    }
    Ok(())
}

/// Checks every manifest partition concurrently.
///
/// `resolve` maps a partition name to the file or device holding it. All
/// checks run to completion; the first failure in manifest order is
/// returned.
pub async fn verify_partition_hashes<F>(manifest: &HashManifest, resolve: F) -> Result<(), PackageError>
where
    F: Fn(&str) -> PathBuf,
{
    let tasks = manifest.partitions.iter().map(|entry| {
        let entry = entry.clone();
        let path = resolve(&entry.name);
        tokio::task::spawn_blocking(move || {
            let result = verify_one(&entry, &path);
            match &result {
                Ok(()) => info!(partition = %entry.name, "partition hash verified"),
                Err(e) => error!(partition = %entry.name, error = %e, "partition hash check failed"),
            }
            result
        })
    });

    let mut first_err = None;
    for joined in join_all(tasks).await {
        let result = joined.map_err(|e| PackageError::Task(e.to_string())).and_then(|r| r);
        if let Err(e) = result {
            first_err.get_or_insert(e);
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, data: &[u8], len: u64) -> PartitionHash {
        PartitionHash {
            name: name.into(),
            sha256: hex::encode(Sha256::digest(&data[..len as usize])),
            data_len: len,
        }
    }

    #[tokio::test]
    async fn all_partitions_verify() {
        let tmp = tempfile::tempdir().unwrap();
        let system = vec![5u8; 10_000];
        let vendor: Vec<u8> = (0..200_000u32).map(|i| (i % 97) as u8).collect();
        std::fs::write(tmp.path().join("system"), &system).unwrap();
        std::fs::write(tmp.path().join("vendor"), &vendor).unwrap();

        let manifest = HashManifest {
            partitions: vec![entry("system", &system, 10_000), entry("vendor", &vendor, 150_000)],
        };
        let root = tmp.path().to_path_buf();
        verify_partition_hashes(&manifest, |name| root.join(name)).await.unwrap();
    }

    #[tokio::test]
    async fn mismatch_names_partition() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("system"), vec![1u8; 4096]).unwrap();
        std::fs::write(tmp.path().join("vendor"), vec![2u8; 4096]).unwrap();

        let manifest = HashManifest {
            partitions: vec![
                entry("system", &[1u8; 4096], 4096),
                entry("vendor", &[3u8; 4096], 4096),
            ],
        };
        let root = tmp.path().to_path_buf();
        let err = verify_partition_hashes(&manifest, |name| root.join(name))
            .await
            .unwrap_err();
        match err {
            PackageError::HashMismatch { partition, .. } => assert_eq!(partition, "vendor"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn short_file_is_an_error() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), b"abc").unwrap();
        assert!(file_digest(tmp.path(), 10).is_err());
        assert_eq!(
            file_digest(tmp.path(), 3).unwrap(),
            hex::encode(Sha256::digest(b"abc"))
        );
    }
}
