use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::tlv::{
    self, TAG_DATA_LENGTH, TAG_PARTITION_COUNT, TAG_PARTITION_HASH, TAG_PARTITION_NAME,
    TAG_SIGNATURE, TlvReader,
};
use crate::{PackageError, SignatureOracle};

/// Expected digest of one partition image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionHash {
    pub name: String,
    /// Lowercase hex SHA-256 of the first `data_len` bytes.
    pub sha256: String,
    pub data_len: u64,
}

/// Signed list of partition digests.
///
/// Encoded as a partition count record, then name/hash/length records for
/// each partition, then a signature over the SHA-256 of everything before it:
///
/// ```text
/// HH(count: u16)
/// { HH(name) HH(hex hash) HH(length: u64) } * count
/// HI(signature)
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashManifest {
    pub partitions: Vec<PartitionHash>,
}

impl HashManifest {
    pub fn encode(&self, oracle: &dyn SignatureOracle) -> Result<Vec<u8>, PackageError> {
        let count = u16::try_from(self.partitions.len())
            .map_err(|_| PackageError::Tlv("too many partitions".into()))?;

        let mut out = Vec::new();
        tlv::write_hh(&mut out, TAG_PARTITION_COUNT, &count.to_le_bytes())?;
        for p in &self.partitions {
            tlv::write_hh(&mut out, TAG_PARTITION_NAME, p.name.as_bytes())?;
            tlv::write_hh(&mut out, TAG_PARTITION_HASH, p.sha256.as_bytes())?;
            tlv::write_hh(&mut out, TAG_DATA_LENGTH, &p.data_len.to_le_bytes())?;
        }

        let digest = Sha256::digest(&out);
        let signature = oracle.sign(&digest)?;
        tlv::write_hi(&mut out, TAG_SIGNATURE, &signature)?;
        Ok(out)
    }

    /// Parses `data` and checks its signature with `oracle`.
    ///
    /// Bytes following the signature record are ignored; the number of
    /// bytes consumed is returned alongside the manifest.
    pub fn parse_and_verify(
        data: &[u8],
        oracle: &dyn SignatureOracle,
    ) -> Result<(Self, usize), PackageError> {
        let mut reader = TlvReader::new(data);
        let mut hasher = Sha256::new();

        let count_rec = reader.read_hh()?.expect(TAG_PARTITION_COUNT)?;
        hasher.update(count_rec.raw);
        let count = count_rec.as_u16()?;
        debug!(count, "manifest partition count");

        let mut partitions = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = reader.read_hh()?.expect(TAG_PARTITION_NAME)?;
            let hash = reader.read_hh()?.expect(TAG_PARTITION_HASH)?;
            let len = reader.read_hh()?.expect(TAG_DATA_LENGTH)?;
            for rec in [&name, &hash, &len] {
                hasher.update(rec.raw);
            }

            let entry = PartitionHash {
                name: name.as_str()?.to_string(),
                sha256: hash.as_str()?.to_ascii_lowercase(),
                data_len: len.as_u64()?,
            };
            debug!(partition = %entry.name, data_len = entry.data_len, "manifest entry");
            partitions.push(entry);
        }

        let signature = reader.read_hi()?.expect(TAG_SIGNATURE)?;
        let digest = hasher.finalize();
        if !oracle.verify(&digest, signature.value) {
            warn!("manifest signature rejected");
            return Err(PackageError::Signature("manifest signature does not verify".into()));
        }

        info!(partitions = partitions.len(), "manifest signature verified");
        Ok((Self { partitions }, reader.position()))
    }
}
