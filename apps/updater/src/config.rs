//! Updater configuration.
//!
//! Stored as TOML at `$UPDATEKIT_CONFIG`, or `~/.config/updatekit/updater.toml`
//! when the variable is unset.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

const CONFIG_ENV: &str = "UPDATEKIT_CONFIG";

/// Updater configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Holds stash space, retry markers and the partition record.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Unpacked update package, one file per member.
    #[serde(default = "default_package_dir")]
    pub package_dir: PathBuf,

    /// Resume an interrupted update instead of starting over.
    #[serde(default)]
    pub retry: bool,

    /// Let `erase` zero regular files as well as block devices.
    #[serde(default)]
    pub allow_file_erase: bool,

    /// Verify hashes and consume package data without writing any device.
    #[serde(default)]
    pub dry_run: bool,

    /// Check manifest partition hashes once every partition is written.
    #[serde(default = "default_true")]
    pub verify_after_update: bool,

    /// Signed hash manifest member inside the package.
    #[serde(default)]
    pub manifest_file: Option<String>,

    /// Hex ed25519 public key for the manifest signature.
    #[serde(default)]
    pub public_key: Option<String>,

    #[serde(default)]
    pub partitions: Vec<PartitionJob>,
}

/// One partition to update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionJob {
    pub name: String,
    /// Block device or image file to write.
    pub device: PathBuf,
    pub transfer_list: String,
    #[serde(default)]
    pub new_data: Option<String>,
    #[serde(default)]
    pub patch_data: Option<String>,
    /// Share of the progress bar.
    #[serde(default = "default_proportion")]
    pub proportion: f32,
    /// Final image check: block ranges and their expected SHA-256.
    #[serde(default)]
    pub verify_ranges: Option<String>,
    #[serde(default)]
    pub verify_sha256: Option<String>,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/var/lib/updatekit")
}

fn default_package_dir() -> PathBuf {
    PathBuf::from("/var/lib/updatekit/package")
}

fn default_true() -> bool {
    true
}

fn default_proportion() -> f32 {
    1.0
}

impl Default for Config {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            package_dir: default_package_dir(),
            retry: false,
            allow_file_erase: false,
            dry_run: false,
            verify_after_update: default_true(),
            manifest_file: None,
            public_key: None,
            partitions: Vec::new(),
        }
    }
}

impl Config {
    /// Loads configuration from disk, or creates a default if not found.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

/// Returns the configuration file path.
fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home)
        .join(".config")
        .join("updatekit")
        .join("updater.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.work_dir, PathBuf::from("/var/lib/updatekit"));
        assert!(!config.retry);
        assert!(!config.allow_file_erase);
        assert!(!config.dry_run);
        assert!(config.verify_after_update);
        assert!(config.manifest_file.is_none());
        assert!(config.partitions.is_empty());
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = Config {
            work_dir: "/data/ota".into(),
            retry: true,
            manifest_file: Some("hashes.bin".into()),
            partitions: vec![PartitionJob {
                name: "system".into(),
                device: "/dev/block/system".into(),
                transfer_list: "system.transfer.list".into(),
                new_data: Some("system.new.dat".into()),
                patch_data: Some("system.patch.dat".into()),
                proportion: 0.75,
                verify_ranges: Some("2,0,1024".into()),
                verify_sha256: Some("ab".repeat(32)),
            }],
            ..Config::default()
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.work_dir, PathBuf::from("/data/ota"));
        assert!(parsed.retry);
        assert_eq!(parsed.manifest_file.as_deref(), Some("hashes.bin"));
        assert_eq!(parsed.partitions, config.partitions);
    }

    #[test]
    fn config_partial_toml() {
        let toml_str = r#"
            retry = true

            [[partitions]]
            name = "vendor"
            device = "/dev/block/vendor"
            transfer_list = "vendor.transfer.list"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.retry);
        assert!(config.verify_after_update);
        assert_eq!(config.package_dir, PathBuf::from("/var/lib/updatekit/package"));

        let job = &config.partitions[0];
        assert_eq!(job.name, "vendor");
        assert_eq!(job.proportion, 1.0);
        assert!(job.new_data.is_none());
        assert!(job.verify_sha256.is_none());
    }

    #[test]
    fn config_path_not_empty() {
        let path = config_path();
        assert!(!path.as_os_str().is_empty());
    }

    #[test]
    fn config_save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("updater.toml");

        // A missing file is created with defaults.
        let created = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert!(created.partitions.is_empty());

        let config = Config {
            allow_file_erase: true,
            ..Config::default()
        };
        config.save_to(&path).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let loaded = Config::load_from(&path).unwrap();
        assert!(loaded.allow_file_erase);
    }
}
