//! Update orchestrator: runs each configured partition job in order.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use tracing::{info, warn};
use updatekit_blockset::verify_ranges;
use updatekit_package::{
    DirPackage, Ed25519Oracle, HashManifest, PackageReader, verify_partition_hashes,
};
use updatekit_transfer::{
    LogSink, PackageMembers, PartitionRecord, ProgressReporter, TransferOptions, TransferSession,
    TransferSummary,
};

use crate::config::{Config, PartitionJob};

/// Applies every configured partition update.
pub async fn run(config: Config) -> anyhow::Result<()> {
    run_with_progress(config, ProgressReporter::new(Arc::new(LogSink))).await
}

async fn run_with_progress(config: Config, progress: ProgressReporter) -> anyhow::Result<()> {
    if config.partitions.is_empty() {
        warn!("no partitions configured");
        return Ok(());
    }

    std::fs::create_dir_all(&config.work_dir)
        .with_context(|| format!("creating {}", config.work_dir.display()))?;
    let package: Arc<dyn PackageReader> = Arc::new(DirPackage::new(&config.package_dir));
    let manifest = load_manifest(&config, package.as_ref())?;

    let mut record = PartitionRecord::open(&config.work_dir)?;
    if !config.retry && !config.dry_run {
        record.clear()?;
    }

    progress.show();
    for job in &config.partitions {
        progress.set_proportion(job.proportion);
        if config.retry && record.is_updated(&job.name) {
            info!(partition = %job.name, "partition already updated, skipping");
            progress.advance(1.0);
            continue;
        }

        let summary = update_partition(&config, job, Arc::clone(&package), progress.clone())
            .await
            .with_context(|| format!("updating partition {}", job.name))?;
        info!(
            partition = %job.name,
            session = %summary.session_id,
            executed = summary.executed,
            skipped = summary.skipped,
            blocks = summary.blocks_written,
            "partition updated"
        );
        if !config.dry_run {
            record.mark(&job.name, true)?;
        }
    }

    if let Some(manifest) = manifest {
        if config.verify_after_update && !config.dry_run {
            verify_devices(&config, manifest).await?;
        }
    }
    progress.fill();
    Ok(())
}

/// Reads the signed hash manifest, if one is configured.
fn load_manifest(config: &Config, package: &dyn PackageReader) -> anyhow::Result<Option<HashManifest>> {
    let Some(name) = &config.manifest_file else {
        return Ok(None);
    };
    let Some(key) = &config.public_key else {
        bail!("manifest {name} configured without a public key");
    };
    let oracle = Ed25519Oracle::verifier_from_hex(key)?;
    let data = package.read_file(name)?;
    let (manifest, _) = HashManifest::parse_and_verify(&data, &oracle)
        .with_context(|| format!("checking manifest {name}"))?;
    info!(manifest = %name, partitions = manifest.partitions.len(), "hash manifest accepted");
    Ok(Some(manifest))
}

async fn update_partition(
    config: &Config,
    job: &PartitionJob,
    package: Arc<dyn PackageReader>,
    progress: ProgressReporter,
) -> anyhow::Result<TransferSummary> {
    let mut options = TransferOptions::new(&job.name, &config.work_dir);
    options.retry = config.retry;
    options.can_write = !config.dry_run;
    options.allow_file_erase = config.allow_file_erase;
    let members = PackageMembers {
        transfer_list: job.transfer_list.clone(),
        new_data: job.new_data.clone(),
        patch_data: job.patch_data.clone(),
    };
    let job = job.clone();

    tokio::task::spawn_blocking(move || -> anyhow::Result<TransferSummary> {
        let can_write = options.can_write;
        let target = OpenOptions::new()
            .read(true)
            .write(can_write)
            .open(&job.device)
            .with_context(|| format!("opening {}", job.device.display()))?;

        let session = TransferSession::new(options, progress);
        let summary = session.run_package(&target, package.as_ref(), &members)?;

        if let (Some(ranges), Some(sha), true) = (&job.verify_ranges, &job.verify_sha256, can_write) {
            if !verify_ranges(&target, ranges, sha)? {
                bail!("{} blocks {ranges} do not hash to {sha}", job.name);
            }
            info!(partition = %job.name, %ranges, "final image hash matches");
        }
        Ok(summary)
    })
    .await?
}

/// Checks the manifest digests of the configured partitions.
async fn verify_devices(config: &Config, manifest: HashManifest) -> anyhow::Result<()> {
    let devices: HashMap<&str, &Path> = config
        .partitions
        .iter()
        .map(|job| (job.name.as_str(), job.device.as_path()))
        .collect();

    let (known, unknown): (Vec<_>, Vec<_>) = manifest
        .partitions
        .into_iter()
        .partition(|p| devices.contains_key(p.name.as_str()));
    for p in &unknown {
        warn!(partition = %p.name, "manifest partition has no job, not checked");
    }

    let manifest = HashManifest { partitions: known };
    verify_partition_hashes(&manifest, |name| {
        devices.get(name).map(|p| p.to_path_buf()).unwrap_or_default()
    })
    .await?;
    info!(partitions = manifest.partitions.len(), "partition hashes verified");
    Ok(())
}
