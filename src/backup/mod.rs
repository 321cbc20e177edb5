pub(crate) mod archive;   // Archive assembly (zip / tar.gz) with rename-after-complete
pub(crate) mod cleanup;   // Sweeping leftovers of interrupted runs
pub(crate) mod naming;    // Timestamped archive file names
pub(crate) mod snapshot;  // Consistent SQLite copy via the online backup API
pub(crate) mod verification; // Entry check on the finished file before it is renamed

use chrono::NaiveDateTime;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, error, info};

use crate::config::{ArchiveFormat, BackupConfig};
use crate::errors::{BackupError, Result};

/// One backup run, resolved from configuration and the capture time.
#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub source_database_path: PathBuf,
    pub source_asset_directory: Option<PathBuf>,
    pub destination_directory: PathBuf,
    pub capture_timestamp: NaiveDateTime,
}

impl BackupRequest {
    pub fn from_config(config: &BackupConfig, capture_timestamp: NaiveDateTime) -> Self {
        BackupRequest {
            source_database_path: config.source_db_path.clone(),
            source_asset_directory: config.media_dir.clone(),
            destination_directory: config.local_backup_path.clone(),
            capture_timestamp,
        }
    }

    /// Rejects a request whose source database is not a readable file,
    /// before anything is written anywhere.
    pub fn validate(&self) -> Result<()> {
        let metadata = std::fs::metadata(&self.source_database_path)
            .map_err(|e| BackupError::source_unreadable(&self.source_database_path, e))?;
        if !metadata.is_file() {
            return Err(BackupError::source_unreadable(
                &self.source_database_path,
                "not a regular file",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AssetStatus {
    NotRequested,
    Included,
    /// The media directory was configured but absent; the archive holds
    /// the database only.
    Missing { path: PathBuf },
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub archive_path: PathBuf,
    pub format: ArchiveFormat,
    pub captured_at: String,
    pub snapshot_bytes: u64,
    pub archive_bytes: u64,
    pub asset_entries: usize,
    pub asset_status: AssetStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    SnapshotInProgress,
    SnapshotReady,
    ArchiveInProgress,
    Done,
}

/// Runs the whole pipeline: snapshot, then archive (verified before it is
/// renamed into place when `verify_archive` is set).
///
/// The temp snapshot is gone when this returns, whatever the outcome.
pub fn run_backup(config: &BackupConfig, captured_at: NaiveDateTime) -> Result<BackupReport> {
    let mut stage = Stage::Idle;
    let result = perform_backup(config, captured_at, &mut stage);
    match &result {
        Ok(report) => info!(
            archive = %report.archive_path.display(),
            "Backup completed"
        ),
        Err(e) => error!(stage = ?stage, error = %e, "Backup failed"),
    }
    result
}

fn enter(stage: &mut Stage, next: Stage) {
    debug!(from = ?*stage, to = ?next, "backup stage");
    *stage = next;
}

fn perform_backup(
    config: &BackupConfig,
    captured_at: NaiveDateTime,
    stage: &mut Stage,
) -> Result<BackupReport> {
    let request = BackupRequest::from_config(config, captured_at);
    request.validate()?;

    cleanup::sweep_stale_temps(
        &config.temp_dir,
        snapshot::SNAPSHOT_PREFIX,
        config.stale_temp_max_age,
    );
    cleanup::sweep_stale_temps(
        &request.destination_directory,
        archive::PARTIAL_PREFIX,
        config.stale_temp_max_age,
    );

    enter(stage, Stage::SnapshotInProgress);
    info!(source = %request.source_database_path.display(), "Creating SQLite backup");
    let snapshot = snapshot::create_snapshot(&request.source_database_path, config)?;
    let snapshot_bytes = snapshot.size();
    enter(stage, Stage::SnapshotReady);

    enter(stage, Stage::ArchiveInProgress);
    let outcome = archive::assemble_archive(
        snapshot,
        request.source_asset_directory.as_deref(),
        &request.destination_directory,
        &request.capture_timestamp,
        config.archive_format,
        config.verify_archive,
    )?;
    enter(stage, Stage::Done);

    Ok(BackupReport {
        archive_path: outcome.path,
        format: config.archive_format,
        captured_at: request.capture_timestamp.format("%Y-%m-%dT%H:%M:%S").to_string(),
        snapshot_bytes,
        archive_bytes: outcome.bytes,
        asset_entries: outcome.asset_entries,
        asset_status: outcome.asset_status,
    })
}
