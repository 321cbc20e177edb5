// sqlite-backup/src/config/mod.rs
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::BackupError;

pub const DEFAULT_BACKUP_DIR: &str = "db_backups";
pub const DEFAULT_MEDIA_DIR: &str = "media";
pub const DEFAULT_CONFIG_FILE: &str = "config.json";
/// Negative page counts copy the whole database in a single backup step.
pub const DEFAULT_PAGES_PER_STEP: i32 = -1;
pub const DEFAULT_BUSY_RETRIES: u32 = 50;
pub const DEFAULT_STALE_TEMP_MAX_AGE_SECS: u64 = 3600;

/// Container format of the produced archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
pub enum ArchiveFormat {
    #[default]
    #[serde(rename = "zip")]
    #[value(name = "zip")]
    Zip,
    #[serde(rename = "tar.gz")]
    #[value(name = "tar.gz")]
    TarGz,
}

impl ArchiveFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::TarGz => "tar.gz",
        }
    }
}

// Structs for deserializing the project settings file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub database_path: Option<PathBuf>,
    pub base_dir: Option<PathBuf>,
    pub media_dir: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
    pub archive_format: Option<ArchiveFormat>,
    pub pages_per_step: Option<i32>,
    pub busy_retries: Option<u32>,
    pub stale_temp_max_age_secs: Option<u64>,
    pub verify_archive: Option<bool>,
}

/// Fully resolved configuration handed to the backup core.
///
/// The core performs no configuration lookups of its own; both CLI shells
/// build one of these and pass it in.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub source_db_path: PathBuf,
    pub media_dir: Option<PathBuf>,
    pub local_backup_path: PathBuf,
    pub temp_dir: PathBuf,
    pub archive_format: ArchiveFormat,
    pub pages_per_step: i32,
    pub busy_retries: u32,
    pub stale_temp_max_age: Duration,
    pub verify_archive: bool,
}

impl BackupConfig {
    /// Configuration for the standalone invocation: explicit paths, defaults for the rest.
    pub fn standalone(
        source_db_path: PathBuf,
        media_dir: Option<PathBuf>,
        local_backup_path: PathBuf,
    ) -> Self {
        BackupConfig {
            source_db_path,
            media_dir,
            local_backup_path,
            temp_dir: std::env::temp_dir(),
            archive_format: ArchiveFormat::default(),
            pages_per_step: DEFAULT_PAGES_PER_STEP,
            busy_retries: DEFAULT_BUSY_RETRIES,
            stale_temp_max_age: Duration::from_secs(DEFAULT_STALE_TEMP_MAX_AGE_SECS),
            verify_archive: true,
        }
    }
}

impl RawJsonConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;
        Ok(raw_json_config)
    }
}

/// Resolves project settings into a [`BackupConfig`].
///
/// Relative paths are taken relative to `base_dir`. The media directory is
/// only carried through when `include_media` is set.
pub fn load_project_config(
    raw_config: &RawJsonConfig,
    include_media: bool,
) -> crate::errors::Result<BackupConfig> {
    let base_dir = raw_config
        .base_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));

    let database_path = raw_config
        .database_path
        .as_ref()
        .ok_or_else(|| BackupError::Config("database_path must be set in the settings file".into()))?;
    if database_path.as_os_str().is_empty() {
        return Err(BackupError::Config(
            "database_path cannot be empty in the settings file".into(),
        ));
    }

    let backup_dir = raw_config
        .backup_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BACKUP_DIR));
    if backup_dir.as_os_str().is_empty() {
        return Err(BackupError::Config(
            "backup_dir cannot be empty in the settings file".into(),
        ));
    }

    let pages_per_step = raw_config.pages_per_step.unwrap_or(DEFAULT_PAGES_PER_STEP);
    if pages_per_step == 0 {
        return Err(BackupError::Config(
            "pages_per_step must be positive, or negative to copy everything in one step".into(),
        ));
    }

    let media_dir = include_media.then(|| {
        let media = raw_config
            .media_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MEDIA_DIR));
        resolve(&base_dir, &media)
    });

    let temp_dir = raw_config
        .temp_dir
        .as_ref()
        .map(|dir| resolve(&base_dir, dir))
        .unwrap_or_else(std::env::temp_dir);

    Ok(BackupConfig {
        source_db_path: resolve(&base_dir, database_path),
        media_dir,
        local_backup_path: resolve(&base_dir, &backup_dir),
        temp_dir,
        archive_format: raw_config.archive_format.unwrap_or_default(),
        pages_per_step,
        busy_retries: raw_config.busy_retries.unwrap_or(DEFAULT_BUSY_RETRIES),
        stale_temp_max_age: Duration::from_secs(
            raw_config
                .stale_temp_max_age_secs
                .unwrap_or(DEFAULT_STALE_TEMP_MAX_AGE_SECS),
        ),
        verify_archive: raw_config.verify_archive.unwrap_or(true),
    })
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}
