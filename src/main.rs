//! SQLite Backup Tool
//!
//! Takes a consistent snapshot of a live SQLite database, optionally bundles
//! a media directory with it, and writes both to one timestamped archive.

// sqlite-backup/src/main.rs
mod backup;
mod config;
mod errors;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use config::{ArchiveFormat, BackupConfig, DEFAULT_BACKUP_DIR, DEFAULT_CONFIG_FILE, RawJsonConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "sqlite-backup",
    version,
    about = "Backup a SQLite database with an optional media folder into a timestamped archive"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Back up the database file given on the command line
    Snapshot {
        /// Path to the SQLite database file
        db_path: PathBuf,
        /// Path to a media folder to include
        #[arg(long)]
        media: Option<PathBuf>,
        /// Backup output directory
        #[arg(long, default_value = DEFAULT_BACKUP_DIR)]
        backup_dir: PathBuf,
        /// Archive container format
        #[arg(long, value_enum, default_value_t = ArchiveFormat::Zip)]
        format: ArchiveFormat,
        /// Where the temporary snapshot is written (defaults to the system temp dir)
        #[arg(long)]
        temp_dir: Option<PathBuf>,
        /// Print the backup report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Back up the project database described by a JSON settings file
    Project {
        /// Settings file
        #[arg(long, env = "SQLITE_BACKUP_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// Include the media directory in the archive
        #[arg(long)]
        include_media: bool,
        /// Print the backup report as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Main entry point for the backup tool
fn main() -> ExitCode {
    dotenv::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match run_app(cli) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_app(cli: Cli) -> Result<()> {
    let (backup_config, json) = match cli.command {
        Commands::Snapshot {
            db_path,
            media,
            backup_dir,
            format,
            temp_dir,
            json,
        } => {
            let mut backup_config = BackupConfig::standalone(db_path, media, backup_dir);
            backup_config.archive_format = format;
            if let Some(dir) = temp_dir {
                backup_config.temp_dir = dir;
            }
            (backup_config, json)
        }
        Commands::Project {
            config: settings_path,
            include_media,
            json,
        } => {
            let raw_config = RawJsonConfig::load_from_json(&settings_path).context(format!(
                "Failed to load project settings from {}",
                settings_path.display()
            ))?;
            let backup_config = config::load_project_config(&raw_config, include_media)
                .context("Invalid project settings")?;
            (backup_config, json)
        }
    };

    let captured_at = Local::now().naive_local();
    let report = backup::run_backup(&backup_config, captured_at).context(format!(
        "Backup of {} failed",
        backup_config.source_db_path.display()
    ))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize backup report")?
        );
    } else {
        println!(
            "✅ Backup {} created successfully: {}",
            report.format.extension(),
            report.archive_path.display()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_command_defaults() -> Result<()> {
        let cli = Cli::try_parse_from(["sqlite-backup", "snapshot", "app.db"])?;
        match cli.command {
            Commands::Snapshot {
                db_path,
                media,
                backup_dir,
                format,
                json,
                ..
            } => {
                assert_eq!(db_path, PathBuf::from("app.db"));
                assert_eq!(media, None);
                assert_eq!(backup_dir, PathBuf::from(DEFAULT_BACKUP_DIR));
                assert_eq!(format, ArchiveFormat::Zip);
                assert!(!json);
            }
            other => panic!("unexpected command: {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_snapshot_command_options() -> Result<()> {
        let cli = Cli::try_parse_from([
            "sqlite-backup",
            "snapshot",
            "/tmp/app.db",
            "--media",
            "uploads",
            "--backup-dir",
            "/tmp/out",
            "--format",
            "tar.gz",
        ])?;
        match cli.command {
            Commands::Snapshot {
                media,
                backup_dir,
                format,
                ..
            } => {
                assert_eq!(media, Some(PathBuf::from("uploads")));
                assert_eq!(backup_dir, PathBuf::from("/tmp/out"));
                assert_eq!(format, ArchiveFormat::TarGz);
            }
            other => panic!("unexpected command: {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_project_command_flags() -> Result<()> {
        let cli = Cli::try_parse_from([
            "sqlite-backup",
            "project",
            "--config",
            "settings.json",
            "--include-media",
            "--json",
        ])?;
        match cli.command {
            Commands::Project {
                config,
                include_media,
                json,
            } => {
                assert_eq!(config, PathBuf::from("settings.json"));
                assert!(include_media);
                assert!(json);
            }
            other => panic!("unexpected command: {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_unknown_format_rejected() {
        let result = Cli::try_parse_from(["sqlite-backup", "snapshot", "app.db", "--format", "rar"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_project_run_end_to_end() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("db.sqlite3");
        rusqlite::Connection::open(&db_path)?.execute_batch(
            "CREATE TABLE notes (body TEXT); INSERT INTO notes VALUES ('hello');",
        )?;
        std::fs::create_dir_all(dir.path().join("media"))?;
        std::fs::write(dir.path().join("media/logo.png"), [137u8, 80, 78, 71])?;
        let settings = dir.path().join("settings.json");
        std::fs::write(
            &settings,
            serde_json::json!({
                "database_path": "db.sqlite3",
                "base_dir": dir.path(),
                "temp_dir": "tmp"
            })
            .to_string(),
        )?;

        let settings_arg = settings.to_string_lossy().into_owned();
        let cli = Cli::try_parse_from([
            "sqlite-backup",
            "project",
            "--config",
            settings_arg.as_str(),
            "--include-media",
        ])?;
        run_app(cli)?;

        let archives: Vec<_> = std::fs::read_dir(dir.path().join("db_backups"))?
            .collect::<std::io::Result<_>>()?;
        assert_eq!(archives.len(), 1);
        let entries = backup::verification::list_entries(&archives[0].path(), ArchiveFormat::Zip)?;
        assert_eq!(entries, vec!["db.sqlite3", "media/logo.png"]);
        Ok(())
    }
}
