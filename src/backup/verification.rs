// sqlite-backup/src/backup/verification.rs
use flate2::read::GzDecoder;
use std::fs::File;
use std::path::Path;
use tracing::info;

use super::archive::{DB_ENTRY_NAME, MEDIA_PREFIX};
use crate::config::ArchiveFormat;
use crate::errors::{BackupError, Result};

/// Lists the entry names stored in a finished archive, sorted.
pub fn list_entries(archive_path: &Path, format: ArchiveFormat) -> Result<Vec<String>> {
    let file = File::open(archive_path).map_err(|e| {
        BackupError::VerificationFailed(format!(
            "cannot open {}: {}",
            archive_path.display(),
            e
        ))
    })?;

    let mut names = match format {
        ArchiveFormat::Zip => {
            let archive = zip::ZipArchive::new(file).map_err(|e| {
                BackupError::VerificationFailed(format!(
                    "{} is not a readable zip archive: {}",
                    archive_path.display(),
                    e
                ))
            })?;
            archive.file_names().map(str::to_string).collect::<Vec<_>>()
        }
        ArchiveFormat::TarGz => {
            let mut archive = tar::Archive::new(GzDecoder::new(file));
            let unreadable = |e: std::io::Error| {
                BackupError::VerificationFailed(format!(
                    "{} is not a readable tar.gz archive: {}",
                    archive_path.display(),
                    e
                ))
            };
            let mut names = Vec::new();
            for entry in archive.entries().map_err(unreadable)? {
                let entry = entry.map_err(unreadable)?;
                let path = entry.path().map_err(unreadable)?;
                names.push(path.to_string_lossy().into_owned());
            }
            names
        }
    };
    names.sort();
    Ok(names)
}

/// Checks that the archive holds exactly one database entry and the
/// expected number of media entries, and nothing else.
pub fn verify_archive(
    archive_path: &Path,
    format: ArchiveFormat,
    expected_assets: usize,
) -> Result<()> {
    let names = list_entries(archive_path, format)?;
    let media_prefix = format!("{}/", MEDIA_PREFIX);

    let db_entries = names.iter().filter(|n| n.as_str() == DB_ENTRY_NAME).count();
    let media_entries = names.iter().filter(|n| n.starts_with(&media_prefix)).count();

    if db_entries != 1 {
        return Err(BackupError::VerificationFailed(format!(
            "expected one {} entry in {}, found {}",
            DB_ENTRY_NAME,
            archive_path.display(),
            db_entries
        )));
    }
    if media_entries != expected_assets {
        return Err(BackupError::VerificationFailed(format!(
            "expected {} media entries in {}, found {}",
            expected_assets,
            archive_path.display(),
            media_entries
        )));
    }
    if names.len() != 1 + media_entries {
        return Err(BackupError::VerificationFailed(format!(
            "unexpected entries in {}: {:?}",
            archive_path.display(),
            names
        )));
    }

    info!(
        archive = %archive_path.display(),
        entries = names.len(),
        "Archive verified"
    );
    Ok(())
}
