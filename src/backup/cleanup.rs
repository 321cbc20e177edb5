// sqlite-backup/src/backup/cleanup.rs
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};
use walkdir::WalkDir;

/// Removes leftovers of interrupted runs: files directly inside `dir` whose
/// name starts with `prefix` and that were last modified more than `max_age`
/// ago. Younger files may belong to a concurrent run and are left alone.
///
/// Best-effort; returns how many files were removed.
pub fn sweep_stale_temps(dir: &Path, prefix: &str, max_age: Duration) -> usize {
    if !dir.is_dir() {
        return 0;
    }

    let now = SystemTime::now();
    let mut removed = 0;
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "cannot list directory for stale temp files");
                continue;
            }
        };
        if !entry.file_type().is_file() || !entry.file_name().to_string_lossy().starts_with(prefix) {
            continue;
        }

        let age = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|modified| now.duration_since(modified).ok());
        match age {
            Some(age) if age > max_age => match fs::remove_file(entry.path()) {
                Ok(()) => {
                    info!(path = %entry.path().display(), "Removed stale temporary file");
                    removed += 1;
                }
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "Failed to remove stale temporary file");
                }
            },
            _ => {}
        }
    }
    removed
}
