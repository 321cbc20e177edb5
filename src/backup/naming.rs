// sqlite-backup/src/backup/naming.rs
use chrono::NaiveDateTime;

use crate::config::ArchiveFormat;

/// Highest numeric suffix tried when the plain archive name is already taken.
pub const MAX_COLLISION_SUFFIX: u32 = 99;

/// `backup_<YYYY-MM-DD>_<weekday>_<HH-MM-SS>`, zero padded so that a plain
/// string sort of a backup directory is chronological.
pub fn archive_stem(captured_at: &NaiveDateTime) -> String {
    format!("backup_{}", captured_at.format("%Y-%m-%d_%a_%H-%M-%S"))
}

/// Name for the given attempt. Attempt 0 is the plain name; later attempts
/// carry a two digit suffix, which still sorts after the plain name and
/// before the next second.
pub fn archive_file_name(captured_at: &NaiveDateTime, format: ArchiveFormat, attempt: u32) -> String {
    let stem = archive_stem(captured_at);
    if attempt == 0 {
        format!("{}.{}", stem, format.extension())
    } else {
        format!("{}_{:02}.{}", stem, attempt, format.extension())
    }
}

pub fn candidate_names(
    captured_at: &NaiveDateTime,
    format: ArchiveFormat,
) -> impl Iterator<Item = String> + '_ {
    (0..=MAX_COLLISION_SUFFIX).map(move |attempt| archive_file_name(captured_at, format, attempt))
}
