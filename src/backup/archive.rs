// sqlite-backup/src/backup/archive.rs
use chrono::{Datelike, NaiveDateTime, Timelike};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tar::Builder;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::AssetStatus;
use super::naming::{archive_stem, candidate_names};
use super::snapshot::SnapshotHandle;
use super::verification::verify_archive;
use crate::config::ArchiveFormat;
use crate::errors::{BackupError, Result};

/// Entry name of the database snapshot inside every archive.
pub const DB_ENTRY_NAME: &str = "db.sqlite3";
/// Asset files live under this directory inside the archive.
pub const MEDIA_PREFIX: &str = "media";
/// In-progress archives are written under this prefix in the destination
/// directory and only renamed to their final name once complete.
pub const PARTIAL_PREFIX: &str = ".backup-partial-";
pub const PARTIAL_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub source: PathBuf,
    pub name: String,
}

#[derive(Debug)]
pub struct ArchiveOutcome {
    pub path: PathBuf,
    pub bytes: u64,
    pub asset_entries: usize,
    pub asset_status: AssetStatus,
}

/// Writer side of one container format.
trait ArchiveSink {
    fn append_file(&mut self, name: &str, file: &mut File) -> io::Result<()>;
    fn finish(self: Box<Self>) -> io::Result<()>;
}

struct ZipSink<'a> {
    writer: ZipWriter<&'a mut File>,
    options: SimpleFileOptions,
}

impl<'a> ZipSink<'a> {
    fn new(out: &'a mut File, captured_at: &NaiveDateTime) -> Self {
        let mut options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(0o644);
        if let Some(stamp) = zip_timestamp(captured_at) {
            options = options.last_modified_time(stamp);
        }
        ZipSink {
            writer: ZipWriter::new(out),
            options,
        }
    }
}

impl ArchiveSink for ZipSink<'_> {
    fn append_file(&mut self, name: &str, file: &mut File) -> io::Result<()> {
        let size = file.metadata()?.len();
        let options = self.options.clone().large_file(size >= u64::from(u32::MAX));
        self.writer.start_file(name, options).map_err(io::Error::other)?;
        io::copy(file, &mut self.writer)?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> io::Result<()> {
        self.writer.finish().map_err(io::Error::other)?;
        Ok(())
    }
}

struct TarGzSink<'a> {
    builder: Builder<GzEncoder<&'a mut File>>,
}

impl<'a> TarGzSink<'a> {
    fn new(out: &'a mut File) -> Self {
        let enc = GzEncoder::new(out, Compression::default());
        TarGzSink {
            builder: Builder::new(enc),
        }
    }
}

impl ArchiveSink for TarGzSink<'_> {
    fn append_file(&mut self, name: &str, file: &mut File) -> io::Result<()> {
        self.builder.append_file(name, file)
    }

    fn finish(self: Box<Self>) -> io::Result<()> {
        let encoder = self.builder.into_inner()?;
        encoder.finish()?;
        Ok(())
    }
}

/// Lazily walks `root` and yields one entry per regular file, named
/// `media/<relative path>` with `/` separators. Symlinks are not followed.
pub fn asset_entries(root: &Path) -> impl Iterator<Item = Result<ArchiveEntry>> + '_ {
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(move |entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().unwrap_or(root).to_path_buf();
                    return Some(Err(BackupError::asset_read_failed(path, e)));
                }
            };
            if !entry.file_type().is_file() {
                if entry.path_is_symlink() {
                    debug!(path = %entry.path().display(), "skipping symlink in media directory");
                }
                return None;
            }
            let name = match entry.path().strip_prefix(root) {
                Ok(relative) => match media_entry_name(entry.path(), relative) {
                    Ok(name) => name,
                    Err(e) => return Some(Err(e)),
                },
                Err(e) => return Some(Err(BackupError::asset_read_failed(entry.path(), e))),
            };
            Some(Ok(ArchiveEntry {
                source: entry.into_path(),
                name,
            }))
        })
}

/// Fails on a file name that is not valid UTF-8 instead of mangling it.
fn media_entry_name(source: &Path, relative: &Path) -> Result<String> {
    let mut name = String::from(MEDIA_PREFIX);
    for component in relative.components() {
        let part = component.as_os_str().to_str().ok_or_else(|| {
            BackupError::asset_read_failed(source, "file name is not valid UTF-8")
        })?;
        name.push('/');
        name.push_str(part);
    }
    Ok(name)
}

fn zip_timestamp(captured_at: &NaiveDateTime) -> Option<zip::DateTime> {
    zip::DateTime::from_date_and_time(
        u16::try_from(captured_at.year()).ok()?,
        captured_at.month() as u8,
        captured_at.day() as u8,
        captured_at.hour() as u8,
        captured_at.minute() as u8,
        captured_at.second() as u8,
    )
    .ok()
}

/// Builds the writer for one container format on top of the partial file.
type SinkFactory =
    for<'a> fn(&'a mut File, ArchiveFormat, &NaiveDateTime) -> Box<dyn ArchiveSink + 'a>;

fn open_sink<'a>(
    out: &'a mut File,
    format: ArchiveFormat,
    captured_at: &NaiveDateTime,
) -> Box<dyn ArchiveSink + 'a> {
    match format {
        ArchiveFormat::Zip => Box::new(ZipSink::new(out, captured_at)),
        ArchiveFormat::TarGz => Box::new(TarGzSink::new(out)),
    }
}

/// Packs the snapshot and the optional media directory into one archive in
/// `destination`, then deletes the snapshot whether or not that succeeded.
///
/// With `verify` set, the finished file is reopened and checked before it is
/// given its final name; a mismatch leaves nothing behind.
pub fn assemble_archive(
    snapshot: SnapshotHandle,
    media_dir: Option<&Path>,
    destination: &Path,
    captured_at: &NaiveDateTime,
    format: ArchiveFormat,
    verify: bool,
) -> Result<ArchiveOutcome> {
    assemble_with(snapshot, media_dir, destination, captured_at, format, verify, open_sink)
}

fn assemble_with(
    snapshot: SnapshotHandle,
    media_dir: Option<&Path>,
    destination: &Path,
    captured_at: &NaiveDateTime,
    format: ArchiveFormat,
    verify: bool,
    make_sink: SinkFactory,
) -> Result<ArchiveOutcome> {
    let result = write_archive(
        &snapshot,
        media_dir,
        destination,
        captured_at,
        format,
        verify,
        make_sink,
    );
    let snapshot_path = snapshot.path().to_path_buf();
    if let Err(e) = snapshot.discard() {
        warn!(
            path = %snapshot_path.display(),
            error = %e,
            "failed to delete temporary snapshot"
        );
    }
    result
}

fn write_archive(
    snapshot: &SnapshotHandle,
    media_dir: Option<&Path>,
    destination: &Path,
    captured_at: &NaiveDateTime,
    format: ArchiveFormat,
    verify: bool,
    make_sink: SinkFactory,
) -> Result<ArchiveOutcome> {
    fs::create_dir_all(destination)
        .map_err(|e| BackupError::archive_write_failed(destination, e))?;

    // Dropping `partial` on any early return deletes the in-progress file.
    let mut partial = tempfile::Builder::new()
        .prefix(PARTIAL_PREFIX)
        .suffix(PARTIAL_SUFFIX)
        .tempfile_in(destination)
        .map_err(|e| BackupError::archive_write_failed(destination, e))?;
    debug!(partial = %partial.path().display(), "writing archive");

    let (asset_count, asset_status) = {
        let mut sink = make_sink(partial.as_file_mut(), format, captured_at);
        let assets = append_entries(sink.as_mut(), snapshot.path(), media_dir, destination)?;
        sink.finish()
            .map_err(|e| BackupError::archive_write_failed(destination, e))?;
        assets
    };

    partial
        .as_file()
        .sync_all()
        .map_err(|e| BackupError::archive_write_failed(destination, e))?;

    if verify {
        verify_archive(partial.path(), format, asset_count)?;
    }

    let path = persist_unique(partial, destination, captured_at, format)?;
    let bytes = fs::metadata(&path)
        .map_err(|e| BackupError::archive_write_failed(&path, e))?
        .len();

    info!(
        archive = %path.display(),
        bytes,
        assets = asset_count,
        "Backup archive created"
    );
    Ok(ArchiveOutcome {
        path,
        bytes,
        asset_entries: asset_count,
        asset_status,
    })
}

/// Writes `db.sqlite3` followed by the media tree into `sink`.
fn append_entries(
    sink: &mut (dyn ArchiveSink + '_),
    snapshot_path: &Path,
    media_dir: Option<&Path>,
    destination: &Path,
) -> Result<(usize, AssetStatus)> {
    let mut db_file = File::open(snapshot_path).map_err(|e| {
        BackupError::archive_write_failed(
            snapshot_path,
            format!("cannot reopen snapshot: {}", e),
        )
    })?;
    sink.append_file(DB_ENTRY_NAME, &mut db_file)
        .map_err(|e| BackupError::archive_write_failed(destination, e))?;

    match media_dir {
        None => Ok((0, AssetStatus::NotRequested)),
        Some(dir) if dir.is_dir() => {
            info!(media = %dir.display(), "Adding media folder to archive");
            let mut count = 0usize;
            for entry in asset_entries(dir) {
                let entry = entry?;
                let mut file = File::open(&entry.source)
                    .map_err(|e| BackupError::asset_read_failed(&entry.source, e))?;
                sink.append_file(&entry.name, &mut file)
                    .map_err(|e| BackupError::archive_write_failed(destination, e))?;
                count += 1;
            }
            Ok((count, AssetStatus::Included))
        }
        Some(dir) => {
            warn!(
                media = %dir.display(),
                "Media directory not found, skipping media backup"
            );
            Ok((
                0,
                AssetStatus::Missing {
                    path: dir.to_path_buf(),
                },
            ))
        }
    }
}

/// Renames the finished archive to the first free candidate name. Existing
/// files are never overwritten.
fn persist_unique(
    mut partial: NamedTempFile,
    destination: &Path,
    captured_at: &NaiveDateTime,
    format: ArchiveFormat,
) -> Result<PathBuf> {
    for name in candidate_names(captured_at, format) {
        let target = destination.join(&name);
        match partial.persist_noclobber(&target) {
            Ok(_) => return Ok(target),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                debug!(target = %target.display(), "archive name taken, trying next suffix");
                partial = e.file;
            }
            Err(e) => return Err(BackupError::archive_write_failed(&target, e.error)),
        }
    }
    Err(BackupError::archive_write_failed(
        destination,
        format!("every archive name for {} is already taken", archive_stem(captured_at)),
    ))
}
