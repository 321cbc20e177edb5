// sqlite-backup/src/backup/snapshot.rs
use rusqlite::backup::{Backup, StepResult};
use rusqlite::{Connection, OpenFlags};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tempfile::TempPath;
use tracing::{debug, info};

use crate::config::BackupConfig;
use crate::errors::{BackupError, Result};

/// Every snapshot temp file starts with this, so leftovers from an
/// interrupted run can be recognised and swept.
pub const SNAPSHOT_PREFIX: &str = ".sqlite-snapshot-";
pub const SNAPSHOT_SUFFIX: &str = ".sqlite3";

const BUSY_PAUSE: Duration = Duration::from_millis(100);
const SIDECAR_SUFFIXES: [&str; 3] = ["-journal", "-wal", "-shm"];

/// A consistent copy of the source database in a private temp file.
///
/// The file (and any SQLite sidecar files next to it) is removed when the
/// handle is dropped.
#[derive(Debug)]
pub struct SnapshotHandle {
    path: PathBuf,
    temp: Option<TempPath>,
    size: u64,
}

impl SnapshotHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Deletes the snapshot now, reporting a failed delete instead of ignoring it.
    pub fn discard(mut self) -> io::Result<()> {
        remove_sidecars(&self.path);
        match self.temp.take() {
            Some(temp) => temp.close(),
            None => Ok(()),
        }
    }
}

impl Drop for SnapshotHandle {
    fn drop(&mut self) {
        if let Some(temp) = self.temp.take() {
            drop(temp);
            remove_sidecars(&self.path);
        }
    }
}

/// Copies the live database at `source_db_path` through SQLite's online
/// backup API into a fresh temp file under `config.temp_dir`.
///
/// Writers on the source are not locked out; the copy reflects a single
/// committed state of the source.
pub fn create_snapshot(source_db_path: &Path, config: &BackupConfig) -> Result<SnapshotHandle> {
    let source_conn = open_source(source_db_path)?;

    fs::create_dir_all(&config.temp_dir).map_err(|e| {
        BackupError::copy_failed(format!(
            "cannot create temp directory {}: {}",
            config.temp_dir.display(),
            e
        ))
    })?;
    let temp = tempfile::Builder::new()
        .prefix(SNAPSHOT_PREFIX)
        .suffix(SNAPSHOT_SUFFIX)
        .tempfile_in(&config.temp_dir)
        .map_err(|e| {
            BackupError::copy_failed(format!(
                "cannot allocate snapshot file in {}: {}",
                config.temp_dir.display(),
                e
            ))
        })?
        .into_temp_path();

    let mut handle = SnapshotHandle {
        path: temp.to_path_buf(),
        temp: Some(temp),
        size: 0,
    };
    debug!(
        source = %source_db_path.display(),
        snapshot = %handle.path.display(),
        "copying database with the online backup API"
    );

    // On error the handle drops here and takes the partial file with it.
    copy_online(&source_conn, &handle.path, config.pages_per_step, config.busy_retries)?;

    handle.size = fs::metadata(&handle.path)
        .map_err(|e| BackupError::copy_failed(format!("cannot stat snapshot: {}", e)))?
        .len();

    info!(
        snapshot = %handle.path.display(),
        bytes = handle.size,
        "SQLite snapshot created"
    );
    Ok(handle)
}

fn open_source(source_db_path: &Path) -> Result<Connection> {
    let metadata = fs::metadata(source_db_path)
        .map_err(|e| BackupError::source_unreadable(source_db_path, e))?;
    if !metadata.is_file() {
        return Err(BackupError::source_unreadable(
            source_db_path,
            "not a regular file",
        ));
    }

    let conn = Connection::open_with_flags(
        source_db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| BackupError::source_unreadable(source_db_path, e))?;

    // Open is lazy; a file that is not a database only fails on first read.
    conn.query_row("PRAGMA schema_version", [], |row| row.get::<_, i64>(0))
        .map_err(|e| BackupError::source_unreadable(source_db_path, e))?;

    Ok(conn)
}

fn copy_online(
    source: &Connection,
    dest_path: &Path,
    pages_per_step: i32,
    busy_retries: u32,
) -> Result<()> {
    let mut dest = Connection::open(dest_path).map_err(BackupError::copy_failed)?;
    {
        let backup = Backup::new(source, &mut dest).map_err(BackupError::copy_failed)?;
        let mut busy_count = 0u32;
        loop {
            match backup.step(pages_per_step).map_err(BackupError::copy_failed)? {
                StepResult::Done => break,
                StepResult::More => {
                    let progress = backup.progress();
                    debug!(
                        remaining = progress.remaining,
                        pagecount = progress.pagecount,
                        "backup step"
                    );
                }
                _ => {
                    busy_count += 1;
                    if busy_count > busy_retries {
                        return Err(BackupError::copy_failed(format!(
                            "source database still locked after {} retries",
                            busy_retries
                        )));
                    }
                    debug!(attempt = busy_count, "source database busy, retrying backup step");
                    thread::sleep(BUSY_PAUSE);
                }
            }
        }
    }
    dest.close().map_err(|(_, e)| BackupError::copy_failed(e))?;
    Ok(())
}

fn remove_sidecars(path: &Path) {
    for suffix in SIDECAR_SUFFIXES {
        let mut sidecar: OsString = path.as_os_str().to_owned();
        sidecar.push(suffix);
        let sidecar = PathBuf::from(sidecar);
        if let Err(e) = fs::remove_file(&sidecar) {
            if e.kind() != io::ErrorKind::NotFound {
                debug!(path = %sidecar.display(), error = %e, "could not remove snapshot sidecar");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::test_support::{count_rows, create_test_db, leftover_snapshots, test_config};

    #[test]
    fn test_snapshot_preserves_rows_and_integrity() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("app.db");
        create_test_db(&db_path, 3)?;
        let config = test_config(dir.path(), &db_path);

        let snapshot = create_snapshot(&db_path, &config)?;
        assert!(snapshot.path().starts_with(&config.temp_dir));
        assert!(snapshot.size() > 0);

        let conn = Connection::open(snapshot.path())?;
        let integrity: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        assert_eq!(integrity, "ok");
        drop(conn);
        assert_eq!(count_rows(snapshot.path())?, 3);

        snapshot.discard()?;
        assert!(leftover_snapshots(&config.temp_dir)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_dropping_handle_removes_snapshot() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("app.db");
        create_test_db(&db_path, 1)?;
        let config = test_config(dir.path(), &db_path);

        let snapshot = create_snapshot(&db_path, &config)?;
        let path = snapshot.path().to_path_buf();
        assert!(path.exists());
        drop(snapshot);
        assert!(!path.exists());
        assert!(leftover_snapshots(&config.temp_dir)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_missing_source_is_unreadable() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("missing.db");
        let config = test_config(dir.path(), &db_path);

        let result = create_snapshot(&db_path, &config);
        assert!(matches!(result, Err(BackupError::SourceUnreadable { .. })));
        assert!(!db_path.exists());
        assert!(leftover_snapshots(&config.temp_dir)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_non_database_file_is_unreadable() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("notes.txt");
        fs::write(&db_path, "not a sqlite database\n".repeat(64))?;
        let config = test_config(dir.path(), &db_path);

        let result = create_snapshot(&db_path, &config);
        assert!(matches!(result, Err(BackupError::SourceUnreadable { .. })));
        assert!(leftover_snapshots(&config.temp_dir)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_directory_source_is_unreadable() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = test_config(dir.path(), dir.path());
        let result = create_snapshot(dir.path(), &config);
        assert!(matches!(result, Err(BackupError::SourceUnreadable { .. })));
        Ok(())
    }

    #[test]
    fn test_unusable_temp_dir_is_copy_failure() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("app.db");
        create_test_db(&db_path, 2)?;
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"file, not a directory")?;
        let mut config = test_config(dir.path(), &db_path);
        config.temp_dir = blocker.join("tmp");

        let result = create_snapshot(&db_path, &config);
        assert!(matches!(result, Err(BackupError::CopyFailed { .. })));
        Ok(())
    }

    #[test]
    fn test_wal_database_without_sidecars_opens_read_only() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("wal.db");
        create_test_db(&db_path, 4)?;
        {
            let conn = Connection::open(&db_path)?;
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))?;
        }
        // The last connection to close checkpoints and removes -wal and -shm.
        let mut wal = db_path.as_os_str().to_owned();
        wal.push("-wal");
        assert!(!PathBuf::from(wal).exists());
        let config = test_config(dir.path(), &db_path);

        let snapshot = create_snapshot(&db_path, &config)?;
        assert_eq!(count_rows(snapshot.path())?, 4);
        Ok(())
    }

    #[test]
    fn test_chunked_copy_matches_source() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("app.db");
        create_test_db(&db_path, 500)?;
        let mut config = test_config(dir.path(), &db_path);
        config.pages_per_step = 1;

        let snapshot = create_snapshot(&db_path, &config)?;
        assert_eq!(count_rows(snapshot.path())?, 500);
        Ok(())
    }

    #[test]
    fn test_snapshot_consistent_under_concurrent_writer() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("live.db");
        create_test_db(&db_path, 10)?;
        {
            let conn = Connection::open(&db_path)?;
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))?;
        }
        let config = test_config(dir.path(), &db_path);
        let total_writes = 300;

        let counts = thread::scope(|scope| -> anyhow::Result<Vec<i64>> {
            let writer = scope.spawn(|| -> anyhow::Result<()> {
                let conn = Connection::open(&db_path)?;
                conn.busy_timeout(Duration::from_secs(5))?;
                for i in 0..total_writes {
                    conn.execute(
                        "INSERT INTO items (name) VALUES (?1)",
                        [format!("concurrent-{}", i)],
                    )?;
                }
                Ok(())
            });

            let mut counts = Vec::new();
            for _ in 0..5 {
                let snapshot = create_snapshot(&db_path, &config)?;
                let conn = Connection::open(snapshot.path())?;
                let integrity: String =
                    conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
                assert_eq!(integrity, "ok");
                drop(conn);
                counts.push(count_rows(snapshot.path())?);
            }
            writer.join().expect("writer thread panicked")?;
            Ok(counts)
        })?;

        for count in counts {
            assert!((10..=10 + total_writes).contains(&count));
        }
        assert!(leftover_snapshots(&config.temp_dir)?.is_empty());
        Ok(())
    }
}
