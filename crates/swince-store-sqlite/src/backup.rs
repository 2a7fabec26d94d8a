use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::StoreResult;

const SIDECAR_SUFFIXES: [&str; 2] = ["-wal", "-shm"];

/// Where a suspect database file was moved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub original: PathBuf,
    pub backup: PathBuf,
}

/// Move the database at `path` out of the way without touching any earlier
/// backup.
///
/// The file becomes `<path>.bak`, or `<path>-<UTC RFC 3339>.bak` when that
/// already exists (with a `-<n>` counter if even that name is taken). Its
/// `-wal`/`-shm` sidecars follow it so a new database at `path` starts with
/// no stale log to replay. Both outcomes are logged.
///
/// # Errors
/// Returns an error when the timestamp cannot be formatted or the rename
/// fails. Callers recovering service should carry on regardless.
pub fn backup(path: &Path) -> StoreResult<BackupRecord> {
    let stamp = backup_stamp(OffsetDateTime::now_utc())?;
    let target = backup_target(path, &stamp);

    if let Err(err) = fs::rename(path, &target) {
        tracing::error!(
            original = %path.display(),
            backup = %target.display(),
            error = %err,
            "failed to backup database file"
        );
        return Err(err.into());
    }

    for suffix in SIDECAR_SUFFIXES {
        let sidecar = with_suffix(path, suffix);
        if !sidecar.exists() {
            continue;
        }
        let moved = with_suffix(&target, suffix);
        if let Err(err) = fs::rename(&sidecar, &moved) {
            tracing::warn!(
                sidecar = %sidecar.display(),
                error = %err,
                "failed to move database sidecar next to its backup"
            );
        }
    }

    tracing::info!(
        original = %path.display(),
        backup = %target.display(),
        "backed up suspect database"
    );
    Ok(BackupRecord { original: path.to_path_buf(), backup: target })
}

/// Whole-second UTC timestamp used in backup names.
fn backup_stamp(now: OffsetDateTime) -> StoreResult<String> {
    let utc = now.to_offset(time::UtcOffset::UTC);
    let whole = utc - time::Duration::nanoseconds(i64::from(utc.nanosecond()));
    Ok(whole.format(&Rfc3339)?)
}

fn backup_target(path: &Path, stamp: &str) -> PathBuf {
    let plain = with_suffix(path, ".bak");
    if !plain.exists() {
        return plain;
    }

    let stamped = with_suffix(path, &format!("-{stamp}.bak"));
    if !stamped.exists() {
        return stamped;
    }

    let mut attempt: u32 = 1;
    loop {
        let candidate = with_suffix(path, &format!("-{stamp}-{attempt}.bak"));
        if !candidate.exists() {
            return candidate;
        }
        attempt += 1;
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn first_backup_takes_plain_name() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("store.db");
        fs::write(&path, b"suspect")?;

        let record = backup(&path)?;
        assert_eq!(record.backup, dir.path().join("store.db.bak"));
        assert!(!path.exists());
        assert_eq!(fs::read(&record.backup)?, b"suspect");
        Ok(())
    }

    #[test]
    fn existing_backup_is_never_overwritten() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("store.db");
        let plain = dir.path().join("store.db.bak");
        fs::write(&plain, b"older evidence")?;
        fs::write(&path, b"newer evidence")?;

        let record = backup(&path)?;
        assert_ne!(record.backup, plain);
        let name = record.backup.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        assert!(name.starts_with("store.db-"), "unexpected backup name {name}");
        assert!(name.ends_with(".bak"));
        let stamp = name.trim_start_matches("store.db-").trim_end_matches(".bak");
        let parsed = OffsetDateTime::parse(stamp, &Rfc3339)?;
        assert_eq!(parsed.nanosecond(), 0, "backup stamp {stamp} carries a fraction");
        assert_eq!(fs::read(&plain)?, b"older evidence");
        assert_eq!(fs::read(&record.backup)?, b"newer evidence");
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn stamp_drops_fractional_seconds() -> anyhow::Result<()> {
        let stamp = backup_stamp(datetime!(2026-10-19 10:00:00.123456789 +02:00))?;
        assert_eq!(stamp, "2026-10-19T08:00:00Z");
        Ok(())
    }

    #[test]
    fn same_timestamp_gets_a_counter() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("store.db");
        let stamp = "2026-10-19T08:00:00Z";
        fs::write(dir.path().join("store.db.bak"), b"")?;
        fs::write(with_suffix(&path, &format!("-{stamp}.bak")), b"")?;
        fs::write(with_suffix(&path, &format!("-{stamp}-1.bak")), b"")?;

        assert_eq!(backup_target(&path, stamp), with_suffix(&path, &format!("-{stamp}-2.bak")));
        Ok(())
    }

    #[test]
    fn sidecars_follow_the_backup() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("store.db");
        fs::write(&path, b"db")?;
        fs::write(dir.path().join("store.db-wal"), b"wal")?;
        fs::write(dir.path().join("store.db-shm"), b"shm")?;

        let record = backup(&path)?;
        assert!(!dir.path().join("store.db-wal").exists());
        assert!(!dir.path().join("store.db-shm").exists());
        assert_eq!(fs::read(with_suffix(&record.backup, "-wal"))?, b"wal");
        assert_eq!(fs::read(with_suffix(&record.backup, "-shm"))?, b"shm");
        Ok(())
    }

    #[test]
    fn missing_file_reports_an_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(backup(&dir.path().join("gone.db")).is_err());
        assert!(!dir.path().join("gone.db.bak").exists());
        Ok(())
    }
}
