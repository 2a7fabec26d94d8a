use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use rusqlite::Connection;
use swince_store_sqlite::{
    check_consistency, check_schema, normalize_sql, setup, StorageHandle, StoreConfig, SCHEMA_SQL,
};
use ulid::Ulid;

fn scratch_config(dir: &Path) -> StoreConfig {
    StoreConfig::new(dir.join(format!("{}.db", Ulid::new())), 2000)
}

fn backups(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "bak") {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

fn assert_valid(handle: &StorageHandle) -> Result<()> {
    let snapshot = handle.schema_snapshot()?;
    assert_eq!(snapshot.normalized(), normalize_sql(SCHEMA_SQL));

    let conn = Connection::open(handle.path())?;
    check_consistency(&conn)?;
    check_schema(&conn, SCHEMA_SQL)?;
    let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
    assert_eq!(mode.to_lowercase(), "wal");
    Ok(())
}

fn write_garbage(path: &Path) -> Result<()> {
    fs::write(path, vec![0xa5; 16 * 1024])?;
    Ok(())
}

#[test]
fn fresh_directory_creates_the_database() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = StoreConfig::new(dir.path().join("store.db"), 16_000);

    let handle = setup(&config)?;
    assert!(config.path.exists());
    assert_valid(&handle)?;
    assert!(backups(dir.path())?.is_empty());
    handle.close()?;
    Ok(())
}

#[test]
fn extra_column_is_backed_up_and_replaced() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = StoreConfig::new(dir.path().join("store.db"), 16_000);
    {
        let drifted = SCHEMA_SQL
            .replace("created_at TEXT NOT NULL", "created_at TEXT NOT NULL,\n  caption TEXT");
        assert_ne!(drifted, SCHEMA_SQL);
        let conn = Connection::open(&config.path)?;
        conn.execute_batch(&drifted)?;
    }

    let handle = setup(&config)?;
    assert_valid(&handle)?;
    handle.close()?;

    let backup = dir.path().join("store.db.bak");
    assert_eq!(backups(dir.path())?, vec![backup.clone()]);
    let old = Connection::open(&backup)?;
    let old_schema: String = old.query_row(
        "SELECT sql FROM sqlite_master WHERE name = 'swinces'",
        [],
        |row| row.get(0),
    )?;
    assert!(old_schema.contains("caption"));
    Ok(())
}

#[test]
fn garbage_file_is_replaced() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = scratch_config(dir.path());
    write_garbage(&config.path)?;

    let handle = setup(&config)?;
    assert_valid(&handle)?;
    handle.close()?;

    let found = backups(dir.path())?;
    assert_eq!(found.len(), 1);
    assert_eq!(fs::read(&found[0])?, vec![0xa5; 16 * 1024]);
    Ok(())
}

#[test]
fn truncated_file_is_replaced() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = scratch_config(dir.path());
    {
        let handle = setup(&config)?;
        let swince = handle.create_swince(&[7; 8192])?;
        handle.create_swinceur(&swince_store_sqlite::SwinceurParams {
            swince_id: swince.swince_id,
            discord_id: 42,
            late_swince_tax: 0.0,
            nominates: Some(43),
        })?;
        handle.close()?;
    }
    let file = fs::OpenOptions::new().write(true).open(&config.path)?;
    file.set_len(4096)?;
    drop(file);

    let handle = setup(&config)?;
    assert_valid(&handle)?;
    assert!(handle.unfulfilled_nominations(43)?.is_empty());
    handle.close()?;
    assert_eq!(backups(dir.path())?.len(), 1);
    Ok(())
}

#[test]
fn valid_file_is_left_alone() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = scratch_config(dir.path());

    let first = setup(&config)?;
    let before = first.schema_snapshot()?;
    first.close()?;

    let second = setup(&config)?;
    let after = second.schema_snapshot()?;
    second.close()?;

    assert_eq!(before.raw(), after.raw());
    assert!(backups(dir.path())?.is_empty());
    Ok(())
}

#[test]
fn repeated_recovery_never_overwrites_a_backup() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = StoreConfig::new(dir.path().join("store.db"), 16_000);
    let plain = dir.path().join("store.db.bak");
    fs::write(&plain, b"evidence from an earlier run")?;

    write_garbage(&config.path)?;
    setup(&config)?.close()?;
    write_garbage(&config.path)?;
    let handle = setup(&config)?;
    assert_valid(&handle)?;
    handle.close()?;

    let found = backups(dir.path())?;
    assert_eq!(found.len(), 3, "backups: {found:?}");
    assert_eq!(fs::read(&plain)?, b"evidence from an earlier run");
    for path in found.iter().filter(|path| **path != plain) {
        assert_eq!(fs::read(path)?, vec![0xa5; 16 * 1024]);
    }
    Ok(())
}

#[test]
fn unusable_location_is_fatal() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = StoreConfig::new(dir.path().join("no-such-dir").join("store.db"), 16_000);

    let err = match setup(&config) {
        Ok(_) => panic!("setup succeeded without a parent directory"),
        Err(err) => err,
    };
    assert!(!err.is_recoverable(), "unexpected error: {err}");
    Ok(())
}
