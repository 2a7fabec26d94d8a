use rusqlite::Connection;

use crate::{StoreError, StoreResult};

/// Definition SQLite writes for its AUTOINCREMENT bookkeeping table, after
/// lowercasing.
const SQLITE_SEQUENCE_DEFINITION: &str = "create table sqlite_sequence(name,seq)";

/// Run `PRAGMA integrity_check` and accept only a single `ok`.
///
/// # Errors
/// [`StoreError::IntegrityQuery`] when the check cannot run at all,
/// [`StoreError::Corruption`] with the reported problems otherwise.
pub fn check_consistency(conn: &Connection) -> StoreResult<()> {
    let mut stmt = conn.prepare("PRAGMA integrity_check").map_err(StoreError::IntegrityQuery)?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(StoreError::IntegrityQuery)?;

    let mut messages = Vec::new();
    for row in rows {
        messages.push(row.map_err(StoreError::IntegrityQuery)?);
    }

    match messages.as_slice() {
        [only] if only.eq_ignore_ascii_case("ok") => Ok(()),
        _ => Err(StoreError::Corruption(messages.join("; "))),
    }
}

/// Table definitions currently stored in a database file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaSnapshot {
    raw: String,
    normalized: String,
}

impl SchemaSnapshot {
    /// Read every table's `CREATE` statement in the order SQLite lists them.
    ///
    /// # Errors
    /// Returns [`StoreError::SchemaFetch`] when `sqlite_master` cannot be read.
    pub fn fetch(conn: &Connection) -> StoreResult<Self> {
        let mut stmt = conn
            .prepare("SELECT sql FROM sqlite_master WHERE type = 'table'")
            .map_err(StoreError::SchemaFetch)?;
        let mut rows = stmt.query([]).map_err(StoreError::SchemaFetch)?;

        let mut raw = String::new();
        while let Some(row) = rows.next().map_err(StoreError::SchemaFetch)? {
            let sql: Option<String> = row.get(0).map_err(StoreError::SchemaFetch)?;
            raw.push_str(sql.as_deref().unwrap_or_default());
            raw.push('\n');
        }

        Ok(Self::from_sql(raw))
    }

    pub fn from_sql(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let normalized = normalize_sql(&raw);
        Self { raw, normalized }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn normalized(&self) -> &str {
        &self.normalized
    }
}

/// Canonical form used to compare schema texts.
///
/// Drops `--` comments, lowercases, removes SQLite's `sqlite_sequence`
/// definition and statement terminators, then collapses all whitespace runs
/// to single spaces. Statements are never reordered.
pub fn normalize_sql(sql: &str) -> String {
    let without_comments = sql
        .lines()
        .map(|line| line.find("--").map_or(line, |idx| &line[..idx]))
        .collect::<Vec<_>>()
        .join(" ");

    without_comments
        .to_lowercase()
        .replace(SQLITE_SEQUENCE_DEFINITION, "")
        .replace(';', "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Compare the live schema against `expected`.
///
/// # Errors
/// [`StoreError::SchemaMismatch`] carries both normalized forms so the
/// difference can be read from the log after the file has been replaced.
pub fn check_schema(conn: &Connection, expected: &str) -> StoreResult<SchemaSnapshot> {
    let actual = SchemaSnapshot::fetch(conn)?;
    let expected = normalize_sql(expected);
    if actual.normalized() != expected {
        return Err(StoreError::SchemaMismatch {
            expected,
            actual: actual.normalized().to_string(),
        });
    }
    Ok(actual)
}
