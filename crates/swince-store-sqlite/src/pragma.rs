use rusqlite::Connection;

use crate::{StoreConfig, StoreError, StoreResult};

/// One runtime directive that must hold before a connection is usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PragmaConstraint {
    pub name: &'static str,
    pub value: String,
}

impl PragmaConstraint {
    fn new(name: &'static str, value: impl Into<String>) -> Self {
        Self { name, value: value.into() }
    }

    fn statement(&self) -> String {
        format!("PRAGMA {} = {};", self.name, self.value)
    }
}

const FIXED_PRAGMAS: [(&str, &str); 6] = [
    ("busy_timeout", "10000"),
    ("journal_mode", "WAL"),
    ("journal_size_limit", "200000000"),
    ("synchronous", "NORMAL"),
    ("foreign_keys", "ON"),
    ("temp_store", "MEMORY"),
];

/// Full ordered list of directives for `config`, rebuilt on every call.
///
/// Some of these are file-scoped (journal mode) and survive a reopen, others
/// (cache size, busy timeout) reset with every connection, so the whole list
/// is asserted at every start.
pub fn required_pragmas(config: &StoreConfig) -> Vec<PragmaConstraint> {
    let mut constraints: Vec<PragmaConstraint> = FIXED_PRAGMAS
        .iter()
        .map(|(name, value)| PragmaConstraint::new(name, *value))
        .collect();
    // Negative cache sizes are read by SQLite as KiB rather than pages.
    constraints.push(PragmaConstraint::new("cache_size", format!("-{}", config.cache_size)));
    constraints
}

/// Apply `constraints` in order, stopping at the first one that fails.
///
/// Directives applied before the failure stay applied.
///
/// # Errors
/// Returns [`StoreError::Pragma`] naming the directive and value that failed.
pub fn enforce(conn: &Connection, constraints: &[PragmaConstraint]) -> StoreResult<()> {
    for constraint in constraints {
        conn.execute_batch(&constraint.statement()).map_err(|source| StoreError::Pragma {
            pragma: constraint.name.to_string(),
            value: constraint.value.clone(),
            source,
        })?;
        tracing::debug!(pragma = constraint.name, value = %constraint.value, "pragma applied");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn pragma_text(conn: &Connection, name: &str) -> StoreResult<String> {
        Ok(conn.query_row(&format!("PRAGMA {name}"), [], |row| row.get::<_, String>(0))?)
    }

    fn pragma_int(conn: &Connection, name: &str) -> StoreResult<i64> {
        Ok(conn.query_row(&format!("PRAGMA {name}"), [], |row| row.get::<_, i64>(0))?)
    }

    #[test]
    fn cache_size_is_appended_after_fixed_directives() {
        let constraints = required_pragmas(&StoreConfig::new("store.db", 2048));
        let names: Vec<&str> = constraints.iter().map(|c| c.name).collect();
        assert_eq!(
            names,
            [
                "busy_timeout",
                "journal_mode",
                "journal_size_limit",
                "synchronous",
                "foreign_keys",
                "temp_store",
                "cache_size"
            ]
        );
        assert_eq!(constraints[6].value, "-2048");
    }

    #[test]
    fn building_twice_does_not_accumulate_entries() {
        let config = StoreConfig::default();
        let first = required_pragmas(&config);
        let second = required_pragmas(&config);
        assert_eq!(first, second);
        assert_eq!(second.len(), 7);
    }

    #[test]
    fn enforce_applies_every_directive() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let conn = Connection::open(dir.path().join("store.db"))?;
        enforce(&conn, &required_pragmas(&StoreConfig::new("store.db", 4000)))?;

        assert_eq!(pragma_text(&conn, "journal_mode")?.to_lowercase(), "wal");
        assert_eq!(pragma_int(&conn, "busy_timeout")?, 10_000);
        assert_eq!(pragma_int(&conn, "journal_size_limit")?, 200_000_000);
        // NORMAL
        assert_eq!(pragma_int(&conn, "synchronous")?, 1);
        assert_eq!(pragma_int(&conn, "foreign_keys")?, 1);
        // MEMORY
        assert_eq!(pragma_int(&conn, "temp_store")?, 2);
        assert_eq!(pragma_int(&conn, "cache_size")?, -4000);
        Ok(())
    }

    #[test]
    fn enforcing_twice_is_harmless() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let conn = Connection::open(dir.path().join("store.db"))?;
        let constraints = required_pragmas(&StoreConfig::default());
        enforce(&conn, &constraints)?;
        enforce(&conn, &constraints)?;
        Ok(())
    }

    #[test]
    fn failure_names_the_offending_directive() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("store.db");
        fs::write(&path, vec![0x5a; 8192])?;
        let conn = Connection::open(&path)?;

        let err = match enforce(&conn, &required_pragmas(&StoreConfig::default())) {
            Ok(()) => panic!("pragmas applied to a file that is not a database"),
            Err(err) => err,
        };
        match err {
            StoreError::Pragma { pragma, value, .. } => {
                assert_eq!(pragma, "journal_mode");
                assert_eq!(value, "WAL");
            }
            other => panic!("unexpected error: {other}"),
        }
        Ok(())
    }
}
