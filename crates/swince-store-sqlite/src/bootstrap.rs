use std::path::{Path, PathBuf};

use rusqlite::Connection;

use crate::backup::backup;
use crate::handle::StorageHandle;
use crate::integrity::{check_consistency, check_schema};
use crate::pragma::{enforce, required_pragmas, PragmaConstraint};
use crate::{StoreConfig, StoreError, StoreResult, SCHEMA_SQL};

/// One step of the bootstrap cascade.
///
/// `Locate` is the entry point; `Ready` and `Failed` are terminal. Every check
/// state owns the connection it is checking, so a failing check hands that
/// connection to `Recover`, which closes it before the file is moved away.
#[derive(Debug)]
pub enum BootstrapState {
    Locate,
    Open,
    Create,
    Pragmas(Connection),
    Integrity(Connection),
    Schema(Connection),
    Recover { conn: Option<Connection>, fault: StoreError },
    Ready(Connection),
    Failed(StoreError),
}

impl BootstrapState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Locate => "locate",
            Self::Open => "open",
            Self::Create => "create",
            Self::Pragmas(_) => "pragmas",
            Self::Integrity(_) => "integrity",
            Self::Schema(_) => "schema",
            Self::Recover { .. } => "recover",
            Self::Ready(_) => "ready",
            Self::Failed(_) => "failed",
        }
    }
}

/// Transition table for one `setup` call.
struct Cascade {
    path: PathBuf,
    pragmas: Vec<PragmaConstraint>,
    /// Set once the file under check was created by this cascade. A fresh
    /// file that fails a check is an environment problem, not bad data.
    fresh: bool,
}

impl Cascade {
    fn new(config: &StoreConfig) -> Self {
        Self { path: config.path.clone(), pragmas: required_pragmas(config), fresh: false }
    }

    fn advance(&mut self, state: BootstrapState) -> BootstrapState {
        match state {
            BootstrapState::Locate => {
                if self.path.exists() {
                    BootstrapState::Open
                } else {
                    tracing::info!(path = %self.path.display(), "no database file, creating one");
                    BootstrapState::Create
                }
            }
            BootstrapState::Open => match Connection::open(&self.path) {
                Ok(conn) => BootstrapState::Pragmas(conn),
                Err(source) => {
                    let fault = StoreError::Open { path: self.path.clone(), source };
                    self.reject("open", None, fault)
                }
            },
            BootstrapState::Create => {
                self.fresh = true;
                match create_database(&self.path) {
                    Ok(conn) => BootstrapState::Pragmas(conn),
                    Err(err) => BootstrapState::Failed(err),
                }
            }
            BootstrapState::Pragmas(conn) => match enforce(&conn, &self.pragmas) {
                Ok(()) => BootstrapState::Integrity(conn),
                Err(err) => self.reject("pragmas", Some(conn), err),
            },
            BootstrapState::Integrity(conn) => match check_consistency(&conn) {
                Ok(()) => BootstrapState::Schema(conn),
                Err(err) => self.reject("integrity", Some(conn), err),
            },
            BootstrapState::Schema(conn) => match check_schema(&conn, SCHEMA_SQL) {
                Ok(_) => BootstrapState::Ready(conn),
                Err(err) => self.reject("schema", Some(conn), err),
            },
            BootstrapState::Recover { conn, fault } => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %fault,
                    "replacing database file"
                );
                if let Some(conn) = conn {
                    close_quietly(&self.path, conn);
                }
                if backup(&self.path).is_err() {
                    tracing::warn!(
                        path = %self.path.display(),
                        "continuing without a backup of the previous database"
                    );
                }
                BootstrapState::Create
            }
            terminal @ (BootstrapState::Ready(_) | BootstrapState::Failed(_)) => terminal,
        }
    }

    fn reject(
        &self,
        check: &'static str,
        conn: Option<Connection>,
        fault: StoreError,
    ) -> BootstrapState {
        if self.fresh || !fault.is_recoverable() {
            tracing::error!(
                path = %self.path.display(),
                check,
                error = %fault,
                "database failed a check it cannot recover from"
            );
            if let Some(conn) = conn {
                close_quietly(&self.path, conn);
            }
            return BootstrapState::Failed(fault);
        }

        match &fault {
            StoreError::SchemaMismatch { expected, actual } => tracing::warn!(
                path = %self.path.display(),
                check,
                expected = %expected,
                actual = %actual,
                "database schema does not match"
            ),
            other => tracing::warn!(
                path = %self.path.display(),
                check,
                error = %other,
                "database check failed"
            ),
        }
        BootstrapState::Recover { conn, fault }
    }
}

fn close_quietly(path: &Path, conn: Connection) {
    if let Err((_, err)) = conn.close() {
        tracing::error!(
            path = %path.display(),
            error = %err,
            "failed to close database connection"
        );
    }
}

/// Bring the database at `config.path` to a valid state and return the handle
/// to it.
///
/// A file that cannot take the required pragmas, fails `integrity_check` or
/// carries a different schema is backed up and replaced by a blank database,
/// which then goes through the same checks once more.
///
/// # Errors
/// Returns the fault that stopped the cascade: a failure to create the blank
/// database, or any check failing on a file this call just created.
pub fn setup(config: &StoreConfig) -> StoreResult<StorageHandle> {
    let mut cascade = Cascade::new(config);
    let mut state = BootstrapState::Locate;
    loop {
        state = match state {
            BootstrapState::Ready(conn) => {
                tracing::info!(path = %config.path.display(), "database ready");
                return Ok(StorageHandle::new(config.path.clone(), conn));
            }
            BootstrapState::Failed(err) => return Err(err),
            pending => {
                let from = pending.label();
                let next = cascade.advance(pending);
                tracing::trace!(from, to = next.label(), "bootstrap transition");
                next
            }
        };
    }
}

/// Create a blank database at `path` holding the embedded schema.
///
/// Foreign keys and WAL mode are asserted first, then the schema is applied
/// in a single transaction.
///
/// # Errors
/// Returns [`StoreError::Create`] when any step fails. Nothing is retried.
pub fn create_database(path: &Path) -> StoreResult<Connection> {
    let create_error =
        |source: rusqlite::Error| StoreError::Create { path: path.to_path_buf(), source };

    let mut conn = Connection::open(path).map_err(create_error)?;
    conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")
        .map_err(create_error)?;
    let tx = conn.transaction().map_err(create_error)?;
    tx.execute_batch(SCHEMA_SQL).map_err(create_error)?;
    tx.commit().map_err(create_error)?;

    tracing::info!(path = %path.display(), "created new blank database with valid schema");
    Ok(conn)
}
