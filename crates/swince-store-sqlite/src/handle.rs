use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

use crate::integrity::SchemaSnapshot;
use crate::{StoreError, StoreResult};

/// The validated database connection shared by the whole process.
///
/// Only [`crate::setup`] creates one. Every data-access operation fails with
/// [`StoreError::Closed`] once [`StorageHandle::close`] has run, and closing
/// again is a no-op.
pub struct StorageHandle {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Season {
    pub season_id: i64,
    pub starts_at: OffsetDateTime,
    pub ruleset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Swince {
    pub swince_id: Ulid,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwinceurParams {
    pub swince_id: Ulid,
    pub discord_id: i64,
    pub late_swince_tax: f64,
    pub nominates: Option<i64>,
}

/// A challenge issued during `swince_id` that `nominee_id` still owes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nomination {
    pub swince_id: Ulid,
    pub nominator_id: i64,
    pub nominee_id: i64,
}

impl std::fmt::Debug for StorageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageHandle")
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl StorageHandle {
    pub(crate) fn new(path: PathBuf, conn: Connection) -> Self {
        Self { path, conn: Mutex::new(Some(conn)) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.conn.lock().is_none()
    }

    /// Close the connection. Later calls do nothing and succeed.
    ///
    /// # Errors
    /// Returns the error SQLite reported while closing; the connection is
    /// released either way.
    pub fn close(&self) -> StoreResult<()> {
        let Some(conn) = self.conn.lock().take() else {
            return Ok(());
        };
        conn.close().map_err(|(_, err)| StoreError::Sqlite(err))?;
        tracing::info!(path = %self.path.display(), "database connection closed");
        Ok(())
    }

    /// Snapshot of the table definitions in the open file.
    ///
    /// # Errors
    /// Returns [`StoreError::Closed`] after shutdown, or the read error.
    pub fn schema_snapshot(&self) -> StoreResult<SchemaSnapshot> {
        self.with_conn(SchemaSnapshot::fetch)
    }

    /// # Errors
    /// Fails when a season already starts at `starts_at`.
    pub fn create_season(&self, starts_at: OffsetDateTime, ruleset: i64) -> StoreResult<i64> {
        let starts_at = to_stored(starts_at)?;
        self.with_conn(|conn| {
            conn.prepare_cached("INSERT INTO seasons(starts_at, ruleset) VALUES (?1, ?2)")?
                .execute(params![starts_at, ruleset])?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Season in force at `at`, if any has started yet.
    ///
    /// # Errors
    /// Returns [`StoreError::Closed`] after shutdown or any query error.
    pub fn season_at(&self, at: OffsetDateTime) -> StoreResult<Option<Season>> {
        let at = to_stored(at)?;
        let row = self.with_conn(|conn| {
            Ok(conn
                .prepare_cached(
                    "SELECT season_id, starts_at, ruleset FROM seasons
                     WHERE starts_at <= ?1
                     ORDER BY starts_at DESC
                     LIMIT 1",
                )?
                .query_row(params![at], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
                })
                .optional()?)
        })?;

        row.map(|(season_id, starts_at, ruleset)| {
            Ok(Season { season_id, starts_at: from_stored(&starts_at)?, ruleset })
        })
        .transpose()
    }

    /// Start of the first season beginning strictly after `after`.
    ///
    /// # Errors
    /// Returns [`StoreError::Closed`] after shutdown or any query error.
    pub fn next_season_start(&self, after: OffsetDateTime) -> StoreResult<Option<OffsetDateTime>> {
        let after = to_stored(after)?;
        let starts_at = self.with_conn(|conn| {
            Ok(conn
                .prepare_cached(
                    "SELECT starts_at FROM seasons WHERE starts_at > ?1 \
                     ORDER BY starts_at ASC LIMIT 1",
                )?
                .query_row(params![after], |row| row.get::<_, String>(0))
                .optional()?)
        })?;
        starts_at.as_deref().map(from_stored).transpose()
    }

    /// # Errors
    /// Returns [`StoreError::Closed`] after shutdown or any write error.
    pub fn create_swince(&self, video: &[u8]) -> StoreResult<Swince> {
        let swince = Swince { swince_id: Ulid::new(), created_at: OffsetDateTime::now_utc() };
        let created_at = to_stored(swince.created_at)?;
        self.with_conn(|conn| {
            conn.prepare_cached(
                "INSERT INTO swinces(swince_id, video, created_at) VALUES (?1, ?2, ?3)",
            )?
            .execute(params![swince.swince_id.to_string(), video, created_at])?;
            Ok(())
        })?;
        Ok(swince)
    }

    /// # Errors
    /// Fails when the swince does not exist or the participant is already on it.
    pub fn create_swinceur(&self, swinceur: &SwinceurParams) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.prepare_cached(
                "INSERT INTO swinceurs(swince_id, discord_id, late_swince_tax, nominates)
                 VALUES (?1, ?2, ?3, ?4)",
            )?
            .execute(params![
                swinceur.swince_id.to_string(),
                swinceur.discord_id,
                swinceur.late_swince_tax,
                swinceur.nominates,
            ])?;
            Ok(())
        })
    }

    /// Open challenges addressed to `nominee_id`, oldest first.
    ///
    /// # Errors
    /// Returns [`StoreError::Closed`] after shutdown or any query error.
    pub fn unfulfilled_nominations(&self, nominee_id: i64) -> StoreResult<Vec<Nomination>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT swince_id, discord_id FROM swinceurs
                 WHERE nominates = ?1 AND nomination_fulfilled IS NULL
                 ORDER BY swince_id ASC, discord_id ASC",
            )?;
            let rows = stmt
                .query_map(params![nominee_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(swince_id, nominator_id)| {
                Ok(Nomination { swince_id: parse_ulid(&swince_id)?, nominator_id, nominee_id })
            })
            .collect()
    }

    /// Mark the challenge issued to `nominee_id` during `nominated_in` as
    /// answered by `answered_by`. Returns whether an open challenge was found.
    ///
    /// # Errors
    /// Returns [`StoreError::Closed`] after shutdown or any write error.
    pub fn fulfill_nomination(
        &self,
        nominated_in: Ulid,
        nominee_id: i64,
        answered_by: Ulid,
    ) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let updated = conn
                .prepare_cached(
                    "UPDATE swinceurs SET nomination_fulfilled = ?3
                     WHERE swince_id = ?1 AND nominates = ?2 AND nomination_fulfilled IS NULL",
                )?
                .execute(params![nominated_in.to_string(), nominee_id, answered_by.to_string()])?;
            Ok(updated > 0)
        })
    }

    pub(crate) fn with_conn<T>(
        &self,
        op: impl FnOnce(&Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        op(conn)
    }
}

/// Whole-second UTC RFC 3339, so stored values sort as text.
fn to_stored(value: OffsetDateTime) -> StoreResult<String> {
    let utc = value.to_offset(UtcOffset::UTC);
    let whole_seconds = utc - time::Duration::nanoseconds(i64::from(utc.nanosecond()));
    Ok(whole_seconds.format(&Rfc3339)?)
}

fn from_stored(value: &str) -> StoreResult<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|source| StoreError::Timestamp { value: value.to_string(), source })
}

fn parse_ulid(value: &str) -> StoreResult<Ulid> {
    Ulid::from_string(value)
        .map_err(|source| StoreError::InvalidId { value: value.to_string(), source })
}
