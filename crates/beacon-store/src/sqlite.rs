// ABOUTME: SQLite-backed status store: recreates the file, keeps one row, and updates it in place.
// ABOUTME: Defines the StoreOpener/StatusStore seam the polling loop drives.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use beacon_core::{ProbeValue, Schema};
use chrono::SecondsFormat;
use rusqlite::types::Value;
use rusqlite::{Connection, params, params_from_iter};
use thiserror::Error;

/// `PRAGMA user_version` value written on a clean shutdown.
pub const TERMINAL_MARKER: i64 = 1;

const BUSY_TIMEOUT: Duration = Duration::from_millis(250);

/// Errors that can occur during status store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unable to open status file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("unable to remove stale status file {path}: {source}")]
    RemoveStale {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unable to record status: {0}")]
    Write(#[source] rusqlite::Error),

    #[error("unable to read status file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
}

/// An open status table holding exactly one row.
pub trait StatusStore {
    /// Bind `values` to the update statement by position and commit.
    fn write_update(&mut self, values: &[ProbeValue]) -> Result<(), StoreError>;

    /// Record a probe failure in the `elapsed` and `error` columns only.
    fn write_error(&mut self, elapsed_secs: f64, error: &str) -> Result<(), StoreError>;

    /// Mark the run as cleanly finished.
    fn finalize(&mut self) -> Result<(), StoreError>;

    /// Release the store. Never fails.
    fn close(self)
    where
        Self: Sized;
}

/// Creates a fresh status store, discarding whatever was there before.
pub trait StoreOpener {
    type Store: StatusStore;

    /// Location of the store, for log messages.
    fn target(&self) -> &Path;

    /// Recreate the table from `schema` and insert the single row.
    ///
    /// Any error is an open failure: `StoreError::RemoveStale` when the old
    /// file could not be deleted, `StoreError::Open` for everything after.
    fn open(&mut self, schema: &Schema, statics: &[ProbeValue]) -> Result<Self::Store, StoreError>;
}

/// Opens [`SqliteStore`]s at a fixed path.
#[derive(Debug, Clone)]
pub struct SqliteOpener {
    path: PathBuf,
}

impl SqliteOpener {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StoreOpener for SqliteOpener {
    type Store = SqliteStore;

    fn target(&self) -> &Path {
        &self.path
    }

    /// Delete any existing file, create the table and insert the row in one
    /// transaction, then warm the statement cache with the two update
    /// statements. On failure the connection is dropped before returning.
    fn open(&mut self, schema: &Schema, statics: &[ProbeValue]) -> Result<SqliteStore, StoreError> {
        remove_stale(&self.path)?;

        let open_error = |source| StoreError::Open {
            path: self.path.clone(),
            source,
        };
        let mut conn = Connection::open(&self.path).map_err(open_error)?;
        initialize(&mut conn, schema, statics).map_err(open_error)?;

        tracing::debug!(path = %self.path.display(), "status file created");

        Ok(SqliteStore {
            conn,
            update: schema.update.clone(),
            error_update: schema.error_update.clone(),
        })
    }
}

fn initialize(
    conn: &mut Connection,
    schema: &Schema,
    statics: &[ProbeValue],
) -> rusqlite::Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;

    let tx = conn.transaction()?;
    tx.execute(&schema.create, [])?;
    tx.execute(&schema.init, params_from_iter(statics.iter().map(to_sql_value)))?;
    tx.commit()?;

    conn.prepare_cached(&schema.update)?;
    conn.prepare_cached(&schema.error_update)?;
    Ok(())
}

/// A connection to the status file with its update statements cached.
/// Every write runs in its own transaction.
pub struct SqliteStore {
    conn: Connection,
    update: String,
    error_update: String,
}

impl SqliteStore {
    fn commit_update(&mut self, values: &[ProbeValue]) -> rusqlite::Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&self.update)?;
            stmt.execute(params_from_iter(values.iter().map(to_sql_value)))?;
        }
        tx.commit()
    }

    fn commit_error(&mut self, elapsed_secs: f64, error: &str) -> rusqlite::Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&self.error_update)?;
            stmt.execute(params![elapsed_secs, error])?;
        }
        tx.commit()
    }

    fn commit_marker(&mut self) -> rusqlite::Result<()> {
        let tx = self.conn.transaction()?;
        tx.pragma_update(None, "user_version", TERMINAL_MARKER)?;
        tx.commit()
    }
}

impl StatusStore for SqliteStore {
    fn write_update(&mut self, values: &[ProbeValue]) -> Result<(), StoreError> {
        self.commit_update(values).map_err(StoreError::Write)
    }

    fn write_error(&mut self, elapsed_secs: f64, error: &str) -> Result<(), StoreError> {
        self.commit_error(elapsed_secs, error).map_err(StoreError::Write)
    }

    fn finalize(&mut self) -> Result<(), StoreError> {
        self.commit_marker().map_err(StoreError::Write)
    }

    fn close(self) {
        if let Err((_conn, e)) = self.conn.close() {
            tracing::debug!(error = %e, "ignoring error while closing status file");
        }
    }
}

/// Convert a probe value into the SQLite value bound for it.
pub(crate) fn to_sql_value(value: &ProbeValue) -> Value {
    match value {
        ProbeValue::Null => Value::Null,
        ProbeValue::Integer(v) => Value::Integer(*v),
        ProbeValue::Float(v) => Value::Real(*v),
        ProbeValue::Text(v) => Value::Text(v.clone()),
        ProbeValue::Timestamp(v) => Value::Text(v.to_rfc3339_opts(SecondsFormat::Millis, true)),
        ProbeValue::Blob(v) => Value::Blob(v.clone()),
    }
}

fn remove_stale(path: &Path) -> Result<(), StoreError> {
    for candidate in [path.to_path_buf(), sidecar(path, "-journal")] {
        match fs::remove_file(&candidate) {
            Ok(()) => tracing::debug!(path = %candidate.display(), "removed stale status file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(StoreError::RemoveStale {
                    path: candidate,
                    source,
                });
            }
        }
    }
    Ok(())
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
