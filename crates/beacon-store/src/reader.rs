// ABOUTME: Read-only view of a status file, as seen by an external observer.
// ABOUTME: Reports the row count, the ordered column values, and whether the run finished cleanly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use beacon_core::{ProbeValue, STATUS_TABLE};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;

use crate::sqlite::{StoreError, TERMINAL_MARKER};

/// One column of the status row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusColumn {
    pub name: String,
    pub value: ProbeValue,
}

/// The latest status persisted in a status file.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub path: PathBuf,
    /// Number of rows in the status table; 1 for any initialized file.
    pub row_count: usize,
    /// Whether the terminal marker is present.
    pub finished: bool,
    pub columns: Vec<StatusColumn>,
}

impl StatusSnapshot {
    /// Read the status file at `path` without modifying it.
    pub fn read(path: &Path) -> Result<Self, StoreError> {
        let read_error = |source| StoreError::Read {
            path: path.to_path_buf(),
            source,
        };
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(read_error)?;
        conn.busy_timeout(Duration::from_millis(500))
            .map_err(read_error)?;

        let marker: i64 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .map_err(read_error)?;
        let row_count: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {STATUS_TABLE}"), [], |row| {
                row.get(0)
            })
            .map_err(read_error)?;
        let columns = read_columns(&conn).map_err(read_error)?;

        Ok(Self {
            path: path.to_path_buf(),
            row_count: usize::try_from(row_count).unwrap_or_default(),
            finished: marker == TERMINAL_MARKER,
            columns,
        })
    }

    /// Look up a column value by name.
    pub fn get(&self, name: &str) -> Option<&ProbeValue> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .map(|c| &c.value)
    }

    /// Column names in table order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

fn read_columns(conn: &Connection) -> rusqlite::Result<Vec<StatusColumn>> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM {STATUS_TABLE} LIMIT 1"))?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut rows = stmt.query([])?;
    let Some(row) = rows.next()? else {
        return Ok(Vec::new());
    };

    let mut columns = Vec::with_capacity(names.len());
    for (i, name) in names.into_iter().enumerate() {
        columns.push(StatusColumn {
            name,
            value: from_sql_value(row.get_ref(i)?),
        });
    }
    Ok(columns)
}

fn from_sql_value(value: ValueRef<'_>) -> ProbeValue {
    match value {
        ValueRef::Null => ProbeValue::Null,
        ValueRef::Integer(v) => ProbeValue::Integer(v),
        ValueRef::Real(v) => ProbeValue::Float(v),
        ValueRef::Text(v) => ProbeValue::Text(String::from_utf8_lossy(v).into_owned()),
        ValueRef::Blob(v) => ProbeValue::Blob(v.to_vec()),
    }
}
