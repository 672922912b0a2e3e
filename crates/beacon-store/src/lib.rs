// ABOUTME: Persistence layer for beacon, owning the single-row SQLite status table.
// ABOUTME: Provides the open/write/finalize/close store seam and a read-only snapshot reader.

pub mod reader;
pub mod sqlite;

pub use reader::{StatusColumn, StatusSnapshot};
pub use sqlite::{SqliteOpener, SqliteStore, StatusStore, StoreError, StoreOpener, TERMINAL_MARKER};
