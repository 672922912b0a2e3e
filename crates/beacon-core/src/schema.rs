// ABOUTME: Synthesizes the four SQL statement templates for the status table from a ProbeSet.
// ABOUTME: Column order is static probes then updatable probes, each in registration order.

use serde::Serialize;

use crate::registry::{ELAPSED, ERROR, ProbeSet};

/// Name of the single-row table holding the latest status.
pub const STATUS_TABLE: &str = "Status";

/// The statement templates for one frozen probe set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Schema {
    /// Creates the table, one column per probe.
    pub create: String,
    /// Inserts the single row, binding every static probe.
    pub init: String,
    /// Rewrites every updatable column; run on each successful tick.
    pub update: String,
    /// Rewrites only `elapsed` and `error`; run when a sampler fails.
    pub error_update: String,
}

impl Schema {
    /// Build the statements for a probe set. Pure and deterministic.
    pub fn synthesize(probes: &ProbeSet) -> Self {
        let columns: Vec<String> = probes
            .statics()
            .iter()
            .map(|p| format!("{} {}", quote(&p.name), p.sql_type))
            .chain(
                probes
                    .updatables()
                    .iter()
                    .map(|p| format!("{} {}", quote(&p.name), p.sql_type)),
            )
            .collect();
        let create = format!("CREATE TABLE {STATUS_TABLE} ({})", columns.join(", "));

        // The built-in `started` and `pid` probes keep the static list non-empty.
        let names: Vec<String> = probes.statics().iter().map(|p| quote(&p.name)).collect();
        let placeholders: Vec<String> =
            probes.statics().iter().map(|p| format!("?{}", p.index)).collect();
        let init = format!(
            "INSERT INTO {STATUS_TABLE} ({}) VALUES ({})",
            names.join(","),
            placeholders.join(",")
        );

        let assignments: Vec<String> = probes
            .updatables()
            .iter()
            .map(|p| format!("{}=?{}", quote(&p.name), p.index))
            .collect();
        let update = format!("UPDATE {STATUS_TABLE} SET {}", assignments.join(","));

        let error_update = format!(
            "UPDATE {STATUS_TABLE} SET {}=?1, {}=?2",
            quote(ELAPSED),
            quote(ERROR)
        );

        Self {
            create,
            init,
            update,
            error_update,
        }
    }
}

/// Double-quote a column name, so keywords like `order` are plain columns.
/// Registered names never contain a quote.
fn quote(name: &str) -> String {
    format!("\"{name}\"")
}
