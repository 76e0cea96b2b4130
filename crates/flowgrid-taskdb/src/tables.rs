//! redb table definitions for the task store.
//!
//! The main table holds JSON-serialized rows keyed by the full digest
//! string. Index tables map composite string keys to row ids;
//! components are joined with `|`, which sorts below every character
//! that can appear in a component.

use redb::TableDefinition;

/// Run and task rows keyed by full id.
pub const ROWS: TableDefinition<&str, &[u8]> = TableDefinition::new("rows");

/// Date-keepalive index keyed `{date}|{keepalive}|{id}`.
pub const IDX_DATE_KEEPALIVE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("idx_date_keepalive");

/// Run-membership index keyed `{run_id}|{task_id}`.
pub const IDX_RUN_ID: TableDefinition<&str, &[u8]> = TableDefinition::new("idx_run_id");

/// Abbreviation index keyed `{id4}|{id}`.
pub const IDX_ID4: TableDefinition<&str, &[u8]> = TableDefinition::new("idx_id4");

/// All tables, in creation order, as (name, definition).
pub const ALL: &[(&str, TableDefinition<&str, &[u8]>)] = &[
    ("rows", ROWS),
    ("idx_date_keepalive", IDX_DATE_KEEPALIVE),
    ("idx_run_id", IDX_RUN_ID),
    ("idx_id4", IDX_ID4),
];

/// The `(start, end)` bounds covering every key beginning with
/// `prefix`.
pub fn prefix_range(prefix: &str) -> (String, String) {
    (prefix.to_string(), format!("{prefix}{}", char::MAX))
}
