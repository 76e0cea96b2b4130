//! Domain types and the persisted row shape.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use flow_core::{Digest, Labels};

/// Serialize a time the way rows store it: RFC3339, UTC, `Z` suffix.
pub(crate) fn time_str(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// The date bucket of a time: `YYYY-MM-DD`, UTC.
pub(crate) fn date_str(t: DateTime<Utc>) -> String {
    t.date_naive().format("%Y-%m-%d").to_string()
}

/// A run row.
#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    pub id: Digest,
    pub labels: Labels,
    pub user: String,
    pub start: DateTime<Utc>,
    pub keepalive: DateTime<Utc>,
}

/// A task row.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: Digest,
    pub run_id: Digest,
    pub flow_id: Digest,
    pub uri: String,
    pub result_id: Option<Digest>,
    pub stdout: Option<Digest>,
    pub stderr: Option<Digest>,
    pub inspect: Option<Digest>,
    pub start: DateTime<Utc>,
    pub keepalive: DateTime<Utc>,
}

/// A store query. Exactly one of the addressing modes is used:
/// `id` (full or abbreviated), `run_id` (tasks only), or `since`
/// with an optional `user` filter.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub id: Option<Digest>,
    pub run_id: Option<Digest>,
    pub since: Option<DateTime<Utc>>,
    pub user: Option<String>,
}

/// The persisted row, covering both runs and tasks. Field names are
/// the store's column names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Row {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "ID4")]
    pub id4: String,
    #[serde(rename = "Type")]
    pub row_type: RowType,
    #[serde(rename = "StartTime")]
    pub start_time: String,
    #[serde(rename = "Keepalive", default, skip_serializing_if = "Option::is_none")]
    pub keepalive: Option<String>,
    #[serde(rename = "Date", default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(rename = "Labels", default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(rename = "User", default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(rename = "RunID", default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(rename = "RunID4", default, skip_serializing_if = "Option::is_none")]
    pub run_id4: Option<String>,
    #[serde(rename = "FlowID", default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    #[serde(rename = "URI", default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(rename = "ResultID", default, skip_serializing_if = "Option::is_none")]
    pub result_id: Option<String>,
    #[serde(rename = "Stdout", default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(rename = "Stderr", default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(rename = "Inspect", default, skip_serializing_if = "Option::is_none")]
    pub inspect: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum RowType {
    Run,
    Task,
}

/// Encode labels with `key=value`.
pub(crate) fn encode_labels(labels: &Labels) -> Vec<String> {
    labels.iter().map(|(k, v)| format!("{k}={v}")).collect()
}

/// Decode `key=value` labels; malformed entries are reported.
pub(crate) fn decode_labels(encoded: &[String]) -> Result<Labels, String> {
    let mut labels = Labels::new();
    for entry in encoded {
        match entry.split_once('=') {
            Some((k, v)) => {
                labels.insert(k.to_string(), v.to_string());
            }
            None => return Err(format!("label not well formed: {entry}")),
        }
    }
    Ok(labels)
}
