//! TaskStore — redb-backed persistence for runs and tasks.
//!
//! Writes go through single write transactions that keep the row and
//! its index entries consistent; in particular a keepalive update
//! moves the date-keepalive index entry and rewrites the row
//! atomically. Reads open the index tables lazily, so a database
//! created before an index existed surfaces an actionable
//! "run `flowd migrate`" error instead of a silent miss.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use redb::{Database, ReadTransaction, ReadableTable, TableDefinition};
use tokio::sync::Semaphore;
use tracing::debug;

use flow_core::{Digest, Labels};

use crate::error::{TaskDbError, TaskDbResult};
use crate::tables::{prefix_range, ALL, IDX_DATE_KEEPALIVE, IDX_ID4, IDX_RUN_ID, ROWS};
use crate::types::{date_str, decode_labels, encode_labels, time_str, Query, Row, RowType, Run, Task};

/// Maximum outstanding store calls.
const CONCURRENCY_LIMIT: usize = 32;

macro_rules! map_err {
    ($variant:ident) => {
        |e| TaskDbError::$variant(e.to_string())
    };
}

/// Thread-safe task store backed by redb.
#[derive(Clone)]
pub struct TaskStore {
    db: Arc<Database>,
    limiter: Arc<Semaphore>,
    labels: Labels,
}

impl TaskStore {
    /// Open (or create) a persistent store at the given path. Index
    /// tables are *not* created here; see [`TaskStore::migrate`].
    pub fn open(path: &Path) -> TaskDbResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        debug!(?path, "task store opened");
        Ok(Self::with_db(db))
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> TaskDbResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        debug!("in-memory task store opened");
        Ok(Self::with_db(db))
    }

    fn with_db(db: Database) -> Self {
        TaskStore {
            db: Arc::new(db),
            limiter: Arc::new(Semaphore::new(CONCURRENCY_LIMIT)),
            labels: Labels::new(),
        }
    }

    /// Labels stamped onto every created row.
    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }

    /// Create the row table and every secondary index. Run by
    /// `flowd migrate`; queries against a database missing an index
    /// fail until this has run.
    pub fn migrate(&self) -> TaskDbResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for (name, def) in ALL {
            // Opening a table in a write transaction creates it.
            txn.open_table(*def).map_err(map_err!(Table))?;
            debug!(table = name, "table ensured");
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Record a new run owned by `user`, started now.
    pub async fn create_run(&self, id: &Digest, user: &str) -> TaskDbResult<()> {
        let _permit = self.limiter.acquire().await.expect("limiter closed");
        let row = Row {
            id: id.to_string(),
            id4: id.hex_n(4).to_string(),
            row_type: RowType::Run,
            start_time: time_str(Utc::now()),
            keepalive: None,
            date: None,
            labels: encode_labels(&self.labels),
            user: Some(user.to_string()),
            run_id: None,
            run_id4: None,
            flow_id: None,
            uri: None,
            result_id: None,
            stdout: None,
            stderr: None,
            inspect: None,
        };
        self.put_row(row)
    }

    /// Record a new task under `run_id`, started now.
    pub async fn create_task(
        &self,
        id: &Digest,
        run_id: &Digest,
        flow_id: &Digest,
        uri: &str,
    ) -> TaskDbResult<()> {
        let _permit = self.limiter.acquire().await.expect("limiter closed");
        let row = Row {
            id: id.to_string(),
            id4: id.hex_n(4).to_string(),
            row_type: RowType::Task,
            start_time: time_str(Utc::now()),
            keepalive: None,
            date: None,
            labels: encode_labels(&self.labels),
            user: None,
            run_id: Some(run_id.to_string()),
            run_id4: Some(run_id.hex_n(4).to_string()),
            flow_id: Some(flow_id.to_string()),
            uri: Some(uri.to_string()),
            result_id: None,
            stdout: None,
            stderr: None,
            inspect: None,
        };
        self.put_row(row)
    }

    /// Set a task's result digest.
    pub async fn set_task_result(&self, id: &Digest, result: &Digest) -> TaskDbResult<()> {
        let _permit = self.limiter.acquire().await.expect("limiter closed");
        self.update_row(id, |row| {
            row.result_id = Some(result.to_string());
        })
    }

    /// Set a task's stdout, stderr and inspect digests.
    pub async fn set_task_attrs(
        &self,
        id: &Digest,
        stdout: &Digest,
        stderr: &Digest,
        inspect: &Digest,
    ) -> TaskDbResult<()> {
        let _permit = self.limiter.acquire().await.expect("limiter closed");
        self.update_row(id, |row| {
            row.stdout = Some(stdout.to_string());
            row.stderr = Some(stderr.to_string());
            row.inspect = Some(inspect.to_string());
        })
    }

    /// Update a row's keepalive and its date bucket in one
    /// transaction, keeping the date-keepalive index consistent.
    pub async fn keepalive(&self, id: &Digest, t: DateTime<Utc>) -> TaskDbResult<()> {
        let _permit = self.limiter.acquire().await.expect("limiter closed");
        let id_str = id.to_string();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut rows = txn.open_table(ROWS).map_err(map_err!(Table))?;
            let data = rows
                .get(id_str.as_str())
                .map_err(map_err!(Read))?
                .ok_or_else(|| TaskDbError::NotFound(id_str.clone()))?
                .value()
                .to_vec();
            let mut row: Row = serde_json::from_slice(&data).map_err(map_err!(Deserialize))?;
            let old = match (&row.date, &row.keepalive) {
                (Some(d), Some(ka)) => Some(format!("{d}|{ka}|{id_str}")),
                _ => None,
            };
            row.keepalive = Some(time_str(t));
            row.date = Some(date_str(t));
            let value = serde_json::to_vec(&row).map_err(map_err!(Serialize))?;
            rows.insert(id_str.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;

            let mut idx = txn
                .open_table(IDX_DATE_KEEPALIVE)
                .map_err(map_err!(Table))?;
            if let Some(old_key) = old {
                idx.remove(old_key.as_str()).map_err(map_err!(Write))?;
            }
            let new_key = format!("{}|{}|{id_str}", date_str(t), time_str(t));
            idx.insert(new_key.as_str(), id_str.as_bytes())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn put_row(&self, row: Row) -> TaskDbResult<()> {
        let value = serde_json::to_vec(&row).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut rows = txn.open_table(ROWS).map_err(map_err!(Table))?;
            rows.insert(row.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;

            let mut id4 = txn.open_table(IDX_ID4).map_err(map_err!(Table))?;
            let id4_key = format!("{}|{}", row.id4, row.id);
            id4.insert(id4_key.as_str(), row.id.as_bytes())
                .map_err(map_err!(Write))?;

            if let Some(run_id) = &row.run_id {
                let mut by_run = txn.open_table(IDX_RUN_ID).map_err(map_err!(Table))?;
                let run_key = format!("{run_id}|{}", row.id);
                by_run
                    .insert(run_key.as_str(), row.id.as_bytes())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id = %row.id, kind = ?row.row_type, "row stored");
        Ok(())
    }

    fn update_row(&self, id: &Digest, f: impl FnOnce(&mut Row)) -> TaskDbResult<()> {
        let id_str = id.to_string();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut rows = txn.open_table(ROWS).map_err(map_err!(Table))?;
            let data = rows
                .get(id_str.as_str())
                .map_err(map_err!(Read))?
                .ok_or_else(|| TaskDbError::NotFound(id_str.clone()))?
                .value()
                .to_vec();
            let mut row: Row = serde_json::from_slice(&data).map_err(map_err!(Deserialize))?;
            f(&mut row);
            let value = serde_json::to_vec(&row).map_err(map_err!(Serialize))?;
            rows.insert(id_str.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Runs matching the query.
    ///
    /// # Panics
    ///
    /// Panics when the query carries a `run_id`: runs are not nested.
    pub async fn runs(&self, query: &Query) -> TaskDbResult<Vec<Run>> {
        let _permit = self.limiter.acquire().await.expect("limiter closed");
        if query.run_id.is_some() {
            panic!("taskdb invalid query: runs have no run id");
        }
        let rows = self.query_rows(query, RowType::Run)?;
        let mut runs = Vec::with_capacity(rows.len());
        let mut problems = Vec::new();
        for row in rows {
            match run_of(&row) {
                Ok(run) => runs.push(run),
                Err(p) => problems.push(p),
            }
        }
        if problems.is_empty() {
            Ok(runs)
        } else {
            Err(TaskDbError::Malformed(problems.join(", ")))
        }
    }

    /// Tasks matching the query.
    pub async fn tasks(&self, query: &Query) -> TaskDbResult<Vec<Task>> {
        let _permit = self.limiter.acquire().await.expect("limiter closed");
        let rows = match &query.run_id {
            Some(run_id) => self.rows_by_run(run_id)?,
            None => self.query_rows(query, RowType::Task)?,
        };
        let mut tasks = Vec::with_capacity(rows.len());
        let mut problems = Vec::new();
        for row in rows {
            match task_of(&row) {
                Ok(task) => tasks.push(task),
                Err(p) => problems.push(p),
            }
        }
        if problems.is_empty() {
            Ok(tasks)
        } else {
            Err(TaskDbError::Malformed(problems.join(", ")))
        }
    }

    fn query_rows(&self, query: &Query, typ: RowType) -> TaskDbResult<Vec<Row>> {
        if let Some(id) = &query.id {
            return self.rows_by_id(id, typ, query);
        }
        let since = match query.since {
            Some(t) => t,
            None => panic!("taskdb invalid query: missing since"),
        };
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let idx = open_read_table(&txn, IDX_DATE_KEEPALIVE)?;
        let rows_table = open_read_table(&txn, ROWS)?;

        // One index query per date bucket between since and now.
        let mut out = Vec::new();
        for date in date_buckets(since, Utc::now()) {
            let bucket = date.format("%Y-%m-%d").to_string();
            let start = format!("{bucket}|{}", time_str(since));
            let (_, end) = prefix_range(&bucket);
            for entry in idx
                .range(start.as_str()..end.as_str())
                .map_err(map_err!(Read))?
            {
                let (_, id_guard) = entry.map_err(map_err!(Read))?;
                let id = String::from_utf8_lossy(id_guard.value()).to_string();
                let Some(row) = get_row(&rows_table, &id)? else {
                    continue;
                };
                if row_matches(&row, typ, query, Some(since)) {
                    out.push(row);
                }
            }
        }
        Ok(out)
    }

    fn rows_by_id(&self, id: &Digest, typ: RowType, query: &Query) -> TaskDbResult<Vec<Row>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let rows_table = open_read_table(&txn, ROWS)?;
        if !id.is_abbrev() {
            let Some(row) = get_row(&rows_table, &id.to_string())? else {
                return Ok(Vec::new());
            };
            return Ok(if row.row_type == typ { vec![row] } else { Vec::new() });
        }
        // Abbreviation: scan the id4 index, then narrow client-side.
        let idx = open_read_table(&txn, IDX_ID4)?;
        let (start, end) = prefix_range(id.hex_n(4));
        let mut out = Vec::new();
        for entry in idx
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
        {
            let (_, id_guard) = entry.map_err(map_err!(Read))?;
            let row_id = String::from_utf8_lossy(id_guard.value()).to_string();
            let Some(row) = get_row(&rows_table, &row_id)? else {
                continue;
            };
            if row.row_type != typ {
                continue;
            }
            let full = match Digest::parse(&row.id) {
                Ok(d) => d,
                Err(_) => continue,
            };
            if full.expands(id) {
                out.push(row);
            }
        }
        Ok(out)
    }

    fn rows_by_run(&self, run_id: &Digest) -> TaskDbResult<Vec<Row>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let idx = open_read_table(&txn, IDX_RUN_ID)?;
        let rows_table = open_read_table(&txn, ROWS)?;
        let (start, end) = prefix_range(&format!("{run_id}|"));
        let mut out = Vec::new();
        for entry in idx
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
        {
            let (_, id_guard) = entry.map_err(map_err!(Read))?;
            let id = String::from_utf8_lossy(id_guard.value()).to_string();
            if let Some(row) = get_row(&rows_table, &id)? {
                out.push(row);
            }
        }
        Ok(out)
    }
}

fn open_read_table(
    txn: &ReadTransaction,
    def: TableDefinition<'static, &'static str, &'static [u8]>,
) -> TaskDbResult<redb::ReadOnlyTable<&'static str, &'static [u8]>> {
    txn.open_table(def).map_err(|e| match e {
        redb::TableError::TableDoesNotExist(name) => TaskDbError::IndexMissing { index: name },
        other => TaskDbError::Table(other.to_string()),
    })
}

fn get_row(
    table: &redb::ReadOnlyTable<&'static str, &'static [u8]>,
    id: &str,
) -> TaskDbResult<Option<Row>> {
    match table.get(id).map_err(map_err!(Read))? {
        Some(guard) => {
            let row: Row = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(row))
        }
        None => Ok(None),
    }
}

fn row_matches(row: &Row, typ: RowType, query: &Query, since: Option<DateTime<Utc>>) -> bool {
    if row.row_type != typ {
        return false;
    }
    if let Some(user) = &query.user {
        if row.user.as_deref() != Some(user.as_str()) {
            return false;
        }
    }
    if let Some(since) = since {
        let Some(ka) = &row.keepalive else {
            return false;
        };
        match DateTime::parse_from_rfc3339(ka) {
            Ok(t) => {
                if t.with_timezone(&Utc) < since {
                    return false;
                }
            }
            Err(_) => return false,
        }
    }
    true
}

/// Every day bucket from `date(since)` through `date(until)`.
fn date_buckets(since: DateTime<Utc>, until: DateTime<Utc>) -> Vec<NaiveDate> {
    let mut d = since.date_naive();
    let end = until.date_naive();
    let mut out = Vec::new();
    while d <= end {
        out.push(d);
        match d.succ_opt() {
            Some(next) => d = next,
            None => break,
        }
    }
    out
}

fn parse_time(field: &str, s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("parse {field} {s}: {e}"))
}

fn parse_digest(field: &str, s: &str) -> Result<Digest, String> {
    Digest::parse(s).map_err(|e| format!("parse {field} {s}: {e}"))
}

fn run_of(row: &Row) -> Result<Run, String> {
    let id = parse_digest("id", &row.id)?;
    let start = parse_time("start time", &row.start_time)?;
    let keepalive = match &row.keepalive {
        Some(ka) => parse_time("keepalive", ka)?,
        None => start,
    };
    let labels = decode_labels(&row.labels)?;
    Ok(Run {
        id,
        labels,
        user: row.user.clone().unwrap_or_default(),
        start,
        keepalive,
    })
}

fn task_of(row: &Row) -> Result<Task, String> {
    let id = parse_digest("id", &row.id)?;
    let run_id = parse_digest(
        "run id",
        row.run_id.as_deref().ok_or_else(|| format!("task {id} missing run id"))?,
    )?;
    let flow_id = parse_digest(
        "flow id",
        row.flow_id.as_deref().ok_or_else(|| format!("task {id} missing flow id"))?,
    )?;
    let start = parse_time("start time", &row.start_time)?;
    let keepalive = match &row.keepalive {
        Some(ka) => parse_time("keepalive", ka)?,
        None => start,
    };
    let opt_digest = |field: &str, v: &Option<String>| -> Result<Option<Digest>, String> {
        v.as_deref().map(|s| parse_digest(field, s)).transpose()
    };
    Ok(Task {
        id,
        run_id,
        flow_id,
        uri: row.uri.clone().unwrap_or_default(),
        result_id: opt_digest("result id", &row.result_id)?,
        stdout: opt_digest("stdout", &row.stdout)?,
        stderr: opt_digest("stderr", &row.stderr)?,
        inspect: opt_digest("inspect", &row.inspect)?,
        start,
        keepalive,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store() -> TaskStore {
        let s = TaskStore::open_in_memory().unwrap();
        s.migrate().unwrap();
        s
    }

    fn digest(i: u32) -> Digest {
        Digest::from_str_content(&format!("content-{i}"))
    }

    /// Two full digests sharing their first four hex digits but
    /// diverging after.
    fn colliding_digests() -> (Digest, Digest) {
        use std::collections::HashMap;
        let mut seen: HashMap<String, Digest> = HashMap::new();
        for i in 0u32.. {
            let d = Digest::from_str_content(&format!("collide-{i}"));
            let p = d.hex_n(4).to_string();
            if let Some(prev) = seen.get(&p) {
                if prev.hex() != d.hex() {
                    return (prev.clone(), d);
                }
            }
            seen.insert(p, d);
        }
        unreachable!()
    }

    #[tokio::test]
    async fn create_and_fetch_run_by_id() {
        let s = store();
        let id = digest(1);
        s.create_run(&id, "someone").await.unwrap();

        let query = Query {
            id: Some(id.clone()),
            ..Query::default()
        };
        let runs = s.runs(&query).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, id);
        assert_eq!(runs[0].user, "someone");
        // Without a keepalive, the keepalive reads as the start time.
        assert_eq!(runs[0].keepalive, runs[0].start);
    }

    #[tokio::test]
    async fn store_labels_round_trip() {
        let mut labels = Labels::new();
        labels.insert("team".to_string(), "bio".to_string());
        let s = TaskStore::open_in_memory().unwrap().with_labels(labels.clone());
        s.migrate().unwrap();
        let id = digest(2);
        s.create_run(&id, "someone").await.unwrap();

        let runs = s
            .runs(&Query {
                id: Some(id),
                ..Query::default()
            })
            .await
            .unwrap();
        assert_eq!(runs[0].labels, labels);
    }

    #[tokio::test]
    async fn task_ids_reference_runs() {
        let s = store();
        let run = digest(10);
        let (t1, t2) = (digest(11), digest(12));
        s.create_run(&run, "someone").await.unwrap();
        s.create_task(&t1, &run, &digest(13), "exec://w1/abc").await.unwrap();
        s.create_task(&t2, &run, &digest(14), "exec://w1/def").await.unwrap();

        let tasks = s
            .tasks(&Query {
                run_id: Some(run.clone()),
                ..Query::default()
            })
            .await
            .unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.run_id == run));
    }

    #[tokio::test]
    async fn set_result_and_attrs_are_partial_updates() {
        let s = store();
        let (run, task) = (digest(20), digest(21));
        s.create_run(&run, "someone").await.unwrap();
        s.create_task(&task, &run, &digest(22), "exec://w1/abc").await.unwrap();

        s.set_task_result(&task, &digest(23)).await.unwrap();
        s.set_task_attrs(&task, &digest(24), &digest(25), &digest(26))
            .await
            .unwrap();

        let tasks = s
            .tasks(&Query {
                id: Some(task.clone()),
                ..Query::default()
            })
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        let t = &tasks[0];
        assert_eq!(t.result_id, Some(digest(23)));
        assert_eq!(t.stdout, Some(digest(24)));
        assert_eq!(t.stderr, Some(digest(25)));
        assert_eq!(t.inspect, Some(digest(26)));
        // The URI survived the partial updates.
        assert_eq!(t.uri, "exec://w1/abc");
    }

    #[tokio::test]
    async fn keepalive_makes_row_visible_to_time_queries() {
        let s = store();
        let id = digest(30);
        s.create_run(&id, "someone").await.unwrap();

        let t = Utc::now();
        s.keepalive(&id, t).await.unwrap();

        let runs = s
            .runs(&Query {
                since: Some(t - Duration::hours(1)),
                ..Query::default()
            })
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].keepalive.timestamp(), t.timestamp());
    }

    #[tokio::test]
    async fn keepalive_moves_the_date_bucket() {
        let s = store();
        let id = digest(31);
        s.create_run(&id, "someone").await.unwrap();

        let yesterday = Utc::now() - Duration::days(1);
        s.keepalive(&id, yesterday).await.unwrap();
        let now = Utc::now();
        s.keepalive(&id, now).await.unwrap();

        // The row appears exactly once, with the newest keepalive.
        let runs = s
            .runs(&Query {
                since: Some(yesterday - Duration::hours(1)),
                ..Query::default()
            })
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].keepalive.timestamp(), now.timestamp());
    }

    #[tokio::test]
    async fn since_excludes_older_keepalives() {
        let s = store();
        let (old, new) = (digest(40), digest(41));
        s.create_run(&old, "someone").await.unwrap();
        s.create_run(&new, "someone").await.unwrap();
        let now = Utc::now();
        s.keepalive(&old, now - Duration::hours(3)).await.unwrap();
        s.keepalive(&new, now).await.unwrap();

        let runs = s
            .runs(&Query {
                since: Some(now - Duration::hours(1)),
                ..Query::default()
            })
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, new);
    }

    #[tokio::test]
    async fn user_filter_applies_to_time_queries() {
        let s = store();
        let (a, b) = (digest(50), digest(51));
        s.create_run(&a, "alice").await.unwrap();
        s.create_run(&b, "bob").await.unwrap();
        let now = Utc::now();
        s.keepalive(&a, now).await.unwrap();
        s.keepalive(&b, now).await.unwrap();

        let runs = s
            .runs(&Query {
                since: Some(now - Duration::hours(1)),
                user: Some("alice".to_string()),
                ..Query::default()
            })
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, a);
    }

    #[tokio::test]
    async fn time_queries_separate_runs_from_tasks() {
        let s = store();
        let (run, task) = (digest(60), digest(61));
        s.create_run(&run, "someone").await.unwrap();
        s.create_task(&task, &run, &digest(62), "exec://w1/abc").await.unwrap();
        let now = Utc::now();
        s.keepalive(&run, now).await.unwrap();
        s.keepalive(&task, now).await.unwrap();

        let q = Query {
            since: Some(now - Duration::hours(1)),
            ..Query::default()
        };
        let runs = s.runs(&q).await.unwrap();
        let tasks = s.tasks(&q).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, run);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, task);
    }

    #[tokio::test]
    async fn abbreviation_queries_narrow_client_side() {
        let s = store();
        let (a, b) = colliding_digests();
        s.create_run(&a, "someone").await.unwrap();
        s.create_run(&b, "someone").await.unwrap();

        // The shared 4-digit abbreviation matches both.
        let abbrev = Digest::parse(a.hex_n(4)).unwrap();
        let runs = s
            .runs(&Query {
                id: Some(abbrev),
                ..Query::default()
            })
            .await
            .unwrap();
        assert_eq!(runs.len(), 2);

        // A longer abbreviation of `a` excludes `b`.
        let longer = Digest::parse(a.hex_n(12)).unwrap();
        let runs = s
            .runs(&Query {
                id: Some(longer),
                ..Query::default()
            })
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, a);
    }

    #[tokio::test]
    #[should_panic(expected = "taskdb invalid query")]
    async fn run_query_with_run_id_panics() {
        let s = store();
        let q = Query {
            run_id: Some(digest(70)),
            ..Query::default()
        };
        let _ = s.runs(&q).await;
    }

    #[tokio::test]
    #[should_panic(expected = "missing since")]
    async fn time_query_without_since_panics() {
        let s = store();
        let _ = s.runs(&Query::default()).await;
    }

    #[tokio::test]
    async fn missing_index_points_at_migrate() {
        // No migrate: only the tables touched by writes exist.
        let s = TaskStore::open_in_memory().unwrap();
        let id = digest(80);
        s.create_run(&id, "someone").await.unwrap();

        let err = s
            .runs(&Query {
                since: Some(Utc::now() - Duration::hours(1)),
                ..Query::default()
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("flowd migrate"), "got: {err}");
    }

    #[tokio::test]
    async fn date_buckets_span_sparse_days() {
        let since = Utc::now() - Duration::days(3);
        let buckets = date_buckets(since, Utc::now());
        assert_eq!(buckets.len(), 4);
        assert!(buckets.windows(2).all(|w| w[0] < w[1]));
    }
}
