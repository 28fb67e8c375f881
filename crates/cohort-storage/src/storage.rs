use crate::schema;
use crate::sql;
use crate::working_set::{self, WorkingSet};
use cohort_engine::{
    Authorizer, BitExtraction, CancelToken, CohortError, CohortResult, Column, CompiledFilter,
    Credentials, GroupCounts, LabelRow, LabelSource, Record, RecordStore, MAX_MASK,
};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;
use thiserror::Error;

/// How long a cancellable request sleeps between attempts to take the connection.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(2);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Engine(#[from] CohortError),
    #[error("query worker failed: {0}")]
    WorkerFailed(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

impl StorageError {
    pub fn is_interrupted(&self) -> bool {
        match self {
            StorageError::Sqlite(err) => {
                err.sqlite_error_code() == Some(ErrorCode::OperationInterrupted)
            }
            _ => false,
        }
    }
}

impl From<StorageError> for CohortError {
    fn from(err: StorageError) -> Self {
        if err.is_interrupted() {
            return CohortError::Cancelled;
        }
        match err {
            StorageError::Engine(err) => err,
            other => CohortError::store(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// SQLite busy timeout for locked database files (default: 5s). Catalog, value and credential
    /// lookups wait at most this long for a connection held by a running aggregation.
    pub busy_timeout: Duration,
    /// Virtual machine instructions between two cancellation checks (default: 1000).
    pub progress_check_ops: i32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
            progress_check_ops: 1000,
        }
    }
}

/// Everything `import` can load in one go, as read from a JSON document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub records: Vec<Record>,
    #[serde(default)]
    pub labels: Vec<LabelRow>,
    #[serde(default)]
    pub users: Vec<Credentials>,
}

impl Dataset {
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub records: usize,
    pub labels: usize,
    pub users: usize,
}

#[derive(Debug, Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
    config: StorageConfig,
}

impl Storage {
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_path_with_config(path, StorageConfig::default())
    }

    pub fn open_path_with_config(path: impl AsRef<Path>, config: StorageConfig) -> Result<Self> {
        Self::from_connection(Connection::open(path)?, config)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, StorageConfig::default())
    }

    fn from_connection(conn: Connection, config: StorageConfig) -> Result<Self> {
        conn.busy_timeout(config.busy_timeout)?;
        schema::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn insert_records(&self, records: &[Record]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock().expect("storage mutex poisoned");
        let tx = conn.transaction()?;
        insert_records_tx(&tx, records)?;
        tx.commit()?;
        Ok(records.len())
    }

    /// Insert or replace label rows. Rows are validated when a catalog is loaded from them.
    pub fn insert_labels(&self, labels: &[LabelRow]) -> Result<usize> {
        if labels.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock().expect("storage mutex poisoned");
        let tx = conn.transaction()?;
        insert_labels_tx(&tx, labels)?;
        tx.commit()?;
        Ok(labels.len())
    }

    pub fn insert_user(&self, credentials: &Credentials) -> Result<()> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO users (userid, auth_token) VALUES (?1, ?2)",
            params![&credentials.userid, &credentials.auth_token],
        )?;
        Ok(())
    }

    /// Load a whole dataset in a single transaction.
    pub fn import(&self, dataset: &Dataset) -> Result<ImportSummary> {
        let mut conn = self.conn.lock().expect("storage mutex poisoned");
        let tx = conn.transaction()?;
        insert_records_tx(&tx, &dataset.records)?;
        insert_labels_tx(&tx, &dataset.labels)?;
        for user in &dataset.users {
            tx.execute(
                "INSERT OR REPLACE INTO users (userid, auth_token) VALUES (?1, ?2)",
                params![&user.userid, &user.auth_token],
            )?;
        }
        tx.commit()?;

        let summary = ImportSummary {
            records: dataset.records.len(),
            labels: dataset.labels.len(),
            users: dataset.users.len(),
        };
        log::info!(
            "imported {} records, {} labels, {} users",
            summary.records,
            summary.labels,
            summary.users
        );
        Ok(summary)
    }

    pub fn record_count(&self) -> Result<u64> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM patients_info", [], |r| r.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Request working sets currently alive. Zero whenever no request is in flight.
    pub fn open_working_sets(&self) -> Result<usize> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        Ok(working_set::open_count(&conn)?)
    }

    /// Take the connection for a short lookup, waiting at most `busy_timeout`.
    fn lock_bounded(&self) -> CohortResult<MutexGuard<'_, Connection>> {
        let deadline = CancelToken::with_timeout(self.config.busy_timeout);
        self.lock_cancellable(&deadline).map_err(|err| match err {
            CohortError::Cancelled => CohortError::StoreUnavailable {
                message: format!(
                    "connection busy for more than {:?}",
                    self.config.busy_timeout
                ),
                source: None,
            },
            other => other,
        })
    }

    /// Take the connection, giving up if `cancel` trips while another request holds it.
    fn lock_cancellable(&self, cancel: &CancelToken) -> CohortResult<MutexGuard<'_, Connection>> {
        loop {
            match self.conn.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::WouldBlock) => {
                    cancel.check()?;
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(TryLockError::Poisoned(_)) => {
                    return Err(CohortError::StoreUnavailable {
                        message: "storage mutex poisoned".to_string(),
                        source: None,
                    })
                }
            }
        }
    }
}

fn insert_records_tx(tx: &Transaction<'_>, records: &[Record]) -> Result<()> {
    let mut stmt = tx.prepare(
        r#"
        INSERT INTO patients_info (patid, medical_condition, treatment, paytyp, state, pop)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )?;
    for record in records {
        for (what, mask) in [
            ("medical_condition", record.medical_condition),
            ("treatment", record.treatment),
        ] {
            if mask > MAX_MASK {
                return Err(CohortError::invalid(format!(
                    "record {} has {what} mask {mask} above {MAX_MASK}",
                    record.patid
                ))
                .into());
            }
        }
        // Non-positive ids let SQLite assign the rowid.
        let patid = (record.patid > 0).then_some(record.patid);
        stmt.execute(params![
            patid,
            record.medical_condition as i64,
            record.treatment as i64,
            &record.paytyp,
            &record.state,
            &record.pop,
        ])?;
    }
    Ok(())
}

fn insert_labels_tx(tx: &Transaction<'_>, labels: &[LabelRow]) -> Result<()> {
    let mut stmt = tx.prepare(
        "INSERT OR REPLACE INTO label_info (name, label_type, label, label_val) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for row in labels {
        stmt.execute(params![&row.name, &row.label_type, &row.label, row.label_val])?;
    }
    Ok(())
}

fn aggregate_locked(
    conn: &Connection,
    filter: &CompiledFilter,
    extraction: &BitExtraction,
    cancel: &CancelToken,
    check_ops: i32,
) -> Result<Vec<GroupCounts>> {
    let working_set = WorkingSet::create(conn, &filter.row_predicate, cancel, check_ops)?;

    let query = sql::aggregate_query(working_set.name(), filter, extraction);
    log::debug!("aggregating: {}", query.sql);
    let mut stmt = conn.prepare(&query.sql)?;
    let rows = stmt.query_map(params_from_iter(query.params.iter()), |r| {
        let group: Option<String> = r.get(0)?;
        let total = count_at(r, 1)?;
        let mut counts = Vec::with_capacity(extraction.len());
        for idx in 0..extraction.len() {
            counts.push(count_at(r, idx + 2)?);
        }
        Ok(GroupCounts {
            group: group.unwrap_or_default(),
            total,
            counts,
        })
    })?;

    let mut groups = Vec::new();
    for group in rows {
        groups.push(group?);
    }
    Ok(groups)
}

fn count_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, value))
}

fn distinct_values_locked(conn: &Connection, column: Column) -> Result<Vec<String>> {
    let col = sql::column(column);
    let mut stmt = conn.prepare(&format!(
        "SELECT DISTINCT {col} FROM patients_info WHERE {col} IS NOT NULL AND {col} <> '' ORDER BY {col}"
    ))?;
    let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
    let mut values = Vec::new();
    for value in rows {
        values.push(value?);
    }
    Ok(values)
}

fn load_labels_locked(conn: &Connection) -> Result<Vec<LabelRow>> {
    let mut stmt = conn.prepare(
        "SELECT name, label_type, label, label_val FROM label_info ORDER BY label_type, label_val",
    )?;
    let rows = stmt.query_map([], |r| {
        Ok(LabelRow {
            name: r.get(0)?,
            label_type: r.get(1)?,
            label: r.get(2)?,
            label_val: r.get(3)?,
        })
    })?;
    let mut labels = Vec::new();
    for row in rows {
        labels.push(row?);
    }
    Ok(labels)
}

impl RecordStore for Storage {
    fn aggregate(
        &self,
        filter: &CompiledFilter,
        extraction: &BitExtraction,
        cancel: &CancelToken,
    ) -> CohortResult<Vec<GroupCounts>> {
        let conn = self.lock_cancellable(cancel)?;
        aggregate_locked(
            &conn,
            filter,
            extraction,
            cancel,
            self.config.progress_check_ops,
        )
        .map_err(|err| {
            if cancel.is_cancelled() {
                CohortError::Cancelled
            } else {
                err.into()
            }
        })
    }

    fn distinct_values(&self, column: Column) -> CohortResult<Vec<String>> {
        let conn = self.lock_bounded()?;
        Ok(distinct_values_locked(&conn, column)?)
    }
}

impl LabelSource for Storage {
    fn load_labels(&self) -> CohortResult<Vec<LabelRow>> {
        let conn = self.lock_bounded()?;
        Ok(load_labels_locked(&conn)?)
    }
}

impl Authorizer for Storage {
    fn is_authorized(&self, credentials: &Credentials) -> bool {
        let conn = match self.lock_bounded() {
            Ok(conn) => conn,
            Err(err) => {
                log::warn!("credential lookup for {:?} failed: {err}", credentials.userid);
                return false;
            }
        };
        let found = conn
            .query_row(
                "SELECT 1 FROM users WHERE userid = ?1 AND auth_token = ?2",
                params![&credentials.userid, &credentials.auth_token],
                |_| Ok(()),
            )
            .optional();
        match found {
            Ok(found) => found.is_some(),
            Err(err) => {
                log::warn!("credential lookup for {:?} failed: {err}", credentials.userid);
                false
            }
        }
    }
}
