use crate::sql;
use cohort_engine::{CancelToken, Predicate};
use rusqlite::{params_from_iter, Connection};
use uuid::Uuid;

/// Prefix of every request-scoped temp table.
pub(crate) const WORKING_SET_PREFIX: &str = "cohort_ws_";

/// A request's filtered rows, materialized as a uniquely named temp table.
///
/// Temp tables are private to their connection. The table is dropped when the guard goes out of
/// scope, whether the request succeeded, failed, was interrupted or panicked.
pub(crate) struct WorkingSet<'conn> {
    conn: &'conn Connection,
    name: String,
}

impl<'conn> WorkingSet<'conn> {
    /// Materialize the rows matching `predicate`.
    ///
    /// While the guard lives, a progress handler interrupts any statement on `conn` once `cancel`
    /// trips, checked every `check_ops` virtual machine instructions.
    pub(crate) fn create(
        conn: &'conn Connection,
        predicate: &Predicate,
        cancel: &CancelToken,
        check_ops: i32,
    ) -> rusqlite::Result<Self> {
        let token = cancel.clone();
        conn.progress_handler(check_ops, Some(move || token.is_cancelled()));

        // Build the guard first so a failed CREATE still clears the handler.
        let working_set = Self {
            conn,
            name: format!("{WORKING_SET_PREFIX}{}", Uuid::new_v4().simple()),
        };

        let statement = sql::create_working_set(&working_set.name, predicate);
        log::debug!("creating working set: {}", statement.sql);
        conn.execute(&statement.sql, params_from_iter(statement.params.iter()))?;

        Ok(working_set)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for WorkingSet<'_> {
    fn drop(&mut self) {
        self.conn.progress_handler(0, None::<fn() -> bool>);
        if let Err(err) = self
            .conn
            .execute_batch(&format!("DROP TABLE IF EXISTS temp.{}", self.name))
        {
            log::warn!("failed to release working set {}: {err}", self.name);
        }
    }
}

/// Number of working sets currently alive on `conn`.
pub(crate) fn open_count(conn: &Connection) -> rusqlite::Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_temp_master WHERE type = 'table' AND substr(name, 1, ?1) = ?2",
        rusqlite::params![WORKING_SET_PREFIX.len() as i64, WORKING_SET_PREFIX],
        |r| r.get(0),
    )?;
    Ok(usize::try_from(count).unwrap_or(0))
}
