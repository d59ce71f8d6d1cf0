//! The work-unit store: persisted schema, the `WuAccess` business-logic
//! operations, and the `check()` invariant auditor.
//!
//! Built on `sqlx` against a WAL-journaled SQLite file. Every `WuAccess`
//! operation is one transaction; priority-ordered `assign` uses a
//! compare-and-set `UPDATE ... WHERE status = ? AND row_id = ?` so two
//! concurrent assigners racing the same row never both win (Design Notes:
//! "prefer direct access with CAS updates over the queue-based gateway" —
//! `wud-gateway` layers the queue on top of this for callers that want it).

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, warn};
use wud_mapper::{collapse, ConditionSet, JoinRow, Op, Value as CondValue};
use wud_model::Workunit;
use wud_state::{can_cancel, expect_status, StateViolation, WuStatus};

pub const ENV_DB_URL: &str = "WUD_DATABASE_URL";

/// Bound on "database is locked" retries, matching `MyCursor._exec`'s `i == 10`.
const LOCK_RETRY_LIMIT: u32 = 10;
/// Bound on assign()'s CAS-race retries before giving up and returning `None`.
const ASSIGN_RETRY_LIMIT: u32 = 5;

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Parse(#[from] wud_model::ParseError),
    #[error(transparent)]
    State(#[from] StateViolation),
    #[error("a work-unit with id {0:?} already exists")]
    DuplicateWuid(String),
    #[error("no work-unit with id {0:?}")]
    NotFound(String),
    #[error("invariant violated for row {row_id}: {detail}")]
    Integrity { row_id: i64, detail: String },
    #[error("database stayed locked after {0} retries")]
    DatabaseLocked(u32),
}

/// Outcome of one `assign` attempt's transaction, distinguishing an empty
/// queue (stop retrying) from a lost CAS race (retry with a new candidate).
enum AssignAttempt {
    Won(String),
    LostRace,
    NoCandidate,
}

fn is_locked(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(e) if e.message().contains("database is locked"))
}

/// Retry an operation that may fail with "database is locked", matching
/// the original `_exec`'s bounded retry loop. Every `WuAccess` mutation
/// goes through this, not just `verify` — the whole transaction (or
/// statement, for non-transactional ops) is retried as a unit, so a
/// lock failure midway leaves nothing partially applied.
async fn retry_on_locked<T, F, Fut>(mut op: F) -> Result<T, DbError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, DbError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(DbError::Sqlx(e)) if is_locked(&e) && attempt < LOCK_RETRY_LIMIT => {
                attempt += 1;
                warn!(attempt, "database is locked, retrying");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(DbError::Sqlx(e)) if is_locked(&e) => {
                return Err(DbError::DatabaseLocked(LOCK_RETRY_LIMIT))
            }
            Err(e) => return Err(e),
        }
    }
}

/// Connect to a SQLite file named by `WUD_DATABASE_URL`
/// (`sqlite:///path/to/file.db`), enabling WAL journaling and foreign keys.
pub async fn connect_from_env() -> Result<SqlitePool, DbError> {
    let url = std::env::var(ENV_DB_URL)
        .unwrap_or_else(|_| "sqlite::memory:".to_string());
    connect(&url).await
}

pub async fn connect(url: &str) -> Result<SqlitePool, DbError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await?;
    sqlx::query("PRAGMA journal_mode = WAL;").execute(&pool).await?;
    sqlx::query("PRAGMA foreign_keys = ON;").execute(&pool).await?;
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<(), DbError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// A declared result file, attached to a work-unit once it reaches
/// `RECEIVED_*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultFile {
    pub filename: String,
    pub path: String,
}

/// One persisted work-unit row plus its attached result files.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkUnitRecord {
    pub row_id: i64,
    pub wuid: String,
    pub status: WuStatus,
    pub wu_text: String,
    pub time_created: Option<String>,
    pub time_assigned: Option<String>,
    pub assigned_client: Option<String>,
    pub time_result: Option<String>,
    pub result_client: Option<String>,
    pub error_code: Option<i64>,
    pub failed_command: Option<i64>,
    pub time_verified: Option<String>,
    pub retry_of: Option<String>,
    pub priority: i64,
    pub files: Vec<ResultFile>,
}

struct FlatRow {
    row_id: i64,
    wuid: String,
    status: i64,
    wu_text: String,
    time_created: Option<String>,
    time_assigned: Option<String>,
    assigned_client: Option<String>,
    time_result: Option<String>,
    result_client: Option<String>,
    error_code: Option<i64>,
    failed_command: Option<i64>,
    time_verified: Option<String>,
    retry_of: Option<String>,
    priority: i64,
    file_filename: Option<String>,
    file_path: Option<String>,
}

impl JoinRow for FlatRow {
    fn parent_pk(&self) -> i64 {
        self.row_id
    }
}

fn flat_row_from_sql(row: &sqlx::sqlite::SqliteRow) -> Result<FlatRow, sqlx::Error> {
    Ok(FlatRow {
        row_id: row.try_get("row_id")?,
        wuid: row.try_get("wuid")?,
        status: row.try_get("status")?,
        wu_text: row.try_get("wu_text")?,
        time_created: row.try_get("time_created")?,
        time_assigned: row.try_get("time_assigned")?,
        assigned_client: row.try_get("assigned_client")?,
        time_result: row.try_get("time_result")?,
        result_client: row.try_get("result_client")?,
        error_code: row.try_get("error_code")?,
        failed_command: row.try_get("failed_command")?,
        time_verified: row.try_get("time_verified")?,
        retry_of: row.try_get("retry_of")?,
        priority: row.try_get("priority")?,
        file_filename: row.try_get("file_filename")?,
        file_path: row.try_get("file_path")?,
    })
}

fn split_flat(row: FlatRow) -> (WorkUnitRecord, Option<ResultFile>) {
    let file = match (row.file_filename, row.file_path) {
        (Some(filename), Some(path)) => Some(ResultFile { filename, path }),
        _ => None,
    };
    let record = WorkUnitRecord {
        row_id: row.row_id,
        wuid: row.wuid,
        status: WuStatus::from_i64(row.status).expect("status column holds a known WuStatus code"),
        wu_text: row.wu_text,
        time_created: row.time_created,
        time_assigned: row.time_assigned,
        assigned_client: row.assigned_client,
        time_result: row.time_result,
        result_client: row.result_client,
        error_code: row.error_code,
        failed_command: row.failed_command,
        time_verified: row.time_verified,
        retry_of: row.retry_of,
        priority: row.priority,
        files: Vec::new(),
    };
    (record, file)
}

const JOIN_SELECT: &str = "\
    SELECT w.row_id AS row_id, w.wuid AS wuid, w.status AS status, w.wu_text AS wu_text, \
           w.time_created AS time_created, w.time_assigned AS time_assigned, \
           w.assigned_client AS assigned_client, w.time_result AS time_result, \
           w.result_client AS result_client, w.error_code AS error_code, \
           w.failed_command AS failed_command, w.time_verified AS time_verified, \
           w.retry_of AS retry_of, w.priority AS priority, \
           f.filename AS file_filename, f.path AS file_path \
    FROM workunits w LEFT JOIN files f ON f.parent_row_id = w.row_id";

/// The business-logic operations. Cheap to clone (wraps a pool handle).
#[derive(Clone)]
pub struct WuAccess {
    pool: SqlitePool,
}

impl WuAccess {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Assert a row's status/timestamp invariants hold. Intended to run on
    /// every read in debug builds, mirroring `WuAccess.check` in the source.
    pub fn check(record: &WorkUnitRecord) -> Result<(), DbError> {
        let bad = |detail: &str| DbError::Integrity {
            row_id: record.row_id,
            detail: detail.to_string(),
        };
        match record.status {
            WuStatus::VerifiedOk | WuStatus::VerifiedError => {
                if record.time_verified.is_none() {
                    return Err(bad("VERIFIED_* requires time_verified"));
                }
            }
            WuStatus::ReceivedError => {
                if record.error_code.map_or(true, |c| c == 0) {
                    return Err(bad("RECEIVED_ERROR requires a nonzero error_code"));
                }
            }
            WuStatus::ReceivedOk => {
                if record.error_code != Some(0) {
                    return Err(bad("RECEIVED_OK requires error_code == 0"));
                }
            }
            WuStatus::Assigned => {
                if record.time_assigned.is_none() || record.assigned_client.is_none() {
                    return Err(bad("ASSIGNED requires time_assigned and assigned_client"));
                }
            }
            WuStatus::Available => {
                if record.time_assigned.is_some()
                    || record.assigned_client.is_some()
                    || record.time_result.is_some()
                    || record.result_client.is_some()
                    || record.error_code.is_some()
                {
                    return Err(bad("AVAILABLE requires all assignment/result fields unset"));
                }
            }
            WuStatus::Cancelled => {}
        }
        Ok(())
    }

    /// Create a new work-unit from its text. Fails on a duplicate wuid.
    pub async fn create(&self, wu_text: &str, priority: Option<i64>) -> Result<String, DbError> {
        let wu = Workunit::parse(wu_text)?;
        let wuid = wu.wuid.clone();

        retry_on_locked(|| {
            let pool = &self.pool;
            let wuid = wuid.clone();
            async move {
                let mut tx = pool.begin().await?;

                let existing: Option<i64> =
                    sqlx::query_scalar("SELECT row_id FROM workunits WHERE wuid = ?")
                        .bind(&wuid)
                        .fetch_optional(&mut *tx)
                        .await?;
                if existing.is_some() {
                    return Err(DbError::DuplicateWuid(wuid));
                }

                let now = Utc::now().to_rfc3339();
                sqlx::query(
                    "INSERT INTO workunits (wuid, status, wu_text, time_created, priority) \
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&wuid)
                .bind(WuStatus::Available.as_i64())
                .bind(wu_text)
                .bind(&now)
                .bind(priority.unwrap_or(0))
                .execute(&mut *tx)
                .await?;

                tx.commit().await?;
                Ok(())
            }
        })
        .await?;

        debug!(wuid = %wuid, "created work-unit");
        Ok(wuid)
    }

    /// Pick the highest-priority AVAILABLE work-unit and assign it to
    /// `client_id`. Returns `None` if no work-unit is available, or if this
    /// worker keeps losing the CAS race to other assigners.
    pub async fn assign(&self, client_id: &str) -> Result<Option<String>, DbError> {
        for attempt in 0..ASSIGN_RETRY_LIMIT {
            let outcome = retry_on_locked(|| {
                let pool = &self.pool;
                async move {
                    let mut tx = pool.begin().await?;
                    let candidate: Option<(i64, String)> = sqlx::query_as(
                        "SELECT row_id, wu_text FROM workunits WHERE status = ? \
                         ORDER BY priority DESC, row_id ASC LIMIT 1",
                    )
                    .bind(WuStatus::Available.as_i64())
                    .fetch_optional(&mut *tx)
                    .await?;

                    let Some((row_id, wu_text)) = candidate else {
                        tx.commit().await?;
                        return Ok(AssignAttempt::NoCandidate);
                    };

                    let now = Utc::now().to_rfc3339();
                    let affected = sqlx::query(
                        "UPDATE workunits SET status = ?, assigned_client = ?, time_assigned = ? \
                         WHERE row_id = ? AND status = ?",
                    )
                    .bind(WuStatus::Assigned.as_i64())
                    .bind(client_id)
                    .bind(&now)
                    .bind(row_id)
                    .bind(WuStatus::Available.as_i64())
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();

                    tx.commit().await?;

                    if affected == 1 {
                        Ok(AssignAttempt::Won(wu_text))
                    } else {
                        Ok(AssignAttempt::LostRace)
                    }
                }
            })
            .await?;

            match outcome {
                AssignAttempt::Won(wu_text) => {
                    debug!(client_id, "assigned work-unit");
                    return Ok(Some(wu_text));
                }
                AssignAttempt::NoCandidate => return Ok(None),
                AssignAttempt::LostRace => warn!(attempt, "lost assign race, retrying"),
            }
        }
        Ok(None)
    }

    async fn fetch_by_wuid(&self, wuid: &str) -> Result<Option<(i64, WuStatus)>, DbError> {
        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT row_id, status FROM workunits WHERE wuid = ?")
                .bind(wuid)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(row_id, status)| {
            (
                row_id,
                WuStatus::from_i64(status).expect("status column holds a known WuStatus code"),
            )
        }))
    }

    /// Attach a result to an ASSIGNED work-unit: status becomes RECEIVED_OK
    /// (error_code == 0) or RECEIVED_ERROR, and the declared result files
    /// are inserted as child rows in the same transaction.
    pub async fn result(
        &self,
        wuid: &str,
        client_id: &str,
        files: &[ResultFile],
        error_code: i64,
        failed_command: Option<i64>,
    ) -> Result<(), DbError> {
        retry_on_locked(|| {
            let pool = &self.pool;
            async move {
                let mut tx = pool.begin().await?;
                let row: Option<(i64, i64)> =
                    sqlx::query_as("SELECT row_id, status FROM workunits WHERE wuid = ?")
                        .bind(wuid)
                        .fetch_optional(&mut *tx)
                        .await?;
                let Some((row_id, status)) = row else {
                    return Err(DbError::NotFound(wuid.to_string()));
                };
                let status =
                    WuStatus::from_i64(status).expect("status column holds a known WuStatus code");
                expect_status(status, WuStatus::Assigned)?;

                let new_status = if error_code == 0 {
                    WuStatus::ReceivedOk
                } else {
                    WuStatus::ReceivedError
                };
                let now = Utc::now().to_rfc3339();

                sqlx::query(
                    "UPDATE workunits SET status = ?, result_client = ?, error_code = ?, \
                     failed_command = ?, time_result = ? WHERE row_id = ?",
                )
                .bind(new_status.as_i64())
                .bind(client_id)
                .bind(error_code)
                .bind(failed_command)
                .bind(&now)
                .bind(row_id)
                .execute(&mut *tx)
                .await?;

                for f in files {
                    sqlx::query("INSERT INTO files (parent_row_id, filename, path) VALUES (?, ?, ?)")
                        .bind(row_id)
                        .bind(&f.filename)
                        .bind(&f.path)
                        .execute(&mut *tx)
                        .await?;
                }

                tx.commit().await?;
                Ok(())
            }
        })
        .await?;

        debug!(wuid, error_code, "recorded result");
        Ok(())
    }

    /// RECEIVED_OK -> VERIFIED_OK or VERIFIED_ERROR, per the external
    /// verification policy's decision `ok`. Sets the literal `timeverified`
    /// column (the source built this key from a one-element list, which
    /// isn't a valid dict key — a typo for the plain string).
    pub async fn verify(&self, wuid: &str, ok: bool) -> Result<(), DbError> {
        let Some((row_id, status)) = self.fetch_by_wuid(wuid).await? else {
            return Err(DbError::NotFound(wuid.to_string()));
        };
        expect_status(status, WuStatus::ReceivedOk)?;

        let new_status = if ok { WuStatus::VerifiedOk } else { WuStatus::VerifiedError };
        let now = Utc::now().to_rfc3339();
        retry_on_locked(|| {
            let pool = &self.pool;
            let now = now.clone();
            async move {
                sqlx::query("UPDATE workunits SET status = ?, time_verified = ? WHERE row_id = ?")
                    .bind(new_status.as_i64())
                    .bind(&now)
                    .bind(row_id)
                    .execute(pool)
                    .await?;
                Ok(())
            }
        })
        .await?;
        Ok(())
    }

    /// Transition any non-terminal work-unit to CANCELLED. No-op on
    /// terminal rows; returns whether a transition happened.
    pub async fn cancel(&self, wuid: &str) -> Result<bool, DbError> {
        let Some((row_id, status)) = self.fetch_by_wuid(wuid).await? else {
            return Err(DbError::NotFound(wuid.to_string()));
        };
        if !can_cancel(status) {
            return Ok(false);
        }
        retry_on_locked(|| {
            let pool = &self.pool;
            async move {
                sqlx::query("UPDATE workunits SET status = ? WHERE row_id = ? AND status = ?")
                    .bind(WuStatus::Cancelled.as_i64())
                    .bind(row_id)
                    .bind(status.as_i64())
                    .execute(pool)
                    .await?;
                Ok(())
            }
        })
        .await?;
        Ok(true)
    }

    /// Read-only join of work-units with their result files.
    pub async fn query(
        &self,
        conditions: &ConditionSet,
        limit: Option<i64>,
        order: Option<(&str, &str)>,
    ) -> Result<Vec<WorkUnitRecord>, DbError> {
        let (where_sql, values) = conditions.to_where_sql();
        let mut sql = format!("{JOIN_SELECT}{where_sql} ORDER BY w.row_id ASC");
        if let Some((col, dir)) = order {
            if !matches!(dir, "ASC" | "DESC") {
                return Err(DbError::Integrity {
                    row_id: -1,
                    detail: format!("invalid order direction {dir:?}"),
                });
            }
            sql = format!("{JOIN_SELECT}{where_sql} ORDER BY w.{col} {dir}, w.row_id ASC");
        }
        if let Some(n) = limit {
            sql.push_str(&format!(" LIMIT {n}"));
        }

        let mut query = sqlx::query(&sql);
        for v in values {
            query = match v {
                CondValue::Int(i) => query.bind(*i),
                CondValue::Text(s) => query.bind(s.clone()),
            };
        }
        let rows = query.fetch_all(&self.pool).await?;
        let flat: Vec<FlatRow> = rows
            .iter()
            .map(flat_row_from_sql)
            .collect::<Result<_, _>>()?;
        let grouped = collapse(flat, split_flat);
        Ok(grouped
            .into_iter()
            .map(|(mut record, files)| {
                record.files = files;
                record
            })
            .collect())
    }

    /// Convenience: all work-units with the given status.
    pub async fn query_by_status(&self, status: WuStatus) -> Result<Vec<WorkUnitRecord>, DbError> {
        let cond = ConditionSet::new().push("w.status", Op::Eq, CondValue::Int(status.as_i64()));
        self.query(&cond, None, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn new_test_db() -> WuAccess {
        let pool = connect("sqlite::memory:").await.unwrap();
        migrate(&pool).await.unwrap();
        WuAccess::new(pool)
    }

    fn wu_text(id: &str) -> String {
        format!("WORKUNIT {id}\nCOMMAND echo hi\nRESULT out.txt\n")
    }

    #[tokio::test]
    async fn create_assign_result_verify_roundtrip() {
        let db = new_test_db().await;
        db.create(&wu_text("W1"), Some(0)).await.unwrap();

        let assigned = db.assign("cli-A").await.unwrap();
        assert_eq!(assigned, Some(wu_text("W1")));

        db.result(
            "W1",
            "cli-A",
            &[ResultFile { filename: "out.txt".into(), path: "/tmp/out.txt".into() }],
            0,
            None,
        )
        .await
        .unwrap();

        let rows = db.query_by_status(WuStatus::ReceivedOk).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].wuid, "W1");
        assert_eq!(rows[0].files, vec![ResultFile { filename: "out.txt".into(), path: "/tmp/out.txt".into() }]);
        WuAccess::check(&rows[0]).unwrap();

        db.verify("W1", true).await.unwrap();
        let rows = db.query_by_status(WuStatus::VerifiedOk).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].time_verified.is_some());
    }

    #[tokio::test]
    async fn priority_ordering() {
        let db = new_test_db().await;
        db.create(&wu_text("W2"), Some(5)).await.unwrap();
        db.create(&wu_text("W3"), Some(1)).await.unwrap();

        assert_eq!(db.assign("cli").await.unwrap(), Some(wu_text("W2")));
        assert_eq!(db.assign("cli").await.unwrap(), Some(wu_text("W3")));
        assert_eq!(db.assign("cli").await.unwrap(), None);
    }

    #[tokio::test]
    async fn double_assign_race_yields_exactly_one_winner() {
        let db = new_test_db().await;
        db.create(&wu_text("W4"), None).await.unwrap();

        let (a, b) = tokio::join!(db.assign("A"), db.assign("B"));
        let winners = [a.unwrap(), b.unwrap()].into_iter().flatten().count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn duplicate_wuid_is_rejected() {
        let db = new_test_db().await;
        db.create(&wu_text("W5"), None).await.unwrap();
        let err = db.create(&wu_text("W5"), None).await.unwrap_err();
        assert!(matches!(err, DbError::DuplicateWuid(_)));
    }

    #[tokio::test]
    async fn result_on_unassigned_wu_is_a_state_violation() {
        let db = new_test_db().await;
        db.create(&wu_text("W6"), None).await.unwrap();
        let err = db
            .result("W6", "cli", &[], 0, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::State(_)));
    }

    #[tokio::test]
    async fn cancel_is_noop_on_terminal_and_transitions_non_terminal() {
        let db = new_test_db().await;
        db.create(&wu_text("W7"), None).await.unwrap();
        assert!(db.cancel("W7").await.unwrap());
        assert!(!db.cancel("W7").await.unwrap());
    }

    #[tokio::test]
    async fn command_failure_is_received_error() {
        let db = new_test_db().await;
        db.create(&wu_text("W8"), None).await.unwrap();
        db.assign("cli").await.unwrap();
        db.result("W8", "cli", &[], 7, Some(1)).await.unwrap();

        let rows = db.query_by_status(WuStatus::ReceivedError).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].error_code, Some(7));
        assert_eq!(rows[0].failed_command, Some(1));
    }
}
