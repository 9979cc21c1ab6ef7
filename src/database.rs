use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use sqlx::FromRow;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::error::StoreError;
use crate::submission::{GradeReport, Submission, SubmissionId, SubmissionStatus, TestCase};

const DATABASE_NAME: &str = "gradebox.sqlite3";

/// Terminal fields written when an attempt finishes
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionUpdate {
    pub status: SubmissionStatus,
    pub execution_time_ms: Option<f64>,
    pub memory_usage_mb: Option<f64>,
    pub diagnostic: Option<String>,
}

impl From<&GradeReport> for SubmissionUpdate {
    fn from(report: &GradeReport) -> Self {
        Self {
            status: report.status(),
            execution_time_ms: report.execution_time_ms(),
            memory_usage_mb: report.memory_usage_mb(),
            diagnostic: report.diagnostic().map(str::to_string),
        }
    }
}

/// What a compare-and-set write of a terminal status did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// The status was written by this call
    Applied,
    /// The same attempt had already written its status; nothing changed
    AlreadyApplied,
    /// A newer attempt owns the submission; the write was rejected
    Stale { current_attempt: i64 },
}

/// Persistence collaborator the engine reads submissions from and writes results to
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Oldest pending submissions first
    async fn fetch_pending(&self, limit: u32) -> Result<Vec<Submission>, StoreError>;

    async fn fetch_submission(&self, id: SubmissionId) -> Result<Submission, StoreError>;

    /// Visible test cases first, then hidden ones, each group in id order
    async fn fetch_test_cases(&self, problem_id: i64) -> Result<Vec<TestCase>, StoreError>;

    /// Claims a pending submission for a new grading attempt and returns its number
    async fn begin_attempt(&self, id: SubmissionId) -> Result<i64, StoreError>;

    /// Writes the terminal status if `attempt` is still the newest one
    async fn finalize(
        &self,
        id: SubmissionId,
        attempt: i64,
        update: &SubmissionUpdate,
    ) -> Result<FinalizeOutcome, StoreError>;
}

pub fn get_db_path() -> Result<PathBuf> {
    use directories::ProjectDirs;

    let proj_dirs = ProjectDirs::from("", "", "gradebox")
        .ok_or_else(|| anyhow!("Unable to find user directory"))?;
    let data_dir = proj_dirs.data_local_dir();

    fs::create_dir_all(data_dir)?;

    Ok(data_dir.join(DATABASE_NAME))
}

pub async fn init_db(db_path: impl AsRef<Path>) -> sqlx::Result<SqlitePool> {
    let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display()); // rwc = read/write/create
    let db_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(0)
        .connect(&db_url)
        .await?;

    // PRAGMA statements cannot run inside a transaction
    for pragma_sql in &[
        "PRAGMA foreign_keys = ON;",
        "PRAGMA busy_timeout = 2000;",
        "PRAGMA journal_mode = WAL;",
        "PRAGMA synchronous = NORMAL;",
    ] {
        sqlx::query(pragma_sql).execute(&db_pool).await?;
    }

    let mut tx = db_pool.begin().await?;

    for sql in &[
        r"
        CREATE TABLE IF NOT EXISTS submissions (
            id                 INTEGER  PRIMARY KEY,
            user_id            INTEGER  NOT NULL,
            problem_id         INTEGER  NOT NULL,
            submitted_code     TEXT     NOT NULL,
            language           TEXT     NOT NULL,
            status             TEXT     NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'accepted', 'wrong_answer', 'error')),
            execution_time_ms  REAL,
            memory_usage_mb    REAL,
            diagnostic         TEXT,
            attempt            INTEGER  NOT NULL DEFAULT 0,
            submitted_at       TEXT     NOT NULL,
            graded_at          TEXT
        );",
        r"
        CREATE TABLE IF NOT EXISTS test_cases (
            id                 INTEGER  PRIMARY KEY,
            problem_id         INTEGER  NOT NULL,
            input              TEXT     NOT NULL,
            expected_output    TEXT     NOT NULL,
            is_hidden          INTEGER  NOT NULL DEFAULT 0
        );",
        "CREATE INDEX IF NOT EXISTS idx_submissions_status ON submissions (status, id);",
        "CREATE INDEX IF NOT EXISTS idx_test_cases_problem ON test_cases (problem_id);",
    ] {
        sqlx::query(sql).execute(tx.as_mut()).await?;
    }

    tx.commit().await?;

    log::info!("Initialized database at {}", db_path.as_ref().display());

    Ok(db_pool)
}

pub fn remove_db(db_path: impl AsRef<Path>) {
    // Remove WAL and SHM files (ignore errors as they might not exist)
    let wal_path = format!("{}-wal", db_path.as_ref().display());
    let shm_path = format!("{}-shm", db_path.as_ref().display());
    let _ = fs::remove_file(wal_path);
    let _ = fs::remove_file(shm_path);

    if let Err(e) = fs::remove_file(&db_path) {
        log::warn!(
            "Unable to remove database at {}: {e}",
            db_path.as_ref().display()
        );
    } else {
        log::info!("Removed database at {}", db_path.as_ref().display());
    }
}

#[derive(FromRow)]
struct SubmissionRow {
    id: i64,
    user_id: i64,
    problem_id: i64,
    submitted_code: String,
    language: String,
    status: String,
    execution_time_ms: Option<f64>,
    memory_usage_mb: Option<f64>,
    diagnostic: Option<String>,
    attempt: i64,
    submitted_at: String,
}

impl TryFrom<SubmissionRow> for Submission {
    type Error = StoreError;

    fn try_from(row: SubmissionRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("submission {}: {e}", row.id)))?;
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            problem_id: row.problem_id,
            source_code: row.submitted_code,
            language: row.language,
            status,
            execution_time_ms: row.execution_time_ms,
            memory_usage_mb: row.memory_usage_mb,
            diagnostic: row.diagnostic,
            attempt: row.attempt,
            submitted_at: Some(row.submitted_at),
        })
    }
}

#[derive(FromRow)]
struct TestCaseRow {
    id: i64,
    problem_id: i64,
    input: String,
    expected_output: String,
    is_hidden: bool,
}

impl From<TestCaseRow> for TestCase {
    fn from(row: TestCaseRow) -> Self {
        Self {
            id: row.id,
            problem_id: row.problem_id,
            input: row.input,
            expected_output: row.expected_output,
            is_hidden: row.is_hidden,
        }
    }
}

const SUBMISSION_COLUMNS: &str = "id, user_id, problem_id, submitted_code, language, status, \
     execution_time_ms, memory_usage_mb, diagnostic, attempt, submitted_at";

/// [`SubmissionStore`] over the SQLite database created by [`init_db`]
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Stores a new pending submission and returns its id
    pub async fn insert_submission(
        &self,
        user_id: i64,
        problem_id: i64,
        language: &str,
        source_code: &str,
    ) -> Result<SubmissionId, StoreError> {
        let now = crate::create_timestamp();
        let result = sqlx::query(
            r"
            INSERT INTO submissions (user_id, problem_id, submitted_code, language, submitted_at)
            VALUES (?, ?, ?, ?, ?)
            ",
        )
        .bind(user_id)
        .bind(problem_id)
        .bind(source_code)
        .bind(language)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn insert_test_case(
        &self,
        problem_id: i64,
        input: &str,
        expected_output: &str,
        is_hidden: bool,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r"
            INSERT INTO test_cases (problem_id, input, expected_output, is_hidden)
            VALUES (?, ?, ?, ?)
            ",
        )
        .bind(problem_id)
        .bind(input)
        .bind(expected_output)
        .bind(is_hidden)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn current_state(
        &self,
        id: SubmissionId,
    ) -> Result<(i64, SubmissionStatus), StoreError> {
        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT attempt, status FROM submissions WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        let (attempt, status) = row.ok_or(StoreError::NotFound(id))?;
        let status = status
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("submission {id}: {e}")))?;
        Ok((attempt, status))
    }
}

#[async_trait]
impl SubmissionStore for SqliteStore {
    async fn fetch_pending(&self, limit: u32) -> Result<Vec<Submission>, StoreError> {
        let rows: Vec<SubmissionRow> = sqlx::query_as(&format!(
            "SELECT {SUBMISSION_COLUMNS} FROM submissions WHERE status = 'pending' ORDER BY id LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Submission::try_from).collect()
    }

    async fn fetch_submission(&self, id: SubmissionId) -> Result<Submission, StoreError> {
        let row: Option<SubmissionRow> = sqlx::query_as(&format!(
            "SELECT {SUBMISSION_COLUMNS} FROM submissions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(StoreError::NotFound(id))?.try_into()
    }

    async fn fetch_test_cases(&self, problem_id: i64) -> Result<Vec<TestCase>, StoreError> {
        let rows: Vec<TestCaseRow> = sqlx::query_as(
            r"
            SELECT id, problem_id, input, expected_output, is_hidden
            FROM test_cases
            WHERE problem_id = ?
            ORDER BY is_hidden, id
            ",
        )
        .bind(problem_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(TestCase::from).collect())
    }

    async fn begin_attempt(&self, id: SubmissionId) -> Result<i64, StoreError> {
        let claimed: Option<(i64,)> = sqlx::query_as(
            r"
            UPDATE submissions
            SET attempt = attempt + 1
            WHERE id = ? AND status = 'pending'
            RETURNING attempt
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match claimed {
            Some((attempt,)) => Ok(attempt),
            None => {
                // Either missing or already graded
                self.current_state(id).await?;
                Err(StoreError::NotPending(id))
            }
        }
    }

    async fn finalize(
        &self,
        id: SubmissionId,
        attempt: i64,
        update: &SubmissionUpdate,
    ) -> Result<FinalizeOutcome, StoreError> {
        if !update.status.is_terminal() {
            return Err(StoreError::NotTerminal(id));
        }

        let now = crate::create_timestamp();
        let result = sqlx::query(
            r"
            UPDATE submissions
            SET status = ?, execution_time_ms = ?, memory_usage_mb = ?, diagnostic = ?, graded_at = ?
            WHERE id = ? AND attempt = ? AND status = 'pending'
            ",
        )
        .bind(update.status.as_str())
        .bind(update.execution_time_ms)
        .bind(update.memory_usage_mb)
        .bind(update.diagnostic.as_deref())
        .bind(now)
        .bind(id)
        .bind(attempt)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(FinalizeOutcome::Applied);
        }

        let (current_attempt, status) = self.current_state(id).await?;
        if current_attempt > attempt {
            Ok(FinalizeOutcome::Stale { current_attempt })
        } else if current_attempt == attempt && status.is_terminal() {
            Ok(FinalizeOutcome::AlreadyApplied)
        } else {
            // Attempt numbers come from begin_attempt, so a pending row with an
            // older counter means the caller invented its attempt
            Err(StoreError::Corrupt(format!(
                "submission {id} is at attempt {current_attempt} ({status}), cannot finalize attempt {attempt}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct DbGuard {
        _dir: tempfile::TempDir,
        store: SqliteStore,
    }

    async fn setup() -> DbGuard {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_db(dir.path().join("test.sqlite3")).await.unwrap();
        DbGuard {
            _dir: dir,
            store: SqliteStore::new(pool),
        }
    }

    fn accepted() -> SubmissionUpdate {
        SubmissionUpdate {
            status: SubmissionStatus::Accepted,
            execution_time_ms: Some(12.0),
            memory_usage_mb: Some(3.5),
            diagnostic: None,
        }
    }

    #[tokio::test]
    async fn test_pending_submissions_round_trip() {
        let db = setup().await;
        let id = db.store.insert_submission(7, 1, "python", "print(5)").await.unwrap();

        let pending = db.store.fetch_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].user_id, 7);
        assert_eq!(pending[0].source_code, "print(5)");
        assert_eq!(pending[0].status, SubmissionStatus::Pending);
        assert_eq!(pending[0].attempt, 0);
    }

    #[tokio::test]
    async fn test_visible_cases_come_first() {
        let db = setup().await;
        let hidden = db.store.insert_test_case(1, "1", "1", true).await.unwrap();
        let first = db.store.insert_test_case(1, "2", "2", false).await.unwrap();
        let second = db.store.insert_test_case(1, "3", "3", false).await.unwrap();
        db.store.insert_test_case(2, "4", "4", false).await.unwrap();

        let ids: Vec<_> = db
            .store
            .fetch_test_cases(1)
            .await
            .unwrap()
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![first, second, hidden]);
    }

    #[tokio::test]
    async fn test_finalize_applies_exactly_once() {
        let db = setup().await;
        let id = db.store.insert_submission(0, 1, "sh", "echo 5").await.unwrap();

        let attempt = db.store.begin_attempt(id).await.unwrap();
        assert_eq!(attempt, 1);
        assert_eq!(
            db.store.finalize(id, attempt, &accepted()).await.unwrap(),
            FinalizeOutcome::Applied
        );
        assert_eq!(
            db.store.finalize(id, attempt, &accepted()).await.unwrap(),
            FinalizeOutcome::AlreadyApplied
        );

        let stored = db.store.fetch_submission(id).await.unwrap();
        assert_eq!(stored.status, SubmissionStatus::Accepted);
        assert_eq!(stored.execution_time_ms, Some(12.0));
        assert_eq!(stored.memory_usage_mb, Some(3.5));

        assert!(matches!(
            db.store.begin_attempt(id).await,
            Err(StoreError::NotPending(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_attempt_is_rejected() {
        let db = setup().await;
        let id = db.store.insert_submission(0, 1, "sh", "echo 5").await.unwrap();

        let old = db.store.begin_attempt(id).await.unwrap();
        let new = db.store.begin_attempt(id).await.unwrap();
        assert_eq!(new, old + 1);

        assert_eq!(
            db.store.finalize(id, old, &accepted()).await.unwrap(),
            FinalizeOutcome::Stale {
                current_attempt: new
            }
        );
        assert_eq!(
            db.store.fetch_submission(id).await.unwrap().status,
            SubmissionStatus::Pending
        );
        assert_eq!(
            db.store.finalize(id, new, &accepted()).await.unwrap(),
            FinalizeOutcome::Applied
        );
    }

    #[tokio::test]
    async fn test_pending_status_is_not_persisted() {
        let db = setup().await;
        let id = db.store.insert_submission(0, 1, "sh", "echo 5").await.unwrap();
        let attempt = db.store.begin_attempt(id).await.unwrap();
        let update = SubmissionUpdate {
            status: SubmissionStatus::Pending,
            ..accepted()
        };
        assert!(matches!(
            db.store.finalize(id, attempt, &update).await,
            Err(StoreError::NotTerminal(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_submission() {
        let db = setup().await;
        assert!(matches!(
            db.store.begin_attempt(42).await,
            Err(StoreError::NotFound(42))
        ));
        assert!(matches!(
            db.store.fetch_submission(42).await,
            Err(StoreError::NotFound(42))
        ));
    }
}
