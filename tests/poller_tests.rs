mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;

use gradebox::database::{FinalizeOutcome, SqliteStore, SubmissionStore, SubmissionUpdate};
use gradebox::error::StoreError;
use gradebox::submission::{Submission, SubmissionId, SubmissionStatus, TestCase};
use gradebox::worker::{drain, poll_once, poller};

/// Store whose pending list is a snapshot taken before anything was graded
struct SnapshotStore {
    inner: SqliteStore,
    pending: Vec<Submission>,
}

#[async_trait]
impl SubmissionStore for SnapshotStore {
    async fn fetch_pending(&self, _limit: u32) -> Result<Vec<Submission>, StoreError> {
        Ok(self.pending.clone())
    }

    async fn fetch_submission(&self, id: SubmissionId) -> Result<Submission, StoreError> {
        self.inner.fetch_submission(id).await
    }

    async fn fetch_test_cases(&self, problem_id: i64) -> Result<Vec<TestCase>, StoreError> {
        self.inner.fetch_test_cases(problem_id).await
    }

    async fn begin_attempt(&self, id: SubmissionId) -> Result<i64, StoreError> {
        self.inner.begin_attempt(id).await
    }

    async fn finalize(
        &self,
        id: SubmissionId,
        attempt: i64,
        update: &SubmissionUpdate,
    ) -> Result<FinalizeOutcome, StoreError> {
        self.inner.finalize(id, attempt, update).await
    }
}

use common::{ADDER, config, start_engine};

#[tokio::test]
async fn test_drain_grades_every_pending_submission() {
    let t = start_engine(&config(json!({})), 0).await;
    t.store.insert_test_case(1, "2 3", "5", false).await.unwrap();
    t.store.insert_test_case(1, "10 -4", "6", true).await.unwrap();

    let good = t.store.insert_submission(1, 1, "sh", ADDER).await.unwrap();
    let bad = t.store.insert_submission(2, 1, "sh", "echo 5\n").await.unwrap();
    let unknown = t.store.insert_submission(3, 1, "cobol", "").await.unwrap();

    let store: Arc<dyn SubmissionStore> = Arc::new(t.store.clone());
    let graded = drain(&t.engine, &store).await.unwrap();
    assert_eq!(graded, 3);

    let status = |id| {
        let store = t.store.clone();
        async move { store.fetch_submission(id).await.unwrap().status }
    };
    assert_eq!(status(good).await, SubmissionStatus::Accepted);
    assert_eq!(status(bad).await, SubmissionStatus::WrongAnswer);
    assert_eq!(status(unknown).await, SubmissionStatus::Error);
    assert!(store.fetch_pending(10).await.unwrap().is_empty());
    t.engine.shutdown().await;
}

#[tokio::test]
async fn test_poll_leaves_overflow_pending() {
    let config = config(json!({ "engine": { "max_concurrency": 1, "queue_depth": 0 } }));
    let t = start_engine(&config, 0).await;
    t.store.insert_test_case(1, "2 3", "5", false).await.unwrap();
    for _ in 0..3 {
        t.store.insert_submission(0, 1, "sh", ADDER).await.unwrap();
    }

    let store: Arc<dyn SubmissionStore> = Arc::new(t.store.clone());
    let tickets = poll_once(&t.engine, &store).await.unwrap();
    assert_eq!(tickets.len(), 1);

    for ticket in tickets {
        ticket.outcome().await.unwrap();
    }
    assert_eq!(store.fetch_pending(10).await.unwrap().len(), 2);
    t.engine.shutdown().await;
}

#[tokio::test]
async fn test_poller_stops_on_shutdown_signal() {
    let t = start_engine(&config(json!({})), 0).await;
    t.store.insert_test_case(1, "2 3", "5", false).await.unwrap();
    let id = t.store.insert_submission(0, 1, "sh", ADDER).await.unwrap();

    let store: Arc<dyn SubmissionStore> = Arc::new(t.store.clone());
    let token = CancellationToken::new();
    let task = tokio::spawn(poller(
        t.engine.clone(),
        store,
        Duration::from_millis(20),
        token.clone(),
    ));

    for _ in 0..300 {
        if t.store.fetch_submission(id).await.unwrap().status != SubmissionStatus::Pending {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        t.store.fetch_submission(id).await.unwrap().status,
        SubmissionStatus::Accepted
    );

    token.cancel();
    task.await.unwrap().unwrap();
    t.engine.shutdown().await;
}

#[tokio::test]
async fn test_poll_skips_submission_graded_since_fetch() {
    let t = start_engine(&config(json!({})), 0).await;
    t.store.insert_test_case(1, "2 3", "5", false).await.unwrap();
    let id = t.store.insert_submission(0, 1, "sh", ADDER).await.unwrap();

    let stale: Arc<dyn SubmissionStore> = Arc::new(SnapshotStore {
        inner: t.store.clone(),
        pending: t.store.fetch_pending(10).await.unwrap(),
    });
    let live: Arc<dyn SubmissionStore> = Arc::new(t.store.clone());
    assert_eq!(drain(&t.engine, &live).await.unwrap(), 1);

    let tickets = poll_once(&t.engine, &stale).await.unwrap();
    assert!(tickets.is_empty());
    let stored = t.store.fetch_submission(id).await.unwrap();
    assert_eq!(stored.status, SubmissionStatus::Accepted);
    assert_eq!(stored.attempt, 1);
    t.engine.shutdown().await;
}
