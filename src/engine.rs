use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::admission::{Admission, AdmissionController, AdmissionTicket};
use crate::aggregator::ResultAggregator;
use crate::config::Config;
use crate::database::{FinalizeOutcome, SubmissionStore};
use crate::error::{GradeError, StoreError, SubmitError};
use crate::runner::TestCaseRunner;
use crate::sandbox::SandboxBackend;
use crate::submission::{GradeReport, Submission, SubmissionId, TestCase};

/// Process-wide grading engine
///
/// Created once with [`Engine::start`] and torn down with
/// [`Engine::shutdown`]; clones share the same state. Each submitted
/// submission is graded on its own task, test cases strictly in order.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    admission: AdmissionController,
    runner: TestCaseRunner,
    aggregator: ResultAggregator,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    in_flight: Mutex<HashMap<SubmissionId, InFlight>>,
    next_generation: AtomicU64,
}

struct InFlight {
    generation: u64,
    cancel: CancellationToken,
}

/// Terminal result of one grading attempt
#[derive(Debug, Clone)]
pub struct GradingResult {
    pub attempt: i64,
    pub report: GradeReport,
    pub persisted: FinalizeOutcome,
}

/// Handle to a submission accepted by [`Engine::submit`]
pub struct GradingTicket {
    submission_id: SubmissionId,
    admission: Admission,
    handle: JoinHandle<Result<GradingResult, GradeError>>,
}

impl GradingTicket {
    pub fn submission_id(&self) -> SubmissionId {
        self.submission_id
    }

    /// Whether the submission started right away or waits for a free slot
    pub fn admission(&self) -> Admission {
        self.admission
    }

    /// Waits for grading to finish
    pub async fn outcome(self) -> Result<GradingResult, GradeError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(GradeError::Aborted(e.to_string())),
        }
    }
}

impl Engine {
    pub fn start(
        config: &Config,
        backend: Arc<dyn SandboxBackend>,
        store: Arc<dyn SubmissionStore>,
        workspace_root: PathBuf,
    ) -> Result<Self> {
        config.validate()?;
        let kind = backend.kind();

        let inner = Inner {
            admission: AdmissionController::new(
                config.engine.max_concurrency,
                config.engine.queue_depth,
            ),
            runner: TestCaseRunner::new(config, backend, workspace_root)?,
            aggregator: ResultAggregator::new(store),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            in_flight: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        };

        log::info!(
            "Engine started with {kind} backend (max concurrency {}, queue depth {})",
            config.engine.max_concurrency,
            config.engine.queue_depth
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Admits a submission for grading and returns immediately
    ///
    /// Fails fast with [`SubmitError::Capacity`] when every slot and queue
    /// position is taken; the submission then stays pending.
    pub fn submit(
        &self,
        submission: Submission,
        cases: Vec<TestCase>,
    ) -> Result<GradingTicket, SubmitError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(SubmitError::ShuttingDown);
        }

        let id = submission.id;
        let cancel = inner.shutdown.child_token();
        let generation = inner.next_generation.fetch_add(1, Ordering::Relaxed);

        let ticket = {
            let mut in_flight = inner.in_flight.lock();
            if in_flight.contains_key(&id) {
                return Err(SubmitError::AlreadyInFlight(id));
            }
            let ticket = inner.admission.try_admit()?;
            in_flight.insert(
                id,
                InFlight {
                    generation,
                    cancel: cancel.clone(),
                },
            );
            ticket
        };
        let admission = ticket.admission();
        log::debug!("Submission {id} {admission:?}");

        let task_inner = Arc::clone(inner);
        let handle = inner.tracker.spawn(async move {
            let result = task_inner.grade(submission, cases, ticket, &cancel).await;
            task_inner.forget(id, generation);
            result
        });

        Ok(GradingTicket {
            submission_id: id,
            admission,
            handle,
        })
    }

    /// Cancels the grading of `id`; returns whether it was in flight
    pub fn cancel(&self, id: SubmissionId) -> bool {
        match self.inner.in_flight.lock().get(&id) {
            Some(entry) => {
                log::info!("Cancelling grading of submission {id}");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_in_flight(&self, id: SubmissionId) -> bool {
        self.inner.in_flight.lock().contains_key(&id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    pub fn active_count(&self) -> usize {
        self.inner.admission.active_count()
    }

    pub fn queued_count(&self) -> usize {
        self.inner.admission.queued_count()
    }

    pub fn live_sandboxes(&self) -> usize {
        self.inner.runner.provisioner().live_sandboxes()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Refuses new work, cancels every grading and waits for their tasks
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        inner.admission.close();
        inner.tracker.close();

        log::info!(
            "Engine shutting down, waiting for {} grading task(s)",
            inner.tracker.len()
        );
        inner.tracker.wait().await;
        log::info!(
            "Engine stopped ({} sandboxes live)",
            inner.runner.provisioner().live_sandboxes()
        );
    }
}

impl Inner {
    async fn grade(
        &self,
        submission: Submission,
        cases: Vec<TestCase>,
        ticket: AdmissionTicket,
        cancel: &CancellationToken,
    ) -> Result<GradingResult, GradeError> {
        let id = submission.id;

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GradeError::Cancelled(id)),
            permit = ticket.ready() => permit
                .map_err(|_| GradeError::Aborted("admission closed".to_string()))?,
        };

        let attempt = self.aggregator.begin_attempt(id).await.map_err(|e| {
            match e {
                StoreError::NotPending(_) => {
                    log::debug!("Submission {id} is no longer pending, skipping")
                }
                _ => log::error!("Failed to claim submission {id}: {e}"),
            }
            e
        })?;
        log::info!(
            "Grading submission {id} attempt {attempt} ({} test cases, {})",
            cases.len(),
            submission.language
        );

        let report = self.runner.grade(&submission, &cases, cancel).await?;

        let persisted = self
            .aggregator
            .finalize(id, attempt, &report)
            .await
            .map_err(|e| {
                log::error!("Failed to persist result of submission {id}: {e}");
                e
            })?;
        log::info!(
            "Submission {id} graded: {} ({:?} ms, {:?} MB)",
            report.status(),
            report.execution_time_ms(),
            report.memory_usage_mb()
        );

        Ok(GradingResult {
            attempt,
            report,
            persisted,
        })
    }

    fn forget(&self, id: SubmissionId, generation: u64) {
        let mut in_flight = self.in_flight.lock();
        if in_flight.get(&id).is_some_and(|e| e.generation == generation) {
            in_flight.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{SqliteStore, init_db};
    use crate::sandbox::ProcessBackend;
    use crate::submission::SubmissionStatus;

    struct EngineGuard {
        _dir: tempfile::TempDir,
        engine: Engine,
        store: SqliteStore,
    }

    async fn setup(max_concurrency: usize, queue_depth: usize) -> EngineGuard {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(init_db(dir.path().join("db.sqlite3")).await.unwrap());
        let mut config: Config = serde_json::from_value(serde_json::json!({
            "backend": { "type": "process", "unshare_network": false },
            "languages": [
                { "name": "sh", "file_name": "main.sh", "command": ["/bin/sh", "%SOURCE%"] }
            ]
        }))
        .unwrap();
        config.engine.max_concurrency = max_concurrency;
        config.engine.queue_depth = queue_depth;

        let backend = ProcessBackend::new(dir.path().join("sandboxes"), false).unwrap();
        let engine = Engine::start(
            &config,
            Arc::new(backend),
            Arc::new(store.clone()),
            dir.path().join("workspaces"),
        )
        .unwrap();
        EngineGuard {
            _dir: dir,
            engine,
            store,
        }
    }

    fn case(input: &str, expected: &str) -> TestCase {
        TestCase {
            id: 1,
            problem_id: 1,
            input: input.to_string(),
            expected_output: expected.to_string(),
            is_hidden: false,
        }
    }

    #[tokio::test]
    async fn test_submit_grades_and_persists() {
        let guard = setup(2, 2).await;
        let id = guard
            .store
            .insert_submission(0, 1, "sh", "read a b\necho $((a + b))\n")
            .await
            .unwrap();
        let submission = guard.store.fetch_submission(id).await.unwrap();

        let ticket = guard
            .engine
            .submit(submission, vec![case("2 3\n", "5")])
            .unwrap();
        assert_eq!(ticket.admission(), Admission::Admitted);
        let result = ticket.outcome().await.unwrap();

        assert_eq!(result.attempt, 1);
        assert_eq!(result.persisted, FinalizeOutcome::Applied);
        assert_eq!(result.report.status(), SubmissionStatus::Accepted);
        assert!(!guard.engine.is_in_flight(id));
        assert_eq!(
            guard.store.fetch_submission(id).await.unwrap().status,
            SubmissionStatus::Accepted
        );
        guard.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_submission_is_refused() {
        let guard = setup(1, 1).await;
        let id = guard
            .store
            .insert_submission(0, 1, "sh", "sleep 5\n")
            .await
            .unwrap();
        let submission = guard.store.fetch_submission(id).await.unwrap();

        let ticket = guard
            .engine
            .submit(submission.clone(), vec![case("", "")])
            .unwrap();
        assert!(matches!(
            guard.engine.submit(submission, vec![case("", "")]),
            Err(SubmitError::AlreadyInFlight(_))
        ));

        assert!(guard.engine.cancel(id));
        assert!(matches!(
            ticket.outcome().await,
            Err(GradeError::Cancelled(_))
        ));
        assert_eq!(guard.engine.live_sandboxes(), 0);
        assert_eq!(
            guard.store.fetch_submission(id).await.unwrap().status,
            SubmissionStatus::Pending
        );
        guard.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_counts_track_running_and_queued_gradings() {
        let guard = setup(1, 1).await;
        let mut tickets = Vec::new();
        for _ in 0..2 {
            let id = guard
                .store
                .insert_submission(0, 1, "sh", "sleep 5\n")
                .await
                .unwrap();
            let submission = guard.store.fetch_submission(id).await.unwrap();
            tickets.push(guard.engine.submit(submission, vec![case("", "")]).unwrap());
        }
        assert_eq!(tickets[0].admission(), Admission::Admitted);
        assert_eq!(tickets[1].admission(), Admission::Queued);
        assert_eq!(guard.engine.in_flight_count(), 2);
        assert_eq!(guard.engine.queued_count(), 1);

        for ticket in &tickets {
            guard.engine.cancel(ticket.submission_id());
        }
        for ticket in tickets {
            assert!(matches!(ticket.outcome().await, Err(GradeError::Cancelled(_))));
        }
        assert_eq!(guard.engine.in_flight_count(), 0);
        assert_eq!(guard.engine.queued_count(), 0);
        guard.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_refused() {
        let guard = setup(1, 0).await;
        guard.engine.shutdown().await;
        assert!(guard.engine.is_shutting_down());
        let submission = Submission::pending(1, 1, "sh", "echo 5");
        assert!(matches!(
            guard.engine.submit(submission, vec![case("", "5")]),
            Err(SubmitError::ShuttingDown)
        ));
    }
}
