use std::sync::Arc;

use crate::database::{FinalizeOutcome, SubmissionStore, SubmissionUpdate};
use crate::error::StoreError;
use crate::submission::{GradeReport, SubmissionId};

/// Folds grade reports into persisted submission updates, once per attempt
#[derive(Clone)]
pub struct ResultAggregator {
    store: Arc<dyn SubmissionStore>,
}

impl ResultAggregator {
    pub fn new(store: Arc<dyn SubmissionStore>) -> Self {
        Self { store }
    }

    pub async fn begin_attempt(&self, id: SubmissionId) -> Result<i64, StoreError> {
        let attempt = self.store.begin_attempt(id).await?;
        log::debug!("Submission {id} claimed for attempt {attempt}");
        Ok(attempt)
    }

    pub async fn finalize(
        &self,
        id: SubmissionId,
        attempt: i64,
        report: &GradeReport,
    ) -> Result<FinalizeOutcome, StoreError> {
        let update = SubmissionUpdate::from(report);
        let outcome = self.store.finalize(id, attempt, &update).await?;

        match outcome {
            FinalizeOutcome::Applied => {
                log::info!("Submission {id} attempt {attempt} finalized as {}", update.status);
            }
            FinalizeOutcome::AlreadyApplied => {
                log::debug!("Submission {id} attempt {attempt} was already finalized");
            }
            FinalizeOutcome::Stale { current_attempt } => {
                log::warn!(
                    "Dropping result of submission {id} attempt {attempt}: attempt {current_attempt} owns it"
                );
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{SqliteStore, init_db};
    use crate::submission::{Metrics, SubmissionStatus};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_report_fields_reach_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(init_db(dir.path().join("db.sqlite3")).await.unwrap());
        let id = store.insert_submission(1, 1, "sh", "exit 1").await.unwrap();
        let aggregator = ResultAggregator::new(Arc::new(store.clone()));

        let attempt = aggregator.begin_attempt(id).await.unwrap();
        let report = GradeReport::new(
            SubmissionStatus::Error,
            Some(Metrics {
                execution_time_ms: 4.0,
                memory_usage_mb: 1.5,
            }),
            Some("runtime error on test case 1: exited with code 1".to_string()),
            Vec::new(),
        );
        assert_eq!(
            aggregator.finalize(id, attempt, &report).await.unwrap(),
            FinalizeOutcome::Applied
        );
        assert_eq!(
            aggregator.finalize(id, attempt, &report).await.unwrap(),
            FinalizeOutcome::AlreadyApplied
        );

        let stored = store.fetch_submission(id).await.unwrap();
        assert_eq!(stored.status, SubmissionStatus::Error);
        assert_eq!(stored.execution_time_ms, Some(4.0));
        assert_eq!(stored.memory_usage_mb, Some(1.5));
        assert_eq!(
            stored.diagnostic.as_deref(),
            Some("runtime error on test case 1: exited with code 1")
        );
    }
}
