use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::database::SubmissionStore;
use crate::engine::{Engine, GradingTicket};
use crate::error::{GradeError, StoreError, SubmitError};
use crate::submission::{SubmissionId, SubmissionStatus};

/// Upper bound of submissions fetched per poll
const FETCH_BATCH: u32 = 256;

/// Feeds every pending submission that is not already in flight into the engine
///
/// Submissions refused for capacity stay pending and are picked up by a
/// later poll.
pub async fn poll_once(
    engine: &Engine,
    store: &Arc<dyn SubmissionStore>,
) -> anyhow::Result<Vec<GradingTicket>> {
    submit_pending(engine, store, &HashSet::new()).await
}

async fn submit_pending(
    engine: &Engine,
    store: &Arc<dyn SubmissionStore>,
    skip: &HashSet<SubmissionId>,
) -> anyhow::Result<Vec<GradingTicket>> {
    let pending = store.fetch_pending(FETCH_BATCH).await?;
    let mut tickets = Vec::new();

    for submission in pending {
        let id = submission.id;
        if skip.contains(&id) || engine.is_in_flight(id) {
            continue;
        }
        // A grading may have finished and left the engine since the batch was read
        let submission = match store.fetch_submission(id).await {
            Ok(current) if current.status == SubmissionStatus::Pending => current,
            Ok(current) => {
                log::debug!("Submission {id} already {}, skipping", current.status);
                continue;
            }
            Err(e) => {
                log::error!("Failed to reload submission {id}: {e}");
                continue;
            }
        };

        let cases = match store.fetch_test_cases(submission.problem_id).await {
            Ok(cases) => cases,
            Err(e) => {
                log::error!("Failed to load test cases for submission {id}: {e}");
                continue;
            }
        };

        match engine.submit(submission, cases) {
            Ok(ticket) => tickets.push(ticket),
            Err(SubmitError::Capacity(e)) => {
                log::debug!("Submission {id} left pending: {e}");
                break;
            }
            Err(SubmitError::AlreadyInFlight(_)) => {}
            Err(SubmitError::ShuttingDown) => break,
        }
    }

    if !tickets.is_empty() {
        log::info!(
            "Poller submitted {} submission(s) ({} in flight, {} queued)",
            tickets.len(),
            engine.in_flight_count(),
            engine.queued_count()
        );
    }
    Ok(tickets)
}

pub async fn poller(
    engine: Engine,
    store: Arc<dyn SubmissionStore>,
    interval: Duration,
    token: CancellationToken,
) -> anyhow::Result<()> {
    log::info!("Poller started (interval {interval:?})");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("Poller received shutdown signal, stopping");
                break;
            }

            _ = ticker.tick() => {
                // Results are persisted by the engine; tickets are not awaited here
                if let Err(e) = poll_once(&engine, &store).await {
                    log::error!("Failed to poll pending submissions: {e}");
                }
            }
        }
    }

    Ok(())
}

/// Grades the submissions pending right now and waits for all of them
///
/// Each submission is tried once; one that fails to grade stays pending.
pub async fn drain(engine: &Engine, store: &Arc<dyn SubmissionStore>) -> anyhow::Result<usize> {
    let mut tried = HashSet::new();
    let mut graded = 0;
    loop {
        let tickets = submit_pending(engine, store, &tried).await?;
        if tickets.is_empty() {
            break;
        }
        for ticket in tickets {
            let id = ticket.submission_id();
            tried.insert(id);
            match ticket.outcome().await {
                Ok(result) => {
                    graded += 1;
                    log::info!("Submission {id}: {}", result.report.status());
                }
                Err(GradeError::Store(StoreError::NotPending(_))) => {
                    log::debug!("Submission {id} was graded elsewhere");
                }
                Err(e) => log::error!("Submission {id} not graded: {e}"),
            }
        }
    }
    Ok(graded)
}
