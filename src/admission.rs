use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::CapacityError;

/// Whether an admitted submission can start right away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Queued,
}

/// Bounds gradings in flight
///
/// Two counted semaphores: `active` holds `max_concurrency` run permits and
/// `slots` holds `max_concurrency + queue_depth` admission permits. Every
/// admitted submission owns a slot until it finishes; it starts running once
/// it also owns an active permit. No slot left means `CapacityError`.
pub struct AdmissionController {
    active: Arc<Semaphore>,
    slots: Arc<Semaphore>,
    max_concurrency: usize,
    queue_depth: usize,
}

impl AdmissionController {
    pub fn new(max_concurrency: usize, queue_depth: usize) -> Self {
        Self {
            active: Arc::new(Semaphore::new(max_concurrency)),
            slots: Arc::new(Semaphore::new(max_concurrency + queue_depth)),
            max_concurrency,
            queue_depth,
        }
    }

    /// Admits one submission or fails fast when every slot is taken
    pub fn try_admit(&self) -> Result<AdmissionTicket, CapacityError> {
        let slot = Arc::clone(&self.slots)
            .try_acquire_owned()
            .map_err(|_| self.capacity_error())?;

        let (admission, permit) = match Arc::clone(&self.active).try_acquire_owned() {
            Ok(permit) => (Admission::Admitted, Some(permit)),
            Err(_) => (Admission::Queued, None),
        };

        Ok(AdmissionTicket {
            admission,
            slot,
            permit,
            active: Arc::clone(&self.active),
        })
    }

    /// Gradings currently holding a run permit
    pub fn active_count(&self) -> usize {
        self.max_concurrency
            .saturating_sub(self.active.available_permits())
    }

    /// Admitted gradings still waiting for a run permit
    pub fn queued_count(&self) -> usize {
        let admitted = (self.max_concurrency + self.queue_depth)
            .saturating_sub(self.slots.available_permits());
        admitted.saturating_sub(self.active_count())
    }

    /// Refuses new admissions and wakes every queued ticket with an error
    pub fn close(&self) {
        self.slots.close();
        self.active.close();
    }

    fn capacity_error(&self) -> CapacityError {
        CapacityError {
            active: self.active_count(),
            queued: self.queued_count(),
        }
    }
}

/// An admitted submission's claim on the engine
pub struct AdmissionTicket {
    admission: Admission,
    slot: OwnedSemaphorePermit,
    permit: Option<OwnedSemaphorePermit>,
    active: Arc<Semaphore>,
}

impl AdmissionTicket {
    pub fn admission(&self) -> Admission {
        self.admission
    }

    /// Waits for a run permit; resolves immediately for admitted tickets
    pub async fn ready(self) -> Result<ActivePermit, AcquireError> {
        let permit = match self.permit {
            Some(permit) => permit,
            None => self.active.acquire_owned().await?,
        };
        Ok(ActivePermit {
            _permit: permit,
            _slot: self.slot,
        })
    }
}

/// Held for as long as one grading runs
pub struct ActivePermit {
    _permit: OwnedSemaphorePermit,
    _slot: OwnedSemaphorePermit,
}

#[derive(Debug)]
pub enum RetryError<E> {
    Cancelled,
    Exhausted(E),
}

/// Bounded exponential backoff for infrastructure errors
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay before the `retry`-th retry (1-based): doubles each time, capped
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Runs `op` until it succeeds or the retry budget is spent
    ///
    /// Only the backoff sleeps observe `cancel`; an attempt that already
    /// started is allowed to finish so it never leaves half-built state.
    pub async fn run<T, E, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if retry >= self.max_retries => {
                    log::warn!("{what} failed after {retry} retries: {e}");
                    return Err(RetryError::Exhausted(e));
                }
                Err(e) => {
                    retry += 1;
                    let delay = self.backoff(retry);
                    log::warn!(
                        "{what} failed: {e}; retry {retry}/{} in {delay:?}",
                        self.max_retries
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(&RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
        })
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = RetryPolicy::new(&RetryConfig::default());
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(10), Duration::from_millis(2000));
        assert_eq!(policy.backoff(64), Duration::from_millis(2000));
    }

    #[test]
    fn test_admission_fails_fast_when_full() {
        let controller = AdmissionController::new(2, 1);
        let first = controller.try_admit().unwrap();
        let second = controller.try_admit().unwrap();
        let third = controller.try_admit().unwrap();
        assert_eq!(first.admission(), Admission::Admitted);
        assert_eq!(second.admission(), Admission::Admitted);
        assert_eq!(third.admission(), Admission::Queued);
        assert_eq!(controller.active_count(), 2);
        assert_eq!(controller.queued_count(), 1);

        let err = controller.try_admit().err().unwrap();
        assert_eq!(
            err,
            CapacityError {
                active: 2,
                queued: 1
            }
        );
    }

    #[tokio::test]
    async fn test_queued_ticket_runs_after_release() {
        let controller = AdmissionController::new(1, 1);
        let running = controller.try_admit().unwrap().ready().await.unwrap();
        let queued = controller.try_admit().unwrap();
        assert_eq!(queued.admission(), Admission::Queued);

        let waiter = tokio::spawn(queued.ready());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(running);
        let permit = waiter.await.unwrap().unwrap();
        assert_eq!(controller.active_count(), 1);
        assert_eq!(controller.queued_count(), 0);
        drop(permit);
        assert_eq!(controller.active_count(), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_queued_tickets() {
        let controller = AdmissionController::new(1, 1);
        let _running = controller.try_admit().unwrap().ready().await.unwrap();
        let queued = controller.try_admit().unwrap();
        controller.close();
        assert!(queued.ready().await.is_err());
        assert!(controller.try_admit().is_err());
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = policy(3)
            .run("flaky", &CancellationToken::new(), || async {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err("unreachable runtime"),
                    n => Ok(n),
                }
            })
            .await;
        assert!(matches!(result, Ok(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(2)
            .run("broken", &CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("down")
            })
            .await;
        assert!(matches!(result, Err(RetryError::Exhausted("down"))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> = policy(5)
            .run("cancelled", &cancel, || async { Err("down") })
            .await;
        assert!(matches!(result, Err(RetryError::Cancelled)));
    }
}
