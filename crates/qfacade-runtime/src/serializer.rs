//! Bounded FIFO admission for generation requests.
//!
//! Admission is a fair semaphore with `max_in_flight` permits. Requests that
//! find no free permit wait in FIFO order, up to `capacity` of them; beyond that
//! they fail immediately with `QueueFull`. Every request carries a deadline
//! covering both waiting and executing.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use qfacade_core::{FacadeError, QueueSettings, TimeoutPhase};
use tokio::sync::{Semaphore, TryAcquireError};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};
use uuid::Uuid;

/// Identity and deadline of one admitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub id: Uuid,
    pub submitted_at: Instant,
    pub deadline: Instant,
}

/// Called when a request overruns its deadline while executing.
pub type TimeoutHook = Arc<dyn Fn(&Ticket) + Send + Sync>;

/// Counts occupants of a stage; decrements when dropped.
struct Occupancy<'a>(&'a AtomicUsize);

impl<'a> Occupancy<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Occupancy<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct RequestSerializer {
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    capacity: usize,
    request_timeout: Duration,
    waiting: AtomicUsize,
    executing: AtomicUsize,
    on_timeout: Option<TimeoutHook>,
}

impl RequestSerializer {
    pub fn new(max_in_flight: usize, capacity: usize, request_timeout: Duration) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            capacity,
            request_timeout,
            waiting: AtomicUsize::new(0),
            executing: AtomicUsize::new(0),
            on_timeout: None,
        }
    }

    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self::new(
            settings.max_in_flight,
            settings.capacity,
            settings.request_timeout(),
        )
    }

    #[must_use]
    pub fn with_timeout_hook(mut self, hook: TimeoutHook) -> Self {
        self.on_timeout = Some(hook);
        self
    }

    pub const fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Requests waiting for admission.
    pub fn queued(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Requests currently executing.
    pub fn executing(&self) -> usize {
        self.executing.load(Ordering::SeqCst)
    }

    /// Run `work` under the default request timeout.
    pub async fn submit<T, F, Fut>(&self, work: F) -> Result<T, FacadeError>
    where
        F: FnOnce(Ticket) -> Fut,
        Fut: Future<Output = Result<T, FacadeError>>,
    {
        self.submit_with_timeout(self.request_timeout, work).await
    }

    /// Run `work` once admitted, failing it if `timeout` elapses first.
    ///
    /// The deadline starts at submission, so time spent queued counts.
    pub async fn submit_with_timeout<T, F, Fut>(
        &self,
        timeout: Duration,
        work: F,
    ) -> Result<T, FacadeError>
    where
        F: FnOnce(Ticket) -> Fut,
        Fut: Future<Output = Result<T, FacadeError>>,
    {
        let submitted_at = Instant::now();
        let ticket = Ticket {
            id: Uuid::new_v4(),
            submitted_at,
            deadline: submitted_at + timeout,
        };

        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => {
                return Err(FacadeError::not_ready("request queue is closed"));
            }
            Err(TryAcquireError::NoPermits) => {
                let Some(_slot) = self.reserve_slot() else {
                    warn!(request_id = %ticket.id, capacity = self.capacity, "Request queue full");
                    return Err(FacadeError::QueueFull {
                        capacity: self.capacity,
                    });
                };
                debug!(request_id = %ticket.id, queued = self.queued(), "Request queued");

                match timeout_at(ticket.deadline, Arc::clone(&self.permits).acquire_owned()).await
                {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => return Err(FacadeError::not_ready("request queue is closed")),
                    Err(_) => {
                        warn!(request_id = %ticket.id, timeout_ms = millis(timeout), "Request timed out in queue");
                        return Err(FacadeError::RequestTimeout {
                            phase: TimeoutPhase::Queued,
                            after: timeout,
                        });
                    }
                }
            }
        };

        let _permit = permit;
        let _executing = Occupancy::enter(&self.executing);
        debug!(
            request_id = %ticket.id,
            waited_ms = millis(submitted_at.elapsed()),
            "Request admitted"
        );

        match timeout_at(ticket.deadline, work(ticket)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(request_id = %ticket.id, timeout_ms = millis(timeout), "Request timed out while executing");
                if let Some(hook) = &self.on_timeout {
                    hook(&ticket);
                }
                Err(FacadeError::RequestTimeout {
                    phase: TimeoutPhase::Executing,
                    after: timeout,
                })
            }
        }
    }

    fn reserve_slot(&self) -> Option<Occupancy<'_>> {
        self.waiting
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .ok()
            .map(|_| Occupancy(&self.waiting))
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    async fn until(condition: impl Fn() -> bool) {
        while !condition() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_queue_full_fails_immediately() {
        let serializer = Arc::new(RequestSerializer::new(1, 1, Duration::from_secs(30)));
        let (release, hold) = oneshot::channel::<()>();

        let running = tokio::spawn({
            let s = serializer.clone();
            async move {
                s.submit(|_| async move {
                    let _ = hold.await;
                    Ok(1)
                })
                .await
            }
        });
        until(|| serializer.executing() == 1).await;

        let queued = tokio::spawn({
            let s = serializer.clone();
            async move { s.submit(|_| async { Ok(2) }).await }
        });
        until(|| serializer.queued() == 1).await;

        let rejected = serializer.submit(|_| async { Ok(3) }).await;
        assert_eq!(rejected, Err(FacadeError::QueueFull { capacity: 1 }));

        release.send(()).unwrap();
        assert_eq!(running.await.unwrap(), Ok(1));
        assert_eq!(queued.await.unwrap(), Ok(2));
        assert_eq!(serializer.queued(), 0);
        assert_eq!(serializer.executing(), 0);
    }

    #[tokio::test]
    async fn test_admission_is_fifo() {
        let serializer = Arc::new(RequestSerializer::new(1, 8, Duration::from_secs(30)));
        let order = Arc::new(Mutex::new(Vec::new()));
        let (release, hold) = oneshot::channel::<()>();

        let first = tokio::spawn({
            let s = serializer.clone();
            async move {
                s.submit(|_| async move {
                    let _ = hold.await;
                    Ok(())
                })
                .await
            }
        });
        until(|| serializer.executing() == 1).await;

        let mut waiters = Vec::new();
        for i in 0..4 {
            let s = serializer.clone();
            let order = order.clone();
            waiters.push(tokio::spawn(async move {
                s.submit(|_| async move {
                    order.lock().unwrap().push(i);
                    Ok(())
                })
                .await
            }));
            until(|| serializer.queued() == i + 1).await;
        }

        release.send(()).unwrap();
        first.await.unwrap().unwrap();
        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_in_flight_never_exceeds_limit() {
        let serializer = Arc::new(RequestSerializer::new(2, 16, Duration::from_secs(30)));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let s = serializer.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    let inner = s.clone();
                    s.submit(|_| async move {
                        peak.fetch_max(inner.executing(), Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok(())
                    })
                    .await
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(serializer.executing(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_request_times_out() {
        let serializer = Arc::new(RequestSerializer::new(1, 4, Duration::from_secs(30)));
        let blocker = tokio::spawn({
            let s = serializer.clone();
            async move {
                s.submit(|_| std::future::pending::<Result<(), FacadeError>>())
                    .await
            }
        });
        until(|| serializer.executing() == 1).await;

        let result = serializer
            .submit_with_timeout(Duration::from_secs(1), |_| async { Ok(()) })
            .await;
        assert_eq!(
            result,
            Err(FacadeError::RequestTimeout {
                phase: TimeoutPhase::Queued,
                after: Duration::from_secs(1),
            })
        );
        assert_eq!(serializer.queued(), 0);
        blocker.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_executing_timeout_runs_hook_and_frees_permit() {
        let fired = Arc::new(AtomicUsize::new(0));
        let hook: TimeoutHook = {
            let fired = fired.clone();
            Arc::new(move |_ticket: &Ticket| {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };
        let serializer =
            RequestSerializer::new(1, 4, Duration::from_secs(2)).with_timeout_hook(hook);

        let result = serializer
            .submit(|_| std::future::pending::<Result<(), FacadeError>>())
            .await;
        assert_eq!(
            result,
            Err(FacadeError::RequestTimeout {
                phase: TimeoutPhase::Executing,
                after: Duration::from_secs(2),
            })
        );
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(serializer.executing(), 0);

        assert_eq!(serializer.submit(|_| async { Ok(7) }).await, Ok(7));
    }

    #[tokio::test]
    async fn test_work_error_is_returned_unchanged() {
        let serializer = RequestSerializer::new(1, 0, Duration::from_secs(5));
        let result: Result<(), _> = serializer
            .submit(|_| async { Err(FacadeError::crashed("model", "exited")) })
            .await;
        assert_eq!(result, Err(FacadeError::crashed("model", "exited")));
    }
}
