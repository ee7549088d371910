//! Write serializer.
//!
//! Every mutation goes through one FIFO worker task:
//!
//! ```text
//! enqueue(op) ──► mpsc ──► worker: op() ─► flush hook ─► settle delay ─► reply
//!                                   │
//!                                   └─ failed? reply immediately, next slot
//! ```
//!
//! Jobs are handed to the worker when `enqueue` is *called*, not when its
//! future is first polled, so program order is submission order. The worker
//! is spawned on the first call and exits once the queue is dropped and
//! drained. A failing (or panicking) operation is reported to its own caller
//! and never stalls the slots behind it.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::error::{StoreError, StoreResult};

/// Awaited after each successful slot; resolves once the store has flushed
/// every acknowledged write.
pub type FlushHook = Arc<dyn Fn() -> BoxFuture<'static, StoreResult<()>> + Send + Sync>;

/// Result of running one job, delivered to its caller after the slot settles.
struct Slot {
    succeeded: bool,
    deliver: Box<dyn FnOnce() + Send>,
}

type Job = Box<dyn FnOnce() -> BoxFuture<'static, Slot> + Send>;

/// Queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    /// Jobs submitted but not yet reported back. The counters are read
    /// independently, so a snapshot may see a completion before its enqueue.
    pub fn pending(&self) -> u64 {
        self.enqueued
            .saturating_sub(self.completed)
            .saturating_sub(self.failed)
    }
}

#[derive(Default)]
struct AtomicQueueStats {
    enqueued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Single-flight, FIFO write queue.
pub struct WriteQueue {
    sender: OnceLock<mpsc::UnboundedSender<Job>>,
    flush: Option<FlushHook>,
    settle: Duration,
    stats: Arc<AtomicQueueStats>,
}

impl WriteQueue {
    /// A queue that waits on `flush` and then `settle` after every successful slot.
    pub fn new(settle: Duration, flush: FlushHook) -> Self {
        Self {
            sender: OnceLock::new(),
            flush: Some(flush),
            settle,
            stats: Arc::new(AtomicQueueStats::default()),
        }
    }

    /// A queue with no flush hook; only the settle delay paces slots.
    pub fn unflushed(settle: Duration) -> Self {
        Self {
            sender: OnceLock::new(),
            flush: None,
            settle,
            stats: Arc::new(AtomicQueueStats::default()),
        }
    }

    /// Append `op` to the queue.
    ///
    /// The job is submitted immediately; the returned future only waits for
    /// the slot's outcome. Dropping the future does not cancel the job.
    pub fn enqueue<T, F, Fut>(&self, op: F) -> impl Future<Output = StoreResult<T>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = StoreResult<T>> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            async move {
                let result = AssertUnwindSafe(async move { op().await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        Err(StoreError::Database("write operation panicked".into()))
                    });
                Slot {
                    succeeded: result.is_ok(),
                    deliver: Box::new(move || {
                        // The caller may have stopped waiting.
                        let _ = reply_tx.send(result);
                    }),
                }
            }
            .boxed()
        });

        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        let submitted = self.worker().send(job).is_ok();

        async move {
            if !submitted {
                return Err(StoreError::Closed);
            }
            reply_rx.await.unwrap_or(Err(StoreError::Closed))
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }

    /// Jobs submitted but not yet reported back.
    pub fn pending(&self) -> u64 {
        self.stats().pending()
    }

    pub fn settle_delay(&self) -> Duration {
        self.settle
    }

    fn worker(&self) -> &mpsc::UnboundedSender<Job> {
        self.sender.get_or_init(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_worker(
                rx,
                self.flush.clone(),
                self.settle,
                self.stats.clone(),
            ));
            log::debug!("Write queue worker started");
            tx
        })
    }
}

async fn run_worker(
    mut jobs: mpsc::UnboundedReceiver<Job>,
    flush: Option<FlushHook>,
    settle: Duration,
    stats: Arc<AtomicQueueStats>,
) {
    while let Some(job) = jobs.recv().await {
        let slot = job().await;

        if slot.succeeded {
            if let Some(flush) = &flush {
                if let Err(e) = flush().await {
                    log::warn!("Pending-write flush failed: {e}");
                }
            }
            if !settle.is_zero() {
                tokio::time::sleep(settle).await;
            }
            stats.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            stats.failed.fetch_add(1, Ordering::Relaxed);
        }

        (slot.deliver)();
    }
    log::debug!("Write queue worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Start(usize),
        End(usize),
    }

    fn recorder() -> Arc<Mutex<Vec<Event>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_and_no_overlap() {
        let queue = WriteQueue::unflushed(Duration::from_millis(300));
        let events = recorder();

        let mut pending = Vec::new();
        for i in 0..5usize {
            let events = events.clone();
            pending.push(queue.enqueue(move || async move {
                events.lock().unwrap().push(Event::Start(i));
                // Later jobs finish faster; order must still hold.
                tokio::time::sleep(Duration::from_millis(50 - 10 * i as u64)).await;
                events.lock().unwrap().push(Event::End(i));
                Ok(i)
            }));
        }

        let results = futures_util::future::join_all(pending).await;
        let values: Vec<usize> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);

        let expected: Vec<Event> = (0..5).flat_map(|i| [Event::Start(i), Event::End(i)]).collect();
        assert_eq!(*events.lock().unwrap(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_does_not_block_queue() {
        let queue = WriteQueue::unflushed(Duration::from_millis(10));

        let first = queue.enqueue(|| async { Ok::<_, StoreError>(1) });
        let second = queue.enqueue(|| async {
            Err::<u32, _>(StoreError::Permission("denied".into()))
        });
        let third = queue.enqueue(|| async { Ok::<_, StoreError>(3) });

        assert_eq!(first.await.unwrap(), 1);
        assert!(matches!(second.await.unwrap_err(), StoreError::Permission(_)));
        assert_eq!(third.await.unwrap(), 3);

        let stats = queue.stats();
        assert_eq!(stats.enqueued, 3);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_pending_never_underflows() {
        let skewed = QueueStats {
            enqueued: 3,
            completed: 3,
            failed: 1,
        };
        assert_eq!(skewed.pending(), 0);
        let busy = QueueStats {
            enqueued: 5,
            completed: 2,
            failed: 1,
        };
        assert_eq!(busy.pending(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_op_reported() {
        let queue = WriteQueue::unflushed(Duration::ZERO);
        let bad = queue.enqueue(|| async {
            if true {
                panic!("boom");
            }
            Ok::<u32, StoreError>(0)
        });
        let good = queue.enqueue(|| async { Ok::<_, StoreError>(7) });

        assert!(matches!(bad.await.unwrap_err(), StoreError::Database(_)));
        assert_eq!(good.await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_delay_paces_slots() {
        let queue = WriteQueue::unflushed(Duration::from_millis(300));
        let start = Instant::now();

        let a = queue.enqueue(|| async { Ok::<_, StoreError>(()) });
        let b = queue.enqueue(|| async { Ok::<_, StoreError>(()) });
        a.await.unwrap();
        let after_first = start.elapsed();
        b.await.unwrap();
        let after_second = start.elapsed();

        assert!(after_first >= Duration::from_millis(300));
        assert!(after_second >= Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_hook_runs_after_success_only() {
        let flushes = Arc::new(AtomicU64::new(0));
        let counter = flushes.clone();
        let hook: FlushHook = Arc::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        });
        let queue = WriteQueue::new(Duration::ZERO, hook);

        queue.enqueue(|| async { Ok::<_, StoreError>(()) }).await.unwrap();
        let _ = queue
            .enqueue(|| async { Err::<(), _>(StoreError::unavailable("down")) })
            .await;
        queue.enqueue(|| async { Ok::<_, StoreError>(()) }).await.unwrap();

        assert_eq!(flushes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_future_still_runs() {
        let queue = WriteQueue::unflushed(Duration::ZERO);
        let ran = Arc::new(AtomicU64::new(0));
        let flag = ran.clone();

        drop(queue.enqueue(move || async move {
            flag.fetch_add(1, Ordering::SeqCst);
            Ok::<_, StoreError>(())
        }));
        queue.enqueue(|| async { Ok::<_, StoreError>(()) }).await.unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
