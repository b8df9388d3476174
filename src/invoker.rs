//! Call invoker: relays work from native threads onto the host thread.
//!
//! The host runtime is single-threaded and may only be touched from its own
//! event loop. Native worker threads therefore never call into host state
//! directly; they hand a [`Task`] to a [`CallInvoker`], which queues it and
//! wakes the host loop. Tasks scheduled from one thread run in the order they
//! were scheduled. There is no ordering guarantee across threads.
//!
//! Once the host is torn down, scheduling is a no-op and the task is dropped.

use crate::metrics::BridgeMetrics;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Unit of work to run on the host thread
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Thread-safe relay onto the host's logical thread
pub trait CallInvoker: Send + Sync {
    /// Queue `task` to run on the host thread.
    ///
    /// Returns `false` when the task was dropped because the host is gone.
    fn schedule(&self, task: Task) -> bool;

    /// Whether scheduled tasks can still run
    fn is_alive(&self) -> bool;
}

struct QueueShared {
    sender: RwLock<Option<Sender<Task>>>,
    scheduled: AtomicU64,
    dropped: AtomicU64,
}

/// Call invoker backed by a channel drained by a [`HostLoop`]
#[derive(Clone)]
pub struct QueuedCallInvoker {
    shared: Arc<QueueShared>,
}

impl QueuedCallInvoker {
    /// Create an invoker and the host loop that drains it
    pub fn new() -> (Self, HostLoop) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let invoker = Self {
            shared: Arc::new(QueueShared {
                sender: RwLock::new(Some(sender)),
                scheduled: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        };
        (invoker, HostLoop { receiver })
    }

    /// Tear down the host side; later schedules are dropped
    pub fn shutdown(&self) {
        if self.shared.sender.write().take().is_some() {
            debug!("Call invoker shut down");
        }
    }

    /// Tasks accepted so far
    pub fn scheduled_count(&self) -> u64 {
        self.shared.scheduled.load(Ordering::Relaxed)
    }

    /// Tasks dropped after shutdown
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl CallInvoker for QueuedCallInvoker {
    fn schedule(&self, task: Task) -> bool {
        let sender = self.shared.sender.read();
        let accepted = match sender.as_ref() {
            Some(sender) => sender.send(task).is_ok(),
            None => false,
        };

        if accepted {
            self.shared.scheduled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            trace!("Dropped task scheduled after host teardown");
        }
        accepted
    }

    fn is_alive(&self) -> bool {
        self.shared.sender.read().is_some()
    }
}

/// Host-side event loop draining a [`QueuedCallInvoker`]
pub struct HostLoop {
    receiver: Receiver<Task>,
}

impl HostLoop {
    /// Run every task already queued; returns how many ran
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            match self.receiver.try_recv() {
                Ok(task) => {
                    task();
                    ran += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return ran,
            }
        }
    }

    /// Wait up to `timeout` for one task and run it
    pub fn turn(&self, timeout: Duration) -> bool {
        match self.receiver.recv_timeout(timeout) {
            Ok(task) => {
                task();
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Run tasks until `done` holds or `timeout` elapses
    pub fn run_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while !done() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.turn(deadline - now);
        }
        true
    }

    /// Number of queued tasks
    pub fn queued(&self) -> usize {
        self.receiver.len()
    }
}

/// Per-module gate in front of the host invoker.
///
/// Unregistering a module closes its gate, turning that module's scheduling
/// into a no-op while other modules keep using the host invoker.
pub struct InvokerGate {
    inner: Arc<dyn CallInvoker>,
    open: AtomicBool,
    metrics: Arc<BridgeMetrics>,
}

impl InvokerGate {
    /// Wrap the host invoker
    pub fn new(inner: Arc<dyn CallInvoker>, metrics: Arc<BridgeMetrics>) -> Self {
        Self {
            inner,
            open: AtomicBool::new(true),
            metrics,
        }
    }

    /// Close the gate; returns whether it was open
    pub fn close(&self) -> bool {
        self.open.swap(false, Ordering::AcqRel)
    }
}

impl CallInvoker for InvokerGate {
    fn schedule(&self, task: Task) -> bool {
        let accepted = self.open.load(Ordering::Acquire) && self.inner.schedule(task);
        if !accepted {
            self.metrics.record_continuation_dropped();
        }
        accepted
    }

    fn is_alive(&self) -> bool {
        self.open.load(Ordering::Acquire) && self.inner.is_alive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_tasks_run_on_host_loop() {
        let (invoker, host) = QueuedCallInvoker::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let seen = Arc::clone(&seen);
            assert!(invoker.schedule(Box::new(move || seen.lock().push(i))));
        }
        assert!(seen.lock().is_empty());

        assert_eq!(host.run_pending(), 3);
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
        assert_eq!(invoker.scheduled_count(), 3);
    }

    #[test]
    fn test_per_thread_order_preserved() {
        let (invoker, host) = QueuedCallInvoker::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let producers: Vec<_> = (0..4)
            .map(|thread| {
                let invoker = invoker.clone();
                let seen = Arc::clone(&seen);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let seen = Arc::clone(&seen);
                        invoker.schedule(Box::new(move || seen.lock().push((thread, i))));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        assert_eq!(host.run_pending(), 400);
        let seen = seen.lock();
        for thread in 0..4 {
            let order: Vec<_> = seen
                .iter()
                .filter(|(t, _)| *t == thread)
                .map(|(_, i)| *i)
                .collect();
            assert_eq!(order, (0..100).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_schedule_after_shutdown_is_noop() {
        let (invoker, host) = QueuedCallInvoker::new();
        invoker.shutdown();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        assert!(!invoker.schedule(Box::new(move || flag.store(true, Ordering::SeqCst))));
        assert!(!invoker.is_alive());
        assert_eq!(invoker.dropped_count(), 1);
        assert_eq!(host.run_pending(), 0);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_turn_wakes_on_cross_thread_schedule() {
        let (invoker, host) = QueuedCallInvoker::new();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&ran);
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            invoker.schedule(Box::new(move || flag.store(true, Ordering::SeqCst)));
        });

        assert!(host.run_until(Duration::from_secs(5), || ran.load(Ordering::SeqCst)));
        worker.join().unwrap();
    }

    #[test]
    fn test_gate_close() {
        let (invoker, host) = QueuedCallInvoker::new();
        let metrics = Arc::new(BridgeMetrics::new());
        let gate = InvokerGate::new(Arc::new(invoker.clone()), Arc::clone(&metrics));

        assert!(gate.schedule(Box::new(|| {})));
        assert!(gate.close());
        assert!(!gate.close());
        assert!(!gate.schedule(Box::new(|| {})));
        assert!(!gate.is_alive());
        assert!(invoker.is_alive());

        assert_eq!(host.run_pending(), 1);
        assert_eq!(metrics.continuations_dropped(), 1);
    }
}
