//! The notification context: a single dispatcher thread with optional
//! latency-compensated delivery.
//!
//! Every listener notification of the playback core runs on one
//! [`EventDispatcher`] thread. Tasks dispatched with zero latency run in
//! submission order; tasks dispatched while an output latency is configured
//! run no earlier than that many milliseconds later, so what the user hears
//! and what the UI shows line up.
//!
//! Delayed tasks are tracked in a shared pending set. [`cancel_pending`]
//! clears that set synchronously and is safe to call from any thread,
//! including the dispatcher thread itself.
//!
//! [`cancel_pending`]: EventDispatcher::cancel_pending

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A unit of work delivered on the dispatcher thread.
pub type Task = Box<dyn FnOnce() + Send>;

/// Shared, runtime-tunable output latency in milliseconds.
///
/// Read at dispatch time, never cached, so changing it takes effect for the
/// very next notification.
#[derive(Debug, Default)]
pub struct OutputLatency(AtomicU32);

impl OutputLatency {
    pub fn new(millis: u32) -> Self {
        Self(AtomicU32::new(millis))
    }

    pub fn millis(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set_millis(&self, millis: u32) {
        self.0.store(millis, Ordering::Relaxed);
    }
}

enum Message {
    Run(Task),
    Wake,
    Shutdown,
}

type PendingSet = Arc<Mutex<BTreeMap<(Instant, u64), Task>>>;

/// Single-threaded notification context with cancellable delayed delivery.
pub struct EventDispatcher {
    sender: Sender<Message>,
    pending: PendingSet,
    next_id: AtomicU64,
    worker: Option<JoinHandle<()>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let pending: PendingSet = Arc::new(Mutex::new(BTreeMap::new()));
        let worker_pending = Arc::clone(&pending);
        let worker = thread::spawn(move || run_loop(receiver, worker_pending));
        Self {
            sender,
            pending,
            next_id: AtomicU64::new(0),
            worker: Some(worker),
        }
    }

    /// Run `task` on the dispatcher thread, delayed by `latency`.
    ///
    /// With a zero latency the task joins the immediate queue and runs in
    /// submission order. With a positive latency it enters the pending set
    /// and runs no earlier than `latency` from now, unless cancelled first.
    pub fn dispatch(&self, latency: &OutputLatency, task: Task) {
        let millis = latency.millis();
        if millis == 0 {
            self.submit(task);
            return;
        }
        let deadline = Instant::now() + Duration::from_millis(millis as u64);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending
            .lock()
            .expect("dispatcher pending set poisoned")
            .insert((deadline, id), task);
        // Wake the worker so it recomputes its sleep
        if self.sender.send(Message::Wake).is_err() {
            log::warn!("dispatch() dispatcher thread is gone, delayed task will not run");
        }
    }

    /// Run `task` on the dispatcher thread immediately, in submission order.
    pub fn submit(&self, task: Task) {
        if self.sender.send(Message::Run(task)).is_err() {
            log::warn!("submit() dispatcher thread is gone, task dropped");
        }
    }

    /// Synchronously drop every pending delayed task.
    ///
    /// After this returns, no previously dispatched delayed task will run.
    /// Immediate tasks are not affected. Callable from the dispatcher thread.
    pub fn cancel_pending(&self) {
        let cancelled = {
            let mut pending = self
                .pending
                .lock()
                .expect("dispatcher pending set poisoned");
            let count = pending.len();
            pending.clear();
            count
        };
        if cancelled > 0 {
            log::debug!("cancel_pending() dropped {cancelled} delayed task(s)");
        }
    }

    /// Number of delayed tasks not yet delivered.
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .expect("dispatcher pending set poisoned")
            .len()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        let _ = self.sender.send(Message::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("dispatcher thread panicked");
            }
        }
    }
}

fn run_loop(receiver: Receiver<Message>, pending: PendingSet) {
    loop {
        let next_deadline = pending
            .lock()
            .expect("dispatcher pending set poisoned")
            .keys()
            .next()
            .map(|(deadline, _)| *deadline);

        let message = match next_deadline {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                receiver.recv_timeout(timeout)
            }
            None => receiver
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };

        match message {
            Ok(Message::Run(task)) => task(),
            Ok(Message::Wake) => {}
            Ok(Message::Shutdown) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {}
        }

        // Deliver everything now due, one task at a time so a running task
        // may itself call cancel_pending without deadlocking.
        loop {
            let due = {
                let mut pending = pending.lock().expect("dispatcher pending set poisoned");
                match pending.keys().next().copied() {
                    Some(key) if key.0 <= Instant::now() => pending.remove(&key),
                    _ => None,
                }
            };
            match due {
                Some(task) => task(),
                None => break,
            }
        }
    }
}
