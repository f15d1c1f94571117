//! Background session generation.
//!
//! Generation can take seconds for a long arrangement, so interactive callers
//! hand sessions to a [`GenerationQueue`] instead of generating inline. The
//! queue runs one worker thread and is last-writer-wins: submitting a session
//! supersedes every earlier submission, and a result whose session was
//! superseded while generating is discarded instead of delivered.

use crate::error::Result;
use crate::session::SharedSession;
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// The outcome of one background generation run.
pub struct GenerationResult {
    pub session: SharedSession,
    pub outcome: Result<()>,
}

/// Single-worker generation queue with stale-result discard.
pub struct GenerationQueue {
    request_tx: Option<Sender<SharedSession>>,
    result_rx: Receiver<GenerationResult>,
    latest: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

impl GenerationQueue {
    pub fn new() -> Self {
        let (request_tx, request_rx) = crossbeam_channel::unbounded::<SharedSession>();
        let (result_tx, result_rx) = crossbeam_channel::unbounded();
        let latest = Arc::new(AtomicU64::new(0));
        let worker_latest = Arc::clone(&latest);

        let worker = thread::spawn(move || {
            for session in request_rx {
                let id = session.lock().expect("session poisoned").id();
                if worker_latest.load(Ordering::SeqCst) != id {
                    log::debug!("skipping superseded session {id}");
                    continue;
                }
                let outcome = session.lock().expect("session poisoned").generate();
                if worker_latest.load(Ordering::SeqCst) != id {
                    log::debug!("discarding stale result for session {id}");
                    continue;
                }
                if result_tx.send(GenerationResult { session, outcome }).is_err() {
                    return;
                }
            }
        });

        Self {
            request_tx: Some(request_tx),
            result_rx,
            latest,
            worker: Some(worker),
        }
    }

    /// Queue `session` for generation, superseding earlier submissions.
    pub fn submit(&self, session: &SharedSession) {
        let id = session.lock().expect("session poisoned").id();
        self.latest.store(id, Ordering::SeqCst);
        if let Some(tx) = &self.request_tx {
            if tx.send(Arc::clone(session)).is_err() {
                log::warn!("generation worker is gone, submission dropped");
            }
        }
    }

    /// Channel delivering results for non-superseded sessions.
    pub fn results(&self) -> &Receiver<GenerationResult> {
        &self.result_rx
    }
}

impl Default for GenerationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for GenerationQueue {
    fn drop(&mut self) {
        self.request_tx = None; // disconnects the worker
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("generation worker panicked");
            }
        }
    }
}
