//! Batched, cooperative embedding pipeline between the write path and
//! vector-index population.
//!
//! `remember` returns as soon as the row is durable; the id and content are
//! queued here. A dedicated worker thread groups pending rows into batches
//! by size and age, calls the provider with retry and exponential backoff,
//! and writes each vector back through the store. Permanent failures mark
//! the row `embedding-failed`; it stays recallable by entity and full-text.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rusqlite::Connection;

use crate::config::EmbeddingConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{EngramError, Result};
use crate::memory::store;

/// One unit of embedding work.
struct Job {
    id: String,
    text: String,
}

/// Shared drain/cancel state between producers, `flush`, and the worker.
struct QueueState {
    pending: Mutex<usize>,
    drained: Condvar,
    cancel: AtomicBool,
}

/// Handle to the embedding worker. The only mutable process-wide state
/// other than the store itself.
pub struct EmbedQueue {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    state: Arc<QueueState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EmbedQueue {
    /// Spawn the worker thread against a shared connection and provider.
    pub fn start(
        conn: Arc<Mutex<Connection>>,
        provider: Arc<dyn EmbeddingProvider>,
        config: EmbeddingConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let state = Arc::new(QueueState {
            pending: Mutex::new(0),
            drained: Condvar::new(),
            cancel: AtomicBool::new(false),
        });

        let worker_state = Arc::clone(&state);
        let worker = std::thread::Builder::new()
            .name("engram-embed".into())
            .spawn(move || {
                worker_loop(rx, conn, provider, config, worker_state);
            })
            .expect("failed to spawn embedding worker");

        Self {
            tx: Mutex::new(Some(tx)),
            state,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue a row for embedding. No-op after close.
    pub fn enqueue(&self, id: String, text: String) {
        let tx = self.tx.lock().unwrap();
        if let Some(tx) = tx.as_ref() {
            *self.state.pending.lock().unwrap() += 1;
            if tx.send(Job { id, text }).is_err() {
                // Worker already gone; undo the count so flush can drain.
                let mut pending = self.state.pending.lock().unwrap();
                *pending = pending.saturating_sub(1);
                self.state.drained.notify_all();
            }
        }
    }

    /// Number of rows still waiting for a vector.
    pub fn pending(&self) -> usize {
        *self.state.pending.lock().unwrap()
    }

    /// Block until the queue drains, the soft timeout passes, or a
    /// cancellation is observed. In-flight batches complete either way.
    pub fn flush(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut pending = self.state.pending.lock().unwrap();
        loop {
            if *pending == 0 {
                return Ok(());
            }
            if self.state.cancel.load(Ordering::Relaxed) {
                return Err(EngramError::Cancelled("flush cancelled".into()));
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(EngramError::TimedOut("embedding queue drain".into()));
                }
            }
            let (guard, _) = self
                .state
                .drained
                .wait_timeout(pending, Duration::from_millis(50))
                .unwrap();
            pending = guard;
        }
    }

    /// Signal cancellation: the in-flight batch completes, queued work is
    /// dropped (rows stay `pending` and are re-queued on next open).
    pub fn cancel(&self) {
        self.state.cancel.store(true, Ordering::Relaxed);
        self.state.drained.notify_all();
    }

    /// Stop the worker and wait for it to exit. Idempotent.
    pub fn shutdown(&self) {
        // Dropping the sender disconnects the channel; the worker finishes
        // whatever is already queued and exits.
        self.tx.lock().unwrap().take();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EmbedQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    rx: mpsc::Receiver<Job>,
    conn: Arc<Mutex<Connection>>,
    provider: Arc<dyn EmbeddingProvider>,
    config: EmbeddingConfig,
    state: Arc<QueueState>,
) {
    let linger = Duration::from_millis(config.batch_linger_ms);

    loop {
        // Block for the first job of the next batch.
        let first = match rx.recv() {
            Ok(job) => job,
            Err(_) => break, // channel closed and drained
        };

        let mut batch = vec![first];
        let deadline = Instant::now() + linger;
        let mut disconnected = false;

        // Fill the batch by size or age, whichever comes first.
        while batch.len() < config.batch_size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok(job) => batch.push(job),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    disconnected = true;
                    break;
                }
            }
        }

        let batch_len = batch.len();
        if state.cancel.load(Ordering::Relaxed) {
            tracing::debug!(dropped = batch_len, "embedding queue cancelled, dropping work");
        } else {
            process_batch(&conn, provider.as_ref(), &config, batch);
        }

        let mut pending = state.pending.lock().unwrap();
        *pending = pending.saturating_sub(batch_len);
        state.drained.notify_all();
        drop(pending);

        if disconnected {
            break;
        }
    }
}

/// Embed one batch with retry, then write vectors back row by row so a
/// crash mid-batch leaves each row either fully indexed or untouched.
fn process_batch(
    conn: &Arc<Mutex<Connection>>,
    provider: &dyn EmbeddingProvider,
    config: &EmbeddingConfig,
    batch: Vec<Job>,
) {
    let texts: Vec<&str> = batch.iter().map(|j| j.text.as_str()).collect();

    let mut attempt = 0u32;
    let vectors = loop {
        match provider.embed_batch(&texts) {
            Ok(vectors) => break Some(vectors),
            Err(e) => {
                attempt += 1;
                if attempt >= config.retry_attempts {
                    tracing::warn!(
                        error = %e,
                        rows = batch.len(),
                        "embedding batch failed after retry budget"
                    );
                    break None;
                }
                let backoff = config.retry_backoff_ms * (1 << (attempt - 1).min(8));
                tracing::debug!(error = %e, attempt, backoff_ms = backoff, "embedding retry");
                std::thread::sleep(Duration::from_millis(backoff));
            }
        }
    };

    let mut conn = conn.lock().unwrap();
    match vectors {
        Some(vectors) => {
            for (job, mut vec) in batch.into_iter().zip(vectors) {
                crate::embedding::normalize(&mut vec);
                if let Err(e) = store::update_embedding(&mut conn, &job.id, &vec) {
                    tracing::warn!(id = %job.id, error = %e, "failed to store embedding");
                }
            }
        }
        None => {
            for job in &batch {
                if let Err(e) = store::mark_embedding_failed(&conn, &job.id) {
                    tracing::warn!(id = %job.id, error = %e, "failed to mark embedding-failed");
                }
            }
        }
    }
}
