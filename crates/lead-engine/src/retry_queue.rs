//! Retry policy, connectivity flag and the offline write queue.
//!
//! Store writes are retried with exponential backoff. Writes that still fail
//! transiently while the process is offline are parked here and replayed in
//! FIFO order once connectivity returns. A failed replay leaves the queue
//! untouched for the next attempt.

use crate::error::{StoreError, StoreResult};
use crate::session_db::{Session, SessionUpdate};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Wait after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1_u32 << shift)
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt budget
    /// is spent. Only transient errors are retried.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    debug!(
                        "{} failed on attempt {}/{}: {}; retrying in {:?}",
                        what, attempt, self.max_attempts, err, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_transient() {
                        warn!("{} gave up after {} attempts: {}", what, attempt, err);
                    }
                    return Err(err);
                }
            }
        }
    }
}

/// Process-wide online/offline flag fed by the host environment.
#[derive(Debug)]
pub struct Connectivity {
    online: AtomicBool,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Returns the previous state.
    pub fn set(&self, online: bool) -> bool {
        self.online.swap(online, Ordering::SeqCst)
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

/// A store write waiting to be replayed.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingWrite {
    Create(Session),
    Update {
        session_id: String,
        update: SessionUpdate,
    },
}

impl PendingWrite {
    pub fn session_id(&self) -> &str {
        match self {
            PendingWrite::Create(session) => &session.session_id,
            PendingWrite::Update { session_id, .. } => session_id,
        }
    }
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    pub applied: usize,
    pub remaining: usize,
    /// Set when a failed write ended the pass early. That write is still at
    /// the front of the queue.
    pub stopped_on: Option<StoreError>,
}

impl DrainReport {
    pub fn is_complete(&self) -> bool {
        self.stopped_on.is_none() && self.remaining == 0
    }
}

struct Entry {
    seq: u64,
    write: PendingWrite,
}

/// FIFO of writes parked while the store was unreachable.
pub struct RetryQueue {
    pending: Mutex<VecDeque<Entry>>,
    /// Shared by writes that bypass the queue, exclusive during a drain.
    gate: RwLock<()>,
    next_seq: AtomicU64,
    closed: AtomicBool,
}

impl Default for RetryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryQueue {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            gate: RwLock::new(()),
            next_seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Park a write. Returns its 1-based queue position, or the write back
    /// when the queue has been closed.
    pub fn push(&self, write: PendingWrite) -> Result<usize, PendingWrite> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(write);
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let mut pending = self.lock_pending();
        pending.push_back(Entry { seq, write });
        Ok(pending.len())
    }

    pub fn len(&self) -> usize {
        self.lock_pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True while any write for `session_id` is waiting.
    pub fn has_pending_for(&self, session_id: &str) -> bool {
        self.lock_pending()
            .iter()
            .any(|entry| entry.write.session_id() == session_id)
    }

    /// Hold this while checking [`has_pending_for`](Self::has_pending_for)
    /// and writing to the store directly. No drain runs while any permit is
    /// held, so a direct write cannot overtake a replay in flight.
    pub async fn direct_write_permit(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().await
    }

    /// Remove the oldest write without applying it.
    ///
    /// For a write the store will never accept (a session that does not
    /// exist, a rejected document) that would otherwise block the queue.
    pub fn discard_front(&self) -> Option<PendingWrite> {
        let discarded = self.lock_pending().pop_front().map(|entry| entry.write);
        if let Some(write) = &discarded {
            warn!("Discarded queued write for session {}", write.session_id());
        }
        discarded
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Remove and return everything still waiting, oldest first.
    pub fn take_pending(&self) -> Vec<PendingWrite> {
        self.lock_pending().drain(..).map(|entry| entry.write).collect()
    }

    /// Replay queued writes one at a time, oldest first.
    ///
    /// A write leaves the queue only once `apply` succeeds. Any failure stops
    /// the pass with the failed write and everything behind it still queued.
    /// Concurrent drains are serialized.
    pub async fn drain<F, Fut>(&self, mut apply: F) -> DrainReport
    where
        F: FnMut(PendingWrite) -> Fut,
        Fut: Future<Output = StoreResult<()>>,
    {
        let _gate = self.gate.write().await;
        let mut report = DrainReport::default();

        loop {
            let front = {
                let pending = self.lock_pending();
                pending.front().map(|entry| (entry.seq, entry.write.clone()))
            };
            let Some((seq, write)) = front else {
                break;
            };
            let session_id = write.session_id().to_string();

            match apply(write).await {
                Ok(()) => {
                    self.pop_if_front(seq);
                    report.applied += 1;
                    debug!("Replayed queued write for session {}", session_id);
                }
                Err(err) => {
                    if err.is_transient() {
                        warn!("Drain paused at session {}: {}", session_id, err);
                    } else {
                        warn!(
                            "Drain blocked at session {}: {}; the write stays queued",
                            session_id, err
                        );
                    }
                    report.stopped_on = Some(err);
                    break;
                }
            }
        }

        report.remaining = self.len();
        if report.applied > 0 {
            info!(
                "Retry queue drain: {} applied, {} remaining",
                report.applied, report.remaining
            );
        }
        report
    }

    fn pop_if_front(&self, seq: u64) {
        let mut pending = self.lock_pending();
        if pending.front().is_some_and(|entry| entry.seq == seq) {
            pending.pop_front();
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, VecDeque<Entry>> {
        // The queue holds plain data, so a poisoned lock is still consistent.
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
