//! Process-local session store.
//!
//! Backs tests and single-process deployments. Failure injection lets callers
//! simulate an unreachable store or a store that rejects writes outright.

use crate::error::{StoreError, StoreResult};
use crate::session_db::{QueryOrder, Session, SessionQuery, SessionStore, SessionUpdate};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    store: Arc<DashMap<String, Session>>,
    faults: Arc<FaultInjector>,
}

#[derive(Default)]
struct FaultInjector {
    unreachable: AtomicBool,
    fail_next: AtomicUsize,
    permanent: Mutex<Option<String>>,
    calls: AtomicUsize,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While unreachable every call fails with a transient error.
    pub fn set_reachable(&self, reachable: bool) {
        self.faults.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Fail the next `n` calls with a transient error, then recover.
    pub fn fail_next(&self, n: usize) {
        self.faults.fail_next.store(n, Ordering::SeqCst);
    }

    /// Reject every call with a permanent error until cleared with `None`.
    pub fn set_permanent_failure(&self, reason: Option<&str>) {
        if let Ok(mut guard) = self.faults.permanent.lock() {
            *guard = reason.map(str::to_string);
        }
    }

    /// Number of store calls attempted, including failed ones.
    pub fn calls(&self) -> usize {
        self.faults.calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Insert a document as-is, bypassing fault injection.
    pub fn seed(&self, session: Session) {
        self.store.insert(session.session_id.clone(), session);
    }

    fn check(&self) -> StoreResult<()> {
        self.faults.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(guard) = self.faults.permanent.lock() {
            if let Some(reason) = guard.as_ref() {
                return Err(StoreError::Permanent(reason.clone()));
            }
        }
        if self.faults.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Transient("store unreachable".to_string()));
        }
        let consumed = self
            .faults
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(StoreError::Transient("injected timeout".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: &str) -> StoreResult<Option<Session>> {
        self.check()?;
        Ok(self.store.get(session_id).map(|entry| entry.value().clone()))
    }

    async fn create(&self, session: &Session) -> StoreResult<bool> {
        self.check()?;
        match self.store.entry(session.session_id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
                Ok(true)
            }
        }
    }

    async fn update(&self, session_id: &str, update: &SessionUpdate) -> StoreResult<Session> {
        self.check()?;
        let mut entry = self
            .store
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        update.apply_to(entry.value_mut());
        Ok(entry.value().clone())
    }

    async fn query(&self, query: &SessionQuery) -> StoreResult<Vec<Session>> {
        self.check()?;
        let mut sessions: Vec<Session> = self
            .store
            .iter()
            .filter(|entry| query.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by(|a, b| match query.order {
            QueryOrder::CreatedAsc => a.created_at.cmp(&b.created_at),
            QueryOrder::CreatedDesc => b.created_at.cmp(&a.created_at),
        });
        if let Some(limit) = query.limit {
            sessions.truncate(limit);
        }
        Ok(sessions)
    }
}
