//! Read-through / write-through snapshot cache keyed by session id.

use crate::session_db::{Message, Session};
use moka::ops::compute::{CompResult, Op};
use moka::sync::Cache;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Process-local cache of the last known session snapshots.
///
/// Size-bounded: once `max_sessions` is reached moka evicts the least
/// valuable entries, so a long-running process does not grow without limit.
pub struct ConversationCache {
    sessions: Cache<String, Session>,
    counters: CacheCounters,
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicUsize,
    misses: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub entries: u64,
}

impl ConversationCache {
    pub fn new(max_sessions: u64) -> Self {
        Self {
            sessions: Cache::builder().max_capacity(max_sessions).build(),
            counters: CacheCounters::default(),
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        let found = self.sessions.get(session_id);
        if found.is_some() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Messages from the cached snapshot, only when it has any.
    pub fn history(&self, session_id: &str) -> Option<Vec<Message>> {
        self.get(session_id)
            .map(|session| session.messages)
            .filter(|messages| !messages.is_empty())
    }

    /// Store a snapshot returned by the store unless a newer revision of the
    /// same session is already cached. Returns whether the entry was written.
    ///
    /// Writers finishing out of order cannot roll the entry back: the
    /// comparison and the insert run under moka's per-key lock.
    pub fn put(&self, session: Session) -> bool {
        let session_id = session.session_id.clone();
        let revision = session.revision;
        let stored = self
            .sessions
            .entry(session_id.clone())
            .and_compute_with(|current| match current {
                Some(entry) if entry.value().revision >= revision => Op::Nop,
                _ => Op::Put(session),
            });
        let written = !matches!(stored, CompResult::Unchanged(_));
        if !written {
            debug!(
                "Kept cached revision for session {}; snapshot {} is not newer",
                session_id, revision
            );
        }
        written
    }

    pub fn invalidate(&self, session_id: &str) {
        self.sessions.invalidate(session_id);
    }

    pub fn stats(&self) -> CacheStats {
        self.sessions.run_pending_tasks();
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            entries: self.sessions.entry_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_db::{Role, SessionUpdate, UpdateOp};
    use chrono::Utc;
    use std::sync::Arc;

    fn message(id: &str) -> Message {
        Message {
            id: id.to_string(),
            role: Role::User,
            content: "hello".to_string(),
            timestamp: Utc::now(),
        }
    }

    fn appended(session: &Session, id: &str) -> Session {
        let mut next = session.clone();
        SessionUpdate::new()
            .push(UpdateOp::AppendMessage(message(id)))
            .apply_to(&mut next);
        next
    }

    #[test]
    fn test_history_requires_non_empty_snapshot() {
        let cache = ConversationCache::new(16);
        let session = Session::new("s1", Utc::now());
        cache.put(session.clone());
        assert!(cache.history("s1").is_none());

        cache.put(appended(&session, "m1"));
        assert_eq!(cache.history("s1").unwrap().len(), 1);
    }

    #[test]
    fn test_older_snapshot_does_not_replace_newer() {
        let cache = ConversationCache::new(16);
        let first = appended(&Session::new("s1", Utc::now()), "m1");
        let second = appended(&first, "m2");

        assert!(cache.put(second.clone()));
        assert!(!cache.put(first));
        assert_eq!(cache.get("s1"), Some(second));
    }

    #[test]
    fn test_racing_writers_leave_highest_revision() {
        let cache = Arc::new(ConversationCache::new(16));
        let mut snapshots = vec![Session::new("s1", Utc::now())];
        for i in 0..32 {
            let next = appended(&snapshots[i], &format!("m{}", i));
            snapshots.push(next);
        }
        let newest = snapshots[32].clone();

        let handles: Vec<_> = snapshots
            .into_iter()
            .rev()
            .map(|snapshot| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.put(snapshot))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.get("s1"), Some(newest));
    }

    #[test]
    fn test_counts_hits_and_misses() {
        let cache = ConversationCache::new(16);
        cache.put(Session::new("s1", Utc::now()));
        cache.get("s1");
        cache.get("s2");
        cache.get("s1");

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_capacity_is_bounded() {
        let cache = ConversationCache::new(8);
        for i in 0..200 {
            cache.put(Session::new(&format!("s{}", i), Utc::now()));
        }
        assert!(cache.stats().entries <= 8);
    }

    #[test]
    fn test_invalidate_removes_entry() {
        let cache = ConversationCache::new(8);
        cache.put(Session::new("s1", Utc::now()));
        cache.invalidate("s1");
        assert!(cache.get("s1").is_none());
    }
}
