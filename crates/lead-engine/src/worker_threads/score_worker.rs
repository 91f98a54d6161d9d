//! Score worker task implementation
//!
//! Lead score recomputation runs on a dedicated Tokio task fed through an
//! unbounded channel. Callers get a [`ScoreTicket`] they may await or drop.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::conversation_cache::ConversationCache;
use crate::error::{Result, SessionError, StoreError};
use crate::lead_scorer::{LeadScorer, QualificationTier, TierThresholds};
use crate::metrics;
use crate::retry_queue::RetryPolicy;
use crate::session_db::{SessionStatus, SessionStore, SessionUpdate, UpdateOp};

/// Result of one recomputation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreUpdate {
    pub session_id: String,
    /// Stored score before this pass.
    pub previous: u8,
    /// Score the scorer produced from the current signals.
    pub computed: u8,
    /// Stored score after this pass; never below `previous`.
    pub current: u8,
    pub tier: QualificationTier,
    pub status: SessionStatus,
}

impl ScoreUpdate {
    pub fn raised(&self) -> bool {
        self.current > self.previous
    }
}

enum ScoreCommand {
    Recompute {
        session_id: String,
        reply: oneshot::Sender<Result<ScoreUpdate>>,
    },
    Shutdown,
}

/// Completion signal for a scheduled recomputation.
#[derive(Debug)]
pub struct ScoreTicket {
    receiver: oneshot::Receiver<Result<ScoreUpdate>>,
}

impl ScoreTicket {
    pub async fn wait(self) -> Result<ScoreUpdate> {
        self.receiver.await.map_err(|_| SessionError::WorkerStopped)?
    }
}

pub struct ScoreWorker {
    store: Arc<dyn SessionStore>,
    cache: Arc<ConversationCache>,
    scorer: LeadScorer,
    tiers: TierThresholds,
    retry: RetryPolicy,
}

impl ScoreWorker {
    pub fn new(
        store: Arc<dyn SessionStore>,
        cache: Arc<ConversationCache>,
        scorer: LeadScorer,
        tiers: TierThresholds,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            cache,
            scorer,
            tiers,
            retry,
        }
    }

    /// Start the worker loop on the current Tokio runtime.
    pub fn spawn(self) -> ScoreHandle {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(self.run(receiver));
        ScoreHandle { sender }
    }

    async fn run(self, mut receiver: mpsc::UnboundedReceiver<ScoreCommand>) {
        info!("Score worker started");
        while let Some(command) = receiver.recv().await {
            match command {
                ScoreCommand::Recompute { session_id, reply } => {
                    let result = self.recompute(&session_id).await;
                    if let Err(e) = &result {
                        warn!("Score recomputation failed for session {}: {}", session_id, e);
                    }
                    // The caller may have dropped its ticket.
                    let _ = reply.send(result);
                }
                ScoreCommand::Shutdown => break,
            }
        }
        info!("Score worker stopped");
    }

    /// Recompute the score from the stored signals and persist it when it
    /// is higher than the stored value. The store applies the raise as an
    /// atomic max, so a concurrent recomputation can never lower it.
    pub async fn recompute(&self, session_id: &str) -> Result<ScoreUpdate> {
        let session = self
            .retry
            .run("score read", || self.store.get(session_id))
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        let previous = session.metadata.lead_score;
        let computed = self.scorer.score_session(&session);
        let best = previous.max(computed);

        let mut update = SessionUpdate::new();
        if computed > previous {
            update.add(UpdateOp::RaiseLeadScore(computed));
        }
        if session.metadata.status == SessionStatus::Active && self.tiers.qualifies(best) {
            update.add(UpdateOp::QualifyIfActive);
        }

        let (current, status) = if update.is_empty() {
            (previous, session.metadata.status)
        } else {
            let snapshot = self
                .retry
                .run("score write", || self.store.update(session_id, &update))
                .await
                .map_err(|e| {
                    if !matches!(e, StoreError::NotFound(_)) {
                        metrics::inc_store_failure(e.kind());
                    }
                    e
                })?;
            if snapshot.metadata.lead_score > previous {
                metrics::inc_score_raises();
            }
            let settled = (snapshot.metadata.lead_score, snapshot.metadata.status);
            self.cache.put(snapshot);
            settled
        };

        debug!(
            "Session {} score: stored {} computed {} now {}",
            session_id, previous, computed, current
        );

        Ok(ScoreUpdate {
            session_id: session_id.to_string(),
            previous,
            computed,
            current,
            tier: self.tiers.tier_for(current),
            status,
        })
    }
}

/// Sending side of the worker channel, owned by the session service.
#[derive(Clone)]
pub struct ScoreHandle {
    sender: mpsc::UnboundedSender<ScoreCommand>,
}

impl ScoreHandle {
    pub fn schedule(&self, session_id: &str) -> Result<ScoreTicket> {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(ScoreCommand::Recompute {
                session_id: session_id.to_string(),
                reply,
            })
            .map_err(|_| SessionError::WorkerStopped)?;
        Ok(ScoreTicket { receiver })
    }

    /// Jobs queued before this call still run.
    pub fn shutdown(&self) {
        let _ = self.sender.send(ScoreCommand::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemorySessionStore;
    use crate::session_db::{Message, Role, Session};
    use chrono::Utc;

    fn worker(store: &InMemorySessionStore, cache: &Arc<ConversationCache>) -> ScoreWorker {
        ScoreWorker::new(
            Arc::new(store.clone()),
            cache.clone(),
            LeadScorer::default(),
            TierThresholds::default(),
            RetryPolicy::default(),
        )
    }

    fn with_messages(id: &str, texts: &[&str]) -> Session {
        let mut session = Session::new(id, Utc::now());
        let mut update = SessionUpdate::new();
        for (i, text) in texts.iter().enumerate() {
            update.add(UpdateOp::AppendMessage(Message {
                id: format!("m{}", i),
                role: Role::User,
                content: text.to_string(),
                timestamp: Utc::now(),
            }));
        }
        update.apply_to(&mut session);
        session
    }

    #[tokio::test]
    async fn test_recompute_raises_and_updates_cache() {
        let store = InMemorySessionStore::new();
        let cache = Arc::new(ConversationCache::new(16));
        let session = with_messages("s1", &["a", "b", "c", "d"]);
        store.seed(session.clone());
        cache.put(session);

        let update = worker(&store, &cache).recompute("s1").await.unwrap();
        assert_eq!(update.previous, 1);
        assert_eq!(update.computed, 3);
        assert_eq!(update.current, 3);
        assert!(update.raised());
        assert_eq!(cache.get("s1").unwrap().metadata.lead_score, 3);
    }

    #[tokio::test]
    async fn test_recompute_never_lowers() {
        let store = InMemorySessionStore::new();
        let cache = Arc::new(ConversationCache::new(16));
        let mut session = Session::new("s1", Utc::now());
        session.metadata.lead_score = 5;
        store.seed(session);

        let update = worker(&store, &cache).recompute("s1").await.unwrap();
        assert_eq!(update.computed, 1);
        assert_eq!(update.current, 5);
        assert!(!update.raised());
    }

    #[tokio::test]
    async fn test_interested_tier_qualifies_active_session() {
        let store = InMemorySessionStore::new();
        let cache = Arc::new(ConversationCache::new(16));
        let mut session = Session::new("s1", Utc::now());
        session.metadata.consultation_requested = true;
        session.metadata.email = Some("a@b.com".into());
        store.seed(session);

        let update = worker(&store, &cache).recompute("s1").await.unwrap();
        assert_eq!(update.current, 9);
        assert_eq!(update.tier, QualificationTier::Interested);
        assert_eq!(update.status, SessionStatus::Qualified);
    }

    #[tokio::test]
    async fn test_ticket_resolves_through_spawned_worker() {
        let store = InMemorySessionStore::new();
        let cache = Arc::new(ConversationCache::new(16));
        store.seed(with_messages("s1", &["x", "y"]));

        let handle = worker(&store, &cache).spawn();
        let ticket = handle.schedule("s1").unwrap();
        let update = ticket.wait().await.unwrap();
        assert_eq!(update.current, 2);

        let missing = handle.schedule("ghost").unwrap().wait().await;
        assert_eq!(missing, Err(SessionError::NotFound("ghost".into())));
    }

    #[tokio::test]
    async fn test_schedule_after_shutdown_reports_stopped() {
        let store = InMemorySessionStore::new();
        let cache = Arc::new(ConversationCache::new(16));
        let handle = worker(&store, &cache).spawn();
        handle.shutdown();

        // The worker drains its channel up to the shutdown marker; later
        // jobs either fail to send or never get a reply.
        let outcome = match handle.schedule("s1") {
            Ok(ticket) => ticket.wait().await,
            Err(e) => Err(e),
        };
        assert_eq!(outcome, Err(SessionError::WorkerStopped));
    }
}
