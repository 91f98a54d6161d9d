//! Session lifecycle orchestration.
//!
//! Every mutation is expressed as a [`SessionUpdate`] and committed through
//! one path: retry on transient store failures, park the write in the retry
//! queue when offline, keep the cache in step, and hand score recomputation
//! to the background worker.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analytics::{AnalyticsAggregator, DailyStats};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::conversation_cache::{CacheStats, ConversationCache};
use crate::error::{Result, SessionError, StoreError, StoreResult};
use crate::lead_scorer::{LeadScorer, QualificationTier, TierThresholds};
use crate::metrics;
use crate::retry_queue::{Connectivity, DrainReport, PendingWrite, RetryPolicy, RetryQueue};
use crate::session_db::{
    Message, MessageDraft, Role, Session, SessionStatus, SessionStore, SessionUpdate, UpdateOp,
};
use crate::utils::{validate_session_id, SignalExtractor};
use crate::worker_threads::{ScoreHandle, ScoreTicket, ScoreUpdate, ScoreWorker};

/// How a mutating call was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// The write waits in the retry queue at this 1-based position and is
    /// replayed on reconnect. Happens when the store was unreachable while
    /// offline, or when earlier writes for the same session are still queued.
    Queued { position: usize },
}

/// Returned by every mutating operation.
#[derive(Debug)]
pub struct Receipt {
    pub outcome: WriteOutcome,
    /// Present when the write was applied and can change the lead score.
    pub score: Option<ScoreTicket>,
}

impl Receipt {
    pub fn is_queued(&self) -> bool {
        matches!(self.outcome, WriteOutcome::Queued { .. })
    }

    /// Wait for the scheduled recomputation, if any.
    pub async fn settled(self) -> Result<Option<ScoreUpdate>> {
        match self.score {
            Some(ticket) => ticket.wait().await.map(Some),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub session: Session,
    /// False when the id already existed and the stored session is returned.
    pub created: bool,
    pub outcome: WriteOutcome,
}

/// Partial metadata merge. Fields left as `None`/empty are untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataPatch {
    pub email: Option<String>,
    pub phone: Option<String>,
    #[serde(default)]
    pub service_interest: Vec<String>,
    /// Only `true` has an effect.
    pub consultation_requested: Option<bool>,
    /// Raises the stored score, never lowers it.
    pub lead_score: Option<u8>,
    pub status: Option<SessionStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyticsPatch {
    pub device_type: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Qualification {
    pub lead_score: u8,
    pub tier: QualificationTier,
    pub status: SessionStatus,
}

pub struct SessionService {
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    cache: Arc<ConversationCache>,
    queue: RetryQueue,
    connectivity: Connectivity,
    retry: RetryPolicy,
    scores: ScoreHandle,
    scorer: LeadScorer,
    tiers: TierThresholds,
    extractor: Option<SignalExtractor>,
    analytics: AnalyticsAggregator,
}

impl SessionService {
    /// Must be called inside a Tokio runtime; the score worker is spawned here.
    pub fn new(store: Arc<dyn SessionStore>, clock: Arc<dyn Clock>, config: &EngineConfig) -> Self {
        let cache = Arc::new(ConversationCache::new(config.cache_max_sessions));
        let retry = config.retry_policy();
        let scorer = LeadScorer::new(config.scoring.clone());

        let scores = ScoreWorker::new(
            store.clone(),
            cache.clone(),
            scorer.clone(),
            config.tiers,
            retry,
        )
        .spawn();

        info!(
            "Session service ready (retry {}x, cache {} sessions, signal detection {})",
            retry.max_attempts, config.cache_max_sessions, config.detect_signals
        );

        Self {
            analytics: AnalyticsAggregator::new(store.clone(), config.analytics_top_tags),
            store,
            clock,
            cache,
            queue: RetryQueue::new(),
            connectivity: Connectivity::default(),
            retry,
            scores,
            scorer,
            tiers: config.tiers,
            extractor: config.detect_signals.then(SignalExtractor::new),
        }
    }

    pub fn scorer(&self) -> &LeadScorer {
        &self.scorer
    }

    /// Create the session, or return the stored one untouched if the id exists.
    pub async fn create_session(&self, session_id: &str) -> Result<CreatedSession> {
        validate_session_id(session_id)?;
        if let Some(existing) = self.cache.get(session_id) {
            return Ok(CreatedSession {
                session: existing,
                created: false,
                outcome: WriteOutcome::Applied,
            });
        }

        let fresh = Session::new(session_id, self.clock.now());
        match self.retry.run("create session", || self.store.create(&fresh)).await {
            Ok(true) => {
                metrics::inc_sessions_created();
                info!("Created session {}", session_id);
                self.cache.put(fresh.clone());
                Ok(CreatedSession {
                    session: fresh,
                    created: true,
                    outcome: WriteOutcome::Applied,
                })
            }
            Ok(false) => {
                debug!("Session {} already exists", session_id);
                let existing = self.load(session_id).await?;
                Ok(CreatedSession {
                    session: existing,
                    created: false,
                    outcome: WriteOutcome::Applied,
                })
            }
            Err(e) => {
                let outcome = self.park(PendingWrite::Create(fresh.clone()), e)?;
                Ok(CreatedSession {
                    session: fresh,
                    created: true,
                    outcome,
                })
            }
        }
    }

    /// Append a message stamped with the service clock.
    ///
    /// User messages are also scanned for contact details and service
    /// mentions when signal detection is enabled.
    pub async fn append_message(&self, session_id: &str, draft: MessageDraft) -> Result<Receipt> {
        validate_session_id(session_id)?;
        let now = self.clock.now();
        let role = draft.role;
        let detected = match &self.extractor {
            Some(extractor) if role == Role::User => Some(extractor.extract(&draft.content)),
            _ => None,
        };

        let mut update = SessionUpdate::new().push(UpdateOp::AppendMessage(Message {
            id: draft
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            role,
            content: draft.content,
            timestamp: now,
        }));
        if let Some(found) = detected {
            if let Some(email) = found.email {
                update.add(UpdateOp::SetEmailIfUnset(email));
                update.add(UpdateOp::MarkEmailCollected);
            }
            if let Some(phone) = found.phone {
                update.add(UpdateOp::SetPhoneIfUnset(phone));
                update.add(UpdateOp::MarkPhoneCollected);
            }
            for tag in found.service_tags {
                update.add(UpdateOp::AddServiceInterest(tag.to_string()));
            }
        }
        let update = update.touched(now);

        let receipt = self.commit(session_id, update).await?;
        if receipt.outcome == WriteOutcome::Applied {
            metrics::inc_messages(role.as_str());
        }
        Ok(receipt)
    }

    /// Messages in chronological order.
    pub async fn get_history(&self, session_id: &str) -> Result<Vec<Message>> {
        validate_session_id(session_id)?;
        if let Some(messages) = self.cache.history(session_id) {
            return Ok(messages);
        }
        Ok(self.load(session_id).await?.messages)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        validate_session_id(session_id)?;
        if let Some(session) = self.cache.get(session_id) {
            return Ok(session);
        }
        self.load(session_id).await
    }

    pub async fn qualification(&self, session_id: &str) -> Result<Qualification> {
        let session = self.get_session(session_id).await?;
        let lead_score = session.metadata.lead_score;
        Ok(Qualification {
            lead_score,
            tier: self.tiers.tier_for(lead_score),
            status: session.metadata.status,
        })
    }

    /// Keeps the first non-empty email ever set.
    pub async fn set_email(&self, session_id: &str, email: &str) -> Result<Receipt> {
        let update = SessionUpdate::new().push(UpdateOp::SetEmailIfUnset(email.to_string()));
        self.mutate(session_id, update).await
    }

    pub async fn set_phone(&self, session_id: &str, phone: &str) -> Result<Receipt> {
        let update = SessionUpdate::new().push(UpdateOp::SetPhoneIfUnset(phone.to_string()));
        self.mutate(session_id, update).await
    }

    pub async fn mark_consultation_requested(&self, session_id: &str) -> Result<Receipt> {
        self.mutate(session_id, SessionUpdate::new().push(UpdateOp::RequestConsultation))
            .await
    }

    pub async fn mark_notification_sent(&self, session_id: &str) -> Result<Receipt> {
        self.mutate(session_id, SessionUpdate::new().push(UpdateOp::MarkNotificationSent))
            .await
    }

    pub async fn add_service_interest(&self, session_id: &str, tag: &str) -> Result<Receipt> {
        let update = SessionUpdate::new().push(UpdateOp::AddServiceInterest(tag.to_string()));
        self.mutate(session_id, update).await
    }

    pub async fn record_conversion_event(&self, session_id: &str, event: &str) -> Result<Receipt> {
        let update = SessionUpdate::new().push(UpdateOp::AddConversionEvent(event.to_string()));
        self.mutate(session_id, update).await
    }

    pub async fn record_response_time(&self, session_id: &str, millis: u64) -> Result<Receipt> {
        self.mutate(session_id, SessionUpdate::new().push(UpdateOp::AppendResponseTime(millis)))
            .await
    }

    pub async fn close_session(&self, session_id: &str) -> Result<Receipt> {
        let update = SessionUpdate::new().push(UpdateOp::SetStatus(SessionStatus::Closed));
        self.mutate(session_id, update).await
    }

    /// Merge `patch` into the metadata without breaking its one-way fields.
    pub async fn update_metadata(&self, session_id: &str, patch: MetadataPatch) -> Result<Receipt> {
        let mut update = SessionUpdate::new();
        if let Some(email) = patch.email {
            update.add(UpdateOp::SetEmailIfUnset(email));
        }
        if let Some(phone) = patch.phone {
            update.add(UpdateOp::SetPhoneIfUnset(phone));
        }
        for tag in patch.service_interest {
            update.add(UpdateOp::AddServiceInterest(tag));
        }
        if patch.consultation_requested == Some(true) {
            update.add(UpdateOp::RequestConsultation);
        }
        if let Some(score) = patch.lead_score {
            update.add(UpdateOp::RaiseLeadScore(score));
        }
        if let Some(status) = patch.status {
            update.add(UpdateOp::SetStatus(status));
        }
        self.mutate(session_id, update).await
    }

    pub async fn update_analytics(
        &self,
        session_id: &str,
        patch: AnalyticsPatch,
    ) -> Result<Receipt> {
        let mut update = SessionUpdate::new();
        if let Some(device) = patch.device_type {
            update.add(UpdateOp::SetDeviceType(device));
        }
        if let Some(source) = patch.source {
            update.add(UpdateOp::SetSource(source));
        }
        self.mutate(session_id, update).await
    }

    pub async fn daily_stats(&self, day: NaiveDate) -> DailyStats {
        self.analytics.daily_stats(day).await
    }

    pub async fn range_stats(&self, first_day: NaiveDate, days: u32) -> Vec<DailyStats> {
        self.analytics.range_stats(first_day, days).await
    }

    /// Record a connectivity change. Coming online replays the retry queue.
    pub async fn set_online(&self, online: bool) -> DrainReport {
        let was_online = self.connectivity.set(online);
        if was_online != online {
            info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        }
        if !online {
            return DrainReport {
                remaining: self.queue.len(),
                ..Default::default()
            };
        }
        self.flush_pending().await
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Replay queued writes now, oldest first.
    pub async fn flush_pending(&self) -> DrainReport {
        let report = self.queue.drain(|write| self.replay(write)).await;
        for _ in 0..report.applied {
            metrics::inc_writes_drained();
        }
        metrics::set_queue_depth(report.remaining);
        report
    }

    /// Give up on the oldest queued write, typically one a drain keeps
    /// stopping on because the store rejects it permanently.
    pub fn discard_pending_front(&self) -> Option<PendingWrite> {
        let discarded = self.queue.discard_front()?;
        metrics::inc_writes_dropped();
        metrics::set_queue_depth(self.queue.len());
        Some(discarded)
    }

    pub fn pending_writes(&self) -> usize {
        self.queue.len()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Close the retry queue and stop the score worker. Writes still queued
    /// are returned to the caller; later offline writes fail permanently.
    pub fn shutdown(&self) -> Vec<PendingWrite> {
        self.queue.close();
        self.scores.shutdown();
        let pending = self.queue.take_pending();
        metrics::set_queue_depth(0);
        if pending.is_empty() {
            info!("Session service shut down");
        } else {
            warn!("Session service shut down with {} unsent writes", pending.len());
        }
        pending
    }

    async fn mutate(&self, session_id: &str, update: SessionUpdate) -> Result<Receipt> {
        validate_session_id(session_id)?;
        let update = update.touched(self.clock.now());
        self.commit(session_id, update).await
    }

    async fn commit(&self, session_id: &str, update: SessionUpdate) -> Result<Receipt> {
        if self.connectivity.is_online() && self.queue.has_pending_for(session_id) {
            self.flush_pending().await;
        }

        let _permit = self.queue.direct_write_permit().await;
        if self.queue.has_pending_for(session_id) {
            debug!("Session {} has queued writes; queueing behind them", session_id);
            let outcome = self.enqueue(PendingWrite::Update {
                session_id: session_id.to_string(),
                update,
            })?;
            return Ok(Receipt {
                outcome,
                score: None,
            });
        }

        match self
            .retry
            .run("session update", || self.store.update(session_id, &update))
            .await
        {
            Ok(snapshot) => {
                self.cache.put(snapshot);
                let score = if update.affects_score() {
                    self.schedule_score(session_id)
                } else {
                    None
                };
                Ok(Receipt {
                    outcome: WriteOutcome::Applied,
                    score,
                })
            }
            Err(e) => {
                let outcome = self.park(
                    PendingWrite::Update {
                        session_id: session_id.to_string(),
                        update,
                    },
                    e,
                )?;
                Ok(Receipt {
                    outcome,
                    score: None,
                })
            }
        }
    }

    /// Decide what a failed write becomes: queued while offline, otherwise
    /// a typed error.
    fn park(&self, write: PendingWrite, error: StoreError) -> Result<WriteOutcome> {
        if !matches!(error, StoreError::NotFound(_)) {
            metrics::inc_store_failure(error.kind());
        }
        if !error.is_transient() || self.connectivity.is_online() {
            return Err(error.into());
        }
        debug!("Store unreachable while offline: {}", error);
        self.enqueue(write)
    }

    fn enqueue(&self, write: PendingWrite) -> Result<WriteOutcome> {
        let session_id = write.session_id().to_string();
        match self.queue.push(write) {
            Ok(position) => {
                metrics::inc_writes_queued();
                metrics::set_queue_depth(self.queue.len());
                info!("Queued write for session {} at position {}", session_id, position);
                Ok(WriteOutcome::Queued { position })
            }
            Err(_) => Err(SessionError::PermanentStore(format!(
                "retry queue closed, write for session {} not accepted",
                session_id
            ))),
        }
    }

    async fn replay(&self, write: PendingWrite) -> StoreResult<()> {
        match write {
            PendingWrite::Create(session) => {
                if self.store.create(&session).await? {
                    metrics::inc_sessions_created();
                }
            }
            PendingWrite::Update { session_id, update } => {
                let snapshot = self.store.update(&session_id, &update).await?;
                self.cache.put(snapshot);
                if update.affects_score() {
                    // Drained writes have no caller waiting on the ticket.
                    let _ = self.schedule_score(&session_id);
                }
            }
        }
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Session> {
        let session = self
            .retry
            .run("session read", || self.store.get(session_id))
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        self.cache.put(session.clone());
        Ok(session)
    }

    fn schedule_score(&self, session_id: &str) -> Option<ScoreTicket> {
        match self.scores.schedule(session_id) {
            Ok(ticket) => Some(ticket),
            Err(e) => {
                warn!("Score recomputation for session {} not scheduled: {}", session_id, e);
                None
            }
        }
    }
}

impl Drop for SessionService {
    fn drop(&mut self) {
        self.scores.shutdown();
    }
}
