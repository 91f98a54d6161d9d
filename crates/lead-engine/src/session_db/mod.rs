//! Session document store - the persistence contract and its SQLite adapter
pub mod migration;
pub mod schema;
pub mod session_store;

pub use migration::MigrationManager;
pub use schema::*;
pub use session_store::SqliteSessionStore;

use crate::error::StoreResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Capability the engine needs from a document database.
///
/// Adapters must apply a [`SessionUpdate`] atomically (all operations or
/// none) and must classify every failure as transient or permanent.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &str) -> StoreResult<Option<Session>>;

    /// Insert-if-absent. Returns `false` when a session with that id exists.
    async fn create(&self, session: &Session) -> StoreResult<bool>;

    /// Apply `update` to an existing document and return the new snapshot.
    /// Fails with `StoreError::NotFound` for unknown ids.
    async fn update(&self, session_id: &str, update: &SessionUpdate) -> StoreResult<Session>;

    async fn query(&self, query: &SessionQuery) -> StoreResult<Vec<Session>>;
}

/// Field-level atomic operation on a session document.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    /// Append to `messages` and bump `message_count` plus the role counter.
    /// A message whose id is already present is ignored as a whole. The
    /// stored timestamp is never earlier than the last message's.
    AppendMessage(Message),
    SetEmailIfUnset(String),
    SetPhoneIfUnset(String),
    MarkEmailCollected,
    MarkPhoneCollected,
    RequestConsultation,
    MarkNotificationSent,
    /// `lead_score = max(lead_score, n)`, clamped to 10.
    RaiseLeadScore(u8),
    AddServiceInterest(String),
    AddConversionEvent(String),
    AppendResponseTime(u64),
    SetStatus(SessionStatus),
    /// Promote `active` to `qualified`; other states are left alone.
    QualifyIfActive,
    SetDeviceType(String),
    SetSource(String),
    Touch(DateTime<Utc>),
}

/// Ordered batch of operations applied as one atomic write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionUpdate {
    ops: Vec<UpdateOp>,
}

impl SessionUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, op: UpdateOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn add(&mut self, op: UpdateOp) {
        self.ops.push(op);
    }

    /// Appends `Touch(now)` so every mutation refreshes `last_active_at`.
    pub fn touched(self, now: DateTime<Utc>) -> Self {
        self.push(UpdateOp::Touch(now))
    }

    pub fn ops(&self) -> &[UpdateOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// True when the batch can change an input of the lead scorer.
    pub fn affects_score(&self) -> bool {
        self.ops.iter().any(|op| {
            matches!(
                op,
                UpdateOp::AppendMessage(_)
                    | UpdateOp::SetEmailIfUnset(_)
                    | UpdateOp::RequestConsultation
                    | UpdateOp::AddServiceInterest(_)
                    | UpdateOp::RaiseLeadScore(_)
            )
        })
    }

    /// Apply every operation to `session` in order and bump its revision.
    ///
    /// This is the single definition of the update semantics. Adapters call
    /// it inside their atomic section, so anything it derives from the
    /// current document (message order, revision) is decided under the
    /// store's lock.
    pub fn apply_to(&self, session: &mut Session) {
        for op in &self.ops {
            apply_op(op, session);
        }
        session.revision += 1;
    }
}

fn apply_op(op: &UpdateOp, session: &mut Session) {
    let meta = &mut session.metadata;
    let analytics = &mut session.analytics;
    match op {
        UpdateOp::AppendMessage(message) => {
            if session.messages.iter().any(|m| m.id == message.id) {
                return;
            }
            match message.role {
                Role::User => analytics.user_message_count += 1,
                Role::Assistant => analytics.assistant_message_count += 1,
                Role::System => {}
            }
            let mut message = message.clone();
            if let Some(last) = session.messages.last() {
                message.timestamp = message.timestamp.max(last.timestamp);
            }
            session.messages.push(message);
            meta.message_count += 1;
        }
        UpdateOp::SetEmailIfUnset(email) => {
            if !meta.has_email() && !email.trim().is_empty() {
                meta.email = Some(email.trim().to_string());
                analytics.email_collected = true;
            }
        }
        UpdateOp::SetPhoneIfUnset(phone) => {
            let unset = meta.phone.as_deref().map_or(true, |p| p.trim().is_empty());
            if unset && !phone.trim().is_empty() {
                meta.phone = Some(phone.trim().to_string());
                analytics.phone_collected = true;
            }
        }
        UpdateOp::MarkEmailCollected => analytics.email_collected = true,
        UpdateOp::MarkPhoneCollected => analytics.phone_collected = true,
        UpdateOp::RequestConsultation => meta.consultation_requested = true,
        UpdateOp::MarkNotificationSent => analytics.notification_sent = true,
        UpdateOp::RaiseLeadScore(candidate) => {
            meta.lead_score = meta.lead_score.max((*candidate).min(10));
        }
        UpdateOp::AddServiceInterest(tag) => {
            let tag = tag.trim();
            if !tag.is_empty() {
                meta.service_interest.insert(tag.to_lowercase());
            }
        }
        UpdateOp::AddConversionEvent(tag) => {
            let tag = tag.trim();
            if !tag.is_empty() {
                analytics.conversion_events.insert(tag.to_string());
            }
        }
        UpdateOp::AppendResponseTime(ms) => analytics.response_times_ms.push(*ms),
        UpdateOp::SetStatus(status) => meta.status = *status,
        UpdateOp::QualifyIfActive => {
            if meta.status == SessionStatus::Active {
                meta.status = SessionStatus::Qualified;
            }
        }
        UpdateOp::SetDeviceType(device) => analytics.device_type = Some(device.clone()),
        UpdateOp::SetSource(source) => analytics.source = Some(source.clone()),
        UpdateOp::Touch(at) => {
            if *at > session.last_active_at {
                session.last_active_at = *at;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 2, 10, minute, 0).unwrap()
    }

    fn message(id: &str, role: Role, content: &str, minute: u32) -> Message {
        Message {
            id: id.to_string(),
            role,
            content: content.to_string(),
            timestamp: at(minute),
        }
    }

    #[test]
    fn test_append_message_updates_counters_together() {
        let mut session = Session::new("s1", at(0));
        SessionUpdate::new()
            .push(UpdateOp::AppendMessage(message("m1", Role::User, "hi", 1)))
            .push(UpdateOp::AppendMessage(message("m2", Role::Assistant, "hello", 2)))
            .push(UpdateOp::AppendMessage(message("m3", Role::System, "note", 3)))
            .apply_to(&mut session);

        assert_eq!(session.messages.len(), 3);
        assert_eq!(session.metadata.message_count, 3);
        assert_eq!(session.analytics.user_message_count, 1);
        assert_eq!(session.analytics.assistant_message_count, 1);
    }

    #[test]
    fn test_duplicate_message_id_is_ignored() {
        let mut session = Session::new("s1", at(0));
        let update = SessionUpdate::new()
            .push(UpdateOp::AppendMessage(message("m1", Role::User, "hi", 1)));
        update.apply_to(&mut session);
        update.apply_to(&mut session);

        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.metadata.message_count, 1);
        assert_eq!(session.analytics.user_message_count, 1);
    }

    #[test]
    fn test_late_stamped_message_keeps_history_ordered() {
        let mut session = Session::new("s1", at(0));
        SessionUpdate::new()
            .push(UpdateOp::AppendMessage(message("m1", Role::User, "later", 7)))
            .apply_to(&mut session);
        // Stamped earlier but committed second.
        SessionUpdate::new()
            .push(UpdateOp::AppendMessage(message("m2", Role::User, "earlier", 4)))
            .apply_to(&mut session);

        let contents: Vec<_> = session.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["later", "earlier"]);
        assert_eq!(session.messages[1].timestamp, at(7));
    }

    #[test]
    fn test_every_update_bumps_revision() {
        let mut session = Session::new("s1", at(0));
        assert_eq!(session.revision, 0);
        SessionUpdate::new().touched(at(1)).apply_to(&mut session);
        let replay = SessionUpdate::new()
            .push(UpdateOp::AppendMessage(message("m1", Role::User, "hi", 2)));
        replay.apply_to(&mut session);
        replay.apply_to(&mut session);
        assert_eq!(session.revision, 3);
        assert_eq!(session.messages.len(), 1);
    }

    #[test]
    fn test_email_is_set_once() {
        let mut session = Session::new("s1", at(0));
        SessionUpdate::new()
            .push(UpdateOp::SetEmailIfUnset("  ".into()))
            .apply_to(&mut session);
        assert_eq!(session.metadata.email, None);

        SessionUpdate::new()
            .push(UpdateOp::SetEmailIfUnset("a@b.com".into()))
            .push(UpdateOp::SetEmailIfUnset("c@d.com".into()))
            .apply_to(&mut session);
        assert_eq!(session.metadata.email.as_deref(), Some("a@b.com"));
        assert!(session.analytics.email_collected);
    }

    #[test]
    fn test_raise_lead_score_never_lowers() {
        let mut session = Session::new("s1", at(0));
        SessionUpdate::new().push(UpdateOp::RaiseLeadScore(6)).apply_to(&mut session);
        SessionUpdate::new().push(UpdateOp::RaiseLeadScore(4)).apply_to(&mut session);
        assert_eq!(session.metadata.lead_score, 6);

        SessionUpdate::new().push(UpdateOp::RaiseLeadScore(42)).apply_to(&mut session);
        assert_eq!(session.metadata.lead_score, 10);
    }

    #[test]
    fn test_qualify_if_active_leaves_closed_sessions() {
        let mut session = Session::new("s1", at(0));
        session.metadata.status = SessionStatus::Closed;
        SessionUpdate::new().push(UpdateOp::QualifyIfActive).apply_to(&mut session);
        assert_eq!(session.metadata.status, SessionStatus::Closed);

        let mut session = Session::new("s2", at(0));
        SessionUpdate::new().push(UpdateOp::QualifyIfActive).apply_to(&mut session);
        assert_eq!(session.metadata.status, SessionStatus::Qualified);
    }

    #[test]
    fn test_touch_only_moves_forward() {
        let mut session = Session::new("s1", at(5));
        SessionUpdate::new().touched(at(3)).apply_to(&mut session);
        assert_eq!(session.last_active_at, at(5));
        SessionUpdate::new().touched(at(9)).apply_to(&mut session);
        assert_eq!(session.last_active_at, at(9));
        assert_eq!(session.created_at, at(5));
    }

    #[test]
    fn test_affects_score() {
        assert!(SessionUpdate::new().push(UpdateOp::RequestConsultation).affects_score());
        assert!(SessionUpdate::new().push(UpdateOp::RaiseLeadScore(8)).affects_score());
        assert!(!SessionUpdate::new().push(UpdateOp::MarkNotificationSent).affects_score());
        assert!(!SessionUpdate::new().touched(at(1)).affects_score());
    }

    #[test]
    fn test_service_interest_is_a_set() {
        let mut session = Session::new("s1", at(0));
        SessionUpdate::new()
            .push(UpdateOp::AddServiceInterest("SEO".into()))
            .push(UpdateOp::AddServiceInterest("seo".into()))
            .push(UpdateOp::AddServiceInterest("web-development".into()))
            .apply_to(&mut session);
        assert_eq!(session.metadata.service_interest.len(), 2);
    }

    #[test]
    fn test_missing_document_fields_default() {
        let json = r#"{
            "session_id": "legacy",
            "created_at": "2024-05-02T10:00:00Z",
            "last_active_at": "2024-05-02T10:00:00Z",
            "metadata": { "message_count": 2 }
        }"#;
        let session: Session = serde_json::from_str(json).unwrap();
        assert_eq!(session.metadata.lead_score, 1);
        assert_eq!(session.metadata.status, SessionStatus::Active);
        assert!(session.analytics.response_times_ms.is_empty());
        assert!(session.messages.is_empty());
    }
}
