//! Conversation session and lead-qualification engine.
//!
//! [`SessionService`] owns the session lifecycle: it persists messages and
//! metadata through a [`SessionStore`], keeps a bounded snapshot cache,
//! parks writes in a FIFO retry queue while offline, recomputes lead scores
//! on a background worker and rolls sessions up into daily analytics.

pub mod analytics;
pub mod clock;
pub mod config;
pub mod conversation_cache;
pub mod error;
pub mod lead_scorer;
pub mod memory;
pub mod metrics;
pub mod retry_queue;
pub mod session_db;
pub mod session_service;
pub mod telemetry;
pub mod utils;
pub mod worker_threads;

// Public API exports
pub use analytics::{AnalyticsAggregator, DailyStats, Funnel, ServiceCount};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use conversation_cache::{CacheStats, ConversationCache};
pub use error::{Result, SessionError, StoreError, StoreResult};
pub use lead_scorer::{LeadScorer, LeadSignals, QualificationTier, ScoringConfig, TierThresholds};
pub use memory::InMemorySessionStore;
pub use retry_queue::{Connectivity, DrainReport, PendingWrite, RetryPolicy, RetryQueue};
pub use session_db::{
    Message, MessageDraft, Role, Session, SessionAnalytics, SessionMetadata, SessionQuery,
    SessionStatus, SessionStore, SessionUpdate, SqliteSessionStore, UpdateOp,
};
pub use session_service::{
    AnalyticsPatch, CreatedSession, MetadataPatch, Qualification, Receipt, SessionService,
    WriteOutcome,
};
pub use worker_threads::{ScoreTicket, ScoreUpdate};
