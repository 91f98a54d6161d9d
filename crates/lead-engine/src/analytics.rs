//! Daily rollups over the sessions collection.
//!
//! Read-only and best-effort: a failed scan yields zeroed stats and a
//! warning, never an error.

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::session_db::{Session, SessionQuery, SessionStatus, SessionStore};

/// Sessions with more messages than this count as engaged.
pub const ENGAGED_MESSAGE_THRESHOLD: u64 = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Funnel {
    pub visitors: u64,
    pub engaged: u64,
    pub qualified: u64,
    pub consultation_requested: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceCount {
    pub tag: String,
    pub sessions: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyStats {
    pub date: NaiveDate,
    pub total_sessions: u64,
    pub active_sessions: u64,
    pub emails_captured: u64,
    pub consultations_requested: u64,
    pub avg_messages_per_session: f64,
    pub avg_lead_score: f64,
    pub top_services: Vec<ServiceCount>,
    pub funnel: Funnel,
}

impl DailyStats {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            total_sessions: 0,
            active_sessions: 0,
            emails_captured: 0,
            consultations_requested: 0,
            avg_messages_per_session: 0.0,
            avg_lead_score: 0.0,
            top_services: Vec::new(),
            funnel: Funnel::default(),
        }
    }

    /// Fold the sessions created on `date` into one summary.
    pub fn from_sessions(date: NaiveDate, sessions: &[Session], top_n: usize) -> Self {
        let mut stats = Self::empty(date);
        if sessions.is_empty() {
            return stats;
        }

        let mut message_total = 0u64;
        let mut score_total = 0u64;
        let mut tag_counts: HashMap<&str, u64> = HashMap::new();

        for session in sessions {
            let meta = &session.metadata;
            stats.total_sessions += 1;
            message_total += meta.message_count;
            score_total += u64::from(meta.lead_score);

            if meta.status == SessionStatus::Active {
                stats.active_sessions += 1;
            }
            if meta.has_email() {
                stats.emails_captured += 1;
                stats.funnel.qualified += 1;
            }
            if meta.consultation_requested {
                stats.consultations_requested += 1;
                stats.funnel.consultation_requested += 1;
            }
            if meta.message_count > ENGAGED_MESSAGE_THRESHOLD {
                stats.funnel.engaged += 1;
            }
            for tag in &meta.service_interest {
                *tag_counts.entry(tag.as_str()).or_default() += 1;
            }
        }

        let total = stats.total_sessions as f64;
        stats.funnel.visitors = stats.total_sessions;
        stats.avg_messages_per_session = message_total as f64 / total;
        stats.avg_lead_score = score_total as f64 / total;
        stats.top_services = top_tags(tag_counts, top_n);
        stats
    }
}

fn top_tags(counts: HashMap<&str, u64>, top_n: usize) -> Vec<ServiceCount> {
    let mut ranked: Vec<ServiceCount> = counts
        .into_iter()
        .map(|(tag, sessions)| ServiceCount {
            tag: tag.to_string(),
            sessions,
        })
        .collect();
    ranked.sort_by(|a, b| b.sessions.cmp(&a.sessions).then_with(|| a.tag.cmp(&b.tag)));
    ranked.truncate(top_n);
    ranked
}

/// `[day 00:00, day+1 00:00)` in UTC.
pub fn day_window(day: NaiveDate) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let start = Utc.from_utc_datetime(&day.and_time(NaiveTime::MIN));
    let end = Utc.from_utc_datetime(&day.succ_opt()?.and_time(NaiveTime::MIN));
    Some((start, end))
}

#[derive(Clone)]
pub struct AnalyticsAggregator {
    store: Arc<dyn SessionStore>,
    top_n: usize,
}

impl AnalyticsAggregator {
    pub fn new(store: Arc<dyn SessionStore>, top_n: usize) -> Self {
        Self { store, top_n }
    }

    pub async fn daily_stats(&self, day: NaiveDate) -> DailyStats {
        let Some((start, end)) = day_window(day) else {
            warn!("No day window for {}; returning empty stats", day);
            return DailyStats::empty(day);
        };

        match self.store.query(&SessionQuery::created_between(start, end)).await {
            Ok(sessions) => {
                debug!("Daily stats for {} over {} sessions", day, sessions.len());
                DailyStats::from_sessions(day, &sessions, self.top_n)
            }
            Err(e) => {
                warn!("Daily stats scan for {} failed: {}; returning empty stats", day, e);
                DailyStats::empty(day)
            }
        }
    }

    /// One entry per day starting at `first_day`, in date order.
    pub async fn range_stats(&self, first_day: NaiveDate, days: u32) -> Vec<DailyStats> {
        let dates = first_day.iter_days().take(days as usize);
        join_all(dates.map(|day| self.daily_stats(day))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemorySessionStore;
    use chrono::Duration;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 2).unwrap()
    }

    fn session_at(id: &str, hour: i64) -> Session {
        let (start, _) = day_window(day()).unwrap();
        Session::new(id, start + Duration::hours(hour))
    }

    fn aggregator(store: &InMemorySessionStore) -> AnalyticsAggregator {
        AnalyticsAggregator::new(Arc::new(store.clone()), 2)
    }

    #[tokio::test]
    async fn test_empty_day_is_all_zero() {
        let store = InMemorySessionStore::new();
        let stats = aggregator(&store).daily_stats(day()).await;
        assert_eq!(stats, DailyStats::empty(day()));
        assert_eq!(stats.avg_lead_score, 0.0);
        assert_eq!(stats.funnel, Funnel::default());
    }

    #[tokio::test]
    async fn test_folds_sessions_in_window() {
        let store = InMemorySessionStore::new();

        let mut engaged = session_at("a", 1);
        engaged.metadata.message_count = 5;
        engaged.metadata.lead_score = 7;
        engaged.metadata.email = Some("a@b.com".into());
        engaged.metadata.consultation_requested = true;
        engaged.metadata.status = SessionStatus::Qualified;
        engaged.metadata.service_interest.insert("seo".into());
        engaged.metadata.service_interest.insert("branding".into());
        store.seed(engaged);

        let mut browsing = session_at("b", 23);
        browsing.metadata.message_count = 1;
        browsing.metadata.service_interest.insert("seo".into());
        browsing.metadata.service_interest.insert("ecommerce".into());
        store.seed(browsing);

        // Next day, must not be counted.
        store.seed(session_at("c", 24));

        let stats = aggregator(&store).daily_stats(day()).await;
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.emails_captured, 1);
        assert_eq!(stats.consultations_requested, 1);
        assert_eq!(stats.avg_messages_per_session, 3.0);
        assert_eq!(stats.avg_lead_score, 4.0);
        assert_eq!(
            stats.funnel,
            Funnel {
                visitors: 2,
                engaged: 1,
                qualified: 1,
                consultation_requested: 1,
            }
        );
        let tags: Vec<_> = stats.top_services.iter().map(|t| t.tag.as_str()).collect();
        assert_eq!(tags, vec!["seo", "branding"]);
        assert_eq!(stats.top_services[0].sessions, 2);
    }

    #[tokio::test]
    async fn test_failed_scan_returns_zeroed_stats() {
        let store = InMemorySessionStore::new();
        store.seed(session_at("a", 2));
        store.set_reachable(false);

        let stats = aggregator(&store).daily_stats(day()).await;
        assert_eq!(stats.total_sessions, 0);
    }

    #[tokio::test]
    async fn test_range_stats_one_entry_per_day() {
        let store = InMemorySessionStore::new();
        store.seed(session_at("a", 2));
        store.seed(session_at("b", 26));

        let stats = aggregator(&store).range_stats(day(), 3).await;
        assert_eq!(stats.len(), 3);
        assert_eq!(stats[0].date, day());
        assert_eq!(stats[0].total_sessions, 1);
        assert_eq!(stats[1].total_sessions, 1);
        assert_eq!(stats[2].total_sessions, 0);
    }
}
