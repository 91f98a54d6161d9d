//! Heuristic lead scoring and the qualification tier table.

use crate::session_db::Session;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MIN_SCORE: u8 = 0;
pub const MAX_SCORE: u8 = 10;

lazy_static! {
    /// Buying-intent keywords and their weights. Each keyword contributes
    /// `keyword_factor * weight` once per session, however often it appears.
    static ref DEFAULT_KEYWORDS: Vec<(&'static str, f64)> = vec![
        ("enterprise", 2.0),
        ("roi", 3.0),
        ("urgent", 2.0),
        ("asap", 2.0),
        ("budget", 1.0),
        ("quote", 1.0),
        ("pricing", 1.0),
    ];
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoringConfig {
    pub base: f64,
    pub per_message: f64,
    pub engagement_cap: f64,
    pub email_bonus: f64,
    pub per_service_interest: f64,
    pub consultation_bonus: f64,
    pub keyword_factor: f64,
    /// Lowercase keyword and weight pairs.
    pub keywords: Vec<(String, f64)>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            base: 1.0,
            per_message: 0.5,
            engagement_cap: 3.0,
            email_bonus: 3.0,
            per_service_interest: 2.0,
            consultation_bonus: 5.0,
            keyword_factor: 0.5,
            keywords: DEFAULT_KEYWORDS
                .iter()
                .map(|(word, weight)| (word.to_string(), *weight))
                .collect(),
        }
    }
}

/// Inputs to the scorer, borrowed from a session snapshot.
#[derive(Debug, Clone, Default)]
pub struct LeadSignals<'a> {
    pub message_count: u64,
    pub has_email: bool,
    pub service_interest_count: usize,
    pub consultation_requested: bool,
    pub user_messages: Vec<&'a str>,
}

impl<'a> LeadSignals<'a> {
    pub fn from_session(session: &'a Session) -> Self {
        Self {
            message_count: session.metadata.message_count,
            has_email: session.metadata.has_email(),
            service_interest_count: session.metadata.service_interest.len(),
            consultation_requested: session.metadata.consultation_requested,
            user_messages: session.user_messages().map(|m| m.content.as_str()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LeadScorer {
    config: ScoringConfig,
}

impl LeadScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn score(&self, signals: &LeadSignals<'_>) -> u8 {
        let mut score = self.config.base;
        score += self.score_engagement(signals.message_count);
        if signals.has_email {
            score += self.config.email_bonus;
        }
        score += self.config.per_service_interest * signals.service_interest_count as f64;
        if signals.consultation_requested {
            score += self.config.consultation_bonus;
        }
        score += self.score_keywords(&signals.user_messages);

        score.round().clamp(MIN_SCORE as f64, MAX_SCORE as f64) as u8
    }

    pub fn score_session(&self, session: &Session) -> u8 {
        self.score(&LeadSignals::from_session(session))
    }

    fn score_engagement(&self, message_count: u64) -> f64 {
        (message_count as f64 * self.config.per_message).min(self.config.engagement_cap)
    }

    fn score_keywords(&self, user_messages: &[&str]) -> f64 {
        if user_messages.is_empty() {
            return 0.0;
        }
        let lowered: Vec<String> = user_messages.iter().map(|m| m.to_lowercase()).collect();
        self.config
            .keywords
            .iter()
            .filter(|(keyword, _)| lowered.iter().any(|text| text.contains(keyword.as_str())))
            .map(|(_, weight)| self.config.keyword_factor * weight)
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualificationTier {
    Unqualified,
    Browsing,
    Interested,
    Hot,
}

impl QualificationTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualificationTier::Unqualified => "unqualified",
            QualificationTier::Browsing => "browsing",
            QualificationTier::Interested => "interested",
            QualificationTier::Hot => "hot",
        }
    }
}

impl fmt::Display for QualificationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lowest score at which each tier starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierThresholds {
    pub browsing: u8,
    pub interested: u8,
    pub hot: u8,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            browsing: 3,
            interested: 7,
            hot: 10,
        }
    }
}

impl TierThresholds {
    pub fn tier_for(&self, score: u8) -> QualificationTier {
        if score >= self.hot {
            QualificationTier::Hot
        } else if score >= self.interested {
            QualificationTier::Interested
        } else if score >= self.browsing {
            QualificationTier::Browsing
        } else {
            QualificationTier::Unqualified
        }
    }

    /// Tier at which an active session is promoted to `qualified`.
    pub fn qualifies(&self, score: u8) -> bool {
        self.tier_for(score) >= QualificationTier::Interested
    }
}
