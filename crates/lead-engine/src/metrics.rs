//! Prometheus counters for the session engine.
//!
//! Recording functions are no-ops until [`init_metrics`] has run, so library
//! users that never scrape metrics pay nothing.

use anyhow::Context;
use lazy_static::lazy_static;
use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static SESSIONS_CREATED: OnceLock<IntCounter> = OnceLock::new();
static MESSAGES_APPENDED: OnceLock<IntCounterVec> = OnceLock::new();
static WRITES_QUEUED: OnceLock<IntCounter> = OnceLock::new();
static WRITES_DRAINED: OnceLock<IntCounter> = OnceLock::new();
static WRITES_DROPPED: OnceLock<IntCounter> = OnceLock::new();
static SCORE_RAISES: OnceLock<IntCounter> = OnceLock::new();
static STORE_FAILURES: OnceLock<IntCounterVec> = OnceLock::new();
static QUEUE_DEPTH: OnceLock<IntGauge> = OnceLock::new();

pub fn init_metrics() -> anyhow::Result<()> {
    install(&SESSIONS_CREATED, || {
        IntCounter::new("lead_sessions_created_total", "Sessions created")
    })?;
    install(&MESSAGES_APPENDED, || {
        IntCounterVec::new(
            prometheus::opts!("lead_messages_appended_total", "Messages appended per role"),
            &["role"],
        )
    })?;
    install(&WRITES_QUEUED, || {
        IntCounter::new("lead_writes_queued_total", "Writes parked in the offline queue")
    })?;
    install(&WRITES_DRAINED, || {
        IntCounter::new("lead_writes_drained_total", "Queued writes replayed successfully")
    })?;
    install(&WRITES_DROPPED, || {
        IntCounter::new("lead_writes_dropped_total", "Queued writes discarded unapplied")
    })?;
    install(&SCORE_RAISES, || {
        IntCounter::new("lead_score_raises_total", "Persisted lead score increases")
    })?;
    install(&STORE_FAILURES, || {
        IntCounterVec::new(
            prometheus::opts!("lead_store_failures_total", "Store failures by kind"),
            &["kind"],
        )
    })?;
    install(&QUEUE_DEPTH, || {
        IntGauge::new("lead_retry_queue_depth", "Writes waiting for the store to return")
    })?;
    Ok(())
}

fn install<M, F>(slot: &OnceLock<M>, build: F) -> anyhow::Result<()>
where
    M: Collector + Clone + 'static,
    F: FnOnce() -> prometheus::Result<M>,
{
    if slot.get().is_some() {
        return Ok(());
    }
    let metric = build().context("invalid metric definition")?;
    if slot.set(metric.clone()).is_ok() {
        REGISTRY.register(Box::new(metric)).ok();
    }
    Ok(())
}

pub fn inc_sessions_created() {
    if let Some(counter) = SESSIONS_CREATED.get() {
        counter.inc();
    }
}

pub fn inc_messages(role: &str) {
    if let Some(counter) = MESSAGES_APPENDED.get() {
        counter.with_label_values(&[role]).inc();
    }
}

pub fn inc_writes_queued() {
    if let Some(counter) = WRITES_QUEUED.get() {
        counter.inc();
    }
}

pub fn inc_writes_drained() {
    if let Some(counter) = WRITES_DRAINED.get() {
        counter.inc();
    }
}

pub fn inc_writes_dropped() {
    if let Some(counter) = WRITES_DROPPED.get() {
        counter.inc();
    }
}

pub fn inc_score_raises() {
    if let Some(counter) = SCORE_RAISES.get() {
        counter.inc();
    }
}

pub fn inc_store_failure(kind: &str) {
    if let Some(counter) = STORE_FAILURES.get() {
        counter.with_label_values(&[kind]).inc();
    }
}

pub fn set_queue_depth(depth: usize) {
    if let Some(gauge) = QUEUE_DEPTH.get() {
        gauge.set(depth as i64);
    }
}

/// Text exposition of every registered metric.
pub fn render() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .context("failed to encode metrics")?;
    String::from_utf8(buffer).context("metrics output is not utf-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_after_init() {
        init_metrics().unwrap();
        init_metrics().unwrap();
        inc_sessions_created();
        inc_messages("user");
        inc_store_failure("transient");
        set_queue_depth(3);

        let text = render().unwrap();
        assert!(text.contains("lead_sessions_created_total"));
        assert!(text.contains("lead_messages_appended_total{role=\"user\"}"));
        assert!(text.contains("lead_retry_queue_depth"));
    }
}
