//! Prometheus metrics for subscription operations.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "subscription_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Checkouts started, by purpose and handle kind
pub static CHECKOUTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Verification outcomes, by purpose and outcome
pub static VERIFICATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Scheduled changes, revocations, cancellations and resumes
pub static PLAN_CHANGES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Records touched by the rollover job, by action
pub static ROLLOVER_ACTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Webhook events received, by event and outcome
pub static WEBHOOK_EVENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    CHECKOUTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_checkouts_total",
                "Checkouts initiated by purpose and handle kind"
            ),
            &["purpose", "handle"]
        )
        .expect("Failed to register CHECKOUTS_TOTAL")
    });

    VERIFICATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_verifications_total",
                "Payment verifications by purpose and outcome"
            ),
            &["purpose", "outcome"]
        )
        .expect("Failed to register VERIFICATIONS_TOTAL")
    });

    PLAN_CHANGES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_plan_changes_total",
                "Subscription changes by kind"
            ),
            &["kind"]
        )
        .expect("Failed to register PLAN_CHANGES_TOTAL")
    });

    ROLLOVER_ACTIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_rollover_actions_total",
                "Rollover actions applied"
            ),
            &["action"]
        )
        .expect("Failed to register ROLLOVER_ACTIONS_TOTAL")
    });

    WEBHOOK_EVENTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_webhook_events_total",
                "Payment provider webhook events"
            ),
            &["event", "outcome"]
        )
        .expect("Failed to register WEBHOOK_EVENTS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Service counters followed by the HTTP metrics, in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
    }
    let mut output = String::from_utf8_lossy(&buffer).into_owned();
    output.push_str(&service_core::middleware::metrics::render());
    output
}

pub fn record_checkout(purpose: &str, handle: &str) {
    if let Some(counter) = CHECKOUTS_TOTAL.get() {
        counter.with_label_values(&[purpose, handle]).inc();
    }
}

pub fn record_verification(purpose: &str, outcome: &str) {
    if let Some(counter) = VERIFICATIONS_TOTAL.get() {
        counter.with_label_values(&[purpose, outcome]).inc();
    }
}

pub fn record_plan_change(kind: &str) {
    if let Some(counter) = PLAN_CHANGES_TOTAL.get() {
        counter.with_label_values(&[kind]).inc();
    }
}

pub fn record_rollover_action(action: &str, count: u64) {
    if let Some(counter) = ROLLOVER_ACTIONS_TOTAL.get() {
        counter.with_label_values(&[action]).inc_by(count);
    }
}

pub fn record_webhook_event(event: &str, outcome: &str) {
    if let Some(counter) = WEBHOOK_EVENTS_TOTAL.get() {
        counter.with_label_values(&[event, outcome]).inc();
    }
}
