//! Prometheus metrics for the review-orchestration service.
//!
//! Process-wide, installed exactly once at startup; helpers keep label sets
//! consistent across call sites.

use metrics::{counter, gauge, histogram};

/// Install the Prometheus exporter on its own listener port.
pub fn init_metrics(port: u16) {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port));
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

// ── Counters ──

/// Record a roulette command trigger and its outcome.
pub fn roulette_trigger(team: &str, status: &str) {
    counter!("roulette_triggers_total", "team" => team.to_string(), "status" => status.to_string())
        .increment(1);
}

/// Record a completed (merged) review per assigned reviewer.
pub fn review_completed(team: &str, user: &str, role: &str) {
    counter!("reviews_completed_total",
        "team" => team.to_string(), "user" => user.to_string(), "role" => role.to_string())
    .increment(1);
}

/// Record a review closed without merge.
pub fn review_abandoned(team: &str) {
    counter!("reviews_abandoned_total", "team" => team.to_string()).increment(1);
}

/// Record a badge award.
pub fn badge_awarded(badge_name: &str, team: &str) {
    counter!("badges_awarded_total",
        "badge_name" => badge_name.to_string(), "team" => team.to_string())
    .increment(1);
}

/// Record a scheduler job execution outcome.
pub fn scheduler_job_run(status: &str) {
    counter!("scheduler_jobs_run_total", "status" => status.to_string()).increment(1);
}

/// Record a successful reminder notification.
pub fn scheduler_notification_sent(team: &str) {
    counter!("scheduler_notifications_sent_total", "team" => team.to_string()).increment(1);
}

/// Record a failed notification attempt.
pub fn scheduler_notification_failed(reason: &str) {
    counter!("scheduler_notifications_failed_total", "reason" => reason.to_string()).increment(1);
}

/// Record a badge evaluation job execution outcome.
pub fn badge_evaluation_run(status: &str) {
    counter!("badge_evaluation_jobs_run_total", "status" => status.to_string()).increment(1);
}

/// Record an error by kind tag.
pub fn error_recorded(kind: &str) {
    counter!("errors_total", "kind" => kind.to_string()).increment(1);
}

// ── Gauges ──

/// Set the current number of active reviews for a user.
pub fn set_active_reviews(team: &str, user: &str, count: i64) {
    gauge!("active_reviews", "team" => team.to_string(), "user" => user.to_string())
        .set(count as f64);
}

/// Set the current number of available reviewers.
pub fn set_available_reviewers(team: &str, role: &str, count: usize) {
    gauge!("available_reviewers", "team" => team.to_string(), "role" => role.to_string())
        .set(count as f64);
}

/// Set the number of holders for a badge.
pub fn set_badge_holders(badge_name: &str, count: i64) {
    gauge!("active_badge_holders", "badge_name" => badge_name.to_string()).set(count as f64);
}

/// Set the number of pending MRs in the last reminder.
pub fn set_pending_mrs(team: &str, count: usize) {
    gauge!("scheduler_pending_mrs_count", "team" => team.to_string()).set(count as f64);
}

/// Update the last-scheduler-run timestamp.
pub fn set_scheduler_last_run() {
    gauge!("scheduler_last_run_timestamp").set(chrono::Utc::now().timestamp() as f64);
}

// ── Histograms ──

/// Observe time to first review.
pub fn observe_ttfr(team: &str, seconds: f64) {
    histogram!("review_ttfr_seconds", "team" => team.to_string()).record(seconds);
}

/// Observe trigger-to-approval time.
pub fn observe_time_to_approval(team: &str, seconds: f64) {
    histogram!("review_time_to_approval_seconds", "team" => team.to_string()).record(seconds);
}

/// Observe comment count for a finished review.
pub fn observe_comment_count(team: &str, count: f64) {
    histogram!("review_comment_count", "team" => team.to_string()).record(count);
}

/// Observe total comment length for a finished review.
pub fn observe_comment_length(team: &str, length: f64) {
    histogram!("review_comment_length", "team" => team.to_string()).record(length);
}

/// Observe a reviewer's engagement score.
pub fn observe_engagement_score(team: &str, user: &str, score: f64) {
    histogram!("reviewer_engagement_score",
        "team" => team.to_string(), "user" => user.to_string())
    .record(score);
}

/// Observe scheduler notification job duration.
pub fn observe_scheduler_job_duration(seconds: f64) {
    histogram!("scheduler_job_duration_seconds").record(seconds);
}

/// Observe badge evaluation job duration.
pub fn observe_badge_evaluation_duration(seconds: f64) {
    histogram!("badge_evaluation_duration_seconds").record(seconds);
}

/// Observe metrics aggregation job duration.
pub fn observe_aggregation_duration(seconds: f64) {
    histogram!("metrics_aggregation_duration_seconds").record(seconds);
}
