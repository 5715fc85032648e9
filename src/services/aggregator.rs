//! Daily metrics aggregator — idempotent team- and user-level rollups from
//! completed reviews.
//!
//! The rollup math is pure; rows are written with an upsert on the full
//! (date, team, user, project) key, so re-running a day overwrites its rows
//! with identical recomputed values.

use std::time::Instant;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::models::error::AppError;
use crate::models::metric::NewReviewMetric;
use crate::models::review::{MrReview, MrStatus, ReviewerAssignment};
use crate::schema::review_metrics;
use crate::services::review_service;

/// Result of one aggregation run. `failures` counts subtasks that were
/// logged and skipped; the run is a success only when it stays zero.
#[derive(Debug, Default)]
pub struct AggregationOutcome {
    pub team_rows: usize,
    pub user_rows: usize,
    pub failures: usize,
}

impl AggregationOutcome {
    pub fn succeeded(&self) -> bool {
        self.failures == 0
    }
}

/// Aggregate metrics for one calendar date in the given timezone.
pub async fn run_for_date(
    conn: &mut AsyncPgConnection,
    tz: Tz,
    date: NaiveDate,
) -> Result<AggregationOutcome, AppError> {
    let started = Instant::now();
    let (window_start, window_end) = day_window(tz, date);

    tracing::info!(%date, %tz, "Starting daily metrics aggregation");

    let reviews = review_service::completed_in_window(conn, window_start, window_end).await?;
    if reviews.is_empty() {
        tracing::info!(%date, "No completed reviews found for date");
        return Ok(AggregationOutcome::default());
    }

    let review_ids: Vec<i64> = reviews.iter().map(|r| r.id).collect();
    let assignments = review_service::assignments_for_reviews(conn, &review_ids).await?;

    let mut outcome = AggregationOutcome::default();

    // Team-level rows, one per team with user/project null.
    let mut teams: Vec<&str> = reviews.iter().map(|r| r.team.as_str()).collect();
    teams.sort_unstable();
    teams.dedup();

    for team in teams {
        let group: Vec<(&MrReview, &[ReviewerAssignment])> = reviews
            .iter()
            .filter(|r| r.team == team)
            .map(|r| {
                (
                    r,
                    assignments.get(&r.id).map(Vec::as_slice).unwrap_or(&[]),
                )
            })
            .collect();

        let row = compute_team_rollup(date, team, &group);
        match upsert_metric(conn, &row).await {
            Ok(()) => outcome.team_rows += 1,
            Err(e) => {
                tracing::error!(team, error = %e, "Failed to aggregate team metrics");
                outcome.failures += 1;
            }
        }
    }

    // User-level rows, one per assignment of each completed review.
    for review in &reviews {
        let Some(review_assignments) = assignments.get(&review.id) else {
            continue;
        };
        for assignment in review_assignments {
            let row = compute_user_rollup(date, review, assignment);
            match upsert_metric(conn, &row).await {
                Ok(()) => outcome.user_rows += 1,
                Err(e) => {
                    tracing::error!(
                        review_id = review.id,
                        user_id = assignment.user_id,
                        error = %e,
                        "Failed to aggregate user metrics"
                    );
                    outcome.failures += 1;
                }
            }
        }
    }

    let elapsed = started.elapsed().as_secs_f64();
    crate::metrics::observe_aggregation_duration(elapsed);
    tracing::info!(
        %date,
        team_rows = outcome.team_rows,
        user_rows = outcome.user_rows,
        failures = outcome.failures,
        elapsed_secs = elapsed,
        "Daily metrics aggregation completed"
    );

    Ok(outcome)
}

/// The 24 h window [D 00:00, D+1 00:00) in the configured zone, as UTC
/// instants. DST gaps fall back to the earliest valid local time.
pub fn day_window(tz: Tz, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start_local = date.and_hms_opt(0, 0, 0).expect("midnight exists");
    let end_local = (date + chrono::Duration::days(1))
        .and_hms_opt(0, 0, 0)
        .expect("midnight exists");

    let start = tz
        .from_local_datetime(&start_local)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&start_local));
    let end = tz
        .from_local_datetime(&end_local)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&end_local));

    (start, end)
}

/// Team-level rollup: averages over the team's completed reviews for the
/// day, with user and project left null.
pub fn compute_team_rollup(
    date: NaiveDate,
    team: &str,
    group: &[(&MrReview, &[ReviewerAssignment])],
) -> NewReviewMetric {
    let total = group.len() as i32;
    let completed = group
        .iter()
        .filter(|(r, _)| r.status() == Some(MrStatus::Merged))
        .count() as i32;

    let ttfr_samples: Vec<i64> = group.iter().filter_map(|(r, _)| r.ttfr_seconds()).collect();
    let approval_samples: Vec<i64> = group
        .iter()
        .filter_map(|(r, _)| r.time_to_approval_seconds())
        .collect();

    let mut comment_count = 0i64;
    let mut comment_length = 0i64;
    let mut assignment_count = 0i64;
    for (_, assignments) in group {
        for a in *assignments {
            comment_count += i64::from(a.comment_count);
            comment_length += a.comment_total_length;
            assignment_count += 1;
        }
    }

    // Averages are per reviewer slot, not per review: a review with two
    // assignees at 5 and 3 comments averages 4.
    let denom = assignment_count.max(1) as f64;
    let avg_comment_count = comment_count as f64 / denom;
    let avg_comment_length = comment_length as f64 / denom;
    let engagement_score = avg_comment_count * 10.0 + avg_comment_length / 100.0;

    NewReviewMetric {
        date,
        team: team.to_string(),
        user_id: None,
        project_id: None,
        total_reviews: total,
        completed_reviews: completed,
        avg_ttfr: mean_minutes(&ttfr_samples),
        avg_time_to_approval: mean_minutes(&approval_samples),
        avg_comment_count: Some(avg_comment_count),
        avg_comment_length: Some(avg_comment_length),
        engagement_score: Some(engagement_score),
    }
}

/// User-level rollup from one assignment, keyed by user and project. Uses
/// the assignment's own timestamps relative to `assigned_at`.
pub fn compute_user_rollup(
    date: NaiveDate,
    review: &MrReview,
    assignment: &ReviewerAssignment,
) -> NewReviewMetric {
    let completed = if review.status() == Some(MrStatus::Merged) {
        1
    } else {
        0
    };

    NewReviewMetric {
        date,
        team: review.team.clone(),
        user_id: Some(assignment.user_id),
        project_id: Some(review.gitlab_project_id),
        total_reviews: 1,
        completed_reviews: completed,
        avg_ttfr: assignment.ttfr_seconds().map(to_minutes),
        avg_time_to_approval: assignment.time_to_approval_seconds().map(to_minutes),
        avg_comment_count: Some(f64::from(assignment.comment_count)),
        avg_comment_length: Some(assignment.comment_total_length as f64),
        engagement_score: Some(assignment.engagement_score()),
    }
}

fn mean_minutes(samples: &[i64]) -> Option<i32> {
    if samples.is_empty() {
        return None;
    }
    let mean_secs = samples.iter().sum::<i64>() as f64 / samples.len() as f64;
    Some((mean_secs / 60.0) as i32)
}

fn to_minutes(secs: i64) -> i32 {
    (secs / 60) as i32
}

/// Idempotent write on the (date, team, user, project) key, nulls included.
pub async fn upsert_metric(
    conn: &mut AsyncPgConnection,
    row: &NewReviewMetric,
) -> Result<(), AppError> {
    diesel::insert_into(review_metrics::table)
        .values(row)
        .on_conflict((
            review_metrics::date,
            review_metrics::team,
            review_metrics::user_id,
            review_metrics::project_id,
        ))
        .do_update()
        .set(row)
        .execute(conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, h, m, 0).unwrap()
    }

    fn review(id: i64, status: &str) -> MrReview {
        MrReview {
            id,
            gitlab_project_id: 100,
            gitlab_mr_iid: id,
            mr_url: String::new(),
            mr_title: String::new(),
            mr_author_id: None,
            team: "frontend".into(),
            roulette_triggered_at: Some(at(9, 0)),
            roulette_triggered_by: None,
            first_review_at: Some(at(10, 0)),
            approved_at: Some(at(11, 0)),
            merged_at: Some(at(12, 0)),
            closed_at: None,
            status: status.into(),
            bot_comment_id: None,
            created_at: at(8, 0),
            updated_at: at(12, 0),
        }
    }

    fn assignment(id: i64, user_id: i64, count: i32, length: i64) -> ReviewerAssignment {
        ReviewerAssignment {
            id,
            mr_review_id: 1,
            user_id,
            role: "team_member".into(),
            assigned_at: at(9, 0),
            started_review_at: None,
            first_comment_at: Some(at(10, 0)),
            approved_at: Some(at(11, 0)),
            comment_count: count,
            comment_total_length: length,
            last_note_id: None,
        }
    }

    #[test]
    fn team_rollup_matches_hand_computed_values() {
        // One merged review with 2 assignments (5/500 and 3/300 comments).
        let r = review(1, "merged");
        let assignments = vec![assignment(1, 10, 5, 500), assignment(2, 20, 3, 300)];
        let group: Vec<(&MrReview, &[ReviewerAssignment])> = vec![(&r, assignments.as_slice())];

        let row = compute_team_rollup(date(), "frontend", &group);
        assert_eq!(row.total_reviews, 1);
        assert_eq!(row.completed_reviews, 1);
        assert_eq!(row.avg_ttfr, Some(60));
        assert_eq!(row.avg_time_to_approval, Some(120));
        assert_eq!(row.avg_comment_count, Some(4.0));
        assert_eq!(row.avg_comment_length, Some(400.0));
        assert_eq!(row.engagement_score, Some(4.0 * 10.0 + 400.0 / 100.0));
        assert!(row.user_id.is_none());
        assert!(row.project_id.is_none());
    }

    #[test]
    fn team_rollup_is_deterministic_across_runs() {
        let r = review(1, "merged");
        let assignments = vec![assignment(1, 10, 5, 500), assignment(2, 20, 3, 300)];
        let group: Vec<(&MrReview, &[ReviewerAssignment])> = vec![(&r, assignments.as_slice())];

        let first = compute_team_rollup(date(), "frontend", &group);
        let second = compute_team_rollup(date(), "frontend", &group);
        assert_eq!(first, second);
    }

    #[test]
    fn comment_averages_divide_by_assignment_count() {
        let r1 = review(1, "merged");
        let r2 = review(2, "closed");
        let a1 = vec![assignment(1, 10, 5, 500)];
        let a2 = vec![assignment(2, 20, 3, 300)];
        let group: Vec<(&MrReview, &[ReviewerAssignment])> =
            vec![(&r1, a1.as_slice()), (&r2, a2.as_slice())];

        let row = compute_team_rollup(date(), "frontend", &group);
        assert_eq!(row.total_reviews, 2);
        assert_eq!(row.completed_reviews, 1);
        assert_eq!(row.avg_comment_count, Some(4.0));
        assert_eq!(row.avg_comment_length, Some(400.0));
    }

    #[test]
    fn ttfr_means_skip_reviews_without_both_endpoints() {
        let with = review(1, "merged");
        let mut without = review(2, "merged");
        without.first_review_at = None;
        without.approved_at = None;
        let empty: Vec<ReviewerAssignment> = Vec::new();
        let group: Vec<(&MrReview, &[ReviewerAssignment])> =
            vec![(&with, empty.as_slice()), (&without, empty.as_slice())];

        let row = compute_team_rollup(date(), "frontend", &group);
        // Only the complete review contributes: 3600 s -> 60 min.
        assert_eq!(row.avg_ttfr, Some(60));
        assert_eq!(row.avg_time_to_approval, Some(120));
    }

    #[test]
    fn rollup_with_no_timed_reviews_stores_null_averages() {
        let mut r = review(1, "closed");
        r.roulette_triggered_at = None;
        r.first_review_at = None;
        r.approved_at = None;
        let empty: Vec<ReviewerAssignment> = Vec::new();
        let group: Vec<(&MrReview, &[ReviewerAssignment])> = vec![(&r, empty.as_slice())];

        let row = compute_team_rollup(date(), "frontend", &group);
        assert_eq!(row.avg_ttfr, None);
        assert_eq!(row.avg_time_to_approval, None);
        assert_eq!(row.completed_reviews, 0);
    }

    #[test]
    fn user_rollup_uses_assignment_timestamps() {
        let r = review(1, "merged");
        let a = assignment(1, 10, 5, 500);

        let row = compute_user_rollup(date(), &r, &a);
        assert_eq!(row.user_id, Some(10));
        assert_eq!(row.project_id, Some(100));
        assert_eq!(row.total_reviews, 1);
        assert_eq!(row.completed_reviews, 1);
        assert_eq!(row.avg_ttfr, Some(60));
        assert_eq!(row.avg_time_to_approval, Some(120));
        assert_eq!(row.avg_comment_count, Some(5.0));
        assert_eq!(row.avg_comment_length, Some(500.0));
        assert_eq!(row.engagement_score, Some(55.0));
    }

    #[test]
    fn user_rollup_for_closed_review_counts_nothing_completed() {
        let r = review(1, "closed");
        let mut a = assignment(1, 10, 2, 100);
        a.first_comment_at = None;
        a.approved_at = None;

        let row = compute_user_rollup(date(), &r, &a);
        assert_eq!(row.completed_reviews, 0);
        assert_eq!(row.avg_ttfr, None);
        assert_eq!(row.avg_time_to_approval, None);
    }

    #[test]
    fn day_window_converts_local_midnights_to_utc() {
        let tz: Tz = "Europe/Paris".parse().unwrap();
        let (start, end) = day_window(tz, date());
        // Paris is UTC+1 in January.
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 1, 14, 23, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 1, 15, 23, 0, 0).unwrap());
    }

    #[test]
    fn day_window_in_utc_is_the_calendar_day() {
        let (start, end) = day_window(chrono_tz::UTC, date());
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 1, 16, 0, 0, 0).unwrap());
    }
}
