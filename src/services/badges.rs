//! Badge evaluator — interprets the criteria DSL and awards each badge at
//! most once per user.

use std::time::Instant;

use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::models::badge::{Badge, BadgeCriteria, CriteriaOperator};
use crate::models::error::AppError;
use crate::models::metric::ReviewMetric;
use crate::models::user::User;
use crate::schema::{badges, mr_reviews, review_metrics, reviewer_assignments, user_badges, users};
use crate::services::leaderboard::{self, aggregate_by_user, Entry, Metric, Period, UserAggregate};

/// Result of one EvaluateAll run. Success requires zero systemic failures.
#[derive(Debug, Default)]
pub struct EvaluationOutcome {
    pub evaluated: usize,
    pub awarded: usize,
    pub failures: usize,
}

impl EvaluationOutcome {
    pub fn succeeded(&self) -> bool {
        self.failures == 0
    }
}

/// Evaluate every badge for every user. Pairs that already hold the badge
/// are skipped; per-pair failures are logged and counted, not fatal.
pub async fn evaluate_all(conn: &mut AsyncPgConnection) -> Result<EvaluationOutcome, AppError> {
    let started = Instant::now();
    tracing::info!("Starting badge evaluation for all users");

    let all_badges = list_badges(conn).await?;
    let all_users = users::table.load::<User>(conn).await?;

    let mut outcome = EvaluationOutcome::default();

    for badge in &all_badges {
        let criteria = match badge.parsed_criteria() {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(badge = %badge.name, error = %e, "Skipping badge");
                outcome.failures += 1;
                continue;
            }
        };

        for user in &all_users {
            if has_badge(conn, user.id, badge.id).await? {
                tracing::debug!(user = %user.username, badge = %badge.name, "Already earned, skipping");
                continue;
            }

            outcome.evaluated += 1;
            match evaluate(conn, &criteria, user.id).await {
                Ok(true) => {
                    if award(conn, user.id, badge.id).await? {
                        outcome.awarded += 1;
                        crate::metrics::badge_awarded(&badge.name, &user.team);
                        if let Ok(count) = holders_count(conn, badge.id).await {
                            crate::metrics::set_badge_holders(&badge.name, count);
                        }
                        tracing::info!(
                            user = %user.username,
                            badge = %badge.name,
                            "Badge awarded"
                        );
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        user = %user.username,
                        badge = %badge.name,
                        error = %e,
                        "Failed to evaluate badge"
                    );
                    outcome.failures += 1;
                }
            }
        }
    }

    let elapsed = started.elapsed().as_secs_f64();
    crate::metrics::observe_badge_evaluation_duration(elapsed);
    tracing::info!(
        badges = all_badges.len(),
        users = all_users.len(),
        awarded = outcome.awarded,
        failures = outcome.failures,
        elapsed_secs = elapsed,
        "Badge evaluation complete"
    );

    Ok(outcome)
}

/// Evaluate one criterion for one user.
pub async fn evaluate(
    conn: &mut AsyncPgConnection,
    criteria: &BadgeCriteria,
    user_id: i64,
) -> Result<bool, AppError> {
    let period = criteria
        .period
        .as_deref()
        .and_then(Period::parse)
        .unwrap_or(Period::AllTime);

    if criteria.operator == CriteriaOperator::Top {
        let Some(metric) = Metric::parse(&criteria.metric) else {
            return Err(AppError::Validation(format!(
                "top ranking not supported for metric {}",
                criteria.metric
            )));
        };
        let entries = leaderboard::get_leaderboard(conn, None, period, metric, 0).await?;
        return Ok(top_qualifies(&entries, user_id, criteria.value as usize));
    }

    let (start, end) = period.range(Utc::now());
    let rows = review_metrics::table
        .filter(review_metrics::date.ge(start.date_naive()))
        .filter(review_metrics::date.le(end.date_naive()))
        .filter(review_metrics::user_id.eq(user_id))
        .load::<ReviewMetric>(conn)
        .await?;

    // No metrics in the window: the user cannot qualify.
    let Some(agg) = aggregate_by_user(&rows).remove(&user_id) else {
        return Ok(false);
    };

    let actual = match criteria.metric.as_str() {
        "external_reviews" => {
            let (start, end) = period.range(Utc::now());
            external_reviews_count(conn, user_id, start, end).await? as f64
        }
        other => match metric_value(&agg, other) {
            Some(v) => v,
            None => {
                return Err(AppError::Validation(format!(
                    "unknown criteria metric {other}"
                )))
            }
        },
    };

    Ok(criteria.operator.compare(actual, criteria.value))
}

/// Pull the named value out of a user aggregate.
pub fn metric_value(agg: &UserAggregate, metric: &str) -> Option<f64> {
    match metric {
        "completed_reviews" => Some(agg.completed_reviews as f64),
        "engagement_score" => Some(agg.engagement_score),
        "avg_ttfr" => Some(agg.avg_ttfr),
        "avg_time_to_approval" => Some(agg.avg_time_to_approval),
        "avg_comment_count" => Some(agg.avg_comment_count),
        "avg_comment_length" => Some(agg.avg_comment_length),
        _ => None,
    }
}

/// True when the user ranks at or above N on the already-sorted board.
pub fn top_qualifies(entries: &[Entry], user_id: i64, n: usize) -> bool {
    entries
        .iter()
        .find(|e| e.user_id == user_id)
        .map(|e| e.rank <= n)
        .unwrap_or(false)
}

/// Assignments whose parent review belongs to another team than the
/// assignee, assigned inside the window.
pub async fn external_reviews_count(
    conn: &mut AsyncPgConnection,
    user_id: i64,
    start: chrono::DateTime<Utc>,
    end: chrono::DateTime<Utc>,
) -> Result<i64, AppError> {
    let count: i64 = reviewer_assignments::table
        .inner_join(mr_reviews::table)
        .inner_join(users::table)
        .filter(reviewer_assignments::user_id.eq(user_id))
        .filter(reviewer_assignments::assigned_at.ge(start))
        .filter(reviewer_assignments::assigned_at.le(end))
        .filter(mr_reviews::team.ne(users::team))
        .count()
        .get_result(conn)
        .await?;
    Ok(count)
}

/// Insert the award, relying on the unique (user, badge) constraint to make
/// re-awards silent no-ops. Returns true when a row was actually inserted.
pub async fn award(
    conn: &mut AsyncPgConnection,
    user_id: i64,
    badge_id: i64,
) -> Result<bool, AppError> {
    let inserted = diesel::insert_into(user_badges::table)
        .values((
            user_badges::user_id.eq(user_id),
            user_badges::badge_id.eq(badge_id),
            user_badges::earned_at.eq(Utc::now()),
        ))
        .on_conflict((user_badges::user_id, user_badges::badge_id))
        .do_nothing()
        .execute(conn)
        .await?;
    Ok(inserted > 0)
}

pub async fn has_badge(
    conn: &mut AsyncPgConnection,
    user_id: i64,
    badge_id: i64,
) -> Result<bool, AppError> {
    let count: i64 = user_badges::table
        .filter(user_badges::user_id.eq(user_id))
        .filter(user_badges::badge_id.eq(badge_id))
        .count()
        .get_result(conn)
        .await?;
    Ok(count > 0)
}

// ── Catalog ──

pub async fn list_badges(conn: &mut AsyncPgConnection) -> Result<Vec<Badge>, AppError> {
    let list = badges::table
        .order(badges::name.asc())
        .load::<Badge>(conn)
        .await?;
    Ok(list)
}

pub async fn get_badge(conn: &mut AsyncPgConnection, badge_id: i64) -> Result<Badge, AppError> {
    badges::table
        .find(badge_id)
        .first::<Badge>(conn)
        .await
        .optional()?
        .ok_or(AppError::NotFound("badge"))
}

/// Users holding a badge, earliest earners first.
pub async fn holders(
    conn: &mut AsyncPgConnection,
    badge_id: i64,
    limit: i64,
) -> Result<Vec<User>, AppError> {
    let mut query = user_badges::table
        .inner_join(users::table)
        .filter(user_badges::badge_id.eq(badge_id))
        .order(user_badges::earned_at.asc())
        .select(User::as_select())
        .into_boxed();
    if limit > 0 {
        query = query.limit(limit);
    }
    let list = query.load::<User>(conn).await?;
    Ok(list)
}

pub async fn holders_count(
    conn: &mut AsyncPgConnection,
    badge_id: i64,
) -> Result<i64, AppError> {
    let count: i64 = user_badges::table
        .filter(user_badges::badge_id.eq(badge_id))
        .count()
        .get_result(conn)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agg() -> UserAggregate {
        UserAggregate {
            total_reviews: 4,
            completed_reviews: 3,
            avg_ttfr: 60.0,
            avg_time_to_approval: 240.0,
            avg_comment_count: 2.5,
            avg_comment_length: 300.0,
            engagement_score: 28.0,
        }
    }

    fn entry(user_id: i64, rank: usize) -> Entry {
        Entry {
            user_id,
            username: format!("u{user_id}"),
            team: "frontend".into(),
            completed_reviews: 0,
            avg_ttfr: 0.0,
            avg_comment_count: 0.0,
            engagement_score: 0.0,
            badge_count: 0,
            rank,
        }
    }

    #[test]
    fn metric_values_cover_the_criteria_vocabulary() {
        let a = agg();
        assert_eq!(metric_value(&a, "completed_reviews"), Some(3.0));
        assert_eq!(metric_value(&a, "engagement_score"), Some(28.0));
        assert_eq!(metric_value(&a, "avg_ttfr"), Some(60.0));
        assert_eq!(metric_value(&a, "avg_time_to_approval"), Some(240.0));
        assert_eq!(metric_value(&a, "avg_comment_count"), Some(2.5));
        assert_eq!(metric_value(&a, "avg_comment_length"), Some(300.0));
        assert_eq!(metric_value(&a, "velocity"), None);
    }

    #[test]
    fn speed_demon_criteria_qualifies_fast_reviewers() {
        // avg_ttfr < 120 qualifies a reviewer averaging 60 minutes.
        let criteria = BadgeCriteria {
            metric: "avg_ttfr".into(),
            operator: CriteriaOperator::Lt,
            value: 120.0,
            period: None,
        };
        let actual = metric_value(&agg(), &criteria.metric).unwrap();
        assert!(criteria.operator.compare(actual, criteria.value));
    }

    #[test]
    fn top_ranking_checks_rank_against_n() {
        let entries = vec![entry(1, 1), entry(2, 2), entry(3, 3)];
        assert!(top_qualifies(&entries, 1, 1));
        assert!(top_qualifies(&entries, 2, 3));
        assert!(!top_qualifies(&entries, 3, 2));
    }

    #[test]
    fn users_off_the_board_never_qualify_for_top() {
        let entries = vec![entry(1, 1)];
        assert!(!top_qualifies(&entries, 99, 10));
        assert!(!top_qualifies(&[], 1, 10));
    }
}
