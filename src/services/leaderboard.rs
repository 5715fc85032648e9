//! Leaderboard and per-user statistics over the denormalized metrics table.

use std::collections::HashMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::Serialize;

use crate::models::badge::Badge;
use crate::models::error::AppError;
use crate::models::metric::ReviewMetric;
use crate::schema::{badges, review_metrics, user_badges, users};
use crate::services::user_service;

/// Rolling query window ending now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Day,
    Week,
    Month,
    Year,
    AllTime,
}

impl Period {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "day" => Some(Period::Day),
            "week" => Some(Period::Week),
            "month" => Some(Period::Month),
            "year" => Some(Period::Year),
            "all_time" => Some(Period::AllTime),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Period::Day => "day",
            Period::Week => "week",
            Period::Month => "month",
            Period::Year => "year",
            Period::AllTime => "all_time",
        }
    }

    /// [start, end] instants for the window. All-time floors at 2000-01-01.
    pub fn range(self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = match self {
            Period::Day => now - Duration::days(1),
            Period::Week => now - Duration::days(7),
            Period::Month => now - Duration::days(30),
            Period::Year => now - Duration::days(365),
            Period::AllTime => Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap(),
        };
        (start, now)
    }
}

/// Ranking metric. Lower is better only for TTFR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    CompletedReviews,
    EngagementScore,
    AvgTtfr,
    AvgCommentCount,
}

impl Metric {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed_reviews" => Some(Metric::CompletedReviews),
            "engagement_score" => Some(Metric::EngagementScore),
            "avg_ttfr" => Some(Metric::AvgTtfr),
            "avg_comment_count" => Some(Metric::AvgCommentCount),
            _ => None,
        }
    }

    /// Unknown metric names fall back to completed reviews.
    pub fn parse_or_default(s: &str) -> Self {
        Self::parse(s).unwrap_or(Metric::CompletedReviews)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::CompletedReviews => "completed_reviews",
            Metric::EngagementScore => "engagement_score",
            Metric::AvgTtfr => "avg_ttfr",
            Metric::AvgCommentCount => "avg_comment_count",
        }
    }
}

/// One leaderboard row.
#[derive(Debug, Clone, Serialize)]
pub struct Entry {
    pub user_id: i64,
    pub username: String,
    pub team: String,
    pub completed_reviews: i64,
    pub avg_ttfr: f64,
    pub avg_comment_count: f64,
    pub engagement_score: f64,
    pub badge_count: i64,
    pub rank: usize,
}

/// Per-user aggregate over the window's metric rows.
#[derive(Debug, Default, Clone, Copy)]
pub struct UserAggregate {
    pub total_reviews: i64,
    pub completed_reviews: i64,
    pub avg_ttfr: f64,
    pub avg_time_to_approval: f64,
    pub avg_comment_count: f64,
    pub avg_comment_length: f64,
    pub engagement_score: f64,
}

/// Fold user-level metric rows into per-user aggregates: sums for counters,
/// means across matching rows for the averages.
pub fn aggregate_by_user(rows: &[ReviewMetric]) -> HashMap<i64, UserAggregate> {
    struct Acc {
        agg: UserAggregate,
        rows: i64,
    }

    let mut accs: HashMap<i64, Acc> = HashMap::new();
    for row in rows {
        let Some(user_id) = row.user_id else { continue };
        let acc = accs.entry(user_id).or_insert(Acc {
            agg: UserAggregate::default(),
            rows: 0,
        });
        acc.rows += 1;
        acc.agg.total_reviews += i64::from(row.total_reviews);
        acc.agg.completed_reviews += i64::from(row.completed_reviews);
        acc.agg.avg_ttfr += row.avg_ttfr.map(f64::from).unwrap_or(0.0);
        acc.agg.avg_time_to_approval += row.avg_time_to_approval.map(f64::from).unwrap_or(0.0);
        acc.agg.avg_comment_count += row.avg_comment_count.unwrap_or(0.0);
        acc.agg.avg_comment_length += row.avg_comment_length.unwrap_or(0.0);
        acc.agg.engagement_score += row.engagement_score.unwrap_or(0.0);
    }

    accs.into_iter()
        .map(|(user_id, acc)| {
            let n = acc.rows as f64;
            let mut agg = acc.agg;
            agg.avg_ttfr /= n;
            agg.avg_time_to_approval /= n;
            agg.avg_comment_count /= n;
            agg.avg_comment_length /= n;
            agg.engagement_score /= n;
            (user_id, agg)
        })
        .collect()
}

/// Sort by the metric (TTFR ascending, everything else descending), assign
/// ranks 1..N, truncate to `limit` when positive.
pub fn rank_entries(mut entries: Vec<Entry>, metric: Metric, limit: i64) -> Vec<Entry> {
    match metric {
        Metric::CompletedReviews => {
            entries.sort_by(|a, b| b.completed_reviews.cmp(&a.completed_reviews))
        }
        Metric::EngagementScore => entries.sort_by(|a, b| {
            b.engagement_score
                .partial_cmp(&a.engagement_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        }),
        Metric::AvgTtfr => entries.sort_by(|a, b| {
            a.avg_ttfr
                .partial_cmp(&b.avg_ttfr)
                .unwrap_or(std::cmp::Ordering::Equal)
        }),
        Metric::AvgCommentCount => entries.sort_by(|a, b| {
            b.avg_comment_count
                .partial_cmp(&a.avg_comment_count)
                .unwrap_or(std::cmp::Ordering::Equal)
        }),
    }

    for (i, entry) in entries.iter_mut().enumerate() {
        entry.rank = i + 1;
    }

    if limit > 0 && entries.len() > limit as usize {
        entries.truncate(limit as usize);
    }
    entries
}

/// Build the leaderboard for an optional team over a period.
pub async fn get_leaderboard(
    conn: &mut AsyncPgConnection,
    team: Option<&str>,
    period: Period,
    metric: Metric,
    limit: i64,
) -> Result<Vec<Entry>, AppError> {
    let (start, end) = period.range(Utc::now());

    let mut query = review_metrics::table
        .filter(review_metrics::date.ge(start.date_naive()))
        .filter(review_metrics::date.le(end.date_naive()))
        .filter(review_metrics::user_id.is_not_null())
        .into_boxed();
    if let Some(team) = team {
        query = query.filter(review_metrics::team.eq(team.to_string()));
    }
    let rows = query.load::<ReviewMetric>(conn).await?;

    let aggregates = aggregate_by_user(&rows);
    if aggregates.is_empty() {
        return Ok(Vec::new());
    }

    let user_ids: Vec<i64> = aggregates.keys().copied().collect();
    let user_rows = users::table
        .filter(users::id.eq_any(&user_ids))
        .load::<crate::models::user::User>(conn)
        .await?;
    let badge_counts = badge_counts_for(conn, &user_ids).await?;

    let mut entries = Vec::with_capacity(user_rows.len());
    for user in user_rows {
        let Some(agg) = aggregates.get(&user.id) else {
            continue;
        };
        entries.push(Entry {
            user_id: user.id,
            username: user.username,
            team: user.team,
            completed_reviews: agg.completed_reviews,
            avg_ttfr: agg.avg_ttfr,
            avg_comment_count: agg.avg_comment_count,
            engagement_score: agg.engagement_score,
            badge_count: badge_counts.get(&user.id).copied().unwrap_or(0),
            rank: 0,
        });
    }

    Ok(rank_entries(entries, metric, limit))
}

/// A user's rank on the global (or team) leaderboard, if they appear.
pub async fn user_rank(
    conn: &mut AsyncPgConnection,
    team: Option<&str>,
    user_id: i64,
    period: Period,
    metric: Metric,
) -> Result<Option<usize>, AppError> {
    let entries = get_leaderboard(conn, team, period, metric, 0).await?;
    Ok(entries.iter().find(|e| e.user_id == user_id).map(|e| e.rank))
}

/// Full user stats payload: aggregates, ranks, and badges.
#[derive(Debug, Serialize)]
pub struct UserStats {
    pub user_id: i64,
    pub username: String,
    pub team: String,
    pub period: &'static str,
    pub total_reviews: i64,
    pub completed_reviews: i64,
    pub avg_ttfr: f64,
    pub avg_time_to_approval: f64,
    pub avg_comment_count: f64,
    pub engagement_score: f64,
    pub badges: Vec<Badge>,
    pub global_rank: usize,
    pub team_rank: usize,
}

pub async fn get_user_stats(
    conn: &mut AsyncPgConnection,
    user_id: i64,
    period: Period,
) -> Result<UserStats, AppError> {
    let user = user_service::get(conn, user_id).await?;
    let (start, end) = period.range(Utc::now());

    let rows = review_metrics::table
        .filter(review_metrics::date.ge(start.date_naive()))
        .filter(review_metrics::date.le(end.date_naive()))
        .filter(review_metrics::user_id.eq(user_id))
        .load::<ReviewMetric>(conn)
        .await?;

    let agg = aggregate_by_user(&rows)
        .remove(&user_id)
        .unwrap_or_default();

    let user_badges = badges_for_user(conn, user_id).await?;

    // Rank failures should not break the stats payload.
    let global_rank = user_rank(conn, None, user_id, period, Metric::EngagementScore)
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(user_id, error = %e, "Failed to compute global rank");
            None
        })
        .unwrap_or(0);
    let team_rank = user_rank(conn, Some(&user.team), user_id, period, Metric::EngagementScore)
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(user_id, error = %e, "Failed to compute team rank");
            None
        })
        .unwrap_or(0);

    Ok(UserStats {
        user_id,
        username: user.username,
        team: user.team,
        period: period.as_str(),
        total_reviews: agg.total_reviews,
        completed_reviews: agg.completed_reviews,
        avg_ttfr: agg.avg_ttfr,
        avg_time_to_approval: agg.avg_time_to_approval,
        avg_comment_count: agg.avg_comment_count,
        engagement_score: agg.engagement_score,
        badges: user_badges,
        global_rank,
        team_rank,
    })
}

/// Badge counts for a batch of users.
async fn badge_counts_for(
    conn: &mut AsyncPgConnection,
    user_ids: &[i64],
) -> Result<HashMap<i64, i64>, AppError> {
    let rows: Vec<(i64, i64)> = user_badges::table
        .filter(user_badges::user_id.eq_any(user_ids))
        .group_by(user_badges::user_id)
        .select((user_badges::user_id, diesel::dsl::count_star()))
        .load(conn)
        .await?;
    Ok(rows.into_iter().collect())
}

/// All badges a user has earned.
pub async fn badges_for_user(
    conn: &mut AsyncPgConnection,
    user_id: i64,
) -> Result<Vec<Badge>, AppError> {
    let list = user_badges::table
        .inner_join(badges::table)
        .filter(user_badges::user_id.eq(user_id))
        .order(user_badges::earned_at.asc())
        .select(Badge::as_select())
        .load::<Badge>(conn)
        .await?;
    Ok(list)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn metric_row(user_id: i64, ttfr: Option<i32>, completed: i32, engagement: f64) -> ReviewMetric {
        ReviewMetric {
            id: 0,
            date: NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            team: "frontend".into(),
            user_id: Some(user_id),
            project_id: Some(100),
            total_reviews: 1,
            completed_reviews: completed,
            avg_ttfr: ttfr,
            avg_time_to_approval: None,
            avg_comment_count: Some(2.0),
            avg_comment_length: Some(100.0),
            engagement_score: Some(engagement),
            created_at: Utc::now(),
        }
    }

    fn entry(user_id: i64, username: &str, ttfr: f64, completed: i64, engagement: f64) -> Entry {
        Entry {
            user_id,
            username: username.into(),
            team: "frontend".into(),
            completed_reviews: completed,
            avg_ttfr: ttfr,
            avg_comment_count: 0.0,
            engagement_score: engagement,
            badge_count: 0,
            rank: 0,
        }
    }

    #[test]
    fn period_parsing_accepts_only_valid_values() {
        assert_eq!(Period::parse("week"), Some(Period::Week));
        assert_eq!(Period::parse("all_time"), Some(Period::AllTime));
        assert_eq!(Period::parse("fortnight"), None);
    }

    #[test]
    fn all_time_floors_at_year_2000() {
        let now = Utc::now();
        let (start, end) = Period::AllTime.range(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(end, now);
    }

    #[test]
    fn unknown_metric_falls_back_to_completed_reviews() {
        assert_eq!(Metric::parse_or_default("bogus"), Metric::CompletedReviews);
        assert_eq!(Metric::parse_or_default("avg_ttfr"), Metric::AvgTtfr);
    }

    #[test]
    fn aggregation_sums_counters_and_averages_the_rest() {
        let rows = vec![
            metric_row(1, Some(60), 1, 20.0),
            metric_row(1, Some(120), 2, 40.0),
            metric_row(2, Some(30), 1, 10.0),
        ];
        let aggs = aggregate_by_user(&rows);

        let u1 = aggs[&1];
        assert_eq!(u1.completed_reviews, 3);
        assert_eq!(u1.avg_ttfr, 90.0);
        assert_eq!(u1.engagement_score, 30.0);

        let u2 = aggs[&2];
        assert_eq!(u2.completed_reviews, 1);
        assert_eq!(u2.avg_ttfr, 30.0);
    }

    #[test]
    fn team_rows_without_user_are_skipped() {
        let mut row = metric_row(1, Some(60), 1, 20.0);
        row.user_id = None;
        assert!(aggregate_by_user(&[row]).is_empty());
    }

    #[test]
    fn ttfr_ranking_is_ascending() {
        // Lower TTFR is faster: 120, 60, 90 -> ranks 3, 1, 2.
        let entries = vec![
            entry(1, "slow", 120.0, 0, 0.0),
            entry(2, "fast", 60.0, 0, 0.0),
            entry(3, "mid", 90.0, 0, 0.0),
        ];
        let ranked = rank_entries(entries, Metric::AvgTtfr, 10);
        assert_eq!(ranked[0].username, "fast");
        assert_eq!(ranked[0].rank, 1);
        assert_eq!(ranked[1].username, "mid");
        assert_eq!(ranked[1].rank, 2);
        assert_eq!(ranked[2].username, "slow");
        assert_eq!(ranked[2].rank, 3);
    }

    #[test]
    fn other_metrics_rank_descending() {
        let entries = vec![
            entry(1, "low", 0.0, 1, 5.0),
            entry(2, "high", 0.0, 9, 50.0),
        ];
        let ranked = rank_entries(entries.clone(), Metric::CompletedReviews, 0);
        assert_eq!(ranked[0].username, "high");

        let ranked = rank_entries(entries, Metric::EngagementScore, 0);
        assert_eq!(ranked[0].username, "high");
    }

    #[test]
    fn ranks_are_unique_and_contiguous_with_zero_limit() {
        let entries: Vec<Entry> = (0..5)
            .map(|i| entry(i, &format!("u{i}"), 0.0, i, i as f64))
            .collect();
        let ranked = rank_entries(entries, Metric::EngagementScore, 0);
        assert_eq!(ranked.len(), 5);
        let ranks: Vec<usize> = ranked.iter().map(|e| e.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3, 4, 5]);
        // A user's rank is 1 + number of strictly better entries.
        for e in &ranked {
            let better = ranked
                .iter()
                .filter(|o| o.engagement_score > e.engagement_score)
                .count();
            assert!(e.rank >= better + 1);
        }
    }

    #[test]
    fn limit_truncates_after_ranking() {
        let entries: Vec<Entry> = (0..5)
            .map(|i| entry(i, &format!("u{i}"), 0.0, i, i as f64))
            .collect();
        let ranked = rank_entries(entries, Metric::CompletedReviews, 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].rank, 1);
        assert_eq!(ranked[1].rank, 2);
    }
}
