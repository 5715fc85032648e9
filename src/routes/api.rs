//! REST API query parsing, validation, and JSON shapes.

use diesel_async::AsyncPgConnection;
use serde::{Deserialize, Serialize};

use crate::models::badge::Badge;
use crate::models::error::AppError;
use crate::services::leaderboard::{self, Entry, Metric, Period, UserStats};
use crate::services::{badges, user_service};

const DEFAULT_LIMIT: i64 = 10;
const MAX_LIMIT: i64 = 1000;

#[derive(Debug, Default, Deserialize)]
pub struct LeaderboardQuery {
    pub period: Option<String>,
    pub metric: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    pub period: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HoldersQuery {
    pub limit: Option<i64>,
}

/// Parse a period parameter; absent means all_time.
pub fn parse_period(raw: Option<&str>) -> Result<Period, AppError> {
    match raw {
        None | Some("") => Ok(Period::AllTime),
        Some(s) => {
            Period::parse(s).ok_or_else(|| AppError::Validation(format!("unknown period {s:?}")))
        }
    }
}

/// Parse a metric parameter; absent means completed_reviews.
pub fn parse_metric(raw: Option<&str>) -> Result<Metric, AppError> {
    match raw {
        None | Some("") => Ok(Metric::CompletedReviews),
        Some(s) => {
            Metric::parse(s).ok_or_else(|| AppError::Validation(format!("unknown metric {s:?}")))
        }
    }
}

/// Validate a limit parameter into 1..=1000.
pub fn parse_limit(raw: Option<i64>) -> Result<i64, AppError> {
    match raw {
        None => Ok(DEFAULT_LIMIT),
        Some(n) if (1..=MAX_LIMIT).contains(&n) => Ok(n),
        Some(n) => Err(AppError::Validation(format!(
            "limit {n} out of range 1..{MAX_LIMIT}"
        ))),
    }
}

pub async fn leaderboard(
    conn: &mut AsyncPgConnection,
    team: Option<&str>,
    query: LeaderboardQuery,
) -> Result<Vec<Entry>, AppError> {
    let period = parse_period(query.period.as_deref())?;
    let metric = parse_metric(query.metric.as_deref())?;
    let limit = parse_limit(query.limit)?;
    leaderboard::get_leaderboard(conn, team, period, metric, limit).await
}

pub async fn user_stats(
    conn: &mut AsyncPgConnection,
    user_id: i64,
    query: StatsQuery,
) -> Result<UserStats, AppError> {
    let period = parse_period(query.period.as_deref())?;
    leaderboard::get_user_stats(conn, user_id, period).await
}

// ── Badge JSON shapes ──

#[derive(Debug, Serialize)]
pub struct BadgeJson {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub icon: String,
    pub criteria: serde_json::Value,
    pub holders: i64,
}

#[derive(Debug, Serialize)]
pub struct UserBadgeJson {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub icon: String,
}

#[derive(Debug, Serialize)]
pub struct BadgeHolderJson {
    pub user_id: i64,
    pub username: String,
    pub team: String,
}

#[derive(Debug, Serialize)]
pub struct BadgeHoldersJson {
    pub badge: UserBadgeJson,
    pub holders: Vec<BadgeHolderJson>,
}

fn badge_summary(badge: &Badge) -> UserBadgeJson {
    UserBadgeJson {
        id: badge.id,
        name: badge.name.clone(),
        description: badge.description.clone(),
        icon: badge.icon.clone(),
    }
}

pub async fn list_badges(conn: &mut AsyncPgConnection) -> Result<Vec<BadgeJson>, AppError> {
    let catalog = badges::list_badges(conn).await?;
    let mut out = Vec::with_capacity(catalog.len());
    for badge in catalog {
        let holders = badges::holders_count(conn, badge.id).await?;
        out.push(BadgeJson {
            id: badge.id,
            name: badge.name,
            description: badge.description,
            icon: badge.icon,
            criteria: badge.criteria,
            holders,
        });
    }
    Ok(out)
}

pub async fn get_badge(conn: &mut AsyncPgConnection, badge_id: i64) -> Result<BadgeJson, AppError> {
    let badge = badges::get_badge(conn, badge_id).await?;
    let holders = badges::holders_count(conn, badge.id).await?;
    Ok(BadgeJson {
        id: badge.id,
        name: badge.name,
        description: badge.description,
        icon: badge.icon,
        criteria: badge.criteria,
        holders,
    })
}

pub async fn badge_holders(
    conn: &mut AsyncPgConnection,
    badge_id: i64,
    query: HoldersQuery,
) -> Result<BadgeHoldersJson, AppError> {
    let limit = parse_limit(query.limit)?;
    let badge = badges::get_badge(conn, badge_id).await?;
    let holders = badges::holders(conn, badge_id, limit).await?;
    Ok(BadgeHoldersJson {
        badge: badge_summary(&badge),
        holders: holders
            .into_iter()
            .map(|u| BadgeHolderJson {
                user_id: u.id,
                username: u.username,
                team: u.team,
            })
            .collect(),
    })
}

pub async fn user_badges(
    conn: &mut AsyncPgConnection,
    user_id: i64,
) -> Result<Vec<UserBadgeJson>, AppError> {
    // 404 on unknown users rather than an empty list.
    user_service::get(conn, user_id).await?;
    let list = leaderboard::badges_for_user(conn, user_id).await?;
    Ok(list.iter().map(badge_summary).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_defaults_to_all_time() {
        assert_eq!(parse_period(None).unwrap(), Period::AllTime);
        assert_eq!(parse_period(Some("")).unwrap(), Period::AllTime);
        assert_eq!(parse_period(Some("week")).unwrap(), Period::Week);
    }

    #[test]
    fn unknown_period_is_a_validation_error() {
        let err = parse_period(Some("quarter")).unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn metric_defaults_to_completed_reviews() {
        assert_eq!(parse_metric(None).unwrap(), Metric::CompletedReviews);
        assert_eq!(parse_metric(Some("avg_ttfr")).unwrap(), Metric::AvgTtfr);
        assert!(parse_metric(Some("velocity")).is_err());
    }

    #[test]
    fn limit_bounds_are_enforced() {
        assert_eq!(parse_limit(None).unwrap(), DEFAULT_LIMIT);
        assert_eq!(parse_limit(Some(1)).unwrap(), 1);
        assert_eq!(parse_limit(Some(1000)).unwrap(), 1000);
        assert!(parse_limit(Some(0)).is_err());
        assert!(parse_limit(Some(1001)).is_err());
        assert!(parse_limit(Some(-5)).is_err());
    }
}
