//! review_metrics — one row per (date, team, user?, project?), written by the
//! daily aggregator and read by the leaderboard and badge evaluator.

use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use serde::Serialize;

use crate::schema::review_metrics;

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = review_metrics)]
pub struct ReviewMetric {
    pub id: i64,
    pub date: NaiveDate,
    pub team: String,
    pub user_id: Option<i64>,
    pub project_id: Option<i64>,
    pub total_reviews: i32,
    pub completed_reviews: i32,
    pub avg_ttfr: Option<i32>,
    pub avg_time_to_approval: Option<i32>,
    pub avg_comment_count: Option<f64>,
    pub avg_comment_length: Option<f64>,
    pub engagement_score: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Upsert payload. The (date, team, user_id, project_id) tuple is the
/// conflict key, nulls included, so re-running a day replaces its rows.
#[derive(Debug, Clone, PartialEq, Insertable, AsChangeset)]
#[diesel(table_name = review_metrics)]
#[diesel(treat_none_as_null = true)]
pub struct NewReviewMetric {
    pub date: NaiveDate,
    pub team: String,
    pub user_id: Option<i64>,
    pub project_id: Option<i64>,
    pub total_reviews: i32,
    pub completed_reviews: i32,
    pub avg_ttfr: Option<i32>,
    pub avg_time_to_approval: Option<i32>,
    pub avg_comment_count: Option<f64>,
    pub avg_comment_length: Option<f64>,
    pub engagement_score: Option<f64>,
}
