//! mr_reviews + reviewer_assignments — review lifecycle state and the
//! per-reviewer engagement counters everything downstream is derived from.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::{mr_reviews, reviewer_assignments};

/// MR review status. Stored as a varchar; transitions are validated by the
/// lifecycle engine before any update is issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MrStatus {
    Pending,
    InReview,
    Approved,
    Merged,
    Closed,
}

impl MrStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MrStatus::Pending => "pending",
            MrStatus::InReview => "in_review",
            MrStatus::Approved => "approved",
            MrStatus::Merged => "merged",
            MrStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MrStatus::Pending),
            "in_review" => Some(MrStatus::InReview),
            "approved" => Some(MrStatus::Approved),
            "merged" => Some(MrStatus::Merged),
            "closed" => Some(MrStatus::Closed),
            _ => None,
        }
    }

    /// Merged and closed are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, MrStatus::Merged | MrStatus::Closed)
    }

    /// Statuses that count as an active review for reviewer load.
    pub const ACTIVE: [&'static str; 3] = ["pending", "in_review", "approved"];
}

/// Reviewer slot filled by the roulette.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewerRole {
    Codeowner,
    TeamMember,
    External,
}

impl ReviewerRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewerRole::Codeowner => "codeowner",
            ReviewerRole::TeamMember => "team_member",
            ReviewerRole::External => "external",
        }
    }

    pub const ALL: [ReviewerRole; 3] = [
        ReviewerRole::Codeowner,
        ReviewerRole::TeamMember,
        ReviewerRole::External,
    ];
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = mr_reviews)]
pub struct MrReview {
    pub id: i64,
    pub gitlab_project_id: i64,
    pub gitlab_mr_iid: i64,
    pub mr_url: String,
    pub mr_title: String,
    pub mr_author_id: Option<i64>,
    pub team: String,
    pub roulette_triggered_at: Option<DateTime<Utc>>,
    pub roulette_triggered_by: Option<i64>,
    pub first_review_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub status: String,
    pub bot_comment_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MrReview {
    pub fn status(&self) -> Option<MrStatus> {
        MrStatus::parse(&self.status)
    }

    /// Time to first review in seconds, clamped at zero. None until both
    /// endpoints exist.
    pub fn ttfr_seconds(&self) -> Option<i64> {
        interval_seconds(self.roulette_triggered_at, self.first_review_at)
    }

    /// Trigger-to-approval in seconds, clamped at zero.
    pub fn time_to_approval_seconds(&self) -> Option<i64> {
        interval_seconds(self.roulette_triggered_at, self.approved_at)
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = mr_reviews)]
pub struct NewMrReview {
    pub gitlab_project_id: i64,
    pub gitlab_mr_iid: i64,
    pub mr_url: String,
    pub mr_title: String,
    pub mr_author_id: Option<i64>,
    pub team: String,
    pub status: String,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = reviewer_assignments)]
pub struct ReviewerAssignment {
    pub id: i64,
    pub mr_review_id: i64,
    pub user_id: i64,
    pub role: String,
    pub assigned_at: DateTime<Utc>,
    pub started_review_at: Option<DateTime<Utc>>,
    pub first_comment_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub comment_count: i32,
    pub comment_total_length: i64,
    pub last_note_id: Option<i64>,
}

impl ReviewerAssignment {
    /// Per-assignment engagement score: comment_count * 10 + length / 100.
    pub fn engagement_score(&self) -> f64 {
        f64::from(self.comment_count) * 10.0 + self.comment_total_length as f64 / 100.0
    }

    /// Assignment-to-first-comment in seconds, clamped at zero.
    pub fn ttfr_seconds(&self) -> Option<i64> {
        interval_seconds(Some(self.assigned_at), self.first_comment_at)
    }

    /// Assignment-to-approval in seconds, clamped at zero.
    pub fn time_to_approval_seconds(&self) -> Option<i64> {
        interval_seconds(Some(self.assigned_at), self.approved_at)
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = reviewer_assignments)]
pub struct NewReviewerAssignment {
    pub mr_review_id: i64,
    pub user_id: i64,
    pub role: String,
    pub assigned_at: DateTime<Utc>,
}

/// Seconds between two optional instants. Clock skew can make the raw
/// difference negative; it is clamped to zero here, the stored timestamps
/// are never rewritten.
fn interval_seconds(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Option<i64> {
    match (start, end) {
        (Some(s), Some(e)) => Some((e - s).num_seconds().max(0)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn interval_requires_both_endpoints() {
        assert_eq!(interval_seconds(Some(at(10)), None), None);
        assert_eq!(interval_seconds(None, Some(at(10))), None);
        assert_eq!(interval_seconds(Some(at(10)), Some(at(70))), Some(60));
    }

    #[test]
    fn interval_clamps_clock_skew_to_zero() {
        assert_eq!(interval_seconds(Some(at(100)), Some(at(40))), Some(0));
    }

    #[test]
    fn engagement_score_formula() {
        let a = ReviewerAssignment {
            id: 1,
            mr_review_id: 1,
            user_id: 1,
            role: "team_member".into(),
            assigned_at: at(0),
            started_review_at: None,
            first_comment_at: None,
            approved_at: None,
            comment_count: 5,
            comment_total_length: 500,
            last_note_id: None,
        };
        assert_eq!(a.engagement_score(), 55.0);
    }

    #[test]
    fn status_round_trips() {
        for s in ["pending", "in_review", "approved", "merged", "closed"] {
            assert_eq!(MrStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(MrStatus::parse("bogus").is_none());
    }

    #[test]
    fn terminal_statuses() {
        assert!(MrStatus::Merged.is_terminal());
        assert!(MrStatus::Closed.is_terminal());
        assert!(!MrStatus::Approved.is_terminal());
    }
}
