//! badges + user_badges — gamification catalog and at-most-once awards.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::error::AppError;
use crate::schema::{badges, user_badges};

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = badges)]
pub struct Badge {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub icon: String,
    pub criteria: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Badge {
    pub fn parsed_criteria(&self) -> Result<BadgeCriteria, AppError> {
        serde_json::from_value(self.criteria.clone()).map_err(|e| {
            AppError::Validation(format!("badge {} has malformed criteria: {e}", self.name))
        })
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = badges)]
pub struct NewBadge {
    pub name: String,
    pub description: String,
    pub icon: String,
    pub criteria: serde_json::Value,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = user_badges)]
pub struct UserBadge {
    pub id: i64,
    pub user_id: i64,
    pub badge_id: i64,
    pub earned_at: DateTime<Utc>,
}

/// Comparison operator of the criteria DSL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CriteriaOperator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "top")]
    Top,
}

impl CriteriaOperator {
    /// Compare an aggregated metric value against the threshold. `Top` is
    /// ranking-based and handled by the evaluator, not here.
    pub fn compare(self, actual: f64, threshold: f64) -> bool {
        match self {
            CriteriaOperator::Lt => actual < threshold,
            CriteriaOperator::Le => actual <= threshold,
            CriteriaOperator::Gt => actual > threshold,
            CriteriaOperator::Ge => actual >= threshold,
            CriteriaOperator::Eq => actual == threshold,
            CriteriaOperator::Top => false,
        }
    }
}

/// Criteria DSL embedded in each badge row as JSON:
/// `{ "metric": "avg_ttfr", "operator": "<", "value": 120, "period": "month" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadgeCriteria {
    pub metric: String,
    pub operator: CriteriaOperator,
    pub value: f64,
    #[serde(default)]
    pub period: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn criteria_parses_from_json() {
        let c: BadgeCriteria = serde_json::from_value(serde_json::json!({
            "metric": "avg_ttfr",
            "operator": "<",
            "value": 120,
        }))
        .unwrap();
        assert_eq!(c.metric, "avg_ttfr");
        assert_eq!(c.operator, CriteriaOperator::Lt);
        assert_eq!(c.value, 120.0);
        assert!(c.period.is_none());
    }

    #[test]
    fn criteria_parses_top_operator_with_period() {
        let c: BadgeCriteria = serde_json::from_value(serde_json::json!({
            "metric": "engagement_score",
            "operator": "top",
            "value": 3,
            "period": "month",
        }))
        .unwrap();
        assert_eq!(c.operator, CriteriaOperator::Top);
        assert_eq!(c.period.as_deref(), Some("month"));
    }

    #[test]
    fn criteria_rejects_unknown_operator() {
        let res: Result<BadgeCriteria, _> = serde_json::from_value(serde_json::json!({
            "metric": "avg_ttfr",
            "operator": "!=",
            "value": 1,
        }));
        assert!(res.is_err());
    }

    #[test]
    fn operators_compare() {
        assert!(CriteriaOperator::Lt.compare(60.0, 120.0));
        assert!(!CriteriaOperator::Lt.compare(120.0, 120.0));
        assert!(CriteriaOperator::Le.compare(120.0, 120.0));
        assert!(CriteriaOperator::Gt.compare(5.0, 3.0));
        assert!(CriteriaOperator::Ge.compare(3.0, 3.0));
        assert!(CriteriaOperator::Eq.compare(3.0, 3.0));
        assert!(!CriteriaOperator::Top.compare(1.0, 3.0));
    }
}
