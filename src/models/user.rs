//! users + ooo_status — GitLab users and their out-of-office windows.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::{ooo_status, users};

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = users)]
pub struct User {
    pub id: i64,
    pub gitlab_id: i64,
    pub username: String,
    pub email: String,
    pub role: String,
    pub team: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub gitlab_id: i64,
    pub username: String,
    pub email: String,
    pub role: String,
    pub team: String,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = ooo_status)]
pub struct OooWindow {
    pub id: i64,
    pub user_id: i64,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = ooo_status)]
pub struct NewOooWindow {
    pub user_id: i64,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub reason: String,
}

impl OooWindow {
    /// A user is out-of-office iff now falls inside the inclusive window.
    pub fn covers(&self, now: DateTime<Utc>) -> bool {
        now >= self.start_date && now <= self.end_date
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn window(start: i64, end: i64) -> OooWindow {
        OooWindow {
            id: 1,
            user_id: 1,
            start_date: Utc.timestamp_opt(start, 0).unwrap(),
            end_date: Utc.timestamp_opt(end, 0).unwrap(),
            reason: String::new(),
            created_at: Utc.timestamp_opt(0, 0).unwrap(),
        }
    }

    #[test]
    fn ooo_window_is_inclusive_on_both_ends() {
        let w = window(100, 200);
        assert!(w.covers(Utc.timestamp_opt(100, 0).unwrap()));
        assert!(w.covers(Utc.timestamp_opt(150, 0).unwrap()));
        assert!(w.covers(Utc.timestamp_opt(200, 0).unwrap()));
        assert!(!w.covers(Utc.timestamp_opt(99, 0).unwrap()));
        assert!(!w.covers(Utc.timestamp_opt(201, 0).unwrap()));
    }
}
