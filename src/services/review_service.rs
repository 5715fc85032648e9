//! MR review and assignment persistence.
//!
//! All mutations are idempotent: upsert by the external (project, iid) key,
//! timestamps set only when null, status updates guarded by a predecessor
//! predicate so at-least-once webhook delivery stays correct.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::models::error::AppError;
use crate::models::review::{
    MrReview, MrStatus, NewMrReview, NewReviewerAssignment, ReviewerAssignment,
};
use crate::models::user::User;
use crate::schema::{mr_reviews, reviewer_assignments, users};

pub async fn get(conn: &mut AsyncPgConnection, id: i64) -> Result<MrReview, AppError> {
    mr_reviews::table
        .find(id)
        .first::<MrReview>(conn)
        .await
        .optional()?
        .ok_or(AppError::NotFound("merge request review"))
}

pub async fn get_by_project_mr(
    conn: &mut AsyncPgConnection,
    project_id: i64,
    mr_iid: i64,
) -> Result<Option<MrReview>, AppError> {
    let review = mr_reviews::table
        .filter(mr_reviews::gitlab_project_id.eq(project_id))
        .filter(mr_reviews::gitlab_mr_iid.eq(mr_iid))
        .first::<MrReview>(conn)
        .await
        .optional()?;
    Ok(review)
}

/// Upsert by the unique (project, iid) key. On conflict only the mutable
/// descriptive fields are refreshed; status, timestamps and bot_comment_id
/// are owned by the lifecycle engine.
pub async fn upsert(
    conn: &mut AsyncPgConnection,
    new: NewMrReview,
) -> Result<MrReview, AppError> {
    let review = diesel::insert_into(mr_reviews::table)
        .values(&new)
        .on_conflict((mr_reviews::gitlab_project_id, mr_reviews::gitlab_mr_iid))
        .do_update()
        .set((
            mr_reviews::mr_url.eq(excluded(mr_reviews::mr_url)),
            mr_reviews::mr_title.eq(excluded(mr_reviews::mr_title)),
            mr_reviews::mr_author_id.eq(excluded(mr_reviews::mr_author_id)),
            mr_reviews::team.eq(excluded(mr_reviews::team)),
            mr_reviews::updated_at.eq(Utc::now()),
        ))
        .get_result::<MrReview>(conn)
        .await?;
    Ok(review)
}

/// Move a review's status, but only from one of the given predecessors.
/// Returns false when the stored status did not match (stale or out-of-order
/// delivery), which the caller logs and ignores.
pub async fn transition_status(
    conn: &mut AsyncPgConnection,
    review_id: i64,
    to: MrStatus,
    from: &[MrStatus],
) -> Result<bool, AppError> {
    let from: Vec<&str> = from.iter().map(|s| s.as_str()).collect();
    let updated = diesel::update(
        mr_reviews::table
            .filter(mr_reviews::id.eq(review_id))
            .filter(mr_reviews::status.eq_any(from)),
    )
    .set((
        mr_reviews::status.eq(to.as_str()),
        mr_reviews::updated_at.eq(Utc::now()),
    ))
    .execute(conn)
    .await?;
    Ok(updated > 0)
}

macro_rules! set_review_instant_if_null {
    ($fn_name:ident, $column:ident) => {
        /// Monotone-set: writes the timestamp only while it is still null.
        pub async fn $fn_name(
            conn: &mut AsyncPgConnection,
            review_id: i64,
            at: DateTime<Utc>,
        ) -> Result<bool, AppError> {
            let updated = diesel::update(
                mr_reviews::table
                    .filter(mr_reviews::id.eq(review_id))
                    .filter(mr_reviews::$column.is_null()),
            )
            .set((
                mr_reviews::$column.eq(at),
                mr_reviews::updated_at.eq(Utc::now()),
            ))
            .execute(conn)
            .await?;
            Ok(updated > 0)
        }
    };
}

set_review_instant_if_null!(set_first_review_at, first_review_at);
set_review_instant_if_null!(set_approved_at, approved_at);
set_review_instant_if_null!(set_merged_at, merged_at);
set_review_instant_if_null!(set_closed_at, closed_at);

/// Stamp who pulled the roulette and when.
pub async fn set_roulette_trigger(
    conn: &mut AsyncPgConnection,
    review_id: i64,
    at: DateTime<Utc>,
    by: i64,
) -> Result<(), AppError> {
    diesel::update(mr_reviews::table.find(review_id))
        .set((
            mr_reviews::roulette_triggered_at.eq(at),
            mr_reviews::roulette_triggered_by.eq(by),
            mr_reviews::updated_at.eq(Utc::now()),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

/// Persist the bot's note id so later runs update the comment in place.
pub async fn set_bot_comment_id(
    conn: &mut AsyncPgConnection,
    review_id: i64,
    note_id: i64,
) -> Result<(), AppError> {
    diesel::update(mr_reviews::table.find(review_id))
        .set((
            mr_reviews::bot_comment_id.eq(note_id),
            mr_reviews::updated_at.eq(Utc::now()),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

// ── Assignments ──

pub async fn assignments_for_review(
    conn: &mut AsyncPgConnection,
    review_id: i64,
) -> Result<Vec<ReviewerAssignment>, AppError> {
    let list = reviewer_assignments::table
        .filter(reviewer_assignments::mr_review_id.eq(review_id))
        .order(reviewer_assignments::id.asc())
        .load::<ReviewerAssignment>(conn)
        .await?;
    Ok(list)
}

/// Assignments for a batch of reviews, grouped by review id.
pub async fn assignments_for_reviews(
    conn: &mut AsyncPgConnection,
    review_ids: &[i64],
) -> Result<HashMap<i64, Vec<ReviewerAssignment>>, AppError> {
    let rows = reviewer_assignments::table
        .filter(reviewer_assignments::mr_review_id.eq_any(review_ids))
        .order(reviewer_assignments::id.asc())
        .load::<ReviewerAssignment>(conn)
        .await?;

    let mut grouped: HashMap<i64, Vec<ReviewerAssignment>> = HashMap::new();
    for row in rows {
        grouped.entry(row.mr_review_id).or_default().push(row);
    }
    Ok(grouped)
}

pub async fn assignment_for_user(
    conn: &mut AsyncPgConnection,
    review_id: i64,
    user_id: i64,
) -> Result<Option<ReviewerAssignment>, AppError> {
    let assignment = reviewer_assignments::table
        .filter(reviewer_assignments::mr_review_id.eq(review_id))
        .filter(reviewer_assignments::user_id.eq(user_id))
        .first::<ReviewerAssignment>(conn)
        .await
        .optional()?;
    Ok(assignment)
}

/// Drop any prior assignments for the review and insert the new set.
/// Runs inside the roulette transaction.
pub async fn replace_assignments(
    conn: &mut AsyncPgConnection,
    review_id: i64,
    new: Vec<NewReviewerAssignment>,
) -> Result<Vec<ReviewerAssignment>, AppError> {
    diesel::delete(
        reviewer_assignments::table.filter(reviewer_assignments::mr_review_id.eq(review_id)),
    )
    .execute(conn)
    .await?;

    let inserted = diesel::insert_into(reviewer_assignments::table)
        .values(&new)
        .get_results::<ReviewerAssignment>(conn)
        .await?;
    Ok(inserted)
}

/// Apply one review comment to an assignment, keyed by the external note id
/// so re-delivered webhooks cannot double-count. Returns false when the note
/// was already seen.
pub async fn record_comment(
    conn: &mut AsyncPgConnection,
    assignment_id: i64,
    note_id: i64,
    byte_len: i64,
    at: DateTime<Utc>,
) -> Result<bool, AppError> {
    let updated = diesel::update(
        reviewer_assignments::table
            .filter(reviewer_assignments::id.eq(assignment_id))
            .filter(
                reviewer_assignments::last_note_id
                    .is_null()
                    .or(reviewer_assignments::last_note_id.lt(note_id)),
            ),
    )
    .set((
        reviewer_assignments::comment_count.eq(reviewer_assignments::comment_count + 1),
        reviewer_assignments::comment_total_length
            .eq(reviewer_assignments::comment_total_length + byte_len),
        reviewer_assignments::last_note_id.eq(note_id),
    ))
    .execute(conn)
    .await?;

    if updated == 0 {
        return Ok(false);
    }

    // First comment stamps the assignment-level timestamp.
    diesel::update(
        reviewer_assignments::table
            .filter(reviewer_assignments::id.eq(assignment_id))
            .filter(reviewer_assignments::first_comment_at.is_null()),
    )
    .set(reviewer_assignments::first_comment_at.eq(at))
    .execute(conn)
    .await?;

    Ok(true)
}

/// Stamp when the reviewer picked the MR up, once.
pub async fn set_started_review_at(
    conn: &mut AsyncPgConnection,
    assignment_id: i64,
    at: DateTime<Utc>,
) -> Result<bool, AppError> {
    let updated = diesel::update(
        reviewer_assignments::table
            .filter(reviewer_assignments::id.eq(assignment_id))
            .filter(reviewer_assignments::started_review_at.is_null()),
    )
    .set(reviewer_assignments::started_review_at.eq(at))
    .execute(conn)
    .await?;
    Ok(updated > 0)
}

/// Stamp the assignment's approval, once.
pub async fn set_assignment_approved_at(
    conn: &mut AsyncPgConnection,
    assignment_id: i64,
    at: DateTime<Utc>,
) -> Result<bool, AppError> {
    let updated = diesel::update(
        reviewer_assignments::table
            .filter(reviewer_assignments::id.eq(assignment_id))
            .filter(reviewer_assignments::approved_at.is_null()),
    )
    .set(reviewer_assignments::approved_at.eq(at))
    .execute(conn)
    .await?;
    Ok(updated > 0)
}

/// On merge, close out every assignment still waiting for an approval.
pub async fn finalize_unapproved_assignments(
    conn: &mut AsyncPgConnection,
    review_id: i64,
    at: DateTime<Utc>,
) -> Result<usize, AppError> {
    let updated = diesel::update(
        reviewer_assignments::table
            .filter(reviewer_assignments::mr_review_id.eq(review_id))
            .filter(reviewer_assignments::approved_at.is_null()),
    )
    .set(reviewer_assignments::approved_at.eq(at))
    .execute(conn)
    .await?;
    Ok(updated)
}

// ── Roulette candidate queries ──

/// Active (pending / in_review / approved) assignment count per user.
pub async fn active_review_counts(
    conn: &mut AsyncPgConnection,
    user_ids: &[i64],
) -> Result<HashMap<i64, i64>, AppError> {
    let rows: Vec<(i64, i64)> = reviewer_assignments::table
        .inner_join(mr_reviews::table)
        .filter(reviewer_assignments::user_id.eq_any(user_ids))
        .filter(mr_reviews::status.eq_any(MrStatus::ACTIVE))
        .group_by(reviewer_assignments::user_id)
        .select((reviewer_assignments::user_id, diesel::dsl::count_star()))
        .load(conn)
        .await?;
    Ok(rows.into_iter().collect())
}

/// Most recent assignment time per user.
pub async fn last_assignment_times(
    conn: &mut AsyncPgConnection,
    user_ids: &[i64],
) -> Result<HashMap<i64, DateTime<Utc>>, AppError> {
    let rows: Vec<(i64, Option<DateTime<Utc>>)> = reviewer_assignments::table
        .filter(reviewer_assignments::user_id.eq_any(user_ids))
        .group_by(reviewer_assignments::user_id)
        .select((
            reviewer_assignments::user_id,
            diesel::dsl::max(reviewer_assignments::assigned_at),
        ))
        .load(conn)
        .await?;
    Ok(rows
        .into_iter()
        .filter_map(|(id, at)| at.map(|at| (id, at)))
        .collect())
}

// ── Aggregation and scheduling queries ──

/// Reviews whose merged_at or closed_at falls inside the window and that
/// reached a terminal status.
pub async fn completed_in_window(
    conn: &mut AsyncPgConnection,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<MrReview>, AppError> {
    let list = mr_reviews::table
        .filter(
            mr_reviews::merged_at
                .ge(start)
                .and(mr_reviews::merged_at.lt(end))
                .or(mr_reviews::closed_at.ge(start).and(mr_reviews::closed_at.lt(end))),
        )
        .filter(mr_reviews::status.eq_any([MrStatus::Merged.as_str(), MrStatus::Closed.as_str()]))
        .load::<MrReview>(conn)
        .await?;
    Ok(list)
}

/// Pending / in_review reviews with their authors, oldest trigger first.
/// Input for the daily reminder.
pub async fn pending_with_authors(
    conn: &mut AsyncPgConnection,
) -> Result<Vec<(MrReview, Option<User>)>, AppError> {
    let list = mr_reviews::table
        .left_join(users::table.on(users::id.nullable().eq(mr_reviews::mr_author_id)))
        .filter(
            mr_reviews::status.eq_any([MrStatus::Pending.as_str(), MrStatus::InReview.as_str()]),
        )
        .order(mr_reviews::roulette_triggered_at.asc())
        .select((
            MrReview::as_select(),
            Option::<User>::as_select(),
        ))
        .load::<(MrReview, Option<User>)>(conn)
        .await?;
    Ok(list)
}
