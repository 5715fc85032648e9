//! Review lifecycle engine — webhook ingestion, dedupe, state transitions,
//! timestamp capture.
//!
//! Webhook delivery is at-least-once, so every mutation here is idempotent:
//! reviews are upserted by their external key, timestamps are written only
//! while null, status moves only from a valid predecessor, and comment
//! counters are keyed by the external note id. Mutations for one event run
//! in a single transaction; persistence failures bubble up so GitLab
//! retries delivery.

use chrono::{DateTime, Duration, Utc};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection};

use crate::cache::{roulette_lock_key, Cache};
use crate::events::{MergeRequestEvent, MrAction, NoteEvent};
use crate::models::error::AppError;
use crate::models::review::{MrReview, MrStatus, NewMrReview};
use crate::models::user::User;
use crate::services::gitlab::GitLabClient;
use crate::services::notifier::Notifier;
use crate::services::{review_service, roulette, user_service};

/// TTL of the per-MR roulette lock.
const ROULETTE_LOCK_TTL: std::time::Duration = std::time::Duration::from_secs(30);

/// Minimum age of a prior trigger before `force` re-rolls.
const FORCE_COOLDOWN: Duration = Duration::hours(1);

/// Minimum age of a stale MR before the daily reminder mentions it.
pub const REMINDER_MIN_AGE: Duration = Duration::hours(4);

/// Valid predecessors per target status. A transition from anywhere else is
/// ignored (stale or out-of-order delivery).
pub fn valid_predecessors(to: MrStatus) -> &'static [MrStatus] {
    match to {
        MrStatus::Pending => &[],
        MrStatus::InReview => &[MrStatus::Pending],
        MrStatus::Approved => &[MrStatus::Pending, MrStatus::InReview],
        MrStatus::Merged | MrStatus::Closed => {
            &[MrStatus::Pending, MrStatus::InReview, MrStatus::Approved]
        }
    }
}

/// The status a lifecycle action drives toward, if any. `open`/`update`
/// only refresh descriptive fields.
pub fn target_status(action: MrAction) -> Option<MrStatus> {
    match action {
        MrAction::Open | MrAction::Reopen | MrAction::Update | MrAction::Other => None,
        MrAction::Approve => Some(MrStatus::Approved),
        MrAction::Merge => Some(MrStatus::Merged),
        MrAction::Close => Some(MrStatus::Closed),
    }
}

/// Ingest a merge_request webhook event.
pub async fn ingest_merge_request_event(
    conn: &mut AsyncPgConnection,
    evt: &MergeRequestEvent,
) -> Result<(), AppError> {
    let now = Utc::now();
    let attrs = &evt.object_attributes;

    // Resolve the author to a local user; unknown authors stay null.
    let author = match attrs.author_id {
        Some(gitlab_id) => user_service::find_by_gitlab_id(conn, gitlab_id).await?,
        None => None,
    };

    // Lazy creation: the first event naming this (project, mr) creates the
    // row. The upsert also refreshes title/URL/author on update events.
    let review = review_service::upsert(
        conn,
        NewMrReview {
            gitlab_project_id: evt.project_id(),
            gitlab_mr_iid: evt.mr_iid(),
            mr_url: attrs.url.clone(),
            mr_title: attrs.title.clone(),
            mr_author_id: author.as_ref().map(|u| u.id),
            team: author.as_ref().map(|u| u.team.clone()).unwrap_or_default(),
            status: MrStatus::Pending.as_str().to_string(),
        },
    )
    .await?;

    let Some(to) = target_status(attrs.action) else {
        tracing::debug!(
            project_id = evt.project_id(),
            mr_iid = evt.mr_iid(),
            action = ?attrs.action,
            "Review refreshed"
        );
        return Ok(());
    };

    let action = attrs.action;
    let actor_gitlab_id = evt.user.id;
    conn.transaction::<_, AppError, _>(|conn| {
        let review = review.clone();
        async move { apply_lifecycle_action(conn, &review, action, to, actor_gitlab_id, now).await }
            .scope_boxed()
    })
    .await
}

/// Apply one approve/merge/close action inside a transaction.
async fn apply_lifecycle_action(
    conn: &mut AsyncPgConnection,
    review: &MrReview,
    action: MrAction,
    to: MrStatus,
    actor_gitlab_id: i64,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    match to {
        MrStatus::Approved => {
            review_service::set_approved_at(conn, review.id, now).await?;
            let moved =
                review_service::transition_status(conn, review.id, to, valid_predecessors(to))
                    .await?;
            if moved {
                let fresh = review_service::get(conn, review.id).await?;
                if let Some(secs) = fresh.time_to_approval_seconds() {
                    crate::metrics::observe_time_to_approval(&review.team, secs as f64);
                }
            } else {
                warn_ignored(review, action);
            }

            // The approver's own assignment gets its approval stamped too.
            if let Some(assignment) = assignment_for_actor(conn, review, actor_gitlab_id).await? {
                review_service::set_assignment_approved_at(conn, assignment, now).await?;
            }
        }
        MrStatus::Merged => {
            review_service::set_merged_at(conn, review.id, now).await?;
            let moved =
                review_service::transition_status(conn, review.id, to, valid_predecessors(to))
                    .await?;
            if moved {
                review_service::finalize_unapproved_assignments(conn, review.id, now).await?;
                record_completion_metrics(conn, review).await?;
            } else {
                warn_ignored(review, action);
            }
        }
        MrStatus::Closed => {
            review_service::set_closed_at(conn, review.id, now).await?;
            let moved =
                review_service::transition_status(conn, review.id, to, valid_predecessors(to))
                    .await?;
            if moved {
                crate::metrics::review_abandoned(&review.team);
            } else {
                warn_ignored(review, action);
            }
        }
        _ => {}
    }
    Ok(())
}

/// Ingest a note webhook event: either a `/roulette` command or a review
/// comment feeding engagement metrics.
pub async fn ingest_note_event(
    conn: &mut AsyncPgConnection,
    cache: &Cache,
    gitlab: &dyn GitLabClient,
    notifier: &dyn Notifier,
    bot_username: &str,
    evt: &NoteEvent,
) -> Result<(), AppError> {
    let Some(mr_iid) = evt.mr_iid() else {
        return Ok(());
    };

    // The bot's own notes never count for anything.
    if evt.user.username == bot_username {
        return Ok(());
    }

    if let Some(cmd) = evt.roulette_command() {
        return handle_roulette_command(conn, cache, gitlab, notifier, evt, mr_iid, cmd.force)
            .await;
    }

    handle_review_comment(conn, evt, mr_iid).await
}

async fn handle_roulette_command(
    conn: &mut AsyncPgConnection,
    cache: &Cache,
    gitlab: &dyn GitLabClient,
    notifier: &dyn Notifier,
    evt: &NoteEvent,
    mr_iid: i64,
    force: bool,
) -> Result<(), AppError> {
    let project_id = evt.project_id();

    let Some(actor) = user_service::find_by_gitlab_id(conn, evt.user.id).await? else {
        tracing::warn!(
            username = %evt.user.username,
            "Roulette requested by unknown user, ignoring"
        );
        crate::metrics::roulette_trigger("unknown", "rejected");
        return Ok(());
    };

    // One worker at a time per MR; losing the race means another replica is
    // already on it.
    let lock = roulette_lock_key(project_id, mr_iid);
    if !cache.acquire_lock(&lock, ROULETTE_LOCK_TTL).await? {
        tracing::debug!(project_id, mr_iid, "Roulette lock held elsewhere, skipping");
        return Ok(());
    }

    let result =
        run_locked_roulette(conn, cache, gitlab, notifier, evt, &actor, mr_iid, force).await;
    // TTL would reclaim the lock anyway; releasing keeps re-rolls snappy.
    let _ = cache.release_lock(&lock).await;
    result
}

async fn run_locked_roulette(
    conn: &mut AsyncPgConnection,
    cache: &Cache,
    gitlab: &dyn GitLabClient,
    notifier: &dyn Notifier,
    evt: &NoteEvent,
    actor: &User,
    mr_iid: i64,
    force: bool,
) -> Result<(), AppError> {
    let project_id = evt.project_id();
    let mr = evt.merge_request.as_ref();

    let author = match mr.and_then(|m| m.author_id) {
        Some(gitlab_id) => user_service::find_by_gitlab_id(conn, gitlab_id).await?,
        None => None,
    };

    // Lazy creation, then re-load inside the lock so the trigger check sees
    // the latest state.
    review_service::upsert(
        conn,
        NewMrReview {
            gitlab_project_id: project_id,
            gitlab_mr_iid: mr_iid,
            mr_url: mr.map(|m| m.url.clone()).unwrap_or_default(),
            mr_title: mr.map(|m| m.title.clone()).unwrap_or_default(),
            mr_author_id: author.as_ref().map(|u| u.id),
            team: author
                .as_ref()
                .map(|u| u.team.clone())
                .unwrap_or_else(|| actor.team.clone()),
            status: MrStatus::Pending.as_str().to_string(),
        },
    )
    .await?;

    let review = review_service::get_by_project_mr(conn, project_id, mr_iid)
        .await?
        .ok_or(AppError::NotFound("merge request review"))?;

    if !roulette_allowed(&review, force, Utc::now()) {
        tracing::info!(
            project_id,
            mr_iid,
            force,
            "Roulette already triggered recently, ignoring"
        );
        crate::metrics::roulette_trigger(&review.team, "ignored");
        return Ok(());
    }

    roulette::run_roulette(conn, cache, gitlab, notifier, &review, actor).await?;
    Ok(())
}

/// A roulette runs when the MR has never been triggered, or on `force` once
/// the previous trigger is over an hour old.
pub fn roulette_allowed(review: &MrReview, force: bool, now: DateTime<Utc>) -> bool {
    match review.roulette_triggered_at {
        None => true,
        Some(prev) => force && now - prev > FORCE_COOLDOWN,
    }
}

async fn handle_review_comment(
    conn: &mut AsyncPgConnection,
    evt: &NoteEvent,
    mr_iid: i64,
) -> Result<(), AppError> {
    let Some(review) =
        review_service::get_by_project_mr(conn, evt.project_id(), mr_iid).await?
    else {
        return Ok(());
    };

    let Some(user) = user_service::find_by_gitlab_id(conn, evt.user.id).await? else {
        return Ok(());
    };

    let Some(assignment) = review_service::assignment_for_user(conn, review.id, user.id).await?
    else {
        return Ok(());
    };

    let now = Utc::now();
    let note_id = evt.object_attributes.id;
    let system = evt.object_attributes.system;
    let body = evt.object_attributes.note.clone();
    let assignment_id = assignment.id;

    conn.transaction::<_, AppError, _>(|conn| {
        let review = review.clone();
        async move {
            if system {
                // System notes carry no engagement; the review-start marker
                // stamps when the reviewer picked the MR up.
                if is_review_start_note(&body) {
                    review_service::set_started_review_at(conn, assignment_id, now).await?;
                }
                return Ok(());
            }

            let recorded = review_service::record_comment(
                conn,
                assignment_id,
                note_id,
                body.len() as i64,
                now,
            )
            .await?;

            if !recorded {
                tracing::debug!(note_id, assignment_id, "Note already counted, skipping");
                return Ok(());
            }

            let first = review_service::set_first_review_at(conn, review.id, now).await?;
            review_service::transition_status(
                conn,
                review.id,
                MrStatus::InReview,
                valid_predecessors(MrStatus::InReview),
            )
            .await?;

            if first {
                let fresh = review_service::get(conn, review.id).await?;
                if let Some(secs) = fresh.ttfr_seconds() {
                    crate::metrics::observe_ttfr(&review.team, secs as f64);
                }
            }

            Ok(())
        }
        .scope_boxed()
    })
    .await
}

/// System note bodies that mark the reviewer starting on the MR.
pub fn is_review_start_note(body: &str) -> bool {
    let body = body.to_lowercase();
    body.contains("started a review") || body.contains("requested review")
}

fn warn_ignored(review: &MrReview, action: MrAction) {
    tracing::warn!(
        review_id = review.id,
        status = %review.status,
        action = ?action,
        "Ignoring invalid lifecycle transition"
    );
}

async fn assignment_for_actor(
    conn: &mut AsyncPgConnection,
    review: &MrReview,
    actor_gitlab_id: i64,
) -> Result<Option<i64>, AppError> {
    let Some(user) = user_service::find_by_gitlab_id(conn, actor_gitlab_id).await? else {
        return Ok(None);
    };
    Ok(review_service::assignment_for_user(conn, review.id, user.id)
        .await?
        .map(|a| a.id))
}

/// Emit completion counters and engagement histograms for a merged review.
async fn record_completion_metrics(
    conn: &mut AsyncPgConnection,
    review: &MrReview,
) -> Result<(), AppError> {
    let assignments = review_service::assignments_for_review(conn, review.id).await?;
    let mut comment_count = 0i64;
    let mut comment_length = 0i64;

    for assignment in &assignments {
        comment_count += i64::from(assignment.comment_count);
        comment_length += assignment.comment_total_length;

        if let Ok(user) = user_service::get(conn, assignment.user_id).await {
            crate::metrics::review_completed(&review.team, &user.username, &assignment.role);
            crate::metrics::observe_engagement_score(
                &review.team,
                &user.username,
                assignment.engagement_score(),
            );
        }
    }

    crate::metrics::observe_comment_count(&review.team, comment_count as f64);
    crate::metrics::observe_comment_length(&review.team, comment_length as f64);
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn review_with_trigger(triggered_at: Option<DateTime<Utc>>) -> MrReview {
        MrReview {
            id: 1,
            gitlab_project_id: 100,
            gitlab_mr_iid: 1,
            mr_url: String::new(),
            mr_title: String::new(),
            mr_author_id: None,
            team: "frontend".into(),
            roulette_triggered_at: triggered_at,
            roulette_triggered_by: None,
            first_review_at: None,
            approved_at: None,
            merged_at: None,
            closed_at: None,
            status: "pending".into(),
            bot_comment_id: None,
            created_at: Utc.timestamp_opt(0, 0).unwrap(),
            updated_at: Utc.timestamp_opt(0, 0).unwrap(),
        }
    }

    #[test]
    fn transitions_follow_the_state_machine() {
        use MrStatus::*;
        assert_eq!(valid_predecessors(InReview), &[Pending]);
        assert_eq!(valid_predecessors(Approved), &[Pending, InReview]);
        assert_eq!(valid_predecessors(Merged), &[Pending, InReview, Approved]);
        assert_eq!(valid_predecessors(Closed), &[Pending, InReview, Approved]);
    }

    #[test]
    fn terminal_states_have_no_successors() {
        use MrStatus::*;
        for target in [InReview, Approved, Merged, Closed] {
            assert!(!valid_predecessors(target).contains(&Merged));
            assert!(!valid_predecessors(target).contains(&Closed));
        }
    }

    #[test]
    fn final_status_depends_only_on_terminal_event() {
        // Whatever intermediate statuses were reached, merge always lands on
        // merged and close on closed, because every non-terminal status is a
        // valid predecessor of both.
        use MrStatus::*;
        for intermediate in [Pending, InReview, Approved] {
            assert!(valid_predecessors(Merged).contains(&intermediate));
            assert!(valid_predecessors(Closed).contains(&intermediate));
        }
    }

    #[test]
    fn open_and_update_do_not_change_status() {
        assert_eq!(target_status(MrAction::Open), None);
        assert_eq!(target_status(MrAction::Reopen), None);
        assert_eq!(target_status(MrAction::Update), None);
        assert_eq!(target_status(MrAction::Other), None);
        assert_eq!(target_status(MrAction::Approve), Some(MrStatus::Approved));
        assert_eq!(target_status(MrAction::Merge), Some(MrStatus::Merged));
        assert_eq!(target_status(MrAction::Close), Some(MrStatus::Closed));
    }

    #[test]
    fn first_roulette_is_always_allowed() {
        let review = review_with_trigger(None);
        let now = Utc::now();
        assert!(roulette_allowed(&review, false, now));
        assert!(roulette_allowed(&review, true, now));
    }

    #[test]
    fn repeat_roulette_without_force_is_ignored() {
        let now = Utc::now();
        let review = review_with_trigger(Some(now - Duration::hours(2)));
        assert!(!roulette_allowed(&review, false, now));
    }

    #[test]
    fn force_respects_the_cooldown() {
        let now = Utc::now();
        let recent = review_with_trigger(Some(now - Duration::minutes(30)));
        assert!(!roulette_allowed(&recent, true, now));

        let old = review_with_trigger(Some(now - Duration::hours(2)));
        assert!(roulette_allowed(&old, true, now));
    }

    #[test]
    fn review_start_markers() {
        assert!(is_review_start_note("requested review from @carol"));
        assert!(is_review_start_note("Carol started a review"));
        assert!(!is_review_start_note("looks good to me"));
    }
}
