//! Roulette selector — picks one code-owner, one same-team member, and one
//! cross-team reviewer with weighted scoring over load, recency, and
//! expertise.
//!
//! Selection is deterministic for a fixed snapshot of inputs; unfillable
//! slots are dropped, never fatal. The database commit happens first; the
//! bot comment and chat notification follow and are retried on the next
//! `/roulette force` if they fail.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection};
use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::cache::Cache;
use crate::models::error::AppError;
use crate::models::review::{MrReview, NewReviewerAssignment, ReviewerAssignment, ReviewerRole};
use crate::models::user::User;
use crate::services::config_service::{self, RouletteWeights};
use crate::services::gitlab::GitLabClient;
use crate::services::notifier::{Notifier, RoulettePick};
use crate::services::{availability, review_service, user_service};

/// One scored contender for a reviewer slot.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub user: User,
    pub active_reviews: i64,
    pub last_assigned_at: Option<DateTime<Utc>>,
    pub expertise_match: bool,
}

/// Outcome of a roulette run: the inserted assignments and any slots that
/// could not be filled.
#[derive(Debug)]
pub struct RouletteOutcome {
    pub picks: Vec<(ReviewerAssignment, User)>,
    pub dropped: Vec<ReviewerRole>,
}

/// Run the full selection for a review. Called with the per-MR lock held.
pub async fn run_roulette(
    conn: &mut AsyncPgConnection,
    cache: &Cache,
    gitlab: &dyn GitLabClient,
    notifier: &dyn Notifier,
    review: &MrReview,
    actor: &User,
) -> Result<RouletteOutcome, AppError> {
    let now = Utc::now();
    let project_id = review.gitlab_project_id;
    let mr_iid = review.gitlab_mr_iid;

    // Inputs from GitLab: changed paths and code owners.
    let changed_files = gitlab.changed_files(project_id, mr_iid).await?;
    let codeowners_text = gitlab.codeowners(project_id).await?;
    let owner_usernames = codeowners_text
        .as_deref()
        .map(|text| owners_for_paths(&parse_codeowners(text), &changed_files))
        .unwrap_or_default();

    let weights = config_service::roulette_weights(conn).await?;
    let expertise = config_service::expertise_globs(conn).await?;
    let expertise_sets = ExpertiseSets::compile(&expertise);

    // Candidate universe: everyone but the author and out-of-office users.
    let all_users = user_service::list(conn, None).await?;
    let ooo_ids = user_service::ooo_user_ids(conn, now).await?;
    let shortlist: Vec<User> = all_users
        .into_iter()
        .filter(|u| Some(u.id) != review.mr_author_id)
        .filter(|u| !ooo_ids.contains(&u.id))
        .collect();

    // OOO-by-status is checked last, against the smaller shortlist, and the
    // verdicts are cached.
    let status_ooo = availability::unavailable_by_status(conn, cache, gitlab, &shortlist).await?;
    let available: Vec<User> = shortlist
        .into_iter()
        .filter(|u| !status_ooo.contains(&u.id))
        .collect();

    let ids: Vec<i64> = available.iter().map(|u| u.id).collect();
    let active_counts = review_service::active_review_counts(conn, &ids).await?;
    let last_times = review_service::last_assignment_times(conn, &ids).await?;

    let candidates: Vec<Candidate> = available
        .into_iter()
        .map(|user| {
            let expertise_match = expertise_sets.matches(&user.role, &changed_files);
            Candidate {
                active_reviews: active_counts.get(&user.id).copied().unwrap_or(0),
                last_assigned_at: last_times.get(&user.id).copied(),
                expertise_match,
                user,
            }
        })
        .collect();

    let selection = select_reviewers(&candidates, &review.team, &owner_usernames, weights, now);

    crate::metrics::set_available_reviewers(
        &review.team,
        ReviewerRole::TeamMember.as_str(),
        candidates.iter().filter(|c| c.user.team == review.team).count(),
    );
    crate::metrics::set_available_reviewers(
        &review.team,
        ReviewerRole::External.as_str(),
        candidates.iter().filter(|c| c.user.team != review.team).count(),
    );

    if selection.chosen.is_empty() {
        tracing::warn!(project_id, mr_iid, "Roulette found no eligible reviewers");
        crate::metrics::roulette_trigger(&review.team, "empty");
        return Ok(RouletteOutcome {
            picks: Vec::new(),
            dropped: selection.dropped,
        });
    }

    // Commit trigger fields and the replacing assignments atomically.
    let review_id = review.id;
    let actor_id = actor.id;
    let new_assignments: Vec<NewReviewerAssignment> = selection
        .chosen
        .iter()
        .map(|(role, user)| NewReviewerAssignment {
            mr_review_id: review_id,
            user_id: user.id,
            role: role.as_str().to_string(),
            assigned_at: now,
        })
        .collect();

    let inserted = conn
        .transaction::<_, AppError, _>(|conn| {
            async move {
                review_service::set_roulette_trigger(conn, review_id, now, actor_id).await?;
                review_service::replace_assignments(conn, review_id, new_assignments).await
            }
            .scope_boxed()
        })
        .await?;

    let picks: Vec<(ReviewerAssignment, User)> = inserted
        .into_iter()
        .filter_map(|a| {
            selection
                .chosen
                .iter()
                .find(|(_, u)| u.id == a.user_id)
                .map(|(_, u)| (a, u.clone()))
        })
        .collect();

    for (assignment, user) in &picks {
        crate::metrics::set_active_reviews(
            &user.team,
            &user.username,
            active_counts.get(&user.id).copied().unwrap_or(0) + 1,
        );
        tracing::info!(
            review_id,
            user = %user.username,
            role = %assignment.role,
            "Reviewer assigned"
        );
    }

    crate::metrics::roulette_trigger(&review.team, "success");

    // External side effects after commit; failures are logged and healed by
    // the next force re-roll.
    let body = build_bot_comment(&picks, &selection.dropped);
    match review.bot_comment_id {
        Some(note_id) => {
            if let Err(e) = gitlab.update_mr_note(project_id, mr_iid, note_id, &body).await {
                tracing::warn!(review_id, error = %e, "Failed to update bot comment");
            }
        }
        None => match gitlab.create_mr_note(project_id, mr_iid, &body).await {
            Ok(note_id) => review_service::set_bot_comment_id(conn, review_id, note_id).await?,
            Err(e) => tracing::warn!(review_id, error = %e, "Failed to create bot comment"),
        },
    }

    let chat_picks: Vec<RoulettePick> = picks
        .iter()
        .map(|(a, u)| RoulettePick {
            role: role_str(&a.role),
            username: u.username.clone(),
        })
        .collect();
    if let Err(e) = notifier
        .send_roulette_result(&review.mr_title, &review.mr_url, &review.team, &chat_picks)
        .await
    {
        tracing::warn!(review_id, error = %e, "Failed to send roulette notification");
    }

    Ok(RouletteOutcome {
        picks,
        dropped: selection.dropped,
    })
}

fn role_str(role: &str) -> &'static str {
    match role {
        "codeowner" => "codeowner",
        "external" => "external",
        _ => "team_member",
    }
}

// ── Selection core (pure) ──

#[derive(Debug)]
pub struct Selection {
    pub chosen: Vec<(ReviewerRole, User)>,
    pub dropped: Vec<ReviewerRole>,
}

/// Fill the three slots in order. Each pick is excluded from later pools.
pub fn select_reviewers(
    candidates: &[Candidate],
    team: &str,
    owner_usernames: &HashSet<String>,
    weights: RouletteWeights,
    now: DateTime<Utc>,
) -> Selection {
    let mut chosen: Vec<(ReviewerRole, User)> = Vec::new();
    let mut dropped = Vec::new();
    let mut taken: HashSet<i64> = HashSet::new();

    for role in ReviewerRole::ALL {
        let pool: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| !taken.contains(&c.user.id))
            .filter(|c| match role {
                ReviewerRole::Codeowner => owner_usernames.contains(&c.user.username),
                ReviewerRole::TeamMember => c.user.team == team,
                ReviewerRole::External => c.user.team != team,
            })
            .collect();

        match pick_best(&pool, weights, now) {
            Some(candidate) => {
                taken.insert(candidate.user.id);
                chosen.push((role, candidate.user.clone()));
            }
            None => dropped.push(role),
        }
    }

    Selection { chosen, dropped }
}

/// Weighted score; higher is preferred.
pub fn score(candidate: &Candidate, weights: RouletteWeights, now: DateTime<Utc>) -> f64 {
    weights.current_load * (1.0 / (1.0 + candidate.active_reviews as f64))
        + weights.recent_review * recency_factor(candidate.last_assigned_at, now)
        + weights.expertise_bonus * if candidate.expertise_match { 1.0 } else { 0.0 }
}

/// 1.0 when not assigned in the last 7 days, 0.5 between 1 and 7 days,
/// 0.0 within the last day.
pub fn recency_factor(last_assigned_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    match last_assigned_at {
        None => 1.0,
        Some(at) => {
            let age = now - at;
            if age >= Duration::days(7) {
                1.0
            } else if age >= Duration::days(1) {
                0.5
            } else {
                0.0
            }
        }
    }
}

/// Highest score wins; ties break on lower load, then earliest last
/// assignment (never assigned first), then username.
pub fn pick_best<'a>(
    pool: &[&'a Candidate],
    weights: RouletteWeights,
    now: DateTime<Utc>,
) -> Option<&'a Candidate> {
    pool.iter()
        .copied()
        .max_by(|a, b| {
            score(a, weights, now)
                .partial_cmp(&score(b, weights, now))
                .unwrap_or(std::cmp::Ordering::Equal)
                // Inverted secondary keys: max_by picks the "largest", so the
                // preferred side must compare greater.
                .then_with(|| b.active_reviews.cmp(&a.active_reviews))
                .then_with(|| {
                    let a_at = a.last_assigned_at.map(|t| t.timestamp()).unwrap_or(i64::MIN);
                    let b_at = b.last_assigned_at.map(|t| t.timestamp()).unwrap_or(i64::MIN);
                    b_at.cmp(&a_at)
                })
                .then_with(|| b.user.username.cmp(&a.user.username))
        })
}

// ── CODEOWNERS parsing (pure) ──

/// One `pattern owner...` line. Later entries take precedence, so the last
/// matching pattern decides a path's owners.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeownersEntry {
    pub pattern: String,
    pub owners: Vec<String>,
}

/// Parse CODEOWNERS text. Section headers (`[Section]`), comments, and
/// malformed lines are skipped; `@` prefixes are stripped from owners.
pub fn parse_codeowners(text: &str) -> Vec<CodeownersEntry> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let Some(pattern) = parts.next() else { continue };
        let owners: Vec<String> = parts
            .map(|o| o.trim_start_matches('@').to_string())
            .filter(|o| !o.is_empty())
            .collect();
        if owners.is_empty() {
            continue;
        }
        entries.push(CodeownersEntry {
            pattern: pattern.to_string(),
            owners,
        });
    }
    entries
}

/// Owners of any changed path, last matching pattern winning per path.
pub fn owners_for_paths(entries: &[CodeownersEntry], paths: &[String]) -> HashSet<String> {
    let globs: Vec<Option<GlobSet>> = entries
        .iter()
        .map(|e| compile_codeowners_pattern(&e.pattern))
        .collect();

    let mut all_owners = HashSet::new();
    for path in paths {
        let winner = entries
            .iter()
            .zip(&globs)
            .filter(|(_, glob)| {
                glob.as_ref().map(|g| g.is_match(path.as_str())).unwrap_or(false)
            })
            .last();
        if let Some((entry, _)) = winner {
            all_owners.extend(entry.owners.iter().cloned());
        }
    }
    all_owners
}

/// CODEOWNERS patterns are gitignore-style: a leading `/` anchors to the
/// repo root, a trailing `/` matches everything under the directory, and a
/// bare name matches at any depth.
fn compile_codeowners_pattern(pattern: &str) -> Option<GlobSet> {
    let anchored = pattern.starts_with('/');
    let mut pat = pattern.trim_start_matches('/').to_string();
    if pat.ends_with('/') {
        pat.push_str("**");
    }

    let mut builder = GlobSetBuilder::new();
    let mut add = |p: &str| {
        if let Ok(glob) = Glob::new(p) {
            builder.add(glob);
        }
    };

    if anchored {
        add(&pat);
        // A directory pattern also owns files directly inside it.
        if !pat.contains('*') {
            add(&format!("{pat}/**"));
        }
    } else {
        add(&pat);
        add(&format!("**/{pat}"));
        if !pat.contains('*') {
            add(&format!("{pat}/**"));
            add(&format!("**/{pat}/**"));
        }
    }

    builder.build().ok()
}

// ── Expertise matching ──

struct ExpertiseSets {
    dev: Option<GlobSet>,
    ops: Option<GlobSet>,
}

impl ExpertiseSets {
    fn compile(globs: &config_service::ExpertiseGlobs) -> Self {
        Self {
            dev: compile_globs(&globs.dev),
            ops: compile_globs(&globs.ops),
        }
    }

    fn matches(&self, role: &str, paths: &[String]) -> bool {
        let set = match role {
            "ops" => &self.ops,
            _ => &self.dev,
        };
        match set {
            Some(set) => paths.iter().any(|p| set.is_match(p.as_str())),
            None => false,
        }
    }
}

fn compile_globs(patterns: &[String]) -> Option<GlobSet> {
    if patterns.is_empty() {
        return None;
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => tracing::warn!(pattern = %pattern, error = %e, "Bad expertise glob"),
        }
    }
    builder.build().ok()
}

// ── Bot comment ──

/// Markdown body for the bot's MR note.
pub fn build_bot_comment(
    picks: &[(ReviewerAssignment, User)],
    dropped: &[ReviewerRole],
) -> String {
    let mut lines = vec![":game_die: **Reviewer roulette**".to_string(), String::new()];

    for (assignment, user) in picks {
        let label = match assignment.role.as_str() {
            "codeowner" => "Code owner",
            "external" => "External reviewer",
            _ => "Team member",
        };
        lines.push(format!("- {label}: @{}", user.username));
    }

    for role in dropped {
        let label = match role {
            ReviewerRole::Codeowner => "code owner",
            ReviewerRole::TeamMember => "team member",
            ReviewerRole::External => "external reviewer",
        };
        lines.push(format!("- _No eligible {label} found_"));
    }

    lines.push(String::new());
    lines.push("Re-roll with `/roulette force`.".to_string());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap()
    }

    fn user(id: i64, username: &str, team: &str) -> User {
        User {
            id,
            gitlab_id: id,
            username: username.into(),
            email: String::new(),
            role: "dev".into(),
            team: team.into(),
            created_at: now(),
            updated_at: now(),
        }
    }

    fn candidate(id: i64, username: &str, team: &str) -> Candidate {
        Candidate {
            user: user(id, username, team),
            active_reviews: 0,
            last_assigned_at: None,
            expertise_match: false,
        }
    }

    #[test]
    fn recency_buckets() {
        let t = now();
        assert_eq!(recency_factor(None, t), 1.0);
        assert_eq!(recency_factor(Some(t - Duration::days(8)), t), 1.0);
        assert_eq!(recency_factor(Some(t - Duration::days(7)), t), 1.0);
        assert_eq!(recency_factor(Some(t - Duration::days(3)), t), 0.5);
        assert_eq!(recency_factor(Some(t - Duration::hours(5)), t), 0.0);
    }

    #[test]
    fn score_combines_all_three_terms() {
        let weights = RouletteWeights::default();
        let mut c = candidate(1, "alice", "frontend");
        // Fresh candidate with expertise: 10*1 + 5*1 + 15*1.
        c.expertise_match = true;
        assert_eq!(score(&c, weights, now()), 30.0);

        // Two active reviews, assigned 3 days ago, no expertise.
        c.expertise_match = false;
        c.active_reviews = 2;
        c.last_assigned_at = Some(now() - Duration::days(3));
        let expected = 10.0 / 3.0 + 5.0 * 0.5;
        assert!((score(&c, weights, now()) - expected).abs() < 1e-9);
    }

    #[test]
    fn lower_load_wins_at_equal_score_terms() {
        let weights = RouletteWeights::default();
        let mut busy = candidate(1, "busy", "frontend");
        busy.active_reviews = 3;
        let idle = candidate(2, "idle", "frontend");
        let pool = vec![&busy, &idle];
        assert_eq!(pick_best(&pool, weights, now()).unwrap().user.username, "idle");
    }

    #[test]
    fn username_breaks_remaining_ties() {
        let weights = RouletteWeights::default();
        let a = candidate(1, "alice", "frontend");
        let b = candidate(2, "bob", "frontend");
        let pool = vec![&b, &a];
        assert_eq!(pick_best(&pool, weights, now()).unwrap().user.username, "alice");
    }

    #[test]
    fn never_assigned_beats_recently_assigned_on_tie() {
        let weights = RouletteWeights {
            recent_review: 0.0,
            ..RouletteWeights::default()
        };
        let fresh = candidate(1, "zoe", "frontend");
        let mut stale = candidate(2, "amy", "frontend");
        stale.last_assigned_at = Some(now() - Duration::days(30));
        let pool = vec![&stale, &fresh];
        // Equal scores (recency weight zeroed): never-assigned wins even
        // against an alphabetically earlier name.
        assert_eq!(pick_best(&pool, weights, now()).unwrap().user.username, "zoe");
    }

    #[test]
    fn selection_is_deterministic() {
        let weights = RouletteWeights::default();
        let candidates = vec![
            candidate(1, "alice", "frontend"),
            candidate(2, "bob", "frontend"),
            candidate(3, "carol", "frontend"),
            candidate(4, "dave", "platform"),
        ];
        let owners: HashSet<String> = ["alice".to_string()].into_iter().collect();

        let first = select_reviewers(&candidates, "frontend", &owners, weights, now());
        let second = select_reviewers(&candidates, "frontend", &owners, weights, now());
        let names = |s: &Selection| {
            s.chosen
                .iter()
                .map(|(r, u)| (*r, u.username.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(names(&first), names(&second));
    }

    #[test]
    fn each_role_gets_a_distinct_user() {
        let weights = RouletteWeights::default();
        // alice owns code AND is on the team: she can fill only one slot.
        let candidates = vec![
            candidate(1, "alice", "frontend"),
            candidate(2, "bob", "frontend"),
            candidate(3, "dave", "platform"),
        ];
        let owners: HashSet<String> = ["alice".to_string()].into_iter().collect();

        let selection = select_reviewers(&candidates, "frontend", &owners, weights, now());
        assert_eq!(selection.chosen.len(), 3);
        let ids: HashSet<i64> = selection.chosen.iter().map(|(_, u)| u.id).collect();
        assert_eq!(ids.len(), 3);
        assert!(selection.dropped.is_empty());
    }

    #[test]
    fn unfillable_slots_are_dropped() {
        let weights = RouletteWeights::default();
        // No code owners, no external teams.
        let candidates = vec![
            candidate(1, "bob", "frontend"),
            candidate(2, "carol", "frontend"),
        ];
        let owners = HashSet::new();

        let selection = select_reviewers(&candidates, "frontend", &owners, weights, now());
        assert_eq!(selection.chosen.len(), 1);
        assert_eq!(selection.chosen[0].0, ReviewerRole::TeamMember);
        assert_eq!(
            selection.dropped,
            vec![ReviewerRole::Codeowner, ReviewerRole::External]
        );
    }

    #[test]
    fn codeowners_parsing_skips_noise() {
        let entries = parse_codeowners(
            "# comment\n\n[Frontend]\n*.rs @alice @bob\n/docs/ @carol\nfrontend/** @dave\n",
        );
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].pattern, "*.rs");
        assert_eq!(entries[0].owners, vec!["alice", "bob"]);
        assert_eq!(entries[1].owners, vec!["carol"]);
    }

    #[test]
    fn last_matching_pattern_wins_per_path() {
        let entries = parse_codeowners("* @fallback\nsrc/** @alice\n");
        let owners = owners_for_paths(&entries, &["src/main.rs".to_string()]);
        assert!(owners.contains("alice"));
        assert!(!owners.contains("fallback"));
    }

    #[test]
    fn unanchored_patterns_match_at_any_depth() {
        let entries = parse_codeowners("*.sql @dba\nCargo.toml @release\n");
        let owners = owners_for_paths(
            &entries,
            &[
                "migrations/001_init.sql".to_string(),
                "Cargo.toml".to_string(),
            ],
        );
        assert!(owners.contains("dba"));
        assert!(owners.contains("release"));
    }

    #[test]
    fn directory_patterns_own_their_subtree() {
        let entries = parse_codeowners("/docs/ @writers\n");
        let owners = owners_for_paths(&entries, &["docs/guide/intro.md".to_string()]);
        assert!(owners.contains("writers"));

        let none = owners_for_paths(&entries, &["src/docs.rs".to_string()]);
        assert!(none.is_empty());
    }

    #[test]
    fn no_matching_path_means_no_owners() {
        let entries = parse_codeowners("*.go @gopher\n");
        let owners = owners_for_paths(&entries, &["src/main.rs".to_string()]);
        assert!(owners.is_empty());
    }

    #[test]
    fn bot_comment_lists_picks_and_dropped_slots() {
        let alice = user(1, "alice", "frontend");
        let assignment = ReviewerAssignment {
            id: 1,
            mr_review_id: 1,
            user_id: 1,
            role: "codeowner".into(),
            assigned_at: now(),
            started_review_at: None,
            first_comment_at: None,
            approved_at: None,
            comment_count: 0,
            comment_total_length: 0,
            last_note_id: None,
        };
        let body = build_bot_comment(&[(assignment, alice)], &[ReviewerRole::External]);
        assert!(body.contains("Code owner: @alice"));
        assert!(body.contains("No eligible external reviewer"));
        assert!(body.contains("/roulette force"));
    }

    #[test]
    fn ooo_members_never_fill_a_slot() {
        // Team {alice, bob, charlie}, bob authored the MR, alice is OOO: both
        // are excluded from the candidate list, so charlie must be chosen.
        // With charlie gone too, the slot drops rather than falling back to
        // alice.
        let weights = RouletteWeights::default();
        let with_charlie = vec![candidate(3, "charlie", "frontend")];
        let selection = select_reviewers(&with_charlie, "frontend", &HashSet::new(), weights, now());
        assert_eq!(selection.chosen.len(), 1);
        assert_eq!(selection.chosen[0].1.username, "charlie");

        let nobody: Vec<Candidate> = Vec::new();
        let selection = select_reviewers(&nobody, "frontend", &HashSet::new(), weights, now());
        assert!(selection.chosen.is_empty());
        assert_eq!(
            selection.dropped,
            vec![
                ReviewerRole::Codeowner,
                ReviewerRole::TeamMember,
                ReviewerRole::External
            ]
        );
    }

    #[test]
    fn author_never_appears_because_author_is_prefiltered() {
        // The candidate list handed to select_reviewers already excludes the
        // author; this pins the pool filters to the role definitions.
        let weights = RouletteWeights::default();
        let candidates = vec![candidate(2, "bob", "frontend")];
        let owners: HashSet<String> = ["bob".to_string()].into_iter().collect();
        let selection = select_reviewers(&candidates, "frontend", &owners, weights, now());
        // bob fills codeowner, nobody is left for team_member/external.
        assert_eq!(selection.chosen.len(), 1);
        assert_eq!(selection.chosen[0].0, ReviewerRole::Codeowner);
        assert_eq!(
            selection.dropped,
            vec![ReviewerRole::TeamMember, ReviewerRole::External]
        );
    }
}
