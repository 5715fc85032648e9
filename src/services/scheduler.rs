//! Cron-like scheduler — daily review reminders and badge re-evaluation.
//!
//! Background tokio tasks compute the next local fire time from an "HH:MM"
//! setting and an IANA timezone, optionally skipping weekends. Each tick
//! takes a cross-replica Redis lock named for the job; a held lock means
//! another replica runs it this tick.

use std::time::Instant;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use chrono_tz::Tz;

use crate::cache::{scheduler_lock_key, Cache};
use crate::config::SchedulerConfig;
use crate::db::PgPool;
use crate::models::error::AppError;
use crate::models::review::MrReview;
use crate::models::user::User;
use crate::services::lifecycle::REMINDER_MIN_AGE;
use crate::services::notifier::{Notifier, PendingMr};
use crate::services::{badges, review_service};

/// Lock TTLs sit above each job's expected worst-case duration.
const REMINDER_LOCK_TTL: std::time::Duration = std::time::Duration::from_secs(600);
const BADGE_LOCK_TTL: std::time::Duration = std::time::Duration::from_secs(1800);

/// Spawn both scheduler loops. Returns an error only for unusable
/// configuration; runtime failures are logged and retried next tick.
pub fn spawn(
    pool: PgPool,
    cache: Cache,
    notifier: std::sync::Arc<dyn Notifier>,
    cfg: &SchedulerConfig,
) -> anyhow::Result<()> {
    if !cfg.enabled {
        tracing::info!("Scheduler is disabled in configuration");
        return Ok(());
    }

    let tz: Tz = cfg
        .timezone
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid timezone {:?}: {e}", cfg.timezone))?;
    let reminder_time = parse_time(&cfg.time)?;
    let badge_time = parse_time(&cfg.badge_time)?;
    let skip_weekends = cfg.skip_weekends;

    tracing::info!(
        timezone = %tz,
        reminder_time = %cfg.time,
        badge_time = %cfg.badge_time,
        skip_weekends,
        "Scheduler started"
    );

    {
        let pool = pool.clone();
        let cache = cache.clone();
        let notifier = notifier.clone();
        tokio::spawn(async move {
            job_loop(tz, reminder_time, skip_weekends, "daily_reminder", || {
                let pool = pool.clone();
                let cache = cache.clone();
                let notifier = notifier.clone();
                async move { reminder_tick(&pool, &cache, notifier.as_ref()).await }
            })
            .await;
        });
    }

    tokio::spawn(async move {
        job_loop(tz, badge_time, skip_weekends, "badge_evaluation", || {
            let pool = pool.clone();
            let cache = cache.clone();
            async move { badge_tick(&pool, &cache).await }
        })
        .await;
    });

    Ok(())
}

/// Sleep until the next fire time, run the job, repeat.
async fn job_loop<F, Fut>(
    tz: Tz,
    (hour, minute): (u32, u32),
    skip_weekends: bool,
    job: &'static str,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    loop {
        let now = Utc::now().with_timezone(&tz);
        let next = next_run_after(now, hour, minute, skip_weekends);
        let wait = (next - now).to_std().unwrap_or_default();
        tracing::debug!(job, next_run = %next, "Scheduler sleeping");
        tokio::time::sleep(wait).await;
        tick().await;
    }
}

/// Parse "HH:MM".
pub fn parse_time(s: &str) -> anyhow::Result<(u32, u32)> {
    let (h, m) = s
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("invalid time {s:?}, expected HH:MM"))?;
    let hour: u32 = h.parse().map_err(|_| anyhow::anyhow!("invalid hour {h:?}"))?;
    let minute: u32 = m.parse().map_err(|_| anyhow::anyhow!("invalid minute {m:?}"))?;
    if hour > 23 || minute > 59 {
        anyhow::bail!("invalid time {s:?}, expected HH:MM");
    }
    Ok((hour, minute))
}

/// First instant strictly after `after` that lands on HH:MM local, skipping
/// Saturday and Sunday when configured.
pub fn next_run_after(
    after: DateTime<Tz>,
    hour: u32,
    minute: u32,
    skip_weekends: bool,
) -> DateTime<Tz> {
    let tz = after.timezone();
    let mut date = after.date_naive();

    loop {
        let candidate_local = date.and_hms_opt(hour, minute, 0).expect("valid wall time");
        // DST gaps shift forward to the next representable instant.
        if let Some(candidate) = tz
            .from_local_datetime(&candidate_local)
            .earliest()
            .filter(|c| *c > after)
        {
            let weekday = candidate.weekday();
            if !(skip_weekends
                && (weekday == chrono::Weekday::Sat || weekday == chrono::Weekday::Sun))
            {
                return candidate;
            }
        }
        date += Duration::days(1);
    }
}

// ── Daily reminder job ──

async fn reminder_tick(pool: &PgPool, cache: &Cache, notifier: &dyn Notifier) {
    match cache
        .acquire_lock(&scheduler_lock_key("daily_reminder"), REMINDER_LOCK_TTL)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!("Reminder lock held by another replica, skipping tick");
            return;
        }
        Err(e) => {
            tracing::error!(error = %e, "Reminder lock acquisition failed");
            crate::metrics::scheduler_job_run("error");
            return;
        }
    }

    let started = Instant::now();
    let result = run_daily_reminders(pool, notifier).await;
    crate::metrics::observe_scheduler_job_duration(started.elapsed().as_secs_f64());
    crate::metrics::set_scheduler_last_run();

    match result {
        Ok(sent) => {
            crate::metrics::scheduler_job_run("success");
            tracing::info!(pending_mrs = sent, "Daily reminder job finished");
        }
        Err(e) => {
            crate::metrics::scheduler_job_run("error");
            crate::metrics::scheduler_notification_failed(e.kind());
            tracing::error!(error = %e, "Daily reminder job failed");
        }
    }
}

/// Query stale MRs and send one reminder listing them. Returns how many MRs
/// were mentioned; zero qualifying MRs sends nothing.
pub async fn run_daily_reminders(
    pool: &PgPool,
    notifier: &dyn Notifier,
) -> Result<usize, AppError> {
    let mut conn = pool.get().await?;
    let reviews = review_service::pending_with_authors(&mut conn).await?;
    drop(conn);

    let pending = stale_pending_mrs(&reviews, Utc::now());
    if pending.is_empty() {
        tracing::debug!("No pending MRs to notify about");
        return Ok(0);
    }

    notifier.send_daily_reminder(&pending).await?;

    let mut teams: Vec<&str> = pending.iter().map(|p| p.team.as_str()).collect();
    teams.sort_unstable();
    teams.dedup();
    for team in &teams {
        crate::metrics::scheduler_notification_sent(team);
        let count = pending.iter().filter(|p| p.team == *team).count();
        crate::metrics::set_pending_mrs(team, count);
    }

    Ok(pending.len())
}

/// Keep reviews whose roulette trigger is at least the minimum age old.
/// Reviews never triggered have no reviewers to nag about.
pub fn stale_pending_mrs(
    reviews: &[(MrReview, Option<User>)],
    now: DateTime<Utc>,
) -> Vec<PendingMr> {
    reviews
        .iter()
        .filter_map(|(review, author)| {
            let triggered_at = review.roulette_triggered_at?;
            if now - triggered_at < REMINDER_MIN_AGE {
                return None;
            }
            Some(PendingMr {
                title: review.mr_title.clone(),
                url: review.mr_url.clone(),
                author: author
                    .as_ref()
                    .map(|u| u.username.clone())
                    .unwrap_or_else(|| "unknown".to_string()),
                team: review.team.clone(),
                triggered_at,
            })
        })
        .collect()
}

// ── Badge evaluation job ──

async fn badge_tick(pool: &PgPool, cache: &Cache) {
    match cache
        .acquire_lock(&scheduler_lock_key("badge_evaluation"), BADGE_LOCK_TTL)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!("Badge lock held by another replica, skipping tick");
            return;
        }
        Err(e) => {
            tracing::error!(error = %e, "Badge lock acquisition failed");
            crate::metrics::badge_evaluation_run("error");
            return;
        }
    }

    let result = async {
        let mut conn = pool.get().await?;
        badges::evaluate_all(&mut conn).await
    }
    .await;

    match result {
        Ok(outcome) if outcome.succeeded() => {
            crate::metrics::badge_evaluation_run("success");
        }
        Ok(outcome) => {
            crate::metrics::badge_evaluation_run("error");
            tracing::warn!(failures = outcome.failures, "Badge evaluation had failures");
        }
        Err(e) => {
            crate::metrics::badge_evaluation_run("error");
            tracing::error!(error = %e, "Badge evaluation job failed");
        }
    }
}
