//! Ordered raw-SQL migrations, executed at startup.
//!
//! The base migration creates the eight core tables; a second, additive
//! migration adds `bot_comment_id` to mr_reviews so upgraded deployments
//! pick it up without a rebuild.

use diesel_async::{AsyncPgConnection, SimpleAsyncConnection};

/// Base schema. Statements are ordered so foreign keys always point at
/// tables that already exist.
pub const BASE_MIGRATION_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id          BIGSERIAL PRIMARY KEY,
    gitlab_id   BIGINT NOT NULL UNIQUE,
    username    VARCHAR(255) NOT NULL UNIQUE,
    email       VARCHAR(255) NOT NULL DEFAULT '',
    role        VARCHAR(50) NOT NULL DEFAULT 'dev',
    team        VARCHAR(100) NOT NULL DEFAULT '',
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_users_team ON users (team);

CREATE TABLE IF NOT EXISTS ooo_status (
    id          BIGSERIAL PRIMARY KEY,
    user_id     BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    start_date  TIMESTAMPTZ NOT NULL,
    end_date    TIMESTAMPTZ NOT NULL,
    reason      TEXT NOT NULL DEFAULT '',
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_ooo_status_user ON ooo_status (user_id);
CREATE INDEX IF NOT EXISTS idx_ooo_status_window ON ooo_status (start_date, end_date);

CREATE TABLE IF NOT EXISTS mr_reviews (
    id                    BIGSERIAL PRIMARY KEY,
    gitlab_project_id     BIGINT NOT NULL,
    gitlab_mr_iid         BIGINT NOT NULL,
    mr_url                TEXT NOT NULL DEFAULT '',
    mr_title              TEXT NOT NULL DEFAULT '',
    mr_author_id          BIGINT REFERENCES users(id) ON DELETE SET NULL,
    team                  VARCHAR(100) NOT NULL DEFAULT '',
    roulette_triggered_at TIMESTAMPTZ,
    roulette_triggered_by BIGINT REFERENCES users(id) ON DELETE SET NULL,
    first_review_at       TIMESTAMPTZ,
    approved_at           TIMESTAMPTZ,
    merged_at             TIMESTAMPTZ,
    closed_at             TIMESTAMPTZ,
    status                VARCHAR(50) NOT NULL DEFAULT 'pending',
    created_at            TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at            TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (gitlab_project_id, gitlab_mr_iid)
);

CREATE INDEX IF NOT EXISTS idx_mr_reviews_status ON mr_reviews (status);
CREATE INDEX IF NOT EXISTS idx_mr_reviews_team ON mr_reviews (team);
CREATE INDEX IF NOT EXISTS idx_mr_reviews_merged ON mr_reviews (merged_at);
CREATE INDEX IF NOT EXISTS idx_mr_reviews_closed ON mr_reviews (closed_at);

CREATE TABLE IF NOT EXISTS reviewer_assignments (
    id                   BIGSERIAL PRIMARY KEY,
    mr_review_id         BIGINT NOT NULL REFERENCES mr_reviews(id) ON DELETE CASCADE,
    user_id              BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    role                 VARCHAR(50) NOT NULL,
    assigned_at          TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    started_review_at    TIMESTAMPTZ,
    first_comment_at     TIMESTAMPTZ,
    approved_at          TIMESTAMPTZ,
    comment_count        INTEGER NOT NULL DEFAULT 0,
    comment_total_length BIGINT NOT NULL DEFAULT 0,
    last_note_id         BIGINT
);

CREATE INDEX IF NOT EXISTS idx_assignments_review ON reviewer_assignments (mr_review_id);
CREATE INDEX IF NOT EXISTS idx_assignments_user ON reviewer_assignments (user_id);
CREATE INDEX IF NOT EXISTS idx_assignments_assigned ON reviewer_assignments (assigned_at);

CREATE TABLE IF NOT EXISTS review_metrics (
    id                   BIGSERIAL PRIMARY KEY,
    date                 DATE NOT NULL,
    team                 VARCHAR(100) NOT NULL DEFAULT '',
    user_id              BIGINT REFERENCES users(id) ON DELETE SET NULL,
    project_id           BIGINT,
    total_reviews        INTEGER NOT NULL DEFAULT 0,
    completed_reviews    INTEGER NOT NULL DEFAULT 0,
    avg_ttfr             INTEGER,
    avg_time_to_approval INTEGER,
    avg_comment_count    DOUBLE PRECISION,
    avg_comment_length   DOUBLE PRECISION,
    engagement_score     DOUBLE PRECISION,
    created_at           TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE NULLS NOT DISTINCT (date, team, user_id, project_id)
);

CREATE INDEX IF NOT EXISTS idx_review_metrics_date ON review_metrics (date);
CREATE INDEX IF NOT EXISTS idx_review_metrics_user ON review_metrics (user_id);

CREATE TABLE IF NOT EXISTS badges (
    id          BIGSERIAL PRIMARY KEY,
    name        VARCHAR(100) NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    icon        VARCHAR(50) NOT NULL DEFAULT '',
    criteria    JSONB NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS user_badges (
    id        BIGSERIAL PRIMARY KEY,
    user_id   BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    badge_id  BIGINT NOT NULL REFERENCES badges(id) ON DELETE CASCADE,
    earned_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (user_id, badge_id)
);

CREATE INDEX IF NOT EXISTS idx_user_badges_badge ON user_badges (badge_id);

CREATE TABLE IF NOT EXISTS configuration (
    id         BIGSERIAL PRIMARY KEY,
    key        VARCHAR(255) NOT NULL UNIQUE,
    value      JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#;

/// Additive migration: the bot edits its roulette comment in place, so the
/// note id has to survive restarts.
pub const BOT_COMMENT_MIGRATION_SQL: &str = r#"
ALTER TABLE mr_reviews ADD COLUMN IF NOT EXISTS bot_comment_id BIGINT;
"#;

/// Run all migrations in order.
pub async fn run_migrations(conn: &mut AsyncPgConnection) -> anyhow::Result<()> {
    conn.batch_execute(BASE_MIGRATION_SQL)
        .await
        .map_err(|e| anyhow::anyhow!("base migration failed: {e}"))?;
    conn.batch_execute(BOT_COMMENT_MIGRATION_SQL)
        .await
        .map_err(|e| anyhow::anyhow!("bot_comment_id migration failed: {e}"))?;
    Ok(())
}
