//! HTTP routes — GitLab webhook and the leaderboard/badges API.

pub mod api;
pub mod webhook;

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;

use crate::cache::Cache;
use crate::config::AppConfig;
use crate::db::PgPool;
use crate::models::error::AppError;
use crate::services::gitlab::GitLabClient;
use crate::services::notifier::Notifier;

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub cache: Cache,
    pub gitlab: Arc<dyn GitLabClient>,
    pub notifier: Arc<dyn Notifier>,
    pub config: AppConfig,
}

/// Build the service router.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        // Webhook
        .route("/webhook/gitlab", post(webhook_handler))
        // Leaderboard API
        .route("/api/v1/leaderboard", get(global_leaderboard_handler))
        .route("/api/v1/leaderboard/{team}", get(team_leaderboard_handler))
        // User API
        .route("/api/v1/users/{id}/stats", get(user_stats_handler))
        .route("/api/v1/users/{id}/badges", get(user_badges_handler))
        // Badge catalog
        .route("/api/v1/badges", get(list_badges_handler))
        .route("/api/v1/badges/{id}", get(get_badge_handler))
        .route("/api/v1/badges/{id}/holders", get(badge_holders_handler))
        // Liveness
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// ── Webhook ──

async fn webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<StatusCode, AppError> {
    webhook::handle_webhook(&state, &headers, body).await
}

// ── Leaderboard API ──

async fn global_leaderboard_handler(
    State(state): State<AppState>,
    Query(query): Query<api::LeaderboardQuery>,
) -> Result<Json<Vec<crate::services::leaderboard::Entry>>, AppError> {
    let mut conn = state.pool.get().await?;
    api::leaderboard(&mut conn, None, query).await.map(Json)
}

async fn team_leaderboard_handler(
    State(state): State<AppState>,
    Path(team): Path<String>,
    Query(query): Query<api::LeaderboardQuery>,
) -> Result<Json<Vec<crate::services::leaderboard::Entry>>, AppError> {
    let mut conn = state.pool.get().await?;
    api::leaderboard(&mut conn, Some(&team), query).await.map(Json)
}

// ── User API ──

async fn user_stats_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<api::StatsQuery>,
) -> Result<Json<crate::services::leaderboard::UserStats>, AppError> {
    let mut conn = state.pool.get().await?;
    api::user_stats(&mut conn, id, query).await.map(Json)
}

async fn user_badges_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<api::UserBadgeJson>>, AppError> {
    let mut conn = state.pool.get().await?;
    api::user_badges(&mut conn, id).await.map(Json)
}

// ── Badge catalog ──

async fn list_badges_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<api::BadgeJson>>, AppError> {
    let mut conn = state.pool.get().await?;
    api::list_badges(&mut conn).await.map(Json)
}

async fn get_badge_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<api::BadgeJson>, AppError> {
    let mut conn = state.pool.get().await?;
    api::get_badge(&mut conn, id).await.map(Json)
}

async fn badge_holders_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<api::HoldersQuery>,
) -> Result<Json<api::BadgeHoldersJson>, AppError> {
    let mut conn = state.pool.get().await?;
    api::badge_holders(&mut conn, id, query).await.map(Json)
}
