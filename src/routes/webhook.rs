//! GitLab webhook endpoint — token verification and event dispatch.

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use sha2::{Digest, Sha256};

use crate::events::{self, WebhookEvent};
use crate::models::error::AppError;
use crate::routes::AppState;
use crate::services::lifecycle;

/// Handle an incoming GitLab webhook delivery. Persistence errors surface
/// as 5xx so GitLab redelivers; everything GitLab should not retry returns
/// 2xx.
pub async fn handle_webhook(
    state: &AppState,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let token = headers
        .get("x-gitlab-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !verify_token(&state.config.gitlab.webhook_secret, token) {
        tracing::warn!("Webhook token validation failed");
        return Ok(StatusCode::UNAUTHORIZED);
    }

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("malformed webhook body: {e}")))?;

    let event_kind = headers
        .get("x-gitlab-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");
    tracing::debug!(event = event_kind, "Webhook received");

    let Some(event) = events::parse(&payload)? else {
        return Ok(StatusCode::OK);
    };

    let mut conn = state.pool.get().await?;
    match event {
        WebhookEvent::MergeRequest(evt) => {
            lifecycle::ingest_merge_request_event(&mut conn, &evt).await?;
        }
        WebhookEvent::Note(evt) => {
            lifecycle::ingest_note_event(
                &mut conn,
                &state.cache,
                state.gitlab.as_ref(),
                state.notifier.as_ref(),
                &state.config.gitlab.bot_username,
                &evt,
            )
            .await?;
        }
    }

    Ok(StatusCode::OK)
}

/// Compare the X-Gitlab-Token header against the shared secret. Hashing
/// both sides keeps the comparison constant-time. An empty configured
/// secret disables validation (warned about at startup).
pub fn verify_token(secret: &str, provided: &str) -> bool {
    if secret.is_empty() {
        return true;
    }
    if provided.is_empty() {
        return false;
    }
    Sha256::digest(secret.as_bytes()) == Sha256::digest(provided.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_token_passes() {
        assert!(verify_token("s3cret", "s3cret"));
    }

    #[test]
    fn wrong_or_missing_token_fails() {
        assert!(!verify_token("s3cret", "guess"));
        assert!(!verify_token("s3cret", ""));
    }

    #[test]
    fn empty_secret_disables_validation() {
        assert!(verify_token("", "anything"));
        assert!(verify_token("", ""));
    }
}
