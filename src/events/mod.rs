//! Typed GitLab webhook payloads.
//!
//! The HTTP boundary verifies the webhook token, then hands the raw JSON
//! here; unknown kinds are ignored, not errors.

pub mod merge_request;
pub mod note;

pub use merge_request::{MergeRequestEvent, MrAction};
pub use note::NoteEvent;

use crate::models::error::AppError;

/// An event the lifecycle engine knows how to ingest.
#[derive(Debug)]
pub enum WebhookEvent {
    MergeRequest(MergeRequestEvent),
    Note(NoteEvent),
}

/// Parse a webhook body by its `object_kind`. Returns None for kinds the
/// service does not consume (pipeline, push, ...).
pub fn parse(payload: &serde_json::Value) -> Result<Option<WebhookEvent>, AppError> {
    let kind = payload
        .get("object_kind")
        .and_then(|v| v.as_str())
        .unwrap_or("");

    match kind {
        "merge_request" => {
            let evt: MergeRequestEvent = serde_json::from_value(payload.clone())
                .map_err(|e| AppError::Validation(format!("malformed merge_request event: {e}")))?;
            Ok(Some(WebhookEvent::MergeRequest(evt)))
        }
        "note" => {
            let evt: NoteEvent = serde_json::from_value(payload.clone())
                .map_err(|e| AppError::Validation(format!("malformed note event: {e}")))?;
            // Only MR notes matter; issue/commit/snippet notes are ignored.
            if evt.object_attributes.noteable_type == "MergeRequest" {
                Ok(Some(WebhookEvent::Note(evt)))
            } else {
                Ok(None)
            }
        }
        _ => Ok(None),
    }
}

/// Actor common to both event kinds.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct EventUser {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignores_unknown_object_kinds() {
        let payload = serde_json::json!({"object_kind": "pipeline"});
        assert!(parse(&payload).unwrap().is_none());
    }

    #[test]
    fn ignores_notes_on_issues() {
        let payload = serde_json::json!({
            "object_kind": "note",
            "user": {"id": 1, "username": "alice"},
            "project": {"id": 100},
            "object_attributes": {
                "id": 42,
                "note": "interesting",
                "noteable_type": "Issue",
                "system": false,
            },
        });
        assert!(parse(&payload).unwrap().is_none());
    }
}
