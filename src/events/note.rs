//! note webhook payload — comments on a merge request, including the
//! `/roulette` command.

use serde::Deserialize;

use super::merge_request::EventProject;
use super::EventUser;

#[derive(Debug, Clone, Deserialize)]
pub struct NoteEvent {
    pub user: EventUser,
    pub project: EventProject,
    pub object_attributes: NoteAttributes,
    #[serde(default)]
    pub merge_request: Option<NoteMergeRequest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NoteAttributes {
    /// External note id — the dedupe key for re-delivered webhooks.
    pub id: i64,
    #[serde(default)]
    pub note: String,
    pub noteable_type: String,
    /// True for GitLab system notes ("requested review from ...").
    #[serde(default)]
    pub system: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NoteMergeRequest {
    pub iid: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub author_id: Option<i64>,
}

/// Parsed `/roulette` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouletteCommand {
    pub force: bool,
}

impl NoteEvent {
    pub fn project_id(&self) -> i64 {
        self.project.id
    }

    pub fn mr_iid(&self) -> Option<i64> {
        self.merge_request.as_ref().map(|mr| mr.iid)
    }

    /// Recognize a `/roulette` command in the note body. Anything else is a
    /// review comment as far as engagement metrics are concerned.
    pub fn roulette_command(&self) -> Option<RouletteCommand> {
        parse_roulette_command(&self.object_attributes.note)
    }
}

/// `/roulette` must lead the note; an optional `force` argument may follow.
pub fn parse_roulette_command(note: &str) -> Option<RouletteCommand> {
    let mut words = note.trim().split_whitespace();
    if words.next()? != "/roulette" {
        return None;
    }
    let force = words.next() == Some("force");
    Some(RouletteCommand { force })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_command() {
        assert_eq!(
            parse_roulette_command("/roulette"),
            Some(RouletteCommand { force: false })
        );
    }

    #[test]
    fn parses_force_and_tolerates_whitespace() {
        assert_eq!(
            parse_roulette_command("  /roulette   force  "),
            Some(RouletteCommand { force: true })
        );
    }

    #[test]
    fn trailing_text_is_not_force() {
        assert_eq!(
            parse_roulette_command("/roulette please"),
            Some(RouletteCommand { force: false })
        );
    }

    #[test]
    fn ordinary_comments_are_not_commands() {
        assert_eq!(parse_roulette_command("looks good to me"), None);
        assert_eq!(parse_roulette_command("try /roulette"), None);
    }

    #[test]
    fn note_event_parses_with_merge_request() {
        let evt: NoteEvent = serde_json::from_value(serde_json::json!({
            "object_kind": "note",
            "user": {"id": 2, "username": "bob"},
            "project": {"id": 100},
            "object_attributes": {
                "id": 5555,
                "note": "/roulette force",
                "noteable_type": "MergeRequest",
                "system": false,
            },
            "merge_request": {"iid": 1, "title": "Add login page"},
        }))
        .unwrap();
        assert_eq!(evt.project_id(), 100);
        assert_eq!(evt.mr_iid(), Some(1));
        assert_eq!(evt.roulette_command(), Some(RouletteCommand { force: true }));
    }
}
