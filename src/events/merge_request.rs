//! merge_request webhook payload — open / update / approve / merge / close.

use serde::Deserialize;

use super::EventUser;

/// Lifecycle action carried in `object_attributes.action`. GitLab sends
/// "approved" for approvals; both spellings are accepted. Actions the
/// service does not consume (unapproved, ...) map to `Other` and are
/// treated as plain refreshes, never as delivery errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MrAction {
    Open,
    Reopen,
    Update,
    #[serde(alias = "approved")]
    Approve,
    Merge,
    Close,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergeRequestEvent {
    pub user: EventUser,
    pub project: EventProject,
    pub object_attributes: MrAttributes,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventProject {
    pub id: i64,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MrAttributes {
    pub iid: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    pub action: MrAction,
    #[serde(default)]
    pub author_id: Option<i64>,
    #[serde(default)]
    pub source_branch: String,
    #[serde(default)]
    pub target_branch: String,
}

impl MergeRequestEvent {
    pub fn project_id(&self) -> i64 {
        self.project.id
    }

    pub fn mr_iid(&self) -> i64 {
        self.object_attributes.iid
    }
}
