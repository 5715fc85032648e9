//! GitLab REST client — CODEOWNERS, MR changed files, user status, and MR
//! notes. Behind a trait so tests run against an in-memory fake.

use std::time::Duration;

use async_trait::async_trait;

use crate::models::error::AppError;

/// Capabilities the core consumes from GitLab.
#[async_trait]
pub trait GitLabClient: Send + Sync {
    /// Raw CODEOWNERS content for a project, if one exists.
    async fn codeowners(&self, project_id: i64) -> Result<Option<String>, AppError>;

    /// Paths changed by a merge request.
    async fn changed_files(&self, project_id: i64, mr_iid: i64) -> Result<Vec<String>, AppError>;

    /// A user's status message, if set.
    async fn user_status(&self, username: &str) -> Result<Option<String>, AppError>;

    /// Post a note on an MR, returning the new note id.
    async fn create_mr_note(
        &self,
        project_id: i64,
        mr_iid: i64,
        body: &str,
    ) -> Result<i64, AppError>;

    /// Update an existing note in place.
    async fn update_mr_note(
        &self,
        project_id: i64,
        mr_iid: i64,
        note_id: i64,
        body: &str,
    ) -> Result<(), AppError>;
}

/// reqwest-backed implementation against the GitLab v4 API.
pub struct HttpGitLabClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

/// CODEOWNERS locations GitLab checks, in order.
const CODEOWNERS_PATHS: [&str; 3] = ["CODEOWNERS", ".gitlab/CODEOWNERS", "docs/CODEOWNERS"];

impl HttpGitLabClient {
    pub fn new(base_url: &str, token: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client,
        }
    }

    fn api(&self, path: &str) -> String {
        format!("{}/api/v4/{path}", self.base_url)
    }
}

#[async_trait]
impl GitLabClient for HttpGitLabClient {
    async fn codeowners(&self, project_id: i64) -> Result<Option<String>, AppError> {
        for path in CODEOWNERS_PATHS {
            let encoded = path.replace('/', "%2F");
            let url = self.api(&format!(
                "projects/{project_id}/repository/files/{encoded}/raw?ref=HEAD"
            ));
            let resp = self
                .client
                .get(&url)
                .header("PRIVATE-TOKEN", &self.token)
                .send()
                .await?;

            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                continue;
            }
            if !resp.status().is_success() {
                return Err(AppError::Transient(format!(
                    "GitLab CODEOWNERS fetch returned {}",
                    resp.status()
                )));
            }
            return Ok(Some(resp.text().await?));
        }
        Ok(None)
    }

    async fn changed_files(&self, project_id: i64, mr_iid: i64) -> Result<Vec<String>, AppError> {
        let url = self.api(&format!("projects/{project_id}/merge_requests/{mr_iid}/diffs"));
        let resp = self
            .client
            .get(&url)
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(AppError::Transient(format!(
                "GitLab diffs fetch returned {}",
                resp.status()
            )));
        }

        #[derive(serde::Deserialize)]
        struct Diff {
            new_path: String,
        }
        let diffs: Vec<Diff> = resp.json().await?;
        Ok(diffs.into_iter().map(|d| d.new_path).collect())
    }

    async fn user_status(&self, username: &str) -> Result<Option<String>, AppError> {
        let url = self.api(&format!("users/{username}/status"));
        let resp = self
            .client
            .get(&url)
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(AppError::Transient(format!(
                "GitLab user status returned {}",
                resp.status()
            )));
        }

        #[derive(serde::Deserialize)]
        struct Status {
            #[serde(default)]
            message: Option<String>,
        }
        let status: Status = resp.json().await?;
        Ok(status.message.filter(|m| !m.is_empty()))
    }

    async fn create_mr_note(
        &self,
        project_id: i64,
        mr_iid: i64,
        body: &str,
    ) -> Result<i64, AppError> {
        let url = self.api(&format!("projects/{project_id}/merge_requests/{mr_iid}/notes"));
        let resp = self
            .client
            .post(&url)
            .header("PRIVATE-TOKEN", &self.token)
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(AppError::Transient(format!(
                "GitLab note create returned {}",
                resp.status()
            )));
        }

        #[derive(serde::Deserialize)]
        struct Note {
            id: i64,
        }
        let note: Note = resp.json().await?;
        Ok(note.id)
    }

    async fn update_mr_note(
        &self,
        project_id: i64,
        mr_iid: i64,
        note_id: i64,
        body: &str,
    ) -> Result<(), AppError> {
        let url = self.api(&format!(
            "projects/{project_id}/merge_requests/{mr_iid}/notes/{note_id}"
        ));
        let resp = self
            .client
            .put(&url)
            .header("PRIVATE-TOKEN", &self.token)
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(AppError::Transient(format!(
                "GitLab note update returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}
