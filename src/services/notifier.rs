//! Chat webhook notifier — roulette results and daily reminders.
//!
//! At-least-once delivery is sufficient; a disabled notifier is a configured
//! no-op, never an error.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ChatConfig;
use crate::models::error::AppError;

/// Structured chat message payload (Mattermost-compatible).
#[derive(Debug, Clone, Default, Serialize)]
pub struct Message {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub channel: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Attachment {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub fallback: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub color: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub title_link: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Field {
    pub short: bool,
    pub title: String,
    pub value: String,
}

/// A reviewer slot chosen by the roulette, for the notification summary.
#[derive(Debug, Clone)]
pub struct RoulettePick {
    pub role: &'static str,
    pub username: String,
}

/// A stale MR listed in the daily reminder.
#[derive(Debug, Clone)]
pub struct PendingMr {
    pub title: String,
    pub url: String,
    pub author: String,
    pub team: String,
    pub triggered_at: DateTime<Utc>,
}

impl PendingMr {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.triggered_at
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_message(&self, msg: &Message) -> Result<(), AppError>;

    /// Summarize a roulette selection for the MR's team channel.
    async fn send_roulette_result(
        &self,
        mr_title: &str,
        mr_url: &str,
        team: &str,
        picks: &[RoulettePick],
    ) -> Result<(), AppError>;

    /// Daily reminder listing pending MRs with age and author.
    async fn send_daily_reminder(&self, pending: &[PendingMr]) -> Result<(), AppError>;
}

/// Webhook-backed notifier.
pub struct ChatClient {
    webhook_url: String,
    channel: String,
    enabled: bool,
    client: reqwest::Client,
}

impl ChatClient {
    pub fn new(cfg: &ChatConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Self {
            webhook_url: cfg.webhook_url.clone(),
            channel: cfg.channel.clone(),
            enabled: cfg.enabled && !cfg.webhook_url.is_empty(),
            client,
        }
    }
}

#[async_trait]
impl Notifier for ChatClient {
    async fn send_message(&self, msg: &Message) -> Result<(), AppError> {
        if !self.enabled {
            tracing::debug!("Chat notifier disabled, skipping message");
            return Ok(());
        }

        let mut msg = msg.clone();
        if msg.channel.is_empty() {
            msg.channel = self.channel.clone();
        }

        let resp = self.client.post(&self.webhook_url).json(&msg).send().await?;
        if !resp.status().is_success() {
            return Err(AppError::Transient(format!(
                "chat webhook returned {}",
                resp.status()
            )));
        }

        tracing::debug!(channel = %msg.channel, "Sent chat message");
        Ok(())
    }

    async fn send_roulette_result(
        &self,
        mr_title: &str,
        mr_url: &str,
        team: &str,
        picks: &[RoulettePick],
    ) -> Result<(), AppError> {
        let msg = Message {
            text: format!(":game_die: Reviewers drawn for **{team}**"),
            attachments: vec![Attachment {
                fallback: format!("Reviewers assigned for {mr_title}"),
                color: "#36a64f".to_string(),
                title: mr_title.to_string(),
                title_link: mr_url.to_string(),
                fields: picks
                    .iter()
                    .map(|p| Field {
                        short: true,
                        title: slot_label(p.role).to_string(),
                        value: format!("@{}", p.username),
                    })
                    .collect(),
                ..Attachment::default()
            }],
            ..Message::default()
        };
        self.send_message(&msg).await
    }

    async fn send_daily_reminder(&self, pending: &[PendingMr]) -> Result<(), AppError> {
        if pending.is_empty() {
            return Ok(());
        }
        self.send_message(&build_reminder_message(pending, Utc::now()))
            .await
    }
}

fn slot_label(role: &str) -> &str {
    match role {
        "codeowner" => "Code owner",
        "team_member" => "Team member",
        "external" => "External",
        other => other,
    }
}

/// Build the reminder message body: one line per MR with age and author.
pub fn build_reminder_message(pending: &[PendingMr], now: DateTime<Utc>) -> Message {
    let mut lines = Vec::with_capacity(pending.len());
    for mr in pending {
        let age = mr.age(now);
        lines.push(format!(
            "- [{}]({}) — {} — waiting {} (by @{})",
            mr.title,
            mr.url,
            mr.team,
            format_age(age),
            mr.author,
        ));
    }

    Message {
        text: format!(
            ":hourglass: **{} merge request{} waiting for review**\n{}",
            pending.len(),
            if pending.len() == 1 { "" } else { "s" },
            lines.join("\n")
        ),
        ..Message::default()
    }
}

fn format_age(age: chrono::Duration) -> String {
    let hours = age.num_hours();
    if hours >= 48 {
        format!("{}d", age.num_days())
    } else {
        format!("{hours}h")
    }
}

#[cfg(test)]
pub mod testing {
    //! Recording fake used by roulette and scheduler tests.

    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct FakeNotifier {
        pub messages: Mutex<Vec<Message>>,
        pub roulette_results: Mutex<Vec<(String, Vec<RoulettePick>)>>,
        pub reminders: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Notifier for FakeNotifier {
        async fn send_message(&self, msg: &Message) -> Result<(), AppError> {
            self.messages.lock().unwrap().push(msg.clone());
            Ok(())
        }

        async fn send_roulette_result(
            &self,
            mr_title: &str,
            _mr_url: &str,
            _team: &str,
            picks: &[RoulettePick],
        ) -> Result<(), AppError> {
            self.roulette_results
                .lock()
                .unwrap()
                .push((mr_title.to_string(), picks.to_vec()));
            Ok(())
        }

        async fn send_daily_reminder(&self, pending: &[PendingMr]) -> Result<(), AppError> {
            self.reminders.lock().unwrap().push(pending.len());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn reminder_message_lists_each_mr_with_age() {
        let now = Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap();
        let pending = vec![
            PendingMr {
                title: "Add login page".into(),
                url: "https://gitlab.example.com/web/-/merge_requests/1".into(),
                author: "alice".into(),
                team: "frontend".into(),
                triggered_at: now - chrono::Duration::hours(6),
            },
            PendingMr {
                title: "Fix flaky deploy".into(),
                url: "https://gitlab.example.com/ops/-/merge_requests/9".into(),
                author: "bob".into(),
                team: "platform".into(),
                triggered_at: now - chrono::Duration::days(3),
            },
        ];

        let msg = build_reminder_message(&pending, now);
        assert!(msg.text.contains("2 merge requests waiting"));
        assert!(msg.text.contains("waiting 6h (by @alice)"));
        assert!(msg.text.contains("waiting 3d (by @bob)"));
    }

    #[test]
    fn age_formats_hours_then_days() {
        assert_eq!(format_age(chrono::Duration::hours(5)), "5h");
        assert_eq!(format_age(chrono::Duration::hours(47)), "47h");
        assert_eq!(format_age(chrono::Duration::hours(49)), "2d");
    }
}
