//! Reviewer availability — OOO windows from the store plus GitLab status
//! messages, with the status lookups cached in Redis.

use std::collections::HashSet;
use std::time::Duration;

use diesel_async::AsyncPgConnection;

use crate::cache::{availability_key, Cache};
use crate::models::error::AppError;
use crate::models::user::User;
use crate::services::config_service;
use crate::services::gitlab::GitLabClient;

/// How long a GitLab status verdict stays cached.
const STATUS_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Ids of users whose GitLab status message marks them unavailable.
/// Status fetch failures degrade to "available" — an unreachable GitLab must
/// not empty the reviewer pools.
pub async fn unavailable_by_status(
    conn: &mut AsyncPgConnection,
    cache: &Cache,
    gitlab: &dyn GitLabClient,
    users: &[User],
) -> Result<HashSet<i64>, AppError> {
    let keywords = config_service::ooo_keywords(conn).await?;
    let mut unavailable = HashSet::new();

    for user in users {
        if !is_available(cache, gitlab, &user.username, &keywords).await {
            unavailable.insert(user.id);
        }
    }

    Ok(unavailable)
}

async fn is_available(
    cache: &Cache,
    gitlab: &dyn GitLabClient,
    username: &str,
    keywords: &[String],
) -> bool {
    let key = availability_key(username);
    match cache.get(&key).await {
        Ok(Some(cached)) => return cached == "1",
        Ok(None) => {}
        Err(e) => tracing::debug!(username, error = %e, "Availability cache read failed"),
    }

    let available = match gitlab.user_status(username).await {
        Ok(Some(message)) => !status_is_ooo(&message, keywords),
        Ok(None) => true,
        Err(e) => {
            tracing::debug!(username, error = %e, "GitLab status lookup failed");
            true
        }
    };

    let value = if available { "1" } else { "0" };
    if let Err(e) = cache.set(&key, value, STATUS_CACHE_TTL).await {
        tracing::debug!(username, error = %e, "Availability cache write failed");
    }
    available
}

/// Case-insensitive keyword match against a status message.
pub fn status_is_ooo(message: &str, keywords: &[String]) -> bool {
    let message = message.to_lowercase();
    keywords.iter().any(|k| message.contains(&k.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keywords() -> Vec<String> {
        ["ooo", "out of office", "vacation", "pto"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    #[test]
    fn matches_keywords_case_insensitively() {
        assert!(status_is_ooo("OOO until Monday", &keywords()));
        assert!(status_is_ooo("On Vacation 🏖️", &keywords()));
        assert!(status_is_ooo("out of office", &keywords()));
        assert!(!status_is_ooo("reviewing MRs all day", &keywords()));
    }

    #[test]
    fn empty_message_is_available() {
        assert!(!status_is_ooo("", &keywords()));
    }
}
