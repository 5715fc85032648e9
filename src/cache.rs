//! Redis-backed ephemeral store — cached availability lookups and
//! set-if-absent distributed locks with TTL.

use std::time::Duration;

use crate::models::error::AppError;

#[derive(Clone)]
pub struct Cache {
    conn: redis::aio::ConnectionManager,
}

impl Cache {
    /// Connect and return a multiplexed connection manager. The manager
    /// reconnects on its own, so a handle can be cloned freely.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Set-if-absent with TTL. Returns true when this caller won the key.
    pub async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, AppError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    pub async fn del(&self, key: &str) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    /// Acquire a named distributed lock. Failure to acquire is not an error,
    /// it means another replica holds it.
    pub async fn acquire_lock(&self, name: &str, ttl: Duration) -> Result<bool, AppError> {
        self.set_nx(name, "1", ttl).await
    }

    pub async fn release_lock(&self, name: &str) -> Result<(), AppError> {
        self.del(name).await
    }
}

/// Lock key for the per-MR roulette critical section.
pub fn roulette_lock_key(project_id: i64, mr_iid: i64) -> String {
    format!("roulette:{project_id}:{mr_iid}")
}

/// Lock key for cross-replica scheduler jobs.
pub fn scheduler_lock_key(job: &str) -> String {
    format!("lock:scheduler:{job}")
}

/// Cache key for a user's availability lookup.
pub fn availability_key(username: &str) -> String {
    format!("availability:{username}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_keys_are_stable() {
        assert_eq!(roulette_lock_key(100, 1), "roulette:100:1");
        assert_eq!(
            scheduler_lock_key("daily_reminder"),
            "lock:scheduler:daily_reminder"
        );
        assert_eq!(availability_key("alice"), "availability:alice");
    }
}
