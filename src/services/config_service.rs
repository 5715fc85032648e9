//! Runtime-adjustable configuration stored as key -> JSON rows.

use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::Deserialize;

use crate::models::error::AppError;
use crate::schema::configuration;

/// Scoring weights for the roulette, overridable via the
/// `roulette.weights` configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RouletteWeights {
    pub current_load: f64,
    pub recent_review: f64,
    pub expertise_bonus: f64,
}

impl Default for RouletteWeights {
    fn default() -> Self {
        Self {
            current_load: 10.0,
            recent_review: 5.0,
            expertise_bonus: 15.0,
        }
    }
}

/// File-path expertise globs per user role, from `roulette.expertise`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExpertiseGlobs {
    pub dev: Vec<String>,
    pub ops: Vec<String>,
}

impl ExpertiseGlobs {
    pub fn for_role(&self, role: &str) -> &[String] {
        match role {
            "ops" => &self.ops,
            _ => &self.dev,
        }
    }
}

/// Read a raw configuration value.
pub async fn get(
    conn: &mut AsyncPgConnection,
    key: &str,
) -> Result<Option<serde_json::Value>, AppError> {
    let value = configuration::table
        .filter(configuration::key.eq(key))
        .select(configuration::value)
        .first::<serde_json::Value>(conn)
        .await
        .optional()?;
    Ok(value)
}

/// Upsert a configuration value.
pub async fn set(
    conn: &mut AsyncPgConnection,
    key: &str,
    value: &serde_json::Value,
) -> Result<(), AppError> {
    diesel::insert_into(configuration::table)
        .values((
            configuration::key.eq(key),
            configuration::value.eq(value),
            configuration::updated_at.eq(chrono::Utc::now()),
        ))
        .on_conflict(configuration::key)
        .do_update()
        .set((
            configuration::value.eq(value),
            configuration::updated_at.eq(chrono::Utc::now()),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

/// Roulette scoring weights; defaults apply when the key is absent or
/// malformed (a bad override should not break selection).
pub async fn roulette_weights(conn: &mut AsyncPgConnection) -> Result<RouletteWeights, AppError> {
    Ok(load_typed(conn, "roulette.weights").await?.unwrap_or_default())
}

/// Expertise glob lists per role.
pub async fn expertise_globs(conn: &mut AsyncPgConnection) -> Result<ExpertiseGlobs, AppError> {
    Ok(load_typed(conn, "roulette.expertise").await?.unwrap_or_default())
}

/// Keywords in a GitLab status message that mark a user unavailable.
pub async fn ooo_keywords(conn: &mut AsyncPgConnection) -> Result<Vec<String>, AppError> {
    let configured: Option<Vec<String>> = load_typed(conn, "availability.ooo_keywords").await?;
    Ok(configured.unwrap_or_else(|| {
        ["ooo", "out of office", "vacation", "pto"]
            .into_iter()
            .map(String::from)
            .collect()
    }))
}

async fn load_typed<T: serde::de::DeserializeOwned>(
    conn: &mut AsyncPgConnection,
    key: &str,
) -> Result<Option<T>, AppError> {
    match get(conn, key).await? {
        Some(raw) => match serde_json::from_value(raw) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                tracing::warn!(key, error = %e, "Malformed configuration value, using defaults");
                Ok(None)
            }
        },
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_match_documented_values() {
        let w = RouletteWeights::default();
        assert_eq!(w.current_load, 10.0);
        assert_eq!(w.recent_review, 5.0);
        assert_eq!(w.expertise_bonus, 15.0);
    }

    #[test]
    fn weights_deserialize_partially() {
        let w: RouletteWeights =
            serde_json::from_value(serde_json::json!({"expertise_bonus": 20})).unwrap();
        assert_eq!(w.current_load, 10.0);
        assert_eq!(w.expertise_bonus, 20.0);
    }

    #[test]
    fn expertise_falls_back_to_dev_for_unknown_roles() {
        let globs = ExpertiseGlobs {
            dev: vec!["src/**".into()],
            ops: vec!["deploy/**".into()],
        };
        assert_eq!(globs.for_role("ops"), &["deploy/**".to_string()][..]);
        assert_eq!(globs.for_role("dev"), &["src/**".to_string()][..]);
        assert_eq!(globs.for_role("intern"), &["src/**".to_string()][..]);
    }
}
