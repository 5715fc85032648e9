//! User lookups, roster reconciliation, and out-of-office queries.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::config::TeamConfig;
use crate::models::error::AppError;
use crate::models::user::{NewUser, User};
use crate::schema::{ooo_status, users};

pub async fn get(conn: &mut AsyncPgConnection, id: i64) -> Result<User, AppError> {
    users::table
        .find(id)
        .first::<User>(conn)
        .await
        .optional()?
        .ok_or(AppError::NotFound("user"))
}

pub async fn find_by_gitlab_id(
    conn: &mut AsyncPgConnection,
    gitlab_id: i64,
) -> Result<Option<User>, AppError> {
    let user = users::table
        .filter(users::gitlab_id.eq(gitlab_id))
        .first::<User>(conn)
        .await
        .optional()?;
    Ok(user)
}

pub async fn find_by_username(
    conn: &mut AsyncPgConnection,
    username: &str,
) -> Result<Option<User>, AppError> {
    let user = users::table
        .filter(users::username.eq(username))
        .first::<User>(conn)
        .await
        .optional()?;
    Ok(user)
}

/// All users, optionally restricted to one team.
pub async fn list(
    conn: &mut AsyncPgConnection,
    team: Option<&str>,
) -> Result<Vec<User>, AppError> {
    let mut query = users::table.into_boxed();
    if let Some(team) = team {
        query = query.filter(users::team.eq(team));
    }
    let list = query.order(users::username.asc()).load::<User>(conn).await?;
    Ok(list)
}

/// All users NOT on the given team (external reviewer pool).
pub async fn list_other_teams(
    conn: &mut AsyncPgConnection,
    team: &str,
) -> Result<Vec<User>, AppError> {
    let list = users::table
        .filter(users::team.ne(team))
        .order(users::username.asc())
        .load::<User>(conn)
        .await?;
    Ok(list)
}

/// Reconcile configured team rosters into the users table. Idempotent:
/// members are matched by GitLab id first, then by username; matches are
/// updated in place, everything else is inserted.
pub async fn reconcile_rosters(
    conn: &mut AsyncPgConnection,
    teams: &[TeamConfig],
) -> Result<usize, AppError> {
    let mut synced = 0usize;

    for team in teams {
        for member in &team.members {
            let existing = match find_by_gitlab_id(conn, member.gitlab_id).await? {
                Some(u) => Some(u),
                None => find_by_username(conn, &member.username).await?,
            };

            match existing {
                Some(user) => {
                    diesel::update(users::table.find(user.id))
                        .set((
                            users::gitlab_id.eq(member.gitlab_id),
                            users::username.eq(&member.username),
                            users::email.eq(&member.email),
                            users::role.eq(&member.role),
                            users::team.eq(&team.name),
                            users::updated_at.eq(Utc::now()),
                        ))
                        .execute(conn)
                        .await?;
                }
                None => {
                    diesel::insert_into(users::table)
                        .values(NewUser {
                            gitlab_id: member.gitlab_id,
                            username: member.username.clone(),
                            email: member.email.clone(),
                            role: member.role.clone(),
                            team: team.name.clone(),
                        })
                        .execute(conn)
                        .await?;
                }
            }
            synced += 1;
        }
    }

    tracing::info!(users = synced, teams = teams.len(), "Roster reconciliation complete");
    Ok(synced)
}

/// Ids of users with an OOO window covering `now`.
pub async fn ooo_user_ids(
    conn: &mut AsyncPgConnection,
    now: DateTime<Utc>,
) -> Result<HashSet<i64>, AppError> {
    let ids: Vec<i64> = ooo_status::table
        .filter(ooo_status::start_date.le(now))
        .filter(ooo_status::end_date.ge(now))
        .select(ooo_status::user_id)
        .distinct()
        .load(conn)
        .await?;
    Ok(ids.into_iter().collect())
}
