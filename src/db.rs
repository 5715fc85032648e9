//! Async PostgreSQL connection pool.

use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;

pub type PgPool = Pool<AsyncPgConnection>;

/// Build a bb8 pool for the given database URL.
pub async fn connect(database_url: &str, max_size: u32) -> anyhow::Result<PgPool> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = Pool::builder()
        .max_size(max_size)
        .build(manager)
        .await
        .map_err(|e| anyhow::anyhow!("database pool: {e}"))?;
    Ok(pool)
}
