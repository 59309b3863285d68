use crate::errors::{AppError, AppResult};
use diesel::r2d2::{ConnectionManager, Pool, PoolError};
use diesel::PgConnection;

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

pub fn create_conn(database_url: &str) -> Result<DbPool, PoolError> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Pool::builder().build(manager)
}

/// Runs a diesel closure on the blocking thread pool with a pooled connection.
pub async fn blocking<F, T>(pool: &DbPool, f: F) -> AppResult<T>
where
    F: FnOnce(&mut PgConnection) -> AppResult<T> + Send + 'static,
    T: Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get().map_err(AppError::Pool)?;
        f(&mut conn)
    })
    .await?
}
