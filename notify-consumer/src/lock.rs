use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("advisory lock query failed with: {0}")]
    Query(#[from] sqlx::Error),
}

/// Distributed mutual exclusion for a named task, backed by a PostgreSQL
/// advisory lock. At most one holder across all processes at any time.
pub struct PgTaskLock {
    pool: PgPool,
    task_name: String,
}

/// Held lock. The advisory lock is tied to the underlying connection, which
/// the guard keeps checked out of the pool; call [`TaskLockGuard::release`]
/// when done. If the connection is lost the lock falls away with it.
pub struct TaskLockGuard {
    conn: PoolConnection<Postgres>,
    task_name: String,
}

impl PgTaskLock {
    pub fn new(pool: PgPool, task_name: &str) -> Self {
        Self {
            pool,
            task_name: task_name.to_owned(),
        }
    }

    /// Try to take the lock without waiting. `None` means another instance
    /// holds it.
    pub async fn try_acquire(&self) -> Result<Option<TaskLockGuard>, LockError> {
        let mut conn = self.pool.acquire().await?;

        let (locked,): (bool,) =
            sqlx::query_as("SELECT pg_try_advisory_lock(hashtext($1)::bigint)")
                .bind(&self.task_name)
                .fetch_one(conn.as_mut())
                .await?;

        if locked {
            Ok(Some(TaskLockGuard {
                conn,
                task_name: self.task_name.clone(),
            }))
        } else {
            Ok(None)
        }
    }
}

impl TaskLockGuard {
    /// Release the lock and return the connection to the pool.
    pub async fn release(mut self) -> Result<(), LockError> {
        sqlx::query("SELECT pg_advisory_unlock(hashtext($1)::bigint)")
            .bind(&self.task_name)
            .execute(self.conn.as_mut())
            .await?;

        Ok(())
    }
}
