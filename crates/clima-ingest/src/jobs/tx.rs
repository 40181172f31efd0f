//! `BEGIN IMMEDIATE` transactions
//!
//! SQLite's default deferred transactions take the write lock on the first
//! write, so two readers that both try to upgrade can fail with SQLITE_BUSY
//! instead of waiting. Every job transition starts with `BEGIN IMMEDIATE`,
//! which reserves the write lock up front and waits out `busy_timeout`
//! while another process holds it.

use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqliteConnection, SqlitePool};

pub(crate) async fn begin_immediate(pool: &SqlitePool) -> sqlx::Result<ImmediateTransaction> {
    let mut conn = pool.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(ImmediateTransaction::new(conn))
}

/// A manual transaction that is rolled back unless committed
///
/// Dropping it unfinished closes the connection instead of returning it to
/// the pool; SQLite discards the open transaction when the connection closes.
pub(crate) struct ImmediateTransaction {
    conn: PoolConnection<Sqlite>,
    finished: bool,
}

impl ImmediateTransaction {
    fn new(conn: PoolConnection<Sqlite>) -> Self {
        Self {
            conn,
            finished: false,
        }
    }

    pub(crate) async fn commit(mut self) -> sqlx::Result<()> {
        sqlx::query("COMMIT").execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }
}

impl std::ops::Deref for ImmediateTransaction {
    type Target = SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl std::ops::DerefMut for ImmediateTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for ImmediateTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.conn.close_on_drop();
        }
    }
}
