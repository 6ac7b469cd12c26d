// engine/src/store/mod.rs

pub mod migrations;

use crate::{DbPool, Error};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;

/// Applies every pending migration.
pub fn migrate_db(conn: &mut Connection) -> Result<(), Error> {
    migrations::runner().to_latest(conn)?;
    Ok(())
}

/// Opens a transaction that takes the write lock up front. A deferred
/// transaction that reads before writing cannot upgrade its lock while
/// another connection writes, and SQLite answers that with SQLITE_BUSY
/// without waiting out the busy timeout.
pub fn write_tx(conn: &Connection) -> Result<Transaction<'_>, Error> {
    Ok(Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?)
}

/// File-backed pool. WAL lets ledger readers proceed while a writer appends.
pub fn open_pool(path: &Path) -> Result<DbPool, Error> {
    let manager = SqliteConnectionManager::file(path).with_init(|conn| {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
    });
    let pool = r2d2::Pool::builder().max_size(8).build(manager)?;
    {
        let mut conn = pool.get()?;
        migrate_db(&mut conn)?;
    }
    Ok(pool)
}

/// Single-connection in-memory pool. Every connection of an in-memory
/// manager is a separate database, so the pool must never grow past one.
pub fn memory_pool() -> Result<DbPool, Error> {
    let manager = SqliteConnectionManager::memory()
        .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
    let pool = r2d2::Pool::builder().max_size(1).build(manager)?;
    {
        let mut conn = pool.get()?;
        migrate_db(&mut conn)?;
    }
    Ok(pool)
}
