// engine/src/store/migrations.rs
//!
//! Schema history of the engine database. Scripts are applied in order and
//! the applied count lives in `PRAGMA user_version`.

use rusqlite::Connection;
use rusqlite_migration::{Migrations, M};

const SCHEMA_SCRIPTS: &[&str] = &[include_str!("migrations/V1__initial_schema.sql")];

pub fn runner() -> Migrations<'static> {
    Migrations::new(SCHEMA_SCRIPTS.iter().map(|sql| M::up(sql)).collect())
}

pub fn latest_version() -> i64 {
    SCHEMA_SCRIPTS.len() as i64
}

/// Version recorded in the database file.
pub fn applied_version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
}
