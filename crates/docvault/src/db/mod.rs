//! SQLite relational store.

pub mod admin;
pub mod blocks;
pub mod documents;
pub mod sections;

use std::path::Path;

use rusqlite::Connection;

use crate::error::{Error, Result};
use crate::model::{BlockBody, LEGAL_BLOCK_NAME, SEED_BLOCK_NAMES};

const LATEST_SCHEMA_VERSION: i64 = 1;

pub fn open(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        crate::util::ensure_dir(parent)?;
    }
    let conn = Connection::open(db_path)
        .map_err(|e| Error::msg(format!("failed to open database {}: {e}", db_path.display())))?;
    prepare(conn)
}

pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()
        .map_err(|e| Error::msg(format!("failed to open in-memory database: {e}")))?;
    prepare(conn)
}

fn prepare(conn: Connection) -> Result<Connection> {
    set_foreign_keys(&conn, true)?;
    apply_migrations(&conn)?;
    Ok(conn)
}

/// Must be called outside a transaction; SQLite ignores the pragma inside one.
pub fn set_foreign_keys(conn: &Connection, on: bool) -> Result<()> {
    conn.pragma_update(None, "foreign_keys", if on { "ON" } else { "OFF" })
        .map_err(|e| Error::msg(format!("failed to set foreign_keys pragma: {e}")))
}

pub fn apply_migrations(conn: &Connection) -> Result<()> {
    let current = schema_version(conn)?;
    if current > LATEST_SCHEMA_VERSION {
        return Err(Error::msg(format!(
            "database schema version {current} is newer than supported {LATEST_SCHEMA_VERSION}"
        )));
    }
    if current < 1 {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| Error::msg(format!("failed to begin migration transaction: {e}")))?;
        tx.execute_batch(include_str!("../../migrations/0001_init.sql"))
            .map_err(|e| Error::msg(format!("failed to apply migration 0001: {e}")))?;
        tx.pragma_update(None, "user_version", 1i64)
            .map_err(|e| Error::msg(format!("failed to set schema user_version: {e}")))?;
        tx.commit()
            .map_err(|e| Error::msg(format!("failed to commit migration 0001: {e}")))?;
        tracing::debug!(version = 1, "applied schema migration");
    }
    Ok(())
}

fn schema_version(conn: &Connection) -> Result<i64> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| Error::msg(format!("failed to read schema user_version: {e}")))
}

/// Current UTC time in SQLite's `CURRENT_TIMESTAMP` format.
pub fn now_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn seed_body(name: &str) -> BlockBody {
    match name {
        LEGAL_BLOCK_NAME => BlockBody::LegalText(String::new()),
        "advantages" | "courses" | "footer" => BlockBody::Items(Vec::new()),
        _ => BlockBody::Empty,
    }
}

/// Insert every seed block that is missing. Returns the names inserted.
pub fn seed_blocks(conn: &Connection) -> Result<Vec<String>> {
    let mut inserted = Vec::new();
    for name in SEED_BLOCK_NAMES {
        if blocks::get_by_name(conn, name)?.is_some() {
            continue;
        }
        blocks::insert_default(conn, name, &seed_body(name))?;
        tracing::info!(block = *name, "seeded content block");
        inserted.push((*name).to_string());
    }
    Ok(inserted)
}
