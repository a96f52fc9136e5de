use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{Error, Result};
use crate::model::AdminUser;

pub fn count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM admin_users", [], |row| row.get(0))?)
}

/// Credential metadata only; hashes are read through [`password_hash`].
pub fn list(conn: &Connection) -> Result<Vec<AdminUser>> {
    let mut stmt =
        conn.prepare("SELECT id, username, created_at FROM admin_users ORDER BY id")?;
    let rows = stmt.query_map([], |row| {
        Ok(AdminUser {
            id: row.get(0)?,
            username: row.get(1)?,
            created_at: row.get(2)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn password_hash(conn: &Connection, username: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT password_hash FROM admin_users WHERE username = ?1",
            [username],
            |row| row.get(0),
        )
        .optional()?)
}

pub fn insert(conn: &Connection, username: &str, hash: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO admin_users (username, password_hash, created_at) VALUES (?1, ?2, ?3)",
        params![username, hash, super::now_timestamp()],
    )
    .map_err(|e| Error::msg(format!("failed to create admin {username}: {e}")))?;
    Ok(())
}

pub fn set_password_hash(conn: &Connection, username: &str, hash: &str) -> Result<()> {
    let n = conn.execute(
        "UPDATE admin_users SET password_hash = ?1 WHERE username = ?2",
        params![hash, username],
    )?;
    if n == 0 {
        return Err(Error::not_found(format!("admin {username} not found")));
    }
    Ok(())
}
