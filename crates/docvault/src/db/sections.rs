use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::error::{Error, Result};
use crate::model::{Section, SectionInput, Subsection};

fn section_from_row(row: &Row<'_>) -> rusqlite::Result<Section> {
    Ok(Section {
        id: row.get(0)?,
        name: row.get(1)?,
        sort_order: row.get(2)?,
        is_visible: row.get(3)?,
    })
}

fn subsection_from_row(row: &Row<'_>) -> rusqlite::Result<Subsection> {
    Ok(Subsection {
        id: row.get(0)?,
        section_id: row.get(1)?,
        name: row.get(2)?,
        sort_order: row.get(3)?,
        is_visible: row.get(4)?,
    })
}

fn check_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::validation("section name is empty"));
    }
    Ok(name)
}

pub fn list_sections(conn: &Connection) -> Result<Vec<Section>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, sort_order, is_visible FROM sections ORDER BY sort_order, id",
    )?;
    let rows = stmt.query_map([], section_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn list_subsections(conn: &Connection) -> Result<Vec<Subsection>> {
    let mut stmt = conn.prepare(
        "SELECT id, section_id, name, sort_order, is_visible FROM subsections \
         ORDER BY section_id, sort_order, id",
    )?;
    let rows = stmt.query_map([], subsection_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn get_section(conn: &Connection, id: i64) -> Result<Section> {
    conn.query_row(
        "SELECT id, name, sort_order, is_visible FROM sections WHERE id = ?1",
        [id],
        section_from_row,
    )
    .optional()?
    .ok_or_else(|| Error::not_found(format!("section {id} not found")))
}

pub fn get_subsection(conn: &Connection, id: i64) -> Result<Subsection> {
    conn.query_row(
        "SELECT id, section_id, name, sort_order, is_visible FROM subsections WHERE id = ?1",
        [id],
        subsection_from_row,
    )
    .optional()?
    .ok_or_else(|| Error::not_found(format!("subsection {id} not found")))
}

pub fn create_section(conn: &Connection, input: &SectionInput) -> Result<Section> {
    let name = check_name(&input.name)?;
    conn.execute(
        "INSERT INTO sections (name, sort_order, is_visible) VALUES (?1, ?2, ?3)",
        params![name, input.sort_order, input.is_visible],
    )?;
    get_section(conn, conn.last_insert_rowid())
}

pub fn update_section(conn: &Connection, id: i64, input: &SectionInput) -> Result<Section> {
    let name = check_name(&input.name)?;
    let n = conn.execute(
        "UPDATE sections SET name = ?1, sort_order = ?2, is_visible = ?3 WHERE id = ?4",
        params![name, input.sort_order, input.is_visible, id],
    )?;
    if n == 0 {
        return Err(Error::not_found(format!("section {id} not found")));
    }
    get_section(conn, id)
}

/// Delete a section, its subsections, and every document reference to
/// either, in one transaction.
pub fn delete_section(conn: &Connection, id: i64) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE documents SET subsection_id = NULL \
         WHERE subsection_id IN (SELECT id FROM subsections WHERE section_id = ?1)",
        [id],
    )?;
    tx.execute(
        "UPDATE documents SET section_id = NULL WHERE section_id = ?1",
        [id],
    )?;
    tx.execute("DELETE FROM subsections WHERE section_id = ?1", [id])?;
    let n = tx.execute("DELETE FROM sections WHERE id = ?1", [id])?;
    if n == 0 {
        return Err(Error::not_found(format!("section {id} not found")));
    }
    tx.commit()?;
    Ok(())
}

pub fn create_subsection(
    conn: &Connection,
    section_id: i64,
    input: &SectionInput,
) -> Result<Subsection> {
    let name = check_name(&input.name)?;
    get_section(conn, section_id)?;
    conn.execute(
        "INSERT INTO subsections (section_id, name, sort_order, is_visible) VALUES (?1, ?2, ?3, ?4)",
        params![section_id, name, input.sort_order, input.is_visible],
    )?;
    get_subsection(conn, conn.last_insert_rowid())
}

pub fn update_subsection(conn: &Connection, id: i64, input: &SectionInput) -> Result<Subsection> {
    let name = check_name(&input.name)?;
    let n = conn.execute(
        "UPDATE subsections SET name = ?1, sort_order = ?2, is_visible = ?3 WHERE id = ?4",
        params![name, input.sort_order, input.is_visible, id],
    )?;
    if n == 0 {
        return Err(Error::not_found(format!("subsection {id} not found")));
    }
    get_subsection(conn, id)
}

pub fn delete_subsection(conn: &Connection, id: i64) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE documents SET subsection_id = NULL WHERE subsection_id = ?1",
        [id],
    )?;
    let n = tx.execute("DELETE FROM subsections WHERE id = ?1", [id])?;
    if n == 0 {
        return Err(Error::not_found(format!("subsection {id} not found")));
    }
    tx.commit()?;
    Ok(())
}

/// Check that a section/subsection pair can be referenced by a document.
pub fn check_refs(
    conn: &Connection,
    section_id: Option<i64>,
    subsection_id: Option<i64>,
) -> Result<()> {
    if let Some(id) = section_id {
        get_section(conn, id).map_err(|_| Error::validation(format!("section {id} does not exist")))?;
    }
    if let Some(id) = subsection_id {
        let sub = get_subsection(conn, id)
            .map_err(|_| Error::validation(format!("subsection {id} does not exist")))?;
        if let Some(section) = section_id
            && sub.section_id != section
        {
            return Err(Error::validation(format!(
                "subsection {id} does not belong to section {section}"
            )));
        }
    }
    Ok(())
}

/// Remove subsections whose owning section no longer exists.
pub fn delete_orphan_subsections(conn: &Connection) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM subsections WHERE section_id NOT IN (SELECT id FROM sections)",
        [],
    )?)
}

pub fn insert_section_rows(conn: &Connection, rows: &[Section]) -> Result<usize> {
    let mut stmt = conn.prepare(
        "INSERT INTO sections (id, name, sort_order, is_visible) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for s in rows {
        stmt.execute(params![s.id, s.name, s.sort_order, s.is_visible])?;
    }
    Ok(rows.len())
}

pub fn insert_subsection_rows(conn: &Connection, rows: &[Subsection]) -> Result<usize> {
    let mut stmt = conn.prepare(
        "INSERT INTO subsections (id, section_id, name, sort_order, is_visible) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for s in rows {
        stmt.execute(params![s.id, s.section_id, s.name, s.sort_order, s.is_visible])?;
    }
    Ok(rows.len())
}
