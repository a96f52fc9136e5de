use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::error::{Error, Result};
use crate::model::{Document, DocumentPatch, FileType};

const COLUMNS: &str = "id, title, description, filename, original_name, file_size, file_type, \
                       is_visible, sort_order, section_id, subsection_id, created_at";

/// A document row before it has an id.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub title: String,
    pub description: Option<String>,
    pub filename: String,
    pub original_name: String,
    pub file_size: i64,
    pub file_type: FileType,
    pub is_visible: bool,
    pub sort_order: i64,
    pub section_id: Option<i64>,
    pub subsection_id: Option<i64>,
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<Document> {
    let file_type: String = row.get(6)?;
    Ok(Document {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        filename: row.get(3)?,
        original_name: row.get(4)?,
        file_size: row.get::<_, Option<i64>>(5)?.unwrap_or(0),
        file_type: FileType::parse(&file_type).unwrap_or(FileType::Image),
        is_visible: row.get(7)?,
        sort_order: row.get(8)?,
        section_id: row.get(9)?,
        subsection_id: row.get(10)?,
        created_at: row.get(11)?,
    })
}

pub fn list(conn: &Connection, visible_only: bool) -> Result<Vec<Document>> {
    let filter = if visible_only { "WHERE is_visible = 1" } else { "" };
    let sql = format!(
        "SELECT {COLUMNS} FROM documents {filter} ORDER BY sort_order ASC, created_at DESC, id DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Every row in primary-key order.
pub fn all(conn: &Connection) -> Result<Vec<Document>> {
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM documents ORDER BY id"))?;
    let rows = stmt.query_map([], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn get(conn: &Connection, id: i64) -> Result<Document> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM documents WHERE id = ?1"),
        [id],
        from_row,
    )
    .optional()?
    .ok_or_else(|| Error::not_found(format!("document {id} not found")))
}

pub fn find_by_filename(conn: &Connection, filename: &str) -> Result<Option<Document>> {
    Ok(conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM documents WHERE filename = ?1"),
            [filename],
            from_row,
        )
        .optional()?)
}

pub fn insert(conn: &Connection, doc: &NewDocument) -> Result<Document> {
    conn.execute(
        "INSERT INTO documents (title, description, filename, original_name, file_size, file_type, \
         is_visible, sort_order, section_id, subsection_id, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            doc.title,
            doc.description,
            doc.filename,
            doc.original_name,
            doc.file_size,
            doc.file_type.as_str(),
            doc.is_visible,
            doc.sort_order,
            doc.section_id,
            doc.subsection_id,
            super::now_timestamp(),
        ],
    )
    .map_err(|e| Error::msg(format!("failed to insert document {}: {e}", doc.filename)))?;
    get(conn, conn.last_insert_rowid())
}

/// Apply `patch` with one UPDATE; on error the row keeps its prior values.
pub fn update(conn: &Connection, id: i64, patch: &DocumentPatch) -> Result<Document> {
    let mut doc = get(conn, id)?;
    if let Some(title) = &patch.title {
        doc.title = title.clone();
    }
    if let Some(description) = &patch.description {
        doc.description = description.clone();
    }
    if let Some(visible) = patch.is_visible {
        doc.is_visible = visible;
    }
    if let Some(section_id) = patch.section_id {
        doc.section_id = section_id;
    }
    if let Some(subsection_id) = patch.subsection_id {
        doc.subsection_id = subsection_id;
    }
    conn.execute(
        "UPDATE documents SET title = ?1, description = ?2, is_visible = ?3, \
         section_id = ?4, subsection_id = ?5 WHERE id = ?6",
        params![
            doc.title,
            doc.description,
            doc.is_visible,
            doc.section_id,
            doc.subsection_id,
            id
        ],
    )
    .map_err(|e| Error::msg(format!("failed to update document {id}: {e}")))?;
    Ok(doc)
}

pub fn delete(conn: &Connection, id: i64) -> Result<bool> {
    let n = conn.execute("DELETE FROM documents WHERE id = ?1", [id])?;
    Ok(n > 0)
}

/// Assign `sort_order` by position in `ids`, in one transaction.
pub fn reorder(conn: &Connection, ids: &[i64]) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    for (pos, id) in ids.iter().enumerate() {
        let n = tx.execute(
            "UPDATE documents SET sort_order = ?1 WHERE id = ?2",
            params![pos as i64, id],
        )?;
        if n == 0 {
            return Err(Error::not_found(format!("document {id} not found")));
        }
    }
    tx.commit()?;
    Ok(())
}

/// Drop every row and insert `docs` instead, in one transaction.
pub fn replace_all(conn: &Connection, docs: &[NewDocument]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM documents", [])?;
    for doc in docs {
        insert(&tx, doc)?;
    }
    tx.commit()?;
    Ok(docs.len())
}

/// Insert rows keeping their ids. Caller owns the transaction.
pub fn insert_rows(conn: &Connection, docs: &[Document]) -> Result<usize> {
    let mut stmt = conn.prepare(&format!(
        "INSERT INTO documents ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
    ))?;
    for d in docs {
        stmt.execute(params![
            d.id,
            d.title,
            d.description,
            d.filename,
            d.original_name,
            d.file_size,
            d.file_type.as_str(),
            d.is_visible,
            d.sort_order,
            d.section_id,
            d.subsection_id,
            d.created_at,
        ])
        .map_err(|e| Error::msg(format!("failed to restore document {}: {e}", d.id)))?;
    }
    Ok(docs.len())
}

/// Null section/subsection references that point at missing rows.
pub fn clear_dangling_refs(conn: &Connection) -> Result<usize> {
    let a = conn.execute(
        "UPDATE documents SET section_id = NULL WHERE section_id IS NOT NULL \
         AND section_id NOT IN (SELECT id FROM sections)",
        [],
    )?;
    let b = conn.execute(
        "UPDATE documents SET subsection_id = NULL WHERE subsection_id IS NOT NULL \
         AND subsection_id NOT IN (SELECT id FROM subsections)",
        [],
    )?;
    Ok(a + b)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocumentCounts {
    pub total: i64,
    pub visible: i64,
}

pub fn counts(conn: &Connection) -> Result<DocumentCounts> {
    Ok(conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(CASE WHEN is_visible = 1 THEN 1 ELSE 0 END), 0) FROM documents",
        [],
        |row| {
            Ok(DocumentCounts {
                total: row.get(0)?,
                visible: row.get(1)?,
            })
        },
    )?)
}
