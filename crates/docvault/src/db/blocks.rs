use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::error::{Error, Result};
use crate::model::{BlockBody, BlockPatch, ContentBlock};

const COLUMNS: &str =
    "id, name, title, subtitle, content, button_text, button_link, image, items, is_visible, updated_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<ContentBlock> {
    let name: String = row.get(1)?;
    let items: Option<String> = row.get(8)?;
    let body = BlockBody::decode_text(&name, items.as_deref());
    Ok(ContentBlock {
        id: row.get(0)?,
        name,
        title: row.get(2)?,
        subtitle: row.get(3)?,
        content: row.get(4)?,
        button_text: row.get(5)?,
        button_link: row.get(6)?,
        image: row.get(7)?,
        body,
        is_visible: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

pub fn list(conn: &Connection, visible_only: bool) -> Result<Vec<ContentBlock>> {
    let filter = if visible_only { "WHERE is_visible = 1" } else { "" };
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM blocks {filter} ORDER BY id"))?;
    let rows = stmt.query_map([], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn get(conn: &Connection, id: i64) -> Result<ContentBlock> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM blocks WHERE id = ?1"),
        [id],
        from_row,
    )
    .optional()?
    .ok_or_else(|| Error::not_found(format!("block {id} not found")))
}

pub fn get_by_name(conn: &Connection, name: &str) -> Result<Option<ContentBlock>> {
    Ok(conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM blocks WHERE name = ?1"),
            [name],
            from_row,
        )
        .optional()?)
}

/// Whether any block's `image` names `filename`, bare or as the last path
/// segment of a URL.
pub fn references_image(conn: &Connection, filename: &str) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM blocks WHERE image = ?1 OR image LIKE '%/' || ?1)",
        [filename],
        |row| row.get(0),
    )?)
}

pub(crate) fn insert_default(conn: &Connection, name: &str, body: &BlockBody) -> Result<()> {
    conn.execute(
        "INSERT INTO blocks (name, title, subtitle, content, button_text, button_link, items, \
         is_visible, updated_at) VALUES (?1, '', '', '', '', '', ?2, 1, ?3)",
        params![name, body.encode_text(), super::now_timestamp()],
    )
    .map_err(|e| Error::msg(format!("failed to seed block {name}: {e}")))?;
    Ok(())
}

/// Apply `patch` with one UPDATE. `items` is decoded against the block's
/// name first; a shape that does not fit is rejected before anything is
/// written.
pub fn update(conn: &Connection, id: i64, patch: &BlockPatch) -> Result<ContentBlock> {
    let mut block = get(conn, id)?;
    if let Some(items) = &patch.items {
        block.body = BlockBody::decode(&block.name, Some(items.clone()))
            .map_err(|e| Error::validation(e.to_string()))?;
    }
    let text_fields = [
        (&mut block.title, &patch.title),
        (&mut block.subtitle, &patch.subtitle),
        (&mut block.content, &patch.content),
        (&mut block.button_text, &patch.button_text),
        (&mut block.button_link, &patch.button_link),
    ];
    for (field, value) in text_fields {
        if let Some(v) = value {
            *field = Some(v.clone());
        }
    }
    if let Some(image) = &patch.image {
        block.image = image.clone();
    }
    if let Some(visible) = patch.is_visible {
        block.is_visible = visible;
    }
    let updated_at = super::now_timestamp();
    conn.execute(
        "UPDATE blocks SET title = ?1, subtitle = ?2, content = ?3, button_text = ?4, \
         button_link = ?5, image = ?6, items = ?7, is_visible = ?8, updated_at = ?9 WHERE id = ?10",
        params![
            block.title,
            block.subtitle,
            block.content,
            block.button_text,
            block.button_link,
            block.image,
            block.body.encode_text(),
            block.is_visible,
            updated_at,
            id,
        ],
    )
    .map_err(|e| Error::msg(format!("failed to update block {id}: {e}")))?;
    block.updated_at = Some(updated_at);
    Ok(block)
}

/// Insert rows keeping their ids. Caller owns the transaction.
pub fn insert_rows(conn: &Connection, blocks: &[ContentBlock]) -> Result<usize> {
    let mut stmt = conn.prepare(&format!(
        "INSERT INTO blocks ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
    ))?;
    for b in blocks {
        stmt.execute(params![
            b.id,
            b.name,
            b.title,
            b.subtitle,
            b.content,
            b.button_text,
            b.button_link,
            b.image,
            b.body.encode_text(),
            b.is_visible,
            b.updated_at,
        ])
        .map_err(|e| Error::msg(format!("failed to restore block {}: {e}", b.name)))?;
    }
    Ok(blocks.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::model::LEGAL_BLOCK_NAME;
    use serde_json::json;

    #[test]
    fn update_rewrites_only_given_fields() {
        let conn = db::open_in_memory().expect("db");
        db::seed_blocks(&conn).expect("seed");
        let hero = get_by_name(&conn, "hero").expect("query").expect("hero");
        let patch = BlockPatch {
            title: Some("Learn to drive".into()),
            items: Some(json!([{ "title": "Fast" }])),
            ..BlockPatch::default()
        };
        let updated = update(&conn, hero.id, &patch).expect("update");
        assert_eq!(updated.title.as_deref(), Some("Learn to drive"));
        assert_eq!(updated.subtitle.as_deref(), Some(""));
        let stored = get(&conn, hero.id).expect("get");
        assert_eq!(stored.body, BlockBody::Items(vec![json!({ "title": "Fast" })]));
    }

    #[test]
    fn legal_block_rejects_list_items() {
        let conn = db::open_in_memory().expect("db");
        db::seed_blocks(&conn).expect("seed");
        let legal = get_by_name(&conn, LEGAL_BLOCK_NAME)
            .expect("query")
            .expect("legal");
        let patch = BlockPatch {
            title: Some("changed".into()),
            items: Some(json!(["not", "text"])),
            ..BlockPatch::default()
        };
        let err = update(&conn, legal.id, &patch).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
        let stored = get(&conn, legal.id).expect("get");
        assert_eq!(stored.title.as_deref(), Some(""));
    }

    #[test]
    fn corrupt_items_column_reads_as_empty() {
        let conn = db::open_in_memory().expect("db");
        db::seed_blocks(&conn).expect("seed");
        conn.execute("UPDATE blocks SET items = '{broken' WHERE name = 'courses'", [])
            .expect("corrupt");
        let courses = get_by_name(&conn, "courses").expect("query").expect("courses");
        assert_eq!(courses.body, BlockBody::Empty);
    }

    #[test]
    fn image_references_match_bare_names_and_urls() {
        let conn = db::open_in_memory().expect("db");
        db::seed_blocks(&conn).expect("seed");
        let hero = get_by_name(&conn, "hero").expect("query").expect("hero");
        assert!(!references_image(&conn, "banner.jpg").expect("query"));
        let patch = BlockPatch {
            image: Some(Some("/uploads/banner.jpg".into())),
            ..BlockPatch::default()
        };
        update(&conn, hero.id, &patch).expect("update");
        assert!(references_image(&conn, "banner.jpg").expect("query"));
        assert!(!references_image(&conn, "other.jpg").expect("query"));
    }
}
