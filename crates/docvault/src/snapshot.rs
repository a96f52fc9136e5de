//! Snapshot Codec: the whole relational state as one timestamped JSON
//! document.

use std::fmt;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::db::{self, admin, blocks, documents, sections};
use crate::error::{Error, Result};
use crate::model::{AdminUser, ContentBlock, Document, Section, Subsection};
use crate::util::atomic_write;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub blocks: Vec<ContentBlock>,
    #[serde(default)]
    pub documents: Vec<Document>,
    #[serde(default)]
    pub sections: Vec<Section>,
    #[serde(default)]
    pub subsections: Vec<Subsection>,
    /// Metadata only; password hashes are never exported.
    #[serde(default)]
    pub admin_users: Vec<AdminUser>,
}

impl Snapshot {
    pub fn capture(conn: &Connection) -> Result<Self> {
        Ok(Self {
            timestamp: Utc::now(),
            blocks: blocks::list(conn, false)?,
            documents: documents::all(conn)?,
            sections: sections::list_sections(conn)?,
            subsections: sections::list_subsections(conn)?,
            admin_users: admin::list(conn)?,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| Error::msg(format!("failed to encode snapshot: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::parse(format!("invalid snapshot: {e}")))
    }

    /// Equal row sets in every table, timestamp ignored.
    pub fn same_content(&self, other: &Snapshot) -> bool {
        fn sorted<T: Clone, K: Ord>(rows: &[T], key: impl Fn(&T) -> K) -> Vec<T> {
            let mut v = rows.to_vec();
            v.sort_by_key(|r| key(r));
            v
        }
        sorted(&self.blocks, |b| b.id) == sorted(&other.blocks, |b| b.id)
            && sorted(&self.documents, |d| d.id) == sorted(&other.documents, |d| d.id)
            && sorted(&self.sections, |s| s.id) == sorted(&other.sections, |s| s.id)
            && sorted(&self.subsections, |s| s.id) == sorted(&other.subsections, |s| s.id)
            && sorted(&self.admin_users, |a| a.id) == sorted(&other.admin_users, |a| a.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TableOutcome {
    Restored { rows: usize },
    Skipped { reason: String },
    Failed { error: String },
}

impl fmt::Display for TableOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableOutcome::Restored { rows } => write!(f, "restored {rows} row(s)"),
            TableOutcome::Skipped { reason } => write!(f, "skipped ({reason})"),
            TableOutcome::Failed { error } => write!(f, "FAILED: {error}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub tables: Vec<(String, TableOutcome)>,
    /// Orphaned subsections dropped plus document references cleared.
    pub dangling_fixed: usize,
}

impl RestoreReport {
    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tables.iter().filter_map(|(t, o)| match o {
            TableOutcome::Failed { error } => Some((t.as_str(), error.as_str())),
            _ => None,
        })
    }

    pub fn outcome(&self, table: &str) -> Option<&TableOutcome> {
        self.tables.iter().find(|(t, _)| t == table).map(|(_, o)| o)
    }
}

fn replace_table(
    conn: &Connection,
    table: &str,
    insert: impl FnOnce(&Connection) -> Result<usize>,
) -> Result<usize> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| Error::msg(format!("failed to begin restore of {table}: {e}")))?;
    tx.execute(&format!("DELETE FROM {table}"), [])
        .map_err(|e| Error::msg(format!("failed to clear {table}: {e}")))?;
    let n = insert(&*tx)?;
    tx.commit()
        .map_err(|e| Error::msg(format!("failed to commit restore of {table}: {e}")))?;
    Ok(n)
}

/// Replace every user-data table with the snapshot's rows, keeping ids.
///
/// Each table is all-or-nothing; a failing table is reported and the others
/// still restore. Credentials are left as they are.
pub fn restore(conn: &Connection, snap: &Snapshot) -> Result<RestoreReport> {
    db::set_foreign_keys(conn, false)?;
    let mut report = RestoreReport::default();

    let steps: [(&str, Box<dyn FnOnce(&Connection) -> Result<usize> + '_>); 4] = [
        (
            "sections",
            Box::new(|c: &Connection| sections::insert_section_rows(c, &snap.sections)),
        ),
        (
            "subsections",
            Box::new(|c: &Connection| sections::insert_subsection_rows(c, &snap.subsections)),
        ),
        ("blocks", Box::new(|c: &Connection| blocks::insert_rows(c, &snap.blocks))),
        (
            "documents",
            Box::new(|c: &Connection| documents::insert_rows(c, &snap.documents)),
        ),
    ];
    for (table, insert) in steps {
        let outcome = match replace_table(conn, table, insert) {
            Ok(rows) => TableOutcome::Restored { rows },
            Err(e) => {
                tracing::error!(table, error = %e, "snapshot restore failed for table");
                TableOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };
        report.tables.push((table.to_string(), outcome));
    }
    report.tables.push((
        "admin_users".to_string(),
        TableOutcome::Skipped {
            reason: "credentials are never restored from snapshots".into(),
        },
    ));

    let fixed = sections::delete_orphan_subsections(conn)
        .and_then(|a| documents::clear_dangling_refs(conn).map(|b| a + b));
    let fk = db::set_foreign_keys(conn, true);
    report.dangling_fixed = fixed?;
    fk?;
    if report.dangling_fixed > 0 {
        tracing::warn!(
            fixed = report.dangling_fixed,
            "cleared dangling section references after restore"
        );
    }
    Ok(report)
}

pub fn save_local(path: &Path, snap: &Snapshot) -> Result<()> {
    atomic_write(path, &snap.to_bytes()?)
        .map_err(|e| e.context(format!("failed to write snapshot {}", path.display())))
}

/// The local snapshot, or `None` when it is missing or unreadable.
pub fn load_local(path: &Path) -> Option<Snapshot> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read local snapshot");
            return None;
        }
    };
    match Snapshot::from_bytes(&bytes) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "discarding unparseable local snapshot");
            None
        }
    }
}
