//! On-demand repair path and the CRUD operations built around it.
//!
//! Local disk is the durability floor: every write lands there first and the
//! mirror copy is best effort. Reads that miss locally are repaired from the
//! mirror once, verified, and cached.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;

use crate::config::ConfigDoc;
use crate::db::{self, blocks, documents, sections};
use crate::error::{Error, Result};
use crate::layout::{self, DataLayout, StorageConfig};
use crate::local_store::{self, LocalStore};
use crate::mirror::{Mirror, MirrorConfig, MirrorStatus};
use crate::model::{
    BlockPatch, ContentBlock, Document, DocumentPatch, Section, SectionInput, Subsection,
    UploadMeta,
};
use crate::payload;
use crate::reconcile::{self, BootReport, FileSyncStatus, ReconcileConfig, ResyncReport};
use crate::snapshot::{self, Snapshot};
use crate::util::{title_from_file_name, validate_file_name};

const DEFAULT_TITLE: &str = "Document";

/// What happened to the mirror side of a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MirrorOutcome {
    Mirrored,
    Skipped { reason: String },
    Failed { error: String },
}

impl MirrorOutcome {
    pub fn is_mirrored(&self) -> bool {
        matches!(self, MirrorOutcome::Mirrored)
    }
}

#[derive(Debug, Clone)]
pub struct Resolved {
    pub bytes: Vec<u8>,
    pub mime: &'static str,
    /// True when the bytes were fetched from the mirror for this call.
    pub repaired: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitOutcome {
    pub document: Document,
    pub mirror: MirrorOutcome,
}

#[derive(Debug, Clone)]
pub struct UploadFile {
    pub original_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredImage {
    pub filename: String,
    pub mirror: MirrorOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct PurgeOutcome {
    pub document: Document,
    pub local_removed: bool,
    pub mirror: MirrorOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotSave {
    pub timestamp: DateTime<Utc>,
    pub mirror: MirrorOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct VaultStats {
    pub documents: i64,
    pub visible: i64,
    pub hidden: i64,
    pub uploads_files: u64,
    pub uploads_bytes: u64,
    pub mirror: MirrorStatus,
}

pub struct Vault {
    conn: Connection,
    store: LocalStore,
    mirror: Mirror,
    layout: DataLayout,
}

impl Vault {
    /// Open the relational store and local directory, seeding any missing
    /// content blocks.
    pub fn open(layout: DataLayout, mirror: Mirror) -> Result<Self> {
        layout::init_dirs(&layout)?;
        let conn = db::open(&layout.db_path)?;
        let store =
            LocalStore::open(&layout.uploads_dir)?.with_reserved(mirror.snapshot_name());
        db::seed_blocks(&conn)?;
        Ok(Self {
            conn,
            store,
            mirror,
            layout,
        })
    }

    pub fn from_config(doc: &ConfigDoc) -> Result<Self> {
        let storage: StorageConfig = doc.section("storage")?;
        let mirror_cfg: MirrorConfig = doc.section("mirror")?;
        let layout = layout::load_layout(&storage)?;
        let mirror = Mirror::from_config(&mirror_cfg)?;
        Self::open(layout, mirror)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub fn boot(&self, cfg: &ReconcileConfig) -> Result<BootReport> {
        reconcile::boot(self, cfg.resync)
    }

    pub fn sync_files(&self) -> Result<Vec<FileSyncStatus>> {
        reconcile::sync_files(self)
    }

    pub fn cold_resync(&self) -> Result<ResyncReport> {
        reconcile::cold_resync(self)
    }

    fn mirror_write(&self, f: impl FnOnce(&Mirror) -> Result<()>) -> MirrorOutcome {
        if !self.mirror.is_configured() {
            return MirrorOutcome::Skipped {
                reason: "mirror not configured".into(),
            };
        }
        if !self.mirror.write_allowed() {
            return MirrorOutcome::Skipped {
                reason: "mirror writes suspended".into(),
            };
        }
        match f(&self.mirror) {
            Ok(()) => MirrorOutcome::Mirrored,
            Err(e) => MirrorOutcome::Failed {
                error: e.to_string(),
            },
        }
    }

    /// Write the snapshot locally and push it to the mirror.
    pub fn save_snapshot(&self) -> Result<SnapshotSave> {
        let snap = Snapshot::capture(&self.conn)?;
        snapshot::save_local(&self.layout.snapshot_path, &snap)?;
        let bytes = snap.to_bytes()?;
        let mirror = self.mirror_write(|m| m.write_snapshot(&bytes));
        tracing::debug!(timestamp = %snap.timestamp, mirror = ?mirror, "snapshot saved");
        Ok(SnapshotSave {
            timestamp: snap.timestamp,
            mirror,
        })
    }

    // The mutation already succeeded; a failed snapshot only costs redundancy.
    fn snapshot_after_mutation(&self) {
        if let Err(e) = self.save_snapshot() {
            tracing::warn!(error = %e, "failed to save snapshot after mutation");
        }
    }

    /// Bytes of a stored file, repairing a local miss from the mirror.
    pub fn resolve(&self, filename: &str) -> Result<Resolved> {
        let filename = validate_file_name(filename)?;
        if self.store.is_reserved(filename) {
            return Err(Error::not_found(format!("{filename} not found")));
        }
        let mime = payload::mime_for(filename);
        if self.store.exists(filename) {
            return Ok(Resolved {
                bytes: self.store.read(filename)?,
                mime,
                repaired: false,
            });
        }

        // Only indexed names are repaired; a purged file may linger on the mirror.
        let indexed = documents::find_by_filename(&self.conn, filename)?;
        if indexed.is_none() && !blocks::references_image(&self.conn, filename)? {
            return Err(Error::not_found(format!(
                "{filename} not found locally and not referenced by any document or block"
            )));
        }

        tracing::info!(file = filename, "missing locally; trying mirror");
        let bytes = match self.mirror.download(filename) {
            Ok(b) => b,
            Err(e) => {
                return Err(Error::not_found(format!(
                    "{filename} not found locally and not recoverable from mirror: {e}"
                )));
            }
        };
        if let Err(e) = check_repaired(filename, indexed.as_ref(), &bytes) {
            tracing::warn!(file = filename, error = %e, "discarding corrupt mirror copy");
            if let Err(rm) = self.store.remove(filename) {
                tracing::warn!(file = filename, error = %rm, "failed to remove corrupt local copy");
            }
            return Err(Error::not_found(format!("{filename}: {e}")));
        }
        if let Err(e) = self.store.write(filename, &bytes) {
            tracing::warn!(file = filename, error = %e, "failed to cache repaired file");
        }
        tracing::info!(file = filename, bytes = bytes.len(), "repaired from mirror");
        Ok(Resolved {
            bytes,
            mime,
            repaired: true,
        })
    }

    fn validate_upload<'a>(&self, original_name: &'a str, bytes: &[u8]) -> Result<&'a str> {
        let name = Path::new(original_name.trim())
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::validation("upload has no file name"))?;
        if !payload::is_allowed(name) {
            return Err(Error::validation(format!(
                "unsupported file type '{name}'; allowed: {}",
                payload::ALLOWED_EXTENSIONS.join(", ")
            )));
        }
        if bytes.is_empty() {
            return Err(Error::validation(format!("{name}: empty upload")));
        }
        if bytes.len() as u64 > payload::MAX_UPLOAD_BYTES {
            return Err(Error::validation(format!(
                "{name}: {} bytes exceeds the {} byte limit",
                bytes.len(),
                payload::MAX_UPLOAD_BYTES
            )));
        }
        payload::verify(name, bytes).map_err(|e| Error::validation(e.to_string()))?;
        Ok(name)
    }

    fn commit_one(
        &self,
        original_name: &str,
        bytes: &[u8],
        title: String,
        meta: &UploadMeta,
    ) -> Result<CommitOutcome> {
        let filename = local_store::generate_name(original_name);
        self.store.write(&filename, bytes)?;
        let row = documents::NewDocument {
            title,
            description: meta
                .description
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned),
            filename: filename.clone(),
            original_name: original_name.to_string(),
            file_size: bytes.len() as i64,
            file_type: payload::file_type_for(original_name),
            is_visible: meta.is_visible,
            sort_order: 0,
            section_id: meta.section_id,
            subsection_id: meta.subsection_id,
        };
        let document = match documents::insert(&self.conn, &row) {
            Ok(d) => d,
            Err(e) => {
                if let Err(rm) = self.store.remove(&filename) {
                    tracing::warn!(file = %filename, error = %rm, "failed to roll back local file");
                }
                return Err(e);
            }
        };
        let mirror = self.mirror_write(|m| m.upload(&filename, bytes));
        tracing::info!(
            id = document.id,
            file = %filename,
            original = original_name,
            bytes = bytes.len(),
            mirror = ?mirror,
            "committed document"
        );
        Ok(CommitOutcome { document, mirror })
    }

    /// Store one upload and index it.
    pub fn commit(&self, bytes: &[u8], meta: &UploadMeta) -> Result<CommitOutcome> {
        let name = self.validate_upload(&meta.original_name, bytes)?;
        sections::check_refs(&self.conn, meta.section_id, meta.subsection_id)?;
        let title = meta
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| title_from_file_name(name, DEFAULT_TITLE));
        let out = self.commit_one(name, bytes, title, meta)?;
        self.snapshot_after_mutation();
        Ok(out)
    }

    /// Store several uploads sharing one set of metadata. With more than one
    /// file each title gets a ` N` suffix. Every file is validated before the
    /// first is stored; a later failure rolls back the ones already stored.
    pub fn commit_batch(
        &self,
        files: &[UploadFile],
        meta: &UploadMeta,
    ) -> Result<Vec<CommitOutcome>> {
        if files.is_empty() {
            return Err(Error::validation("no files in upload"));
        }
        let mut names = Vec::with_capacity(files.len());
        for f in files {
            names.push(self.validate_upload(&f.original_name, &f.bytes)?);
        }
        sections::check_refs(&self.conn, meta.section_id, meta.subsection_id)?;

        let base_title = meta
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());
        let mut done: Vec<CommitOutcome> = Vec::with_capacity(files.len());
        for (i, (f, name)) in files.iter().zip(&names).enumerate() {
            let base = base_title
                .map(ToOwned::to_owned)
                .unwrap_or_else(|| title_from_file_name(name, DEFAULT_TITLE));
            let title = if files.len() > 1 {
                format!("{base} {}", i + 1)
            } else {
                base
            };
            match self.commit_one(name, &f.bytes, title, meta) {
                Ok(out) => done.push(out),
                Err(e) => {
                    for out in &done {
                        if let Err(rb) = self.remove_document(&out.document) {
                            tracing::warn!(id = out.document.id, error = %rb, "failed to roll back batch upload");
                        }
                    }
                    return Err(e.context(format!("batch upload failed at {name}")));
                }
            }
        }
        self.snapshot_after_mutation();
        Ok(done)
    }

    /// Store an image referenced by a content block. No document row is
    /// created; the caller puts the returned name into the block.
    pub fn commit_block_image(&self, bytes: &[u8], original_name: &str) -> Result<StoredImage> {
        let name = self.validate_upload(original_name, bytes)?;
        if !payload::mime_for(name).starts_with("image/") {
            return Err(Error::validation(format!("{name} is not an image")));
        }
        let filename = local_store::generate_name(name);
        self.store.write(&filename, bytes)?;
        let mirror = self.mirror_write(|m| m.upload(&filename, bytes));
        tracing::info!(file = %filename, bytes = bytes.len(), mirror = ?mirror, "stored block image");
        Ok(StoredImage { filename, mirror })
    }

    fn remove_document(&self, doc: &Document) -> Result<(bool, MirrorOutcome)> {
        let local_removed = self.store.remove(&doc.filename)?;
        let mirror = self.mirror_write(|m| match m.remove(&doc.filename) {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        });
        if let MirrorOutcome::Failed { error } = &mirror {
            tracing::warn!(file = %doc.filename, error = %error, "mirror copy left behind");
        }
        documents::delete(&self.conn, doc.id)?;
        Ok((local_removed, mirror))
    }

    /// Delete a document: local file, mirror copy (best effort), then row.
    pub fn purge(&self, id: i64) -> Result<PurgeOutcome> {
        let document = documents::get(&self.conn, id)?;
        let (local_removed, mirror) = self.remove_document(&document)?;
        tracing::info!(id, file = %document.filename, mirror = ?mirror, "purged document");
        self.snapshot_after_mutation();
        Ok(PurgeOutcome {
            document,
            local_removed,
            mirror,
        })
    }

    pub fn get_document(&self, id: i64) -> Result<Document> {
        documents::get(&self.conn, id)
    }

    pub fn list_documents(&self, visible_only: bool) -> Result<Vec<Document>> {
        documents::list(&self.conn, visible_only)
    }

    pub fn update_document(&self, id: i64, patch: &DocumentPatch) -> Result<Document> {
        if let Some(title) = &patch.title
            && title.trim().is_empty()
        {
            return Err(Error::validation("title must not be empty"));
        }
        let current = documents::get(&self.conn, id)?;
        let section_id = patch.section_id.unwrap_or(current.section_id);
        let subsection_id = patch.subsection_id.unwrap_or(current.subsection_id);
        sections::check_refs(&self.conn, section_id, subsection_id)?;
        let trimmed = DocumentPatch {
            title: patch.title.as_deref().map(|t| t.trim().to_string()),
            description: patch
                .description
                .as_ref()
                .map(|d| d.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(ToOwned::to_owned)),
            ..patch.clone()
        };
        let doc = documents::update(&self.conn, id, &trimmed)?;
        self.snapshot_after_mutation();
        Ok(doc)
    }

    pub fn reorder_documents(&self, ids: &[i64]) -> Result<()> {
        documents::reorder(&self.conn, ids)?;
        self.snapshot_after_mutation();
        Ok(())
    }

    pub fn list_blocks(&self, visible_only: bool) -> Result<Vec<ContentBlock>> {
        blocks::list(&self.conn, visible_only)
    }

    pub fn get_block(&self, name: &str) -> Result<ContentBlock> {
        blocks::get_by_name(&self.conn, name)?
            .ok_or_else(|| Error::not_found(format!("block '{name}' not found")))
    }

    pub fn update_block(&self, id: i64, patch: &BlockPatch) -> Result<ContentBlock> {
        let block = blocks::update(&self.conn, id, patch)?;
        self.snapshot_after_mutation();
        Ok(block)
    }

    pub fn list_sections(&self) -> Result<(Vec<Section>, Vec<Subsection>)> {
        Ok((
            sections::list_sections(&self.conn)?,
            sections::list_subsections(&self.conn)?,
        ))
    }

    pub fn create_section(&self, input: &SectionInput) -> Result<Section> {
        let s = sections::create_section(&self.conn, input)?;
        self.snapshot_after_mutation();
        Ok(s)
    }

    pub fn update_section(&self, id: i64, input: &SectionInput) -> Result<Section> {
        let s = sections::update_section(&self.conn, id, input)?;
        self.snapshot_after_mutation();
        Ok(s)
    }

    pub fn delete_section(&self, id: i64) -> Result<()> {
        sections::delete_section(&self.conn, id)?;
        self.snapshot_after_mutation();
        Ok(())
    }

    pub fn create_subsection(&self, section_id: i64, input: &SectionInput) -> Result<Subsection> {
        let s = sections::create_subsection(&self.conn, section_id, input)?;
        self.snapshot_after_mutation();
        Ok(s)
    }

    pub fn update_subsection(&self, id: i64, input: &SectionInput) -> Result<Subsection> {
        let s = sections::update_subsection(&self.conn, id, input)?;
        self.snapshot_after_mutation();
        Ok(s)
    }

    pub fn delete_subsection(&self, id: i64) -> Result<()> {
        sections::delete_subsection(&self.conn, id)?;
        self.snapshot_after_mutation();
        Ok(())
    }

    pub fn stats(&self) -> Result<VaultStats> {
        let counts = documents::counts(&self.conn)?;
        let usage = self.store.usage()?;
        Ok(VaultStats {
            documents: counts.total,
            visible: counts.visible,
            hidden: counts.total - counts.visible,
            uploads_files: usage.files,
            uploads_bytes: usage.bytes,
            mirror: self.mirror.status(),
        })
    }
}

fn check_repaired(filename: &str, indexed: Option<&Document>, bytes: &[u8]) -> Result<()> {
    payload::verify(filename, bytes)?;
    if let Some(doc) = indexed
        && doc.file_size > 0
        && doc.file_size != bytes.len() as i64
    {
        return Err(Error::corrupt(format!(
            "mirror copy has {} bytes, expected {}",
            bytes.len(),
            doc.file_size
        )));
    }
    Ok(())
}
