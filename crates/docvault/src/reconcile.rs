//! Boot-time reconciliation of the relational store, the local file store
//! and the mirror.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::db::{self, documents};
use crate::error::{Error, Result};
use crate::mirror::MirrorEntry;
use crate::payload;
use crate::snapshot::{self, RestoreReport, Snapshot};
use crate::util::{title_from_file_name, validate_file_name};
use crate::vault::Vault;

/// When boot rebuilds the document table from the mirror listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResyncMode {
    /// Only download missing files.
    Off,
    /// Rebuild only when boot found no snapshot to restore.
    #[default]
    Auto,
    /// Rebuild on every boot.
    Always,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub resync: ResyncMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotSource {
    None,
    Local,
    Remote,
}

impl fmt::Display for SnapshotSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SnapshotSource::None => "none",
            SnapshotSource::Local => "local",
            SnapshotSource::Remote => "remote",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FileState {
    Downloaded,
    Exists,
    Corrupt { error: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileSyncStatus {
    pub name: String,
    pub size: u64,
    #[serde(flatten)]
    pub state: FileState,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResyncReport {
    pub files: Vec<FileSyncStatus>,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BootReport {
    pub source: SnapshotSource,
    pub restore: Option<RestoreReport>,
    pub mirror_reachable: bool,
    pub listed: usize,
    pub downloaded: usize,
    pub corrupt: usize,
    pub failed: usize,
    pub resynced_rows: Option<usize>,
    pub seeded_blocks: Vec<String>,
    pub snapshot_pushed: bool,
}

enum RemoteProbe {
    Found(Snapshot),
    Absent,
    Unreachable,
}

fn probe_remote(vault: &Vault) -> RemoteProbe {
    if !vault.mirror().is_configured() {
        return RemoteProbe::Unreachable;
    }
    match vault.mirror().read_snapshot() {
        Ok(Some(bytes)) => match Snapshot::from_bytes(&bytes) {
            Ok(s) => RemoteProbe::Found(s),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unparseable mirror snapshot");
                RemoteProbe::Absent
            }
        },
        Ok(None) => RemoteProbe::Absent,
        Err(e) if e.is_unreachable() => RemoteProbe::Unreachable,
        Err(e) => {
            tracing::warn!(error = %e, "failed to read mirror snapshot");
            RemoteProbe::Absent
        }
    }
}

/// Later timestamp wins; a tie keeps the local copy.
fn select(local: Option<Snapshot>, remote: Option<Snapshot>) -> Option<(SnapshotSource, Snapshot)> {
    match (local, remote) {
        (Some(l), Some(r)) if r.timestamp > l.timestamp => Some((SnapshotSource::Remote, r)),
        (Some(l), _) => Some((SnapshotSource::Local, l)),
        (None, Some(r)) => Some((SnapshotSource::Remote, r)),
        (None, None) => None,
    }
}

fn sync_entry(vault: &Vault, entry: &MirrorEntry) -> FileState {
    if let Err(e) = validate_file_name(&entry.name) {
        return FileState::Failed {
            error: e.to_string(),
        };
    }
    if vault.store().is_reserved(&entry.name) {
        return FileState::Failed {
            error: format!("{} is a reserved mirror name", entry.name),
        };
    }
    if vault.store().exists(&entry.name) {
        return FileState::Exists;
    }
    let bytes = match vault.mirror().download(&entry.name) {
        Ok(b) => b,
        Err(e) => {
            return FileState::Failed {
                error: e.to_string(),
            };
        }
    };
    let checked = payload::verify(&entry.name, &bytes).and_then(|()| {
        if entry.size > 0 && entry.size != bytes.len() as u64 {
            Err(Error::corrupt(format!(
                "{}: listed as {} bytes, downloaded {}",
                entry.name,
                entry.size,
                bytes.len()
            )))
        } else {
            Ok(())
        }
    });
    if let Err(e) = checked {
        tracing::warn!(file = %entry.name, error = %e, "discarding corrupt download");
        return FileState::Corrupt {
            error: e.to_string(),
        };
    }
    match vault.store().write(&entry.name, &bytes) {
        Ok(()) => FileState::Downloaded,
        Err(e) => FileState::Failed {
            error: e.to_string(),
        },
    }
}

fn sync_listing(vault: &Vault, entries: &[MirrorEntry]) -> Vec<FileSyncStatus> {
    entries
        .iter()
        .map(|entry| FileSyncStatus {
            name: entry.name.clone(),
            size: entry.size,
            state: sync_entry(vault, entry),
        })
        .collect()
}

/// Download every mirror file missing from the local store.
pub fn sync_files(vault: &Vault) -> Result<Vec<FileSyncStatus>> {
    let entries = vault.mirror().list()?;
    let files = sync_listing(vault, &entries);
    tracing::info!(
        listed = files.len(),
        downloaded = files.iter().filter(|f| f.state == FileState::Downloaded).count(),
        "mirror file sync finished"
    );
    Ok(files)
}

// Corrupt downloads and invalid names get no row; transient failures keep
// theirs so a later request can still repair the file.
fn rebuild_documents(vault: &Vault, files: &[FileSyncStatus]) -> Result<usize> {
    let rows: Vec<documents::NewDocument> = files
        .iter()
        .filter(|f| match &f.state {
            FileState::Corrupt { .. } => false,
            FileState::Failed { .. } => {
                validate_file_name(&f.name).is_ok() && !vault.store().is_reserved(&f.name)
            }
            _ => true,
        })
        .map(|f| documents::NewDocument {
            title: title_from_file_name(&f.name, "Document"),
            description: None,
            filename: f.name.clone(),
            original_name: f.name.clone(),
            file_size: f.size as i64,
            file_type: payload::file_type_for(&f.name),
            is_visible: true,
            sort_order: 0,
            section_id: None,
            subsection_id: None,
        })
        .collect();
    let n = documents::replace_all(vault.conn(), &rows)?;
    tracing::warn!(rows = n, "document table rebuilt from mirror listing");
    Ok(n)
}

/// Download missing files, then replace every document row with one row per
/// mirror file. Descriptions and section assignments are lost.
pub fn cold_resync(vault: &Vault) -> Result<ResyncReport> {
    let files = sync_files(vault)?;
    let rows = rebuild_documents(vault, &files)?;
    vault.save_snapshot()?;
    Ok(ResyncReport { files, rows })
}

pub fn boot(vault: &Vault, mode: ResyncMode) -> Result<BootReport> {
    let layout = vault.layout();
    let local = snapshot::load_local(&layout.snapshot_path);
    let remote = probe_remote(vault);
    let mut mirror_reachable = !matches!(remote, RemoteProbe::Unreachable);

    let remote_ts = match &remote {
        RemoteProbe::Found(s) => Some(s.timestamp),
        _ => None,
    };
    let remote = match remote {
        RemoteProbe::Found(s) => Some(s),
        _ => None,
    };

    let mut report = BootReport {
        source: SnapshotSource::None,
        restore: None,
        mirror_reachable,
        listed: 0,
        downloaded: 0,
        corrupt: 0,
        failed: 0,
        resynced_rows: None,
        seeded_blocks: Vec::new(),
        snapshot_pushed: false,
    };

    let mut push_local: Option<Snapshot> = None;
    if let Some((source, snap)) = select(local, remote) {
        tracing::info!(%source, timestamp = %snap.timestamp, "restoring snapshot");
        let restored = snapshot::restore(vault.conn(), &snap)?;
        for (table, error) in restored.failures() {
            tracing::error!(table, error, "table not restored");
        }
        report.source = source;
        report.restore = Some(restored);
        match source {
            SnapshotSource::Remote => {
                if let Err(e) = snapshot::save_local(&layout.snapshot_path, &snap) {
                    tracing::warn!(error = %e, "failed to keep mirror snapshot locally");
                }
            }
            SnapshotSource::Local if mirror_reachable && remote_ts.is_none_or(|t| t < snap.timestamp) => {
                push_local = Some(snap);
            }
            _ => {}
        }
    } else {
        tracing::info!("no snapshot found; keeping current relational state");
    }

    let files = if mirror_reachable {
        match sync_files(vault) {
            Ok(files) => Some(files),
            Err(e) => {
                tracing::warn!(error = %e, "mirror listing failed; skipping file sync");
                mirror_reachable = !e.is_unreachable();
                None
            }
        }
    } else {
        None
    };
    report.mirror_reachable = mirror_reachable;

    if let Some(files) = &files {
        report.listed = files.len();
        for f in files {
            match f.state {
                FileState::Downloaded => report.downloaded += 1,
                FileState::Corrupt { .. } => report.corrupt += 1,
                FileState::Failed { .. } => report.failed += 1,
                FileState::Exists => {}
            }
        }
        let resync = match mode {
            ResyncMode::Off => false,
            ResyncMode::Always => true,
            // An empty listing would only wipe local rows.
            ResyncMode::Auto => report.source == SnapshotSource::None && !files.is_empty(),
        };
        if resync {
            report.resynced_rows = Some(rebuild_documents(vault, files)?);
        }
    }

    report.seeded_blocks = db::seed_blocks(vault.conn())?;

    let changed = report.resynced_rows.is_some()
        || !report.seeded_blocks.is_empty()
        || report.source == SnapshotSource::None
        || report.restore.as_ref().is_some_and(|r| r.dangling_fixed > 0);
    if changed {
        report.snapshot_pushed = vault.save_snapshot()?.mirror.is_mirrored();
    } else if let Some(snap) = push_local
        && vault.mirror().write_allowed()
    {
        match snap.to_bytes().and_then(|b| vault.mirror().write_snapshot(&b)) {
            Ok(()) => report.snapshot_pushed = true,
            Err(e) => tracing::warn!(error = %e, "failed to push local snapshot to mirror"),
        }
    }

    tracing::info!(
        source = %report.source,
        mirror_reachable = report.mirror_reachable,
        listed = report.listed,
        downloaded = report.downloaded,
        corrupt = report.corrupt,
        resynced = ?report.resynced_rows,
        "boot reconciliation finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn snap_at(offset_secs: i64) -> Snapshot {
        Snapshot {
            timestamp: Utc::now() + Duration::seconds(offset_secs),
            blocks: Vec::new(),
            documents: Vec::new(),
            sections: Vec::new(),
            subsections: Vec::new(),
            admin_users: Vec::new(),
        }
    }

    #[test]
    fn later_timestamp_wins_and_ties_stay_local() {
        let l = snap_at(0);
        let r = snap_at(10);
        assert_eq!(
            select(Some(l.clone()), Some(r.clone())).map(|(s, _)| s),
            Some(SnapshotSource::Remote)
        );
        assert_eq!(
            select(Some(r.clone()), Some(l.clone())).map(|(s, _)| s),
            Some(SnapshotSource::Local)
        );
        let mut tie = l.clone();
        tie.timestamp = l.timestamp;
        assert_eq!(
            select(Some(l), Some(tie)).map(|(s, _)| s),
            Some(SnapshotSource::Local)
        );
        assert_eq!(
            select(None, Some(r)).map(|(s, _)| s),
            Some(SnapshotSource::Remote)
        );
        assert!(select(None, None).is_none());
    }

    #[test]
    fn resync_mode_parses_lowercase() {
        let cfg: ReconcileConfig = toml::from_str("resync = \"always\"").expect("parse");
        assert_eq!(cfg.resync, ResyncMode::Always);
        let cfg: ReconcileConfig = toml::from_str("").expect("parse");
        assert_eq!(cfg.resync, ResyncMode::Auto);
        assert!(toml::from_str::<ReconcileConfig>("resync = \"sometimes\"").is_err());
    }
}
