use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_root_dir() -> String {
    ".".into()
}

fn default_uploads_dir() -> String {
    "uploads".into()
}

fn default_database() -> String {
    "database.sqlite".into()
}

fn default_snapshot() -> String {
    "snapshot.json".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_snapshot")]
    pub snapshot: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            uploads_dir: default_uploads_dir(),
            database: default_database(),
            snapshot: default_snapshot(),
        }
    }
}

/// Resolved on-disk locations: one database file, one uploads directory and
/// one snapshot file.
#[derive(Debug, Clone)]
pub struct DataLayout {
    pub root: PathBuf,
    pub uploads_dir: PathBuf,
    pub db_path: PathBuf,
    pub snapshot_path: PathBuf,
}

impl DataLayout {
    /// Layout with the default file names under `root`.
    pub fn under(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            uploads_dir: root.join(default_uploads_dir()),
            db_path: root.join(default_database()),
            snapshot_path: root.join(default_snapshot()),
        }
    }
}

pub fn load_layout(cfg: &StorageConfig) -> Result<DataLayout> {
    let cwd = std::env::current_dir().map_err(|e| Error::msg(format!("cwd error: {e}")))?;
    let root = resolve_user_path(&cwd, &cfg.root_dir)?;
    Ok(DataLayout {
        uploads_dir: resolve_under_root(&root, &cfg.uploads_dir)?,
        db_path: resolve_under_root(&root, &cfg.database)?,
        snapshot_path: resolve_under_root(&root, &cfg.snapshot)?,
        root,
    })
}

pub fn init_dirs(layout: &DataLayout) -> Result<()> {
    for dir in [&layout.root, &layout.uploads_dir] {
        fs::create_dir_all(dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dir.display())))?;
    }
    for file in [&layout.db_path, &layout.snapshot_path] {
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
        }
    }
    Ok(())
}

fn resolve_user_path(base: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::validation("empty storage path"));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}

fn resolve_under_root(root: &Path, rel: &str) -> Result<PathBuf> {
    let rel = rel.trim();
    if rel.is_empty() {
        return Err(Error::validation("empty storage path"));
    }
    let rel_pb = Path::new(rel);
    if rel_pb
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::validation(format!(
            "invalid storage path '{}' (contains '..')",
            rel
        )));
    }
    Ok(if rel_pb.is_absolute() {
        rel_pb.to_path_buf()
    } else {
        root.join(rel_pb)
    })
}
