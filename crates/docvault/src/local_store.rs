use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::util::{self, atomic_write, ensure_dir, extension_of, validate_file_name};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreUsage {
    pub files: u64,
    pub bytes: u64,
}

/// Directory of uploaded binaries, flat and keyed by stored file name.
#[derive(Debug, Clone)]
pub struct LocalStore {
    dir: PathBuf,
    reserved: Vec<String>,
}

/// Fresh stored name for an upload: random UUID plus the original's
/// lowercase extension.
pub fn generate_name(original_name: &str) -> String {
    let id = uuid::Uuid::new_v4();
    match extension_of(original_name) {
        Some(ext) => format!("{id}.{ext}"),
        None => id.to_string(),
    }
}

impl LocalStore {
    pub fn open(dir: &Path) -> Result<Self> {
        ensure_dir(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            reserved: Vec::new(),
        })
    }

    /// Refuse `name` as a stored file; used for mirror control files.
    pub fn with_reserved(mut self, name: impl Into<String>) -> Self {
        self.reserved.push(name.into());
        self
    }

    pub fn is_reserved(&self, name: &str) -> bool {
        self.reserved.iter().any(|r| r == name)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str) -> Result<PathBuf> {
        let name = validate_file_name(name)?;
        if self.is_reserved(name) {
            return Err(Error::validation(format!("'{name}' is a reserved name")));
        }
        Ok(self.dir.join(name))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).is_ok_and(|p| p.is_file())
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path_for(name)?;
        fs::read(&path).map_err(|e| {
            Error::from(e).context(format!("failed to read {}", path.display()))
        })
    }

    pub fn write(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(name)?;
        atomic_write(&path, bytes)
    }

    pub fn remove(&self, name: &str) -> Result<bool> {
        util::remove_file_if_exists(&self.path_for(name)?)
    }

    /// Regular files directly under the store, sorted by name. Dot-files
    /// (including in-flight temp files) are skipped.
    pub fn list(&self) -> Result<Vec<LocalEntry>> {
        let rd = fs::read_dir(&self.dir)
            .map_err(|e| Error::msg(format!("failed to list {}: {e}", self.dir.display())))?;
        let mut out = Vec::new();
        for ent in rd {
            let ent = ent
                .map_err(|e| Error::msg(format!("failed to list {}: {e}", self.dir.display())))?;
            let meta = ent.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let Some(name) = ent.file_name().to_str().map(ToOwned::to_owned) else {
                continue;
            };
            if name.starts_with('.') || self.is_reserved(&name) {
                continue;
            }
            out.push(LocalEntry {
                name,
                size: meta.len(),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    pub fn usage(&self) -> Result<StoreUsage> {
        let mut usage = StoreUsage::default();
        for ent in WalkDir::new(&self.dir).follow_links(false) {
            let ent = ent.map_err(|e| {
                Error::msg(format!("failed to walk {}: {e}", self.dir.display()))
            })?;
            if !ent.file_type().is_file()
                || ent.file_name().to_str().is_some_and(|n| self.is_reserved(n))
            {
                continue;
            }
            let meta = ent.metadata().map_err(|e| {
                Error::msg(format!("failed to stat {}: {e}", ent.path().display()))
            })?;
            usage.files += 1;
            usage.bytes += meta.len();
        }
        Ok(usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_names_keep_lowercase_extension() {
        let a = generate_name("Report.PDF");
        let b = generate_name("Report.PDF");
        assert!(a.ends_with(".pdf"), "{a}");
        assert_ne!(a, b);
        assert_eq!(a.len(), 36 + 4);
    }

    #[test]
    fn write_read_remove() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = LocalStore::open(&tmp.path().join("uploads")).expect("store");
        store.write("a.pdf", b"%PDF-1.4").expect("write");
        assert!(store.exists("a.pdf"));
        assert_eq!(store.read("a.pdf").expect("read"), b"%PDF-1.4");
        assert!(store.remove("a.pdf").expect("remove"));
        assert!(!store.remove("a.pdf").expect("remove again"));
        assert!(store.read("a.pdf").unwrap_err().is_not_found());
    }

    #[test]
    fn traversal_names_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = LocalStore::open(tmp.path()).expect("store");
        assert!(store.write("../escape.pdf", b"x").is_err());
        assert!(!store.exists("../escape.pdf"));
    }

    #[test]
    fn list_and_usage() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = LocalStore::open(tmp.path()).expect("store");
        store.write("b.png", b"12345").expect("b");
        store.write("a.pdf", b"123").expect("a");
        fs::write(tmp.path().join(".partial"), b"zz").expect("dotfile");
        let names: Vec<_> = store.list().expect("list").into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["a.pdf", "b.png"]);
        let usage = store.usage().expect("usage");
        assert_eq!(usage.files, 3);
        assert_eq!(usage.bytes, 10);
    }

    #[test]
    fn reserved_names_are_refused_and_hidden() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = LocalStore::open(tmp.path())
            .expect("store")
            .with_reserved("_snapshot.json");
        fs::write(tmp.path().join("_snapshot.json"), b"{}").expect("stray control file");
        store.write("a.pdf", b"%PDF").expect("write");
        assert!(store.write("_snapshot.json", b"{}").is_err());
        assert!(!store.exists("_snapshot.json"));
        assert!(store.read("_snapshot.json").is_err());
        let names: Vec<_> = store.list().expect("list").into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["a.pdf"]);
        assert_eq!(store.usage().expect("usage").files, 1);
    }
}
