//! In-process mirror used by tests and local dry runs.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{MirrorEntry, MirrorSession, MirrorTransport};
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct MemoryMirror {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    reachable: AtomicBool,
    truncate_uploads: AtomicBool,
    fail_removes: AtomicBool,
    opens: AtomicUsize,
}

impl Default for MemoryMirror {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMirror {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(BTreeMap::new()),
            reachable: AtomicBool::new(true),
            truncate_uploads: AtomicBool::new(false),
            fail_removes: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
        }
    }

    /// When false, every open fails as if the host were down.
    pub fn set_reachable(&self, on: bool) {
        self.reachable.store(on, Ordering::SeqCst);
    }

    /// Drop the last byte of every stored upload.
    pub fn set_truncate_uploads(&self, on: bool) {
        self.truncate_uploads.store(on, Ordering::SeqCst);
    }

    pub fn set_fail_removes(&self, on: bool) {
        self.fail_removes.store(on, Ordering::SeqCst);
    }

    pub fn insert(&self, name: &str, bytes: Vec<u8>) {
        self.lock().insert(name.to_string(), bytes);
    }

    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.lock().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Sessions opened so far, successful or not.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        // A panicking test thread must not wedge the others.
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct MemorySession<'a> {
    mirror: &'a MemoryMirror,
}

impl MirrorSession for MemorySession<'_> {
    fn put(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        let mut stored = bytes.to_vec();
        if self.mirror.truncate_uploads.load(Ordering::SeqCst) {
            stored.pop();
        }
        self.mirror.insert(name, stored);
        Ok(())
    }

    fn get(&mut self, name: &str) -> Result<Vec<u8>> {
        self.mirror
            .contents(name)
            .ok_or_else(|| Error::not_found(format!("550 {name}: no such file")))
    }

    fn list(&mut self) -> Result<Vec<MirrorEntry>> {
        Ok(self
            .mirror
            .lock()
            .iter()
            .map(|(name, bytes)| MirrorEntry {
                name: name.clone(),
                size: bytes.len() as u64,
            })
            .collect())
    }

    fn remove(&mut self, name: &str) -> Result<()> {
        if self.mirror.fail_removes.load(Ordering::SeqCst) {
            return Err(Error::msg(format!("550 {name}: permission denied")));
        }
        match self.mirror.lock().remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::not_found(format!("550 {name}: no such file"))),
        }
    }
}

impl MirrorTransport for MemoryMirror {
    fn describe(&self) -> String {
        "memory://".into()
    }

    fn open(&self, _create_dir: bool) -> Result<Box<dyn MirrorSession + '_>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(Error::unreachable("memory mirror: connection refused"));
        }
        Ok(Box::new(MemorySession { mirror: self }))
    }
}
