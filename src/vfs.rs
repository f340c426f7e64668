//! The virtual disk: a quota-limited flat file store backed by an
//! in-memory map and mirrored onto a host directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::VfsError;

/// Total bytes a virtual disk may hold across all files.
pub const MAX_DISK_BYTES: usize = 1_474_560;

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\.?[A-Za-z0-9_]{1,12}(\.[A-Za-z0-9]{1,3})?$").unwrap());

pub fn is_valid_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

#[derive(Clone, Debug)]
pub struct FileEntry {
    pub data: Vec<u8>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    dirty: bool,
}

impl FileEntry {
    fn new(data: Vec<u8>, now: DateTime<Utc>) -> Self {
        FileEntry {
            data,
            created: now,
            modified: now,
            dirty: true,
        }
    }
}

/// In-memory table of files plus bookkeeping for persistence and the
/// directory-listing cursor used by the `ListNext` MMIO command.
pub struct VirtualDisk {
    inner: RwLock<Inner>,
}

struct Inner {
    files: BTreeMap<String, FileEntry>,
    used_bytes: usize,
    dirty: bool,
    list_cursor: usize,
    /// Names deleted since the last successful `persist_to`, so the host
    /// mirror can remove them too instead of only ever gaining files.
    pending_deletes: std::collections::HashSet<String>,
}

impl VirtualDisk {
    pub fn new() -> Self {
        VirtualDisk {
            inner: RwLock::new(Inner {
                files: BTreeMap::new(),
                used_bytes: 0,
                dirty: false,
                list_cursor: 0,
                pending_deletes: std::collections::HashSet::new(),
            }),
        }
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>, VfsError> {
        if !is_valid_name(name) {
            return Err(VfsError::InvalidName(name.to_string()));
        }
        let inner = self.inner.read().unwrap();
        inner
            .files
            .get(name)
            .map(|e| e.data.clone())
            .ok_or_else(|| VfsError::NotFound(name.to_string()))
    }

    pub fn write(&self, name: &str, data: Vec<u8>, now: DateTime<Utc>) -> Result<(), VfsError> {
        if !is_valid_name(name) {
            return Err(VfsError::InvalidName(name.to_string()));
        }
        let mut inner = self.inner.write().unwrap();
        let prev_len = inner.files.get(name).map(|e| e.data.len()).unwrap_or(0);
        let new_total = inner.used_bytes - prev_len + data.len();
        if new_total > MAX_DISK_BYTES {
            return Err(VfsError::QuotaExceeded {
                requested: data.len(),
                available: MAX_DISK_BYTES - (inner.used_bytes - prev_len),
            });
        }
        inner.used_bytes = new_total;
        inner.dirty = true;
        match inner.files.get_mut(name) {
            Some(entry) => {
                entry.data = data;
                entry.modified = now;
                entry.dirty = true;
            }
            None => {
                inner.files.insert(name.to_string(), FileEntry::new(data, now));
            }
        }
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<(), VfsError> {
        if !is_valid_name(name) {
            return Err(VfsError::InvalidName(name.to_string()));
        }
        let mut inner = self.inner.write().unwrap();
        match inner.files.remove(name) {
            Some(entry) => {
                inner.used_bytes -= entry.data.len();
                inner.dirty = true;
                inner.pending_deletes.insert(name.to_string());
                Ok(())
            }
            None => Err(VfsError::NotFound(name.to_string())),
        }
    }

    pub fn size(&self, name: &str) -> Result<usize, VfsError> {
        if !is_valid_name(name) {
            return Err(VfsError::InvalidName(name.to_string()));
        }
        let inner = self.inner.read().unwrap();
        inner
            .files
            .get(name)
            .map(|e| e.data.len())
            .ok_or_else(|| VfsError::NotFound(name.to_string()))
    }

    pub fn meta(&self, name: &str) -> Result<(DateTime<Utc>, DateTime<Utc>), VfsError> {
        if !is_valid_name(name) {
            return Err(VfsError::InvalidName(name.to_string()));
        }
        let inner = self.inner.read().unwrap();
        inner
            .files
            .get(name)
            .map(|e| (e.created, e.modified))
            .ok_or_else(|| VfsError::NotFound(name.to_string()))
    }

    pub fn list(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        inner.files.keys().cloned().collect()
    }

    /// Advances the directory cursor and returns the next name, or `None`
    /// once every entry present at the start of the walk has been
    /// returned exactly once.
    pub fn list_next(&self) -> Option<String> {
        let mut inner = self.inner.write().unwrap();
        let name = inner.files.keys().nth(inner.list_cursor).cloned();
        if name.is_some() {
            inner.list_cursor += 1;
        }
        name
    }

    pub fn list_reset(&self) {
        self.inner.write().unwrap().list_cursor = 0;
    }

    pub fn free_space(&self) -> usize {
        let inner = self.inner.read().unwrap();
        MAX_DISK_BYTES - inner.used_bytes
    }

    pub fn used_bytes(&self) -> usize {
        self.inner.read().unwrap().used_bytes
    }

    /// Snapshots the dirty set under the lock, then performs host I/O
    /// lock-free. On a write failure for a given file its dirty flag is
    /// restored so a later call retries it.
    pub fn persist_to(&self, dir: &Path) -> Result<(), VfsError> {
        fs::create_dir_all(dir).map_err(|source| VfsError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let (dirty_writes, dirty_deletes): (Vec<(String, Vec<u8>)>, Vec<String>) = {
            let inner = self.inner.read().unwrap();
            let writes = inner
                .files
                .iter()
                .filter(|(_, e)| e.dirty)
                .map(|(name, e)| (name.clone(), e.data.clone()))
                .collect();
            let deletes = inner.pending_deletes.iter().cloned().collect();
            (writes, deletes)
        };

        let mut failed_writes = Vec::new();
        for (name, data) in &dirty_writes {
            let path = dir.join(name);
            if let Err(source) = fs::write(&path, data) {
                failed_writes.push(name.clone());
                tracing::warn!(file = %name, error = %source, "failed to persist vfs file");
            }
        }

        let mut failed_deletes = Vec::new();
        for name in &dirty_deletes {
            let path = dir.join(name);
            if path.exists() {
                if let Err(source) = fs::remove_file(&path) {
                    failed_deletes.push(name.clone());
                    tracing::warn!(file = %name, error = %source, "failed to remove vfs file from host");
                }
            }
        }

        let mut inner = self.inner.write().unwrap();
        for (name, _) in &dirty_writes {
            if !failed_writes.contains(name) {
                if let Some(entry) = inner.files.get_mut(name) {
                    entry.dirty = false;
                }
            }
        }
        for name in &dirty_deletes {
            if !failed_deletes.contains(name) {
                inner.pending_deletes.remove(name);
            }
        }
        if failed_writes.is_empty() && failed_deletes.is_empty() {
            inner.dirty = false;
        }
        Ok(())
    }

    /// Loads every validly named file found directly inside `dir`.
    /// Entries that fail name validation are skipped rather than erroring,
    /// since a host directory may contain unrelated files.
    pub fn load_from(&self, dir: &Path, now: DateTime<Utc>) -> Result<(), VfsError> {
        if !dir.exists() {
            return Ok(());
        }
        let entries = fs::read_dir(dir).map_err(|source| VfsError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let mut inner = self.inner.write().unwrap();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) if is_valid_name(n) => n.to_string(),
                _ => continue,
            };
            let data = fs::read(&path).map_err(|source| VfsError::Io {
                path: path.clone(),
                source,
            })?;
            inner.used_bytes += data.len();
            inner.files.insert(name, FileEntry::new(data, now));
        }
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.read().unwrap().dirty
    }
}

impl Default for VirtualDisk {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn valid_names() {
        assert!(is_valid_name("TEST.TXT"));
        assert!(is_valid_name(".hidden"));
        assert!(is_valid_name("a"));
        assert!(!is_valid_name("toolongfilename12345"));
        assert!(!is_valid_name("bad/name"));
        assert!(!is_valid_name("name.toolong"));
    }

    #[test]
    fn write_then_read_round_trips() {
        let disk = VirtualDisk::new();
        disk.write("TEST.TXT", b"Hello".to_vec(), now()).unwrap();
        assert_eq!(disk.read("TEST.TXT").unwrap(), b"Hello");
        assert_eq!(disk.size("TEST.TXT").unwrap(), 5);
        assert_eq!(disk.used_bytes(), 5);
    }

    #[test]
    fn quota_is_enforced() {
        let disk = VirtualDisk::new();
        let big = vec![0u8; MAX_DISK_BYTES + 1];
        let err = disk.write("BIG", big, now()).unwrap_err();
        assert!(matches!(err, VfsError::QuotaExceeded { .. }));
    }

    #[test]
    fn list_next_terminates_after_n_entries() {
        let disk = VirtualDisk::new();
        disk.write("A", vec![1], now()).unwrap();
        disk.write("B", vec![2], now()).unwrap();
        assert!(disk.list_next().is_some());
        assert!(disk.list_next().is_some());
        assert!(disk.list_next().is_none());
    }

    #[test]
    fn rewrite_updates_used_bytes_correctly() {
        let disk = VirtualDisk::new();
        disk.write("A", vec![1, 2, 3], now()).unwrap();
        disk.write("A", vec![1, 2], now()).unwrap();
        assert_eq!(disk.used_bytes(), 2);
    }

    #[test]
    fn persist_and_load_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let disk = VirtualDisk::new();
        disk.write("TEST.TXT", b"Hello".to_vec(), now()).unwrap();
        disk.persist_to(tmp.path()).unwrap();

        let disk2 = VirtualDisk::new();
        disk2.load_from(tmp.path(), now()).unwrap();
        assert_eq!(disk2.read("TEST.TXT").unwrap(), b"Hello");
    }
}
