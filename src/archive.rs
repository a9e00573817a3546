//! Named-entry archives.
//!
//! An `Archive` is the entry list the generator and patcher operate on:
//! name, bytes and an optional timestamp per entry, ordered by name. On disk
//! an archive is a directory tree; names are `/`-separated relative paths.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::SystemTime;

use memmap2::Mmap;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{PatchError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub data: Vec<u8>,
    pub modified: Option<SystemTime>,
}

impl ArchiveEntry {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            modified: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Archive {
    entries: BTreeMap<String, ArchiveEntry>,
}

impl Archive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry, returning the previous one.
    pub fn insert(&mut self, entry: ArchiveEntry) -> Option<ArchiveEntry> {
        self.entries.insert(entry.name.clone(), entry)
    }

    pub fn get(&self, name: &str) -> Option<&ArchiveEntry> {
        self.entries.get(name)
    }

    pub fn data(&self, name: &str) -> Option<&[u8]> {
        self.entries.get(name).map(|e| e.data.as_slice())
    }

    pub fn remove(&mut self, name: &str) -> Option<ArchiveEntry> {
        self.entries.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ArchiveEntry> {
        self.entries.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Load every regular file under `root`.
    pub fn load_dir(root: &Path) -> Result<Self> {
        let mut archive = Archive::new();

        for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                PatchError::Io(std::io::Error::other(format!(
                    "Failed to read directory entry in {}: {e}",
                    root.display()
                )))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }

            let name = relative_name(root, entry.path())?;
            let modified = entry.metadata().ok().and_then(|m| m.modified().ok());
            let data = read_file(entry.path())?;
            archive.insert(ArchiveEntry {
                name,
                data,
                modified,
            });
        }

        debug!("Loaded {} entries from {}", archive.len(), root.display());
        Ok(archive)
    }

    /// Write the archive as a directory tree at `root`, replacing whatever is
    /// there. Entries are staged in a sibling temporary directory, so a
    /// failure leaves `root` untouched.
    pub fn write_dir(&self, root: &Path) -> Result<()> {
        let parent = match root.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => std::env::current_dir()?,
        };
        fs::create_dir_all(&parent)?;
        let staging = tempfile::Builder::new()
            .prefix(".binpatcher-")
            .tempdir_in(&parent)?;

        for entry in self.iter() {
            let path = staging.path().join(&entry.name);
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::write(&path, &entry.data)?;
            if let Some(modified) = entry.modified {
                fs::File::options()
                    .write(true)
                    .open(&path)?
                    .set_modified(modified)?;
            }
        }

        if root.exists() {
            if root.is_dir() {
                fs::remove_dir_all(root)?;
            } else {
                fs::remove_file(root)?;
            }
        }
        let staged = staging.keep();
        if let Err(e) = fs::rename(&staged, root) {
            let _ = fs::remove_dir_all(&staged);
            return Err(e.into());
        }

        debug!("Wrote {} entries to {}", self.len(), root.display());
        Ok(())
    }
}

impl FromIterator<ArchiveEntry> for Archive {
    fn from_iter<I: IntoIterator<Item = ArchiveEntry>>(iter: I) -> Self {
        let mut archive = Archive::new();
        for entry in iter {
            archive.insert(entry);
        }
        archive
    }
}

/// `/`-separated path of `path` relative to `root`.
fn relative_name(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| {
        PatchError::invalid_path(path.display().to_string(), "not under archive root")
    })?;
    let name = relative.to_str().ok_or_else(|| {
        PatchError::invalid_path(relative.display().to_string(), "not valid UTF-8")
    })?;
    Ok(name.replace('\\', "/"))
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    let file = fs::File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(Vec::new());
    }
    // SAFETY: the mapping is read-only and copied out before returning; the
    // tool does not modify inputs while loading them.
    let map = unsafe { Mmap::map(&file)? };
    Ok(map.to_vec())
}
