//! In-memory filesystem behind the mock device.

use std::collections::{BTreeMap, BTreeSet};

use crate::device::{DirEntry, DirEntryKind};
use crate::error::{SniError, SniResult};

/// Directory tree held entirely in memory. Paths are `/`-separated and
/// absolute; a missing leading slash is tolerated.
#[derive(Debug, Clone)]
pub struct MemoryFilesystem {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
}

impl Default for MemoryFilesystem {
    fn default() -> Self {
        Self {
            dirs: BTreeSet::from(["/".to_string()]),
            files: BTreeMap::new(),
        }
    }
}

impl MemoryFilesystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with initial files; parent directories are created as needed.
    pub fn with_files<I, S>(files: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<u8>)>,
        S: AsRef<str>,
    {
        let mut fs = Self::new();
        for (path, data) in files {
            let path = normalize(path.as_ref());
            let mut parent = parent_of(&path);
            while !fs.dirs.contains(&parent) {
                fs.dirs.insert(parent.clone());
                parent = parent_of(&parent);
            }
            fs.files.insert(path, data);
        }
        fs
    }

    pub fn read_directory(&self, path: &str) -> SniResult<Vec<DirEntry>> {
        let path = normalize(path);
        if !self.dirs.contains(&path) {
            return Err(not_found(&path));
        }

        let dirs = self
            .dirs
            .iter()
            .filter(|d| *d != "/" && parent_of(d) == path)
            .map(|d| DirEntry {
                name: file_name(d).to_string(),
                kind: DirEntryKind::Directory,
            });
        let files = self
            .files
            .keys()
            .filter(|f| parent_of(f) == path)
            .map(|f| DirEntry {
                name: file_name(f).to_string(),
                kind: DirEntryKind::File,
            });
        Ok(dirs.chain(files).collect())
    }

    pub fn make_directory(&mut self, path: &str) -> SniResult<()> {
        let path = normalize(path);
        if self.exists(&path) {
            return Err(SniError::Protocol(format!("{}: already exists", path)));
        }
        let parent = parent_of(&path);
        if !self.dirs.contains(&parent) {
            return Err(not_found(&parent));
        }
        self.dirs.insert(path);
        Ok(())
    }

    /// Remove a file or an empty directory.
    pub fn remove(&mut self, path: &str) -> SniResult<()> {
        let path = normalize(path);
        if self.files.remove(&path).is_some() {
            return Ok(());
        }
        if path == "/" || !self.dirs.contains(&path) {
            return Err(not_found(&path));
        }
        if self.has_children(&path) {
            return Err(SniError::Protocol(format!("{}: directory not empty", path)));
        }
        self.dirs.remove(&path);
        Ok(())
    }

    /// Rename `path` to `new_name` within the same directory.
    pub fn rename(&mut self, path: &str, new_name: &str) -> SniResult<()> {
        let path = normalize(path);
        if new_name.is_empty() || new_name.contains('/') {
            return Err(SniError::Protocol(format!("invalid file name '{}'", new_name)));
        }
        let target = join(&parent_of(&path), new_name);
        if self.exists(&target) {
            return Err(SniError::Protocol(format!("{}: already exists", target)));
        }

        if let Some(data) = self.files.remove(&path) {
            self.files.insert(target, data);
            return Ok(());
        }
        if path == "/" || !self.dirs.contains(&path) {
            return Err(not_found(&path));
        }

        // move the directory and everything below it
        let prefix = format!("{}/", path);
        let moved_dirs: Vec<String> = self
            .dirs
            .iter()
            .filter(|d| **d == path || d.starts_with(&prefix))
            .cloned()
            .collect();
        for d in moved_dirs {
            self.dirs.remove(&d);
            self.dirs.insert(format!("{}{}", target, &d[path.len()..]));
        }
        let moved_files: Vec<String> = self
            .files
            .keys()
            .filter(|f| f.starts_with(&prefix))
            .cloned()
            .collect();
        for f in moved_files {
            if let Some(data) = self.files.remove(&f) {
                self.files.insert(format!("{}{}", target, &f[path.len()..]), data);
            }
        }
        Ok(())
    }

    pub fn write_file(&mut self, path: &str, data: Vec<u8>) -> SniResult<()> {
        let path = normalize(path);
        if self.dirs.contains(&path) {
            return Err(SniError::Protocol(format!("{}: is a directory", path)));
        }
        let parent = parent_of(&path);
        if !self.dirs.contains(&parent) {
            return Err(not_found(&parent));
        }
        self.files.insert(path, data);
        Ok(())
    }

    pub fn read_file(&self, path: &str) -> SniResult<&[u8]> {
        let path = normalize(path);
        self.files
            .get(&path)
            .map(Vec::as_slice)
            .ok_or_else(|| not_found(&path))
    }

    pub fn exists(&self, path: &str) -> bool {
        let path = normalize(path);
        self.dirs.contains(&path) || self.files.contains_key(&path)
    }

    fn has_children(&self, dir: &str) -> bool {
        self.dirs.iter().any(|d| d != "/" && parent_of(d) == dir)
            || self.files.keys().any(|f| parent_of(f) == dir)
    }
}

fn not_found(path: &str) -> SniError {
    SniError::Protocol(format!("{}: no such file or directory", path))
}

/// Absolute path without duplicate or trailing slashes.
fn normalize(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    format!("/{}", parts.join("/"))
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => path[..i].to_string(),
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}
