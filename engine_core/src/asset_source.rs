use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::asset_key::AssetName;
use crate::observability::lock_unpoisoned;

/// Where loaders read bytes from. Called from loading workers.
pub trait AssetSource: Send + Sync {
    fn read(&self, name: &AssetName) -> io::Result<Vec<u8>>;
}

/// Reads assets relative to a content root on disk.
#[derive(Clone, Debug)]
pub struct FileSource {
    root: PathBuf,
}

impl FileSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, name: &AssetName) -> PathBuf {
        let mut path = self.root.clone();
        for segment in name.as_str().split('/') {
            path.push(segment);
        }
        path
    }
}

impl AssetSource for FileSource {
    fn read(&self, name: &AssetName) -> io::Result<Vec<u8>> {
        let path = self.path_for(name);
        fs::read(&path).map_err(|err| {
            io::Error::new(err.kind(), format!("{}: {}", path.display(), err))
        })
    }
}

/// In-memory files, handy for tests and generated content.
#[derive(Debug, Default)]
pub struct MemorySource {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, name: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(name, bytes);
        self
    }

    /// Adds or replaces a file. Later loads (and reloads) see the new bytes.
    pub fn insert(&self, name: &str, bytes: impl Into<Vec<u8>>) {
        let mut files = lock_unpoisoned(&self.files);
        files.insert(name.trim().to_string(), bytes.into());
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut files = lock_unpoisoned(&self.files);
        files.remove(name.trim()).is_some()
    }
}

impl AssetSource for MemorySource {
    fn read(&self, name: &AssetName) -> io::Result<Vec<u8>> {
        let files = lock_unpoisoned(&self.files);
        files.get(name.as_str()).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no in-memory file '{}'", name),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_source_reads_and_replaces() {
        let source = MemorySource::new().with_file("a/b.txt", "one");
        let name = AssetName::new("a/b.txt").unwrap();
        assert_eq!(source.read(&name).unwrap(), b"one");
        source.insert("a/b.txt", "two");
        assert_eq!(source.read(&name).unwrap(), b"two");
        assert!(source.remove("a/b.txt"));
        assert_eq!(
            source.read(&name).unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }

    #[test]
    fn file_source_reads_under_root() {
        let root = std::env::temp_dir().join(format!("file_source_{}", std::process::id()));
        fs::create_dir_all(root.join("nested")).unwrap();
        fs::write(root.join("nested").join("data.bin"), [1u8, 2, 3]).unwrap();

        let source = FileSource::new(&root);
        let name = AssetName::new("nested/data.bin").unwrap();
        assert_eq!(source.read(&name).unwrap(), vec![1, 2, 3]);
        let missing = AssetName::new("nested/missing.bin").unwrap();
        let err = source.read(&missing).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(err.to_string().contains("missing.bin"));

        let _ = fs::remove_dir_all(&root);
    }
}
