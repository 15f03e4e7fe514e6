//! The set of open TSM files.
//!
//! Compaction replaces files while scans run. The store never hands out its
//! live list: [`FileStore::segments`] clones the current `Arc` handles into a
//! [`SegmentSnapshot`], and swaps made afterwards do not affect it.

use crate::error::Result;
use crate::tsm::file::TsmReader;
use crate::tsm::segment::{Segment, SegmentSnapshot, SegmentSource};
use parking_lot::RwLock;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// File extension of TSM segment files.
pub const TSM_FILE_EXTENSION: &str = "tsm";

/// Ordered collection of open TSM readers.
#[derive(Default)]
pub struct FileStore {
    files: RwLock<Vec<Arc<TsmReader>>>,
}

impl FileStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens every `*.tsm` file in `dir`, in file name order.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed or any TSM file
    /// fails to open.
    pub fn open(dir: &Path) -> Result<Self> {
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == TSM_FILE_EXTENSION))
            .collect();
        paths.sort();

        let mut files = Vec::with_capacity(paths.len());
        for path in &paths {
            files.push(Arc::new(TsmReader::open(path)?));
        }
        debug!("Opened {} TSM files from {}", files.len(), dir.display());

        Ok(Self {
            files: RwLock::new(files),
        })
    }

    /// Adds an opened file.
    pub fn add(&self, reader: TsmReader) -> Arc<TsmReader> {
        let reader = Arc::new(reader);
        self.files.write().push(Arc::clone(&reader));
        reader
    }

    /// Atomically removes the files at `removed` and adds `added`.
    ///
    /// Scans that already took a snapshot keep reading the removed files.
    pub fn replace(&self, removed: &[PathBuf], added: Vec<TsmReader>) {
        let mut files = self.files.write();
        files.retain(|f| !removed.iter().any(|p| p == f.path()));
        files.extend(added.into_iter().map(Arc::new));
        debug!(
            "Replaced {} TSM files, store now holds {}",
            removed.len(),
            files.len()
        );
    }

    /// Removes the file at `path`, returning its handle.
    pub fn remove(&self, path: &Path) -> Option<Arc<TsmReader>> {
        let mut files = self.files.write();
        let pos = files.iter().position(|f| f.path() == path)?;
        Some(files.remove(pos))
    }

    /// Paths of the current files.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.files
            .read()
            .iter()
            .map(|f| f.path().to_path_buf())
            .collect()
    }

    /// Number of files.
    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    /// Returns true if the store holds no files.
    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

impl SegmentSource for FileStore {
    fn segments(&self) -> SegmentSnapshot {
        let segments = self
            .files
            .read()
            .iter()
            .map(|f| Arc::clone(f) as Arc<dyn Segment>)
            .collect();
        SegmentSnapshot::new(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tsm::file::TsmWriter;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, key: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut writer = TsmWriter::new(&path).unwrap();
        writer.write(key, &BTreeMap::from([(1, 1.0), (5, 2.0)])).unwrap();
        writer.finish().unwrap();
        path
    }

    #[test]
    fn test_open_directory_in_name_order() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "002.tsm", b"b");
        write(dir.path(), "001.tsm", b"a");
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let store = FileStore::open(dir.path()).unwrap();
        let names: Vec<String> = store
            .paths()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["001.tsm", "002.tsm"]);
    }

    #[test]
    fn test_snapshot_survives_replace() {
        let dir = TempDir::new().unwrap();
        let a = write(dir.path(), "a.tsm", b"a");
        let b = write(dir.path(), "b.tsm", b"b");
        let store = FileStore::new();
        store.add(TsmReader::open(&a).unwrap());
        store.add(TsmReader::open(&b).unwrap());

        let snapshot = store.segments();

        let c = write(dir.path(), "c.tsm", b"c");
        store.replace(&[a.clone(), b.clone()], vec![TsmReader::open(&c).unwrap()]);
        fs::remove_file(&a).unwrap();
        fs::remove_file(&b).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(snapshot.len(), 2);

        // Removed files stay readable through the snapshot; the window forces
        // a block decode.
        let mut keys = Vec::new();
        snapshot.for_each(|segment| {
            let mut cursor = segment.time_range_cursor(b"", 1, 10);
            while cursor.advance() {
                assert!(cursor.has_data());
                keys.push(cursor.key().to_vec());
            }
            assert!(cursor.error().is_none());
            true
        });
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let a = write(dir.path(), "a.tsm", b"a");
        let store = FileStore::new();
        store.add(TsmReader::open(&a).unwrap());

        assert!(store.remove(&a).is_some());
        assert!(store.is_empty());
        assert!(store.remove(&a).is_none());
    }
}
