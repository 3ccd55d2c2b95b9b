//! On-disk state under the data directory. JSON files tolerate unknown fields; tree
//! data is the core's versioned bincode blob.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use dc_core::hash::{HashIndexSnapshot, HashStoreError};
use dc_core::share::ShareSnapshot;
use dc_core::{HashStore, QueueSnapshot};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub const QUEUE_FILE: &str = "queue.json";
pub const SHARE_FILE: &str = "share.json";
pub const HASH_INDEX_FILE: &str = "hashindex.json";
pub const HASH_DATA_FILE: &str = "hashdata.bin";

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("{path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("{path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("{path}: {source}")]
    Trees {
        path: PathBuf,
        source: HashStoreError,
    },
}

/// The data directory.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    fn file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Missing file means empty state.
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, PersistError> {
        let path = self.file(name);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PersistError::Io { path, source }),
        }
    }

    /// Write next to the target and rename over it.
    fn write(&self, name: &str, bytes: &[u8]) -> Result<(), PersistError> {
        let path = self.file(name);
        let io_err = |source| PersistError::Io {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(&self.root).map_err(io_err)?;
        let tmp = self.file(&format!("{}.tmp", name));
        fs::write(&tmp, bytes).map_err(io_err)?;
        fs::rename(&tmp, &path).map_err(io_err)?;
        Ok(())
    }

    fn read_json<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T, PersistError> {
        match self.read(name)? {
            None => Ok(T::default()),
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|source| PersistError::Json {
                path: self.file(name),
                source,
            }),
        }
    }

    fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<(), PersistError> {
        let bytes = serde_json::to_vec_pretty(value).map_err(|source| PersistError::Json {
            path: self.file(name),
            source,
        })?;
        self.write(name, &bytes)
    }

    pub fn load_queue(&self) -> Result<QueueSnapshot, PersistError> {
        self.read_json(QUEUE_FILE)
    }

    pub fn save_queue(&self, snapshot: &QueueSnapshot) -> Result<(), PersistError> {
        self.write_json(QUEUE_FILE, snapshot)
    }

    pub fn load_share(&self) -> Result<ShareSnapshot, PersistError> {
        self.read_json(SHARE_FILE)
    }

    pub fn save_share(&self, snapshot: &ShareSnapshot) -> Result<(), PersistError> {
        self.write_json(SHARE_FILE, snapshot)
    }

    pub fn load_hashes(&self) -> Result<HashStore, PersistError> {
        let index: HashIndexSnapshot = self.read_json(HASH_INDEX_FILE)?;
        let data = self.read(HASH_DATA_FILE)?.unwrap_or_default();
        HashStore::restore(index, &data).map_err(|source| PersistError::Trees {
            path: self.file(HASH_DATA_FILE),
            source,
        })
    }

    pub fn save_hashes(&self, store: &HashStore) -> Result<(), PersistError> {
        let data = store.encode_tree_data().map_err(|source| PersistError::Trees {
            path: self.file(HASH_DATA_FILE),
            source,
        })?;
        self.write(HASH_DATA_FILE, &data)?;
        self.write_json(HASH_INDEX_FILE, &store.index_snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dc_core::hash::HashLookup;
    use dc_core::tth::TigerTree;
    use dc_core::{Priority, QueueManager, ShareIndex, Source};

    #[test]
    fn empty_dir_loads_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::new(dir.path().join("nested"));
        assert!(state.load_queue().unwrap().items.is_empty());
        assert!(state.load_share().unwrap().entries.is_empty());
        assert_eq!(state.load_hashes().unwrap().indexed_files(), 0);
    }

    #[test]
    fn queue_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::new(dir.path());
        let mut q = QueueManager::new();
        let id = q
            .add("/dl/a.bin".into(), 5 << 20, None, Priority::High)
            .unwrap();
        q.add_source(id, Source::new("alice", "hub:411")).unwrap();
        state.save_queue(&q.snapshot()).unwrap();

        let restored = QueueManager::restore(state.load_queue().unwrap());
        let item = restored.get(&id).unwrap();
        assert_eq!(item.priority, Priority::High);
        assert_eq!(item.sources[0].nick, "alice");
        assert!(!dir.path().join("queue.json.tmp").exists());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(SHARE_FILE),
            br#"{"roots": [], "entries": [], "written_by": "newer build"}"#,
        )
        .unwrap();
        let state = StateDir::new(dir.path());
        assert!(state.load_share().unwrap().roots.is_empty());
    }

    #[test]
    fn corrupt_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(QUEUE_FILE), b"{not json").unwrap();
        let err = StateDir::new(dir.path()).load_queue().unwrap_err();
        assert!(matches!(err, PersistError::Json { .. }));
    }

    #[test]
    fn hash_store_round_trip_keeps_lookups() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::new(dir.path());
        let mut store = HashStore::new();
        let path = std::path::Path::new("/share/a.txt");
        assert!(matches!(store.request_hash(path, 3, 7), HashLookup::Pending));
        let job = store.next_job().unwrap();
        let tree = TigerTree::hash_bytes(b"abc", 64 * 1024);
        let root = tree.root;
        store.complete(&job, tree);
        state.save_hashes(&store).unwrap();

        let mut loaded = state.load_hashes().unwrap();
        match loaded.request_hash(path, 3, 7) {
            HashLookup::Ready(record) => assert_eq!(record.root, root),
            HashLookup::Pending => panic!("cached hash was recomputed"),
        }
    }

    #[test]
    fn share_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::new(dir.path());
        let mut share = ShareIndex::new();
        share.add_root("Docs", "/srv/docs".into()).unwrap();
        share.upsert_file("Docs\\a.txt".into(), "/srv/docs/a.txt".into(), 3, 1);
        state.save_share(&share.snapshot()).unwrap();
        let restored = ShareIndex::restore(state.load_share().unwrap());
        assert!(restored.resolve("Docs/a.txt").is_some());
    }
}
