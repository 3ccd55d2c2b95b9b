//! Hash store: file index (path, size, mtime) -> root, and root -> tree records.
//! Hashing itself runs on the host; the store hands out jobs and publishes results.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::tth::{TigerTree, TthValue};

/// Shared, immutable hash record.
pub type HashRecord = Arc<TigerTree>;

/// Version tag written in front of the tree data blob.
pub const TREE_DATA_VERSION: u32 = 1;

/// Result of asking for a file's hash.
#[derive(Debug, Clone)]
pub enum HashLookup {
    Ready(HashRecord),
    Pending,
}

/// A file waiting to be hashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashJob {
    pub path: PathBuf,
    pub size: u64,
    pub mtime: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashProgress {
    pub files_left: usize,
    pub bytes_left: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileIndexEntry {
    size: u64,
    mtime: u64,
    root: TthValue,
}

/// On-disk form of the file index.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct HashIndexSnapshot {
    #[serde(default)]
    pub files: Vec<IndexedFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedFile {
    pub path: PathBuf,
    pub size: u64,
    pub mtime: u64,
    pub root: TthValue,
}

#[derive(Debug, Serialize, Deserialize)]
struct TreeData {
    version: u32,
    trees: Vec<TigerTree>,
}

#[derive(Debug, thiserror::Error)]
pub enum HashStoreError {
    #[error("tree data: {0}")]
    Codec(#[from] bincode::Error),
    #[error("unsupported tree data version {0}")]
    Version(u32),
}

/// Outcome of publishing a finished job.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// Record stored and indexed.
    Stored(HashRecord),
    /// The job was superseded (file re-requested with a different stamp, or dropped).
    Stale,
}

#[derive(Default)]
pub struct HashStore {
    files: HashMap<PathBuf, FileIndexEntry>,
    trees: HashMap<TthValue, HashRecord>,
    pending: VecDeque<HashJob>,
    pending_paths: HashSet<PathBuf>,
    running: Option<HashJob>,
}

impl HashStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ready if a record exists for this exact (path, size, mtime); otherwise queue once.
    pub fn request_hash(&mut self, path: &Path, size: u64, mtime: u64) -> HashLookup {
        if let Some(record) = self.get_hash_if_ready(path, size, mtime) {
            return HashLookup::Ready(record);
        }
        let job = HashJob {
            path: path.to_path_buf(),
            size,
            mtime,
        };
        if self.running.as_ref() == Some(&job) {
            return HashLookup::Pending;
        }
        if self.pending_paths.contains(path) {
            // Same path re-requested with a new stamp replaces the queued job.
            for queued in self.pending.iter_mut() {
                if queued.path == path {
                    *queued = job;
                    break;
                }
            }
            return HashLookup::Pending;
        }
        self.pending_paths.insert(job.path.clone());
        self.pending.push_back(job);
        HashLookup::Pending
    }

    pub fn get_hash_if_ready(&self, path: &Path, size: u64, mtime: u64) -> Option<HashRecord> {
        let entry = self.files.get(path)?;
        if entry.size != size || entry.mtime != mtime {
            return None;
        }
        self.trees.get(&entry.root).cloned()
    }

    /// Root for a path regardless of stamp freshness checks by the caller.
    pub fn root_for(&self, path: &Path) -> Option<TthValue> {
        self.files.get(path).map(|e| e.root)
    }

    pub fn get_tree(&self, root: &TthValue) -> Option<HashRecord> {
        self.trees.get(root).cloned()
    }

    /// Store a tree obtained elsewhere (downloaded leaves, verified download).
    pub fn add_tree(&mut self, tree: TigerTree) -> HashRecord {
        let root = tree.root;
        self.trees
            .entry(root)
            .or_insert_with(|| Arc::new(tree))
            .clone()
    }

    /// Take the next job; it stays "running" until `complete` or `fail`.
    pub fn next_job(&mut self) -> Option<HashJob> {
        if self.running.is_some() {
            return None;
        }
        let job = self.pending.pop_front()?;
        self.pending_paths.remove(&job.path);
        self.running = Some(job.clone());
        Some(job)
    }

    /// Publish a finished hash. `job` carries the stamp the file had when hashing started.
    pub fn complete(&mut self, job: &HashJob, tree: TigerTree) -> JobOutcome {
        if self.running.as_ref() == Some(job) {
            self.running = None;
        }
        if tree.file_size != job.size {
            return JobOutcome::Stale;
        }
        let record = self.add_tree(tree);
        self.files.insert(
            job.path.clone(),
            FileIndexEntry {
                size: job.size,
                mtime: job.mtime,
                root: record.root,
            },
        );
        JobOutcome::Stored(record)
    }

    /// Requeue a job whose file changed while hashing.
    pub fn restart(&mut self, job: HashJob) {
        if self.running.as_ref().map(|r| &r.path) == Some(&job.path) {
            self.running = None;
        }
        if self.pending_paths.insert(job.path.clone()) {
            self.pending.push_front(job);
        }
    }

    /// Drop a job whose file could not be read.
    pub fn fail(&mut self, job: &HashJob) {
        if self.running.as_ref().map(|r| &r.path) == Some(&job.path) {
            self.running = None;
        }
    }

    /// Forget a path (removed from share or changed on disk).
    pub fn invalidate(&mut self, path: &Path) {
        self.files.remove(path);
        if self.pending_paths.remove(path) {
            self.pending.retain(|j| j.path != path);
        }
    }

    /// Abandon all queued work (hasher stopped).
    pub fn clear_pending(&mut self) {
        self.pending.clear();
        self.pending_paths.clear();
        self.running = None;
    }

    /// Drop index entries for paths not in `keep`, and trees no longer referenced
    /// by any file or listed in `extra_roots`.
    pub fn prune(&mut self, keep: &HashSet<PathBuf>, extra_roots: &HashSet<TthValue>) {
        self.files.retain(|p, _| keep.contains(p));
        let used: HashSet<TthValue> = self.files.values().map(|e| e.root).collect();
        self.trees
            .retain(|root, _| used.contains(root) || extra_roots.contains(root));
    }

    pub fn progress(&self) -> HashProgress {
        let queued = self.pending.iter().map(|j| j.size).sum::<u64>();
        let running = self.running.as_ref().map(|j| j.size).unwrap_or(0);
        HashProgress {
            files_left: self.pending.len() + usize::from(self.running.is_some()),
            bytes_left: queued + running,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.running.is_none()
    }

    pub fn indexed_files(&self) -> usize {
        self.files.len()
    }

    pub fn index_snapshot(&self) -> HashIndexSnapshot {
        let mut files: Vec<IndexedFile> = self
            .files
            .iter()
            .map(|(path, e)| IndexedFile {
                path: path.clone(),
                size: e.size,
                mtime: e.mtime,
                root: e.root,
            })
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        HashIndexSnapshot { files }
    }

    /// Bincode blob of every stored tree.
    pub fn encode_tree_data(&self) -> Result<Vec<u8>, HashStoreError> {
        let mut trees: Vec<TigerTree> = self.trees.values().map(|t| (**t).clone()).collect();
        trees.sort_by(|a, b| a.root.cmp(&b.root));
        let data = TreeData {
            version: TREE_DATA_VERSION,
            trees,
        };
        Ok(bincode::serialize(&data)?)
    }

    /// Rebuild from persisted index and tree data. Index entries whose tree is missing
    /// are dropped so the file gets re-hashed on next request.
    pub fn restore(index: HashIndexSnapshot, tree_data: &[u8]) -> Result<Self, HashStoreError> {
        let mut store = Self::new();
        if !tree_data.is_empty() {
            let data: TreeData = bincode::deserialize(tree_data)?;
            if data.version != TREE_DATA_VERSION {
                return Err(HashStoreError::Version(data.version));
            }
            for tree in data.trees {
                store.add_tree(tree);
            }
        }
        for f in index.files {
            if store.trees.contains_key(&f.root) {
                store.files.insert(
                    f.path,
                    FileIndexEntry {
                        size: f.size,
                        mtime: f.mtime,
                        root: f.root,
                    },
                );
            }
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_job(store: &mut HashStore, data: &[u8]) -> (HashJob, JobOutcome) {
        let job = store.next_job().expect("job queued");
        let tree = TigerTree::hash_bytes(data, 64 * 1024);
        let outcome = store.complete(&job, tree);
        (job, outcome)
    }

    #[test]
    fn unchanged_file_is_not_rehashed() {
        let mut store = HashStore::new();
        let path = Path::new("/share/a.bin");
        let data = vec![1u8; 5000];
        assert!(matches!(store.request_hash(path, 5000, 10), HashLookup::Pending));
        // A second request while queued does not add a second job.
        assert!(matches!(store.request_hash(path, 5000, 10), HashLookup::Pending));
        assert_eq!(store.progress().files_left, 1);
        let (_, outcome) = hash_job(&mut store, &data);
        assert!(matches!(outcome, JobOutcome::Stored(_)));
        assert!(matches!(store.request_hash(path, 5000, 10), HashLookup::Ready(_)));
        assert!(store.next_job().is_none());
        assert!(store.is_idle());
    }

    #[test]
    fn modified_file_gets_new_root() {
        let mut store = HashStore::new();
        let path = Path::new("/share/b.bin");
        store.request_hash(path, 4, 1);
        let (_, first) = hash_job(&mut store, b"aaaa");
        let first = match first {
            JobOutcome::Stored(r) => r,
            JobOutcome::Stale => panic!("stale"),
        };
        assert!(matches!(store.request_hash(path, 4, 2), HashLookup::Pending));
        let (_, second) = hash_job(&mut store, b"bbbb");
        let second = match second {
            JobOutcome::Stored(r) => r,
            JobOutcome::Stale => panic!("stale"),
        };
        assert_ne!(first.root, second.root);
        assert!(store.get_hash_if_ready(path, 4, 1).is_none());
        assert!(store.get_hash_if_ready(path, 4, 2).is_some());
    }

    #[test]
    fn size_mismatch_is_stale() {
        let mut store = HashStore::new();
        store.request_hash(Path::new("/x"), 10, 1);
        let job = store.next_job().unwrap();
        let outcome = store.complete(&job, TigerTree::hash_bytes(b"short", 1024));
        assert!(matches!(outcome, JobOutcome::Stale));
        assert!(store.get_hash_if_ready(Path::new("/x"), 10, 1).is_none());
    }

    #[test]
    fn restart_requeues_first() {
        let mut store = HashStore::new();
        store.request_hash(Path::new("/a"), 1, 1);
        store.request_hash(Path::new("/b"), 1, 1);
        let job = store.next_job().unwrap();
        assert_eq!(job.path, Path::new("/a"));
        store.restart(HashJob { mtime: 2, ..job });
        let again = store.next_job().unwrap();
        assert_eq!(again.path, Path::new("/a"));
        assert_eq!(again.mtime, 2);
    }

    #[test]
    fn snapshot_restore() {
        let mut store = HashStore::new();
        let path = Path::new("/share/c.bin");
        store.request_hash(path, 3, 7);
        hash_job(&mut store, b"abc");
        let index = store.index_snapshot();
        let data = store.encode_tree_data().unwrap();
        let json = serde_json::to_string(&index).unwrap();
        let index: HashIndexSnapshot = serde_json::from_str(&json).unwrap();
        let restored = HashStore::restore(index, &data).unwrap();
        assert!(restored.get_hash_if_ready(path, 3, 7).is_some());
    }

    #[test]
    fn index_tolerates_unknown_fields() {
        let json = r#"{"files": [], "generator": "future"}"#;
        let index: HashIndexSnapshot = serde_json::from_str(json).unwrap();
        assert!(index.files.is_empty());
    }

    #[test]
    fn prune_drops_unreferenced() {
        let mut store = HashStore::new();
        store.request_hash(Path::new("/keep"), 1, 1);
        hash_job(&mut store, b"k");
        store.request_hash(Path::new("/drop"), 1, 1);
        hash_job(&mut store, b"d");
        let keep: HashSet<PathBuf> = [PathBuf::from("/keep")].into_iter().collect();
        store.prune(&keep, &HashSet::new());
        assert_eq!(store.indexed_files(), 1);
        assert!(store.root_for(Path::new("/drop")).is_none());
    }
}
