//! Share index: virtual roots mapped to real directories, entries per shared file.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::search::{SearchHit, SearchQuery};
use crate::tth::TthValue;

/// Virtual path separator used on the wire.
pub const SEPARATOR: char = '\\';

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareEntry {
    pub virtual_path: String,
    pub real_path: PathBuf,
    pub size: u64,
    pub mtime: u64,
    #[serde(default)]
    pub tth: Option<TthValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareRoot {
    pub virtual_name: String,
    pub real_path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum ShareError {
    #[error("virtual name '{0}' is already shared")]
    DuplicateName(String),
    #[error("invalid virtual name '{0}'")]
    InvalidName(String),
    #[error("no share root named '{0}'")]
    UnknownRoot(String),
}

/// What an upsert changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    New,
    Changed,
    Unchanged,
}

/// Persisted form of the index.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ShareSnapshot {
    #[serde(default)]
    pub roots: Vec<ShareRoot>,
    #[serde(default)]
    pub entries: Vec<ShareEntry>,
}

#[derive(Default)]
pub struct ShareIndex {
    roots: BTreeMap<String, PathBuf>,
    /// Keyed by lowercased virtual path.
    entries: BTreeMap<String, ShareEntry>,
    by_tth: HashMap<TthValue, String>,
    by_real: HashMap<PathBuf, String>,
}

impl ShareIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_root(&mut self, virtual_name: &str, real_path: PathBuf) -> Result<(), ShareError> {
        let name = virtual_name.trim();
        if name.is_empty() || name.contains(SEPARATOR) || name.contains('/') || name == "." || name == ".." {
            return Err(ShareError::InvalidName(virtual_name.to_string()));
        }
        let clash = self.roots.keys().any(|k| k.eq_ignore_ascii_case(name));
        if clash {
            return Err(ShareError::DuplicateName(name.to_string()));
        }
        self.roots.insert(name.to_string(), real_path);
        Ok(())
    }

    /// Remove a root and every entry below it. Returns the real paths removed.
    pub fn remove_root(&mut self, virtual_name: &str) -> Result<Vec<PathBuf>, ShareError> {
        if self.roots.remove(virtual_name).is_none() {
            return Err(ShareError::UnknownRoot(virtual_name.to_string()));
        }
        let prefix = format!("{}{}", virtual_name.to_lowercase(), SEPARATOR);
        let doomed: Vec<String> = self
            .entries
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        Ok(doomed
            .into_iter()
            .filter_map(|k| self.remove_key(&k))
            .map(|e| e.real_path)
            .collect())
    }

    pub fn roots(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.roots.iter().map(|(k, v)| (k.as_str(), v.as_path()))
    }

    /// Insert or refresh a file. A changed size or mtime clears the TTH.
    pub fn upsert_file(
        &mut self,
        virtual_path: String,
        real_path: PathBuf,
        size: u64,
        mtime: u64,
    ) -> UpsertOutcome {
        let key = virtual_path.to_lowercase();
        if let Some(existing) = self.entries.get_mut(&key) {
            if existing.size == size && existing.mtime == mtime && existing.real_path == real_path {
                return UpsertOutcome::Unchanged;
            }
            if let Some(old) = existing.tth.take() {
                if self.by_tth.get(&old) == Some(&key) {
                    self.by_tth.remove(&old);
                }
            }
            self.by_real.remove(&existing.real_path);
            existing.size = size;
            existing.mtime = mtime;
            existing.real_path = real_path.clone();
            existing.virtual_path = virtual_path;
            self.by_real.insert(real_path, key);
            return UpsertOutcome::Changed;
        }
        self.by_real.insert(real_path.clone(), key.clone());
        self.entries.insert(
            key,
            ShareEntry {
                virtual_path,
                real_path,
                size,
                mtime,
                tth: None,
            },
        );
        UpsertOutcome::New
    }

    /// Attach a hash, only if the entry still has the stamp that was hashed.
    pub fn set_tth(&mut self, real_path: &Path, size: u64, mtime: u64, tth: TthValue) -> bool {
        let Some(key) = self.by_real.get(real_path).cloned() else {
            return false;
        };
        let Some(entry) = self.entries.get_mut(&key) else {
            return false;
        };
        if entry.size != size || entry.mtime != mtime {
            return false;
        }
        entry.tth = Some(tth);
        self.by_tth.insert(tth, key);
        true
    }

    /// Remove entries under `root` whose real path is not in `seen`. Returns removed real paths.
    pub fn retain_seen(&mut self, root: &str, seen: &HashSet<PathBuf>) -> Vec<PathBuf> {
        let prefix = format!("{}{}", root.to_lowercase(), SEPARATOR);
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|(k, e)| k.starts_with(&prefix) && !seen.contains(&e.real_path))
            .map(|(k, _)| k.clone())
            .collect();
        doomed
            .into_iter()
            .filter_map(|k| self.remove_key(&k))
            .map(|e| e.real_path)
            .collect()
    }

    fn remove_key(&mut self, key: &str) -> Option<ShareEntry> {
        let entry = self.entries.remove(key)?;
        if let Some(tth) = &entry.tth {
            if self.by_tth.get(tth).map(String::as_str) == Some(key) {
                self.by_tth.remove(tth);
            }
        }
        self.by_real.remove(&entry.real_path);
        Some(entry)
    }

    pub fn resolve(&self, virtual_path: &str) -> Option<&ShareEntry> {
        let normalized = virtual_path.replace('/', "\\").to_lowercase();
        self.entries.get(normalized.trim_start_matches(SEPARATOR))
    }

    pub fn find_by_tth(&self, tth: &TthValue) -> Option<&ShareEntry> {
        self.by_tth.get(tth).and_then(|k| self.entries.get(k))
    }

    pub fn entry_for_real(&self, real_path: &Path) -> Option<&ShareEntry> {
        self.by_real.get(real_path).and_then(|k| self.entries.get(k))
    }

    pub fn entries(&self) -> impl Iterator<Item = &ShareEntry> {
        self.entries.values()
    }

    /// Entries still lacking a hash.
    pub fn unhashed(&self) -> impl Iterator<Item = &ShareEntry> {
        self.entries.values().filter(|e| e.tth.is_none())
    }

    pub fn file_count(&self) -> usize {
        self.entries.len()
    }

    /// Advertised share size: only hashed files count.
    pub fn share_size(&self) -> u64 {
        self.entries
            .values()
            .filter(|e| e.tth.is_some())
            .map(|e| e.size)
            .sum()
    }

    /// Up to `cap` hits. Only hashed files are returned; folders come from entry paths.
    pub fn search(&self, query: &SearchQuery, cap: usize) -> Vec<SearchHit> {
        let mut out = Vec::new();
        if cap == 0 || query.is_empty() {
            return out;
        }
        if let Some(root) = &query.tth {
            if let Some(e) = self.find_by_tth(root) {
                out.push(SearchHit {
                    virtual_path: e.virtual_path.clone(),
                    size: e.size,
                    tth: e.tth,
                    is_dir: false,
                });
            }
            return out;
        }
        let mut seen_dirs: BTreeSet<String> = BTreeSet::new();
        for e in self.entries.values() {
            if out.len() >= cap {
                break;
            }
            if let Some((dir, _)) = e.virtual_path.rsplit_once(SEPARATOR) {
                if seen_dirs.insert(dir.to_lowercase()) && query.matches_folder(dir) {
                    out.push(SearchHit {
                        virtual_path: dir.to_string(),
                        size: 0,
                        tth: None,
                        is_dir: true,
                    });
                    if out.len() >= cap {
                        break;
                    }
                }
            }
            if e.tth.is_some() && query.matches_file(&e.virtual_path, e.size, e.tth.as_ref()) {
                out.push(SearchHit {
                    virtual_path: e.virtual_path.clone(),
                    size: e.size,
                    tth: e.tth,
                    is_dir: false,
                });
            }
        }
        out
    }

    pub fn snapshot(&self) -> ShareSnapshot {
        ShareSnapshot {
            roots: self
                .roots
                .iter()
                .map(|(k, v)| ShareRoot {
                    virtual_name: k.clone(),
                    real_path: v.clone(),
                })
                .collect(),
            entries: self.entries.values().cloned().collect(),
        }
    }

    pub fn restore(snapshot: ShareSnapshot) -> Self {
        let mut index = Self::new();
        for root in snapshot.roots {
            let _ = index.add_root(&root.virtual_name, root.real_path);
        }
        for e in snapshot.entries {
            let tth = e.tth;
            let (real, size, mtime) = (e.real_path.clone(), e.size, e.mtime);
            index.upsert_file(e.virtual_path, e.real_path, e.size, e.mtime);
            if let Some(tth) = tth {
                index.set_tth(&real, size, mtime, tth);
            }
        }
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::FileType;
    use crate::tth::leaf_hash;

    fn sample() -> ShareIndex {
        let mut idx = ShareIndex::new();
        idx.add_root("Docs", PathBuf::from("/home/u/docs")).unwrap();
        idx.upsert_file("Docs\\report.pdf".into(), "/home/u/docs/report.pdf".into(), 100, 1);
        idx.upsert_file("Docs\\old\\notes.txt".into(), "/home/u/docs/old/notes.txt".into(), 50, 1);
        idx.set_tth(Path::new("/home/u/docs/report.pdf"), 100, 1, leaf_hash(b"r"));
        idx.set_tth(Path::new("/home/u/docs/old/notes.txt"), 50, 1, leaf_hash(b"n"));
        idx
    }

    #[test]
    fn duplicate_root_rejected() {
        let mut idx = sample();
        assert!(matches!(
            idx.add_root("docs", PathBuf::from("/elsewhere")),
            Err(ShareError::DuplicateName(_))
        ));
        assert!(matches!(
            idx.add_root("a\\b", PathBuf::from("/x")),
            Err(ShareError::InvalidName(_))
        ));
    }

    #[test]
    fn change_invalidates_tth() {
        let mut idx = sample();
        let out = idx.upsert_file("Docs\\report.pdf".into(), "/home/u/docs/report.pdf".into(), 101, 2);
        assert_eq!(out, UpsertOutcome::Changed);
        assert!(idx.resolve("Docs\\report.pdf").unwrap().tth.is_none());
        assert!(idx.find_by_tth(&leaf_hash(b"r")).is_none());
        // A stale hash for the old stamp is refused.
        assert!(!idx.set_tth(Path::new("/home/u/docs/report.pdf"), 100, 1, leaf_hash(b"r")));
    }

    #[test]
    fn search_respects_cap_and_hash_state() {
        let mut idx = sample();
        idx.upsert_file("Docs\\report2.pdf".into(), "/home/u/docs/report2.pdf".into(), 10, 1);
        let hits = idx.search(&SearchQuery::by_terms("report"), 10);
        assert_eq!(hits.len(), 1, "unhashed file is not returned");
        let hits = idx.search(&SearchQuery::by_terms("docs"), 1);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn search_by_tth_and_folder() {
        let idx = sample();
        let hits = idx.search(&SearchQuery::by_tth(leaf_hash(b"n")), 5);
        assert_eq!(hits[0].virtual_path, "Docs\\old\\notes.txt");
        let hits = idx.search(&SearchQuery::by_terms("old").with_type(FileType::Folder), 5);
        assert_eq!(hits.len(), 1);
        assert!(hits[0].is_dir);
        assert_eq!(hits[0].virtual_path, "Docs\\old");
    }

    #[test]
    fn retain_seen_removes_missing() {
        let mut idx = sample();
        let seen: HashSet<PathBuf> = [PathBuf::from("/home/u/docs/report.pdf")].into_iter().collect();
        let removed = idx.retain_seen("Docs", &seen);
        assert_eq!(removed, vec![PathBuf::from("/home/u/docs/old/notes.txt")]);
        assert_eq!(idx.file_count(), 1);
        assert_eq!(idx.share_size(), 100);
    }

    #[test]
    fn snapshot_roundtrip_keeps_hashes() {
        let idx = sample();
        let json = serde_json::to_string(&idx.snapshot()).unwrap();
        let back = ShareIndex::restore(serde_json::from_str(&json).unwrap());
        assert_eq!(back.file_count(), 2);
        assert!(back.find_by_tth(&leaf_hash(b"r")).is_some());
        assert_eq!(back.roots().count(), 1);
    }

    #[test]
    fn resolve_accepts_forward_slashes() {
        let idx = sample();
        assert!(idx.resolve("docs/OLD/notes.txt").is_some());
    }
}
