//! Walk share roots on disk and fold what was found into the share index.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use dc_core::hash::HashLookup;
use dc_core::share::{UpsertOutcome, SEPARATOR};
use dc_core::{HashStore, ShareIndex, TthValue};

/// A regular file under a share root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundFile {
    pub virtual_path: String,
    pub real_path: PathBuf,
    pub size: u64,
    pub mtime: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub added: usize,
    pub changed: usize,
    pub removed: usize,
    /// Files handed to the hasher.
    pub queued: usize,
    /// Files whose hash came from the stored index.
    pub cached: Vec<(PathBuf, TthValue)>,
}

impl ScanReport {
    pub fn merge(&mut self, other: ScanReport) {
        self.added += other.added;
        self.changed += other.changed;
        self.removed += other.removed;
        self.queued += other.queued;
        self.cached.extend(other.cached);
    }
}

/// Size and mtime (seconds) of a file.
pub fn file_stamp(path: &Path) -> io::Result<(u64, u64)> {
    let meta = fs::metadata(path)?;
    let mtime = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Ok((meta.len(), mtime))
}

/// Every regular file under `root`, hidden entries and symlinks skipped.
pub fn walk(virtual_name: &str, root: &Path) -> io::Result<Vec<FoundFile>> {
    let mut out = Vec::new();
    let mut stack = vec![(root.to_path_buf(), virtual_name.to_string())];
    while let Some((dir, vdir)) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if dir == root => return Err(e),
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "skipping unreadable directory");
                continue;
            }
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || name.contains(SEPARATOR) {
                continue;
            }
            let kind = entry.file_type()?;
            let path = entry.path();
            let vpath = format!("{}{}{}", vdir, SEPARATOR, name);
            if kind.is_dir() {
                stack.push((path, vpath));
            } else if kind.is_file() {
                match file_stamp(&path) {
                    Ok((size, mtime)) => out.push(FoundFile {
                        virtual_path: vpath,
                        real_path: path,
                        size,
                        mtime,
                    }),
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping file"),
                }
            }
        }
    }
    out.sort_by(|a, b| a.virtual_path.cmp(&b.virtual_path));
    Ok(out)
}

/// Merge one root's files into the index: upsert, drop the missing, attach cached
/// hashes and queue the rest for hashing.
pub fn apply(
    share: &mut ShareIndex,
    hashes: &mut HashStore,
    virtual_name: &str,
    found: Vec<FoundFile>,
) -> ScanReport {
    let mut report = ScanReport::default();
    let seen: HashSet<PathBuf> = found.iter().map(|f| f.real_path.clone()).collect();
    for f in found {
        match share.upsert_file(f.virtual_path, f.real_path.clone(), f.size, f.mtime) {
            UpsertOutcome::New => report.added += 1,
            UpsertOutcome::Changed => {
                hashes.invalidate(&f.real_path);
                report.changed += 1;
            }
            UpsertOutcome::Unchanged => {}
        }
        let hashed = share
            .entry_for_real(&f.real_path)
            .is_some_and(|e| e.tth.is_some());
        if hashed {
            continue;
        }
        match hashes.request_hash(&f.real_path, f.size, f.mtime) {
            HashLookup::Ready(record) => {
                if share.set_tth(&f.real_path, f.size, f.mtime, record.root) {
                    report.cached.push((f.real_path, record.root));
                }
            }
            HashLookup::Pending => report.queued += 1,
        }
    }
    for gone in share.retain_seen(virtual_name, &seen) {
        hashes.invalidate(&gone);
        report.removed += 1;
    }
    report
}

/// Register a configured root unless the index already has it.
pub fn ensure_root(share: &mut ShareIndex, virtual_name: &str, real_path: &Path) -> Result<(), dc_core::share::ShareError> {
    if share.roots().any(|(name, _)| name == virtual_name) {
        return Ok(());
    }
    share.add_root(virtual_name, real_path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dc_core::TigerTree;

    fn tree_with(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (rel, data) in files {
            let p = dir.path().join(rel);
            fs::create_dir_all(p.parent().unwrap()).unwrap();
            fs::write(p, data.as_bytes()).unwrap();
        }
        dir
    }

    #[test]
    fn walk_builds_virtual_paths() {
        let dir = tree_with(&[("a.txt", "a"), ("sub/b.txt", "bb"), (".hidden", "x")]);
        let found = walk("Docs", dir.path()).unwrap();
        let names: Vec<&str> = found.iter().map(|f| f.virtual_path.as_str()).collect();
        assert_eq!(names, vec!["Docs\\a.txt", "Docs\\sub\\b.txt"]);
        assert_eq!(found[1].size, 2);
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(walk("X", &dir.path().join("nope")).is_err());
    }

    #[test]
    fn apply_queues_new_files_and_drops_missing() {
        let dir = tree_with(&[("a.txt", "a"), ("b.txt", "b")]);
        let mut share = ShareIndex::new();
        let mut hashes = HashStore::new();
        ensure_root(&mut share, "Docs", dir.path()).unwrap();
        ensure_root(&mut share, "Docs", dir.path()).unwrap();

        let report = apply(&mut share, &mut hashes, "Docs", walk("Docs", dir.path()).unwrap());
        assert_eq!((report.added, report.queued), (2, 2));
        assert_eq!(hashes.progress().files_left, 2);

        fs::remove_file(dir.path().join("b.txt")).unwrap();
        let report = apply(&mut share, &mut hashes, "Docs", walk("Docs", dir.path()).unwrap());
        assert_eq!(report.removed, 1);
        assert_eq!(report.added, 0);
        assert!(share.resolve("Docs\\b.txt").is_none());
        assert_eq!(share.file_count(), 1);
    }

    #[test]
    fn cached_hash_is_attached_without_rehashing() {
        let dir = tree_with(&[("a.txt", "abc")]);
        let found = walk("Docs", dir.path()).unwrap();
        let mut hashes = HashStore::new();
        hashes.request_hash(&found[0].real_path, found[0].size, found[0].mtime);
        let job = hashes.next_job().unwrap();
        let tree = TigerTree::hash_bytes(b"abc", 64 * 1024);
        let root = tree.root;
        hashes.complete(&job, tree);

        let mut share = ShareIndex::new();
        ensure_root(&mut share, "Docs", dir.path()).unwrap();
        let report = apply(&mut share, &mut hashes, "Docs", found);
        assert_eq!(report.queued, 0);
        assert_eq!(report.cached.len(), 1);
        assert_eq!(share.resolve("Docs\\a.txt").unwrap().tth, Some(root));
        assert!(hashes.is_idle());
    }
}
