//! Download queue: items, their sources, and a block bitmap per item.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hash::HashRecord;
use crate::tth::{self, TigerTree, TthValue};

pub type ItemId = Uuid;

/// Version written into `queue.json`.
pub const QUEUE_FORMAT_VERSION: u32 = 1;

/// Suffix of the in-progress file next to the target.
pub const TEMP_SUFFIX: &str = ".dctmp";

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Priority {
    Paused,
    Lowest,
    Low,
    #[default]
    Normal,
    High,
    Highest,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemStatus {
    #[default]
    Waiting,
    Running,
    Verifying,
    Stalled,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub nick: String,
    pub hub: String,
    /// Remote virtual path, used when the peer cannot address files by TTH.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub free_slots: u32,
    #[serde(default)]
    pub failed_attempts: u32,
    /// Verification failures attributed to this source.
    #[serde(default)]
    pub taint: u32,
    #[serde(skip)]
    pub cooldown_until: u64,
    #[serde(default)]
    pub order: u64,
}

impl Source {
    pub fn new(nick: &str, hub: &str) -> Self {
        Self {
            nick: nick.to_string(),
            hub: hub.to_string(),
            path: None,
            free_slots: 0,
            failed_attempts: 0,
            taint: 0,
            cooldown_until: 0,
            order: 0,
        }
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    pub fn with_free_slots(mut self, free: u32) -> Self {
        self.free_slots = free;
        self
    }
}

/// One bit per block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMap {
    len: usize,
    words: Vec<u64>,
}

impl SegmentMap {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            words: vec![0; len.div_ceil(64)],
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, i: usize) -> bool {
        i < self.len && self.words[i / 64] & (1 << (i % 64)) != 0
    }

    pub fn set(&mut self, i: usize) {
        if i < self.len {
            self.words[i / 64] |= 1 << (i % 64);
        }
    }

    pub fn clear(&mut self, i: usize) {
        if i < self.len {
            self.words[i / 64] &= !(1 << (i % 64));
        }
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.len
    }
}

/// Blocks `[first, end)` of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub first: usize,
    pub end: usize,
}

impl Segment {
    pub fn contains(&self, block: usize) -> bool {
        block >= self.first && block < self.end
    }

    /// `(start, len)` in bytes.
    pub fn byte_range(&self, block_size: u64, file_size: u64) -> (u64, u64) {
        let start = self.first as u64 * block_size;
        let end = (self.end as u64 * block_size).min(file_size);
        (start, end - start)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: ItemId,
    pub target: PathBuf,
    pub size: u64,
    #[serde(default)]
    pub tth: Option<TthValue>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub sources: Vec<Source>,
    pub block_size: u64,
    pub done: SegmentMap,
    /// Block -> nick that delivered it.
    #[serde(default)]
    pub contributors: BTreeMap<usize, String>,
    #[serde(default)]
    pub status: ItemStatus,
    #[serde(default)]
    pub added: u64,
    /// Nick -> segment being fetched from it.
    #[serde(skip)]
    pub running: HashMap<String, Segment>,
    #[serde(skip)]
    pub tree: Option<HashRecord>,
    /// Nick currently fetching the tree.
    #[serde(skip)]
    pub tree_pending: Option<String>,
    #[serde(skip)]
    pub last_source: Option<String>,
}

impl QueueItem {
    fn new(id: ItemId, target: PathBuf, size: u64, tth: Option<TthValue>, priority: Priority, added: u64) -> Self {
        let block_size = tth::block_size_for(size);
        let blocks = tth::block_count(size, block_size) as usize;
        let mut item = Self {
            id,
            target,
            size,
            tth,
            priority,
            sources: Vec::new(),
            block_size,
            done: SegmentMap::new(blocks),
            contributors: BTreeMap::new(),
            status: ItemStatus::Waiting,
            added,
            running: HashMap::new(),
            tree: None,
            tree_pending: None,
            last_source: None,
        };
        item.trivial_tree();
        item
    }

    /// Single-block files: the root is the only leaf.
    fn trivial_tree(&mut self) {
        if let Some(root) = self.tth {
            if self.block_count() == 1 {
                if let Ok(tree) = TigerTree::from_leaves(self.size, self.block_size, vec![root]) {
                    self.tree = Some(Arc::new(tree));
                }
            }
        }
    }

    pub fn block_count(&self) -> usize {
        self.done.len()
    }

    pub fn temp_path(&self) -> PathBuf {
        let mut name = self
            .target
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(TEMP_SUFFIX);
        self.target.with_file_name(name)
    }

    pub fn is_complete(&self) -> bool {
        self.done.is_complete()
    }

    pub fn downloaded_bytes(&self) -> u64 {
        (0..self.block_count())
            .filter(|&i| self.done.get(i))
            .map(|i| Segment { first: i, end: i + 1 }.byte_range(self.block_size, self.size).1)
            .sum()
    }

    pub fn is_block_running(&self, block: usize) -> bool {
        self.running.values().any(|s| s.contains(block))
    }

    /// Needs leaves from a peer before it can be verified block by block.
    pub fn needs_tree(&self) -> bool {
        self.tth.is_some() && self.tree.is_none()
    }

    pub fn source(&self, nick: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.nick == nick)
    }

    pub fn source_mut(&mut self, nick: &str) -> Option<&mut Source> {
        self.sources.iter_mut().find(|s| s.nick == nick)
    }

    /// Adopt a tree whose root matches. The block size follows the tree when nothing is
    /// downloaded yet.
    pub fn attach_tree(&mut self, tree: HashRecord) -> bool {
        if self.tth != Some(tree.root) || tree.file_size != self.size {
            return false;
        }
        if tree.block_size != self.block_size && self.done.count() == 0 && self.running.is_empty() {
            self.block_size = tree.block_size;
            self.done = SegmentMap::new(tree.block_count());
            self.contributors.clear();
        }
        self.tree = Some(tree);
        true
    }

    pub fn start_segment(&mut self, nick: &str, segment: Segment) {
        self.running.insert(nick.to_string(), segment);
        self.status = ItemStatus::Running;
    }

    /// Abort what `nick` was fetching. Completed bits are untouched.
    pub fn release(&mut self, nick: &str) -> Option<Segment> {
        if self.tree_pending.as_deref() == Some(nick) {
            self.tree_pending = None;
        }
        let seg = self.running.remove(nick);
        if self.running.is_empty() && self.status == ItemStatus::Running {
            self.status = ItemStatus::Waiting;
        }
        seg
    }

    /// Mark `nick`'s running segment complete.
    pub fn complete_segment(&mut self, nick: &str) -> Option<Segment> {
        let seg = self.running.remove(nick)?;
        for block in seg.first..seg.end {
            self.done.set(block);
            self.contributors.insert(block, nick.to_string());
        }
        self.last_source = Some(nick.to_string());
        if self.running.is_empty() && self.status == ItemStatus::Running {
            self.status = ItemStatus::Waiting;
        }
        Some(seg)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("unknown queue item {0}")]
    UnknownItem(ItemId),
    #[error("{0} is already queued")]
    AlreadyQueued(PathBuf),
    #[error("zero-byte files are not queued")]
    ZeroSize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct QueueSnapshot {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub items: Vec<QueueItem>,
}

#[derive(Default)]
pub struct QueueManager {
    items: HashMap<ItemId, QueueItem>,
    next_order: u64,
    dirty: bool,
}

impl QueueManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        target: PathBuf,
        size: u64,
        tth: Option<TthValue>,
        priority: Priority,
    ) -> Result<ItemId, QueueError> {
        if size == 0 {
            return Err(QueueError::ZeroSize);
        }
        if self.items.values().any(|i| i.target == target) {
            return Err(QueueError::AlreadyQueued(target));
        }
        let id = Uuid::new_v4();
        let order = self.bump();
        self.items
            .insert(id, QueueItem::new(id, target, size, tth, priority, order));
        self.dirty = true;
        Ok(id)
    }

    fn bump(&mut self) -> u64 {
        let n = self.next_order;
        self.next_order += 1;
        n
    }

    /// Add or refresh a source. Returns true if it is new to the item.
    pub fn add_source(&mut self, id: ItemId, mut source: Source) -> Result<bool, QueueError> {
        let order = self.bump();
        let item = self.items.get_mut(&id).ok_or(QueueError::UnknownItem(id))?;
        self.dirty = true;
        if let Some(existing) = item.source_mut(&source.nick) {
            existing.hub = source.hub;
            existing.free_slots = source.free_slots;
            if source.path.is_some() {
                existing.path = source.path;
            }
            return Ok(false);
        }
        source.order = order;
        item.sources.push(source);
        Ok(true)
    }

    pub fn remove_source(&mut self, id: ItemId, nick: &str) -> Result<bool, QueueError> {
        let item = self.items.get_mut(&id).ok_or(QueueError::UnknownItem(id))?;
        let before = item.sources.len();
        item.sources.retain(|s| s.nick != nick);
        item.release(nick);
        self.dirty = true;
        Ok(item.sources.len() != before)
    }

    pub fn remove(&mut self, id: ItemId) -> Result<QueueItem, QueueError> {
        let item = self.items.remove(&id).ok_or(QueueError::UnknownItem(id))?;
        self.dirty = true;
        Ok(item)
    }

    pub fn set_priority(&mut self, id: ItemId, priority: Priority) -> Result<(), QueueError> {
        let item = self.items.get_mut(&id).ok_or(QueueError::UnknownItem(id))?;
        item.priority = priority;
        self.dirty = true;
        Ok(())
    }

    pub fn get(&self, id: &ItemId) -> Option<&QueueItem> {
        self.items.get(id)
    }

    /// Mutable access marks the queue dirty.
    pub fn get_mut(&mut self, id: &ItemId) -> Option<&mut QueueItem> {
        let item = self.items.get_mut(id)?;
        self.dirty = true;
        Some(item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> impl Iterator<Item = &QueueItem> {
        self.items.values()
    }

    /// Ids by priority (highest first), then insertion order.
    pub fn ordered_ids(&self) -> Vec<ItemId> {
        let mut v: Vec<&QueueItem> = self.items.values().collect();
        v.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.added.cmp(&b.added)));
        v.into_iter().map(|i| i.id).collect()
    }

    pub fn find_by_target(&self, target: &Path) -> Option<&QueueItem> {
        self.items.values().find(|i| i.target == target)
    }

    /// Items listing `nick` as a source.
    pub fn items_with_source(&self, nick: &str) -> Vec<ItemId> {
        self.items
            .values()
            .filter(|i| i.source(nick).is_some())
            .map(|i| i.id)
            .collect()
    }

    /// Returns whether anything changed since the last call.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let mut items: Vec<QueueItem> = self.items.values().cloned().collect();
        items.sort_by_key(|i| i.added);
        QueueSnapshot {
            version: QUEUE_FORMAT_VERSION,
            items,
        }
    }

    pub fn restore(snapshot: QueueSnapshot) -> Self {
        let mut q = Self::new();
        for mut item in snapshot.items {
            let blocks = tth::block_count(item.size, item.block_size) as usize;
            if item.done.len() != blocks {
                item.done = SegmentMap::new(blocks);
                item.contributors.clear();
            }
            if matches!(item.status, ItemStatus::Running | ItemStatus::Verifying) {
                item.status = ItemStatus::Waiting;
            }
            item.trivial_tree();
            q.next_order = q.next_order.max(item.added + 1);
            for s in &item.sources {
                q.next_order = q.next_order.max(s.order + 1);
            }
            q.items.insert(item.id, item);
        }
        q
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tth::leaf_hash;

    const BLOCK: u64 = 64 * 1024;

    #[test]
    fn segment_map_bits() {
        let mut m = SegmentMap::new(70);
        assert!(!m.get(65));
        m.set(65);
        m.set(0);
        assert!(m.get(65));
        assert_eq!(m.count(), 2);
        m.clear(65);
        assert_eq!(m.count(), 1);
        m.set(500);
        assert_eq!(m.count(), 1);
        for i in 0..70 {
            m.set(i);
        }
        assert!(m.is_complete());
    }

    #[test]
    fn temp_path_sits_next_to_target() {
        let mut q = QueueManager::new();
        let id = q.add("/dl/movie.mkv".into(), 10, None, Priority::Normal).unwrap();
        assert_eq!(q.get(&id).unwrap().temp_path(), PathBuf::from("/dl/movie.mkv.dctmp"));
    }

    #[test]
    fn add_rejects_duplicates_and_empty() {
        let mut q = QueueManager::new();
        q.add("/dl/a".into(), 10, None, Priority::Normal).unwrap();
        assert_eq!(
            q.add("/dl/a".into(), 10, None, Priority::Normal).unwrap_err(),
            QueueError::AlreadyQueued("/dl/a".into())
        );
        assert_eq!(
            q.add("/dl/b".into(), 0, None, Priority::Normal).unwrap_err(),
            QueueError::ZeroSize
        );
    }

    #[test]
    fn sources_keep_insertion_order_and_refresh() {
        let mut q = QueueManager::new();
        let id = q.add("/dl/a".into(), 10, None, Priority::Normal).unwrap();
        assert!(q.add_source(id, Source::new("a", "h")).unwrap());
        assert!(q.add_source(id, Source::new("b", "h")).unwrap());
        assert!(!q.add_source(id, Source::new("a", "h2").with_free_slots(4)).unwrap());
        let item = q.get(&id).unwrap();
        assert!(item.sources[0].order < item.sources[1].order);
        assert_eq!(item.sources[0].hub, "h2");
        assert_eq!(item.sources[0].free_slots, 4);
        assert!(q.remove_source(id, "a").unwrap());
        assert_eq!(q.get(&id).unwrap().sources.len(), 1);
    }

    #[test]
    fn complete_and_release_segments() {
        let mut q = QueueManager::new();
        let id = q.add("/dl/a".into(), 3 * BLOCK, None, Priority::Normal).unwrap();
        let item = q.get_mut(&id).unwrap();
        item.start_segment("a", Segment { first: 0, end: 1 });
        item.start_segment("b", Segment { first: 1, end: 3 });
        assert_eq!(item.status, ItemStatus::Running);
        item.complete_segment("a");
        let aborted = item.release("b").unwrap();
        assert_eq!(aborted, Segment { first: 1, end: 3 });
        assert!(item.done.get(0));
        assert!(!item.done.get(1));
        assert_eq!(item.contributors.get(&0).map(String::as_str), Some("a"));
        assert_eq!(item.status, ItemStatus::Waiting);
        assert_eq!(item.downloaded_bytes(), BLOCK);
    }

    #[test]
    fn byte_ranges_clip_at_file_end() {
        let seg = Segment { first: 1, end: 3 };
        assert_eq!(seg.byte_range(BLOCK, 2 * BLOCK + 10), (BLOCK, BLOCK + 10));
    }

    #[test]
    fn single_block_item_has_tree() {
        let mut q = QueueManager::new();
        let root = leaf_hash(b"tiny");
        let id = q.add("/dl/t".into(), 4, Some(root), Priority::Normal).unwrap();
        assert!(!q.get(&id).unwrap().needs_tree());
    }

    #[test]
    fn attach_tree_checks_root() {
        let data = vec![7u8; (2 * BLOCK) as usize];
        let tree = TigerTree::hash_bytes(&data, BLOCK);
        let mut q = QueueManager::new();
        let id = q.add("/dl/x".into(), 2 * BLOCK, Some(tree.root), Priority::Normal).unwrap();
        let item = q.get_mut(&id).unwrap();
        assert!(item.needs_tree());
        let wrong = TigerTree::hash_bytes(&vec![8u8; (2 * BLOCK) as usize], BLOCK);
        assert!(!item.attach_tree(Arc::new(wrong)));
        assert!(item.attach_tree(Arc::new(tree)));
        assert!(!item.needs_tree());
    }

    #[test]
    fn ordered_by_priority_then_age() {
        let mut q = QueueManager::new();
        let a = q.add("/a".into(), 1, None, Priority::Normal).unwrap();
        let b = q.add("/b".into(), 1, None, Priority::High).unwrap();
        let c = q.add("/c".into(), 1, None, Priority::Normal).unwrap();
        assert_eq!(q.ordered_ids(), vec![b, a, c]);
    }

    #[test]
    fn snapshot_restore_keeps_progress_and_tolerates_unknown_fields() {
        let mut q = QueueManager::new();
        let id = q.add("/dl/a".into(), 3 * BLOCK, None, Priority::High).unwrap();
        q.add_source(id, Source::new("a", "h")).unwrap();
        let item = q.get_mut(&id).unwrap();
        item.start_segment("a", Segment { first: 0, end: 2 });
        item.complete_segment("a");
        item.start_segment("a", Segment { first: 2, end: 3 });

        let mut json: serde_json::Value = serde_json::to_value(q.snapshot()).unwrap();
        json["future_field"] = serde_json::json!(true);
        json["items"][0]["another"] = serde_json::json!({"x": 1});
        let back = QueueManager::restore(serde_json::from_value(json).unwrap());
        let item = back.get(&id).unwrap();
        assert_eq!(item.done.count(), 2);
        assert!(item.running.is_empty());
        assert_eq!(item.status, ItemStatus::Waiting);
        assert_eq!(item.priority, Priority::High);
        assert_eq!(item.sources[0].nick, "a");
    }

    #[test]
    fn dirty_flag() {
        let mut q = QueueManager::new();
        assert!(!q.take_dirty());
        q.add("/a".into(), 1, None, Priority::Normal).unwrap();
        assert!(q.take_dirty());
        assert!(!q.take_dirty());
    }
}
