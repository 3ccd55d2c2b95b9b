//! Integrity: verify an assembled download against its Tiger tree and attribute bad
//! blocks to the sources that delivered them.

use std::collections::BTreeSet;
use std::io::{self, Read};

use crate::hash::HashRecord;
use crate::queue::QueueItem;
use crate::tth::{TigerTree, TthValue};

/// What the host needs to check one finished item.
#[derive(Debug, Clone)]
pub struct VerifyPlan {
    pub size: u64,
    pub root: TthValue,
    /// Leaves, when known; otherwise only the root is compared.
    pub tree: Option<HashRecord>,
    /// Block size of the item's bitmap.
    pub item_block_size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verification {
    /// Item blocks whose data does not match, ascending.
    pub bad_blocks: Vec<usize>,
}

impl Verification {
    pub fn is_ok(&self) -> bool {
        self.bad_blocks.is_empty()
    }
}

/// Item blocks overlapping bytes `[start, end)`.
fn item_blocks(start: u64, end: u64, block_size: u64, file_size: u64) -> std::ops::Range<usize> {
    let count = crate::tth::block_count(file_size, block_size) as usize;
    let first = (start / block_size) as usize;
    let last = (end.div_ceil(block_size) as usize).min(count);
    first..last.max(first + 1).min(count)
}

/// Hash everything `reader` yields and compare it with the plan.
pub fn verify_file<R: Read>(reader: R, plan: &VerifyPlan) -> io::Result<Verification> {
    let block_size = plan
        .tree
        .as_ref()
        .map(|t| t.block_size)
        .unwrap_or(plan.item_block_size);
    let Some(actual) = TigerTree::hash_reader(reader, block_size, |_| true)? else {
        return Err(io::Error::new(io::ErrorKind::Interrupted, "hashing cancelled"));
    };
    let all = || Verification {
        bad_blocks: (0..crate::tth::block_count(plan.size, plan.item_block_size) as usize).collect(),
    };
    if actual.file_size != plan.size {
        return Ok(all());
    }
    let Some(expected) = plan.tree.as_ref() else {
        return Ok(if actual.root == plan.root {
            Verification::default()
        } else {
            all()
        });
    };
    if actual.leaves.len() != expected.leaves.len() {
        return Ok(all());
    }
    let mut bad = BTreeSet::new();
    for (i, (a, e)) in actual.leaves.iter().zip(&expected.leaves).enumerate() {
        if a != e {
            let (start, end) = expected.block_range(i);
            bad.extend(item_blocks(start, end, plan.item_block_size, plan.size));
        }
    }
    Ok(Verification {
        bad_blocks: bad.into_iter().collect(),
    })
}

/// Clear `bad_blocks`, bump the taint of whoever delivered them, and return those nicks.
pub fn taint_sources(item: &mut QueueItem, bad_blocks: &[usize]) -> Vec<String> {
    let mut culprits = BTreeSet::new();
    for &block in bad_blocks {
        item.done.clear(block);
        if let Some(nick) = item.contributors.remove(&block) {
            culprits.insert(nick);
        }
    }
    for nick in &culprits {
        if let Some(source) = item.source_mut(nick) {
            source.taint += 1;
        }
    }
    culprits.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Priority, QueueManager, Segment, Source};
    use std::sync::Arc;

    const BLOCK: u64 = 64 * 1024;

    fn data(blocks: u64) -> Vec<u8> {
        (0..blocks * BLOCK).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn clean_file_verifies() {
        let d = data(3);
        let tree = TigerTree::hash_bytes(&d, BLOCK);
        let plan = VerifyPlan {
            size: d.len() as u64,
            root: tree.root,
            tree: Some(Arc::new(tree)),
            item_block_size: BLOCK,
        };
        assert!(verify_file(&d[..], &plan).unwrap().is_ok());
    }

    #[test]
    fn corrupt_block_is_located() {
        let d = data(3);
        let tree = TigerTree::hash_bytes(&d, BLOCK);
        let mut bad = d.clone();
        bad[(BLOCK + 5) as usize] ^= 0xff;
        let plan = VerifyPlan {
            size: d.len() as u64,
            root: tree.root,
            tree: Some(Arc::new(tree)),
            item_block_size: BLOCK,
        };
        assert_eq!(verify_file(&bad[..], &plan).unwrap().bad_blocks, vec![1]);
    }

    #[test]
    fn root_only_check_flags_everything() {
        let d = data(2);
        let root = TigerTree::hash_bytes(&d, BLOCK).root;
        let plan = VerifyPlan {
            size: d.len() as u64,
            root,
            tree: None,
            item_block_size: BLOCK,
        };
        assert!(verify_file(&d[..], &plan).unwrap().is_ok());
        let mut bad = d.clone();
        bad[0] ^= 1;
        assert_eq!(verify_file(&bad[..], &plan).unwrap().bad_blocks, vec![0, 1]);
    }

    #[test]
    fn short_file_fails_whole() {
        let d = data(2);
        let tree = TigerTree::hash_bytes(&d, BLOCK);
        let plan = VerifyPlan {
            size: d.len() as u64,
            root: tree.root,
            tree: Some(Arc::new(tree)),
            item_block_size: BLOCK,
        };
        let v = verify_file(&d[..BLOCK as usize], &plan).unwrap();
        assert_eq!(v.bad_blocks, vec![0, 1]);
    }

    #[test]
    fn taint_goes_to_contributor() {
        let mut q = QueueManager::new();
        let id = q.add("/dl/f".into(), 3 * BLOCK, None, Priority::Normal).unwrap();
        q.add_source(id, Source::new("a", "hub")).unwrap();
        q.add_source(id, Source::new("b", "hub")).unwrap();
        let item = q.get_mut(&id).unwrap();
        item.start_segment("a", Segment { first: 0, end: 2 });
        item.complete_segment("a");
        item.start_segment("b", Segment { first: 2, end: 3 });
        item.complete_segment("b");
        assert!(item.is_complete());
        let culprits = taint_sources(item, &[1]);
        assert_eq!(culprits, vec!["a".to_string()]);
        assert!(!item.done.get(1));
        assert!(item.done.get(0));
        assert_eq!(item.source("a").unwrap().taint, 1);
        assert_eq!(item.source("b").unwrap().taint, 0);
    }
}
