//! Segment scheduler: which item a connected source works on next, which blocks it
//! fetches, and which sources are worth connecting to.

use std::cmp::Reverse;

use crate::peer::Features;
use crate::queue::{ItemId, ItemStatus, Priority, QueueItem, QueueManager, Segment, Source};

/// Limits taken from the engine configuration.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub segment_size: u64,
    pub max_segments_per_item: usize,
    pub max_segments_per_peer: usize,
    pub max_source_failures: u32,
}

/// Work handed to a download connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Work {
    /// Fetch the leaf hashes first.
    Tree,
    Segment(Segment),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub item: ItemId,
    pub work: Work,
}

/// Not cooling down and below the failure limit.
pub fn is_usable(source: &Source, now: u64, max_failures: u32) -> bool {
    source.failed_attempts < max_failures && source.cooldown_until <= now
}

/// Usable sources, best first: most free slots, fewest failures plus taint, oldest.
pub fn rank_sources(item: &QueueItem, now: u64, max_failures: u32) -> Vec<&Source> {
    let mut v: Vec<&Source> = item
        .sources
        .iter()
        .filter(|s| is_usable(s, now, max_failures))
        .collect();
    v.sort_by_key(|s| (Reverse(s.free_slots), s.failed_attempts + s.taint, s.order));
    v
}

/// Every source is at the failure limit (or there are none).
pub fn is_stalled(item: &QueueItem, max_failures: u32) -> bool {
    item.sources.iter().all(|s| s.failed_attempts >= max_failures)
}

/// First run of blocks neither done nor running, at most `segment_size` bytes (one block
/// minimum).
pub fn next_segment(item: &QueueItem, segment_size: u64) -> Option<Segment> {
    let max_blocks = (segment_size / item.block_size.max(1)).max(1) as usize;
    let free = |b: usize| !item.done.get(b) && !item.is_block_running(b);
    let first = (0..item.block_count()).find(|&b| free(b))?;
    let mut end = first + 1;
    while end < item.block_count() && end - first < max_blocks && free(end) {
        end += 1;
    }
    Some(Segment { first, end })
}

/// The source can be asked for this item over a connection with `features`.
pub fn can_request(item: &QueueItem, source: &Source, features: &Features) -> bool {
    source.path.is_some() || (item.tth.is_some() && features.tthf)
}

fn wants_work(item: &QueueItem) -> bool {
    item.priority != Priority::Paused
        && matches!(item.status, ItemStatus::Waiting | ItemStatus::Running)
        && !item.is_complete()
}

/// Running segments for `nick` across the whole queue.
pub fn segments_for_peer(queue: &QueueManager, nick: &str) -> usize {
    queue
        .items()
        .filter(|i| i.running.contains_key(nick) || i.tree_pending.as_deref() == Some(nick))
        .count()
}

/// Pick work for a download connection to `nick`: highest priority first, then oldest.
pub fn assign(
    queue: &QueueManager,
    nick: &str,
    features: &Features,
    limits: &Limits,
    now: u64,
) -> Option<Assignment> {
    if segments_for_peer(queue, nick) >= limits.max_segments_per_peer {
        return None;
    }
    for id in queue.ordered_ids() {
        let Some(item) = queue.get(&id) else { continue };
        if !wants_work(item) {
            continue;
        }
        let Some(source) = item.source(nick) else {
            continue;
        };
        if !is_usable(source, now, limits.max_source_failures) {
            continue;
        }
        if item.needs_tree() && features.tthl {
            if item.tree_pending.is_none() {
                return Some(Assignment {
                    item: id,
                    work: Work::Tree,
                });
            }
            // Someone else is fetching the leaves; wait for them.
            continue;
        }
        if !can_request(item, source, features) {
            continue;
        }
        if item.running.len() >= limits.max_segments_per_item {
            continue;
        }
        if let Some(seg) = next_segment(item, limits.segment_size) {
            return Some(Assignment {
                item: id,
                work: Work::Segment(seg),
            });
        }
    }
    None
}

/// Items that could use another connection, each with the best source to dial.
/// `busy` tells whether a nick already has a download connection or a dial in flight.
pub fn sources_to_connect(
    queue: &QueueManager,
    limits: &Limits,
    now: u64,
    busy: impl Fn(&str) -> bool,
) -> Vec<(ItemId, Source)> {
    let mut out: Vec<(ItemId, Source)> = Vec::new();
    for id in queue.ordered_ids() {
        let Some(item) = queue.get(&id) else { continue };
        if !wants_work(item) || item.running.len() >= limits.max_segments_per_item {
            continue;
        }
        if !item.needs_tree() && next_segment(item, limits.segment_size).is_none() {
            continue;
        }
        let pick = rank_sources(item, now, limits.max_source_failures)
            .into_iter()
            .find(|s| !busy(&s.nick) && !out.iter().any(|(_, o)| o.nick == s.nick));
        if let Some(source) = pick {
            out.push((id, source.clone()));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const BLOCK: u64 = 64 * 1024;

    fn limits() -> Limits {
        Limits {
            segment_size: BLOCK,
            max_segments_per_item: 3,
            max_segments_per_peer: 1,
            max_source_failures: 3,
        }
    }

    fn queue_with(blocks: u64, sources: &[&str]) -> (QueueManager, ItemId) {
        let mut q = QueueManager::new();
        let id = q
            .add(PathBuf::from("/dl/f"), blocks * BLOCK, None, Priority::Normal)
            .unwrap();
        for s in sources {
            q.add_source(id, Source::new(s, "hub").with_path("dir\\f")).unwrap();
        }
        (q, id)
    }

    #[test]
    fn ranking_prefers_free_slots_then_reliability() {
        let (mut q, id) = queue_with(1, &["a", "b", "c", "d"]);
        let item = q.get_mut(&id).unwrap();
        item.source_mut("b").unwrap().free_slots = 2;
        item.source_mut("c").unwrap().free_slots = 2;
        item.source_mut("c").unwrap().failed_attempts = 1;
        item.source_mut("d").unwrap().cooldown_until = 50;
        let ranked: Vec<&str> = rank_sources(item, 10, 3).iter().map(|s| s.nick.as_str()).collect();
        assert_eq!(ranked, vec!["b", "c", "a"]);
        let later: Vec<&str> = rank_sources(item, 50, 3).iter().map(|s| s.nick.as_str()).collect();
        assert_eq!(later, vec!["b", "c", "a", "d"]);
    }

    #[test]
    fn next_segment_skips_done_and_running() {
        let (mut q, id) = queue_with(6, &["a"]);
        let item = q.get_mut(&id).unwrap();
        item.start_segment("x", Segment { first: 0, end: 1 });
        item.complete_segment("x");
        item.start_segment("y", Segment { first: 1, end: 2 });
        assert_eq!(next_segment(item, 3 * BLOCK), Some(Segment { first: 2, end: 5 }));
        item.start_segment("z", Segment { first: 3, end: 4 });
        assert_eq!(next_segment(item, 3 * BLOCK), Some(Segment { first: 2, end: 3 }));
        // Below one block still yields one block.
        assert_eq!(next_segment(item, 10), Some(Segment { first: 2, end: 3 }));
    }

    #[test]
    fn assign_respects_per_peer_and_priority() {
        let (mut q, low) = queue_with(2, &["a"]);
        q.set_priority(low, Priority::Low).unwrap();
        let high = q.add("/dl/g".into(), 2 * BLOCK, None, Priority::High).unwrap();
        q.add_source(high, Source::new("a", "hub").with_path("g")).unwrap();
        let f = Features::default();
        let first = assign(&q, "a", &f, &limits(), 0).unwrap();
        assert_eq!(first.item, high);
        assert_eq!(first.work, Work::Segment(Segment { first: 0, end: 1 }));
        q.get_mut(&high).unwrap().start_segment("a", Segment { first: 0, end: 1 });
        assert_eq!(assign(&q, "a", &f, &limits(), 0), None);
    }

    #[test]
    fn assign_fetches_tree_once() {
        let mut q = QueueManager::new();
        let root = crate::tth::leaf_hash(b"x");
        let id = q.add("/dl/t".into(), 4 * BLOCK, Some(root), Priority::Normal).unwrap();
        q.add_source(id, Source::new("a", "hub")).unwrap();
        q.add_source(id, Source::new("b", "hub")).unwrap();
        let f = Features {
            adcget: true,
            tthl: true,
            tthf: true,
            ..Features::default()
        };
        assert_eq!(assign(&q, "a", &f, &limits(), 0).unwrap().work, Work::Tree);
        q.get_mut(&id).unwrap().tree_pending = Some("a".into());
        assert_eq!(assign(&q, "b", &f, &limits(), 0), None);
        // Without TTHL the segments are fetched unverified until the end.
        let plain = Features {
            adcget: true,
            tthf: true,
            ..Features::default()
        };
        assert!(matches!(
            assign(&q, "b", &plain, &limits(), 0).unwrap().work,
            Work::Segment(_)
        ));
    }

    #[test]
    fn paused_and_failed_sources_get_nothing() {
        let (mut q, id) = queue_with(2, &["a", "b"]);
        q.get_mut(&id).unwrap().source_mut("b").unwrap().failed_attempts = 3;
        assert!(assign(&q, "b", &Features::default(), &limits(), 0).is_none());
        q.set_priority(id, Priority::Paused).unwrap();
        assert!(assign(&q, "a", &Features::default(), &limits(), 0).is_none());
    }

    #[test]
    fn stalled_when_every_source_failed() {
        let (mut q, id) = queue_with(1, &["a", "b"]);
        let item = q.get_mut(&id).unwrap();
        assert!(!is_stalled(item, 3));
        item.source_mut("a").unwrap().failed_attempts = 3;
        assert!(!is_stalled(item, 3));
        item.source_mut("b").unwrap().failed_attempts = 3;
        assert!(is_stalled(item, 3));
    }

    #[test]
    fn connect_candidates_skip_busy_nicks() {
        let (mut q, id) = queue_with(3, &["a", "b"]);
        let other = q.add("/dl/o".into(), BLOCK, None, Priority::Normal).unwrap();
        q.add_source(other, Source::new("a", "hub").with_path("o")).unwrap();
        let picks = sources_to_connect(&q, &limits(), 0, |n| n == "a");
        assert_eq!(picks.len(), 1);
        assert_eq!(picks[0].0, id);
        assert_eq!(picks[0].1.nick, "b");
        let picks = sources_to_connect(&q, &limits(), 0, |_| false);
        // One dial per nick even when it serves several items.
        assert_eq!(picks.len(), 1);
        assert_eq!(picks[0].1.nick, "a");
    }
}
