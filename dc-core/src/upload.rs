//! Upload slots: a fixed number of normal slots, extra mini slots for file lists and small
//! files, and a waiting line for everyone else.

use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Normal,
    Mini,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadDecision {
    Granted(SlotKind),
    /// 1-based place in line; the peer gets `$MaxedOut` and retries.
    Queued { position: usize },
}

#[derive(Debug, Clone)]
struct Waiter {
    nick: String,
    priority: u32,
    last_seen: u64,
}

pub struct UploadManager {
    max_slots: u32,
    mini_slots: u32,
    mini_slot_size: u64,
    timeout: u64,
    running: HashMap<String, SlotKind>,
    waiters: VecDeque<Waiter>,
}

impl UploadManager {
    pub fn new(max_slots: u32, mini_slots: u32, mini_slot_size: u64, timeout: u64) -> Self {
        Self {
            max_slots,
            mini_slots,
            mini_slot_size,
            timeout,
            running: HashMap::new(),
            waiters: VecDeque::new(),
        }
    }

    fn count(&self, kind: SlotKind) -> u32 {
        self.running.values().filter(|k| **k == kind).count() as u32
    }

    pub fn free_slots(&self) -> u32 {
        self.max_slots.saturating_sub(self.count(SlotKind::Normal))
    }

    pub fn total_slots(&self) -> u32 {
        self.max_slots
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }

    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }

    pub fn has_slot(&self, nick: &str) -> bool {
        self.running.contains_key(nick)
    }

    /// Ask for a slot to send `size` bytes (`is_list` for our file list). Higher
    /// `priority` waits ahead of lower; equal priorities are served in arrival order.
    pub fn request(&mut self, nick: &str, size: u64, is_list: bool, priority: u32, now: u64) -> UploadDecision {
        if let Some(kind) = self.running.get(nick) {
            return UploadDecision::Granted(*kind);
        }
        let line_pos = self
            .waiters
            .iter()
            .position(|w| w.nick == nick)
            .unwrap_or(self.waiters.len());
        if line_pos < self.free_slots() as usize {
            self.grant(nick, SlotKind::Normal);
            return UploadDecision::Granted(SlotKind::Normal);
        }
        let small = is_list || size <= self.mini_slot_size;
        if small && self.count(SlotKind::Mini) < self.mini_slots {
            self.grant(nick, SlotKind::Mini);
            return UploadDecision::Granted(SlotKind::Mini);
        }
        UploadDecision::Queued {
            position: self.enqueue(nick, priority, now),
        }
    }

    fn grant(&mut self, nick: &str, kind: SlotKind) {
        self.waiters.retain(|w| w.nick != nick);
        self.running.insert(nick.to_string(), kind);
    }

    fn enqueue(&mut self, nick: &str, priority: u32, now: u64) -> usize {
        if let Some(pos) = self.waiters.iter().position(|w| w.nick == nick) {
            self.waiters[pos].last_seen = now;
            return pos + 1;
        }
        let pos = self
            .waiters
            .iter()
            .position(|w| w.priority < priority)
            .unwrap_or(self.waiters.len());
        self.waiters.insert(
            pos,
            Waiter {
                nick: nick.to_string(),
                priority,
                last_seen: now,
            },
        );
        pos + 1
    }

    /// The transfer on `nick`'s slot ended.
    pub fn release(&mut self, nick: &str) -> Option<SlotKind> {
        self.running.remove(nick)
    }

    /// Forget waiters that stopped asking; returns their nicks.
    pub fn expire(&mut self, now: u64) -> Vec<String> {
        let timeout = self.timeout;
        let (stale, keep): (Vec<Waiter>, Vec<Waiter>) = self
            .waiters
            .drain(..)
            .partition(|w| now.saturating_sub(w.last_seen) >= timeout);
        self.waiters = keep.into();
        stale.into_iter().map(|w| w.nick).collect()
    }
}
