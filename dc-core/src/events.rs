//! Engine events. Each carries the key (item id, nick, hub address) a consumer needs.

use std::path::PathBuf;

use crate::hub::SessionState;
use crate::nmdc::SearchResult;
use crate::queue::{ItemId, Priority};
use crate::tth::TthValue;

/// Subscription categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    Downloads,
    Queue,
    Hash,
    Hubs,
    Timer,
}

/// Why a download attempt ended early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Connect or handshake did not reach Ready.
    ConnectionFailed,
    /// Peer answered `$MaxedOut`.
    NoSlots,
    FileNotAvailable,
    Disconnected,
    Timeout,
    Protocol(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    Started {
        item: ItemId,
        nick: String,
        start: u64,
        len: u64,
    },
    Failed {
        item: ItemId,
        nick: String,
        reason: FailureReason,
    },
    Finished {
        item: ItemId,
        nick: String,
        target: PathBuf,
    },
    /// Verification found bad blocks; they were cleared and will be fetched again.
    Corrupted {
        item: ItemId,
        blocks: Vec<usize>,
        sources: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Added {
        item: ItemId,
        target: PathBuf,
    },
    Removed {
        item: ItemId,
    },
    SourceAdded {
        item: ItemId,
        nick: String,
    },
    SourceRemoved {
        item: ItemId,
        nick: String,
    },
    PriorityChanged {
        item: ItemId,
        priority: Priority,
    },
    Stalled {
        item: ItemId,
    },
    Resumed {
        item: ItemId,
    },
    ItemFinished {
        item: ItemId,
        target: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashEvent {
    Hashed {
        path: PathBuf,
        root: TthValue,
    },
    LoadedFromCache {
        path: PathBuf,
        root: TthValue,
    },
    Progress {
        files_left: usize,
        bytes_left: u64,
    },
    Failed {
        path: PathBuf,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    StateChanged {
        hub: String,
        state: SessionState,
    },
    Message {
        hub: String,
        from: Option<String>,
        text: String,
        private: bool,
    },
    HubName {
        hub: String,
        name: String,
    },
    UserUpdated {
        hub: String,
        nick: String,
    },
    UserQuit {
        hub: String,
        nick: String,
    },
    SearchResult {
        hub: String,
        result: SearchResult,
    },
    LoginFailed {
        hub: String,
        reason: String,
    },
    Disconnected {
        hub: String,
        reason: String,
        retry_in: Option<u64>,
    },
    Redirect {
        hub: String,
        address: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Download(DownloadEvent),
    Queue(QueueEvent),
    Hash(HashEvent),
    Hub(HubEvent),
    /// Once per second, with the engine tick count.
    Timer(u64),
}

impl EngineEvent {
    pub fn category(&self) -> EventCategory {
        match self {
            EngineEvent::Download(_) => EventCategory::Downloads,
            EngineEvent::Queue(_) => EventCategory::Queue,
            EngineEvent::Hash(_) => EventCategory::Hash,
            EngineEvent::Hub(_) => EventCategory::Hubs,
            EngineEvent::Timer(_) => EventCategory::Timer,
        }
    }
}

impl From<DownloadEvent> for EngineEvent {
    fn from(e: DownloadEvent) -> Self {
        EngineEvent::Download(e)
    }
}

impl From<QueueEvent> for EngineEvent {
    fn from(e: QueueEvent) -> Self {
        EngineEvent::Queue(e)
    }
}

impl From<HashEvent> for EngineEvent {
    fn from(e: HashEvent) -> Self {
        EngineEvent::Hash(e)
    }
}

impl From<HubEvent> for EngineEvent {
    fn from(e: HubEvent) -> Self {
        EngineEvent::Hub(e)
    }
}
