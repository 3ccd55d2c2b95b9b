//! Per-category event fan-out. Subscribers only see the category they asked for.

use std::sync::atomic::{AtomicBool, Ordering};

use dc_core::{DownloadEvent, EngineEvent, HashEvent, HubEvent, QueueEvent};
use tokio::sync::broadcast;

const CAPACITY: usize = 256;

pub struct EventBus {
    downloads: broadcast::Sender<DownloadEvent>,
    queue: broadcast::Sender<QueueEvent>,
    hash: broadcast::Sender<HashEvent>,
    hubs: broadcast::Sender<HubEvent>,
    timer: broadcast::Sender<u64>,
    closed: AtomicBool,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            downloads: broadcast::channel(CAPACITY).0,
            queue: broadcast::channel(CAPACITY).0,
            hash: broadcast::channel(CAPACITY).0,
            hubs: broadcast::channel(CAPACITY).0,
            timer: broadcast::channel(CAPACITY).0,
            closed: AtomicBool::new(false),
        }
    }

    pub fn subscribe_downloads(&self) -> broadcast::Receiver<DownloadEvent> {
        self.downloads.subscribe()
    }

    pub fn subscribe_queue(&self) -> broadcast::Receiver<QueueEvent> {
        self.queue.subscribe()
    }

    pub fn subscribe_hash(&self) -> broadcast::Receiver<HashEvent> {
        self.hash.subscribe()
    }

    pub fn subscribe_hubs(&self) -> broadcast::Receiver<HubEvent> {
        self.hubs.subscribe()
    }

    /// Tick count, once per second.
    pub fn subscribe_timer(&self) -> broadcast::Receiver<u64> {
        self.timer.subscribe()
    }

    /// Deliver to the event's category. Nothing is delivered after [`close`](Self::close).
    pub fn publish(&self, event: impl Into<EngineEvent>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        // send only fails when nobody listens.
        match event.into() {
            EngineEvent::Download(e) => {
                let _ = self.downloads.send(e);
            }
            EngineEvent::Queue(e) => {
                let _ = self.queue.send(e);
            }
            EngineEvent::Hash(e) => {
                let _ = self.hash.send(e);
            }
            EngineEvent::Hub(e) => {
                let _ = self.hubs.send(e);
            }
            EngineEvent::Timer(n) => {
                let _ = self.timer.send(n);
            }
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dc_core::events::FailureReason;
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn events_reach_only_their_category() {
        let bus = EventBus::new();
        let mut downloads = bus.subscribe_downloads();
        let mut hash = bus.subscribe_hash();
        bus.publish(HashEvent::Progress {
            files_left: 2,
            bytes_left: 10,
        });
        assert_eq!(
            hash.try_recv().unwrap(),
            HashEvent::Progress {
                files_left: 2,
                bytes_left: 10
            }
        );
        assert!(matches!(downloads.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn closed_bus_is_silent() {
        let bus = EventBus::new();
        let mut downloads = bus.subscribe_downloads();
        let mut timer = bus.subscribe_timer();
        bus.publish(EngineEvent::Timer(1));
        bus.close();
        bus.publish(EngineEvent::Timer(2));
        bus.publish(DownloadEvent::Failed {
            item: dc_core::ItemId::nil(),
            nick: "a".into(),
            reason: FailureReason::Timeout,
        });
        assert_eq!(timer.try_recv().unwrap(), 1);
        assert!(matches!(timer.try_recv(), Err(TryRecvError::Empty)));
        assert!(matches!(downloads.try_recv(), Err(TryRecvError::Empty)));
        assert!(bus.is_closed());
    }
}
