//! Direct Connect (NMDC) protocol engine.
//! Host-driven: no I/O; host passes frames, byte counts and ticks and performs the actions returned.

pub mod config;
pub mod connection;
pub mod events;
pub mod filelist;
pub mod hash;
pub mod hub;
pub mod nmdc;
pub mod peer;
pub mod search;
pub mod share;
pub mod tth;
pub mod wire;

pub mod core;
pub mod integrity;
pub mod queue;
pub mod scheduler;
pub mod upload;

pub use crate::core::{Sink, TransferAction, TransferCore};
pub use config::EngineConfig;
pub use connection::{ConnId, ConnectError, PeerRegistry, Role};
pub use events::{DownloadEvent, EngineEvent, EventCategory, HashEvent, HubEvent, QueueEvent};
pub use hash::{HashRecord, HashStore};
pub use hub::{HubAction, HubSession, HubSettings, SessionState};
pub use peer::{HandshakeError, HandshakeState, Negotiated, PeerHandshake};
pub use queue::{ItemId, Priority, QueueManager, QueueSnapshot, Source};
pub use search::SearchQuery;
pub use share::ShareIndex;
pub use tth::{TigerTree, TthValue};
pub use wire::{encode_frame, Encoding, FrameBuffer, FrameDecodeError};
