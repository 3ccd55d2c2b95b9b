//! Direct Connect engine daemon: drives `dc-core` over tokio sockets, hashes and scans
//! shares on the blocking pool, and keeps the queue and indexes on disk.

pub mod config;
pub mod engine;
pub mod events;
pub mod hashing;
pub mod persist;
pub mod share_scan;

mod hub_conn;
mod transport;

pub use config::Config;
pub use engine::{Engine, EngineError, ServerManager};
pub use events::EventBus;
