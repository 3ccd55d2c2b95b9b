//! Engine tunables. Times are in ticks (one tick per second of host time).

use serde::{Deserialize, Serialize};

/// Default number of normal upload slots.
pub const DEFAULT_MAX_SLOTS: u32 = 3;

/// Files at or below this size may use a mini-slot.
pub const MINI_SLOT_FILE_SIZE: u64 = 64 * 1024;

/// Default segment size in bytes; rounded to whole tree blocks.
pub const DEFAULT_SEGMENT_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub nick: String,
    pub description: String,
    pub email: String,
    /// Connection string advertised in `$MyINFO`.
    pub connection: String,
    /// Address peers use to reach us; `None` means passive.
    pub external_ip: Option<String>,
    pub tcp_port: u16,
    pub udp_port: u16,

    pub max_slots: u32,
    pub mini_slots: u32,
    pub mini_slot_size: u64,
    /// Waiters not served within this many ticks are dropped.
    pub upload_queue_timeout: u64,

    pub segment_size: u64,
    pub max_segments_per_item: u32,
    pub max_segments_per_peer: u32,
    pub max_source_failures: u32,
    /// Cooldown after `$MaxedOut`.
    pub source_cooldown: u64,
    pub segment_timeout: u64,
    pub connect_timeout: u64,
    /// A socket write that makes no progress for this long closes the connection.
    pub write_timeout: u64,

    pub handshake_timeout: u64,
    pub expect_timeout: u64,

    pub login_timeout: u64,
    pub idle_timeout: u64,
    pub keepalive_interval: u64,
    pub reconnect_base: u64,
    pub reconnect_max: u64,
    pub search_window: u64,
    pub active_result_cap: usize,
    pub passive_result_cap: usize,
    pub chat_history: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            nick: "dcpp-user".into(),
            description: String::new(),
            email: String::new(),
            connection: "LAN(T1)".into(),
            external_ip: None,
            tcp_port: 4120,
            udp_port: 4121,
            max_slots: DEFAULT_MAX_SLOTS,
            mini_slots: 3,
            mini_slot_size: MINI_SLOT_FILE_SIZE,
            upload_queue_timeout: 120,
            segment_size: DEFAULT_SEGMENT_SIZE,
            max_segments_per_item: 3,
            max_segments_per_peer: 1,
            max_source_failures: 3,
            source_cooldown: 60,
            segment_timeout: 60,
            connect_timeout: 60,
            write_timeout: 60,
            handshake_timeout: 30,
            expect_timeout: 60,
            login_timeout: 60,
            idle_timeout: 600,
            keepalive_interval: 120,
            reconnect_base: 5,
            reconnect_max: 300,
            search_window: 30,
            active_result_cap: 10,
            passive_result_cap: 5,
            chat_history: 500,
        }
    }
}

impl EngineConfig {
    pub fn is_active(&self) -> bool {
        self.external_ip.is_some()
    }

    /// `ip:port` for `$ConnectToMe`, when active.
    pub fn tcp_address(&self) -> Option<String> {
        self.external_ip
            .as_ref()
            .map(|ip| format!("{}:{}", ip, self.tcp_port))
    }

    pub fn udp_address(&self) -> Option<String> {
        self.external_ip
            .as_ref()
            .map(|ip| format!("{}:{}", ip, self.udp_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passive_without_external_ip() {
        let cfg = EngineConfig::default();
        assert!(!cfg.is_active());
        assert!(cfg.tcp_address().is_none());
    }

    #[test]
    fn active_addresses() {
        let cfg = EngineConfig {
            external_ip: Some("10.0.0.2".into()),
            ..Default::default()
        };
        assert_eq!(cfg.tcp_address().as_deref(), Some("10.0.0.2:4120"));
        assert_eq!(cfg.udp_address().as_deref(), Some("10.0.0.2:4121"));
    }

    #[test]
    fn partial_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str(r#"{"nick":"bob","unknown":1}"#).unwrap();
        assert_eq!(cfg.nick, "bob");
        assert_eq!(cfg.max_slots, DEFAULT_MAX_SLOTS);
    }
}
