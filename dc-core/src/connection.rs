//! Peer connection registry: one live socket per (nick, direction), expected incoming
//! connections, and active/passive arbitration.

use std::collections::HashMap;

use crate::nmdc::{Direction, UserMode};

/// Host-assigned connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Which side dialed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Incoming,
    Outgoing,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("both sides are passive")]
    BothPassive,
    #[error("user {0} is not on the hub")]
    UnknownUser(String),
    #[error("not logged in to the hub")]
    NotLoggedIn,
    #[error("unexpected connection from {0}")]
    Unexpected(String),
    #[error("already connected to {nick} for {direction:?}")]
    Duplicate { nick: String, direction: Direction },
    #[error("unknown connection {0}")]
    UnknownConnection(ConnId),
}

/// How to reach a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectPlan {
    /// `$ConnectToMe` with our listen address; the peer dials us.
    Direct(String),
    /// `$RevConnectToMe`; the peer answers with `$ConnectToMe`.
    Reverse,
}

/// Direct first when we can listen, hub-relayed reverse otherwise.
pub fn plan_connect(listen_address: Option<&str>, remote: UserMode) -> Result<ConnectPlan, ConnectError> {
    match (listen_address, remote) {
        (Some(addr), _) => Ok(ConnectPlan::Direct(addr.to_string())),
        (None, UserMode::Passive) => Err(ConnectError::BothPassive),
        (None, UserMode::Active | UserMode::Unknown) => Ok(ConnectPlan::Reverse),
    }
}

#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub role: Role,
    pub nick: Option<String>,
    pub hub: Option<String>,
    pub direction: Option<Direction>,
    pub opened_at: u64,
}

#[derive(Debug, Clone)]
struct Expectation {
    hub: String,
    since: u64,
}

/// Bookkeeping for every socket the host has open.
pub struct PeerRegistry {
    next_id: u64,
    conns: HashMap<ConnId, ConnInfo>,
    live: HashMap<(String, Direction), ConnId>,
    expected: HashMap<String, Expectation>,
    expect_timeout: u64,
}

impl PeerRegistry {
    pub fn new(expect_timeout: u64) -> Self {
        Self {
            next_id: 1,
            conns: HashMap::new(),
            live: HashMap::new(),
            expected: HashMap::new(),
            expect_timeout,
        }
    }

    /// New socket, before any handshake.
    pub fn open(&mut self, role: Role, hub: Option<String>, now: u64) -> ConnId {
        let id = ConnId(self.next_id);
        self.next_id += 1;
        self.conns.insert(
            id,
            ConnInfo {
                role,
                nick: None,
                hub,
                direction: None,
                opened_at: now,
            },
        );
        id
    }

    /// We sent `$ConnectToMe` to `nick`; its incoming connection will be accepted.
    pub fn expect(&mut self, nick: &str, hub: &str, now: u64) {
        self.expected.insert(
            nick.to_string(),
            Expectation {
                hub: hub.to_string(),
                since: now,
            },
        );
    }

    pub fn is_expected(&self, nick: &str) -> bool {
        self.expected.contains_key(nick)
    }

    /// Remote nick learned from `$MyNick`. Incoming connections must have been expected.
    pub fn identify(&mut self, id: ConnId, nick: &str) -> Result<(), ConnectError> {
        let info = self
            .conns
            .get_mut(&id)
            .ok_or(ConnectError::UnknownConnection(id))?;
        if info.role == Role::Incoming {
            let exp = self
                .expected
                .remove(nick)
                .ok_or_else(|| ConnectError::Unexpected(nick.to_string()))?;
            info.hub = Some(exp.hub);
        }
        info.nick = Some(nick.to_string());
        Ok(())
    }

    /// Handshake reached Ready with `direction` (our side's direction).
    pub fn register(&mut self, id: ConnId, direction: Direction) -> Result<(), ConnectError> {
        let info = self
            .conns
            .get_mut(&id)
            .ok_or(ConnectError::UnknownConnection(id))?;
        let nick = info
            .nick
            .clone()
            .ok_or(ConnectError::UnknownConnection(id))?;
        let key = (nick.clone(), direction);
        if let Some(existing) = self.live.get(&key) {
            if *existing != id {
                return Err(ConnectError::Duplicate { nick, direction });
            }
        }
        info.direction = Some(direction);
        self.live.insert(key, id);
        Ok(())
    }

    pub fn close(&mut self, id: ConnId) -> Option<ConnInfo> {
        let info = self.conns.remove(&id)?;
        if let (Some(nick), Some(direction)) = (&info.nick, info.direction) {
            let key = (nick.clone(), direction);
            if self.live.get(&key) == Some(&id) {
                self.live.remove(&key);
            }
        }
        Some(info)
    }

    pub fn live(&self, nick: &str, direction: Direction) -> Option<ConnId> {
        self.live.get(&(nick.to_string(), direction)).copied()
    }

    pub fn get(&self, id: ConnId) -> Option<&ConnInfo> {
        self.conns.get(&id)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn ids(&self) -> Vec<ConnId> {
        self.conns.keys().copied().collect()
    }

    /// Drop stale expectations; returns their nicks.
    pub fn expire(&mut self, now: u64) -> Vec<String> {
        let timeout = self.expect_timeout;
        let stale: Vec<String> = self
            .expected
            .iter()
            .filter(|(_, e)| now.saturating_sub(e.since) >= timeout)
            .map(|(n, _)| n.clone())
            .collect();
        for nick in &stale {
            self.expected.remove(nick);
        }
        stale
    }
}
