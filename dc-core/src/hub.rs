//! Hub session state machine. The host owns the socket; frames go in, actions come out.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::connection::{plan_connect, ConnectError, ConnectPlan};
use crate::events::HubEvent;
use crate::nmdc::{
    self, ClientTag, HubCommand, MyInfo, SearchResult, SearchSource, UserMode, EXTENDED_PREFIX,
    HUB_FEATURES,
};
use crate::search::SearchQuery;
use crate::share::ShareIndex;
use crate::wire::{encode_frame, Encoding};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Identifying,
    LoggedIn,
    Active,
    /// Active with at least one search inside the dedup window.
    Searching,
}

fn default_true() -> bool {
    true
}

/// Per-hub settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HubSettings {
    /// `host:port`
    pub address: String,
    /// Overrides the engine nick for this hub.
    #[serde(default)]
    pub nick: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub encoding: Encoding,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
}

impl HubSettings {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            nick: None,
            password: None,
            encoding: Encoding::default(),
            auto_reconnect: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HubUser {
    pub info: Option<MyInfo>,
    pub is_op: bool,
    pub ip: Option<String>,
}

impl HubUser {
    pub fn mode(&self) -> UserMode {
        self.info.as_ref().map(MyInfo::mode).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub seq: u64,
    pub from: Option<String>,
    pub text: String,
    pub private: bool,
}

/// What the host should do for this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubAction {
    /// Open the TCP connection to the hub.
    Connect(String),
    Send(Vec<u8>),
    /// Active search result over UDP.
    SendUdp { address: String, frame: Vec<u8> },
    /// Dial a peer that asked us with `$ConnectToMe`.
    ConnectToPeer { address: String },
    /// We sent `$ConnectToMe`; accept this nick's incoming connection.
    ExpectPeer { nick: String },
    Close,
    Event(HubEvent),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SearchError {
    #[error("not logged in")]
    NotLoggedIn,
    #[error("empty search")]
    EmptyQuery,
    #[error("identical search in flight, retry in {retry_in} ticks")]
    Duplicate { retry_in: u64 },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("not logged in")]
    NotLoggedIn,
}

pub struct HubSession {
    settings: HubSettings,
    config: EngineConfig,
    nick: String,
    state: SessionState,
    reported: SessionState,
    now: u64,
    state_since: u64,
    last_recv: u64,
    last_send: u64,
    reconnect_attempt: u32,
    reconnect_at: Option<u64>,
    left: bool,
    hub_name: Option<String>,
    topic: Option<String>,
    hub_features: Vec<String>,
    roster: HashMap<String, HubUser>,
    /// Search token -> tick it was sent.
    searches: HashMap<String, u64>,
    chat: VecDeque<ChatLine>,
    next_seq: u64,
    share_size: u64,
    free_slots: u32,
    total_slots: u32,
    last_info: Option<String>,
}

impl HubSession {
    pub fn new(settings: HubSettings, config: EngineConfig) -> Self {
        let nick = settings.nick.clone().unwrap_or_else(|| config.nick.clone());
        let total_slots = config.max_slots;
        Self {
            settings,
            config,
            nick,
            state: SessionState::Disconnected,
            reported: SessionState::Disconnected,
            now: 0,
            state_since: 0,
            last_recv: 0,
            last_send: 0,
            reconnect_attempt: 0,
            reconnect_at: None,
            left: false,
            hub_name: None,
            topic: None,
            hub_features: Vec::new(),
            roster: HashMap::new(),
            searches: HashMap::new(),
            chat: VecDeque::new(),
            next_seq: 0,
            share_size: 0,
            free_slots: total_slots,
            total_slots,
            last_info: None,
        }
    }

    pub fn address(&self) -> &str {
        &self.settings.address
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    pub fn state(&self) -> SessionState {
        if self.state == SessionState::Active && self.live_searches() > 0 {
            SessionState::Searching
        } else {
            self.state
        }
    }

    pub fn is_logged_in(&self) -> bool {
        matches!(self.state, SessionState::LoggedIn | SessionState::Active)
    }

    pub fn hub_name(&self) -> Option<&str> {
        self.hub_name.as_deref()
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    pub fn hub_features(&self) -> &[String] {
        &self.hub_features
    }

    pub fn user(&self, nick: &str) -> Option<&HubUser> {
        self.roster.get(nick)
    }

    pub fn users(&self) -> impl Iterator<Item = (&str, &HubUser)> {
        self.roster.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn user_count(&self) -> usize {
        self.roster.len()
    }

    /// Cursor for the next chat line.
    pub fn chat_cursor(&self) -> u64 {
        self.next_seq
    }

    pub fn chat_since(&self, cursor: u64) -> Vec<&ChatLine> {
        self.chat.iter().filter(|l| l.seq >= cursor).collect()
    }

    /// Ticks until the next reconnect attempt, if one is scheduled.
    pub fn reconnect_in(&self) -> Option<u64> {
        self.reconnect_at.map(|at| at.saturating_sub(self.now))
    }

    fn live_searches(&self) -> usize {
        let window = self.config.search_window;
        self.searches
            .values()
            .filter(|&&t| self.now.saturating_sub(t) < window)
            .count()
    }

    fn send(&mut self, actions: &mut Vec<HubAction>, command: &str) {
        actions.push(HubAction::Send(encode_frame(command, self.settings.encoding)));
        self.last_send = self.now;
    }

    fn event(&self, actions: &mut Vec<HubAction>, event: HubEvent) {
        actions.push(HubAction::Event(event));
    }

    fn set_state(&mut self, state: SessionState, actions: &mut Vec<HubAction>) {
        if self.state != state {
            tracing::debug!(hub = %self.settings.address, from = ?self.state, to = ?state, "hub state");
            self.state = state;
            self.state_since = self.now;
        }
        self.report_state(actions);
    }

    fn report_state(&mut self, actions: &mut Vec<HubAction>) {
        let current = self.state();
        if current != self.reported {
            self.reported = current;
            self.event(
                actions,
                HubEvent::StateChanged {
                    hub: self.settings.address.clone(),
                    state: current,
                },
            );
        }
    }

    /// Explicit join.
    pub fn join(&mut self) -> Vec<HubAction> {
        let mut actions = Vec::new();
        if self.state != SessionState::Disconnected {
            return actions;
        }
        self.left = false;
        self.reconnect_at = None;
        self.set_state(SessionState::Connecting, &mut actions);
        actions.push(HubAction::Connect(self.settings.address.clone()));
        actions
    }

    /// Explicit leave; never reconnects.
    pub fn leave(&mut self) -> Vec<HubAction> {
        let mut actions = Vec::new();
        self.left = true;
        self.reconnect_at = None;
        if self.state != SessionState::Disconnected {
            self.disconnect("left hub", false, true, &mut actions);
        }
        actions
    }

    /// TCP connect succeeded.
    pub fn on_connected(&mut self) -> Vec<HubAction> {
        let mut actions = Vec::new();
        if self.state == SessionState::Connecting {
            self.last_recv = self.now;
            self.set_state(SessionState::Identifying, &mut actions);
        }
        actions
    }

    /// Socket closed or connect failed.
    pub fn on_disconnected(&mut self, reason: &str) -> Vec<HubAction> {
        let mut actions = Vec::new();
        if self.state != SessionState::Disconnected {
            self.disconnect(reason, true, false, &mut actions);
        }
        actions
    }

    /// Oversized frame or similar framing fault seen by the host.
    pub fn on_protocol_violation(&mut self, reason: &str) -> Vec<HubAction> {
        let mut actions = Vec::new();
        if self.state != SessionState::Disconnected {
            tracing::warn!(hub = %self.settings.address, reason, "protocol violation");
            self.disconnect(&format!("protocol violation: {}", reason), true, true, &mut actions);
        }
        actions
    }

    fn backoff(&self) -> u64 {
        self.config
            .reconnect_base
            .saturating_mul(2u64.saturating_pow(self.reconnect_attempt))
            .min(self.config.reconnect_max)
    }

    fn disconnect(&mut self, reason: &str, reconnect: bool, close: bool, actions: &mut Vec<HubAction>) {
        self.roster.clear();
        self.searches.clear();
        self.last_info = None;
        let retry_in = if reconnect && self.settings.auto_reconnect && !self.left {
            let delay = self.backoff();
            self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
            self.reconnect_at = Some(self.now + delay);
            Some(delay)
        } else {
            self.reconnect_at = None;
            None
        };
        tracing::info!(hub = %self.settings.address, reason, ?retry_in, "hub disconnected");
        self.set_state(SessionState::Disconnected, actions);
        self.event(
            actions,
            HubEvent::Disconnected {
                hub: self.settings.address.clone(),
                reason: reason.to_string(),
                retry_in,
            },
        );
        if close {
            actions.push(HubAction::Close);
        }
    }

    fn fail_login(&mut self, reason: &str, actions: &mut Vec<HubAction>) {
        self.event(
            actions,
            HubEvent::LoginFailed {
                hub: self.settings.address.clone(),
                reason: reason.to_string(),
            },
        );
        self.disconnect(reason, false, true, actions);
    }

    fn my_info(&self) -> MyInfo {
        let mode = if self.config.is_active() {
            UserMode::Active
        } else {
            UserMode::Passive
        };
        let hubs = if self.settings.password.is_some() {
            (0, 1, 0)
        } else {
            (1, 0, 0)
        };
        MyInfo {
            nick: self.nick.clone(),
            description: self.config.description.clone(),
            tag: Some(ClientTag {
                client: "++".into(),
                version: "0.868".into(),
                mode,
                hubs,
                slots: self.total_slots,
            }),
            connection: self.config.connection.clone(),
            flag: 1,
            email: self.config.email.clone(),
            share_size: self.share_size,
        }
    }

    fn send_my_info(&mut self, actions: &mut Vec<HubAction>) {
        let info = self.my_info().format();
        if self.last_info.as_deref() != Some(info.as_str()) {
            self.send(actions, &info);
            self.last_info = Some(info);
        }
    }

    /// Share size or slot counts changed; `$MyINFO` is resent when it differs.
    pub fn set_share_info(&mut self, share_size: u64, free_slots: u32, total_slots: u32) -> Vec<HubAction> {
        self.share_size = share_size;
        self.free_slots = free_slots;
        self.total_slots = total_slots;
        let mut actions = Vec::new();
        if self.is_logged_in() {
            self.send_my_info(&mut actions);
        }
        actions
    }

    fn push_chat(&mut self, from: Option<String>, text: String, private: bool, actions: &mut Vec<HubAction>) {
        let line = ChatLine {
            seq: self.next_seq,
            from: from.clone(),
            text: text.clone(),
            private,
        };
        self.next_seq += 1;
        self.chat.push_back(line);
        while self.chat.len() > self.config.chat_history {
            self.chat.pop_front();
        }
        self.event(
            actions,
            HubEvent::Message {
                hub: self.settings.address.clone(),
                from,
                text,
                private,
            },
        );
    }

    fn upsert_user(&mut self, nick: &str, actions: &mut Vec<HubAction>) -> &mut HubUser {
        if !self.roster.contains_key(nick) {
            self.event(
                actions,
                HubEvent::UserUpdated {
                    hub: self.settings.address.clone(),
                    nick: nick.to_string(),
                },
            );
        }
        self.roster.entry(nick.to_string()).or_default()
    }

    /// One complete frame from the hub.
    pub fn on_frame(&mut self, frame: &[u8], share: &ShareIndex) -> Vec<HubAction> {
        let mut actions = Vec::new();
        if self.state == SessionState::Disconnected {
            return actions;
        }
        self.last_recv = self.now;
        if frame.is_empty() {
            return actions;
        }
        let cmd = match nmdc::parse_hub_command(frame, self.settings.encoding) {
            Ok(cmd) => cmd,
            Err(e) => {
                tracing::warn!(hub = %self.settings.address, error = %e, "malformed hub command");
                self.disconnect(&format!("protocol violation: {}", e), true, true, &mut actions);
                return actions;
            }
        };
        self.handle(cmd, share, &mut actions);
        self.report_state(&mut actions);
        actions
    }

    fn handle(&mut self, cmd: HubCommand, share: &ShareIndex, actions: &mut Vec<HubAction>) {
        let hub = self.settings.address.clone();
        match cmd {
            HubCommand::Lock { lock, .. } => {
                if self.state != SessionState::Identifying {
                    return;
                }
                if lock.starts_with(EXTENDED_PREFIX.as_bytes()) {
                    self.send(actions, &nmdc::supports(HUB_FEATURES));
                }
                actions.push(HubAction::Send(nmdc::key_frame(&nmdc::lock_to_key(&lock))));
                let nick = self.nick.clone();
                self.send(actions, &nmdc::validate_nick(&nick));
            }
            HubCommand::Supports(features) => self.hub_features = features,
            HubCommand::GetPass => match self.settings.password.clone() {
                Some(pw) => self.send(actions, &nmdc::my_pass(&pw)),
                None => self.fail_login("password required", actions),
            },
            HubCommand::BadPass => self.fail_login("bad password", actions),
            HubCommand::ValidateDenide(_) => self.fail_login("nick rejected", actions),
            HubCommand::HubIsFull => self.disconnect("hub is full", true, true, actions),
            HubCommand::Hello(nick) if nick == self.nick => {
                if self.state != SessionState::Identifying {
                    return;
                }
                self.set_state(SessionState::LoggedIn, actions);
                self.send(actions, &nmdc::version());
                self.send(actions, &nmdc::get_nick_list());
                self.send_my_info(actions);
                self.reconnect_attempt = 0;
                self.set_state(SessionState::Active, actions);
            }
            HubCommand::Hello(nick) => {
                self.upsert_user(&nick, actions);
            }
            HubCommand::LogedIn(_) => {}
            HubCommand::MyInfo(info) => {
                let nick = info.nick.clone();
                self.roster.entry(nick.clone()).or_default().info = Some(info);
                self.event(actions, HubEvent::UserUpdated { hub, nick });
            }
            HubCommand::Quit(nick) => {
                if self.roster.remove(&nick).is_some() {
                    self.event(actions, HubEvent::UserQuit { hub, nick });
                }
            }
            HubCommand::NickList(nicks) => {
                for nick in nicks {
                    self.upsert_user(&nick, actions);
                }
            }
            HubCommand::OpList(nicks) => {
                for nick in nicks {
                    self.upsert_user(&nick, actions).is_op = true;
                }
            }
            HubCommand::UserIp(pairs) => {
                for (nick, ip) in pairs {
                    self.roster.entry(nick).or_default().ip = Some(ip);
                }
            }
            HubCommand::HubName(name) => {
                self.hub_name = Some(name.clone());
                self.event(actions, HubEvent::HubName { hub, name });
            }
            HubCommand::HubTopic(topic) => self.topic = Some(topic),
            HubCommand::Chat { from, text } => self.push_chat(from, text, false, actions),
            HubCommand::To { from, text } => self.push_chat(Some(from), text, true, actions),
            HubCommand::Search { source, query } => self.answer_search(source, query, share, actions),
            HubCommand::Sr(result) => {
                self.event(actions, HubEvent::SearchResult { hub, result });
            }
            HubCommand::ConnectToMe { target, address } => {
                if target == self.nick && self.is_logged_in() {
                    actions.push(HubAction::ConnectToPeer { address });
                }
            }
            HubCommand::RevConnectToMe { from, to } => {
                if to != self.nick || !self.is_logged_in() {
                    return;
                }
                match self.config.tcp_address() {
                    Some(addr) => {
                        self.send(actions, &nmdc::connect_to_me(&from, &addr));
                        actions.push(HubAction::ExpectPeer { nick: from });
                    }
                    None => {
                        tracing::debug!(hub = %hub, nick = %from, "ignoring reverse connect, both passive");
                    }
                }
            }
            HubCommand::ForceMove(address) => {
                self.event(actions, HubEvent::Redirect { hub, address });
                self.disconnect("redirected", false, true, actions);
            }
            HubCommand::Unknown(name) => {
                tracing::trace!(hub = %hub, command = %name, "ignoring unknown hub command");
            }
        }
    }

    fn answer_search(
        &mut self,
        source: SearchSource,
        query: SearchQuery,
        share: &ShareIndex,
        actions: &mut Vec<HubAction>,
    ) {
        if !self.is_logged_in() {
            return;
        }
        let cap = match &source {
            SearchSource::Passive(nick) if *nick == self.nick => return,
            // Passive searchers cannot reach a passive uploader.
            SearchSource::Passive(_) if !self.config.is_active() => return,
            SearchSource::Passive(_) => self.config.passive_result_cap,
            SearchSource::Active(addr) if Some(addr) == self.config.udp_address().as_ref() => return,
            SearchSource::Active(_) => self.config.active_result_cap,
        };
        let hits = share.search(&query, cap);
        for hit in hits {
            let hub_name = match hit.tth {
                Some(_) => None,
                None => Some(
                    self.hub_name
                        .clone()
                        .unwrap_or_else(|| self.settings.address.clone()),
                ),
            };
            let target = match &source {
                SearchSource::Passive(nick) => Some(nick.clone()),
                SearchSource::Active(_) => None,
            };
            let sr = SearchResult {
                nick: self.nick.clone(),
                path: hit.virtual_path,
                size: if hit.is_dir { None } else { Some(hit.size) },
                free_slots: self.free_slots,
                total_slots: self.total_slots,
                tth: hit.tth,
                hub_name,
                hub_address: self.settings.address.clone(),
                target,
            };
            match &source {
                SearchSource::Active(addr) => actions.push(HubAction::SendUdp {
                    address: addr.clone(),
                    frame: encode_frame(&sr.format(), self.settings.encoding),
                }),
                SearchSource::Passive(_) => self.send(actions, &sr.format()),
            }
        }
    }

    /// Outbound search with duplicate suppression inside the window.
    pub fn search(&mut self, query: &SearchQuery) -> Result<Vec<HubAction>, SearchError> {
        if !self.is_logged_in() {
            return Err(SearchError::NotLoggedIn);
        }
        if query.is_empty() {
            return Err(SearchError::EmptyQuery);
        }
        let window = self.config.search_window;
        let now = self.now;
        self.searches.retain(|_, t| now.saturating_sub(*t) < window);
        let token = query.token();
        if let Some(&started) = self.searches.get(&token) {
            let retry_in = window - now.saturating_sub(started);
            return Err(SearchError::Duplicate { retry_in });
        }
        self.searches.insert(token, now);
        let source = match self.config.udp_address() {
            Some(addr) => SearchSource::Active(addr),
            None => SearchSource::Passive(self.nick.clone()),
        };
        let mut actions = Vec::new();
        self.send(&mut actions, &nmdc::format_search(&source, query));
        self.report_state(&mut actions);
        Ok(actions)
    }

    pub fn send_chat(&mut self, text: &str) -> Result<Vec<HubAction>, SessionError> {
        if !self.is_logged_in() {
            return Err(SessionError::NotLoggedIn);
        }
        let mut actions = Vec::new();
        let line = nmdc::chat(&self.nick, text);
        self.send(&mut actions, &line);
        Ok(actions)
    }

    pub fn send_private(&mut self, to: &str, text: &str) -> Result<Vec<HubAction>, SessionError> {
        if !self.is_logged_in() {
            return Err(SessionError::NotLoggedIn);
        }
        let mut actions = Vec::new();
        let line = nmdc::private_message(to, &self.nick, text);
        self.send(&mut actions, &line);
        let nick = self.nick.clone();
        self.push_chat(Some(nick), text.to_string(), true, &mut actions);
        Ok(actions)
    }

    /// Ask `nick` for a peer connection, direct if we listen, reverse otherwise.
    pub fn connect_to(&mut self, nick: &str) -> Result<Vec<HubAction>, ConnectError> {
        if !self.is_logged_in() {
            return Err(ConnectError::NotLoggedIn);
        }
        let user = self
            .roster
            .get(nick)
            .ok_or_else(|| ConnectError::UnknownUser(nick.to_string()))?;
        let plan = plan_connect(self.config.tcp_address().as_deref(), user.mode())?;
        let mut actions = Vec::new();
        match plan {
            ConnectPlan::Direct(addr) => {
                self.send(&mut actions, &nmdc::connect_to_me(nick, &addr));
                actions.push(HubAction::ExpectPeer {
                    nick: nick.to_string(),
                });
            }
            ConnectPlan::Reverse => {
                let me = self.nick.clone();
                self.send(&mut actions, &nmdc::rev_connect_to_me(&me, nick));
            }
        }
        Ok(actions)
    }

    /// Advance one tick: login/idle timeouts, keepalive, scheduled reconnect.
    pub fn tick(&mut self) -> Vec<HubAction> {
        self.now += 1;
        let mut actions = Vec::new();
        match self.state {
            SessionState::Connecting | SessionState::Identifying => {
                if self.now - self.state_since >= self.config.login_timeout {
                    self.disconnect("login timeout", true, true, &mut actions);
                }
            }
            SessionState::LoggedIn | SessionState::Active | SessionState::Searching => {
                if self.now - self.last_recv >= self.config.idle_timeout {
                    self.disconnect("idle timeout", true, true, &mut actions);
                } else if self.now - self.last_send >= self.config.keepalive_interval {
                    actions.push(HubAction::Send(vec![crate::wire::DELIMITER]));
                    self.last_send = self.now;
                }
            }
            SessionState::Disconnected => {
                if let Some(at) = self.reconnect_at {
                    if self.now >= at {
                        self.reconnect_at = None;
                        self.set_state(SessionState::Connecting, &mut actions);
                        actions.push(HubAction::Connect(self.settings.address.clone()));
                    }
                }
            }
        }
        let window = self.config.search_window;
        let now = self.now;
        self.searches.retain(|_, t| now.saturating_sub(*t) < window);
        self.report_state(&mut actions);
        actions
    }
}
