//! NMDC command model: hub and client-client commands, lock/key, `$MyINFO`, `$SR`.

use rand::Rng;

use crate::search::{FileType, SearchQuery, SizeMode};
use crate::tth::TthValue;
use crate::wire::Encoding;

/// Lock prefix announcing `$Supports` capability.
pub const EXTENDED_PREFIX: &str = "EXTENDEDPROTOCOL";

/// Value advertised in `Pk=`.
pub const PK: &str = "DCPLUSPLUS0.868";

/// Protocol version sent in `$Version`.
pub const NMDC_VERSION: &str = "1,0091";

/// Features we announce to hubs.
pub const HUB_FEATURES: &[&str] = &["NoGetINFO", "NoHello", "UserIP2", "TTHSearch"];

/// Features we announce to peers.
pub const PEER_FEATURES: &[&str] = &["MiniSlots", "XmlBZList", "ADCGet", "TTHL", "TTHF"];

/// Name of our file list on the wire.
pub const FILE_LIST_NAME: &str = "files.xml.bz2";

#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed {0}")]
    Malformed(&'static str),
}

pub fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('$', "&#36;")
        .replace('|', "&#124;")
}

pub fn unescape(text: &str) -> String {
    text.replace("&#36;", "$")
        .replace("&#124;", "|")
        .replace("&amp;", "&")
}

/// The classic NMDC lock-to-key transform.
pub fn lock_to_key(lock: &[u8]) -> Vec<u8> {
    let n = lock.len();
    if n < 3 {
        return Vec::new();
    }
    let mut key = vec![0u8; n];
    key[0] = lock[0] ^ lock[n - 1] ^ lock[n - 2] ^ 5;
    for i in 1..n {
        key[i] = lock[i] ^ lock[i - 1];
    }
    let mut out = Vec::with_capacity(n * 2);
    for k in key {
        let k = k.rotate_left(4);
        match k {
            0 | 5 | 36 | 96 | 124 | 126 => {
                out.extend_from_slice(format!("/%DCN{:03}%/", k).as_bytes());
            }
            _ => out.push(k),
        }
    }
    out
}

/// A random lock with the extended-protocol prefix.
pub fn make_lock<R: Rng>(rng: &mut R) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    let tail: String = (0..16)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("{}{}", EXTENDED_PREFIX, tail)
}

/// Whether `key` answers `lock`.
pub fn key_matches(lock: &str, key: &[u8]) -> bool {
    lock_to_key(lock.as_bytes()) == key
}

/// `$Key` frame with raw key bytes.
pub fn key_frame(key: &[u8]) -> Vec<u8> {
    let mut out = b"$Key ".to_vec();
    out.extend_from_slice(key);
    out.push(b'|');
    out
}

/// Connection mode from the client tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum UserMode {
    Active,
    Passive,
    #[default]
    Unknown,
}

/// `<++ V:0.868,M:A,H:1/0/0,S:3>`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientTag {
    pub client: String,
    pub version: String,
    pub mode: UserMode,
    pub hubs: (u32, u32, u32),
    pub slots: u32,
}

impl ClientTag {
    pub fn parse(tag: &str) -> Option<Self> {
        let inner = tag.strip_prefix('<')?.strip_suffix('>')?;
        let (client, fields) = inner.split_once(' ').unwrap_or((inner, ""));
        let mut out = ClientTag {
            client: client.to_string(),
            ..Default::default()
        };
        for field in fields.split(',') {
            let Some((k, v)) = field.split_once(':') else {
                continue;
            };
            match k {
                "V" => out.version = v.to_string(),
                "M" => {
                    out.mode = match v {
                        "A" => UserMode::Active,
                        "P" | "5" => UserMode::Passive,
                        _ => UserMode::Unknown,
                    }
                }
                "H" => {
                    let mut it = v.split('/').map(|n| n.parse::<u32>().unwrap_or(0));
                    out.hubs = (
                        it.next().unwrap_or(0),
                        it.next().unwrap_or(0),
                        it.next().unwrap_or(0),
                    );
                }
                "S" => out.slots = v.parse().unwrap_or(0),
                _ => {}
            }
        }
        Some(out)
    }

    pub fn format(&self) -> String {
        let mode = match self.mode {
            UserMode::Active => "A",
            UserMode::Passive | UserMode::Unknown => "P",
        };
        format!(
            "<{} V:{},M:{},H:{}/{}/{},S:{}>",
            self.client, self.version, mode, self.hubs.0, self.hubs.1, self.hubs.2, self.slots
        )
    }
}

/// `$MyINFO $ALL <nick> <description><tag>$ $<connection><flag>$<email>$<share>$`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MyInfo {
    pub nick: String,
    pub description: String,
    pub tag: Option<ClientTag>,
    pub connection: String,
    pub flag: u8,
    pub email: String,
    pub share_size: u64,
}

impl MyInfo {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        const ERR: ParseError = ParseError::Malformed("$MyINFO");
        let rest = line.strip_prefix("$MyINFO $ALL ").ok_or(ERR)?;
        let (nick, rest) = rest.split_once(' ').ok_or(ERR)?;
        if nick.is_empty() {
            return Err(ERR);
        }
        let parts: Vec<&str> = rest.split('$').collect();
        if parts.len() < 5 {
            return Err(ERR);
        }
        let (description, tag) = match (parts[0].rfind('<'), parts[0].ends_with('>')) {
            (Some(pos), true) => (&parts[0][..pos], ClientTag::parse(&parts[0][pos..])),
            _ => (parts[0], None),
        };
        let conn_flag = parts[2];
        let (connection, flag) = match conn_flag.chars().last() {
            Some(c) => (
                &conn_flag[..conn_flag.len() - c.len_utf8()],
                u32::from(c).min(255) as u8,
            ),
            None => ("", 1),
        };
        Ok(MyInfo {
            nick: nick.to_string(),
            description: unescape(description),
            tag,
            connection: connection.to_string(),
            flag,
            email: unescape(parts[3]),
            share_size: parts[4].trim().parse().unwrap_or(0),
        })
    }

    pub fn format(&self) -> String {
        let tag = self.tag.as_ref().map(ClientTag::format).unwrap_or_default();
        format!(
            "$MyINFO $ALL {} {}{}$ ${}{}${}${}$",
            self.nick,
            escape(&self.description),
            tag,
            self.connection,
            self.flag as char,
            escape(&self.email),
            self.share_size
        )
    }

    pub fn mode(&self) -> UserMode {
        self.tag.as_ref().map(|t| t.mode).unwrap_or_default()
    }

    pub fn slots(&self) -> u32 {
        self.tag.as_ref().map(|t| t.slots).unwrap_or(0)
    }
}

/// Where search results go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchSource {
    /// UDP `ip:port`.
    Active(String),
    /// Passive user: results are relayed by the hub.
    Passive(String),
}

impl SearchSource {
    fn parse(s: &str) -> Result<Self, ParseError> {
        match s.strip_prefix("Hub:") {
            Some(nick) if !nick.is_empty() => Ok(SearchSource::Passive(nick.to_string())),
            Some(_) => Err(ParseError::Malformed("$Search")),
            None if s.contains(':') => Ok(SearchSource::Active(s.to_string())),
            None => Err(ParseError::Malformed("$Search")),
        }
    }

    fn format(&self) -> String {
        match self {
            SearchSource::Active(addr) => addr.clone(),
            SearchSource::Passive(nick) => format!("Hub:{}", nick),
        }
    }
}

/// Criteria part of `$Search`: `F?T?0?1?pattern$words`.
pub fn parse_search_criteria(s: &str) -> Result<SearchQuery, ParseError> {
    const ERR: ParseError = ParseError::Malformed("$Search criteria");
    let parts: Vec<&str> = s.splitn(5, '?').collect();
    if parts.len() != 5 {
        return Err(ERR);
    }
    let size: u64 = parts[2].parse().map_err(|_| ERR)?;
    let size = match (parts[0], parts[1]) {
        ("F", _) => SizeMode::Any,
        ("T", "T") => SizeMode::AtMost(size),
        ("T", "F") => SizeMode::AtLeast(size),
        _ => return Err(ERR),
    };
    let code: u8 = parts[3].parse().map_err(|_| ERR)?;
    let file_type = FileType::from_code(code).ok_or(ERR)?;
    if file_type == FileType::Tth {
        let root = parts[4].strip_prefix("TTH:").ok_or(ERR)?;
        let root = TthValue::from_base32(root).map_err(|_| ERR)?;
        return Ok(SearchQuery::by_tth(root).with_size(size));
    }
    let terms = parts[4]
        .split('$')
        .filter(|t| !t.is_empty())
        .map(|t| unescape(t).to_lowercase())
        .collect();
    Ok(SearchQuery {
        size,
        file_type,
        terms,
        tth: None,
    })
}

pub fn format_search_criteria(query: &SearchQuery) -> String {
    let (restricted, is_max, size) = query.size_fields();
    match &query.tth {
        Some(root) => format!("{}?{}?{}?9?TTH:{}", restricted, is_max, size, root),
        None => {
            let pattern: Vec<String> = query.terms.iter().map(|t| escape(t)).collect();
            format!(
                "{}?{}?{}?{}?{}",
                restricted,
                is_max,
                size,
                query.file_type.code(),
                pattern.join("$")
            )
        }
    }
}

pub fn format_search(source: &SearchSource, query: &SearchQuery) -> String {
    format!("$Search {} {}", source.format(), format_search_criteria(query))
}

/// One `$SR`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    pub nick: String,
    pub path: String,
    /// `None` for directory results.
    pub size: Option<u64>,
    pub free_slots: u32,
    pub total_slots: u32,
    pub tth: Option<TthValue>,
    pub hub_name: Option<String>,
    pub hub_address: String,
    /// Passive searcher's nick (hub strips it before delivery).
    pub target: Option<String>,
}

fn parse_slots(s: &str) -> Option<(u32, u32)> {
    let (free, total) = s.split_once('/')?;
    Some((free.parse().ok()?, total.parse().ok()?))
}

fn parse_hub_field(s: &str) -> (Option<TthValue>, Option<String>, String) {
    let (name, addr) = match s.rfind(" (") {
        Some(pos) => (
            &s[..pos],
            s[pos + 2..].trim_end_matches(')').to_string(),
        ),
        None => (s, String::new()),
    };
    match name.strip_prefix("TTH:") {
        Some(root) => (TthValue::from_base32(root).ok(), None, addr),
        None => (None, Some(name.to_string()), addr),
    }
}

impl SearchResult {
    /// Parse the part after `$SR `.
    pub fn parse(rest: &str) -> Result<Self, ParseError> {
        const ERR: ParseError = ParseError::Malformed("$SR");
        let (nick, rest) = rest.split_once(' ').ok_or(ERR)?;
        let parts: Vec<&str> = rest.split('\x05').collect();
        if parts.len() < 2 {
            return Err(ERR);
        }
        let file_slots = parts
            .get(1)
            .and_then(|p| p.split_once(' '))
            .and_then(|(size, slots)| Some((size.parse::<u64>().ok()?, parse_slots(slots)?)));
        match file_slots {
            Some((size, (free, total))) if parts.len() >= 3 => {
                let (tth, hub_name, hub_address) = parse_hub_field(parts[2]);
                Ok(SearchResult {
                    nick: nick.to_string(),
                    path: parts[0].to_string(),
                    size: Some(size),
                    free_slots: free,
                    total_slots: total,
                    tth,
                    hub_name,
                    hub_address,
                    target: parts.get(3).map(|t| t.to_string()),
                })
            }
            _ => {
                let (path, slots) = parts[0].rsplit_once(' ').ok_or(ERR)?;
                let (free, total) = parse_slots(slots).ok_or(ERR)?;
                let (_, hub_name, hub_address) = parse_hub_field(parts[1]);
                Ok(SearchResult {
                    nick: nick.to_string(),
                    path: path.to_string(),
                    size: None,
                    free_slots: free,
                    total_slots: total,
                    tth: None,
                    hub_name,
                    hub_address,
                    target: parts.get(2).map(|t| t.to_string()),
                })
            }
        }
    }

    pub fn format(&self) -> String {
        let hub = match (&self.tth, &self.hub_name) {
            (Some(root), _) => format!("TTH:{}", root),
            (None, Some(name)) => name.clone(),
            (None, None) => String::new(),
        };
        let mut out = match self.size {
            Some(size) => format!(
                "$SR {} {}\x05{} {}/{}\x05{} ({})",
                self.nick, self.path, size, self.free_slots, self.total_slots, hub, self.hub_address
            ),
            None => format!(
                "$SR {} {} {}/{}\x05{} ({})",
                self.nick, self.path, self.free_slots, self.total_slots, hub, self.hub_address
            ),
        };
        if let Some(target) = &self.target {
            out.push('\x05');
            out.push_str(target);
        }
        out
    }
}

/// Commands a hub sends to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubCommand {
    Lock { lock: Vec<u8>, pk: String },
    Supports(Vec<String>),
    HubName(String),
    HubTopic(String),
    GetPass,
    BadPass,
    ValidateDenide(String),
    HubIsFull,
    Hello(String),
    LogedIn(String),
    MyInfo(MyInfo),
    Quit(String),
    NickList(Vec<String>),
    OpList(Vec<String>),
    UserIp(Vec<(String, String)>),
    Search { source: SearchSource, query: SearchQuery },
    Sr(SearchResult),
    ConnectToMe { target: String, address: String },
    RevConnectToMe { from: String, to: String },
    To { from: String, text: String },
    ForceMove(String),
    Chat { from: Option<String>, text: String },
    Unknown(String),
}

fn split_lock(rest: &[u8]) -> (Vec<u8>, String) {
    let marker = b" Pk=";
    match rest.windows(marker.len()).position(|w| w == marker) {
        Some(pos) => (
            rest[..pos].to_vec(),
            String::from_utf8_lossy(&rest[pos + marker.len()..]).into_owned(),
        ),
        None => (rest.to_vec(), String::new()),
    }
}

fn nick_list(rest: &str) -> Vec<String> {
    rest.split("$$")
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .collect()
}

fn strip_address_flags(addr: &str) -> String {
    addr.trim_end_matches(|c: char| !c.is_ascii_digit()).to_string()
}

pub fn parse_hub_command(frame: &[u8], encoding: Encoding) -> Result<HubCommand, ParseError> {
    if let Some(rest) = frame.strip_prefix(b"$Lock ") {
        let (lock, pk) = split_lock(rest);
        return Ok(HubCommand::Lock { lock, pk });
    }
    let line = encoding.decode(frame);
    if !line.starts_with('$') {
        if let Some(body) = line.strip_prefix('<') {
            if let Some((from, text)) = body.split_once("> ") {
                return Ok(HubCommand::Chat {
                    from: Some(from.to_string()),
                    text: unescape(text),
                });
            }
        }
        return Ok(HubCommand::Chat {
            from: None,
            text: unescape(&line),
        });
    }
    let (name, rest) = line.split_once(' ').unwrap_or((line.as_str(), ""));
    let cmd = match name {
        "$Supports" => HubCommand::Supports(rest.split_whitespace().map(str::to_string).collect()),
        "$HubName" => HubCommand::HubName(unescape(rest)),
        "$HubTopic" => HubCommand::HubTopic(unescape(rest)),
        "$GetPass" => HubCommand::GetPass,
        "$BadPass" => HubCommand::BadPass,
        "$ValidateDenide" => HubCommand::ValidateDenide(rest.to_string()),
        "$HubIsFull" => HubCommand::HubIsFull,
        "$Hello" if !rest.is_empty() => HubCommand::Hello(rest.to_string()),
        "$Hello" => return Err(ParseError::Malformed("$Hello")),
        "$LogedIn" => HubCommand::LogedIn(rest.to_string()),
        "$MyINFO" => HubCommand::MyInfo(MyInfo::parse(&line)?),
        "$Quit" if !rest.is_empty() => HubCommand::Quit(rest.to_string()),
        "$Quit" => return Err(ParseError::Malformed("$Quit")),
        "$NickList" => HubCommand::NickList(nick_list(rest)),
        "$OpList" => HubCommand::OpList(nick_list(rest)),
        "$UserIP" => HubCommand::UserIp(
            nick_list(rest)
                .into_iter()
                .filter_map(|e| e.split_once(' ').map(|(n, ip)| (n.to_string(), ip.to_string())))
                .collect(),
        ),
        "$Search" => {
            let (source, criteria) = rest
                .split_once(' ')
                .ok_or(ParseError::Malformed("$Search"))?;
            HubCommand::Search {
                source: SearchSource::parse(source)?,
                query: parse_search_criteria(criteria)?,
            }
        }
        "$SR" => HubCommand::Sr(SearchResult::parse(rest)?),
        "$ConnectToMe" => {
            let (target, address) = rest
                .split_once(' ')
                .ok_or(ParseError::Malformed("$ConnectToMe"))?;
            HubCommand::ConnectToMe {
                target: target.to_string(),
                address: strip_address_flags(address),
            }
        }
        "$RevConnectToMe" => {
            let (from, to) = rest
                .split_once(' ')
                .ok_or(ParseError::Malformed("$RevConnectToMe"))?;
            HubCommand::RevConnectToMe {
                from: from.to_string(),
                to: to.to_string(),
            }
        }
        "$To:" => {
            // $To: <to> From: <from> $<<from>> <text>
            let (_, after) = rest
                .split_once(" From: ")
                .ok_or(ParseError::Malformed("$To:"))?;
            let (from, body) = after
                .split_once(" $")
                .ok_or(ParseError::Malformed("$To:"))?;
            let text = match body.strip_prefix('<').and_then(|b| b.split_once("> ")) {
                Some((_, text)) => text,
                None => body,
            };
            HubCommand::To {
                from: from.to_string(),
                text: unescape(text),
            }
        }
        "$ForceMove" => HubCommand::ForceMove(rest.to_string()),
        other => HubCommand::Unknown(other.to_string()),
    };
    Ok(cmd)
}

pub fn validate_nick(nick: &str) -> String {
    format!("$ValidateNick {}", nick)
}

pub fn my_pass(password: &str) -> String {
    format!("$MyPass {}", password)
}

pub fn version() -> String {
    format!("$Version {}", NMDC_VERSION)
}

pub fn get_nick_list() -> String {
    "$GetNickList".to_string()
}

pub fn supports(features: &[&str]) -> String {
    format!("$Supports {}", features.join(" "))
}

pub fn connect_to_me(target: &str, address: &str) -> String {
    format!("$ConnectToMe {} {}", target, address)
}

pub fn rev_connect_to_me(me: &str, target: &str) -> String {
    format!("$RevConnectToMe {} {}", me, target)
}

pub fn chat(nick: &str, text: &str) -> String {
    format!("<{}> {}", nick, escape(text))
}

pub fn private_message(to: &str, from: &str, text: &str) -> String {
    format!("$To: {} From: {} $<{}> {}", to, from, from, escape(text))
}

/// Transfer direction a side wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Direction {
    Download,
    Upload,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Download => "Download",
            Direction::Upload => "Upload",
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Direction::Download => Direction::Upload,
            Direction::Upload => Direction::Download,
        }
    }
}

/// What a `$ADCGET` asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    File,
    Tthl,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    Tth(TthValue),
    Path(String),
}

impl Identifier {
    pub fn is_file_list(&self) -> bool {
        matches!(self, Identifier::Path(p) if p == FILE_LIST_NAME)
    }
}

/// `$ADCGET` / `$ADCSND` body: `<kind> <identifier> <start> <bytes>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub kind: RequestKind,
    pub identifier: Identifier,
    pub start: u64,
    /// `-1` means "to the end".
    pub len: i64,
}

fn adc_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace(' ', "\\s").replace('\n', "\\n")
}

fn adc_unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

impl TransferRequest {
    fn parse(rest: &str, what: &'static str) -> Result<Self, ParseError> {
        let err = ParseError::Malformed(what);
        let parts: Vec<&str> = rest.split(' ').collect();
        if parts.len() < 4 {
            return Err(err);
        }
        let kind = match parts[0] {
            "file" => RequestKind::File,
            "tthl" => RequestKind::Tthl,
            _ => return Err(err),
        };
        let identifier = match parts[1].strip_prefix("TTH/") {
            Some(root) => Identifier::Tth(TthValue::from_base32(root).map_err(|_| err)?),
            None => Identifier::Path(adc_unescape(parts[1])),
        };
        let start = parts[2].parse().map_err(|_| err)?;
        let len = parts[3].parse().map_err(|_| err)?;
        if len < -1 {
            return Err(err);
        }
        Ok(Self {
            kind,
            identifier,
            start,
            len,
        })
    }

    fn body(&self) -> String {
        let kind = match self.kind {
            RequestKind::File => "file",
            RequestKind::Tthl => "tthl",
        };
        let ident = match &self.identifier {
            Identifier::Tth(root) => format!("TTH/{}", root),
            Identifier::Path(p) => adc_escape(p),
        };
        format!("{} {} {} {}", kind, ident, self.start, self.len)
    }

    pub fn format_get(&self) -> String {
        format!("$ADCGET {}", self.body())
    }

    pub fn format_snd(&self) -> String {
        format!("$ADCSND {}", self.body())
    }
}

/// Client-client commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    MyNick(String),
    Lock { lock: Vec<u8>, pk: String },
    Supports(Vec<String>),
    Direction { direction: Direction, number: u16 },
    Key(Vec<u8>),
    AdcGet(TransferRequest),
    AdcSnd(TransferRequest),
    Error(String),
    MaxedOut,
    Unknown(String),
}

pub fn parse_peer_command(frame: &[u8], encoding: Encoding) -> Result<PeerCommand, ParseError> {
    if let Some(rest) = frame.strip_prefix(b"$Lock ") {
        let (lock, pk) = split_lock(rest);
        return Ok(PeerCommand::Lock { lock, pk });
    }
    if let Some(rest) = frame.strip_prefix(b"$Key ") {
        return Ok(PeerCommand::Key(rest.to_vec()));
    }
    let line = encoding.decode(frame);
    let (name, rest) = line.split_once(' ').unwrap_or((line.as_str(), ""));
    let cmd = match name {
        "$MyNick" if !rest.is_empty() => PeerCommand::MyNick(rest.to_string()),
        "$MyNick" => return Err(ParseError::Malformed("$MyNick")),
        "$Supports" => PeerCommand::Supports(rest.split_whitespace().map(str::to_string).collect()),
        "$Direction" => {
            let (dir, number) = rest
                .split_once(' ')
                .ok_or(ParseError::Malformed("$Direction"))?;
            let direction = match dir {
                "Download" => Direction::Download,
                "Upload" => Direction::Upload,
                _ => return Err(ParseError::Malformed("$Direction")),
            };
            let number = number
                .trim()
                .parse()
                .map_err(|_| ParseError::Malformed("$Direction"))?;
            PeerCommand::Direction { direction, number }
        }
        "$ADCGET" => PeerCommand::AdcGet(TransferRequest::parse(rest, "$ADCGET")?),
        "$ADCSND" => PeerCommand::AdcSnd(TransferRequest::parse(rest, "$ADCSND")?),
        "$Error" => PeerCommand::Error(rest.to_string()),
        "$MaxedOut" => PeerCommand::MaxedOut,
        other => PeerCommand::Unknown(other.to_string()),
    };
    Ok(cmd)
}

pub fn my_nick(nick: &str) -> String {
    format!("$MyNick {}", nick)
}

pub fn lock(lock: &str) -> String {
    format!("$Lock {} Pk={}", lock, PK)
}

pub fn direction(direction: Direction, number: u16) -> String {
    format!("$Direction {} {}", direction.as_str(), number)
}

pub fn error(message: &str) -> String {
    format!("$Error {}", message)
}

pub fn maxed_out() -> String {
    "$MaxedOut".to_string()
}
