//! Host-driven transfer API: TransferCore receives peer events from the host and returns
//! actions. It owns the download queue and the upload slots; the host owns sockets and files.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::connection::ConnId;
use crate::events::{DownloadEvent, EngineEvent, FailureReason, QueueEvent};
use crate::hash::{HashRecord, HashStore};
use crate::integrity::{self, Verification, VerifyPlan};
use crate::nmdc::{self, Direction, Identifier, PeerCommand, RequestKind, TransferRequest};
use crate::peer::{Features, Negotiated};
use crate::queue::{ItemId, ItemStatus, Priority, QueueError, QueueManager, QueueSnapshot, Source};
use crate::scheduler::{self, Assignment, Limits, Work};
use crate::share::ShareIndex;
use crate::tth::{TigerTree, TthValue, HASH_SIZE};
use crate::upload::{UploadDecision, UploadManager};
use crate::wire::{encode_frame, Encoding};

/// Largest leaf data accepted from a peer (2^20 leaves).
const MAX_TREE_BYTES: i64 = (HASH_SIZE as i64) << 20;

const FILE_NOT_AVAILABLE: &str = "File Not Available";

/// Where raw bytes following an `$ADCSND` go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sink {
    /// Write `len` bytes at `offset` of `path` (created if missing, never truncated).
    File { path: PathBuf, offset: u64, len: u64 },
    /// Buffer `len` bytes and hand them to `on_tree_bytes`.
    Tree { len: u64 },
}

/// Action for the host to perform.
#[derive(Debug, Clone)]
pub enum TransferAction {
    Send(ConnId, Vec<u8>),
    Close(ConnId),
    /// Get a download connection to `nick` through its hub.
    ConnectSource { nick: String, hub: String },
    Receive { conn: ConnId, sink: Sink },
    /// Stream `len` bytes of `path` from `offset`, then call `on_upload_done`.
    SendFile { conn: ConnId, path: PathBuf, offset: u64, len: u64 },
    /// Send these bytes, then call `on_upload_done`.
    SendBytes { conn: ConnId, data: Vec<u8> },
    /// Send part of our compressed file list, then call `on_upload_done`.
    SendFileList { conn: ConnId, offset: u64, len: u64 },
    /// Hash `temp` per `plan` and report through `on_verified`.
    Verify { item: ItemId, temp: PathBuf, plan: VerifyPlan },
    /// Rename `temp` to `target` and report through `on_finalized`.
    Finalize { item: ItemId, temp: PathBuf, target: PathBuf },
    /// Delete an abandoned temp file.
    Discard { temp: PathBuf },
    /// Leaves learned from a peer, worth keeping in the hash store.
    StoreTree(HashRecord),
    Event(EngineEvent),
}

/// Ticks before a source that has failed `failures` times in a row is dialed again.
fn retry_delay(config: &EngineConfig, failures: u32) -> u64 {
    config
        .reconnect_base
        .saturating_mul(2u64.saturating_pow(failures.saturating_sub(1)))
        .min(config.reconnect_max)
}

fn event(e: impl Into<EngineEvent>) -> TransferAction {
    TransferAction::Event(e.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Requested,
    Receiving { received: u64 },
}

#[derive(Debug, Clone)]
struct Pending {
    item: ItemId,
    work: Work,
    start: u64,
    len: u64,
    stage: Stage,
}

/// How an aborted download counts against its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Penalty {
    Failure,
    Cooldown,
    Remove,
}

/// Resolved upload request.
enum Upload {
    File { path: PathBuf, size: u64 },
    List { size: u64 },
    Bytes(Vec<u8>),
}

impl Upload {
    fn size(&self) -> u64 {
        match self {
            Upload::File { size, .. } | Upload::List { size } => *size,
            Upload::Bytes(b) => b.len() as u64,
        }
    }
}

/// A peer connection that finished its handshake.
struct PeerLink {
    nick: String,
    direction: Direction,
    features: Features,
    download: Option<Pending>,
    tree_buf: Vec<u8>,
    uploading: bool,
    last_activity: u64,
}

/// Main coordinator. Host passes events; core returns actions.
pub struct TransferCore {
    config: EngineConfig,
    queue: QueueManager,
    uploads: UploadManager,
    links: HashMap<ConnId, PeerLink>,
    /// Nick -> tick a `ConnectSource` was issued.
    dialing: HashMap<String, u64>,
    file_list_size: u64,
    now: u64,
}

impl TransferCore {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_queue(config, QueueManager::new())
    }

    pub fn with_queue(config: EngineConfig, queue: QueueManager) -> Self {
        let uploads = UploadManager::new(
            config.max_slots,
            config.mini_slots,
            config.mini_slot_size,
            config.upload_queue_timeout,
        );
        Self {
            config,
            queue,
            uploads,
            links: HashMap::new(),
            dialing: HashMap::new(),
            file_list_size: 0,
            now: 0,
        }
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn queue(&self) -> &QueueManager {
        &self.queue
    }

    pub fn uploads(&self) -> &UploadManager {
        &self.uploads
    }

    pub fn queue_snapshot(&self) -> QueueSnapshot {
        self.queue.snapshot()
    }

    /// True once after any queue change; the host persists then.
    pub fn take_queue_dirty(&mut self) -> bool {
        self.queue.take_dirty()
    }

    /// Size of the compressed file list the host serves.
    pub fn set_file_list_size(&mut self, size: u64) {
        self.file_list_size = size;
    }

    fn limits(&self) -> Limits {
        Limits {
            segment_size: self.config.segment_size,
            max_segments_per_item: self.config.max_segments_per_item as usize,
            max_segments_per_peer: self.config.max_segments_per_peer as usize,
            max_source_failures: self.config.max_source_failures,
        }
    }

    pub fn queue_download(
        &mut self,
        target: PathBuf,
        size: u64,
        tth: Option<TthValue>,
        priority: Priority,
    ) -> Result<(ItemId, Vec<TransferAction>), QueueError> {
        let id = self.queue.add(target.clone(), size, tth, priority)?;
        tracing::info!(item = %id, target = %target.display(), size, "queued download");
        Ok((id, vec![event(QueueEvent::Added { item: id, target })]))
    }

    pub fn add_source(&mut self, item: ItemId, source: Source) -> Result<Vec<TransferAction>, QueueError> {
        let nick = source.nick.clone();
        let mut actions = Vec::new();
        if self.queue.add_source(item, source)? {
            actions.push(event(QueueEvent::SourceAdded { item, nick }));
        }
        self.resume_if_unstalled(item, &mut actions);
        Ok(actions)
    }

    pub fn remove_source(&mut self, item: ItemId, nick: &str) -> Result<Vec<TransferAction>, QueueError> {
        let mut actions = Vec::new();
        if self.queue.remove_source(item, nick)? {
            actions.push(event(QueueEvent::SourceRemoved {
                item,
                nick: nick.to_string(),
            }));
        }
        for conn in self.links_on_item(item, Some(nick)) {
            self.close_link(conn, &mut actions);
        }
        self.update_stalled(item, &mut actions);
        Ok(actions)
    }

    pub fn remove_item(&mut self, item: ItemId) -> Result<Vec<TransferAction>, QueueError> {
        let removed = self.queue.remove(item)?;
        let mut actions = Vec::new();
        for conn in self.links_on_item(item, None) {
            self.close_link(conn, &mut actions);
        }
        tracing::info!(item = %item, target = %removed.target.display(), "removed from queue");
        if removed.done.count() > 0 {
            actions.push(TransferAction::Discard {
                temp: removed.temp_path(),
            });
        }
        actions.push(event(QueueEvent::Removed { item }));
        Ok(actions)
    }

    pub fn set_priority(&mut self, item: ItemId, priority: Priority) -> Result<Vec<TransferAction>, QueueError> {
        self.queue.set_priority(item, priority)?;
        Ok(vec![event(QueueEvent::PriorityChanged { item, priority })])
    }

    /// Offer a stored tree to every queued item with this root.
    pub fn attach_tree(&mut self, tree: HashRecord) -> usize {
        let ids: Vec<ItemId> = self
            .queue
            .items()
            .filter(|i| i.tth == Some(tree.root) && i.needs_tree())
            .map(|i| i.id)
            .collect();
        let mut attached = 0;
        for id in ids {
            if let Some(item) = self.queue.get_mut(&id) {
                if item.attach_tree(Arc::clone(&tree)) {
                    attached += 1;
                }
            }
        }
        attached
    }

    fn links_on_item(&self, item: ItemId, nick: Option<&str>) -> Vec<ConnId> {
        self.links
            .iter()
            .filter(|(_, l)| l.download.as_ref().is_some_and(|p| p.item == item))
            .filter(|(_, l)| nick.map_or(true, |n| l.nick == n))
            .map(|(c, _)| *c)
            .collect()
    }

    /// Handshake reached Ready on `conn`.
    pub fn on_peer_ready(&mut self, conn: ConnId, peer: Negotiated) -> Vec<TransferAction> {
        let Negotiated {
            nick,
            direction,
            features,
        } = peer;
        self.dialing.remove(&nick);
        tracing::debug!(%conn, nick = %nick, ?direction, "peer ready");
        self.links.insert(
            conn,
            PeerLink {
                nick: nick.clone(),
                direction,
                features,
                download: None,
                tree_buf: Vec::new(),
                uploading: false,
                last_activity: self.now,
            },
        );
        let mut actions = Vec::new();
        if direction == Direction::Download {
            for id in self.queue.items_with_source(&nick) {
                if let Some(source) = self.queue.get_mut(&id).and_then(|i| i.source_mut(&nick)) {
                    source.failed_attempts = 0;
                }
                self.resume_if_unstalled(id, &mut actions);
            }
            self.assign_next(conn, &mut actions);
        }
        actions
    }

    fn assign_next(&mut self, conn: ConnId, actions: &mut Vec<TransferAction>) {
        let Some(link) = self.links.get(&conn) else {
            return;
        };
        if link.direction != Direction::Download || link.download.is_some() {
            return;
        }
        let nick = link.nick.clone();
        let features = link.features;
        let limits = self.limits();
        let Some(Assignment { item: id, work }) =
            scheduler::assign(&self.queue, &nick, &features, &limits, self.now)
        else {
            tracing::debug!(%conn, nick = %nick, "nothing to fetch");
            self.close_link(conn, actions);
            return;
        };
        let Some(item) = self.queue.get_mut(&id) else {
            return;
        };
        let (request, start, len) = match work {
            Work::Tree => {
                let Some(root) = item.tth else { return };
                item.tree_pending = Some(nick.clone());
                let req = TransferRequest {
                    kind: RequestKind::Tthl,
                    identifier: Identifier::Tth(root),
                    start: 0,
                    len: -1,
                };
                (req, 0, 0)
            }
            Work::Segment(seg) => {
                let (start, len) = seg.byte_range(item.block_size, item.size);
                let path = item.source(&nick).and_then(|s| s.path.clone());
                let identifier = match (item.tth, path) {
                    (Some(root), _) if features.tthf => Identifier::Tth(root),
                    (_, Some(path)) => Identifier::Path(path),
                    _ => return,
                };
                item.start_segment(&nick, seg);
                let req = TransferRequest {
                    kind: RequestKind::File,
                    identifier,
                    start,
                    len: len as i64,
                };
                (req, start, len)
            }
        };
        tracing::debug!(%conn, item = %id, nick = %nick, start, len, "requesting");
        actions.push(TransferAction::Send(
            conn,
            encode_frame(&request.format_get(), Encoding::Utf8),
        ));
        if matches!(work, Work::Segment(_)) {
            actions.push(event(DownloadEvent::Started {
                item: id,
                nick,
                start,
                len,
            }));
        }
        if let Some(link) = self.links.get_mut(&conn) {
            link.download = Some(Pending {
                item: id,
                work,
                start,
                len,
                stage: Stage::Requested,
            });
            link.last_activity = self.now;
        }
    }

    /// A parsed command arrived on a Ready connection.
    pub fn on_peer_command(
        &mut self,
        conn: ConnId,
        cmd: PeerCommand,
        share: &ShareIndex,
        hashes: &HashStore,
    ) -> Vec<TransferAction> {
        let mut actions = Vec::new();
        let Some(link) = self.links.get_mut(&conn) else {
            return actions;
        };
        link.last_activity = self.now;
        match cmd {
            PeerCommand::AdcSnd(req) => self.on_adcsnd(conn, req, &mut actions),
            PeerCommand::AdcGet(req) => self.on_adcget(conn, req, share, hashes, &mut actions),
            PeerCommand::MaxedOut => {
                self.abort_download(conn, FailureReason::NoSlots, Penalty::Cooldown, &mut actions);
                self.close_link(conn, &mut actions);
            }
            PeerCommand::Error(msg) if msg.contains(FILE_NOT_AVAILABLE) => {
                self.abort_download(
                    conn,
                    FailureReason::FileNotAvailable,
                    Penalty::Remove,
                    &mut actions,
                );
                self.assign_next(conn, &mut actions);
            }
            PeerCommand::Error(msg) => {
                self.abort_download(conn, FailureReason::Protocol(msg), Penalty::Failure, &mut actions);
                self.close_link(conn, &mut actions);
            }
            PeerCommand::Unknown(name) => {
                tracing::trace!(%conn, command = %name, "ignoring unknown peer command");
            }
            _ => self.violation(conn, "handshake command after handshake", &mut actions),
        }
        actions
    }

    fn violation(&mut self, conn: ConnId, reason: &str, actions: &mut Vec<TransferAction>) {
        tracing::warn!(%conn, reason, "peer protocol violation");
        self.abort_download(
            conn,
            FailureReason::Protocol(reason.to_string()),
            Penalty::Failure,
            actions,
        );
        self.close_link(conn, actions);
    }

    fn close_link(&mut self, conn: ConnId, actions: &mut Vec<TransferAction>) {
        if let Some(link) = self.links.remove(&conn) {
            if link.uploading {
                self.uploads.release(&link.nick);
            }
            actions.push(TransferAction::Close(conn));
        }
    }

    /// Undo the link's in-flight download and charge its source.
    fn abort_download(
        &mut self,
        conn: ConnId,
        reason: FailureReason,
        penalty: Penalty,
        actions: &mut Vec<TransferAction>,
    ) {
        let Some(link) = self.links.get_mut(&conn) else {
            return;
        };
        let Some(pending) = link.download.take() else {
            return;
        };
        link.tree_buf.clear();
        let nick = link.nick.clone();
        let id = pending.item;
        let Some(item) = self.queue.get_mut(&id) else {
            return;
        };
        item.release(&nick);
        match penalty {
            Penalty::Failure => {
                if let Some(s) = item.source_mut(&nick) {
                    s.failed_attempts += 1;
                    s.cooldown_until = self.now + retry_delay(&self.config, s.failed_attempts);
                }
            }
            Penalty::Cooldown => {
                if let Some(s) = item.source_mut(&nick) {
                    s.cooldown_until = self.now + self.config.source_cooldown;
                }
            }
            Penalty::Remove => {
                item.sources.retain(|s| s.nick != nick);
                actions.push(event(QueueEvent::SourceRemoved {
                    item: id,
                    nick: nick.clone(),
                }));
            }
        }
        tracing::debug!(%conn, item = %id, nick = %nick, ?reason, "download aborted");
        actions.push(event(DownloadEvent::Failed {
            item: id,
            nick,
            reason,
        }));
        self.update_stalled(id, actions);
    }

    fn on_adcsnd(&mut self, conn: ConnId, req: TransferRequest, actions: &mut Vec<TransferAction>) {
        let pending = self
            .links
            .get(&conn)
            .and_then(|l| l.download.as_ref())
            .filter(|p| p.stage == Stage::Requested)
            .map(|p| (p.item, p.work, p.start, p.len));
        let Some((id, work, start, len)) = pending else {
            return self.violation(conn, "unsolicited $ADCSND", actions);
        };
        let sink = match work {
            Work::Tree => {
                let ok = req.kind == RequestKind::Tthl
                    && req.len >= HASH_SIZE as i64
                    && req.len <= MAX_TREE_BYTES
                    && req.len % HASH_SIZE as i64 == 0;
                if !ok {
                    return self.violation(conn, "bad tthl reply", actions);
                }
                Sink::Tree { len: req.len as u64 }
            }
            Work::Segment(_) => {
                if req.kind != RequestKind::File || req.start != start || req.len != len as i64 {
                    return self.violation(conn, "$ADCSND does not match request", actions);
                }
                let Some(item) = self.queue.get(&id) else {
                    return self.violation(conn, "item vanished", actions);
                };
                Sink::File {
                    path: item.temp_path(),
                    offset: start,
                    len,
                }
            }
        };
        if let Some(p) = self.links.get_mut(&conn).and_then(|l| l.download.as_mut()) {
            if let Sink::Tree { len } = sink {
                p.len = len;
            }
            p.stage = Stage::Receiving { received: 0 };
        }
        actions.push(TransferAction::Receive { conn, sink });
    }

    /// The host wrote `n` more bytes of the current segment.
    pub fn on_segment_bytes(&mut self, conn: ConnId, n: u64) -> Vec<TransferAction> {
        let mut actions = Vec::new();
        let Some(link) = self.links.get_mut(&conn) else {
            return actions;
        };
        link.last_activity = self.now;
        let Some(p) = link.download.as_mut().filter(|p| p.work != Work::Tree) else {
            return actions;
        };
        let Stage::Receiving { received } = &mut p.stage else {
            return actions;
        };
        *received += n;
        if *received < p.len {
            return actions;
        }
        let Some(pending) = link.download.take() else {
            return actions;
        };
        let nick = link.nick.clone();
        let id = pending.item;
        let mut complete = false;
        if let Some(item) = self.queue.get_mut(&id) {
            item.complete_segment(&nick);
            if let Some(s) = item.source_mut(&nick) {
                s.failed_attempts = 0;
            }
            complete = item.is_complete();
        }
        tracing::debug!(%conn, item = %id, nick = %nick, start = pending.start, len = pending.len, "segment done");
        if complete {
            self.start_verification(id, &mut actions);
        }
        self.assign_next(conn, &mut actions);
        actions
    }

    /// Leaf data for a pending tree fetch.
    pub fn on_tree_bytes(&mut self, conn: ConnId, data: &[u8]) -> Vec<TransferAction> {
        let mut actions = Vec::new();
        let Some(link) = self.links.get_mut(&conn) else {
            return actions;
        };
        link.last_activity = self.now;
        let Some(p) = link.download.as_ref() else {
            return actions;
        };
        if !matches!(p.stage, Stage::Receiving { .. }) || p.work != Work::Tree {
            return actions;
        }
        link.tree_buf.extend_from_slice(data);
        if (link.tree_buf.len() as u64) < p.len {
            return actions;
        }
        let bytes = std::mem::take(&mut link.tree_buf);
        let id = p.item;
        let nick = link.nick.clone();
        let parsed = self.queue.get(&id).and_then(|item| {
            let root = item.tth?;
            TigerTree::from_tthl(item.size, root, &bytes).ok()
        });
        let Some(tree) = parsed else {
            self.violation(conn, "leaf data does not match root", &mut actions);
            return actions;
        };
        let record: HashRecord = Arc::new(tree);
        if let Some(item) = self.queue.get_mut(&id) {
            item.release(&nick);
            item.attach_tree(Arc::clone(&record));
        }
        if let Some(link) = self.links.get_mut(&conn) {
            link.download = None;
        }
        tracing::debug!(%conn, item = %id, nick = %nick, leaves = record.leaves.len(), "tree received");
        actions.push(TransferAction::StoreTree(record));
        self.assign_next(conn, &mut actions);
        actions
    }

    fn on_adcget(
        &mut self,
        conn: ConnId,
        req: TransferRequest,
        share: &ShareIndex,
        hashes: &HashStore,
        actions: &mut Vec<TransferAction>,
    ) {
        let Some(link) = self.links.get(&conn) else {
            return;
        };
        if link.direction != Direction::Upload {
            return self.violation(conn, "$ADCGET on a download connection", actions);
        }
        if link.uploading {
            return self.violation(conn, "$ADCGET while sending", actions);
        }
        let nick = link.nick.clone();
        let Some(upload) = self.resolve_upload(&req, share, hashes) else {
            tracing::debug!(%conn, nick = %nick, request = %req.format_get(), "not shared");
            actions.push(TransferAction::Send(
                conn,
                encode_frame(&nmdc::error(FILE_NOT_AVAILABLE), Encoding::Utf8),
            ));
            return;
        };
        let size = upload.size();
        if req.start > size {
            actions.push(TransferAction::Send(
                conn,
                encode_frame(&nmdc::error("Invalid range"), Encoding::Utf8),
            ));
            return;
        }
        let available = size - req.start;
        let len = if req.len < 0 {
            available
        } else {
            (req.len as u64).min(available)
        };
        if !matches!(upload, Upload::Bytes(_)) {
            let is_list = matches!(upload, Upload::List { .. });
            match self.uploads.request(&nick, size, is_list, 0, self.now) {
                UploadDecision::Granted(kind) => {
                    tracing::debug!(%conn, nick = %nick, ?kind, "upload slot granted");
                }
                UploadDecision::Queued { position } => {
                    tracing::debug!(%conn, nick = %nick, position, "no free upload slot");
                    actions.push(TransferAction::Send(
                        conn,
                        encode_frame(&nmdc::maxed_out(), Encoding::Utf8),
                    ));
                    return;
                }
            }
        }
        if let Some(link) = self.links.get_mut(&conn) {
            link.uploading = true;
        }
        let reply = TransferRequest {
            kind: req.kind,
            identifier: req.identifier,
            start: req.start,
            len: len as i64,
        };
        actions.push(TransferAction::Send(
            conn,
            encode_frame(&reply.format_snd(), Encoding::Utf8),
        ));
        let offset = req.start;
        actions.push(match upload {
            Upload::File { path, .. } => TransferAction::SendFile {
                conn,
                path,
                offset,
                len,
            },
            Upload::List { .. } => TransferAction::SendFileList { conn, offset, len },
            Upload::Bytes(data) => TransferAction::SendBytes {
                conn,
                data: data[offset as usize..(offset + len) as usize].to_vec(),
            },
        });
    }

    fn resolve_upload(&self, req: &TransferRequest, share: &ShareIndex, hashes: &HashStore) -> Option<Upload> {
        let tree_bytes = |root: &TthValue| hashes.get_tree(root).map(|t| Upload::Bytes(t.tthl_bytes()));
        match (req.kind, &req.identifier) {
            (RequestKind::Tthl, Identifier::Tth(root)) => tree_bytes(root),
            (RequestKind::Tthl, Identifier::Path(p)) => share.resolve(p).and_then(|e| e.tth).and_then(|r| tree_bytes(&r)),
            (RequestKind::File, id) if id.is_file_list() => {
                (self.file_list_size > 0).then_some(Upload::List {
                    size: self.file_list_size,
                })
            }
            (RequestKind::File, Identifier::Tth(root)) => share.find_by_tth(root).map(|e| Upload::File {
                path: e.real_path.clone(),
                size: e.size,
            }),
            (RequestKind::File, Identifier::Path(p)) => share.resolve(p).map(|e| Upload::File {
                path: e.real_path.clone(),
                size: e.size,
            }),
        }
    }

    /// The host finished sending what the last `SendFile`/`SendBytes`/`SendFileList` asked for.
    pub fn on_upload_done(&mut self, conn: ConnId) {
        if let Some(link) = self.links.get_mut(&conn) {
            if std::mem::replace(&mut link.uploading, false) {
                self.uploads.release(&link.nick);
            }
        }
    }

    /// The host closed or lost `conn`.
    pub fn on_peer_closed(&mut self, conn: ConnId) -> Vec<TransferAction> {
        let mut actions = Vec::new();
        self.abort_download(conn, FailureReason::Disconnected, Penalty::Failure, &mut actions);
        if let Some(link) = self.links.remove(&conn) {
            if link.uploading {
                self.uploads.release(&link.nick);
            }
        }
        self.schedule_connects(&mut actions);
        actions
    }

    /// A `ConnectSource` for `nick` did not produce a Ready connection.
    pub fn on_connect_failed(&mut self, nick: &str) -> Vec<TransferAction> {
        let mut actions = Vec::new();
        self.dialing.remove(nick);
        for id in self.queue.items_with_source(nick) {
            if let Some(source) = self.queue.get_mut(&id).and_then(|i| i.source_mut(nick)) {
                source.failed_attempts += 1;
                source.cooldown_until = self.now + retry_delay(&self.config, source.failed_attempts);
                tracing::debug!(item = %id, nick, retry_at = source.cooldown_until, "source unreachable");
            }
            actions.push(event(DownloadEvent::Failed {
                item: id,
                nick: nick.to_string(),
                reason: FailureReason::ConnectionFailed,
            }));
            self.update_stalled(id, &mut actions);
        }
        actions
    }

    fn update_stalled(&mut self, id: ItemId, actions: &mut Vec<TransferAction>) {
        let max = self.config.max_source_failures;
        let Some(item) = self.queue.get_mut(&id) else {
            return;
        };
        if !matches!(item.status, ItemStatus::Waiting | ItemStatus::Running) {
            return;
        }
        if item.running.is_empty() && item.tree_pending.is_none() && scheduler::is_stalled(item, max) {
            item.status = ItemStatus::Stalled;
            tracing::info!(item = %id, "download stalled, no usable sources");
            actions.push(event(QueueEvent::Stalled { item: id }));
        }
    }

    fn resume_if_unstalled(&mut self, id: ItemId, actions: &mut Vec<TransferAction>) {
        let max = self.config.max_source_failures;
        let Some(item) = self.queue.get_mut(&id) else {
            return;
        };
        if item.status == ItemStatus::Stalled && !scheduler::is_stalled(item, max) {
            item.status = ItemStatus::Waiting;
            tracing::info!(item = %id, "download resumed");
            actions.push(event(QueueEvent::Resumed { item: id }));
        }
    }

    fn start_verification(&mut self, id: ItemId, actions: &mut Vec<TransferAction>) {
        let Some(item) = self.queue.get_mut(&id) else {
            return;
        };
        let temp = item.temp_path();
        match item.tth {
            Some(root) => {
                item.status = ItemStatus::Verifying;
                actions.push(TransferAction::Verify {
                    item: id,
                    temp,
                    plan: VerifyPlan {
                        size: item.size,
                        root,
                        tree: item.tree.clone(),
                        item_block_size: item.block_size,
                    },
                });
            }
            None => {
                item.status = ItemStatus::Finished;
                actions.push(TransferAction::Finalize {
                    item: id,
                    temp,
                    target: item.target.clone(),
                });
            }
        }
    }

    /// Result of a `Verify` action.
    pub fn on_verified(&mut self, id: ItemId, result: Result<Verification, String>) -> Vec<TransferAction> {
        let mut actions = Vec::new();
        let Some(item) = self.queue.get_mut(&id) else {
            return actions;
        };
        if item.status != ItemStatus::Verifying {
            return actions;
        }
        match result {
            Ok(v) if v.is_ok() => {
                item.status = ItemStatus::Finished;
                tracing::info!(item = %id, "download verified");
                actions.push(TransferAction::Finalize {
                    item: id,
                    temp: item.temp_path(),
                    target: item.target.clone(),
                });
            }
            Ok(v) => {
                let sources = integrity::taint_sources(item, &v.bad_blocks);
                item.status = ItemStatus::Waiting;
                tracing::warn!(item = %id, blocks = ?v.bad_blocks, ?sources, "verification failed");
                actions.push(event(DownloadEvent::Corrupted {
                    item: id,
                    blocks: v.bad_blocks,
                    sources,
                }));
                self.schedule_connects(&mut actions);
            }
            Err(e) => {
                item.status = ItemStatus::Stalled;
                tracing::warn!(item = %id, error = %e, "could not verify download");
                actions.push(event(QueueEvent::Stalled { item: id }));
            }
        }
        actions
    }

    /// Result of a `Finalize` action.
    pub fn on_finalized(&mut self, id: ItemId, result: Result<(), String>) -> Vec<TransferAction> {
        let mut actions = Vec::new();
        match result {
            Ok(()) => {
                let Ok(item) = self.queue.remove(id) else {
                    return actions;
                };
                let nick = item
                    .last_source
                    .clone()
                    .or_else(|| item.contributors.values().last().cloned())
                    .unwrap_or_default();
                tracing::info!(item = %id, target = %item.target.display(), "download finished");
                actions.push(event(DownloadEvent::Finished {
                    item: id,
                    nick,
                    target: item.target.clone(),
                }));
                actions.push(event(QueueEvent::ItemFinished {
                    item: id,
                    target: item.target,
                }));
            }
            Err(e) => {
                if let Some(item) = self.queue.get_mut(&id) {
                    item.status = ItemStatus::Stalled;
                    tracing::warn!(item = %id, error = %e, "could not move download into place");
                    actions.push(event(QueueEvent::Stalled { item: id }));
                }
            }
        }
        actions
    }

    fn schedule_connects(&mut self, actions: &mut Vec<TransferAction>) {
        let limits = self.limits();
        let picks = {
            let links = &self.links;
            let dialing = &self.dialing;
            let busy = |nick: &str| {
                dialing.contains_key(nick)
                    || links
                        .values()
                        .any(|l| l.nick == nick && l.direction == Direction::Download)
            };
            scheduler::sources_to_connect(&self.queue, &limits, self.now, busy)
        };
        for (item, source) in picks {
            tracing::debug!(item = %item, nick = %source.nick, hub = %source.hub, "connecting to source");
            self.dialing.insert(source.nick.clone(), self.now);
            actions.push(TransferAction::ConnectSource {
                nick: source.nick,
                hub: source.hub,
            });
        }
    }

    /// Periodic tick: segment and dial timeouts, upload line expiry, new connections.
    pub fn tick(&mut self) -> Vec<TransferAction> {
        self.now = self.now.saturating_add(1);
        let now = self.now;
        let mut actions = Vec::new();

        let stuck: Vec<ConnId> = self
            .links
            .iter()
            .filter(|(_, l)| {
                l.download.is_some() && now.saturating_sub(l.last_activity) >= self.config.segment_timeout
            })
            .map(|(c, _)| *c)
            .collect();
        for conn in stuck {
            self.abort_download(conn, FailureReason::Timeout, Penalty::Failure, &mut actions);
            self.close_link(conn, &mut actions);
        }

        let late: Vec<String> = self
            .dialing
            .iter()
            .filter(|(_, since)| now.saturating_sub(**since) >= self.config.connect_timeout)
            .map(|(n, _)| n.clone())
            .collect();
        for nick in late {
            actions.extend(self.on_connect_failed(&nick));
        }

        for nick in self.uploads.expire(now) {
            tracing::debug!(nick = %nick, "dropped from upload line");
        }

        // Complete items not yet checked, e.g. restored from disk.
        let ready: Vec<ItemId> = self
            .queue
            .items()
            .filter(|i| i.status == ItemStatus::Waiting && i.is_complete() && i.running.is_empty())
            .map(|i| i.id)
            .collect();
        for id in ready {
            self.start_verification(id, &mut actions);
        }

        self.schedule_connects(&mut actions);
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nmdc::parse_peer_command;

    const BLOCK: u64 = 64 * 1024;

    fn config() -> EngineConfig {
        EngineConfig {
            segment_size: BLOCK,
            ..EngineConfig::default()
        }
    }

    fn all_features() -> Features {
        Features {
            adcget: true,
            tthl: true,
            tthf: true,
            xml_bzlist: true,
            minislots: true,
        }
    }

    fn ready(nick: &str, direction: Direction) -> Negotiated {
        Negotiated {
            nick: nick.to_string(),
            direction,
            features: all_features(),
        }
    }

    fn data(blocks: u64) -> Vec<u8> {
        (0..blocks * BLOCK).map(|i| (i * 7 % 253) as u8).collect()
    }

    fn parse(frame: &[u8]) -> PeerCommand {
        parse_peer_command(&frame[..frame.len() - 1], Encoding::Utf8).unwrap()
    }

    fn events(actions: &[TransferAction]) -> Vec<EngineEvent> {
        actions
            .iter()
            .filter_map(|a| match a {
                TransferAction::Event(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    /// Plays an honest (or lying) remote peer on `conn`: answers requests with `served`
    /// and writes received segments into `disk`. Stops after `segments` segments and
    /// returns everything it did not consume.
    struct Remote<'a> {
        conn: ConnId,
        served: &'a [u8],
        tree: &'a TigerTree,
        segments: usize,
    }

    impl Remote<'_> {
        fn drive(
            &mut self,
            core: &mut TransferCore,
            disk: &mut [u8],
            mut actions: Vec<TransferAction>,
        ) -> Vec<TransferAction> {
            let share = ShareIndex::new();
            let hashes = HashStore::new();
            let mut rest = Vec::new();
            while !actions.is_empty() {
                let mut next = Vec::new();
                for action in actions {
                    match action {
                        TransferAction::Send(c, frame) if c == self.conn && self.segments > 0 => {
                            let PeerCommand::AdcGet(mut req) = parse(&frame) else {
                                rest.push(TransferAction::Send(c, frame));
                                continue;
                            };
                            if req.kind == RequestKind::Tthl {
                                req.len = self.tree.tthl_bytes().len() as i64;
                            }
                            next.extend(core.on_peer_command(c, PeerCommand::AdcSnd(req), &share, &hashes));
                        }
                        TransferAction::Receive {
                            conn,
                            sink: Sink::Tree { .. },
                        } if conn == self.conn => {
                            next.extend(core.on_tree_bytes(conn, &self.tree.tthl_bytes()));
                        }
                        TransferAction::Receive {
                            conn,
                            sink: Sink::File { offset, len, .. },
                        } if conn == self.conn => {
                            let (o, l) = (offset as usize, len as usize);
                            disk[o..o + l].copy_from_slice(&self.served[o..o + l]);
                            self.segments -= 1;
                            next.extend(core.on_segment_bytes(conn, len));
                        }
                        other => rest.push(other),
                    }
                }
                actions = next;
            }
            rest
        }
    }

    fn setup(sources: &[&str], root: TthValue, blocks: u64) -> (TransferCore, ItemId) {
        let mut core = TransferCore::new(config());
        let (id, _) = core
            .queue_download("/dl/f.bin".into(), blocks * BLOCK, Some(root), Priority::Normal)
            .unwrap();
        for nick in sources {
            core.add_source(id, Source::new(nick, "hub:411")).unwrap();
        }
        (core, id)
    }

    #[test]
    fn segments_survive_a_source_leaving() {
        let content = data(3);
        let tree = TigerTree::hash_bytes(&content, BLOCK);
        let (mut core, id) = setup(&["alice", "bob"], tree.root, 3);
        let mut disk = vec![0u8; content.len()];

        // alice fetches the leaves and block 0, then drops while sending block 1.
        let mut alice = Remote {
            conn: ConnId(1),
            served: &content,
            tree: &tree,
            segments: 1,
        };
        let first = core.on_peer_ready(ConnId(1), ready("alice", Direction::Download));
        let expected_tthl = encode_frame(&format!("$ADCGET tthl TTH/{} 0 -1", tree.root), Encoding::Utf8);
        assert!(matches!(&first[0], TransferAction::Send(_, f) if *f == expected_tthl));
        let rest = alice.drive(&mut core, &mut disk, first);
        assert!(rest.iter().any(|a| matches!(a, TransferAction::StoreTree(t) if t.root == tree.root)));
        let item = core.queue().get(&id).unwrap();
        assert!(item.done.get(0));
        assert!(item.running.contains_key("alice"));

        let after_close = core.on_peer_closed(ConnId(1));
        assert!(events(&after_close).contains(&EngineEvent::Download(DownloadEvent::Failed {
            item: id,
            nick: "alice".into(),
            reason: FailureReason::Disconnected,
        })));
        assert!(after_close.iter().any(
            |a| matches!(a, TransferAction::ConnectSource { nick, hub } if nick == "bob" && hub == "hub:411")
        ));
        let item = core.queue().get(&id).unwrap();
        assert!(!item.done.get(1));
        assert!(item.running.is_empty());

        // bob picks up from block 1.
        let mut bob = Remote {
            conn: ConnId(2),
            served: &content,
            tree: &tree,
            segments: usize::MAX,
        };
        let start = core.on_peer_ready(ConnId(2), ready("bob", Direction::Download));
        assert!(events(&start).contains(&EngineEvent::Download(DownloadEvent::Started {
            item: id,
            nick: "bob".into(),
            start: BLOCK,
            len: BLOCK,
        })));
        let rest = bob.drive(&mut core, &mut disk, start);
        let plan = rest
            .iter()
            .find_map(|a| match a {
                TransferAction::Verify { item, temp, plan } if *item == id => {
                    assert_eq!(temp, &PathBuf::from("/dl/f.bin.dctmp"));
                    Some(plan.clone())
                }
                _ => None,
            })
            .expect("verification requested");
        // Nothing left to fetch, so bob's connection is closed.
        assert!(rest.iter().any(|a| matches!(a, TransferAction::Close(ConnId(2)))));

        let verdict = integrity::verify_file(&disk[..], &plan).unwrap();
        assert!(verdict.is_ok());
        assert_eq!(TigerTree::hash_bytes(&disk, BLOCK).root, tree.root);

        let fin = core.on_verified(id, Ok(verdict));
        assert!(matches!(&fin[0], TransferAction::Finalize { target, .. } if target == &PathBuf::from("/dl/f.bin")));
        let done = core.on_finalized(id, Ok(()));
        assert_eq!(
            events(&done),
            vec![
                EngineEvent::Download(DownloadEvent::Finished {
                    item: id,
                    nick: "bob".into(),
                    target: "/dl/f.bin".into(),
                }),
                EngineEvent::Queue(QueueEvent::ItemFinished {
                    item: id,
                    target: "/dl/f.bin".into(),
                }),
            ]
        );
        assert!(core.queue().is_empty());
    }

    #[test]
    fn corrupt_block_is_refetched_from_another_source() {
        let content = data(3);
        let tree = TigerTree::hash_bytes(&content, BLOCK);
        let mut poisoned = content.clone();
        poisoned[(2 * BLOCK + 1) as usize] ^= 0x55;
        let (mut core, id) = setup(&["mallory", "bob"], tree.root, 3);
        let mut disk = vec![0u8; content.len()];

        let mut mallory = Remote {
            conn: ConnId(1),
            served: &poisoned,
            tree: &tree,
            segments: usize::MAX,
        };
        let start = core.on_peer_ready(ConnId(1), ready("mallory", Direction::Download));
        let rest = mallory.drive(&mut core, &mut disk, start);
        let plan = rest
            .iter()
            .find_map(|a| match a {
                TransferAction::Verify { plan, .. } => Some(plan.clone()),
                _ => None,
            })
            .unwrap();
        let verdict = integrity::verify_file(&disk[..], &plan).unwrap();
        assert_eq!(verdict.bad_blocks, vec![2]);

        let out = core.on_verified(id, Ok(verdict));
        assert!(events(&out).contains(&EngineEvent::Download(DownloadEvent::Corrupted {
            item: id,
            blocks: vec![2],
            sources: vec!["mallory".into()],
        })));
        let item = core.queue().get(&id).unwrap();
        assert_eq!(item.done.count(), 2);
        assert_eq!(item.source("mallory").unwrap().taint, 1);
        // Ranking now prefers bob.
        assert!(out
            .iter()
            .any(|a| matches!(a, TransferAction::ConnectSource { nick, .. } if nick == "bob")));

        let mut bob = Remote {
            conn: ConnId(2),
            served: &content,
            tree: &tree,
            segments: usize::MAX,
        };
        let start = core.on_peer_ready(ConnId(2), ready("bob", Direction::Download));
        let rest = bob.drive(&mut core, &mut disk, start);
        let plan = rest
            .iter()
            .find_map(|a| match a {
                TransferAction::Verify { plan, .. } => Some(plan.clone()),
                _ => None,
            })
            .unwrap();
        assert!(integrity::verify_file(&disk[..], &plan).unwrap().is_ok());
    }

    #[test]
    fn maxed_out_cools_source_down() {
        let content = data(2);
        let tree = TigerTree::hash_bytes(&content, BLOCK);
        let (mut core, id) = setup(&["alice"], tree.root, 2);
        core.on_peer_ready(ConnId(1), ready("alice", Direction::Download));
        let out = core.on_peer_command(ConnId(1), PeerCommand::MaxedOut, &ShareIndex::new(), &HashStore::new());
        assert!(out.iter().any(|a| matches!(a, TransferAction::Close(ConnId(1)))));
        assert!(events(&out).iter().any(|e| matches!(
            e,
            EngineEvent::Download(DownloadEvent::Failed { reason: FailureReason::NoSlots, .. })
        )));
        let source = core.queue().get(&id).unwrap().source("alice").unwrap();
        assert_eq!(source.failed_attempts, 0);
        assert_eq!(source.cooldown_until, config().source_cooldown);
        // Cooling down: no dial on the next tick.
        assert!(!core
            .tick()
            .iter()
            .any(|a| matches!(a, TransferAction::ConnectSource { .. })));
    }

    #[test]
    fn file_not_available_drops_source_and_stalls() {
        let content = data(2);
        let tree = TigerTree::hash_bytes(&content, BLOCK);
        let (mut core, id) = setup(&["alice"], tree.root, 2);
        core.on_peer_ready(ConnId(1), ready("alice", Direction::Download));
        let out = core.on_peer_command(
            ConnId(1),
            PeerCommand::Error("File Not Available".into()),
            &ShareIndex::new(),
            &HashStore::new(),
        );
        let evs = events(&out);
        assert!(evs.contains(&EngineEvent::Queue(QueueEvent::SourceRemoved {
            item: id,
            nick: "alice".into(),
        })));
        assert!(evs.contains(&EngineEvent::Queue(QueueEvent::Stalled { item: id })));
        assert_eq!(core.queue().get(&id).unwrap().status, ItemStatus::Stalled);

        let resumed = core.add_source(id, Source::new("bob", "hub:411")).unwrap();
        assert!(events(&resumed).contains(&EngineEvent::Queue(QueueEvent::Resumed { item: id })));
    }

    #[test]
    fn silent_segment_times_out() {
        let content = data(2);
        let tree = TigerTree::hash_bytes(&content, BLOCK);
        let (mut core, id) = setup(&["alice"], tree.root, 2);
        core.on_peer_ready(ConnId(1), ready("alice", Direction::Download));
        let mut closed = false;
        for _ in 0..config().segment_timeout {
            closed |= core
                .tick()
                .iter()
                .any(|a| matches!(a, TransferAction::Close(ConnId(1))));
        }
        assert!(closed);
        let item = core.queue().get(&id).unwrap();
        assert_eq!(item.source("alice").unwrap().failed_attempts, 1);
        assert!(item.tree_pending.is_none());
    }

    #[test]
    fn failed_dials_stall_item() {
        let (mut core, id) = setup(&["alice"], crate::tth::leaf_hash(b"x"), 2);
        let mut stalled = false;
        for _ in 0..config().max_source_failures {
            stalled |= events(&core.on_connect_failed("alice"))
                .contains(&EngineEvent::Queue(QueueEvent::Stalled { item: id }));
        }
        assert!(stalled);
        assert!(!core
            .tick()
            .iter()
            .any(|a| matches!(a, TransferAction::ConnectSource { .. })));
    }

    #[test]
    fn failed_dials_back_off() {
        let (mut core, id) = setup(&["alice"], crate::tth::leaf_hash(b"x"), 2);
        let mut dialed_at = Vec::new();
        for _ in 0..40 {
            let out = core.tick();
            if out
                .iter()
                .any(|a| matches!(a, TransferAction::ConnectSource { nick, .. } if nick == "alice"))
            {
                dialed_at.push(core.now);
                core.on_connect_failed("alice");
            }
        }
        let base = config().reconnect_base;
        assert_eq!(dialed_at, vec![1, 1 + base, 1 + base + 2 * base]);
        assert_eq!(core.queue().get(&id).unwrap().status, ItemStatus::Stalled);
    }

    #[test]
    fn dropped_source_waits_before_redial() {
        let content = data(2);
        let tree = TigerTree::hash_bytes(&content, BLOCK);
        let (mut core, id) = setup(&["alice"], tree.root, 2);
        core.on_peer_ready(ConnId(1), ready("alice", Direction::Download));
        core.on_peer_closed(ConnId(1));
        let source = core.queue().get(&id).unwrap().source("alice").unwrap();
        assert_eq!(source.failed_attempts, 1);
        assert_eq!(source.cooldown_until, config().reconnect_base);
        assert!(!core
            .tick()
            .iter()
            .any(|a| matches!(a, TransferAction::ConnectSource { .. })));
    }

    fn shared(root: TthValue, size: u64) -> ShareIndex {
        let mut share = ShareIndex::new();
        share.add_root("music", "/srv/music".into()).unwrap();
        share.upsert_file("music\\song.mp3".into(), "/srv/music/song.mp3".into(), size, 1);
        assert!(share.set_tth(std::path::Path::new("/srv/music/song.mp3"), size, 1, root));
        share
    }

    #[test]
    fn serves_shared_file_by_tth_and_path() {
        let root = crate::tth::leaf_hash(b"song");
        let share = shared(root, 5000);
        let mut core = TransferCore::new(config());
        core.on_peer_ready(ConnId(7), ready("carol", Direction::Upload));
        let req = TransferRequest {
            kind: RequestKind::File,
            identifier: Identifier::Tth(root),
            start: 1000,
            len: -1,
        };
        let out = core.on_peer_command(ConnId(7), PeerCommand::AdcGet(req), &share, &HashStore::new());
        assert_eq!(parse(match &out[0] {
            TransferAction::Send(_, f) => f,
            other => panic!("unexpected {other:?}"),
        }), PeerCommand::AdcSnd(TransferRequest {
            kind: RequestKind::File,
            identifier: Identifier::Tth(root),
            start: 1000,
            len: 4000,
        }));
        assert!(matches!(
            &out[1],
            TransferAction::SendFile { path, offset: 1000, len: 4000, .. } if path == &PathBuf::from("/srv/music/song.mp3")
        ));
        assert!(core.uploads().has_slot("carol"));
        core.on_upload_done(ConnId(7));
        assert!(!core.uploads().has_slot("carol"));

        let by_path = TransferRequest {
            kind: RequestKind::File,
            identifier: Identifier::Path("Music\\Song.mp3".into()),
            start: 0,
            len: 10,
        };
        let out = core.on_peer_command(ConnId(7), PeerCommand::AdcGet(by_path), &share, &HashStore::new());
        assert!(matches!(&out[1], TransferAction::SendFile { len: 10, .. }));
    }

    #[test]
    fn unknown_file_gets_error_and_full_slots_get_maxed_out() {
        let root = crate::tth::leaf_hash(b"song");
        let share = shared(root, 10 << 20);
        let mut core = TransferCore::new(EngineConfig {
            max_slots: 1,
            mini_slots: 0,
            ..config()
        });
        core.on_peer_ready(ConnId(1), ready("a", Direction::Upload));
        core.on_peer_ready(ConnId(2), ready("b", Direction::Upload));
        let missing = TransferRequest {
            kind: RequestKind::File,
            identifier: Identifier::Path("nope.txt".into()),
            start: 0,
            len: -1,
        };
        let out = core.on_peer_command(ConnId(1), PeerCommand::AdcGet(missing), &share, &HashStore::new());
        assert_eq!(parse(match &out[0] {
            TransferAction::Send(_, f) => f,
            other => panic!("unexpected {other:?}"),
        }), PeerCommand::Error("File Not Available".into()));

        let get = TransferRequest {
            kind: RequestKind::File,
            identifier: Identifier::Tth(root),
            start: 0,
            len: -1,
        };
        core.on_peer_command(ConnId(1), PeerCommand::AdcGet(get.clone()), &share, &HashStore::new());
        let out = core.on_peer_command(ConnId(2), PeerCommand::AdcGet(get), &share, &HashStore::new());
        assert_eq!(parse(match &out[0] {
            TransferAction::Send(_, f) => f,
            other => panic!("unexpected {other:?}"),
        }), PeerCommand::MaxedOut);
    }

    #[test]
    fn serves_leaves_and_file_list() {
        let content = data(2);
        let mut hashes = HashStore::new();
        let record = hashes.add_tree(TigerTree::hash_bytes(&content, BLOCK));
        let mut core = TransferCore::new(config());
        core.set_file_list_size(300);
        core.on_peer_ready(ConnId(3), ready("dave", Direction::Upload));
        let tthl = TransferRequest {
            kind: RequestKind::Tthl,
            identifier: Identifier::Tth(record.root),
            start: 0,
            len: -1,
        };
        let out = core.on_peer_command(ConnId(3), PeerCommand::AdcGet(tthl), &ShareIndex::new(), &hashes);
        assert!(matches!(&out[1], TransferAction::SendBytes { data, .. } if *data == record.tthl_bytes()));
        core.on_upload_done(ConnId(3));

        let list = TransferRequest {
            kind: RequestKind::File,
            identifier: Identifier::Path(nmdc::FILE_LIST_NAME.into()),
            start: 0,
            len: -1,
        };
        let out = core.on_peer_command(ConnId(3), PeerCommand::AdcGet(list), &ShareIndex::new(), &hashes);
        assert!(matches!(&out[1], TransferAction::SendFileList { offset: 0, len: 300, .. }));
    }

    #[test]
    fn remove_item_closes_its_connection() {
        let content = data(2);
        let tree = TigerTree::hash_bytes(&content, BLOCK);
        let (mut core, id) = setup(&["alice"], tree.root, 2);
        core.on_peer_ready(ConnId(1), ready("alice", Direction::Download));
        let out = core.remove_item(id).unwrap();
        assert!(out.iter().any(|a| matches!(a, TransferAction::Close(ConnId(1)))));
        assert!(events(&out).contains(&EngineEvent::Queue(QueueEvent::Removed { item: id })));
        assert!(core.queue().is_empty());
    }

    #[test]
    fn complete_item_restored_from_disk_gets_verified() {
        let mut queue = QueueManager::new();
        let id = queue.add("/dl/r".into(), 10, None, Priority::Normal).unwrap();
        let item = queue.get_mut(&id).unwrap();
        item.start_segment("x", crate::queue::Segment { first: 0, end: 1 });
        item.complete_segment("x");
        let mut core = TransferCore::with_queue(config(), QueueManager::restore(queue.snapshot()));
        let out = core.tick();
        assert!(out.iter().any(|a| matches!(a, TransferAction::Finalize { item, .. } if *item == id)));
    }
}
