//! Peer transport: listener (incoming), outbound dials, one task per connection running
//! the handshake then the transfer core, the action dispatcher, and the UDP socket that
//! receives search results.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dc_core::integrity::{verify_file, Verification};
use dc_core::nmdc::{parse_hub_command, parse_peer_command, Direction, HubCommand, ParseError};
use dc_core::wire::Chunk;
use dc_core::{
    ConnId, ConnectError, Encoding, FrameBuffer, FrameDecodeError, HandshakeError, HubEvent,
    PeerHandshake, Role, Sink, TransferAction,
};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::engine::Context;

const READ_BUF: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
enum PeerError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("framing: {0}")]
    Frame(#[from] FrameDecodeError),
    #[error("parse: {0}")]
    Parse(#[from] ParseError),
    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("refused: {0}")]
    Refused(#[from] ConnectError),
    #[error("remote closed")]
    Eof,
    #[error("peer stopped reading for {0}s")]
    Stalled(u64),
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// The connection an action must run on, if any.
fn action_conn(action: &TransferAction) -> Option<ConnId> {
    match action {
        TransferAction::Send(conn, _) | TransferAction::Close(conn) => Some(*conn),
        TransferAction::Receive { conn, .. }
        | TransferAction::SendFile { conn, .. }
        | TransferAction::SendBytes { conn, .. }
        | TransferAction::SendFileList { conn, .. } => Some(*conn),
        _ => None,
    }
}

/// Accept peers until cancelled.
pub(crate) async fn run_listener(ctx: Arc<Context>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            a = listener.accept() => a,
        };
        match accepted {
            Ok((stream, addr)) => {
                tracing::debug!(%addr, "peer connected");
                ctx.tasks
                    .spawn(run_peer(ctx.clone(), stream, Role::Incoming, None));
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Dial a peer that asked us to connect (`$ConnectToMe`).
pub(crate) fn connect_out(ctx: &Arc<Context>, address: String, hub: String) {
    let ctx = ctx.clone();
    let tasks = ctx.tasks.clone();
    tasks.spawn(async move {
        let timeout = Duration::from_secs(ctx.config.connect_timeout.max(1));
        let dialed = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            r = tokio::time::timeout(timeout, TcpStream::connect(&address)) => r,
        };
        match dialed {
            Ok(Ok(stream)) => run_peer(ctx, stream, Role::Outgoing, Some(hub)).await,
            Ok(Err(e)) => tracing::debug!(%address, error = %e, "peer dial failed"),
            Err(_) => tracing::debug!(%address, "peer dial timed out"),
        }
    });
}

enum ActiveSink {
    File(File),
    Tree,
}

struct PeerConn {
    ctx: Arc<Context>,
    id: ConnId,
    cancel: CancellationToken,
    /// Longest a single write may wait on the peer.
    stall: Duration,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    buf: FrameBuffer,
    handshake: Option<PeerHandshake>,
    nick: Option<String>,
    want: Direction,
    sink: Option<ActiveSink>,
}

async fn run_peer(ctx: Arc<Context>, stream: TcpStream, role: Role, hub: Option<String>) {
    let _ = stream.set_nodelay(true);
    let id = ctx.registry.lock().await.open(role, hub, ctx.now());
    let (tx, rx) = mpsc::unbounded_channel();
    ctx.conns.lock().await.insert(id, tx);
    let (reader, writer) = stream.into_split();
    let handshake = PeerHandshake::new(
        role,
        &ctx.config.nick,
        Direction::Upload,
        Encoding::Utf8,
        ctx.config.handshake_timeout,
        &mut rand::thread_rng(),
    );
    let mut conn = PeerConn {
        cancel: ctx.cancel.child_token(),
        stall: Duration::from_secs(ctx.config.write_timeout.max(1)),
        ctx: ctx.clone(),
        id,
        reader,
        writer,
        buf: FrameBuffer::new(),
        handshake: Some(handshake),
        nick: None,
        want: Direction::Upload,
        sink: None,
    };
    match conn.run(rx).await {
        Ok(()) | Err(PeerError::Eof) | Err(PeerError::Cancelled) => {
            tracing::debug!(%id, nick = ?conn.nick, "peer closed")
        }
        Err(e) => tracing::debug!(%id, nick = ?conn.nick, error = %e, "peer dropped"),
    }
    let _ = conn.writer.shutdown().await;

    ctx.conns.lock().await.remove(&id);
    ctx.registry.lock().await.close(id);
    let mut core = ctx.core.lock().await;
    let mut actions = core.on_peer_closed(id);
    if conn.handshake.is_some() && conn.want == Direction::Download {
        if let Some(nick) = &conn.nick {
            actions.extend(core.on_connect_failed(nick));
        }
    }
    drop(core);
    ctx.dispatch(actions);
}

impl PeerConn {
    async fn run(&mut self, mut rx: mpsc::UnboundedReceiver<TransferAction>) -> Result<(), PeerError> {
        let cancel = self.cancel.clone();
        let start = tokio::time::Instant::now() + Duration::from_secs(1);
        let mut tick = tokio::time::interval_at(start, Duration::from_secs(1));
        let mut read_buf = vec![0u8; READ_BUF];
        let opening = self
            .handshake
            .as_mut()
            .map(|h| h.start())
            .unwrap_or_default();
        for frame in opening {
            self.send(&frame).await?;
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tick.tick() => {
                    if let Some(h) = self.handshake.as_mut() {
                        h.tick()?;
                    }
                }
                action = rx.recv() => {
                    let Some(action) = action else { return Ok(()) };
                    if self.perform(action).await? == Flow::Close {
                        return Ok(());
                    }
                }
                n = self.reader.read(&mut read_buf) => {
                    let n = n?;
                    if n == 0 {
                        return Err(PeerError::Eof);
                    }
                    self.buf.push(&read_buf[..n]);
                    if self.drain().await? == Flow::Close {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn drain(&mut self) -> Result<Flow, PeerError> {
        while let Some(chunk) = self.buf.next_chunk()? {
            let flow = match chunk {
                Chunk::Command(frame) if frame.is_empty() => Flow::Continue,
                Chunk::Command(frame) => {
                    let cmd = parse_peer_command(&frame, Encoding::Utf8)?;
                    self.on_command(cmd).await?
                }
                Chunk::Raw(bytes) => self.on_raw(bytes).await?,
            };
            if flow == Flow::Close {
                return Ok(Flow::Close);
            }
        }
        Ok(Flow::Continue)
    }

    /// Download if we have queued work from this nick and no download socket to them yet.
    async fn choose_direction(&self, nick: &str) -> Direction {
        let wanted = !self.ctx.core.lock().await.queue().items_with_source(nick).is_empty();
        let busy = self
            .ctx
            .registry
            .lock()
            .await
            .live(nick, Direction::Download)
            .is_some();
        if wanted && !busy {
            Direction::Download
        } else {
            Direction::Upload
        }
    }

    async fn on_command(&mut self, cmd: dc_core::nmdc::PeerCommand) -> Result<Flow, PeerError> {
        let Some(handshake) = self.handshake.as_mut() else {
            let actions = {
                let mut core = self.ctx.core.lock().await;
                let share = self.ctx.share.read().await;
                let hashes = self.ctx.hashes.read().await;
                core.on_peer_command(self.id, cmd, &share, &hashes)
            };
            return self.execute(actions).await;
        };
        let step = handshake.on_command(cmd)?;
        if let Some(nick) = step.identified {
            self.ctx.registry.lock().await.identify(self.id, &nick)?;
            self.want = self.choose_direction(&nick).await;
            if let Some(h) = self.handshake.as_mut() {
                h.set_want(self.want);
            }
            tracing::debug!(id = %self.id, nick = %nick, want = ?self.want, "peer identified");
            self.nick = Some(nick);
        }
        for frame in &step.send {
            self.send(frame).await?;
        }
        let Some(negotiated) = step.ready else {
            return Ok(Flow::Continue);
        };
        self.ctx
            .registry
            .lock()
            .await
            .register(self.id, negotiated.direction)?;
        self.handshake = None;
        tracing::debug!(id = %self.id, nick = %negotiated.nick, direction = ?negotiated.direction, "peer ready");
        let actions = self.ctx.core.lock().await.on_peer_ready(self.id, negotiated);
        self.execute(actions).await
    }

    async fn on_raw(&mut self, bytes: Vec<u8>) -> Result<Flow, PeerError> {
        let finished = self.buf.raw_remaining() == 0;
        let actions = match self.sink.as_mut() {
            Some(ActiveSink::File(file)) => {
                file.write_all(&bytes).await?;
                if finished {
                    file.flush().await?;
                    self.sink = None;
                }
                self.ctx
                    .core
                    .lock()
                    .await
                    .on_segment_bytes(self.id, bytes.len() as u64)
            }
            Some(ActiveSink::Tree) => {
                if finished {
                    self.sink = None;
                }
                self.ctx.core.lock().await.on_tree_bytes(self.id, &bytes)
            }
            None => return Ok(Flow::Continue),
        };
        self.execute(actions).await
    }

    /// Run actions for this connection here, in order; hand the rest to the dispatcher.
    async fn execute(&mut self, actions: Vec<TransferAction>) -> Result<Flow, PeerError> {
        let mut flow = Flow::Continue;
        let mut elsewhere = Vec::new();
        for action in actions {
            if action_conn(&action) == Some(self.id) {
                if flow == Flow::Continue {
                    flow = self.perform(action).await?;
                }
            } else {
                elsewhere.push(action);
            }
        }
        self.ctx.dispatch(elsewhere);
        Ok(flow)
    }

    async fn perform(&mut self, action: TransferAction) -> Result<Flow, PeerError> {
        match action {
            TransferAction::Send(_, frame) => self.send(&frame).await?,
            TransferAction::Close(_) => return Ok(Flow::Close),
            TransferAction::Receive { sink, .. } => match sink {
                Sink::File { path, offset, len } => {
                    let file = open_segment(&path, offset).await?;
                    self.sink = Some(ActiveSink::File(file));
                    self.buf.expect_raw(len);
                }
                Sink::Tree { len } => {
                    self.sink = Some(ActiveSink::Tree);
                    self.buf.expect_raw(len);
                }
            },
            TransferAction::SendFile {
                path, offset, len, ..
            } => {
                let mut file = File::open(&path).await?;
                file.seek(SeekFrom::Start(offset)).await?;
                let mut chunk = vec![0u8; READ_BUF];
                let mut left = len;
                while left > 0 {
                    let want = left.min(chunk.len() as u64) as usize;
                    let n = file.read(&mut chunk[..want]).await?;
                    if n == 0 {
                        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                    }
                    self.send(&chunk[..n]).await?;
                    left -= n as u64;
                }
                tracing::debug!(id = %self.id, path = %path.display(), offset, len, "upload done");
                self.upload_done().await;
            }
            TransferAction::SendBytes { data, .. } => {
                self.send(&data).await?;
                self.upload_done().await;
            }
            TransferAction::SendFileList { offset, len, .. } => {
                let list = self.ctx.file_list.read().await.clone();
                let start = (offset as usize).min(list.len());
                let end = start.saturating_add(len as usize).min(list.len());
                self.send(&list[start..end]).await?;
                self.upload_done().await;
            }
            other => self.ctx.dispatch(vec![other]),
        }
        Ok(Flow::Continue)
    }

    /// Write `bytes` in chunks. Gives up on shutdown, or when one chunk waits longer than
    /// the stall limit because the peer stopped reading.
    async fn send(&mut self, bytes: &[u8]) -> Result<(), PeerError> {
        for part in bytes.chunks(READ_BUF) {
            let written = tokio::select! {
                _ = self.cancel.cancelled() => return Err(PeerError::Cancelled),
                w = tokio::time::timeout(self.stall, self.writer.write_all(part)) => w,
            };
            match written {
                Ok(r) => r?,
                Err(_) => return Err(PeerError::Stalled(self.stall.as_secs())),
            }
        }
        Ok(())
    }

    async fn upload_done(&mut self) {
        let _ = self.writer.flush().await;
        self.ctx.core.lock().await.on_upload_done(self.id);
    }
}

/// Temp file positioned at `offset`; created if missing, never truncated.
async fn open_segment(path: &Path, offset: u64) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await?;
    file.seek(SeekFrom::Start(offset)).await?;
    Ok(file)
}

/// Move a verified temp file to its target; falls back to copy across filesystems.
fn finalize(temp: &Path, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if std::fs::rename(temp, target).is_err() {
        std::fs::copy(temp, target)?;
        std::fs::remove_file(temp)?;
    }
    Ok(())
}

fn verify(temp: &Path, plan: &dc_core::integrity::VerifyPlan) -> io::Result<Verification> {
    let file = std::fs::File::open(temp)?;
    verify_file(io::BufReader::new(file), plan)
}

/// Carry out core actions that are not tied to the calling connection.
pub(crate) async fn run_dispatcher(ctx: Arc<Context>, mut rx: mpsc::UnboundedReceiver<Vec<TransferAction>>) {
    loop {
        let batch = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            b = rx.recv() => match b {
                Some(b) => b,
                None => break,
            },
        };
        for action in batch {
            dispatch_one(&ctx, action).await;
        }
    }
}

async fn dispatch_one(ctx: &Arc<Context>, action: TransferAction) {
    if let Some(conn) = action_conn(&action) {
        if let Some(tx) = ctx.conns.lock().await.get(&conn) {
            let _ = tx.send(action);
        }
        return;
    }
    match action {
        TransferAction::ConnectSource { nick, hub } => {
            let ctx2 = ctx.clone();
            ctx.tasks.spawn(async move {
                if let Err(e) = ctx2.request_connect(&hub, &nick).await {
                    tracing::debug!(nick = %nick, hub = %hub, error = %e, "cannot reach source");
                    let actions = ctx2.core.lock().await.on_connect_failed(&nick);
                    ctx2.dispatch(actions);
                }
            });
        }
        TransferAction::Verify { item, temp, plan } => {
            let ctx2 = ctx.clone();
            ctx.tasks.spawn(async move {
                let result = tokio::task::spawn_blocking(move || verify(&temp, &plan))
                    .await
                    .map_err(|e| e.to_string())
                    .and_then(|r| r.map_err(|e| e.to_string()));
                let actions = ctx2.core.lock().await.on_verified(item, result);
                ctx2.dispatch(actions);
            });
        }
        TransferAction::Finalize { item, temp, target } => {
            let ctx2 = ctx.clone();
            ctx.tasks.spawn(async move {
                let dest = target.clone();
                let result = tokio::task::spawn_blocking(move || finalize(&temp, &dest))
                    .await
                    .map_err(|e| e.to_string())
                    .and_then(|r| r.map_err(|e| e.to_string()));
                if result.is_ok() {
                    tracing::info!(item = %item, target = %target.display(), "download complete");
                }
                let actions = ctx2.core.lock().await.on_finalized(item, result);
                ctx2.dispatch(actions);
            });
        }
        TransferAction::Discard { temp } => match tokio::fs::remove_file(&temp).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %temp.display(), error = %e, "temp file not removed"),
        },
        TransferAction::StoreTree(record) => {
            ctx.hashes.write().await.add_tree((*record).clone());
        }
        TransferAction::Event(event) => ctx.bus.publish(event),
        _ => {}
    }
}

/// Receive `$SR` datagrams sent to us for active searches.
pub(crate) async fn run_udp(ctx: Arc<Context>) {
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        let received = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            r = ctx.udp.recv_from(&mut buf) => r,
        };
        let (n, from) = match received {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(error = %e, "udp receive failed");
                continue;
            }
        };
        for frame in buf[..n].split(|&b| b == dc_core::wire::DELIMITER) {
            if frame.is_empty() {
                continue;
            }
            match parse_hub_command(frame, Encoding::Utf8) {
                Ok(HubCommand::Sr(result)) => ctx.bus.publish(HubEvent::SearchResult {
                    hub: result.hub_address.clone(),
                    result,
                }),
                Ok(_) => tracing::trace!(%from, "ignoring udp datagram"),
                Err(e) => tracing::debug!(%from, error = %e, "bad udp search result"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalize_moves_into_new_directory() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("a.bin.dctmp");
        std::fs::write(&temp, b"data").unwrap();
        let target = dir.path().join("sub/a.bin");
        finalize(&temp, &target).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"data");
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn segment_writes_keep_other_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.dctmp");
        let mut f = open_segment(&path, 4).await.unwrap();
        f.write_all(b"5678").await.unwrap();
        f.flush().await.unwrap();
        let mut f = open_segment(&path, 0).await.unwrap();
        f.write_all(b"1234").await.unwrap();
        f.flush().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"12345678");
    }

    #[test]
    fn connection_actions_are_routed_to_their_socket() {
        assert_eq!(action_conn(&TransferAction::Close(ConnId(3))), Some(ConnId(3)));
        assert_eq!(
            action_conn(&TransferAction::Discard {
                temp: PathBuf::from("t")
            }),
            None
        );
    }
}
