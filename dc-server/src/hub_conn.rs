//! One task per hub: owns the socket and the session, feeds it frames and ticks, and
//! carries out the actions it returns.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dc_core::connection::ConnectError;
use dc_core::hub::{SearchError, SessionError};
use dc_core::wire::Chunk;
use dc_core::{FrameBuffer, FrameDecodeError, HubAction, HubSession, HubSettings, SearchQuery};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::engine::Context;
use crate::transport;

type Reply<E> = oneshot::Sender<Result<(), E>>;

/// Requests from the engine to a hub task.
pub(crate) enum HubRequest {
    Search(SearchQuery, Reply<SearchError>),
    Chat(String, Reply<SessionError>),
    Private {
        to: String,
        text: String,
        reply: Reply<SessionError>,
    },
    ConnectTo(String, Reply<ConnectError>),
    ShareInfo { size: u64, free: u32, total: u32 },
    Leave,
}

pub(crate) struct HubHandle {
    pub tx: mpsc::UnboundedSender<HubRequest>,
}

#[derive(Default)]
struct Socket {
    reader: Option<OwnedReadHalf>,
    writer: Option<OwnedWriteHalf>,
    buf: FrameBuffer,
}

impl Socket {
    fn close(&mut self) {
        self.reader = None;
        self.writer = None;
        self.buf = FrameBuffer::new();
    }
}

async fn read_some(reader: &mut Option<OwnedReadHalf>, buf: &mut [u8]) -> std::io::Result<usize> {
    match reader {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Reply to the caller and pass on the session's actions, if any.
fn answer<E>(result: Result<Vec<HubAction>, E>, reply: Reply<E>) -> Vec<HubAction> {
    match result {
        Ok(actions) => {
            let _ = reply.send(Ok(()));
            actions
        }
        Err(e) => {
            let _ = reply.send(Err(e));
            Vec::new()
        }
    }
}

struct HubTask {
    ctx: Arc<Context>,
    session: HubSession,
    socket: Socket,
}

pub(crate) async fn run_hub(ctx: Arc<Context>, settings: HubSettings, mut rx: mpsc::UnboundedReceiver<HubRequest>) {
    let cancel = ctx.cancel.child_token();
    let address = settings.address.clone();
    let mut session = HubSession::new(settings, ctx.config.clone());
    let (free, total) = {
        let core = ctx.core.lock().await;
        (core.uploads().free_slots(), core.uploads().total_slots())
    };
    let size = ctx.share.read().await.share_size();
    session.set_share_info(size, free, total);

    let mut task = HubTask {
        ctx,
        session,
        socket: Socket::default(),
    };
    tracing::info!(hub = %address, "joining hub");
    let mut actions = task.session.join();
    let start = tokio::time::Instant::now() + Duration::from_secs(1);
    let mut tick = tokio::time::interval_at(start, Duration::from_secs(1));
    let mut read_buf = vec![0u8; 16 * 1024];
    loop {
        task.perform(actions, &cancel).await;
        actions = tokio::select! {
            _ = cancel.cancelled() => {
                let bye = task.session.leave();
                task.perform(bye, &cancel).await;
                break;
            }
            _ = tick.tick() => task.session.tick(),
            request = rx.recv() => match request {
                None | Some(HubRequest::Leave) => {
                    let bye = task.session.leave();
                    task.perform(bye, &cancel).await;
                    break;
                }
                Some(request) => task.handle(request),
            },
            n = read_some(&mut task.socket.reader, &mut read_buf) => match n {
                Ok(0) => {
                    task.socket.close();
                    task.session.on_disconnected("connection closed by hub")
                }
                Ok(n) => {
                    task.socket.buf.push(&read_buf[..n]);
                    task.drain().await
                }
                Err(e) => {
                    task.socket.close();
                    task.session.on_disconnected(&e.to_string())
                }
            },
        };
    }
    task.socket.close();
    tracing::info!(hub = %address, "left hub");
}

impl HubTask {
    fn handle(&mut self, request: HubRequest) -> Vec<HubAction> {
        match request {
            HubRequest::Search(query, reply) => answer(self.session.search(&query), reply),
            HubRequest::Chat(text, reply) => answer(self.session.send_chat(&text), reply),
            HubRequest::Private { to, text, reply } => {
                answer(self.session.send_private(&to, &text), reply)
            }
            HubRequest::ConnectTo(nick, reply) => answer(self.session.connect_to(&nick), reply),
            HubRequest::ShareInfo { size, free, total } => {
                self.session.set_share_info(size, free, total)
            }
            HubRequest::Leave => self.session.leave(),
        }
    }

    /// Feed every complete frame to the session.
    async fn drain(&mut self) -> Vec<HubAction> {
        let mut actions = Vec::new();
        loop {
            match self.socket.buf.next_chunk() {
                Ok(Some(Chunk::Command(frame))) => {
                    let share = self.ctx.share.read().await;
                    actions.extend(self.session.on_frame(&frame, &share));
                }
                Ok(Some(Chunk::Raw(_))) => {}
                Ok(None) => break,
                Err(FrameDecodeError::TooLarge) => {
                    actions.extend(self.session.on_protocol_violation("frame too large"));
                    break;
                }
                Err(FrameDecodeError::NeedMore) => break,
            }
        }
        actions
    }

    async fn perform(&mut self, actions: Vec<HubAction>, cancel: &CancellationToken) {
        let address = self.session.address().to_string();
        let mut queue: VecDeque<HubAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                HubAction::Connect(target) => {
                    let timeout = Duration::from_secs(self.ctx.config.login_timeout.max(1));
                    let dialed = tokio::select! {
                        _ = cancel.cancelled() => return,
                        r = tokio::time::timeout(timeout, TcpStream::connect(&target)) => r,
                    };
                    let more = match dialed {
                        Ok(Ok(stream)) => {
                            let _ = stream.set_nodelay(true);
                            let (r, w) = stream.into_split();
                            self.socket.close();
                            self.socket.reader = Some(r);
                            self.socket.writer = Some(w);
                            tracing::debug!(hub = %address, "connected");
                            self.session.on_connected()
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(hub = %address, error = %e, "hub connect failed");
                            self.session.on_disconnected(&e.to_string())
                        }
                        Err(_) => {
                            tracing::warn!(hub = %address, "hub connect timed out");
                            self.session.on_disconnected("connect timed out")
                        }
                    };
                    queue.extend(more);
                }
                HubAction::Send(frame) => {
                    let Some(writer) = self.socket.writer.as_mut() else {
                        continue;
                    };
                    let stall = Duration::from_secs(self.ctx.config.write_timeout.max(1));
                    let written = tokio::select! {
                        _ = cancel.cancelled() => {
                            self.socket.close();
                            return;
                        }
                        w = tokio::time::timeout(stall, writer.write_all(&frame)) => w,
                    };
                    let failure = match written {
                        Ok(Ok(())) => continue,
                        Ok(Err(e)) => e.to_string(),
                        Err(_) => format!("hub stopped reading for {}s", stall.as_secs()),
                    };
                    tracing::warn!(hub = %address, reason = %failure, "hub write failed");
                    self.socket.close();
                    queue.extend(self.session.on_disconnected(&failure));
                }
                HubAction::SendUdp { address: to, frame } => {
                    if let Err(e) = self.ctx.udp.send_to(&frame, &to).await {
                        tracing::debug!(hub = %address, to = %to, error = %e, "udp search result not sent");
                    }
                }
                HubAction::ConnectToPeer { address: peer } => {
                    transport::connect_out(&self.ctx, peer, address.clone());
                }
                HubAction::ExpectPeer { nick } => {
                    let now = self.ctx.now();
                    self.ctx.registry.lock().await.expect(&nick, &address, now);
                }
                HubAction::Close => {
                    if let Some(w) = self.socket.writer.as_mut() {
                        let _ = w.shutdown().await;
                    }
                    self.socket.close();
                }
                HubAction::Event(event) => self.ctx.bus.publish(event),
            }
        }
    }
}
