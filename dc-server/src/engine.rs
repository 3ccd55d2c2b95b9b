//! The engine context: owns every subsystem, starts the tasks, and tears them down.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dc_core::connection::ConnectError;
use dc_core::hub::{SearchError, SessionError};
use dc_core::queue::QueueError;
use dc_core::share::ShareError;
use dc_core::{
    filelist, EngineConfig, EngineEvent, HashStore, HubSettings, ItemId, PeerRegistry, Priority,
    QueueManager, QueueSnapshot, SearchQuery, ShareIndex, Source, TransferAction, TransferCore,
    TthValue,
};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, oneshot, Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::Config;
use crate::events::EventBus;
use crate::hub_conn::{self, HubHandle, HubRequest};
use crate::persist::StateDir;
use crate::share_scan::{self, ScanReport};
use crate::{hashing, transport};

/// Queue flush interval, in ticks.
const FLUSH_EVERY: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine is shut down")]
    ShutDown,
    #[error("not joined to hub {0}")]
    UnknownHub(String),
    #[error("hub {0} session ended")]
    HubGone(String),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Share(#[from] ShareError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// State shared by every task. Lock order: core, registry, share, hashes.
pub(crate) struct Context {
    pub config: EngineConfig,
    pub download_dir: PathBuf,
    /// `None` when the data directory is unusable; state then lives in memory only.
    pub state: Option<StateDir>,
    pub core: Mutex<TransferCore>,
    pub registry: Mutex<PeerRegistry>,
    pub share: RwLock<ShareIndex>,
    pub hashes: RwLock<HashStore>,
    pub bus: EventBus,
    pub cid: String,
    /// Current `files.xml.bz2`.
    pub file_list: RwLock<Arc<Vec<u8>>>,
    pub share_dirty: AtomicBool,
    pub hash_wake: Notify,
    pub conns: Mutex<HashMap<dc_core::ConnId, mpsc::UnboundedSender<TransferAction>>>,
    pub hubs: Mutex<HashMap<String, HubHandle>>,
    pub udp: Arc<UdpSocket>,
    pub actions: mpsc::UnboundedSender<Vec<TransferAction>>,
    pub cancel: CancellationToken,
    pub tasks: TaskTracker,
    clock: AtomicU64,
}

impl Context {
    /// Engine ticks since startup.
    pub fn now(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }

    /// Hand core actions to the dispatcher.
    pub fn dispatch(&self, actions: Vec<TransferAction>) {
        if !actions.is_empty() {
            let _ = self.actions.send(actions);
        }
    }

    /// Ask the hub `nick` was found on to get them to connect.
    pub async fn request_connect(&self, hub: &str, nick: &str) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.hub_request(hub, HubRequest::ConnectTo(nick.to_string(), reply))
            .await?;
        rx.await
            .map_err(|_| EngineError::HubGone(hub.to_string()))??;
        Ok(())
    }

    pub async fn hub_request(&self, hub: &str, request: HubRequest) -> Result<(), EngineError> {
        let hubs = self.hubs.lock().await;
        let handle = hubs
            .get(hub)
            .ok_or_else(|| EngineError::UnknownHub(hub.to_string()))?;
        handle
            .tx
            .send(request)
            .map_err(|_| EngineError::HubGone(hub.to_string()))
    }

    /// Rebuild the file list after the share changed.
    async fn refresh_file_list(&self) {
        let bytes = {
            let share = self.share.read().await;
            filelist::generate(&share, &self.cid)
        };
        match bytes {
            Ok(bytes) => {
                tracing::debug!(size = bytes.len(), "file list rebuilt");
                self.core.lock().await.set_file_list_size(bytes.len() as u64);
                *self.file_list.write().await = Arc::new(bytes);
            }
            Err(e) => tracing::warn!(error = %e, "file list generation failed"),
        }
    }

    async fn share_info(&self) -> (u64, u32, u32) {
        let (free, total) = {
            let core = self.core.lock().await;
            (core.uploads().free_slots(), core.uploads().total_slots())
        };
        (self.share.read().await.share_size(), free, total)
    }

    async fn flush_queue(&self, force: bool) {
        let snapshot = {
            let mut core = self.core.lock().await;
            if !core.take_queue_dirty() && !force {
                return;
            }
            core.queue_snapshot()
        };
        let Some(state) = self.state.clone() else {
            return;
        };
        let saved = tokio::task::spawn_blocking(move || state.save_queue(&snapshot)).await;
        match saved {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "queue not saved"),
            Err(e) => tracing::warn!(error = %e, "queue save task failed"),
        }
    }
}

/// Running engine. Dropping it without [`Engine::shutdown`] leaves the tasks to the runtime.
pub struct Engine {
    ctx: Arc<Context>,
    shut_down: AtomicBool,
    shutdown_lock: Mutex<()>,
}

async fn bind_tcp(port: u16) -> io::Result<TcpListener> {
    TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await
}

async fn bind_udp(port: u16) -> io::Result<UdpSocket> {
    UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port))).await
}

impl Engine {
    /// Load persisted state, bind sockets, start the tasks, scan shares and join the
    /// configured hubs. `progress` gets a short label for each startup step.
    pub async fn startup(config: Config, progress: impl Fn(&str)) -> Result<Engine, EngineError> {
        let mut engine_config = config.engine_config();
        progress("loading state");
        let state = match std::fs::create_dir_all(&config.data_dir) {
            Ok(()) => Some(StateDir::new(&config.data_dir)),
            Err(e) => {
                tracing::warn!(dir = %config.data_dir.display(), error = %e, "data directory unusable, state will not be saved");
                None
            }
        };
        if let Err(e) = std::fs::create_dir_all(&config.download_dir) {
            tracing::warn!(dir = %config.download_dir.display(), error = %e, "download directory unusable");
        }

        let (queue, hashes, mut share) = match &state {
            Some(state) => (
                state.load_queue().map(QueueManager::restore).unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "starting with an empty queue");
                    QueueManager::new()
                }),
                state.load_hashes().unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "starting with an empty hash store");
                    HashStore::new()
                }),
                state.load_share().map(ShareIndex::restore).unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "starting with an empty share");
                    ShareIndex::new()
                }),
            ),
            None => (QueueManager::new(), HashStore::new(), ShareIndex::new()),
        };
        for root in &config.shares {
            if let Err(e) = share_scan::ensure_root(&mut share, &root.name, &root.path) {
                tracing::warn!(name = %root.name, error = %e, "share root skipped");
            }
        }

        progress("binding sockets");
        let listener = match bind_tcp(engine_config.tcp_port).await {
            Ok(l) => {
                if let Ok(addr) = l.local_addr() {
                    engine_config.tcp_port = addr.port();
                }
                tracing::info!(port = engine_config.tcp_port, "listening for peers");
                Some(l)
            }
            Err(e) => {
                tracing::warn!(port = engine_config.tcp_port, error = %e, "peer listener unavailable, running passive");
                engine_config.external_ip = None;
                None
            }
        };
        let udp = match bind_udp(engine_config.udp_port).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(port = engine_config.udp_port, error = %e, "search port unavailable, running passive");
                engine_config.external_ip = None;
                bind_udp(0).await?
            }
        };
        if let Ok(addr) = udp.local_addr() {
            engine_config.udp_port = addr.port();
        }

        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(Context {
            core: Mutex::new(TransferCore::with_queue(engine_config.clone(), queue)),
            registry: Mutex::new(PeerRegistry::new(engine_config.expect_timeout)),
            config: engine_config,
            download_dir: config.download_dir.clone(),
            share: RwLock::new(share),
            hashes: RwLock::new(hashes),
            bus: EventBus::new(),
            cid: filelist::make_cid(&mut rand::thread_rng()),
            file_list: RwLock::new(Arc::new(Vec::new())),
            share_dirty: AtomicBool::new(false),
            hash_wake: Notify::new(),
            conns: Mutex::new(HashMap::new()),
            hubs: Mutex::new(HashMap::new()),
            udp: Arc::new(udp),
            actions: actions_tx,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            clock: AtomicU64::new(0),
            state,
        });
        ctx.refresh_file_list().await;

        progress("starting tasks");
        ctx.tasks
            .spawn(transport::run_dispatcher(ctx.clone(), actions_rx));
        if let Some(listener) = listener {
            ctx.tasks.spawn(transport::run_listener(ctx.clone(), listener));
        }
        ctx.tasks.spawn(transport::run_udp(ctx.clone()));
        ctx.tasks.spawn(hashing::run(ctx.clone()));
        ctx.tasks.spawn(run_timer(ctx.clone()));

        let engine = Engine {
            ctx,
            shut_down: AtomicBool::new(false),
            shutdown_lock: Mutex::new(()),
        };

        progress("scanning shares");
        let scan_ctx = engine.ctx.clone();
        engine.ctx.tasks.spawn(async move {
            if let Err(e) = rescan(&scan_ctx).await {
                tracing::warn!(error = %e, "share scan failed");
            }
        });

        progress("joining hubs");
        for hub in config.hubs {
            engine.join_hub(hub).await?;
        }
        progress("ready");
        Ok(engine)
    }

    /// Leave hubs, stop every task, close sockets and persist state. Later calls return
    /// at once.
    pub async fn shutdown(&self) {
        let _guard = self.shutdown_lock.lock().await;
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("shutting down");
        let ctx = &self.ctx;
        for (_, hub) in ctx.hubs.lock().await.drain() {
            let _ = hub.tx.send(HubRequest::Leave);
        }
        ctx.cancel.cancel();
        ctx.tasks.close();
        ctx.tasks.wait().await;
        ctx.conns.lock().await.clear();
        ctx.bus.close();

        ctx.flush_queue(true).await;
        if let Some(state) = &ctx.state {
            let share = ctx.share.read().await.snapshot();
            if let Err(e) = state.save_share(&share) {
                tracing::warn!(error = %e, "share not saved");
            }
            if let Err(e) = state.save_hashes(&*ctx.hashes.read().await) {
                tracing::warn!(error = %e, "hash store not saved");
            }
        }
        tracing::info!("shutdown complete");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn live(&self) -> Result<&Arc<Context>, EngineError> {
        if self.is_shut_down() {
            return Err(EngineError::ShutDown);
        }
        Ok(&self.ctx)
    }

    pub fn events(&self) -> &EventBus {
        &self.ctx.bus
    }

    /// Effective tunables (ports after binding, passive if the listener failed).
    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    /// Start a session; joining a hub twice is a no-op.
    pub async fn join_hub(&self, settings: HubSettings) -> Result<(), EngineError> {
        let ctx = self.live()?;
        let mut hubs = ctx.hubs.lock().await;
        if hubs.contains_key(&settings.address) {
            return Ok(());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let address = settings.address.clone();
        ctx.tasks
            .spawn(hub_conn::run_hub(ctx.clone(), settings, rx));
        hubs.insert(address, HubHandle { tx });
        Ok(())
    }

    pub async fn leave_hub(&self, address: &str) -> Result<(), EngineError> {
        let ctx = self.live()?;
        let handle = ctx
            .hubs
            .lock()
            .await
            .remove(address)
            .ok_or_else(|| EngineError::UnknownHub(address.to_string()))?;
        let _ = handle.tx.send(HubRequest::Leave);
        Ok(())
    }

    pub async fn hubs(&self) -> Vec<String> {
        let mut out: Vec<String> = self.ctx.hubs.lock().await.keys().cloned().collect();
        out.sort();
        out
    }

    /// Search one hub, or every joined hub when `hub` is `None`. Returns how many hubs
    /// sent it; fails only if none did.
    pub async fn search(&self, hub: Option<&str>, query: &SearchQuery) -> Result<usize, EngineError> {
        let ctx = self.live()?;
        let targets = match hub {
            Some(h) => vec![h.to_string()],
            None => self.hubs().await,
        };
        let mut sent = 0;
        let mut last_err = None;
        for address in targets {
            let (reply, rx) = oneshot::channel();
            let outcome = match ctx
                .hub_request(&address, HubRequest::Search(query.clone(), reply))
                .await
            {
                Ok(()) => rx
                    .await
                    .map_err(|_| EngineError::HubGone(address.clone()))
                    .and_then(|r| r.map_err(EngineError::from)),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => sent += 1,
                Err(e) => {
                    tracing::debug!(hub = %address, error = %e, "search not sent");
                    last_err = Some(e);
                }
            }
        }
        match (sent, last_err) {
            (0, Some(e)) => Err(e),
            (n, _) => Ok(n),
        }
    }

    /// Main chat, or a private message when `to` is set.
    pub async fn send_chat(&self, hub: &str, to: Option<&str>, text: &str) -> Result<(), EngineError> {
        let ctx = self.live()?;
        let (reply, rx) = oneshot::channel();
        let request = match to {
            Some(to) => HubRequest::Private {
                to: to.to_string(),
                text: text.to_string(),
                reply,
            },
            None => HubRequest::Chat(text.to_string(), reply),
        };
        ctx.hub_request(hub, request).await?;
        rx.await.map_err(|_| EngineError::HubGone(hub.to_string()))??;
        Ok(())
    }

    /// Queue a download. A relative `target` lands under the download directory.
    pub async fn queue_download(
        &self,
        target: PathBuf,
        size: u64,
        tth: Option<TthValue>,
        priority: Priority,
    ) -> Result<ItemId, EngineError> {
        let ctx = self.live()?;
        let target = if target.is_relative() {
            ctx.download_dir.join(target)
        } else {
            target
        };
        let (id, actions) = {
            let mut core = ctx.core.lock().await;
            let (id, mut actions) = core.queue_download(target, size, tth, priority)?;
            if let Some(root) = tth {
                if let Some(tree) = ctx.hashes.read().await.get_tree(&root) {
                    core.attach_tree(tree);
                }
            }
            (id, actions)
        };
        ctx.dispatch(actions);
        Ok(id)
    }

    pub async fn add_source(&self, item: ItemId, source: Source) -> Result<(), EngineError> {
        let ctx = self.live()?;
        let actions = ctx.core.lock().await.add_source(item, source)?;
        ctx.dispatch(actions);
        Ok(())
    }

    pub async fn remove_source(&self, item: ItemId, nick: &str) -> Result<(), EngineError> {
        let ctx = self.live()?;
        let actions = ctx.core.lock().await.remove_source(item, nick)?;
        ctx.dispatch(actions);
        Ok(())
    }

    pub async fn remove_item(&self, item: ItemId) -> Result<(), EngineError> {
        let ctx = self.live()?;
        let actions = ctx.core.lock().await.remove_item(item)?;
        ctx.dispatch(actions);
        Ok(())
    }

    pub async fn set_priority(&self, item: ItemId, priority: Priority) -> Result<(), EngineError> {
        let ctx = self.live()?;
        let actions = ctx.core.lock().await.set_priority(item, priority)?;
        ctx.dispatch(actions);
        Ok(())
    }

    pub async fn queue_snapshot(&self) -> QueueSnapshot {
        self.ctx.core.lock().await.queue_snapshot()
    }

    /// Walk every share root again; changed files go back to the hasher.
    pub async fn rescan_share(&self) -> Result<ScanReport, EngineError> {
        let ctx = self.live()?;
        rescan(ctx).await
    }

    pub async fn add_share(&self, name: &str, path: PathBuf) -> Result<ScanReport, EngineError> {
        let ctx = self.live()?;
        ctx.share.write().await.add_root(name, path)?;
        rescan(ctx).await
    }
}

/// Walk all roots on the blocking pool and merge the results.
pub(crate) async fn rescan(ctx: &Arc<Context>) -> Result<ScanReport, EngineError> {
    let roots: Vec<(String, PathBuf)> = ctx
        .share
        .read()
        .await
        .roots()
        .map(|(n, p)| (n.to_string(), p.to_path_buf()))
        .collect();
    let mut total = ScanReport::default();
    for (name, path) in roots {
        let walk_name = name.clone();
        let found = tokio::task::spawn_blocking(move || share_scan::walk(&walk_name, &path))
            .await
            .map_err(io::Error::other)?;
        let found = match found {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(root = %name, error = %e, "share root unreadable");
                continue;
            }
        };
        let report = {
            let mut share = ctx.share.write().await;
            let mut hashes = ctx.hashes.write().await;
            share_scan::apply(&mut share, &mut hashes, &name, found)
        };
        for (path, root) in &report.cached {
            ctx.bus.publish(dc_core::HashEvent::LoadedFromCache {
                path: path.clone(),
                root: *root,
            });
        }
        tracing::info!(root = %name, added = report.added, changed = report.changed, removed = report.removed, queued = report.queued, "share scanned");
        total.merge(report);
    }
    ctx.share_dirty.store(true, Ordering::Release);
    ctx.hash_wake.notify_one();
    Ok(total)
}

/// One tick per second: core timers, expectations, timer event, share info and
/// periodic queue flush.
async fn run_timer(ctx: Arc<Context>) {
    let start = tokio::time::Instant::now() + Duration::from_secs(1);
    let mut interval = tokio::time::interval_at(start, Duration::from_secs(1));
    let mut last_info = None;
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let now = ctx.clock.fetch_add(1, Ordering::Relaxed) + 1;
        let actions = ctx.core.lock().await.tick();
        ctx.dispatch(actions);
        for nick in ctx.registry.lock().await.expire(now) {
            tracing::debug!(nick = %nick, "expected connection never arrived");
        }
        ctx.bus.publish(EngineEvent::Timer(now));

        if ctx.share_dirty.swap(false, Ordering::AcqRel) {
            ctx.refresh_file_list().await;
        }
        let info = ctx.share_info().await;
        if last_info != Some(info) {
            last_info = Some(info);
            let (size, free, total) = info;
            for hub in ctx.hubs.lock().await.values() {
                let _ = hub.tx.send(HubRequest::ShareInfo { size, free, total });
            }
        }
        if now % FLUSH_EVERY == 0 {
            ctx.flush_queue(false).await;
        }
    }
}

/// Idempotent start/stop around one [`Engine`].
pub struct ServerManager {
    config: Config,
    engine: Mutex<Option<Arc<Engine>>>,
}

impl ServerManager {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            engine: Mutex::new(None),
        }
    }

    /// Start the engine; already running is success.
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut slot = self.engine.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        let engine = Engine::startup(self.config.clone(), |step| {
            tracing::debug!(step, "startup");
        })
        .await?;
        *slot = Some(Arc::new(engine));
        Ok(())
    }

    /// Stop the engine; already stopped is success.
    pub async fn stop(&self) {
        let engine = self.engine.lock().await.take();
        if let Some(engine) = engine {
            engine.shutdown().await;
        }
    }

    pub async fn restart(&self) -> Result<(), EngineError> {
        self.stop().await;
        self.start().await
    }

    pub async fn is_running(&self) -> bool {
        self.engine.lock().await.is_some()
    }

    pub async fn engine(&self) -> Option<Arc<Engine>> {
        self.engine.lock().await.clone()
    }
}
