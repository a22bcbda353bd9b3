//! Owns the lifecycle of every long-running task a node needs (§4.8): the
//! transports, the gossip/cost/announce tickers, anti-entropy, and the TTL
//! sweep. Nothing outside this module holds a join handle or a cancellation
//! token directly -- callers only ever see `start()`/`stop()`/`health()`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use atmosphere_gossip::{CostCollector, GossipEngine, GradientTable, LocalAnnouncer};
use atmosphere_router::{Dispatcher, Responder};
use atmosphere_store::Store;
use atmosphere_transport::{
    ble, frame::SeenNonces, lan, relay, Frame, TransportCommand, TransportContext, TransportError, TransportEvent, TransportHandle,
};
use atmosphere_types::{MeshId, PeerId, TransportKind, ANTI_ENTROPY_INTERVAL, MAX_HOPS, SEEN_NONCE_CAPACITY, TTL_PEER};
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::NodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthView {
    pub peer_id: PeerId,
    pub mesh_port: Option<u16>,
    pub peer_count: usize,
    pub capability_count: usize,
    pub transports: HashMap<String, bool>,
    pub uptime_secs: u64,
}

struct RunningTransport {
    name: &'static str,
    kind: TransportKind,
    commands: tokio::sync::mpsc::Sender<TransportCommand>,
    up: Arc<AtomicBool>,
}

pub struct Supervisor {
    store: Arc<Store>,
    gradient: Arc<GradientTable>,
    dispatcher: Arc<Dispatcher>,
    responder: Arc<Responder>,
    announcer: Arc<LocalAnnouncer>,
    cost_collector: Arc<CostCollector>,
    gossip_engine: Arc<GossipEngine>,
    ctx: TransportContext,
    listen_port: u16,
    enable_lan: bool,
    relay_addr: Option<std::net::SocketAddr>,
    state: RwLock<NodeState>,
    started_at: RwLock<Option<Instant>>,
    transports: RwLock<Vec<RunningTransport>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    cancel: RwLock<Option<CancellationToken>>,
}

impl Supervisor {
    pub fn new(
        store: Arc<Store>,
        ctx: TransportContext,
        listen_port: u16,
        enable_lan: bool,
        relay_addr: Option<std::net::SocketAddr>,
    ) -> Self {
        let gossip_engine = Arc::new(GossipEngine::new(store.clone()));
        let gradient = gossip_engine.table.clone();
        Self {
            dispatcher: Arc::new(Dispatcher::new(store.clone(), gradient.clone())),
            responder: Arc::new(Responder::new(store.clone())),
            announcer: Arc::new(LocalAnnouncer::new(store.clone())),
            cost_collector: Arc::new(CostCollector::with_best_case_source(store.clone())),
            gossip_engine,
            gradient,
            store,
            ctx,
            listen_port,
            enable_lan,
            relay_addr,
            state: RwLock::new(NodeState::Stopped),
            started_at: RwLock::new(None),
            transports: RwLock::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            cancel: RwLock::new(None),
        }
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn gradient(&self) -> Arc<GradientTable> {
        self.gradient.clone()
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn responder(&self) -> Arc<Responder> {
        self.responder.clone()
    }

    pub fn announcer(&self) -> Arc<LocalAnnouncer> {
        self.announcer.clone()
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), NodeError> {
        {
            let mut state = self.state.write();
            if *state != NodeState::Stopped {
                return Err(NodeError::AlreadyRunning);
            }
            *state = NodeState::Starting;
        }

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();
        let mut transports = Vec::new();

        if self.enable_lan {
            let handle = lan::spawn(self.ctx.clone(), self.listen_port)?;
            transports.push(self.wire_transport(handle, &mut tasks, cancel.clone()));
        }
        if let Some(addr) = self.relay_addr {
            let handle = relay::spawn(self.ctx.clone(), addr)?;
            transports.push(self.wire_transport(handle, &mut tasks, cancel.clone()));
        }
        let ble_handle = ble::spawn(self.ctx.clone())?;
        transports.push(self.wire_transport(ble_handle, &mut tasks, cancel.clone()));

        *self.transports.write() = transports;

        tasks.push(tokio::spawn(self.clone().run_patch_fanout(cancel.clone())));
        tasks.push(tokio::spawn(self.clone().run_anti_entropy(cancel.clone())));
        tasks.push(tokio::spawn(self.clone().run_ttl_sweep(cancel.clone())));
        tasks.push(tokio::spawn(self.gossip_engine.clone().run(cancel.clone())));
        tasks.push(tokio::spawn(self.announcer.clone().run(cancel.clone())));
        tasks.push(tokio::spawn(self.cost_collector.clone().run(cancel.clone())));

        *self.cancel.write() = Some(cancel);
        *self.tasks.lock().await = tasks;
        *self.started_at.write() = Some(Instant::now());
        *self.state.write() = NodeState::Running;
        tracing::info!(peer_id = %self.ctx.local_peer_id, "node is running");
        Ok(())
    }

    pub async fn stop(self: &Arc<Self>) -> Result<(), NodeError> {
        {
            let mut state = self.state.write();
            if *state != NodeState::Running {
                return Err(NodeError::NotRunning);
            }
            *state = NodeState::Stopping;
        }

        if let Some(cancel) = self.cancel.write().take() {
            cancel.cancel();
        }
        for handle in self.transports.write().drain(..) {
            let _ = handle.commands.send(TransportCommand::Stop).await;
        }
        for task in self.tasks.lock().await.drain(..) {
            let _ = task.await;
        }
        if let Err(err) = self.store.flush_watermarks() {
            tracing::warn!(%err, "failed to flush watermarks on stop");
        }
        *self.started_at.write() = None;
        *self.state.write() = NodeState::Stopped;
        tracing::info!(peer_id = %self.ctx.local_peer_id, "node is stopped");
        Ok(())
    }

    /// Submits a `Hello` to every transport immediately rather than waiting
    /// for the next anti-entropy tick. Returns once the request has been
    /// handed to each transport's command channel, not once peers reply (§5).
    pub async fn sync_now(&self) {
        let hello = atmosphere_store::SyncMessage::Hello(self.store.hello_summary());
        if let Ok(frame) = self.encode_frame(&hello) {
            for transport in self.transports.read().iter() {
                let _ = transport.commands.send(TransportCommand::Broadcast { frame: frame.clone() }).await;
            }
        }
    }

    pub fn health(&self) -> HealthView {
        let transports = self
            .transports
            .read()
            .iter()
            .map(|t| (t.name.to_string(), t.up.load(Ordering::SeqCst)))
            .collect();
        HealthView {
            peer_id: self.ctx.local_peer_id,
            mesh_port: if self.enable_lan { Some(self.listen_port) } else { None },
            peer_count: self.store.known_peer_ids().len(),
            capability_count: self.gradient.len(),
            transports,
            uptime_secs: self.started_at.read().map(|t| t.elapsed().as_secs()).unwrap_or(0),
        }
    }

    fn wire_transport(
        self: &Arc<Self>,
        mut handle: TransportHandle,
        tasks: &mut Vec<tokio::task::JoinHandle<()>>,
        cancel: CancellationToken,
    ) -> RunningTransport {
        let name = handle.name;
        let kind = handle.kind;
        let commands = handle.commands.clone();
        let up = Arc::new(AtomicBool::new(false));
        let up_for_task = up.clone();
        let this = self.clone();
        let task_commands = commands.clone();
        tasks.push(tokio::spawn(async move {
            let seen = Arc::new(Mutex::new(SeenNonces::with_capacity(SEEN_NONCE_CAPACITY)));
            loop {
                tokio::select! {
                    event = handle.events.recv() => {
                        let Some(event) = event else { break };
                        this.handle_transport_event(kind, &task_commands, &seen, &up_for_task, event).await;
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        }));
        RunningTransport { name, kind, commands, up }
    }

    async fn handle_transport_event(
        self: &Arc<Self>,
        kind: TransportKind,
        commands: &tokio::sync::mpsc::Sender<TransportCommand>,
        seen: &Arc<Mutex<SeenNonces>>,
        up: &Arc<AtomicBool>,
        event: TransportEvent,
    ) {
        match event {
            TransportEvent::PeerUp { peer_id, kind } => {
                up.store(true, Ordering::SeqCst);
                self.store.record_peer_seen(peer_id, kind);
                let hello = atmosphere_store::SyncMessage::Hello(self.store.hello_summary());
                if let Ok(frame) = self.encode_frame(&hello) {
                    let _ = commands.send(TransportCommand::Send { peer_id, frame }).await;
                }
            }
            TransportEvent::PeerDown { peer_id, .. } => {
                self.store.peer_gone(peer_id);
            }
            TransportEvent::AuthRejected { peer_id } => {
                tracing::warn!(?peer_id, "mesh handshake rejected, connection closed");
            }
            TransportEvent::Inbound { peer_id, frame, .. } => {
                if !seen.lock().await.insert_is_new(frame.nonce) {
                    return;
                }
                self.store.record_peer_seen(peer_id, kind);
                self.handle_inbound_frame(peer_id, &frame, commands).await;
            }
        }
    }

    async fn handle_inbound_frame(self: &Arc<Self>, peer_id: PeerId, frame: &Frame, commands: &tokio::sync::mpsc::Sender<TransportCommand>) {
        let message = match atmosphere_store::SyncMessage::decode(&frame.payload) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(%err, "dropping frame with unparseable payload");
                return;
            }
        };
        match message {
            atmosphere_store::SyncMessage::Hello(summary) => {
                let replies = self.store.answer_hello(peer_id, &summary);
                let mut watermarks: HashMap<String, atmosphere_types::LogicalTimestamp> = HashMap::new();
                for reply in &replies {
                    if let atmosphere_store::SyncMessage::Sync { collection, documents, .. } = reply {
                        if let Some(max_ts) = documents.iter().map(|d| d.ts).max() {
                            watermarks
                                .entry(collection.clone())
                                .and_modify(|existing| *existing = (*existing).max(max_ts))
                                .or_insert(max_ts);
                        }
                    }
                    if let Ok(out_frame) = self.encode_frame(reply) {
                        let _ = commands.send(TransportCommand::Send { peer_id, frame: out_frame }).await;
                    }
                }
                for (collection, ts) in watermarks {
                    self.store.advance_sent_watermark(peer_id, &collection, ts);
                }
            }
            atmosphere_store::SyncMessage::Sync { collection, documents, .. } => {
                for document in documents {
                    if let Err(err) = self.store.apply_remote(&collection, document, peer_id, frame.hops).await {
                        tracing::warn!(%err, collection, "failed to apply synced document");
                    }
                }
            }
            atmosphere_store::SyncMessage::Patch { collection, document } => {
                if let Err(err) = self.store.apply_remote(&collection, document, peer_id, frame.hops).await {
                    tracing::warn!(%err, collection, "failed to apply patched document");
                    return;
                }
                if frame.ttl > 0 {
                    let rebroadcast = frame.for_rebroadcast();
                    let _ = commands.send(TransportCommand::Broadcast { frame: rebroadcast }).await;
                }
            }
            atmosphere_store::SyncMessage::Bye => {
                self.store.peer_gone(peer_id);
            }
        }
    }

    async fn run_patch_fanout(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut patches) = self.store.take_patch_receiver().await else {
            return;
        };
        loop {
            tokio::select! {
                Some((collection, document)) = patches.recv() => {
                    let message = atmosphere_store::SyncMessage::Patch { collection, document };
                    if let Ok(frame) = self.encode_frame(&message) {
                        let senders: Vec<_> = self.transports.read().iter().map(|t| t.commands.clone()).collect();
                        for commands in senders {
                            let _ = commands.send(TransportCommand::Broadcast { frame: frame.clone() }).await;
                        }
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    }

    async fn run_anti_entropy(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(ANTI_ENTROPY_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let hello = atmosphere_store::SyncMessage::Hello(self.store.hello_summary());
                    if let Ok(frame) = self.encode_frame(&hello) {
                        let senders: Vec<_> = self.transports.read().iter().map(|t| t.commands.clone()).collect();
                        for commands in senders {
                            let _ = commands.send(TransportCommand::Broadcast { frame: frame.clone() }).await;
                        }
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    }

    async fn run_ttl_sweep(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(atmosphere_types::EXPIRY_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = Utc::now();
                    for peer in self.store.connected_peers() {
                        let idle = now.signed_duration_since(peer.last_seen);
                        if idle.to_std().map(|d| d >= TTL_PEER).unwrap_or(false) {
                            self.store.peer_gone(peer.peer_id);
                        }
                    }
                    for collection in self.store.known_collections() {
                        let purged = self.store.gc_sweep(&collection);
                        if !purged.is_empty() {
                            tracing::debug!(collection, count = purged.len(), "tombstone GC sweep purged entries");
                        }
                    }
                    self.sweep_stale_requests(now).await;
                    if let Err(err) = self.store.flush_watermarks() {
                        tracing::warn!(%err, "failed to flush watermarks during TTL sweep");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    }

    /// Tombstones `_requests`/`_tool_requests` documents older than
    /// `REQ_EXPIRY`, per §4.7's "writers are responsible for tombstoning
    /// their own request ... after REQ_EXPIRY" -- a backstop for a request
    /// whose writer crashed or restarted before `dispatch` could clean it
    /// up itself.
    async fn sweep_stale_requests(&self, now: chrono::DateTime<Utc>) {
        for collection in ["_requests", "_tool_requests"] {
            for doc in self.store.query(collection) {
                let Some(timestamp) = doc.field("timestamp").and_then(|v| serde_json::from_value::<chrono::DateTime<Utc>>(v.clone()).ok()) else {
                    continue;
                };
                let age = now.signed_duration_since(timestamp);
                if age.to_std().map(|d| d >= atmosphere_types::REQ_EXPIRY).unwrap_or(false) {
                    let _ = self.store.delete(collection, &doc.id).await;
                }
            }
        }
    }

    fn encode_frame(&self, message: &atmosphere_store::SyncMessage) -> Result<Frame, TransportError> {
        let payload = message.encode().map_err(|err| TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, err)))?;
        Ok(Frame::new(self.mesh_id(), MAX_HOPS as u8, payload))
    }

    fn mesh_id(&self) -> MeshId {
        self.ctx.mesh_id
    }
}
