//! The host-facing `Node` API (§6): the single type an embedding application
//! talks to. Everything here is a thin pass-through to the store/gossip/router
//! crates through the `Supervisor` -- this module's only job is to own the
//! bootstrap order and present one coherent surface.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use atmosphere_crypto::{mesh_store, NodeIdentity};
use atmosphere_gossip::CapabilitySpec;
use atmosphere_router::{Constraints, RouteDecision};
use atmosphere_store::{ObserverId, ObserverReceiver, Store, StoreError};
use atmosphere_types::{Document, InviteToken, MeshCredentials, NodeCostFactors, PeerEntry, PeerId, TransportKind};
use chrono::Utc;

use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::supervisor::{HealthView, NodeState, Supervisor};

/// A running (or not-yet-started) Atmosphere node: one identity, one mesh
/// membership, one store, one supervisor. Constructing a `Node` never starts
/// any background task -- call [`Node::start`] for that.
pub struct Node {
    app_id: String,
    data_dir: PathBuf,
    identity: NodeIdentity,
    mesh: MeshCredentials,
    store: Arc<Store>,
    supervisor: Arc<Supervisor>,
}

impl Node {
    /// The start-up order from §6: load or create the device identity, load
    /// or create the mesh this device belongs to, open the store, then build
    /// (but do not start) the supervisor.
    pub fn create(config: &NodeConfig) -> Result<Self, NodeError> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|err| NodeError::Internal(anyhow::anyhow!("failed to create data dir {}: {err}", config.data_dir.display())))?;

        let identity = NodeIdentity::load_or_create(&config.data_dir)?;
        let mesh = mesh_store::load_or_create(&config.data_dir)?;
        let store = Store::open(&config.data_dir, identity.peer_id())?;
        let ctx = atmosphere_transport::TransportContext {
            local_peer_id: identity.peer_id(),
            mesh_id: mesh.mesh_id,
            shared_secret: mesh.shared_secret,
        };
        let supervisor = Arc::new(Supervisor::new(store.clone(), ctx, config.listen_port, config.enable_lan, config.relay_addr));

        Ok(Self {
            app_id: config.app_id.clone(),
            data_dir: config.data_dir.clone(),
            identity,
            mesh,
            store,
            supervisor,
        })
    }

    /// Joins an existing mesh by applying an invite before the node's first
    /// start. Overwrites any mesh this device previously belonged to.
    pub fn join(config: &NodeConfig, token: &InviteToken) -> Result<Self, NodeError> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|err| NodeError::Internal(anyhow::anyhow!("failed to create data dir {}: {err}", config.data_dir.display())))?;
        mesh_store::join_from_invite(&config.data_dir, token, Utc::now())?;
        Self::create(config)
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn mesh_id(&self) -> atmosphere_types::MeshId {
        self.mesh.mesh_id
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn state(&self) -> NodeState {
        self.supervisor.state()
    }

    pub async fn start(&self) -> Result<(), NodeError> {
        self.supervisor.start().await
    }

    pub async fn stop(&self) -> Result<(), NodeError> {
        self.supervisor.stop().await
    }

    pub fn health(&self) -> HealthView {
        self.supervisor.health()
    }

    // -- store passthrough (§4.2) --------------------------------------

    pub async fn insert(&self, collection: &str, id: impl Into<String>, fields: BTreeMap<String, serde_json::Value>) -> Result<Document, StoreError> {
        self.store.insert(collection, id, fields).await
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<Document> {
        self.store.get(collection, id)
    }

    pub fn query(&self, collection: &str) -> Vec<Document> {
        self.store.query(collection)
    }

    pub async fn delete(&self, collection: &str, id: &str) -> Result<Document, StoreError> {
        self.store.delete(collection, id).await
    }

    pub fn observe(&self, collection: &str) -> (ObserverId, ObserverReceiver) {
        self.store.observe(collection)
    }

    pub fn remove_observer(&self, id: ObserverId) {
        self.store.remove_observer(id)
    }

    pub fn connected_peers(&self) -> Vec<PeerEntry> {
        self.store.connected_peers()
    }

    /// Triggers an immediate `Hello` broadcast instead of waiting for the
    /// next anti-entropy tick (§5). A no-op if the node isn't running.
    pub async fn sync_now(&self) {
        if self.supervisor.state() == NodeState::Running {
            self.supervisor.sync_now().await;
        }
    }

    // -- capability gossip (§4.4) ----------------------------------------

    pub fn register_capability(&self, spec: CapabilitySpec) {
        self.supervisor.announcer().register(spec);
    }

    pub fn unregister_capability(&self, capability_id: &str) {
        self.supervisor.announcer().unregister(capability_id);
    }

    pub fn is_capability_registered(&self, capability_id: &str) -> bool {
        self.supervisor.announcer().is_registered(capability_id)
    }

    // -- routing and dispatch (§4.6, §4.7) --------------------------------

    pub fn route(&self, query: &str, constraints: &Constraints) -> Option<RouteDecision> {
        let (cost_by_peer, peer_transports) = self.peer_context();
        self.supervisor.dispatcher().route(query, constraints, &cost_by_peer, &peer_transports)
    }

    pub async fn dispatch(&self, query: &str, constraints: &Constraints, timeout: Option<Duration>) -> Result<String, NodeError> {
        let (cost_by_peer, peer_transports) = self.peer_context();
        self.supervisor
            .dispatcher()
            .dispatch(query, constraints, &cost_by_peer, &peer_transports, timeout)
            .await
            .map_err(NodeError::from)
    }

    pub async fn dispatch_tool(
        &self,
        app: &str,
        tool: &str,
        params: serde_json::Value,
        constraints: &Constraints,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, NodeError> {
        let (cost_by_peer, peer_transports) = self.peer_context();
        self.supervisor
            .dispatcher()
            .dispatch_tool(app, tool, params, constraints, &cost_by_peer, &peer_transports, timeout)
            .await
            .map_err(NodeError::from)
    }

    /// A responder's side of §4.7: requests targeting this peer (or unaddressed
    /// requests a caller decides to claim), answered via [`Node::respond`].
    pub async fn claim_pending_requests(&self) -> Vec<atmosphere_types::RequestDoc> {
        self.supervisor.responder().claim_pending().await
    }

    pub async fn respond(&self, request_id: uuid::Uuid, content: String) -> Result<(), NodeError> {
        self.supervisor.responder().respond(request_id, content).await.map_err(NodeError::from)
    }

    pub async fn respond_error(&self, request_id: uuid::Uuid, message: String) -> Result<(), NodeError> {
        self.supervisor.responder().respond_error(request_id, message).await.map_err(NodeError::from)
    }

    pub async fn claim_pending_tool_requests(&self) -> Vec<atmosphere_types::ToolRequestDoc> {
        self.supervisor.responder().claim_pending_tools().await
    }

    pub async fn respond_tool(&self, request_id: uuid::Uuid, result: serde_json::Value) -> Result<(), NodeError> {
        self.supervisor.responder().respond_tool(request_id, result).await.map_err(NodeError::from)
    }

    pub async fn respond_tool_error(&self, request_id: uuid::Uuid, message: String) -> Result<(), NodeError> {
        self.supervisor.responder().respond_tool_error(request_id, message).await.map_err(NodeError::from)
    }

    /// Gathers the router's two per-peer inputs: transport kind (for
    /// latency defaults) and a fresh `_cost` snapshot where one exists, per
    /// §4.6 step 5's "locally recomputed if a fresh `_cost` doc exists".
    fn peer_context(&self) -> (std::collections::HashMap<PeerId, NodeCostFactors>, std::collections::HashMap<PeerId, TransportKind>) {
        let peer_transports = self.store.connected_peers().into_iter().map(|p| (p.peer_id, p.transport)).collect();
        let cost_by_peer = self
            .store
            .query("_cost")
            .into_iter()
            .filter_map(|doc| serde_json::from_value::<NodeCostFactors>(serde_json::to_value(&doc.fields).ok()?).ok())
            .map(|factors| (factors.node_id, factors))
            .collect();
        (cost_by_peer, peer_transports)
    }

    // -- mesh membership (§6) ---------------------------------------------

    /// Mints an invite for the mesh this node currently belongs to. Does not
    /// mutate anything -- every device that has joined a mesh can mint one.
    pub fn generate_invite(&self, wide_area_url: Option<String>) -> InviteToken {
        InviteToken::new(&self.mesh, self.app_id.clone(), wide_area_url)
    }

    /// Applies an invite to *this* node's on-disk mesh membership. The caller
    /// is responsible for restarting the node afterward -- membership only
    /// takes effect on the next `start()` since the transport context is
    /// fixed for the lifetime of a running `Supervisor`.
    pub fn apply_invite(&self, token: &InviteToken) -> Result<(), NodeError> {
        if self.supervisor.state() != NodeState::Stopped {
            return Err(NodeError::AlreadyRunning);
        }
        mesh_store::join_from_invite(&self.data_dir, token, Utc::now())?;
        Ok(())
    }
}
