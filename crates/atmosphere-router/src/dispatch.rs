//! Request dispatch (§4.7): turns a routed query into a `_requests` insert,
//! watches `_responses` for the matching `request_id`, and returns exactly
//! once per call -- a response, a remote error, or a timeout.

use crate::scoring::{route, Constraints, RouteDecision};
use atmosphere_gossip::GradientTable;
use atmosphere_store::Store;
use atmosphere_types::{
    ChangeKind, NodeCostFactors, PeerId, RequestBody, RequestDoc, RequestStatus, ResponseDoc, ResponseStatus, ToolRequestDoc, ToolResponseDoc, TransportKind,
    DEFAULT_DISPATCH_TIMEOUT,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no capability in the mesh satisfies the given constraints")]
    NoCapability,
    #[error("dispatch timed out after {0:?} waiting for a response")]
    Timeout(Duration),
    #[error("remote responder reported an error: {0}")]
    RemoteError(String),
    #[error(transparent)]
    Store(#[from] atmosphere_store::StoreError),
}

pub struct Dispatcher {
    store: Arc<Store>,
    gradient: Arc<GradientTable>,
}

impl Dispatcher {
    pub fn new(store: Arc<Store>, gradient: Arc<GradientTable>) -> Self {
        Self { store, gradient }
    }

    pub fn route(&self, query: &str, constraints: &Constraints, cost_by_peer: &HashMap<PeerId, NodeCostFactors>, peer_transports: &HashMap<PeerId, TransportKind>) -> Option<RouteDecision> {
        let entries = self.gradient.entries();
        route(query, constraints, &entries, cost_by_peer, peer_transports, Utc::now())
    }

    /// Steps 1-5 of §4.7. `timeout` defaults to `DEFAULT_DISPATCH_TIMEOUT` if
    /// `None`.
    pub async fn dispatch(
        &self,
        query: &str,
        constraints: &Constraints,
        cost_by_peer: &HashMap<PeerId, NodeCostFactors>,
        peer_transports: &HashMap<PeerId, TransportKind>,
        timeout: Option<Duration>,
    ) -> Result<String, DispatchError> {
        let decision = self.route(query, constraints, cost_by_peer, peer_transports).ok_or(DispatchError::NoCapability)?;
        let timeout = timeout.unwrap_or(DEFAULT_DISPATCH_TIMEOUT);
        let request_id = Uuid::new_v4();

        let request = RequestDoc {
            request_id,
            body: RequestBody::Prompt { prompt: query.to_string() },
            model: None,
            target_peer: Some(decision.peer_id),
            project_path: None,
            capability_id: Some(decision.capability_id.clone()),
            status: RequestStatus::Pending,
            timestamp: Utc::now(),
            source: self.store.local_peer_id(),
        };
        let fields = to_fields(&request)?;
        self.store.insert("_requests", request_id.to_string(), fields).await?;

        let result = self.await_response(request_id, timeout).await;

        // Tombstone the request regardless of outcome; a responder that
        // answers after a client-side timeout still gets its own response
        // tombstoned once observed, per the producer/consumer split in §4.3.
        let _ = self.store.delete("_requests", &request_id.to_string()).await;

        result
    }

    async fn await_response(&self, request_id: Uuid, timeout: Duration) -> Result<String, DispatchError> {
        let (observer_id, mut changes) = self.store.observe("_responses");
        let deadline = tokio::time::Instant::now() + timeout;

        let outcome = loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                tracing::debug!(%request_id, ?timeout, "dispatch timed out waiting for a response");
                break Err(DispatchError::Timeout(timeout));
            }
            let event = match tokio::time::timeout(remaining, changes.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => break Err(DispatchError::Timeout(timeout)),
                Err(_) => break Err(DispatchError::Timeout(timeout)),
            };
            if event.kind == ChangeKind::Delete || event.id != request_id.to_string() {
                continue;
            }
            let Some(doc) = self.store.get("_responses", &event.id) else { continue };
            let Ok(response) = serde_json::from_value::<ResponseDoc>(serde_json::to_value(&doc.fields).unwrap_or_default()) else { continue };
            let outcome = match response.status {
                ResponseStatus::Complete => Ok(response.content),
                ResponseStatus::Error => Err(DispatchError::RemoteError(response.error.unwrap_or_default())),
            };
            let _ = self.store.delete("_responses", &event.id).await;
            break outcome;
        };

        self.store.remove_observer(observer_id);
        outcome
    }

    /// The `_tool_requests`/`_tool_responses` mirror of [`Dispatcher::dispatch`]
    /// (spec table: "symmetric pair for tool calls, same lifecycle").
    pub async fn dispatch_tool(
        &self,
        app: &str,
        tool: &str,
        params: serde_json::Value,
        constraints: &Constraints,
        cost_by_peer: &HashMap<PeerId, NodeCostFactors>,
        peer_transports: &HashMap<PeerId, TransportKind>,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, DispatchError> {
        let decision = self.route(tool, constraints, cost_by_peer, peer_transports).ok_or(DispatchError::NoCapability)?;
        let timeout = timeout.unwrap_or(DEFAULT_DISPATCH_TIMEOUT);
        let request_id = Uuid::new_v4();

        let request = ToolRequestDoc {
            request_id,
            app: app.to_string(),
            tool: tool.to_string(),
            params,
            target_peer: Some(decision.peer_id),
            status: RequestStatus::Pending,
            timestamp: Utc::now(),
            source: self.store.local_peer_id(),
        };
        let fields = to_fields(&request)?;
        self.store.insert("_tool_requests", request_id.to_string(), fields).await?;

        let result = self.await_tool_response(request_id, timeout).await;
        let _ = self.store.delete("_tool_requests", &request_id.to_string()).await;
        result
    }

    async fn await_tool_response(&self, request_id: Uuid, timeout: Duration) -> Result<serde_json::Value, DispatchError> {
        let (observer_id, mut changes) = self.store.observe("_tool_responses");
        let deadline = tokio::time::Instant::now() + timeout;

        let outcome = loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break Err(DispatchError::Timeout(timeout));
            }
            let event = match tokio::time::timeout(remaining, changes.recv()).await {
                Ok(Some(event)) => event,
                _ => break Err(DispatchError::Timeout(timeout)),
            };
            if event.kind == ChangeKind::Delete || event.id != request_id.to_string() {
                continue;
            }
            let Some(doc) = self.store.get("_tool_responses", &event.id) else { continue };
            let Ok(response) = serde_json::from_value::<ToolResponseDoc>(serde_json::to_value(&doc.fields).unwrap_or_default()) else { continue };
            let outcome = match response.status {
                ResponseStatus::Complete => Ok(response.result),
                ResponseStatus::Error => Err(DispatchError::RemoteError(response.error.unwrap_or_default())),
            };
            let _ = self.store.delete("_tool_responses", &event.id).await;
            break outcome;
        };

        self.store.remove_observer(observer_id);
        outcome
    }
}

/// A responder peer's side of §4.7: observe `_requests` for documents that
/// target this peer (or no target, when `project_path`/`capability_id`
/// matches a locally-owned capability), and let a caller-supplied handler
/// produce the response content. Processing is idempotent by `request_id` --
/// a request already answered is skipped.
pub struct Responder {
    store: Arc<Store>,
    local_peer_id: PeerId,
}

impl Responder {
    pub fn new(store: Arc<Store>) -> Self {
        let local_peer_id = store.local_peer_id();
        Self { store, local_peer_id }
    }

    /// Claims every pending request addressed to this peer by rewriting it
    /// `Claimed` before handing it back, so a second call (or a retry racing
    /// the first) never returns the same `request_id` twice.
    pub async fn claim_pending(&self) -> Vec<RequestDoc> {
        let pending: Vec<RequestDoc> = self
            .store
            .query("_requests")
            .into_iter()
            .filter_map(|doc| serde_json::from_value::<RequestDoc>(serde_json::to_value(&doc.fields).ok()?).ok())
            .filter(|req| req.status == RequestStatus::Pending)
            .filter(|req| req.target_peer.map_or(true, |target| target == self.local_peer_id))
            .collect();

        let mut claimed = Vec::with_capacity(pending.len());
        for mut req in pending {
            req.status = RequestStatus::Claimed;
            let Ok(fields) = to_fields(&req) else { continue };
            if self.store.insert("_requests", req.request_id.to_string(), fields).await.is_err() {
                continue;
            }
            claimed.push(req);
        }
        claimed
    }

    pub async fn respond(&self, request_id: Uuid, content: String) -> Result<(), atmosphere_store::StoreError> {
        let response = ResponseDoc { request_id, content, model: None, status: ResponseStatus::Complete, error: None, timestamp: Utc::now() };
        let fields = to_fields(&response)?;
        self.store.insert("_responses", request_id.to_string(), fields).await?;
        Ok(())
    }

    pub async fn respond_error(&self, request_id: Uuid, message: String) -> Result<(), atmosphere_store::StoreError> {
        let response = ResponseDoc { request_id, content: String::new(), model: None, status: ResponseStatus::Error, error: Some(message), timestamp: Utc::now() };
        let fields = to_fields(&response)?;
        self.store.insert("_responses", request_id.to_string(), fields).await?;
        Ok(())
    }

    /// The `_tool_requests` mirror of [`Responder::claim_pending`].
    pub async fn claim_pending_tools(&self) -> Vec<ToolRequestDoc> {
        let pending: Vec<ToolRequestDoc> = self
            .store
            .query("_tool_requests")
            .into_iter()
            .filter_map(|doc| serde_json::from_value::<ToolRequestDoc>(serde_json::to_value(&doc.fields).ok()?).ok())
            .filter(|req| req.status == RequestStatus::Pending)
            .filter(|req| req.target_peer.map_or(true, |target| target == self.local_peer_id))
            .collect();

        let mut claimed = Vec::with_capacity(pending.len());
        for mut req in pending {
            req.status = RequestStatus::Claimed;
            let Ok(fields) = to_fields(&req) else { continue };
            if self.store.insert("_tool_requests", req.request_id.to_string(), fields).await.is_err() {
                continue;
            }
            claimed.push(req);
        }
        claimed
    }

    pub async fn respond_tool(&self, request_id: Uuid, result: serde_json::Value) -> Result<(), atmosphere_store::StoreError> {
        let response = ToolResponseDoc { request_id, result, status: ResponseStatus::Complete, error: None, timestamp: Utc::now() };
        let fields = to_fields(&response)?;
        self.store.insert("_tool_responses", request_id.to_string(), fields).await?;
        Ok(())
    }

    pub async fn respond_tool_error(&self, request_id: Uuid, message: String) -> Result<(), atmosphere_store::StoreError> {
        let response = ToolResponseDoc { request_id, result: serde_json::Value::Null, status: ResponseStatus::Error, error: Some(message), timestamp: Utc::now() };
        let fields = to_fields(&response)?;
        self.store.insert("_tool_responses", request_id.to_string(), fields).await?;
        Ok(())
    }
}

fn to_fields<T: serde::Serialize>(value: &T) -> Result<std::collections::BTreeMap<String, serde_json::Value>, atmosphere_store::StoreError> {
    let value = serde_json::to_value(value).unwrap_or_default();
    Ok(value.as_object().cloned().map(|o| o.into_iter().collect()).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use atmosphere_types::{Capability, CapabilityAnnouncement, FeatureFlags};

    fn announcement(node_id: PeerId) -> CapabilityAnnouncement {
        let now = Utc::now();
        CapabilityAnnouncement {
            node_id,
            capability_id: "llm.chat@responder".into(),
            capability: Capability::LlmChat,
            label: "chat".into(),
            description: "".into(),
            keywords: vec!["hello".into()],
            good_for: vec![],
            specializations: vec![],
            model: None,
            features: FeatureFlags::default(),
            hops: 0,
            ttl: 10,
            timestamp: now,
            expires_at: now + chrono::Duration::seconds(300),
            cost_factors: None,
            project_path: None,
        }
    }

    #[tokio::test]
    async fn dispatch_completes_when_responder_answers() {
        let dir = tempfile::tempdir().unwrap();
        let responder_peer = PeerId::generate();
        let store = Store::open(dir.path(), PeerId::generate()).unwrap();
        let gradient = Arc::new(GradientTable::default());
        gradient.ingest(announcement(responder_peer), responder_peer, Utc::now());
        let dispatcher = Dispatcher::new(store.clone(), gradient);

        let responder_store = store.clone();
        tokio::spawn(async move {
            let responder = Responder::new(responder_store);
            loop {
                let pending = responder.claim_pending().await;
                if let Some(req) = pending.into_iter().next() {
                    responder.respond(req.request_id, "hi there".into()).await.unwrap();
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let result = dispatcher
            .dispatch("hello", &Constraints::default(), &HashMap::new(), &HashMap::new(), Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(result, "hi there");
        assert!(store.get("_requests", &store.query("_requests").first().map(|d| d.id.clone()).unwrap_or_default()).is_none() || store.query("_requests").is_empty());
    }

    #[tokio::test]
    async fn dispatch_without_any_capability_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), PeerId::generate()).unwrap();
        let gradient = Arc::new(GradientTable::default());
        let dispatcher = Dispatcher::new(store, gradient);
        let result = dispatcher.dispatch("hello", &Constraints::default(), &HashMap::new(), &HashMap::new(), Some(Duration::from_millis(50))).await;
        assert!(matches!(result, Err(DispatchError::NoCapability)));
    }

    #[tokio::test]
    async fn dispatch_times_out_without_a_responder() {
        let dir = tempfile::tempdir().unwrap();
        let responder_peer = PeerId::generate();
        let store = Store::open(dir.path(), PeerId::generate()).unwrap();
        let gradient = Arc::new(GradientTable::default());
        gradient.ingest(announcement(responder_peer), responder_peer, Utc::now());
        let dispatcher = Dispatcher::new(store, gradient);
        let result = dispatcher.dispatch("hello", &Constraints::default(), &HashMap::new(), &HashMap::new(), Some(Duration::from_millis(50))).await;
        assert!(matches!(result, Err(DispatchError::Timeout(_))));
    }

    #[tokio::test]
    async fn dispatch_tool_completes_when_responder_answers() {
        let dir = tempfile::tempdir().unwrap();
        let responder_peer = PeerId::generate();
        let store = Store::open(dir.path(), PeerId::generate()).unwrap();
        let gradient = Arc::new(GradientTable::default());
        gradient.ingest(announcement(responder_peer), responder_peer, Utc::now());
        let dispatcher = Dispatcher::new(store.clone(), gradient);

        let responder_store = store.clone();
        tokio::spawn(async move {
            let responder = Responder::new(responder_store);
            loop {
                let pending = responder.claim_pending_tools().await;
                if let Some(req) = pending.into_iter().next() {
                    responder.respond_tool(req.request_id, serde_json::json!({"ok": true})).await.unwrap();
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let result = dispatcher
            .dispatch_tool(
                "notes",
                "hello",
                serde_json::json!({}),
                &Constraints::default(),
                &HashMap::new(),
                &HashMap::new(),
                Some(Duration::from_secs(2)),
            )
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
        assert!(store.query("_tool_requests").is_empty());
    }

    #[tokio::test]
    async fn dispatch_tool_propagates_remote_error() {
        let dir = tempfile::tempdir().unwrap();
        let responder_peer = PeerId::generate();
        let store = Store::open(dir.path(), PeerId::generate()).unwrap();
        let gradient = Arc::new(GradientTable::default());
        gradient.ingest(announcement(responder_peer), responder_peer, Utc::now());
        let dispatcher = Dispatcher::new(store.clone(), gradient);

        let responder_store = store.clone();
        tokio::spawn(async move {
            let responder = Responder::new(responder_store);
            loop {
                let pending = responder.claim_pending_tools().await;
                if let Some(req) = pending.into_iter().next() {
                    responder.respond_tool_error(req.request_id, "tool crashed".into()).await.unwrap();
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let result = dispatcher
            .dispatch_tool(
                "notes",
                "hello",
                serde_json::json!({}),
                &Constraints::default(),
                &HashMap::new(),
                &HashMap::new(),
                Some(Duration::from_secs(2)),
            )
            .await;
        assert!(matches!(result, Err(DispatchError::RemoteError(msg)) if msg == "tool crashed"));
    }
}
