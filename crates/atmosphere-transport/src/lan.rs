//! LAN-TCP transport with mDNS discovery (§4.1).
//!
//! Peers advertise themselves under `_atmosphere._tcp.local.` with TXT record
//! keys `peer_id`, `mesh_id`, `port`. On discovering a record whose `mesh_id`
//! matches ours and whose `peer_id` is not our own, we dial it; the listener
//! side accepts any inbound connection and lets the handshake decide whether
//! to keep it. The OS assigns the listen port; the chosen port is what gets
//! re-advertised, per §4.1.

use crate::{
    frame::{Frame, SeenNonces},
    TransportCommand, TransportContext, TransportError, TransportEvent, TransportHandle,
};
use atmosphere_crypto::handshake::{self, HandshakeProof};
use atmosphere_types::{MeshId, PeerId, TransportKind, CONNECT_TIMEOUT, MDNS_SERVICE_TYPE, RECONNECT_BACKOFF_INITIAL, RECONNECT_BACKOFF_MAX, SEEN_NONCE_CAPACITY};
use futures::{SinkExt, StreamExt};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::timeout,
};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

#[derive(Debug, Serialize, Deserialize)]
enum HandshakeMessage {
    Hello { peer_id: PeerId, mesh_id: MeshId, nonce: Vec<u8> },
    HelloAck { peer_id: PeerId, nonce: Vec<u8>, proof: [u8; 32] },
    HelloProof { proof: [u8; 32] },
}

struct Connections {
    senders: HashMap<PeerId, mpsc::Sender<Frame>>,
}

pub fn spawn(ctx: TransportContext, listen_port: u16) -> Result<TransportHandle, TransportError> {
    let (command_tx, command_rx) = mpsc::channel(256);
    let (event_tx, event_rx) = mpsc::channel(1024);

    tokio::spawn(run(ctx, listen_port, command_rx, event_tx));

    Ok(TransportHandle {
        name: "lan-tcp",
        kind: TransportKind::LanTcp,
        commands: command_tx,
        events: event_rx,
    })
}

async fn run(
    ctx: TransportContext,
    listen_port: u16,
    mut commands: mpsc::Receiver<TransportCommand>,
    events: mpsc::Sender<TransportEvent>,
) {
    let listener = match TcpListener::bind((Ipv4Addr::UNSPECIFIED, listen_port)).await {
        Ok(l) => l,
        Err(err) => {
            tracing::error!(peer_id = %ctx.local_peer_id, "lan-tcp failed to bind: {err}");
            return;
        }
    };
    let bound_port = listener.local_addr().map(|a| a.port()).unwrap_or(listen_port);
    tracing::info!(peer_id = %ctx.local_peer_id, port = bound_port, "lan-tcp listening");

    let mdns = ServiceDaemon::new().ok();
    if let Some(mdns) = &mdns {
        if let Err(err) = announce(mdns, &ctx, bound_port) {
            tracing::warn!("mdns announce failed: {err}");
        }
    }
    let browse_rx = mdns.as_ref().and_then(|m| m.browse(MDNS_SERVICE_TYPE).ok());

    let connections = Arc::new(Mutex::new(Connections { senders: HashMap::new() }));
    let seen_nonces = Arc::new(Mutex::new(SeenNonces::with_capacity(SEEN_NONCE_CAPACITY)));
    let mut dialed: HashSet<SocketAddr> = HashSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                if let Ok((stream, addr)) = accepted {
                    tracing::debug!("lan-tcp inbound connection from {addr}");
                    spawn_connection(stream, ctx.clone(), false, connections.clone(), seen_nonces.clone(), events.clone());
                }
            }
            Some(event) = recv_mdns(&browse_rx) => {
                if let ServiceEvent::ServiceResolved(info) = event {
                    if let Some(addr) = resolve_peer(&info, &ctx, &mut dialed) {
                        let ctx = ctx.clone();
                        let connections = connections.clone();
                        let seen_nonces = seen_nonces.clone();
                        let events = events.clone();
                        tokio::spawn(async move {
                            dial_with_backoff(addr, ctx, connections, seen_nonces, events).await;
                        });
                    }
                }
            }
            Some(command) = commands.recv() => {
                match command {
                    TransportCommand::Send { peer_id, frame } => {
                        let sender = connections.lock().senders.get(&peer_id).cloned();
                        if let Some(sender) = sender {
                            let _ = sender.send(frame).await;
                        } else {
                            tracing::debug!(%peer_id, "lan-tcp send to unknown peer dropped");
                        }
                    }
                    TransportCommand::Broadcast { frame } => {
                        let senders: Vec<_> = connections.lock().senders.values().cloned().collect();
                        for sender in senders {
                            let _ = sender.send(frame.clone()).await;
                        }
                    }
                    TransportCommand::Stop => {
                        tracing::info!("lan-tcp stopping");
                        if let Some(mdns) = &mdns {
                            let _ = mdns.unregister(MDNS_SERVICE_TYPE);
                        }
                        return;
                    }
                }
            }
        }
    }
}

async fn recv_mdns(rx: &Option<mdns_sd::Receiver<ServiceEvent>>) -> Option<ServiceEvent> {
    match rx {
        Some(rx) => rx.recv_async().await.ok(),
        None => std::future::pending().await,
    }
}

fn announce(mdns: &ServiceDaemon, ctx: &TransportContext, port: u16) -> Result<(), mdns_sd::Error> {
    let hostname = format!("{}.local.", ctx.local_peer_id);
    let mut properties = HashMap::new();
    properties.insert("peer_id".to_string(), ctx.local_peer_id.to_string());
    properties.insert("mesh_id".to_string(), ctx.mesh_id.to_string());
    properties.insert("port".to_string(), port.to_string());
    let info = ServiceInfo::new(
        MDNS_SERVICE_TYPE,
        &ctx.local_peer_id.to_string(),
        &hostname,
        "",
        port,
        Some(properties),
    )?
    .enable_addr_auto();
    mdns.register(info)
}

fn resolve_peer(info: &ServiceInfo, ctx: &TransportContext, dialed: &mut HashSet<SocketAddr>) -> Option<SocketAddr> {
    let props = info.get_properties();
    let remote_mesh = props.get("mesh_id")?.val_str();
    if remote_mesh != ctx.mesh_id.to_string() {
        return None;
    }
    let remote_peer = props.get("peer_id")?.val_str();
    if remote_peer == ctx.local_peer_id.to_string() {
        return None;
    }
    let ip = info.get_addresses().iter().next().copied()?;
    let addr = SocketAddr::new(ip, info.get_port());
    if dialed.contains(&addr) {
        return None;
    }
    dialed.insert(addr);
    Some(addr)
}

async fn dial_with_backoff(
    addr: SocketAddr,
    ctx: TransportContext,
    connections: Arc<Mutex<Connections>>,
    seen_nonces: Arc<Mutex<SeenNonces>>,
    events: mpsc::Sender<TransportEvent>,
) {
    let mut backoff = RECONNECT_BACKOFF_INITIAL;
    loop {
        match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                spawn_connection(stream, ctx.clone(), true, connections.clone(), seen_nonces.clone(), events.clone());
                return;
            }
            _ => {
                tracing::debug!(%addr, "lan-tcp dial failed, retrying in {backoff:?}");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
            }
        }
    }
}

fn spawn_connection(
    stream: TcpStream,
    ctx: TransportContext,
    is_dialer: bool,
    connections: Arc<Mutex<Connections>>,
    seen_nonces: Arc<Mutex<SeenNonces>>,
    events: mpsc::Sender<TransportEvent>,
) {
    tokio::spawn(async move {
        let _ = stream.set_nodelay(true);
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
        let remote_peer_id = match run_handshake(&mut framed, &ctx, is_dialer).await {
            Ok(peer_id) => peer_id,
            Err(peer_id) => {
                let _ = events.send(TransportEvent::AuthRejected { peer_id }).await;
                return;
            }
        };

        let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(256);
        connections.lock().senders.insert(remote_peer_id, frame_tx);
        let _ = events
            .send(TransportEvent::PeerUp { peer_id: remote_peer_id, kind: TransportKind::LanTcp })
            .await;

        loop {
            tokio::select! {
                outgoing = frame_rx.recv() => {
                    match outgoing {
                        Some(frame) => {
                            let Ok(bytes) = frame.encode() else { continue };
                            if framed.send(bytes.into()).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                incoming = framed.next() => {
                    match incoming {
                        Some(Ok(bytes)) => {
                            match Frame::decode(&bytes) {
                                Ok(frame) if frame.mesh_id == ctx.mesh_id => {
                                    if seen_nonces.lock().insert_is_new(frame.nonce) {
                                        let _ = events
                                            .send(TransportEvent::Inbound { peer_id: remote_peer_id, kind: TransportKind::LanTcp, frame })
                                            .await;
                                    }
                                }
                                Ok(_) => tracing::debug!(%remote_peer_id, "dropping frame with mismatched mesh_id"),
                                Err(err) => tracing::debug!(%remote_peer_id, "dropping undecodable frame: {err}"),
                            }
                        }
                        _ => break,
                    }
                }
            }
        }

        connections.lock().senders.remove(&remote_peer_id);
        let _ = events
            .send(TransportEvent::PeerDown { peer_id: remote_peer_id, kind: TransportKind::LanTcp })
            .await;
    });
}

async fn run_handshake(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
    ctx: &TransportContext,
    is_dialer: bool,
) -> Result<PeerId, Option<PeerId>> {
    let result = timeout(CONNECT_TIMEOUT, async {
        if is_dialer {
            let nonce = handshake::generate_nonce().to_vec();
            send_handshake(framed, &HandshakeMessage::Hello { peer_id: ctx.local_peer_id, mesh_id: ctx.mesh_id, nonce: nonce.clone() }).await?;
            let ack = recv_handshake(framed).await?;
            let HandshakeMessage::HelloAck { peer_id: remote_peer_id, nonce: remote_nonce, proof } = ack else {
                return Err(None);
            };
            handshake::verify_proof(&ctx.shared_secret, remote_peer_id, &nonce, &HandshakeProof(proof))
                .map_err(|_| Some(remote_peer_id))?;
            let our_proof = handshake::compute_proof(&ctx.shared_secret, ctx.local_peer_id, &remote_nonce);
            send_handshake(framed, &HandshakeMessage::HelloProof { proof: our_proof.0 }).await?;
            Ok(remote_peer_id)
        } else {
            let hello = recv_handshake(framed).await?;
            let HandshakeMessage::Hello { peer_id: remote_peer_id, mesh_id, nonce } = hello else {
                return Err(None);
            };
            if mesh_id != ctx.mesh_id {
                return Err(Some(remote_peer_id));
            }
            let our_nonce = handshake::generate_nonce().to_vec();
            let proof = handshake::compute_proof(&ctx.shared_secret, ctx.local_peer_id, &nonce);
            send_handshake(framed, &HandshakeMessage::HelloAck { peer_id: ctx.local_peer_id, nonce: our_nonce.clone(), proof: proof.0 }).await?;
            let proof_msg = recv_handshake(framed).await?;
            let HandshakeMessage::HelloProof { proof } = proof_msg else {
                return Err(Some(remote_peer_id));
            };
            handshake::verify_proof(&ctx.shared_secret, remote_peer_id, &our_nonce, &HandshakeProof(proof))
                .map_err(|_| Some(remote_peer_id))?;
            Ok(remote_peer_id)
        }
    })
    .await;

    match result {
        Ok(inner) => inner,
        Err(_) => Err(None),
    }
}

async fn send_handshake(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
    message: &HandshakeMessage,
) -> Result<(), Option<PeerId>> {
    let bytes = serde_cbor::to_vec(message).map_err(|_| None)?;
    framed.send(bytes.into()).await.map_err(|_| None)
}

async fn recv_handshake(framed: &mut Framed<TcpStream, LengthDelimitedCodec>) -> Result<HandshakeMessage, Option<PeerId>> {
    let bytes = framed.next().await.ok_or(None)?.map_err(|_| None)?;
    serde_cbor::from_slice(&bytes).map_err(|_| None)
}
