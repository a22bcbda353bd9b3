//! Wide-area relay transport (§4.1, §9 Open Questions: resolved as an
//! optional, explicitly-configured transport rather than default-on).
//!
//! A relay is a single outbound WebSocket-free TCP connection to a
//! rendezvous address that multiplexes frames for every mesh peer behind it,
//! handshaking exactly like the LAN transport once connected. Supervisors
//! that are not given a relay address simply never spawn this transport.

use crate::{
    frame::{Frame, SeenNonces},
    TransportCommand, TransportContext, TransportError, TransportEvent, TransportHandle,
};
use atmosphere_crypto::handshake::{self, HandshakeProof};
use atmosphere_types::{TransportKind, CONNECT_TIMEOUT, RECONNECT_BACKOFF_INITIAL, RECONNECT_BACKOFF_MAX, SEEN_NONCE_CAPACITY};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpStream, sync::mpsc, time::timeout};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

#[derive(Debug, Serialize, Deserialize)]
enum RelayHello {
    Hello { peer_id: atmosphere_types::PeerId, mesh_id: atmosphere_types::MeshId, nonce: Vec<u8> },
    Ack { peer_id: atmosphere_types::PeerId, nonce: Vec<u8>, proof: [u8; 32] },
    Proof { proof: [u8; 32] },
}

/// Spawns the relay transport against a configured rendezvous address.
/// Absent a configured address, callers should not invoke `spawn` at all --
/// there is no "disabled" variant of the handle, matching how `lan` and
/// `ble` are always-on by contrast.
pub fn spawn(ctx: TransportContext, relay_addr: SocketAddr) -> Result<TransportHandle, TransportError> {
    let (command_tx, command_rx) = mpsc::channel(256);
    let (event_tx, event_rx) = mpsc::channel(1024);

    tokio::spawn(run(ctx, relay_addr, command_rx, event_tx));

    Ok(TransportHandle {
        name: "relay",
        kind: TransportKind::Relay,
        commands: command_tx,
        events: event_rx,
    })
}

async fn run(
    ctx: TransportContext,
    relay_addr: SocketAddr,
    mut commands: mpsc::Receiver<TransportCommand>,
    events: mpsc::Sender<TransportEvent>,
) {
    let seen_nonces = Arc::new(Mutex::new(SeenNonces::with_capacity(SEEN_NONCE_CAPACITY)));
    let mut backoff = RECONNECT_BACKOFF_INITIAL;

    'connect: loop {
        let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(relay_addr)).await {
            Ok(Ok(stream)) => stream,
            _ => {
                tracing::debug!(%relay_addr, "relay connect failed, retrying in {backoff:?}");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
                continue;
            }
        };
        backoff = RECONNECT_BACKOFF_INITIAL;
        let _ = stream.set_nodelay(true);
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

        let remote_peer_id = match handshake_dialer(&mut framed, &ctx).await {
            Some(peer_id) => peer_id,
            None => {
                let _ = events.send(TransportEvent::AuthRejected { peer_id: None }).await;
                tokio::time::sleep(backoff).await;
                continue;
            }
        };

        let _ = events
            .send(TransportEvent::PeerUp { peer_id: remote_peer_id, kind: TransportKind::Relay })
            .await;

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(TransportCommand::Send { frame, .. }) | Some(TransportCommand::Broadcast { frame }) => {
                            let Ok(bytes) = frame.encode() else { continue };
                            if framed.send(bytes.into()).await.is_err() {
                                break;
                            }
                        }
                        Some(TransportCommand::Stop) | None => break 'connect,
                    }
                }
                incoming = framed.next() => {
                    match incoming {
                        Some(Ok(bytes)) => {
                            if let Ok(frame) = Frame::decode(&bytes) {
                                if frame.mesh_id == ctx.mesh_id && seen_nonces.lock().insert_is_new(frame.nonce) {
                                    let _ = events
                                        .send(TransportEvent::Inbound { peer_id: remote_peer_id, kind: TransportKind::Relay, frame })
                                        .await;
                                }
                            }
                        }
                        _ => break,
                    }
                }
            }
        }

        let _ = events
            .send(TransportEvent::PeerDown { peer_id: remote_peer_id, kind: TransportKind::Relay })
            .await;
        tokio::time::sleep(backoff).await;
    }
}

async fn handshake_dialer(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
    ctx: &TransportContext,
) -> Option<atmosphere_types::PeerId> {
    let nonce = handshake::generate_nonce().to_vec();
    let hello = RelayHello::Hello { peer_id: ctx.local_peer_id, mesh_id: ctx.mesh_id, nonce: nonce.clone() };
    framed.send(serde_cbor::to_vec(&hello).ok()?.into()).await.ok()?;

    let bytes = framed.next().await?.ok()?;
    let RelayHello::Ack { peer_id: remote_peer_id, nonce: remote_nonce, proof } = serde_cbor::from_slice(&bytes).ok()? else {
        return None;
    };
    handshake::verify_proof(&ctx.shared_secret, remote_peer_id, &nonce, &HandshakeProof(proof)).ok()?;

    let our_proof = handshake::compute_proof(&ctx.shared_secret, ctx.local_peer_id, &remote_nonce);
    let proof_msg = RelayHello::Proof { proof: our_proof.0 };
    framed.send(serde_cbor::to_vec(&proof_msg).ok()?.into()).await.ok()?;

    Some(remote_peer_id)
}
