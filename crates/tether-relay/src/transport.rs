//! Circuit Relay v2 client transport.
//!
//! Dialing turns `<relay-addrs>/p2p/<relay>/p2p-circuit[/p2p/<dest>]` into a
//! virtual point-to-point connection by speaking HOP to the relay. Listening
//! registers a STOP handler on the host and surfaces forwarded circuits
//! through an accept queue. No listening socket is ever opened.
//!
//! The virtual connection reports transport `circuit-relay` with empty
//! security and muxer fields: upper layers must still run their secure
//! channel + muxer upgrade across the circuit, exactly as they would over a
//! freshly accepted TCP connection. That upgrade is what gives the dialer an
//! end-to-end handshake with the destination rather than with the relay.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use libp2p::{Multiaddr, PeerId};
use tether_proto::{
    write_message, HopMessage, HopMessageType, MessageReader, Peer, Status, StopMessage,
    StopMessageType, HOP_PROTOCOL, STOP_PROTOCOL,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use crate::error::RelayError;
use crate::host::{AddressTtl, Host, IncomingStream, Substream};
use crate::sanitize::{circuit_addr_for, generic_circuit_addr, split_circuit_addr};

/// Transport name reported by virtual connections.
pub const TRANSPORT_NAME: &str = "circuit-relay";

/// Deadline for negotiating a HOP stream with the relay.
const HOP_NEGOTIATE_DEADLINE: Duration = Duration::from_secs(15);

/// Deadline for dialing the relay and for the CONNECT status round-trip.
const DIAL_RELAY_DEADLINE: Duration = Duration::from_secs(10);

/// Deadline for the inbound STOP handshake.
const STOP_HANDSHAKE_DEADLINE: Duration = Duration::from_secs(15);

/// Depth of the accept queue. Handshakes complete before queueing, so this
/// only bounds fully-established circuits the application has not drained.
const ACCEPT_QUEUE_DEPTH: usize = 16;

// ── Virtual connection ────────────────────────────────────────────────────────

/// Resource bounds the relay announced for a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CircuitLimit {
    pub duration: Option<Duration>,
    pub data: Option<u64>,
}

impl CircuitLimit {
    fn from_wire(limit: Option<tether_proto::Limit>) -> Option<Self> {
        limit.map(|l| CircuitLimit {
            duration: l.duration.map(|secs| Duration::from_secs(secs.into())),
            data: l.data,
        })
    }
}

/// Identity of a virtual connection as reported to upper layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnStat {
    pub transport: &'static str,
    /// Empty: the connection has not been secured yet.
    pub security: &'static str,
    /// Empty: the connection has not been multiplexed yet.
    pub muxer: &'static str,
}

/// A relayed byte stream presented as a point-to-point connection.
///
/// Bytes the relay delivered together with its handshake frame are replayed
/// before anything is read from the underlying stream, so the remote's first
/// application frame is never lost.
pub struct CircuitConn {
    stream: Substream,
    prepend: BytesMut,
    local_peer: PeerId,
    remote_peer: PeerId,
    limit: Option<CircuitLimit>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl std::fmt::Debug for CircuitConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitConn")
            .field("local_peer", &self.local_peer)
            .field("remote_peer", &self.remote_peer)
            .finish_non_exhaustive()
    }
}

impl CircuitConn {
    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    /// The limit the relay placed on this circuit, if it announced one.
    pub fn limit(&self) -> Option<CircuitLimit> {
        self.limit
    }

    pub fn stat(&self) -> ConnStat {
        ConnStat {
            transport: TRANSPORT_NAME,
            security: "",
            muxer: "",
        }
    }
}

impl AsyncRead for CircuitConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prepend.is_empty() {
            let n = self.prepend.len().min(buf.remaining());
            buf.put_slice(&self.prepend[..n]);
            self.prepend.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for CircuitConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

impl Drop for CircuitConn {
    fn drop(&mut self) {
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

struct ListenerState {
    active: bool,
    /// Circuit addresses the application asked to listen on.
    requested_addrs: Vec<Multiaddr>,
}

/// The client side of the circuit relay transport. One per host.
pub struct CircuitTransport {
    host: Arc<dyn Host>,
    /// dest peer → id of the most recent virtual connection. Not a dial
    /// deduplicator: connection reuse is the upper layer's concern. Only
    /// used for cleanup on close and for reporting.
    conns: Arc<Mutex<HashMap<PeerId, u64>>>,
    next_conn_id: AtomicU64,
    listener: Mutex<ListenerState>,
}

impl CircuitTransport {
    pub fn new(host: Arc<dyn Host>) -> Arc<Self> {
        Arc::new(CircuitTransport {
            host,
            conns: Arc::new(Mutex::new(HashMap::new())),
            next_conn_id: AtomicU64::new(1),
            listener: Mutex::new(ListenerState {
                active: false,
                requested_addrs: Vec::new(),
            }),
        })
    }

    /// Dial a circuit address.
    ///
    /// `<relay-addrs>/p2p/<relay>/p2p-circuit` dials the relay through
    /// itself; with a trailing `/p2p/<dest>` it dials `dest` through the
    /// relay. Every failure resets the HOP stream.
    pub async fn dial(&self, addr: &Multiaddr) -> Result<CircuitConn, RelayError> {
        let (relay_info, dest) = split_circuit_addr(addr)?;
        let relay = relay_info.peer_id;
        let dest_peer = dest.unwrap_or(relay);

        if self.host.connections(&relay).is_empty() {
            timeout(DIAL_RELAY_DEADLINE, self.host.connect(&relay_info))
                .await
                .map_err(|_| {
                    RelayError::ConnectionFailed(format!("dial to relay {relay} timed out"))
                })??;
        }

        let mut stream = timeout(
            HOP_NEGOTIATE_DEADLINE,
            self.host.open_stream(relay, HOP_PROTOCOL),
        )
        .await
        .map_err(|_| {
            RelayError::ConnectionFailed(format!("HOP negotiation with {relay} timed out"))
        })??;

        let session_id = Uuid::new_v4().to_string();
        tracing::debug!("Circuit dial to {dest_peer} via {relay} session={session_id}");
        let connect = HopMessage::connect(
            Peer {
                id: dest_peer.to_bytes(),
                addrs: vec![],
            },
            session_id,
        );
        write_message(&mut stream, &connect).await?;

        let mut reader = MessageReader::new(stream);
        let msg: HopMessage = timeout(DIAL_RELAY_DEADLINE, reader.read_message())
            .await
            .map_err(|_| {
                RelayError::ConnectionFailed(format!("CONNECT to {dest_peer} via {relay} timed out"))
            })??;

        if msg.r#type != HopMessageType::Status as i32 {
            return Err(RelayError::UnexpectedMessage(format!(
                "expected STATUS from relay {relay}, got message type {}",
                msg.r#type
            )));
        }
        match msg.status_code() {
            Some(Status::Ok) => {}
            Some(status) => return Err(RelayError::from_status(status)),
            None => {
                return Err(RelayError::MalformedMessage(
                    "STATUS message without a valid status code".into(),
                ))
            }
        }

        // Anything the relay wrote after the STATUS frame belongs to the
        // destination peer and is replayed by the connection.
        let (stream, leftover) = reader.into_parts();
        Ok(self.track(CircuitConn {
            stream,
            prepend: leftover,
            local_peer: self.host.local_peer_id(),
            remote_peer: dest_peer,
            limit: CircuitLimit::from_wire(msg.limit),
            on_close: None,
        }))
    }

    /// Register the STOP handler and return the accept queue for incoming
    /// circuits. `requested_addrs` become the advertised listen addresses;
    /// pass an empty list for the generic `/p2p/<self>/p2p-circuit` advert.
    pub fn listen(
        self: &Arc<Self>,
        requested_addrs: Vec<Multiaddr>,
    ) -> Result<CircuitListener, RelayError> {
        {
            let mut st = self.listener.lock().unwrap();
            if st.active {
                return Err(RelayError::InvalidArgument(
                    "circuit transport is already listening".into(),
                ));
            }
            st.active = true;
            st.requested_addrs = requested_addrs;
        }

        let (stream_tx, mut stream_rx) = mpsc::channel::<IncomingStream>(ACCEPT_QUEUE_DEPTH);
        self.host.set_stream_handler(STOP_PROTOCOL, stream_tx);

        let (conn_tx, conn_rx) = mpsc::channel(ACCEPT_QUEUE_DEPTH);
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(incoming) = stream_rx.recv().await {
                let transport = Arc::clone(&transport);
                let conn_tx = conn_tx.clone();
                tokio::spawn(async move {
                    match transport.handle_stop_stream(incoming).await {
                        Ok(conn) => {
                            // A full queue or a dropped listener resets the
                            // circuit by dropping it.
                            if let Err(e) = conn_tx.try_send(conn) {
                                tracing::debug!("Dropping inbound circuit: {e}");
                            }
                        }
                        Err(e) => tracing::debug!("Inbound STOP stream rejected: {e}"),
                    }
                });
            }
        });

        Ok(CircuitListener {
            conns: conn_rx,
            transport: Arc::clone(self),
        })
    }

    /// Addresses on which this transport is reachable via relays.
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        let st = self.listener.lock().unwrap();
        if st.requested_addrs.is_empty() {
            vec![generic_circuit_addr(&self.host.local_peer_id())]
        } else {
            st.requested_addrs.clone()
        }
    }

    /// Peers with a live virtual connection, for reporting.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.conns.lock().unwrap().keys().copied().collect()
    }

    /// Handle one inbound STOP stream: validate CONNECT, answer STATUS OK,
    /// wrap the remainder as a virtual connection.
    async fn handle_stop_stream(&self, incoming: IncomingStream) -> Result<CircuitConn, RelayError> {
        let relay = incoming.peer;
        match timeout(
            STOP_HANDSHAKE_DEADLINE,
            self.stop_handshake(relay, incoming.stream),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RelayError::ConnectionFailed(format!(
                "STOP handshake via {relay} timed out"
            ))),
        }
    }

    async fn stop_handshake(
        &self,
        relay: PeerId,
        stream: Substream,
    ) -> Result<CircuitConn, RelayError> {
        let mut reader = MessageReader::new(stream);
        let msg: StopMessage = reader.read_message().await?;

        if msg.r#type != StopMessageType::Connect as i32 {
            return Err(RelayError::UnexpectedMessage(format!(
                "expected CONNECT on STOP stream, got message type {}",
                msg.r#type
            )));
        }
        let peer = msg.peer.ok_or_else(|| {
            RelayError::MalformedMessage("STOP CONNECT without a peer".into())
        })?;
        let src = PeerId::from_bytes(&peer.id)
            .map_err(|e| RelayError::MalformedMessage(format!("bad source peer id: {e}")))?;

        // Remember how to dial the source back through the same relay.
        let dial_back = circuit_addr_for(&Multiaddr::empty(), &relay, &src);
        self.host.add_addrs(&src, &[dial_back], AddressTtl::Connected);

        // The response must be on the wire before the connection is exposed:
        // writing later would race the upper layer's security upgrade.
        let (mut stream, leftover) = reader.into_parts();
        write_message(&mut stream, &StopMessage::with_status(Status::Ok)).await?;

        tracing::debug!("Inbound circuit from {src} via {relay}");
        Ok(self.track(CircuitConn {
            stream,
            prepend: leftover,
            local_peer: self.host.local_peer_id(),
            remote_peer: src,
            limit: CircuitLimit::from_wire(msg.limit),
            on_close: None,
        }))
    }

    /// Register the connection in the tracking map and arm its close hook.
    fn track(&self, mut conn: CircuitConn) -> CircuitConn {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let peer = conn.remote_peer;
        let conns = Arc::clone(&self.conns);
        conns.lock().unwrap().insert(peer, id);
        conn.on_close = Some(Box::new(move || {
            let mut map = conns.lock().unwrap();
            // A newer connection to the same peer may have replaced us.
            if map.get(&peer) == Some(&id) {
                map.remove(&peer);
            }
        }));
        conn
    }
}

/// Accept side of the transport. Dropping the listener deregisters the STOP
/// handler; circuits already queued stay available.
pub struct CircuitListener {
    conns: mpsc::Receiver<CircuitConn>,
    transport: Arc<CircuitTransport>,
}

impl std::fmt::Debug for CircuitListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitListener").finish_non_exhaustive()
    }
}

impl CircuitListener {
    /// Next fully established inbound circuit.
    pub async fn accept(&mut self) -> Result<CircuitConn, RelayError> {
        self.conns.recv().await.ok_or(RelayError::Shutdown)
    }
}

impl Drop for CircuitListener {
    fn drop(&mut self) {
        self.transport.host.remove_stream_handler(STOP_PROTOCOL);
        let mut st = self.transport.listener.lock().unwrap();
        st.active = false;
        st.requested_addrs.clear();
    }
}
