//! UDP socket ownership, connection demultiplexing, and stateless resets
//!
//! One endpoint owns one socket. Incoming datagrams are routed to
//! connections by destination connection ID; Initial packets for unknown
//! IDs create server connections, unknown short-header packets draw a
//! stateless reset, and unsupported versions draw Version Negotiation.

pub use crate::packet::ConnectionId;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use rand::RngCore;
use ring::hmac;
use rustc_hash::FxHashMap;
use slab::Slab;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};

use crate::config::{ConfigError, QuicConfig, TlsConfig};
use crate::packet::{self, LONG_HEADER_FORM};
use crate::session::{ConnectionError, Session};
use crate::{Side, MAX_CID_SIZE, MIN_INITIAL_SIZE, RESET_TOKEN_SIZE};

/// Per-connection datagram queue depth
const DATAGRAM_QUEUE: usize = 128;

/// Failures establishing an endpoint or connection
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The supplied configuration is unusable
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// The socket could not be bound or used
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    /// The connection attempt failed
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Factory for QUIC endpoints
#[derive(Debug)]
pub struct Endpoint {
    _priv: (),
}

impl Endpoint {
    /// Bind `addr` and accept incoming connections
    pub async fn listen(
        addr: SocketAddr,
        tls: TlsConfig,
        config: QuicConfig,
    ) -> Result<Listener, ConnectError> {
        config.validate()?;
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let shared = EndpointShared::new(socket, &config, false);
        let (incoming_tx, incoming_rx) = mpsc::channel(16);
        tokio::spawn(drive(
            shared.clone(),
            Some(incoming_tx),
            tls,
            config,
        ));
        Ok(Listener {
            incoming: incoming_rx,
            shared,
            local_addr,
        })
    }

    /// Establish a connection to `remote`
    ///
    /// Resolves once the handshake completes.
    pub async fn dial(
        remote: SocketAddr,
        tls: TlsConfig,
        config: QuicConfig,
    ) -> Result<Session, ConnectError> {
        config.validate()?;
        let bind_addr: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let shared = EndpointShared::new(socket.clone(), &config, true);

        let local_cid = shared.new_unique_cid();
        // The first flight's keys derive from a client-chosen random DCID
        let initial_dcid = ConnectionId::random(8);
        let (tx, rx) = mpsc::channel(DATAGRAM_QUEUE);
        let index = shared.insert_connection(tx, local_cid);
        let session = Session::spawn(
            Side::Client,
            socket,
            remote,
            local_cid,
            initial_dcid,
            initial_dcid,
            shared.clone(),
            index,
            rx,
            &tls,
            &config,
        );
        tokio::spawn(drive(shared, None, tls, config));

        session.handshake_completed().await.map_err(ConnectError::from)?;
        Ok(session)
    }
}

/// Accepts incoming QUIC connections
#[derive(Debug)]
pub struct Listener {
    incoming: mpsc::Receiver<Session>,
    shared: Arc<EndpointShared>,
    local_addr: SocketAddr,
}

impl Listener {
    /// Wait for the next incoming connection
    ///
    /// Returns `None` after [`Listener::close`].
    pub async fn accept(&mut self) -> Option<Session> {
        self.incoming.recv().await
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Abruptly shut down the endpoint and every connection on it
    ///
    /// Connections are dropped without notifying peers, as after a crash;
    /// surviving peers discover the loss through stateless resets.
    pub fn close(&self) {
        self.shared.shutdown();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

#[derive(Debug)]
pub(crate) struct EndpointShared {
    socket: Arc<UdpSocket>,
    reset_key: hmac::Key,
    cid_len: usize,
    is_client: bool,
    shutdown: Notify,
    state: Mutex<EndpointState>,
}

#[derive(Debug, Default)]
struct EndpointState {
    connections: Slab<ConnMeta>,
    by_cid: FxHashMap<ConnectionId, usize>,
    /// Peer-supplied tokens recognising stateless resets, per connection
    reset_tokens: FxHashMap<[u8; RESET_TOKEN_SIZE], usize>,
    shutting_down: bool,
}

#[derive(Debug)]
struct ConnMeta {
    tx: mpsc::Sender<BytesMut>,
    cids: Vec<ConnectionId>,
}

impl EndpointShared {
    fn new(socket: Arc<UdpSocket>, config: &QuicConfig, is_client: bool) -> Arc<Self> {
        let key_bytes = config.stateless_reset_key.unwrap_or_else(|| {
            let mut key = [0; 32];
            rand::rng().fill_bytes(&mut key);
            key
        });
        Arc::new(Self {
            socket,
            reset_key: hmac::Key::new(hmac::HMAC_SHA256, &key_bytes),
            cid_len: config.connection_id_length,
            is_client,
            shutdown: Notify::new(),
            state: Mutex::new(EndpointState::default()),
        })
    }

    /// Stateless reset token for a connection ID, derived with a keyed MAC
    /// so observing one token reveals nothing about any other cid's
    pub(crate) fn token_for(&self, cid: &ConnectionId) -> [u8; RESET_TOKEN_SIZE] {
        let tag = hmac::sign(&self.reset_key, cid);
        let mut token = [0; RESET_TOKEN_SIZE];
        token.copy_from_slice(&tag.as_ref()[..RESET_TOKEN_SIZE]);
        token
    }

    /// Whether a datagram is a stateless reset aimed at one of our
    /// connections, identified by a token a session registered
    pub(crate) fn is_stateless_reset(&self, datagram: &[u8]) -> Option<usize> {
        if datagram.len() < RESET_TOKEN_SIZE + 5 {
            return None;
        }
        let tail: [u8; RESET_TOKEN_SIZE] = datagram[datagram.len() - RESET_TOKEN_SIZE..]
            .try_into()
            .unwrap();
        self.state.lock().unwrap().reset_tokens.get(&tail).copied()
    }

    /// Record a reset token the peer told `conn` about
    pub(crate) fn add_peer_reset_token(&self, conn: usize, token: [u8; RESET_TOKEN_SIZE]) {
        self.state.lock().unwrap().reset_tokens.insert(token, conn);
    }

    /// Mint a fresh connection ID routed to `conn`, with its reset token
    pub(crate) fn issue_cid(
        &self,
        conn: usize,
    ) -> Option<(ConnectionId, [u8; RESET_TOKEN_SIZE])> {
        if self.cid_len == 0 {
            return None;
        }
        let cid = self.new_unique_cid();
        let mut state = self.state.lock().unwrap();
        let meta = state.connections.get_mut(conn)?;
        meta.cids.push(cid);
        state.by_cid.insert(cid, conn);
        Some((cid, self.token_for(&cid)))
    }

    fn new_unique_cid(&self) -> ConnectionId {
        let len = self.cid_len.min(MAX_CID_SIZE).max(4);
        loop {
            let cid = ConnectionId::random(len);
            if !self.state.lock().unwrap().by_cid.contains_key(&cid) {
                return cid;
            }
        }
    }

    fn insert_connection(&self, tx: mpsc::Sender<BytesMut>, cid: ConnectionId) -> usize {
        let mut state = self.state.lock().unwrap();
        let index = state.connections.insert(ConnMeta {
            tx,
            cids: vec![cid],
        });
        state.by_cid.insert(cid, index);
        index
    }

    pub(crate) fn remove_connection(&self, index: usize) {
        let mut state = self.state.lock().unwrap();
        if let Some(meta) = state.connections.try_remove(index) {
            for cid in meta.cids {
                state.by_cid.remove(&cid);
            }
        }
        state.reset_tokens.retain(|_, &mut conn| conn != index);
        let empty = state.connections.is_empty();
        drop(state);
        if empty && self.is_client {
            self.shutdown.notify_one();
        }
    }

    fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutting_down = true;
        state.connections.clear();
        state.by_cid.clear();
        drop(state);
        self.shutdown.notify_one();
    }

    async fn send_stateless_reset(&self, dst_cid: &ConnectionId, to: SocketAddr) {
        let mut buf = vec![0u8; 15];
        rand::rng().fill_bytes(&mut buf);
        buf[0] = (buf[0] & !LONG_HEADER_FORM) | 0x40;
        buf.extend_from_slice(&self.token_for(dst_cid));
        trace!(cid = %dst_cid, "sending stateless reset");
        let _ = self.socket.send_to(&buf, to).await;
    }
}

/// Socket read loop: demultiplex datagrams onto connections
async fn drive(
    shared: Arc<EndpointShared>,
    incoming: Option<mpsc::Sender<Session>>,
    tls: TlsConfig,
    config: QuicConfig,
) {
    let mut buf = vec![0u8; 65535];
    loop {
        let received = tokio::select! {
            received = shared.socket.recv_from(&mut buf) => received,
            _ = shared.shutdown.notified() => {
                debug!("endpoint shutting down");
                return;
            }
        };
        let (len, from) = match received {
            Ok(x) => x,
            Err(e) => {
                warn!(error = %e, "socket receive failed");
                continue;
            }
        };
        let datagram = BytesMut::from(&buf[..len]);
        route_datagram(&shared, datagram, from, incoming.as_ref(), &tls, &config).await;
    }
}

async fn route_datagram(
    shared: &Arc<EndpointShared>,
    datagram: BytesMut,
    from: SocketAddr,
    incoming: Option<&mpsc::Sender<Session>>,
    tls: &TlsConfig,
    config: &QuicConfig,
) {
    let Some(info) = DatagramInfo::parse(&datagram, shared.cid_len) else {
        return;
    };

    // Established connections route purely on the destination cid
    let route = {
        let state = shared.state.lock().unwrap();
        state
            .by_cid
            .get(&info.dst_cid)
            .and_then(|&index| state.connections.get(index).map(|meta| meta.tx.clone()))
    };
    if let Some(tx) = route {
        if tx.try_send(datagram).is_err() {
            trace!("dropping datagram for a busy connection");
        }
        return;
    }

    match info.kind {
        DatagramKind::Initial { src_cid, version } => {
            let Some(incoming) = incoming else {
                return;
            };
            if !config.versions.contains(&version) {
                debug!(version, "offering version negotiation");
                let vn = packet::version_negotiation(&src_cid, &info.dst_cid, &config.versions);
                let _ = shared.socket.send_to(&vn, from).await;
                return;
            }
            if datagram.len() < MIN_INITIAL_SIZE {
                trace!(len = datagram.len(), "dropping undersized Initial");
                return;
            }
            if shared.state.lock().unwrap().shutting_down {
                return;
            }
            debug!(%from, "incoming connection");
            let local_cid = shared.new_unique_cid();
            let (tx, rx) = mpsc::channel(DATAGRAM_QUEUE);
            let _ = tx.try_send(datagram);
            let index = shared.insert_connection(tx, local_cid);
            let session = Session::spawn(
                Side::Server,
                shared.socket.clone(),
                from,
                local_cid,
                // Replies go to the client's chosen source cid; Initial
                // protection is keyed from the cid the client targeted
                src_cid,
                info.dst_cid,
                shared.clone(),
                index,
                rx,
                tls,
                config,
            );
            let _ = incoming.try_send(session);
        }
        DatagramKind::OtherLong => {}
        DatagramKind::Short => {
            if let Some(conn) = shared.is_stateless_reset(&datagram) {
                // Hand it to the owning connection, which fails with a
                // distinguished error
                let tx = {
                    let state = shared.state.lock().unwrap();
                    state.connections.get(conn).map(|meta| meta.tx.clone())
                };
                if let Some(tx) = tx {
                    let _ = tx.try_send(datagram);
                }
                return;
            }
            // A short-header packet for an unknown cid: the sender holds
            // state for a connection we know nothing about
            if datagram.len() >= RESET_TOKEN_SIZE + 5 && !shared.is_client {
                shared.send_stateless_reset(&info.dst_cid, from).await;
            }
        }
    }
}

/// The routing-relevant fields of a datagram's first packet
///
/// Demultiplexing reads only the version-invariant header prefix: the
/// first byte, the version, and the connection IDs. Everything past that
/// (token, length, packet number) is connection state and is decoded by
/// the owning session via `packet::PartialDecode`. Keeping this reader
/// prefix-only also lets it accept datagrams a full decode would reject,
/// such as stateless resets wearing a random short header.
struct DatagramInfo {
    dst_cid: ConnectionId,
    kind: DatagramKind,
}

enum DatagramKind {
    Initial { src_cid: ConnectionId, version: u32 },
    OtherLong,
    Short,
}

impl DatagramInfo {
    fn parse(datagram: &[u8], local_cid_len: usize) -> Option<Self> {
        let first = *datagram.first()?;
        if first & LONG_HEADER_FORM != 0 {
            if datagram.len() < 7 {
                return None;
            }
            let version = u32::from_be_bytes(datagram[1..5].try_into().unwrap());
            let dcil = datagram[5] as usize;
            if dcil > MAX_CID_SIZE || datagram.len() < 6 + dcil + 1 {
                return None;
            }
            let dst_cid = ConnectionId::new(&datagram[6..6 + dcil]);
            let scil = datagram[6 + dcil] as usize;
            if scil > MAX_CID_SIZE || datagram.len() < 7 + dcil + scil {
                return None;
            }
            let src_cid = ConnectionId::new(&datagram[7 + dcil..7 + dcil + scil]);
            // Version Negotiation (version 0) can't be Initial
            let kind = if version != 0 && (first & 0x30) >> 4 == 0x0 {
                DatagramKind::Initial { src_cid, version }
            } else {
                DatagramKind::OtherLong
            };
            Some(Self { dst_cid, kind })
        } else {
            if datagram.len() < 1 + local_cid_len {
                return None;
            }
            Some(Self {
                dst_cid: ConnectionId::new(&datagram[1..1 + local_cid_len]),
                kind: DatagramKind::Short,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::setup::testing::ScriptedTls;
    use crate::{VarInt, VERSION};
    use std::time::Duration;
    use tokio::time::timeout;

    fn tls() -> TlsConfig {
        TlsConfig::new(Arc::new(ScriptedTls::default()))
    }

    fn localhost() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn pair(config: QuicConfig) -> (Listener, Session, Session) {
        let mut listener = Endpoint::listen(localhost(), tls(), config.clone())
            .await
            .unwrap();
        let addr = listener.local_addr();
        let (client, server) = timeout(Duration::from_secs(5), async {
            let dial = Endpoint::dial(addr, tls(), config);
            let (client, server) = tokio::join!(dial, listener.accept());
            (client.unwrap(), server.unwrap())
        })
        .await
        .expect("connection establishment timed out");
        (listener, client, server)
    }

    #[tokio::test]
    async fn handshake_and_echo() {
        let (_listener, client, server) = pair(QuicConfig::default()).await;

        let ((send, recv), accepted) = timeout(Duration::from_secs(5), async {
            tokio::join!(
                async { client.open_stream().await.unwrap() },
                async { server.accept_stream().await.unwrap() },
            )
        })
        .await
        .unwrap();
        let (server_send, server_recv) = accepted;

        timeout(Duration::from_secs(5), async {
            send.write_all(b"ping over quic").await.unwrap();
            send.finish().unwrap();

            let mut buf = [0; 64];
            let mut got = Vec::new();
            while let Some(n) = server_recv.read(&mut buf).await.unwrap() {
                got.extend_from_slice(&buf[..n]);
            }
            assert_eq!(&got, b"ping over quic");

            server_send.write_all(b"pong").await.unwrap();
            server_send.finish().unwrap();
            let mut got = Vec::new();
            while let Some(n) = recv.read(&mut buf).await.unwrap() {
                got.extend_from_slice(&buf[..n]);
            }
            assert_eq!(&got, b"pong");
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn uni_stream_transfer() {
        let (_listener, client, server) = pair(QuicConfig::default()).await;
        timeout(Duration::from_secs(5), async {
            let send = client.open_uni_stream().await.unwrap();
            // Large enough to span several packets
            let payload: Vec<u8> = (0..40_000u32).map(|i| i as u8).collect();
            send.write_all(&payload).await.unwrap();
            send.finish().unwrap();

            let recv = server.accept_uni_stream().await.unwrap();
            let mut got = Vec::new();
            let mut buf = [0; 4096];
            while let Some(n) = recv.read(&mut buf).await.unwrap() {
                got.extend_from_slice(&buf[..n]);
            }
            assert_eq!(got, payload);
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn application_close_propagates() {
        let (_listener, client, server) = pair(QuicConfig::default()).await;
        client.close_with_error(VarInt(17), b"going away");

        let err = timeout(Duration::from_secs(5), server.accept_stream())
            .await
            .unwrap()
            .unwrap_err();
        match err {
            ConnectionError::ApplicationClosed(close) => {
                assert_eq!(close.error_code, VarInt(17));
                assert_eq!(&close.reason[..], b"going away");
            }
            other => panic!("unexpected error: {other}"),
        }
        // The closing side observes its own close
        let err = client.accept_stream().await.unwrap_err();
        assert_eq!(err, ConnectionError::LocallyClosed);
    }

    #[tokio::test]
    async fn idle_timeout_closes_silently() {
        let config = QuicConfig {
            idle_timeout: Duration::from_millis(300),
            ..QuicConfig::default()
        };
        let (_listener, client, _server) = pair(config).await;
        let err = timeout(Duration::from_secs(5), client.accept_stream())
            .await
            .expect("idle timeout never fired")
            .unwrap_err();
        assert_eq!(err, ConnectionError::TimedOut);
    }

    #[tokio::test]
    async fn stateless_reset_recognised() {
        let mut reset_key = [0x42u8; 32];
        rand::rng().fill_bytes(&mut reset_key[..16]);
        let config = QuicConfig {
            stateless_reset_key: Some(reset_key),
            ..QuicConfig::default()
        };

        let (listener, client, server) = pair(config.clone()).await;
        let addr = listener.local_addr();

        // Move real data so the client has processed NEW_CONNECTION_ID and
        // switched to an issued cid
        timeout(Duration::from_secs(5), async {
            let send = client.open_uni_stream().await.unwrap();
            send.write_all(b"warmup").await.unwrap();
            send.finish().unwrap();
            let recv = server.accept_uni_stream().await.unwrap();
            let mut buf = [0; 16];
            while recv.read(&mut buf).await.unwrap().is_some() {}
        })
        .await
        .unwrap();

        // The server vanishes without a trace, then a fresh one binds the
        // same address with the same reset key
        listener.close();
        drop(listener);
        drop(server);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _fresh = Endpoint::listen(addr, tls(), config).await.unwrap();

        // The surviving client's writes eventually surface the reset
        let err = timeout(Duration::from_secs(10), async {
            loop {
                match client.open_uni_stream().await {
                    Ok(send) => {
                        if send.write_all(b"are you there?").await.is_err() {
                            // Stream-level failure; the connection error
                            // arrives momentarily
                        }
                    }
                    Err(err) => break err,
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        })
        .await
        .expect("reset never recognised");
        assert_eq!(err, ConnectionError::Reset);
    }

    #[tokio::test]
    async fn version_negotiation_offered() {
        let mut listener = Endpoint::listen(localhost(), tls(), QuicConfig::default())
            .await
            .unwrap();
        let addr = listener.local_addr();

        // A hand-rolled Initial with an unsupported version
        let mut datagram = vec![0xc0u8];
        datagram.extend_from_slice(&0x5a5a_5a5au32.to_be_bytes());
        datagram.push(8);
        datagram.extend_from_slice(&[0x11; 8]); // dcid
        datagram.push(8);
        datagram.extend_from_slice(&[0x22; 8]); // scid
        datagram.resize(1200, 0);

        let probe = UdpSocket::bind(localhost()).await.unwrap();
        probe.send_to(&datagram, addr).await.unwrap();
        let mut buf = [0u8; 1500];
        let (len, _) = timeout(Duration::from_secs(5), probe.recv_from(&mut buf))
            .await
            .expect("no version negotiation response")
            .unwrap();

        let response = &buf[..len];
        assert_eq!(response[0] & LONG_HEADER_FORM, LONG_HEADER_FORM);
        assert_eq!(&response[1..5], &[0, 0, 0, 0]); // version zero
        // Mirrored cids: our scid becomes the destination
        assert_eq!(response[5], 8);
        assert_eq!(&response[6..14], &[0x22; 8]);
        assert_eq!(response[14], 8);
        assert_eq!(&response[15..23], &[0x11; 8]);
        // Offered versions: v1 plus one greased entry
        let versions: Vec<u32> = response[23..]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes(c.try_into().unwrap()))
            .collect();
        assert!(versions.contains(&VERSION));
        assert_eq!(versions.len(), 2);
        assert!(versions
            .iter()
            .any(|&v| packet::is_reserved_version(v)));

        // No connection was created for it
        assert!(
            timeout(Duration::from_millis(300), listener.accept())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn token_derivation_is_keyed() {
        let config = QuicConfig::default();
        let socket = Arc::new(UdpSocket::bind(localhost()).await.unwrap());
        let a = EndpointShared::new(socket.clone(), &config, false);
        let b = EndpointShared::new(socket, &config, false);
        let cid = ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]);
        // Different random keys produce unrelated tokens for the same cid
        assert_ne!(a.token_for(&cid), b.token_for(&cid));
        // The same endpoint is deterministic
        assert_eq!(a.token_for(&cid), a.token_for(&cid));
    }
}
