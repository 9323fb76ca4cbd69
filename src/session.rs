//! The per-connection driver loop
//!
//! One cooperative task owns all mutable connection state: the sent-packet
//! handler, the per-space ACK trackers, the crypto setup, and membership
//! of the stream map. It multiplexes datagram arrival, timer expiry, and
//! send wakeups from application handles; everything else reaches it
//! through channels or the stream mutex.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, trace, warn};

use crate::config::{QuicConfig, TlsConfig};
use crate::crypto::setup::{CryptoEvent, CryptoSetup, KeyError, PeerParameters};
use crate::crypto::DirectionalKeys;
use crate::endpoint::EndpointShared;
use crate::frame::{self, ApplicationClose, Close, ConnectionClose, Frame};
use crate::packet::{
    ConnectionId, Header, LongType, Packet, PacketDecodeError, PacketNumber, PartialDecode,
    SpaceId,
};
use crate::recovery::{SendMode, SentPacket, SentPacketHandler};
use crate::streams::{RecvStream, SendStream, SharedStreams};
use crate::tracker::ReceivedPacketTracker;
use crate::transport_error::Error as TransportError;
use crate::{Dir, Side, VarInt, MIN_INITIAL_SIZE, RESET_TOKEN_SIZE};

/// Datagram budget for a single packet
const MAX_UDP_PAYLOAD: usize = 1200;

/// Undecryptable packets buffered while keys are pending
const MAX_UNDECRYPTABLE_PACKETS: usize = 10;

/// Packets sent per pass through the driver loop
const MAX_SEND_BURST: usize = 64;

/// Reasons why a connection terminated
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The peer doesn't implement any supported version
    #[error("peer doesn't implement any supported version")]
    VersionMismatch,
    /// The peer violated the QUIC specification as understood by this
    /// implementation
    #[error(transparent)]
    TransportError(#[from] TransportError),
    /// The peer's QUIC stack aborted the connection automatically
    #[error("closed by peer: {0}")]
    ConnectionClosed(ConnectionClose),
    /// The peer closed the connection
    #[error("closed by peer application: {0}")]
    ApplicationClosed(ApplicationClose),
    /// The peer is unable to continue processing this connection, usually
    /// due to having restarted
    #[error("received a stateless reset")]
    Reset,
    /// Communication with the peer has lapsed for longer than the idle
    /// timeout
    #[error("timed out")]
    TimedOut,
    /// The local application closed the connection
    #[error("closed")]
    LocallyClosed,
}

/// A QUIC connection
///
/// May be cloned freely; all handles refer to the same connection.
#[derive(Debug, Clone)]
pub struct Session {
    streams: Arc<SharedStreams>,
    shared: Arc<SessionShared>,
}

#[derive(Debug)]
pub(crate) struct SessionShared {
    connected_tx: watch::Sender<bool>,
    closed: Mutex<Option<ConnectionError>>,
    close_request: Mutex<Option<ApplicationClose>>,
    close_notify: Notify,
    remote: SocketAddr,
}

impl SessionShared {
    fn set_closed(&self, err: ConnectionError) {
        let mut closed = self.closed.lock().unwrap();
        if closed.is_none() {
            *closed = Some(err);
        }
        // Wake anyone blocked on connection establishment
        let _ = self.connected_tx.send(true);
    }

    fn closed(&self) -> Option<ConnectionError> {
        self.closed.lock().unwrap().clone()
    }
}

impl Session {
    /// Construct a connection and spawn its driver task
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        side: Side,
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
        local_cid: ConnectionId,
        dest_cid: ConnectionId,
        initial_keys_cid: ConnectionId,
        endpoint: Arc<EndpointShared>,
        conn_index: usize,
        datagrams: mpsc::Receiver<BytesMut>,
        tls: &TlsConfig,
        config: &QuicConfig,
    ) -> Self {
        let streams = SharedStreams::new(
            side,
            config.max_incoming_streams,
            config.max_incoming_uni_streams,
        );
        let (connected_tx, _) = watch::channel(false);
        let shared = Arc::new(SessionShared {
            connected_tx,
            closed: Mutex::new(None),
            close_request: Mutex::new(None),
            close_notify: Notify::new(),
            remote,
        });

        // The crypto machinery keys Initial packets off the client's first
        // DCID, which on the server differs from where replies are sent
        let (crypto, tls_handle, crypto_events) = CryptoSetup::new(side, &initial_keys_cid);
        tls.provider.start(side, tls_handle);

        let driver = Driver {
            side,
            socket,
            remote,
            local_cid,
            dest_cid,
            endpoint,
            conn_index,
            datagrams,
            crypto,
            crypto_events,
            recovery: SentPacketHandler::new(0),
            trackers: [
                Some(ReceivedPacketTracker::new()),
                Some(ReceivedPacketTracker::new()),
                Some(ReceivedPacketTracker::new()),
            ],
            largest_recv_pn: [None; 3],
            streams: streams.clone(),
            shared: shared.clone(),
            pending_control: VecDeque::new(),
            undecryptable: VecDeque::new(),
            peer_reset_tokens: Vec::new(),
            retry_token: Bytes::new(),
            idle_timeout: config.idle_timeout,
            keep_alive: config.keep_alive,
            last_activity: Instant::now(),
            last_send: Instant::now(),
            handshake_complete: false,
            handshake_confirmed: false,
            dest_cid_confirmed: side == Side::Server,
            dest_cid_upgraded: false,
        };
        tokio::spawn(driver.run());

        Self { streams, shared }
    }

    /// Address of the peer
    pub fn remote_address(&self) -> SocketAddr {
        self.shared.remote
    }

    /// Wait until the handshake completes or fails
    pub async fn handshake_completed(&self) -> Result<(), ConnectionError> {
        let mut rx = self.shared.connected_tx.subscribe();
        let _ = rx.wait_for(|&connected| connected).await;
        match self.shared.closed() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Open a bidirectional stream
    pub async fn open_stream(&self) -> Result<(SendStream, RecvStream), ConnectionError> {
        if let Some(err) = self.shared.closed() {
            return Err(err);
        }
        let (_, send, recv) = self.streams.open_stream_wait(Dir::Bi).await?;
        Ok((send, recv.expect("bidirectional stream has a receive half")))
    }

    /// Open a unidirectional stream
    pub async fn open_uni_stream(&self) -> Result<SendStream, ConnectionError> {
        if let Some(err) = self.shared.closed() {
            return Err(err);
        }
        let (_, send, _) = self.streams.open_stream_wait(Dir::Uni).await?;
        Ok(send)
    }

    /// Wait for the peer to open a bidirectional stream
    pub async fn accept_stream(&self) -> Result<(SendStream, RecvStream), ConnectionError> {
        let (_, send, recv) = self.streams.accept_stream(Dir::Bi).await?;
        Ok((send.expect("bidirectional stream has a send half"), recv))
    }

    /// Wait for the peer to open a unidirectional stream
    pub async fn accept_uni_stream(&self) -> Result<RecvStream, ConnectionError> {
        let (_, _, recv) = self.streams.accept_stream(Dir::Uni).await?;
        Ok(recv)
    }

    /// Close the connection, notifying the peer with an application error
    ///
    /// A CONNECTION_CLOSE is attempted once, best-effort. All pending
    /// operations fail with the close reason.
    pub fn close_with_error(&self, code: VarInt, reason: &[u8]) {
        {
            let mut request = self.shared.close_request.lock().unwrap();
            if request.is_some() || self.shared.closed().is_some() {
                return;
            }
            *request = Some(ApplicationClose {
                error_code: code,
                reason: Bytes::copy_from_slice(reason),
            });
        }
        self.shared.close_notify.notify_one();
    }
}

struct Driver {
    side: Side,
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    local_cid: ConnectionId,
    dest_cid: ConnectionId,
    endpoint: Arc<EndpointShared>,
    conn_index: usize,
    datagrams: mpsc::Receiver<BytesMut>,
    crypto: CryptoSetup,
    crypto_events: mpsc::UnboundedReceiver<CryptoEvent>,
    recovery: SentPacketHandler,
    trackers: [Option<ReceivedPacketTracker>; 3],
    largest_recv_pn: [Option<u64>; 3],
    streams: Arc<SharedStreams>,
    shared: Arc<SessionShared>,
    pending_control: VecDeque<Frame>,
    undecryptable: VecDeque<BytesMut>,
    /// Tokens identifying a stateless reset from the peer
    peer_reset_tokens: Vec<[u8; RESET_TOKEN_SIZE]>,
    /// Token to echo in Initial packets after a Retry
    retry_token: Bytes,
    idle_timeout: Duration,
    keep_alive: bool,
    /// Time of the last received ack-eliciting packet
    last_activity: Instant,
    last_send: Instant,
    handshake_complete: bool,
    handshake_confirmed: bool,
    /// Whether `dest_cid` is final; clients adopt the server's first SCID
    dest_cid_confirmed: bool,
    /// Whether we've switched to a cid issued via NEW_CONNECTION_ID
    dest_cid_upgraded: bool,
}

enum Exit {
    /// Close silently, without a CONNECTION_CLOSE
    Silent(ConnectionError),
    /// Close with a transport-level CONNECTION_CLOSE
    Transport(TransportError),
    /// Close with an application-level CONNECTION_CLOSE
    Application(ApplicationClose),
    /// The peer closed first; no reply needed
    Peer(ConnectionError),
}

impl Driver {
    async fn run(mut self) {
        let exit = self.run_inner().await;
        let (err, close_frame) = match exit {
            Exit::Silent(err) => (err, None),
            Exit::Transport(e) => {
                let frame = Close::Connection(ConnectionClose::from(e.clone()));
                (ConnectionError::TransportError(e), Some(frame))
            }
            Exit::Application(close) => (
                ConnectionError::LocallyClosed,
                Some(Close::Application(close)),
            ),
            Exit::Peer(err) => (err, None),
        };
        if let Some(frame) = close_frame {
            // One attempt, no retry
            let _ = self.send_close_packet(frame).await;
        }
        debug!(error = %err, "connection closed");
        self.crypto.close();
        self.streams.state.lock().unwrap().close(err.clone());
        self.shared.set_closed(err);
        self.endpoint.remove_connection(self.conn_index);
    }

    async fn run_inner(&mut self) -> Exit {
        enum Event {
            Datagram(Option<BytesMut>),
            Crypto(Option<CryptoEvent>),
            Wake,
            Timer,
        }

        loop {
            if let Some(close) = self.shared.close_request.lock().unwrap().take() {
                return Exit::Application(close);
            }
            if let Err(e) = self.send_pending().await {
                return e;
            }

            let deadline = self.next_deadline();
            let event = tokio::select! {
                datagram = self.datagrams.recv() => Event::Datagram(datagram),
                event = self.crypto_events.recv() => Event::Crypto(event),
                _ = self.streams.wake.notified() => Event::Wake,
                _ = self.shared.close_notify.notified() => Event::Wake,
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                    Event::Timer
                }
            };
            let result = match event {
                Event::Datagram(Some(datagram)) => self.handle_datagram(datagram).await,
                // The endpoint went away
                Event::Datagram(None) => return Exit::Silent(ConnectionError::LocallyClosed),
                Event::Crypto(Some(event)) => self.handle_crypto_event(event).await,
                Event::Crypto(None) => Ok(()),
                Event::Wake => Ok(()),
                Event::Timer => self.handle_timers(Instant::now()),
            };
            if let Err(exit) = result {
                return exit;
            }
        }
    }

    fn next_deadline(&self) -> Instant {
        let mut deadline = self.last_activity + self.idle_timeout;
        if let Some(alarm) = self.recovery.get_alarm_timeout() {
            deadline = deadline.min(alarm);
        }
        for tracker in self.trackers.iter().flatten() {
            if let Some(alarm) = tracker.get_alarm_timeout() {
                deadline = deadline.min(alarm);
            }
        }
        if self.keep_alive && self.handshake_complete {
            deadline = deadline.min(self.last_send + self.idle_timeout / 2);
        }
        deadline
    }

    fn handle_timers(&mut self, now: Instant) -> Result<(), Exit> {
        if now.saturating_duration_since(self.last_activity) >= self.idle_timeout {
            // Silent close: no CONNECTION_CLOSE for an idle peer
            return Err(Exit::Silent(ConnectionError::TimedOut));
        }
        if let Some(alarm) = self.recovery.get_alarm_timeout() {
            if alarm <= now {
                self.recovery.on_alarm(now);
            }
        }
        if self.keep_alive
            && self.handshake_complete
            && now.saturating_duration_since(self.last_send) >= self.idle_timeout / 2
        {
            self.pending_control.push_back(Frame::Ping);
        }
        // ACK alarms need no explicit action: expiry makes get_ack_frame
        // produce a frame on the next send pass
        Ok(())
    }

    async fn handle_crypto_event(&mut self, event: CryptoEvent) -> Result<(), Exit> {
        match event {
            CryptoEvent::ClientHelloWritten | CryptoEvent::WriteScheduled => {}
            CryptoEvent::KeysInstalled => {
                // Buffered packets may decrypt now
                let pending: Vec<_> = self.undecryptable.drain(..).collect();
                for datagram in pending {
                    self.handle_datagram(datagram).await?;
                }
            }
            CryptoEvent::ReceivedParams(params) => self.apply_peer_params(params),
            CryptoEvent::HandshakeComplete => {
                debug!(side = ?self.side, "handshake complete");
                self.handshake_complete = true;
                let _ = self.shared.connected_tx.send(true);
                if self.side == Side::Server {
                    self.pending_control.push_back(Frame::HandshakeDone);
                    // Give the client a fresh connection ID along with the
                    // token that lets it recognise a stateless reset
                    if let Some((cid, token)) = self.endpoint.issue_cid(self.conn_index) {
                        self.pending_control
                            .push_back(Frame::NewConnectionId(frame::NewConnectionId {
                                sequence: 1,
                                retire_prior_to: 0,
                                id: cid,
                                reset_token: token,
                            }));
                    }
                }
            }
            CryptoEvent::Error(e) => return Err(Exit::Transport(e)),
        }
        Ok(())
    }

    fn apply_peer_params(&mut self, params: PeerParameters) {
        if let Some(token) = params.stateless_reset_token {
            self.peer_reset_tokens.push(token);
            self.endpoint.add_peer_reset_token(self.conn_index, token);
        }
        self.streams.state.lock().unwrap().set_peer_limits(
            params.initial_max_data,
            params.initial_max_streams_bidi,
            params.initial_max_streams_uni,
        );
    }

    async fn handle_datagram(&mut self, mut data: BytesMut) -> Result<(), Exit> {
        while !data.is_empty() {
            let (partial, rest) = match PartialDecode::new(data, self.local_cid.len()) {
                Ok(x) => x,
                Err(PacketDecodeError::UnsupportedVersion { .. }) => {
                    // Servers answer at the endpoint; clients treat this as
                    // garbage unless it's a genuine Version Negotiation
                    return Ok(());
                }
                Err(e) => {
                    trace!(error = %e, "dropping undecodable datagram");
                    return Ok(());
                }
            };
            self.handle_packet(partial).await?;
            data = match rest {
                Some(rest) => rest,
                None => break,
            };
        }
        Ok(())
    }

    async fn handle_packet(&mut self, partial: PartialDecode) -> Result<(), Exit> {
        let space = match partial.space() {
            Some(space) => space,
            None => {
                // Retry or Version Negotiation
                let packet = match partial.finish(None) {
                    Ok(packet) => packet,
                    Err(_) => return Ok(()),
                };
                return self.handle_unprotected(packet);
            }
        };

        let len = partial.len();
        let keys = match self.crypto.get_opener(space) {
            Ok(keys) => keys,
            Err(KeyError::NotYetAvailable) => {
                trace!(%space, "buffering packet until keys arrive");
                if self.undecryptable.len() == MAX_UNDECRYPTABLE_PACKETS {
                    self.undecryptable.pop_front();
                }
                let mut copy = BytesMut::with_capacity(len);
                copy.extend_from_slice(partial.data());
                self.undecryptable.push_back(copy);
                return Ok(());
            }
            Err(KeyError::Dropped) => {
                trace!(%space, "dropping packet for discarded keys");
                return Ok(());
            }
        };

        let raw = partial.data().to_vec();
        let mut packet = match partial.finish(Some(&keys.header)) {
            Ok(packet) => packet,
            Err(e) => {
                trace!(error = %e, "dropping malformed packet");
                return Ok(());
            }
        };
        if !packet.reserved_bits_valid() {
            return Err(Exit::Transport(TransportError::PROTOCOL_VIOLATION(
                "reserved bits set",
            )));
        }

        let expected = self.largest_recv_pn[space as usize].map_or(0, |x| x + 1);
        let pn = packet
            .header
            .number()
            .expect("protected packets carry a number")
            .expand(expected);

        if keys
            .packet
            .decrypt(pn, &packet.header_data, &mut packet.payload)
            .is_err()
        {
            // Failed authentication might be a stateless reset in disguise
            if self.is_stateless_reset(&raw) {
                return Err(Exit::Peer(ConnectionError::Reset));
            }
            trace!(pn, %space, "packet failed authentication");
            return Ok(());
        }

        if self.trackers[space as usize]
            .as_ref()
            .map_or(true, |t| t.is_duplicate(pn))
        {
            trace!(pn, %space, "dropping duplicate packet");
            return Ok(());
        }
        self.largest_recv_pn[space as usize] =
            Some(self.largest_recv_pn[space as usize].map_or(pn, |x| x.max(pn)));

        // A client confirms its destination cid from the server's first
        // long-header response
        if !self.dest_cid_confirmed {
            if let Header::Initial { src_cid, .. } | Header::Long { src_cid, .. } = &packet.header {
                self.dest_cid = *src_cid;
                self.dest_cid_confirmed = true;
            }
        }

        let payload = packet.payload.freeze();
        let ack_eliciting = self.process_frames(payload, space).await?;

        let now = Instant::now();
        if ack_eliciting {
            self.last_activity = now;
        }
        if let Some(tracker) = self.trackers[space as usize].as_mut() {
            tracker
                .received_packet(pn, now, ack_eliciting, self.recovery.rtt())
                .map_err(Exit::Transport)?;
        }
        Ok(())
    }

    fn handle_unprotected(&mut self, packet: Packet) -> Result<(), Exit> {
        match packet.header {
            Header::VersionNegotiate {
                supported_versions, ..
            } => {
                if self.side == Side::Client
                    && !self.handshake_complete
                    && !supported_versions.contains(&crate::VERSION)
                {
                    return Err(Exit::Silent(ConnectionError::VersionMismatch));
                }
                Ok(())
            }
            Header::Retry {
                src_cid, token, ..
            } => {
                if self.side == Side::Client && !self.handshake_complete && !token.is_empty() {
                    debug!("retrying with token from server");
                    self.dest_cid = src_cid;
                    self.retry_token = token;
                    self.crypto.change_connection_id(&src_cid);
                    self.recovery.reset_for_retry();
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Dispatch every frame of a decrypted packet
    ///
    /// Returns whether the packet was ack-eliciting.
    async fn process_frames(&mut self, payload: Bytes, space: SpaceId) -> Result<bool, Exit> {
        let mut ack_eliciting = false;
        let iter = frame::Iter::new(payload).map_err(Exit::Transport)?;
        for result in iter {
            let frame = result.map_err(Exit::Transport)?;
            ack_eliciting |= frame.is_ack_eliciting();
            self.process_frame(frame, space).await?;
        }
        Ok(ack_eliciting)
    }

    async fn process_frame(&mut self, frame: Frame, space: SpaceId) -> Result<(), Exit> {
        match frame {
            Frame::Padding | Frame::Ping => {}
            Frame::Ack(ack) => {
                let now = Instant::now();
                let settled = self
                    .recovery
                    .received_ack(&ack, space, now)
                    .map_err(Exit::Transport)?;
                if space == SpaceId::Data {
                    if !settled.is_empty() {
                        let mut streams = self.streams.state.lock().unwrap();
                        for packet in &settled {
                            for frame in &packet.frames {
                                streams.frame_acked(frame);
                            }
                        }
                    }
                    if !self.handshake_confirmed && self.handshake_complete {
                        self.confirm_handshake();
                    }
                    // Let the peer's tracker discard state we've confirmed
                    if let Some(tracker) = self.trackers[SpaceId::Data as usize].as_mut() {
                        tracker.ignore_below(
                            self.recovery.get_lowest_packet_not_confirmed_acked(),
                        );
                    }
                }
            }
            Frame::Crypto(crypto) => {
                self.crypto
                    .handle_crypto_frame(&crypto, space)
                    .await
                    .map_err(Exit::Transport)?;
            }
            Frame::Stream(stream) => {
                self.with_streams(|streams| streams.received_stream_frame(&stream))?;
            }
            Frame::ResetStream(reset) => {
                self.with_streams(|streams| streams.received_reset_stream(&reset))?;
            }
            Frame::StopSending(stop) => {
                self.with_streams(|streams| streams.received_stop_sending(&stop))?;
            }
            Frame::MaxData(limit) => {
                self.with_streams(|streams| {
                    streams.received_max_data(limit.into_inner());
                    Ok(())
                })?;
            }
            Frame::MaxStreamData { id, offset } => {
                self.with_streams(|streams| streams.received_max_stream_data(id, offset))?;
            }
            Frame::MaxStreams { dir, count } => {
                self.with_streams(|streams| {
                    streams.received_max_streams(dir, count);
                    Ok(())
                })?;
            }
            Frame::DataBlocked { offset } => {
                trace!(offset, "peer is blocked on connection flow control");
            }
            Frame::StreamDataBlocked { id, offset } => {
                trace!(%id, offset, "peer is blocked on stream flow control");
            }
            Frame::StreamsBlocked { dir, limit } => {
                trace!(%dir, limit, "peer is blocked on the stream limit");
            }
            Frame::NewConnectionId(ncid) => {
                self.peer_reset_tokens.push(ncid.reset_token);
                self.endpoint
                    .add_peer_reset_token(self.conn_index, ncid.reset_token);
                if self.side == Side::Client && !self.dest_cid_upgraded {
                    // Move off the handshake cid; its issuer can then
                    // recognise us purely through the reset-token scheme
                    self.dest_cid = ncid.id;
                    self.dest_cid_upgraded = true;
                    self.pending_control
                        .push_back(Frame::RetireConnectionId { sequence: 0 });
                }
            }
            Frame::RetireConnectionId { sequence } => {
                trace!(sequence, "peer retired a connection ID");
            }
            Frame::PathChallenge(token) => {
                self.pending_control.push_back(Frame::PathResponse(token));
            }
            Frame::PathResponse(_) => {}
            Frame::NewToken(_) => {}
            Frame::HandshakeDone => {
                if self.side == Side::Server {
                    return Err(Exit::Transport(TransportError::PROTOCOL_VIOLATION(
                        "client sent HANDSHAKE_DONE",
                    )));
                }
                self.confirm_handshake();
            }
            Frame::Close(close) => {
                let err = match close {
                    Close::Connection(close) => ConnectionError::ConnectionClosed(close),
                    Close::Application(close) => ConnectionError::ApplicationClosed(close),
                };
                return Err(Exit::Peer(err));
            }
        }
        Ok(())
    }

    fn with_streams(
        &self,
        f: impl FnOnce(&mut crate::streams::StreamsState) -> Result<(), TransportError>,
    ) -> Result<(), Exit> {
        let mut state = self.streams.state.lock().unwrap();
        f(&mut state).map_err(Exit::Transport)
    }

    /// The handshake is confirmed: Initial and Handshake keys retire
    fn confirm_handshake(&mut self) {
        if self.handshake_confirmed {
            return;
        }
        self.handshake_confirmed = true;
        for space in self.crypto.received_1rtt_ack() {
            self.recovery.drop_packets(space);
            self.trackers[space as usize] = None;
            self.largest_recv_pn[space as usize] = None;
        }
    }

    fn is_stateless_reset(&self, datagram: &[u8]) -> bool {
        if datagram.len() < RESET_TOKEN_SIZE + 5 {
            return false;
        }
        let tail = &datagram[datagram.len() - RESET_TOKEN_SIZE..];
        self.peer_reset_tokens.iter().any(|token| token == tail)
    }

    //
    // Sending
    //

    async fn send_pending(&mut self) -> Result<(), Exit> {
        // Cap the burst; anything left over re-wakes the loop immediately
        let mut budget = MAX_SEND_BURST.max(self.recovery.should_send_num_packets());
        loop {
            if budget == 0 {
                self.streams.wake.notify_one();
                return Ok(());
            }
            let sent = match self.recovery.send_mode() {
                SendMode::None => false,
                SendMode::Ack => self.send_ack_packets().await?,
                SendMode::Pto => {
                    let packet = self.recovery.dequeue_probe_packet();
                    match packet {
                        Some(packet) => self.send_retransmission(packet).await?,
                        None => {
                            self.pending_control.push_back(Frame::Ping);
                            self.send_any_packet().await?
                        }
                    }
                }
                SendMode::Retransmission => {
                    match self.recovery.dequeue_packet_for_retransmission() {
                        Some(packet) => self.send_retransmission(packet).await?,
                        None => false,
                    }
                }
                SendMode::Any => {
                    // Always flush ACKs, even when there's nothing else
                    let acked = self.send_ack_packets().await?;
                    self.send_any_packet().await? || acked
                }
            };
            if !sent {
                return Ok(());
            }
            budget -= 1;
        }
    }

    /// Send pure-ACK packets for every space with an acknowledgement due
    async fn send_ack_packets(&mut self) -> Result<bool, Exit> {
        let now = Instant::now();
        let mut sent = false;
        for space in SpaceId::iter() {
            let ack = match self.trackers[space as usize]
                .as_mut()
                .and_then(|t| t.get_ack_frame(now))
            {
                Some(ack) => ack,
                None => continue,
            };
            let keys = match self.crypto.get_sealer_with_level(space) {
                Ok(keys) => keys,
                Err(_) => continue,
            };
            self.transmit(space, &keys, vec![Frame::Ack(ack)]).await?;
            sent = true;
        }
        Ok(sent)
    }

    /// Re-send the frames of a lost or probed packet
    async fn send_retransmission(&mut self, packet: SentPacket) -> Result<bool, Exit> {
        let keys = match self.crypto.get_sealer_with_level(packet.space) {
            // Keys are gone; the data is obsolete
            Err(_) => return Ok(true),
            Ok(keys) => keys,
        };
        let space = packet.space;
        let frames = packet.frames.clone();
        if frames.is_empty() {
            return Ok(true);
        }
        let pn = self
            .transmit_inner(space, &keys, frames, true, Some(packet.pn))
            .await?;
        trace!(original = packet.pn, retransmission = pn, %space, "retransmitted");
        Ok(true)
    }

    /// Build and send one packet of fresh data, highest-priority level first
    async fn send_any_packet(&mut self) -> Result<bool, Exit> {
        // Handshake data first, at the lowest level with bytes pending
        for space in [SpaceId::Initial, SpaceId::Handshake] {
            if !self.crypto.has_crypto_pending(space) {
                continue;
            }
            let keys = match self.crypto.get_sealer_with_level(space) {
                Ok(keys) => keys,
                Err(_) => continue,
            };
            let mut frames = Vec::new();
            if let Some(ack) = self.trackers[space as usize]
                .as_mut()
                .and_then(|t| t.get_ack_frame(Instant::now()))
            {
                frames.push(Frame::Ack(ack));
            }
            let budget = self.payload_budget(&frames);
            if let Some(crypto) = self.crypto.poll_crypto_frame(space, budget) {
                frames.push(Frame::Crypto(crypto));
            }
            if frames.is_empty() {
                continue;
            }
            self.transmit(space, &keys, frames).await?;
            return Ok(true);
        }

        // Then application data at 1-RTT
        let keys = match self.crypto.get_sealer_with_level(SpaceId::Data) {
            Ok(keys) => keys,
            Err(_) => return Ok(false),
        };
        let mut frames: Vec<Frame> = self.pending_control.drain(..).collect();
        if let Some(crypto) = self
            .crypto
            .poll_crypto_frame(SpaceId::Data, self.payload_budget(&frames))
        {
            frames.push(Frame::Crypto(crypto));
        }
        {
            let budget = self.payload_budget(&frames);
            let mut streams = self.streams.state.lock().unwrap();
            frames.extend(streams.poll_transmit(budget));
        }
        if frames.is_empty() {
            return Ok(false);
        }
        if let Some(ack) = self.trackers[SpaceId::Data as usize]
            .as_mut()
            .and_then(|t| t.get_ack_frame(Instant::now()))
        {
            frames.insert(0, Frame::Ack(ack));
        }
        self.transmit(SpaceId::Data, &keys, frames).await?;
        Ok(true)
    }

    fn payload_budget(&self, frames: &[Frame]) -> usize {
        let used: usize = frames.iter().map(Frame::size).sum();
        // Leave room for the header, packet number, and AEAD tag
        (MAX_UDP_PAYLOAD - 64).saturating_sub(used)
    }

    async fn transmit(
        &mut self,
        space: SpaceId,
        keys: &Arc<DirectionalKeys>,
        frames: Vec<Frame>,
    ) -> Result<u64, Exit> {
        self.transmit_inner(space, keys, frames, false, None).await
    }

    async fn transmit_inner(
        &mut self,
        space: SpaceId,
        keys: &Arc<DirectionalKeys>,
        frames: Vec<Frame>,
        is_retransmission: bool,
        retransmission_of: Option<u64>,
    ) -> Result<u64, Exit> {
        let pn = self.recovery.pop_packet_number(space);
        let largest_acked = self.recovery.largest_acked(space).unwrap_or(0);
        let number = PacketNumber::new(pn, largest_acked);

        let header = match space {
            SpaceId::Initial => Header::Initial {
                dst_cid: self.dest_cid,
                src_cid: self.local_cid,
                token: self.retry_token.clone(),
                number,
            },
            SpaceId::Handshake => Header::Long {
                ty: LongType::Handshake,
                dst_cid: self.dest_cid,
                src_cid: self.local_cid,
                number,
            },
            SpaceId::Data => Header::Short {
                spin: false,
                key_phase: false,
                dst_cid: self.dest_cid,
                number,
            },
        };

        let mut buf = Vec::with_capacity(MAX_UDP_PAYLOAD);
        let encode = header.encode(&mut buf);
        let header_len = buf.len();
        for frame in &frames {
            frame.encode(&mut buf);
        }
        // Enough payload for the header protection sample, and full-size
        // datagrams for client Initials
        let min_payload_len = 4;
        if buf.len() - header_len < min_payload_len {
            buf.resize(header_len + min_payload_len, 0);
        }
        if self.side == Side::Client && space == SpaceId::Initial {
            let target = MIN_INITIAL_SIZE - keys.packet.tag_len();
            if buf.len() < target {
                buf.resize(target, 0);
            }
        }
        buf.resize(buf.len() + keys.packet.tag_len(), 0);
        encode.finish(&mut buf, &keys.header, Some((pn, &keys.packet)));

        if let Err(e) = self.socket.send_to(&buf, self.remote).await {
            warn!(error = %e, "failed to send datagram");
        }
        let now = Instant::now();
        self.last_send = now;
        trace!(pn, %space, len = buf.len(), frames = frames.len(), "sent packet");

        let largest_acked_in_packet = frames.iter().find_map(|f| match f {
            Frame::Ack(ack) => Some(ack.largest_acked()),
            _ => None,
        });
        let retransmittable: Vec<Frame> = frames
            .into_iter()
            .filter(|f| !matches!(f, Frame::Ack(_) | Frame::Padding | Frame::Close(_)))
            .collect();
        let sent = SentPacket::new(
            pn,
            space,
            now,
            buf.len() as u64,
            retransmittable,
            largest_acked_in_packet,
        );
        if is_retransmission {
            self.recovery
                .sent_packets_as_retransmission(vec![sent], retransmission_of.unwrap_or(pn));
        } else {
            self.recovery.sent_packet(sent);
        }
        Ok(pn)
    }

    /// Best-effort CONNECTION_CLOSE on the way out
    async fn send_close_packet(&mut self, close: Close) -> Result<(), ()> {
        let (space, keys) = self.crypto.get_sealer();
        let pn = self.recovery.pop_packet_number(space);
        let number = PacketNumber::new(pn, self.recovery.largest_acked(space).unwrap_or(0));
        let header = match space {
            SpaceId::Initial => Header::Initial {
                dst_cid: self.dest_cid,
                src_cid: self.local_cid,
                token: self.retry_token.clone(),
                number,
            },
            SpaceId::Handshake => Header::Long {
                ty: LongType::Handshake,
                dst_cid: self.dest_cid,
                src_cid: self.local_cid,
                number,
            },
            SpaceId::Data => Header::Short {
                spin: false,
                key_phase: false,
                dst_cid: self.dest_cid,
                number,
            },
        };
        let mut buf = Vec::with_capacity(MAX_UDP_PAYLOAD);
        let encode = header.encode(&mut buf);
        let header_len = buf.len();
        Frame::Close(close).encode(&mut buf);
        if buf.len() - header_len < 4 {
            buf.resize(header_len + 4, 0);
        }
        buf.resize(buf.len() + keys.packet.tag_len(), 0);
        encode.finish(&mut buf, &keys.header, Some((pn, &keys.packet)));
        self.socket.send_to(&buf, self.remote).await.map_err(|_| ())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_error_display() {
        assert_eq!(ConnectionError::TimedOut.to_string(), "timed out");
        assert_eq!(
            ConnectionError::Reset.to_string(),
            "received a stateless reset"
        );
        let e = ConnectionError::TransportError(TransportError::PROTOCOL_VIOLATION("nope"));
        assert!(e.to_string().contains("protocol compliance"));
    }

    #[test]
    fn exit_maps_to_close_frames() {
        let close = ApplicationClose {
            error_code: VarInt(7),
            reason: Bytes::from_static(b"done"),
        };
        match Exit::Application(close.clone()) {
            Exit::Application(c) => assert_eq!(c, close),
            _ => unreachable!(),
        }
    }
}
