//! Glue between the TLS provider and the three encryption levels
//!
//! TLS 1.3 message processing lives outside this crate, behind
//! [`TlsProvider`]. The provider runs in its own task and talks to the
//! connection exclusively through a [`TlsHandle`]: it reads handshake
//! messages the session received in CRYPTO frames, writes its own
//! handshake records back, and installs traffic secrets as the handshake
//! advances. Each direction's encryption level progresses independently
//! through Initial, Handshake, and 1-RTT as keys are installed.

use std::fmt;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::frame;
use crate::packet::{ConnectionId, SpaceId};
use crate::streams::recv::RecvBuffer;
use crate::streams::DEFAULT_MAX_INCOMING_STREAMS;
use crate::transport_error::Error as TransportError;
use crate::Side;

use super::{key_schedule, DirectionalKeys, Suite};

/// TLS unexpected_message alert
const ALERT_UNEXPECTED_MESSAGE: u8 = 10;

/// TLS handshake message types
const TYPE_CLIENT_HELLO: u8 = 1;
const TYPE_SERVER_HELLO: u8 = 2;
const TYPE_NEW_SESSION_TICKET: u8 = 4;
const TYPE_ENCRYPTED_EXTENSIONS: u8 = 8;
const TYPE_CERTIFICATE: u8 = 11;
const TYPE_CERTIFICATE_REQUEST: u8 = 13;
const TYPE_CERTIFICATE_VERIFY: u8 = 15;
const TYPE_FINISHED: u8 = 20;

/// Upper bound on buffered handshake bytes per level
const MAX_CRYPTO_BUFFER: usize = 1 << 20;

fn message_type_name(ty: u8) -> &'static str {
    match ty {
        TYPE_CLIENT_HELLO => "ClientHello",
        TYPE_SERVER_HELLO => "ServerHello",
        TYPE_NEW_SESSION_TICKET => "NewSessionTicket",
        TYPE_ENCRYPTED_EXTENSIONS => "EncryptedExtensions",
        TYPE_CERTIFICATE => "Certificate",
        TYPE_CERTIFICATE_REQUEST => "CertificateRequest",
        TYPE_CERTIFICATE_VERIFY => "CertificateVerify",
        TYPE_FINISHED => "Finished",
        _ => "unknown",
    }
}

/// Transport-level settings a peer announces during the handshake
#[derive(Debug, Clone, Default)]
pub struct PeerParameters {
    /// Connection-level flow control limit
    pub initial_max_data: u64,
    /// Bidirectional streams we may open
    pub initial_max_streams_bidi: u64,
    /// Unidirectional streams we may open
    pub initial_max_streams_uni: u64,
    /// Token recognising a stateless reset of this connection
    pub stateless_reset_token: Option<[u8; 16]>,
}

impl PeerParameters {
    pub(crate) fn default_limits() -> Self {
        Self {
            initial_max_data: 768 * 1024,
            initial_max_streams_bidi: DEFAULT_MAX_INCOMING_STREAMS,
            initial_max_streams_uni: DEFAULT_MAX_INCOMING_STREAMS,
            stateless_reset_token: None,
        }
    }
}

/// Drives the TLS 1.3 handshake for connections
///
/// Implementations run the handshake in a task of their own, consuming and
/// producing raw handshake messages through the [`TlsHandle`]. The
/// connection never interprets handshake internals beyond the first byte
/// of each message.
pub trait TlsProvider: Send + Sync + fmt::Debug {
    /// Launch the handshake driver for one connection
    fn start(&self, side: Side, io: TlsHandle);
}

/// The handshake side of the connection has shut down
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("connection closed during handshake")]
pub struct HandshakeClosed;

/// Asynchronous notifications out of the crypto machinery
#[derive(Debug)]
pub(crate) enum CryptoEvent {
    /// The client's first flight is ready; transmission may start
    ClientHelloWritten,
    /// New handshake bytes await transmission
    WriteScheduled,
    /// New keys were installed; buffered packets may now decrypt
    KeysInstalled,
    /// The peer's transport parameters arrived
    ReceivedParams(PeerParameters),
    /// The TLS handshake finished successfully
    HandshakeComplete,
    /// The handshake failed
    Error(TransportError),
}

/// Why keys for a level can't be produced
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum KeyError {
    /// The packet arrived ahead of the keys; buffer and retry
    NotYetAvailable,
    /// Keys were discarded; drop the packet silently
    Dropped,
}

struct LevelState {
    sealer: Option<Arc<DirectionalKeys>>,
    opener: Option<Arc<DirectionalKeys>>,
    /// Whether keys existed and were since discarded
    dropped: bool,
    /// Outgoing handshake bytes not yet framed
    send_pending: Vec<u8>,
    /// Offset of the next outgoing CRYPTO frame
    send_offset: u64,
    /// Reassembly of the incoming handshake byte stream
    recv: RecvBuffer,
    /// Complete-message accumulator
    recv_acc: Vec<u8>,
}

impl LevelState {
    fn new() -> Self {
        Self {
            sealer: None,
            opener: None,
            dropped: false,
            send_pending: Vec::new(),
            send_offset: 0,
            recv: RecvBuffer::new(),
            recv_acc: Vec::new(),
        }
    }
}

struct Shared {
    side: Side,
    state: Mutex<State>,
    events: mpsc::UnboundedSender<CryptoEvent>,
    params_tx: mpsc::Sender<PeerParameters>,
    read_key_tx: mpsc::Sender<()>,
    write_key_tx: mpsc::Sender<()>,
    message_tx: mpsc::Sender<Bytes>,
    done_tx: watch::Sender<bool>,
}

struct State {
    levels: [LevelState; 3],
    read_level: SpaceId,
    write_level: SpaceId,
    client_hello_written: bool,
}

/// Coordinates packet protection keys and the TLS handshake byte streams
pub(crate) struct CryptoSetup {
    shared: Arc<Shared>,
    params_rx: mpsc::Receiver<PeerParameters>,
    read_key_rx: mpsc::Receiver<()>,
    write_key_rx: mpsc::Receiver<()>,
    done_rx: watch::Receiver<bool>,
}

impl fmt::Debug for CryptoSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoSetup").finish_non_exhaustive()
    }
}

impl CryptoSetup {
    /// Create the crypto machinery for one connection
    ///
    /// Returns the session-facing handle, the provider-facing handle, and
    /// the event stream.
    pub(crate) fn new(
        side: Side,
        initial_dcid: &ConnectionId,
    ) -> (Self, TlsHandle, mpsc::UnboundedReceiver<CryptoEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (params_tx, params_rx) = mpsc::channel(1);
        let (read_key_tx, read_key_rx) = mpsc::channel(1);
        let (write_key_tx, write_key_rx) = mpsc::channel(1);
        let (message_tx, message_rx) = mpsc::channel(100);
        let (done_tx, done_rx) = watch::channel(false);

        let mut levels = [LevelState::new(), LevelState::new(), LevelState::new()];
        let initial = key_schedule::initial_keys(initial_dcid, side);
        levels[SpaceId::Initial as usize].sealer = Some(Arc::new(initial.local));
        levels[SpaceId::Initial as usize].opener = Some(Arc::new(initial.remote));

        let shared = Arc::new(Shared {
            side,
            state: Mutex::new(State {
                levels,
                read_level: SpaceId::Initial,
                write_level: SpaceId::Initial,
                client_hello_written: false,
            }),
            events: events_tx,
            params_tx,
            read_key_tx,
            write_key_tx,
            message_tx,
            done_tx,
        });

        let setup = Self {
            shared: shared.clone(),
            params_rx,
            read_key_rx,
            write_key_rx,
            done_rx,
        };
        let handle = TlsHandle {
            shared,
            message_rx,
        };
        (setup, handle, events_rx)
    }

    /// Replace the Initial keys after the peer changed our destination cid
    /// (a Retry packet)
    pub(crate) fn change_connection_id(&self, new_dcid: &ConnectionId) {
        let keys = key_schedule::initial_keys(new_dcid, self.shared.side);
        let mut state = self.shared.state.lock().unwrap();
        let level = &mut state.levels[SpaceId::Initial as usize];
        level.sealer = Some(Arc::new(keys.local));
        level.opener = Some(Arc::new(keys.remote));
    }

    /// Drop Initial and Handshake keys; the 1-RTT path is confirmed
    ///
    /// Returns the levels whose keys were discarded by this call.
    pub(crate) fn received_1rtt_ack(&self) -> Vec<SpaceId> {
        let mut dropped = Vec::new();
        let mut state = self.shared.state.lock().unwrap();
        for space in [SpaceId::Initial, SpaceId::Handshake] {
            let level = &mut state.levels[space as usize];
            if level.sealer.is_some() || level.opener.is_some() {
                level.sealer = None;
                level.opener = None;
                level.dropped = true;
                debug!(%space, "dropping keys");
                dropped.push(space);
            }
        }
        dropped
    }

    pub(crate) fn get_opener(&self, space: SpaceId) -> Result<Arc<DirectionalKeys>, KeyError> {
        let state = self.shared.state.lock().unwrap();
        let level = &state.levels[space as usize];
        match &level.opener {
            Some(keys) => Ok(keys.clone()),
            None if level.dropped => Err(KeyError::Dropped),
            // A Handshake packet racing ahead of the ServerHello is only
            // plausible while Initial keys are still live
            None if space == SpaceId::Handshake
                && state.levels[SpaceId::Initial as usize].opener.is_none() =>
            {
                Err(KeyError::Dropped)
            }
            None => Err(KeyError::NotYetAvailable),
        }
    }

    /// The highest-level sealer currently available
    pub(crate) fn get_sealer(&self) -> (SpaceId, Arc<DirectionalKeys>) {
        let state = self.shared.state.lock().unwrap();
        for space in [SpaceId::Data, SpaceId::Handshake, SpaceId::Initial] {
            if let Some(keys) = &state.levels[space as usize].sealer {
                return (space, keys.clone());
            }
        }
        unreachable!("all sealers dropped while the connection is live")
    }

    pub(crate) fn get_sealer_with_level(
        &self,
        space: SpaceId,
    ) -> Result<Arc<DirectionalKeys>, KeyError> {
        let state = self.shared.state.lock().unwrap();
        let level = &state.levels[space as usize];
        match &level.sealer {
            Some(keys) => Ok(keys.clone()),
            None if level.dropped => Err(KeyError::Dropped),
            None => Err(KeyError::NotYetAvailable),
        }
    }

    /// Whether there are handshake bytes waiting at `space`
    pub(crate) fn has_crypto_pending(&self, space: SpaceId) -> bool {
        let state = self.shared.state.lock().unwrap();
        !state.levels[space as usize].send_pending.is_empty()
    }

    /// Pull the next outgoing CRYPTO frame for `space`, at most `max_len`
    /// bytes of data
    pub(crate) fn poll_crypto_frame(
        &self,
        space: SpaceId,
        max_len: usize,
    ) -> Option<frame::Crypto> {
        let mut state = self.shared.state.lock().unwrap();
        let level = &mut state.levels[space as usize];
        if level.send_pending.is_empty() || max_len == 0 {
            return None;
        }
        let n = level.send_pending.len().min(max_len);
        let data: Bytes = level.send_pending.drain(..n).collect::<Vec<u8>>().into();
        let offset = level.send_offset;
        level.send_offset += n as u64;
        Some(frame::Crypto { offset, data })
    }

    /// Reassemble an incoming CRYPTO frame and feed complete handshake
    /// messages to the provider
    pub(crate) async fn handle_crypto_frame(
        &mut self,
        crypto: &frame::Crypto,
        space: SpaceId,
    ) -> Result<(), TransportError> {
        let messages = {
            let mut state = self.shared.state.lock().unwrap();
            let level = &mut state.levels[space as usize];
            level
                .recv
                .insert(crypto.offset, crypto.data.clone())
                .map_err(|_| {
                    TransportError::PROTOCOL_VIOLATION("inconsistent CRYPTO stream data")
                })?;
            // Move newly contiguous bytes into the message accumulator
            let contiguous = level.recv.contiguous_len() as usize;
            if contiguous > 0 {
                let start = level.recv_acc.len();
                level.recv_acc.resize(start + contiguous, 0);
                let read = level.recv.read(&mut level.recv_acc[start..]);
                debug_assert_eq!(read, contiguous);
            }
            if level.recv_acc.len() > MAX_CRYPTO_BUFFER {
                return Err(TransportError::CRYPTO_BUFFER_EXCEEDED(
                    "handshake data overflow",
                ));
            }
            // Split out complete TLS messages: type byte plus 24-bit length
            let mut messages = Vec::new();
            loop {
                if level.recv_acc.len() < 4 {
                    break;
                }
                let body_len = u32::from_be_bytes([
                    0,
                    level.recv_acc[1],
                    level.recv_acc[2],
                    level.recv_acc[3],
                ]) as usize;
                if level.recv_acc.len() < 4 + body_len {
                    break;
                }
                let message: Vec<u8> = level.recv_acc.drain(..4 + body_len).collect();
                messages.push(Bytes::from(message));
            }
            messages
        };

        for message in messages {
            self.handle_message(message, space).await;
        }
        Ok(())
    }

    /// Process one complete handshake message received at `space`
    ///
    /// Returns whether the provider is done with messages at this level.
    pub(crate) async fn handle_message(&mut self, data: Bytes, space: SpaceId) -> bool {
        let msg_type = data[0];
        trace!(
            msg = message_type_name(msg_type),
            len = data.len(),
            %space,
            "received handshake message"
        );
        if let Err(reason) = check_encryption_level(msg_type, space) {
            self.shared.error(TransportError::crypto(ALERT_UNEXPECTED_MESSAGE, reason));
            return false;
        }
        if self.shared.message_to_provider(data).await.is_err() {
            return false;
        }
        match self.shared.side {
            Side::Server => self.handle_message_for_server(msg_type).await,
            Side::Client => self.handle_message_for_client(msg_type).await,
        }
    }

    async fn handle_message_for_server(&mut self, msg_type: u8) -> bool {
        match msg_type {
            TYPE_CLIENT_HELLO => {
                let params = match self.wait_params().await {
                    Some(params) => params,
                    None => return false,
                };
                let _ = self.shared.events.send(CryptoEvent::ReceivedParams(params));
                // Handshake read key, handshake write key, then the 1-RTT
                // write key become available in order
                self.wait_read_key().await
                    && self.wait_write_key().await
                    && self.wait_write_key().await
            }
            TYPE_CERTIFICATE | TYPE_CERTIFICATE_VERIFY => false,
            TYPE_FINISHED => self.wait_read_key().await,
            _ => false,
        }
    }

    async fn handle_message_for_client(&mut self, msg_type: u8) -> bool {
        match msg_type {
            TYPE_SERVER_HELLO => self.wait_write_key().await && self.wait_read_key().await,
            TYPE_ENCRYPTED_EXTENSIONS => {
                if let Some(params) = self.wait_params().await {
                    let _ = self.shared.events.send(CryptoEvent::ReceivedParams(params));
                }
                false
            }
            TYPE_CERTIFICATE_REQUEST | TYPE_CERTIFICATE | TYPE_CERTIFICATE_VERIFY => false,
            TYPE_FINISHED => self.wait_read_key().await && self.wait_write_key().await,
            TYPE_NEW_SESSION_TICKET => false,
            _ => false,
        }
    }

    async fn wait_params(&mut self) -> Option<PeerParameters> {
        let mut done = self.done_rx.clone();
        tokio::select! {
            params = self.params_rx.recv() => params,
            _ = done.wait_for(|&done| done) => None,
        }
    }

    async fn wait_read_key(&mut self) -> bool {
        let mut done = self.done_rx.clone();
        tokio::select! {
            received = self.read_key_rx.recv() => received.is_some(),
            _ = done.wait_for(|&done| done) => false,
        }
    }

    async fn wait_write_key(&mut self) -> bool {
        let mut done = self.done_rx.clone();
        tokio::select! {
            received = self.write_key_rx.recv() => received.is_some(),
            _ = done.wait_for(|&done| done) => false,
        }
    }

    /// Signal the provider task to wind down
    pub(crate) fn close(&self) {
        let _ = self.shared.done_tx.send(true);
    }
}

fn check_encryption_level(msg_type: u8, space: SpaceId) -> Result<(), String> {
    let expected = match msg_type {
        TYPE_CLIENT_HELLO | TYPE_SERVER_HELLO => SpaceId::Initial,
        TYPE_ENCRYPTED_EXTENSIONS
        | TYPE_CERTIFICATE
        | TYPE_CERTIFICATE_REQUEST
        | TYPE_CERTIFICATE_VERIFY
        | TYPE_FINISHED => SpaceId::Handshake,
        TYPE_NEW_SESSION_TICKET => SpaceId::Data,
        other => return Err(format!("unexpected handshake message: {other}")),
    };
    if space != expected {
        return Err(format!(
            "expected {} message at {} level, got it at {}",
            message_type_name(msg_type),
            expected,
            space,
        ));
    }
    Ok(())
}

impl Shared {
    fn error(&self, err: TransportError) {
        let _ = self.events.send(CryptoEvent::Error(err));
        let _ = self.done_tx.send(true);
    }

    async fn message_to_provider(&self, data: Bytes) -> Result<(), HandshakeClosed> {
        // Capacity is generous; a send only parks when the provider has
        // fallen far behind
        self.message_tx.send(data).await.map_err(|_| HandshakeClosed)
    }
}

/// Provider-facing surface of the crypto machinery
///
/// Handed to [`TlsProvider::start`]; lives for the duration of the
/// handshake driver task.
pub struct TlsHandle {
    shared: Arc<Shared>,
    message_rx: mpsc::Receiver<Bytes>,
}

impl fmt::Debug for TlsHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsHandle").finish_non_exhaustive()
    }
}

impl TlsHandle {
    /// Block until the next complete handshake message arrives
    pub async fn read_handshake_message(&mut self) -> Result<Bytes, HandshakeClosed> {
        let mut done = self.shared.done_tx.subscribe();
        tokio::select! {
            message = self.message_rx.recv() => message.ok_or(HandshakeClosed),
            _ = done.wait_for(|&done| done) => Err(HandshakeClosed),
        }
    }

    /// Send handshake bytes on the crypto stream of the current write level
    pub fn write_record(&self, data: &[u8]) {
        let mut state = self.shared.state.lock().unwrap();
        let write_level = state.write_level;
        let first_flight = write_level == SpaceId::Initial
            && !state.client_hello_written
            && self.shared.side == Side::Client;
        state.levels[write_level as usize]
            .send_pending
            .extend_from_slice(data);
        if first_flight {
            state.client_hello_written = true;
            drop(state);
            let _ = self.shared.events.send(CryptoEvent::ClientHelloWritten);
        } else {
            drop(state);
        }
        let _ = self.shared.events.send(CryptoEvent::WriteScheduled);
    }

    /// Install keys for protecting received packets
    ///
    /// Advances the read side one level: Initial -> Handshake -> 1-RTT.
    pub async fn set_read_key(&self, suite: Suite, secret: &[u8]) {
        let keys = Arc::new(DirectionalKeys::new(suite, secret));
        {
            let mut state = self.shared.state.lock().unwrap();
            let next = match state.read_level {
                SpaceId::Initial => SpaceId::Handshake,
                SpaceId::Handshake => SpaceId::Data,
                SpaceId::Data => {
                    debug_assert!(false, "read key installed past 1-RTT");
                    return;
                }
            };
            state.read_level = next;
            state.levels[next as usize].opener = Some(keys);
            debug!(space = %next, "installed read keys");
        }
        let _ = self.shared.events.send(CryptoEvent::KeysInstalled);
        let _ = self.shared.read_key_tx.send(()).await;
    }

    /// Install keys for protecting sent packets
    ///
    /// Advances the write side one level: Initial -> Handshake -> 1-RTT.
    pub async fn set_write_key(&self, suite: Suite, secret: &[u8]) {
        let keys = Arc::new(DirectionalKeys::new(suite, secret));
        {
            let mut state = self.shared.state.lock().unwrap();
            let next = match state.write_level {
                SpaceId::Initial => SpaceId::Handshake,
                SpaceId::Handshake => SpaceId::Data,
                SpaceId::Data => {
                    debug_assert!(false, "write key installed past 1-RTT");
                    return;
                }
            };
            state.write_level = next;
            state.levels[next as usize].sealer = Some(keys);
            debug!(space = %next, "installed write keys");
        }
        let _ = self.shared.events.send(CryptoEvent::KeysInstalled);
        let _ = self.shared.write_key_tx.send(()).await;
    }

    /// Deliver the peer's transport parameters to the connection
    pub async fn received_params(&self, params: PeerParameters) {
        let _ = self.shared.params_tx.send(params).await;
    }

    /// The handshake completed successfully
    pub fn handshake_complete(&self) {
        let _ = self.shared.events.send(CryptoEvent::HandshakeComplete);
        let _ = self.shared.done_tx.send(true);
    }

    /// Abort the handshake with a TLS alert
    pub fn send_alert(&self, alert: u8) {
        self.shared.error(TransportError::crypto(
            alert,
            format!("TLS alert {alert}"),
        ));
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{message, ScriptedTls};
    use super::*;
    use std::time::Duration;

    async fn shuttle(
        client: &mut CryptoSetup,
        server: &mut CryptoSetup,
    ) -> Result<(), TransportError> {
        for space in SpaceId::iter() {
            while let Some(frame) = client.poll_crypto_frame(space, 1200) {
                server.handle_crypto_frame(&frame, space).await?;
            }
            while let Some(frame) = server.poll_crypto_frame(space, 1200) {
                client.handle_crypto_frame(&frame, space).await?;
            }
        }
        Ok(())
    }

    fn drain_complete(events: &mut mpsc::UnboundedReceiver<CryptoEvent>) -> bool {
        let mut complete = false;
        while let Ok(event) = events.try_recv() {
            match event {
                CryptoEvent::HandshakeComplete => complete = true,
                CryptoEvent::Error(e) => panic!("handshake error: {e}"),
                _ => {}
            }
        }
        complete
    }

    async fn handshake_pair() -> (CryptoSetup, CryptoSetup) {
        let dcid = ConnectionId::new(&[8; 8]);
        let (mut client, client_io, mut client_events) = CryptoSetup::new(Side::Client, &dcid);
        let (mut server, server_io, mut server_events) = CryptoSetup::new(Side::Server, &dcid);
        ScriptedTls::default().start(Side::Client, client_io);
        ScriptedTls::default().start(Side::Server, server_io);

        let mut client_done = false;
        let mut server_done = false;
        tokio::time::timeout(Duration::from_secs(5), async {
            while !(client_done && server_done) {
                shuttle(&mut client, &mut server).await.unwrap();
                client_done |= drain_complete(&mut client_events);
                server_done |= drain_complete(&mut server_events);
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("handshake did not converge");
        (client, server)
    }

    #[tokio::test]
    async fn full_handshake_installs_1rtt_keys() {
        let (client, server) = handshake_pair().await;

        let (space, sealer) = client.get_sealer();
        assert_eq!(space, SpaceId::Data);
        let opener = server.get_opener(SpaceId::Data).unwrap();

        // The negotiated keys really do interoperate
        let header = b"\x41x";
        let mut buf = header.to_vec();
        buf.extend_from_slice(b"application data");
        buf.resize(buf.len() + sealer.packet.tag_len(), 0);
        sealer.packet.encrypt(1, &mut buf, header.len());
        let mut payload = bytes::BytesMut::from(&buf[header.len()..]);
        opener.packet.decrypt(1, header, &mut payload).unwrap();
        assert_eq!(&payload[..], b"application data");
    }

    #[tokio::test]
    async fn sealer_level_progression() {
        let dcid = ConnectionId::new(&[7; 8]);
        let (client, _io, _events) = CryptoSetup::new(Side::Client, &dcid);
        // Before any handshake progress only Initial keys exist
        let (space, _) = client.get_sealer();
        assert_eq!(space, SpaceId::Initial);
        assert_eq!(
            client.get_opener(SpaceId::Handshake).unwrap_err(),
            KeyError::NotYetAvailable
        );
        assert_eq!(
            client.get_opener(SpaceId::Data).unwrap_err(),
            KeyError::NotYetAvailable
        );
    }

    #[tokio::test]
    async fn received_1rtt_ack_drops_early_keys() {
        let (client, _server) = handshake_pair().await;
        let dropped = client.received_1rtt_ack();
        assert_eq!(dropped, vec![SpaceId::Initial, SpaceId::Handshake]);
        assert_eq!(
            client.get_opener(SpaceId::Initial).unwrap_err(),
            KeyError::Dropped
        );
        assert_eq!(
            client.get_opener(SpaceId::Handshake).unwrap_err(),
            KeyError::Dropped
        );
        assert!(client.get_opener(SpaceId::Data).is_ok());
        // Dropping again is a no-op
        assert!(client.received_1rtt_ack().is_empty());
    }

    #[tokio::test]
    async fn wrong_level_message_is_unexpected_message_alert() {
        let dcid = ConnectionId::new(&[9; 8]);
        let (mut server, _io, mut events) = CryptoSetup::new(Side::Server, &dcid);
        // A Finished message can't arrive at the Initial level
        let finished = Bytes::from(message(20, 32));
        server.handle_message(finished, SpaceId::Initial).await;
        match events.try_recv().unwrap() {
            CryptoEvent::Error(e) => {
                assert_eq!(e.code, crate::TransportErrorCode::crypto(10));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn client_hello_written_signal_fires_once() {
        let dcid = ConnectionId::new(&[5; 8]);
        let (client, io, mut events) = CryptoSetup::new(Side::Client, &dcid);
        ScriptedTls::default().start(Side::Client, io);
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, CryptoEvent::ClientHelloWritten));
        assert!(client.has_crypto_pending(SpaceId::Initial));
    }

    #[tokio::test]
    async fn crypto_frames_reassemble_out_of_order() {
        let dcid = ConnectionId::new(&[3; 8]);
        let (mut server, mut io, _events) = CryptoSetup::new(Side::Server, &dcid);
        let hello = message(1, 96);
        // The provider half responds to the ClientHello so the coordinator
        // can run its key-installation sequence
        let provider = tokio::spawn(async move {
            let got = io.read_handshake_message().await.unwrap();
            io.received_params(PeerParameters::default_limits()).await;
            io.set_read_key(Suite::Aes128Gcm, &[1; 32]).await;
            io.set_write_key(Suite::Aes128Gcm, &[2; 32]).await;
            io.set_write_key(Suite::Aes128Gcm, &[3; 32]).await;
            got
        });

        // Deliver the tail before the head
        let tail = frame::Crypto {
            offset: 50,
            data: Bytes::copy_from_slice(&hello[50..]),
        };
        let head = frame::Crypto {
            offset: 0,
            data: Bytes::copy_from_slice(&hello[..50]),
        };
        server.handle_crypto_frame(&tail, SpaceId::Initial).await.unwrap();
        server.handle_crypto_frame(&head, SpaceId::Initial).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), provider)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got[..], &hello[..]);
    }
}
