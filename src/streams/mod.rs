//! Stream multiplexing, flow control, and the application-facing handles
//!
//! All mutable stream state lives in [`StreamsState`] behind one mutex.
//! The session task locks it to deliver frames and pull data for packets;
//! application handles lock it for reads, writes, and control operations.
//! The lock is never held across a suspension point; blocked operations
//! park on per-stream [`Notify`] handles and re-check after waking.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::trace;

use crate::frame::{Frame, ResetStream, StopSending, StreamFrame};
use crate::session::ConnectionError;
use crate::transport_error::Error as TransportError;
use crate::{Dir, Side, StreamId, VarInt};

mod incoming;
pub(crate) mod recv;
mod send;

use incoming::{IncomingStreams, OpenResult};
use recv::RecvBuffer;
use send::SendBuffer;

/// Flow control window initially advertised per stream
const INITIAL_STREAM_WINDOW: u64 = 512 * 1024;
/// Flow control window initially advertised for the connection
const INITIAL_CONN_WINDOW: u64 = 768 * 1024;
/// Streams the peer may open concurrently until told otherwise
pub(crate) const DEFAULT_MAX_INCOMING_STREAMS: u64 = 100;

/// Errors from reading a stream
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// The peer abandoned transmitting data on this stream
    #[error("stream reset by peer: error {0}")]
    Reset(VarInt),
    /// The connection was closed
    #[error("connection closed: {0}")]
    ConnectionClosed(ConnectionError),
}

/// Errors from writing to a stream
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// The peer is no longer accepting data on this stream
    #[error("sending stopped by peer: error {0}")]
    Stopped(VarInt),
    /// This side closed the sending half
    #[error("send stream finished or reset")]
    Finished,
    /// The connection was closed
    #[error("connection closed: {0}")]
    ConnectionClosed(ConnectionError),
}

/// Handle for sending data on a stream
///
/// May be used from any task; operations synchronise internally.
#[derive(Debug, Clone)]
pub struct SendStream {
    id: StreamId,
    shared: Arc<SharedStreams>,
}

/// Handle for receiving data on a stream
#[derive(Debug, Clone)]
pub struct RecvStream {
    id: StreamId,
    shared: Arc<SharedStreams>,
}

#[derive(Debug)]
pub(crate) struct SharedStreams {
    pub(crate) state: Mutex<StreamsState>,
    /// Wakes the session task when there's something new to send
    pub(crate) wake: Notify,
}

impl SharedStreams {
    pub(crate) fn new(side: Side, max_incoming_bi: u64, max_incoming_uni: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(StreamsState::new(side, max_incoming_bi, max_incoming_uni)),
            wake: Notify::new(),
        })
    }
}

#[derive(Debug)]
struct SendHalf {
    buffer: SendBuffer,
    /// Absolute flow control limit granted by the peer
    max_data: u64,
    fin_queued: bool,
    fin_sent: bool,
    fin_acked: bool,
    reset_sent: Option<VarInt>,
    stop_received: Option<VarInt>,
    blocked_sent: bool,
    notify: Arc<Notify>,
}

impl SendHalf {
    fn new(max_data: u64) -> Self {
        Self {
            buffer: SendBuffer::new(),
            max_data,
            fin_queued: false,
            fin_sent: false,
            fin_acked: false,
            reset_sent: None,
            stop_received: None,
            blocked_sent: false,
            notify: Arc::new(Notify::new()),
        }
    }

    fn is_complete(&self) -> bool {
        self.reset_sent.is_some()
            || (self.fin_acked && self.buffer.is_fully_acked())
    }
}

#[derive(Debug)]
struct RecvHalf {
    buffer: RecvBuffer,
    /// Absolute flow control limit we advertised
    max_data: u64,
    window: u64,
    final_size: Option<u64>,
    /// Highest offset seen, for flow control accounting
    received: u64,
    reset_received: Option<(VarInt, u64)>,
    reset_delivered: bool,
    stop_sent: Option<VarInt>,
    notify: Arc<Notify>,
}

impl RecvHalf {
    fn new(window: u64) -> Self {
        Self {
            buffer: RecvBuffer::new(),
            max_data: window,
            window,
            final_size: None,
            received: 0,
            reset_received: None,
            reset_delivered: false,
            stop_sent: None,
            notify: Arc::new(Notify::new()),
        }
    }

    fn is_complete(&self) -> bool {
        self.reset_delivered
            || self
                .final_size
                .map_or(false, |size| self.buffer.read_offset() == size)
            || (self.stop_sent.is_some() && self.final_size.is_some())
    }
}

#[derive(Debug, Default)]
struct StreamEntry {
    send: Option<SendHalf>,
    recv: Option<RecvHalf>,
}

#[derive(Debug)]
struct ConnFlow {
    /// How much the peer lets the connection send, in total stream bytes
    peer_max_data: u64,
    /// Total stream bytes this side has committed to the wire
    written: u64,
    /// How much we let the peer send
    local_max_data: u64,
    /// Highest-offset sum received across all streams
    received: u64,
    /// Bytes the applications have consumed
    consumed: u64,
    window: u64,
    blocked_sent: bool,
}

/// All per-connection stream state
#[derive(Debug)]
pub(crate) struct StreamsState {
    side: Side,
    streams: FxHashMap<StreamId, StreamEntry>,
    incoming_bi: IncomingStreams,
    incoming_uni: IncomingStreams,
    accept_notify_bi: Arc<Notify>,
    accept_notify_uni: Arc<Notify>,
    /// Ordinal of the next locally-initiated stream per directionality
    next_open: [u64; 2],
    /// How many streams the peer lets us open per directionality
    max_open: [u64; 2],
    streams_blocked_sent: [bool; 2],
    /// Wakes tasks waiting in `open_stream` for MAX_STREAMS credit
    open_notify: [Arc<Notify>; 2],
    conn: ConnFlow,
    /// Control frames waiting to be packed into a packet
    pending: VecDeque<Frame>,
    /// Streams with data or a fin waiting to be sent
    send_ready: VecDeque<StreamId>,
    close_err: Option<ConnectionError>,
}

impl StreamsState {
    fn new(side: Side, max_incoming_bi: u64, max_incoming_uni: u64) -> Self {
        Self {
            side,
            streams: FxHashMap::default(),
            incoming_bi: IncomingStreams::new(Dir::Bi, max_incoming_bi),
            incoming_uni: IncomingStreams::new(Dir::Uni, max_incoming_uni),
            accept_notify_bi: Arc::new(Notify::new()),
            accept_notify_uni: Arc::new(Notify::new()),
            next_open: [0; 2],
            max_open: [DEFAULT_MAX_INCOMING_STREAMS; 2],
            streams_blocked_sent: [false; 2],
            open_notify: [Arc::new(Notify::new()), Arc::new(Notify::new())],
            conn: ConnFlow {
                peer_max_data: INITIAL_CONN_WINDOW,
                written: 0,
                local_max_data: INITIAL_CONN_WINDOW,
                received: 0,
                consumed: 0,
                window: INITIAL_CONN_WINDOW,
                blocked_sent: false,
            },
            pending: VecDeque::new(),
            send_ready: VecDeque::new(),
            close_err: None,
        }
    }

    /// Update limits learned from the peer's transport parameters
    pub(crate) fn set_peer_limits(
        &mut self,
        max_data: u64,
        max_streams_bidi: u64,
        max_streams_uni: u64,
    ) {
        self.conn.peer_max_data = self.conn.peer_max_data.max(max_data);
        self.max_open[Dir::Bi as usize] = self.max_open[Dir::Bi as usize].max(max_streams_bidi);
        self.max_open[Dir::Uni as usize] = self.max_open[Dir::Uni as usize].max(max_streams_uni);
    }

    fn incoming(&mut self, dir: Dir) -> &mut IncomingStreams {
        match dir {
            Dir::Bi => &mut self.incoming_bi,
            Dir::Uni => &mut self.incoming_uni,
        }
    }

    fn accept_notify(&self, dir: Dir) -> Arc<Notify> {
        match dir {
            Dir::Bi => self.accept_notify_bi.clone(),
            Dir::Uni => self.accept_notify_uni.clone(),
        }
    }

    /// Create the state halves for a newly materialised peer stream
    fn materialize(&mut self, id: StreamId) {
        let entry = StreamEntry {
            send: (id.dir() == Dir::Bi).then(|| SendHalf::new(INITIAL_STREAM_WINDOW)),
            recv: Some(RecvHalf::new(INITIAL_STREAM_WINDOW)),
        };
        self.streams.insert(id, entry);
    }

    /// Look up (lazily materialising) the stream a peer frame refers to
    ///
    /// Returns `None` for stale frames referring to already-deleted streams.
    fn stream_for_frame(
        &mut self,
        id: StreamId,
        needs_recv: bool,
    ) -> Result<Option<&mut StreamEntry>, TransportError> {
        if id.initiator() == self.side {
            // Our own stream: receiving on it requires it to be bidirectional
            if needs_recv && id.dir() == Dir::Uni {
                return Err(TransportError::STREAM_STATE_ERROR(
                    "received data on a locally-initiated unidirectional stream",
                ));
            }
            if id.index() >= self.next_open[id.dir() as usize] {
                return Err(TransportError::STREAM_STATE_ERROR(
                    "received frame for an unopened local stream",
                ));
            }
            return Ok(self.streams.get_mut(&id));
        }
        let dir = id.dir();
        match self.incoming(dir).get_or_open(id.index())? {
            OpenResult::Existing { deleted: true } => Ok(None),
            OpenResult::Existing { deleted: false } => Ok(self.streams.get_mut(&id)),
            OpenResult::Opened { materialize } => {
                for num in materialize {
                    self.materialize(StreamId::new(!self.side, dir, num));
                }
                self.accept_notify(dir).notify_one();
                Ok(self.streams.get_mut(&id))
            }
        }
    }

    pub(crate) fn received_stream_frame(
        &mut self,
        frame: &StreamFrame,
    ) -> Result<(), TransportError> {
        let end = frame.offset + frame.data.len() as u64;
        let entry = match self.stream_for_frame(frame.id, true)? {
            Some(entry) => entry,
            None => return Ok(()), // stale frame for a finished stream
        };
        let recv = match entry.recv.as_mut() {
            Some(recv) => recv,
            None => return Ok(()),
        };

        if end > recv.max_data {
            return Err(TransportError::FLOW_CONTROL_ERROR(
                "stream flow control window exceeded",
            ));
        }
        if let Some(final_size) = recv.final_size {
            if end > final_size || (frame.fin && end != final_size) {
                return Err(TransportError::FINAL_SIZE_ERROR(
                    "data past the stream's final size",
                ));
            }
        }
        if frame.fin {
            if end < recv.received {
                return Err(TransportError::FINAL_SIZE_ERROR(
                    "final size below received data",
                ));
            }
            recv.final_size = Some(end);
        }

        let new_bytes = end.saturating_sub(recv.received);
        recv.received = recv.received.max(end);
        if recv.stop_sent.is_none() && recv.reset_received.is_none() {
            recv.buffer
                .insert(frame.offset, frame.data.clone())
                .map_err(|_| {
                    TransportError::FRAME_ENCODING_ERROR(
                        "stream data inconsistent with previously received bytes",
                    )
                })?;
        }
        recv.notify.notify_one();

        self.conn.received += new_bytes;
        if self.conn.received > self.conn.local_max_data {
            return Err(TransportError::FLOW_CONTROL_ERROR(
                "connection flow control window exceeded",
            ));
        }
        Ok(())
    }

    pub(crate) fn received_reset_stream(
        &mut self,
        frame: &ResetStream,
    ) -> Result<(), TransportError> {
        let final_size = frame.final_size.into_inner();
        let entry = match self.stream_for_frame(frame.id, true)? {
            Some(entry) => entry,
            None => return Ok(()),
        };
        let recv = match entry.recv.as_mut() {
            Some(recv) => recv,
            None => return Ok(()),
        };
        if recv.final_size.map_or(false, |size| size != final_size) || final_size < recv.received {
            return Err(TransportError::FINAL_SIZE_ERROR(
                "RESET_STREAM final size inconsistent",
            ));
        }
        let new_bytes = final_size.saturating_sub(recv.received);
        recv.received = final_size;
        recv.final_size = Some(final_size);
        recv.reset_received = Some((frame.error_code, final_size));
        recv.buffer.clear();
        recv.notify.notify_one();
        self.conn.received += new_bytes;
        if self.conn.received > self.conn.local_max_data {
            return Err(TransportError::FLOW_CONTROL_ERROR(
                "connection flow control window exceeded",
            ));
        }
        Ok(())
    }

    pub(crate) fn received_stop_sending(
        &mut self,
        frame: &StopSending,
    ) -> Result<(), TransportError> {
        let error_code = frame.error_code;
        let id = frame.id;
        let entry = match self.stream_for_frame(id, false)? {
            Some(entry) => entry,
            None => return Ok(()),
        };
        let send = match entry.send.as_mut() {
            Some(send) => send,
            None => {
                return Err(TransportError::STREAM_STATE_ERROR(
                    "STOP_SENDING for a receive-only stream",
                ))
            }
        };
        send.stop_received = Some(error_code);
        let mut reset_final_size = None;
        if send.reset_sent.is_none() {
            // A peer that stopped reading gets the stream abandoned with
            // its own error code
            send.reset_sent = Some(error_code);
            reset_final_size = Some(send.buffer.offset());
        }
        send.notify.notify_one();
        if let Some(offset) = reset_final_size {
            let final_size = VarInt::from_u64(offset).unwrap();
            self.pending.push_back(Frame::ResetStream(ResetStream {
                id,
                error_code,
                final_size,
            }));
        }
        self.maybe_delete(id);
        Ok(())
    }

    pub(crate) fn received_max_stream_data(
        &mut self,
        id: StreamId,
        offset: u64,
    ) -> Result<(), TransportError> {
        let entry = match self.stream_for_frame(id, false)? {
            Some(entry) => entry,
            None => return Ok(()),
        };
        let mut requeue = false;
        if let Some(send) = entry.send.as_mut() {
            if offset > send.max_data {
                send.max_data = offset;
                send.blocked_sent = false;
                send.notify.notify_one();
                requeue = send.buffer.has_unsent_data() || (send.fin_queued && !send.fin_sent);
            }
        }
        if requeue && !self.send_ready.contains(&id) {
            self.send_ready.push_back(id);
        }
        Ok(())
    }

    pub(crate) fn received_max_data(&mut self, limit: u64) {
        if limit > self.conn.peer_max_data {
            self.conn.peer_max_data = limit;
            self.conn.blocked_sent = false;
            let mut requeue = Vec::new();
            for (id, entry) in &self.streams {
                if let Some(send) = entry.send.as_ref() {
                    send.notify.notify_one();
                    if send.buffer.has_unsent_data() {
                        requeue.push(*id);
                    }
                }
            }
            for id in requeue {
                if !self.send_ready.contains(&id) {
                    self.send_ready.push_back(id);
                }
            }
        }
    }

    pub(crate) fn received_max_streams(&mut self, dir: Dir, count: u64) {
        let slot = &mut self.max_open[dir as usize];
        if count > *slot {
            *slot = count;
            self.streams_blocked_sent[dir as usize] = false;
            self.open_notify[dir as usize].notify_one();
        }
    }

    /// Open a locally-initiated stream, if the peer's limit allows
    fn open(&mut self, dir: Dir) -> Option<StreamId> {
        let index = self.next_open[dir as usize];
        if index >= self.max_open[dir as usize] {
            if !self.streams_blocked_sent[dir as usize] {
                self.streams_blocked_sent[dir as usize] = true;
                self.pending.push_back(Frame::StreamsBlocked {
                    dir,
                    limit: self.max_open[dir as usize],
                });
            }
            return None;
        }
        self.next_open[dir as usize] += 1;
        let id = StreamId::new(self.side, dir, index);
        self.streams.insert(
            id,
            StreamEntry {
                send: Some(SendHalf::new(INITIAL_STREAM_WINDOW)),
                recv: (dir == Dir::Bi).then(|| RecvHalf::new(INITIAL_STREAM_WINDOW)),
            },
        );
        Some(id)
    }

    /// Delete the stream once both halves have finished
    fn maybe_delete(&mut self, id: StreamId) {
        let done = match self.streams.get(&id) {
            Some(entry) => {
                entry.send.as_ref().map_or(true, SendHalf::is_complete)
                    && entry.recv.as_ref().map_or(true, RecvHalf::is_complete)
            }
            None => return,
        };
        if !done {
            return;
        }
        self.streams.remove(&id);
        trace!(stream = %id, "stream deleted");
        if id.initiator() != self.side {
            // Freed budget is advertised so the peer can open a new stream
            let dir = id.dir();
            if let Ok(Some(count)) = self.incoming(dir).delete(id.index()) {
                self.pending.push_back(Frame::MaxStreams { dir, count });
            }
        }
    }

    /// Register acknowledgment of a previously sent stream frame
    pub(crate) fn frame_acked(&mut self, frame: &Frame) {
        match frame {
            Frame::Stream(stream) => {
                let id = stream.id;
                if let Some(send) = self.streams.get_mut(&id).and_then(|e| e.send.as_mut()) {
                    send.buffer
                        .ack(stream.offset..stream.offset + stream.data.len() as u64);
                    if stream.fin {
                        send.fin_acked = true;
                    }
                    if send.is_complete() {
                        send.notify.notify_one();
                    }
                }
                self.maybe_delete(id);
            }
            Frame::ResetStream(reset) => {
                self.maybe_delete(reset.id);
            }
            _ => {}
        }
    }

    /// Pull frames to fill a packet with at most `space` payload bytes
    pub(crate) fn poll_transmit(&mut self, mut space: usize) -> Vec<Frame> {
        let mut frames = Vec::new();

        // Control frames first; they're small and time-sensitive
        while let Some(frame) = self.pending.front() {
            let size = frame.size();
            if size > space {
                break;
            }
            space -= size;
            frames.push(self.pending.pop_front().unwrap());
        }

        // Then stream data, round-robin across ready streams
        let mut rotations = self.send_ready.len();
        while space > StreamFrame::SIZE_BOUND && rotations > 0 {
            rotations -= 1;
            let id = match self.send_ready.pop_front() {
                Some(id) => id,
                None => break,
            };
            let conn_budget = self.conn.peer_max_data.saturating_sub(self.conn.written);
            let entry = match self.streams.get_mut(&id) {
                Some(entry) => entry,
                None => continue,
            };
            let send = match entry.send.as_mut() {
                Some(send) if send.reset_sent.is_none() => send,
                _ => continue,
            };

            let unsent_offset = send.buffer.offset() - send.buffer.unsent_len();
            let stream_budget = send.max_data.saturating_sub(unsent_offset);
            let budget = conn_budget.min(stream_budget);
            if budget == 0 && send.buffer.has_unsent_data() {
                // Report what precisely blocks us
                let mut blocked = None;
                if stream_budget == 0 && !send.blocked_sent {
                    send.blocked_sent = true;
                    blocked = Some(Frame::StreamDataBlocked {
                        id,
                        offset: send.max_data,
                    });
                } else if conn_budget == 0 && !self.conn.blocked_sent {
                    self.conn.blocked_sent = true;
                    blocked = Some(Frame::DataBlocked {
                        offset: self.conn.peer_max_data,
                    });
                }
                if let Some(frame) = blocked {
                    self.pending.push_back(frame);
                }
                self.send_ready.push_back(id);
                continue;
            }

            let max_len = (space - StreamFrame::SIZE_BOUND).min(budget as usize);
            let range = send.buffer.poll_transmit(max_len);
            let fin =
                send.fin_queued && !send.fin_sent && range.end == send.buffer.offset();
            if range.is_empty() && !fin {
                continue;
            }
            let data = if range.is_empty() {
                Bytes::new()
            } else {
                send.buffer.get(range.clone())
            };
            if fin {
                send.fin_sent = true;
            }
            let more = send.buffer.has_unsent_data() || (send.fin_queued && !send.fin_sent);
            self.conn.written += range.end - range.start;
            let frame = StreamFrame {
                id,
                offset: range.start,
                fin,
                data,
            };
            space = space.saturating_sub(frame.size());
            frames.push(Frame::Stream(frame));
            // More to send? Go to the back of the queue
            if more {
                self.send_ready.push_back(id);
            }
        }
        frames
    }

    /// Fail every pending and future operation with the close reason
    pub(crate) fn close(&mut self, err: ConnectionError) {
        if self.close_err.is_some() {
            return;
        }
        self.close_err = Some(err);
        for notify in &self.open_notify {
            notify.notify_waiters();
            notify.notify_one();
        }
        for entry in self.streams.values() {
            if let Some(send) = entry.send.as_ref() {
                send.notify.notify_waiters();
                send.notify.notify_one();
            }
            if let Some(recv) = entry.recv.as_ref() {
                recv.notify.notify_waiters();
                recv.notify.notify_one();
            }
        }
        self.accept_notify_bi.notify_waiters();
        self.accept_notify_bi.notify_one();
        self.accept_notify_uni.notify_waiters();
        self.accept_notify_uni.notify_one();
    }

    pub(crate) fn close_error(&self) -> Option<&ConnectionError> {
        self.close_err.as_ref()
    }
}

//
// Handle-side operations
//

impl SharedStreams {
    /// Open a locally-initiated stream without waiting
    pub(crate) fn open_stream(
        self: &Arc<Self>,
        dir: Dir,
    ) -> Result<Option<(StreamId, SendStream, Option<RecvStream>)>, ConnectionError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.close_err.clone() {
            return Err(err);
        }
        let id = match state.open(dir) {
            Some(id) => id,
            None => {
                drop(state);
                self.wake.notify_one();
                return Ok(None);
            }
        };
        drop(state);
        let send = SendStream {
            id,
            shared: self.clone(),
        };
        let recv = (dir == Dir::Bi).then(|| RecvStream {
            id,
            shared: self.clone(),
        });
        Ok(Some((id, send, recv)))
    }

    /// Open a locally-initiated stream, waiting for MAX_STREAMS credit if
    /// the peer's limit has been reached
    pub(crate) async fn open_stream_wait(
        self: &Arc<Self>,
        dir: Dir,
    ) -> Result<(StreamId, SendStream, Option<RecvStream>), ConnectionError> {
        loop {
            let notify = {
                let state = self.state.lock().unwrap();
                state.open_notify[dir as usize].clone()
            };
            let waiting = notify.notified();
            match self.open_stream(dir)? {
                Some(opened) => return Ok(opened),
                None => waiting.await,
            }
        }
    }

    /// Wait for the peer to open a stream of the given directionality
    pub(crate) async fn accept_stream(
        self: &Arc<Self>,
        dir: Dir,
    ) -> Result<(StreamId, Option<SendStream>, RecvStream), ConnectionError> {
        loop {
            let notify = {
                let mut state = self.state.lock().unwrap();
                if let Some(err) = state.close_err.clone() {
                    return Err(err);
                }
                match state.incoming(dir).try_accept() {
                    Some((num, credit)) => {
                        if let Some(count) = credit {
                            state.pending.push_back(Frame::MaxStreams { dir, count });
                        }
                        let side = !state.side;
                        // Keep any further waiters moving
                        state.accept_notify(dir).notify_one();
                        drop(state);
                        self.wake.notify_one();
                        let id = StreamId::new(side, dir, num);
                        let send = (dir == Dir::Bi).then(|| SendStream {
                            id,
                            shared: self.clone(),
                        });
                        let recv = RecvStream {
                            id,
                            shared: self.clone(),
                        };
                        return Ok((id, send, recv));
                    }
                    None => state.accept_notify(dir),
                }
            };
            notify.notified().await;
        }
    }
}

impl SendStream {
    /// The stream this handle writes to
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Write some bytes, waiting for flow control credit if necessary
    ///
    /// Returns the number of bytes accepted, which may be less than
    /// `data.len()` when the window runs out mid-write.
    pub async fn write(&self, data: &[u8]) -> Result<usize, WriteError> {
        if data.is_empty() {
            return Ok(0);
        }
        loop {
            let notify = {
                let mut state = self.shared.state.lock().unwrap();
                if let Some(err) = state.close_err.clone() {
                    return Err(WriteError::ConnectionClosed(err));
                }
                let entry = state
                    .streams
                    .get_mut(&self.id)
                    .ok_or(WriteError::Finished)?;
                let send = entry.send.as_mut().ok_or(WriteError::Finished)?;
                if let Some(code) = send.stop_received {
                    return Err(WriteError::Stopped(code));
                }
                if send.fin_queued || send.reset_sent.is_some() {
                    return Err(WriteError::Finished);
                }
                // Buffering is bounded by the stream window; the
                // connection-level window gates actual transmission
                let available = send.max_data.saturating_sub(send.buffer.offset());
                if available == 0 {
                    send.notify.clone()
                } else {
                    let n = (available as usize).min(data.len());
                    send.buffer.write(&data[..n]);
                    if !state.send_ready.contains(&self.id) {
                        state.send_ready.push_back(self.id);
                    }
                    drop(state);
                    self.shared.wake.notify_one();
                    return Ok(n);
                }
            };
            notify.notified().await;
        }
    }

    /// Write an entire buffer
    pub async fn write_all(&self, mut data: &[u8]) -> Result<(), WriteError> {
        while !data.is_empty() {
            let n = self.write(data).await?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Signal the end of the stream; no further writes are possible
    pub fn finish(&self) -> Result<(), WriteError> {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(err) = state.close_err.clone() {
            return Err(WriteError::ConnectionClosed(err));
        }
        let entry = state
            .streams
            .get_mut(&self.id)
            .ok_or(WriteError::Finished)?;
        let send = entry.send.as_mut().ok_or(WriteError::Finished)?;
        if let Some(code) = send.stop_received {
            return Err(WriteError::Stopped(code));
        }
        if send.fin_queued || send.reset_sent.is_some() {
            return Err(WriteError::Finished);
        }
        send.fin_queued = true;
        if !state.send_ready.contains(&self.id) {
            state.send_ready.push_back(self.id);
        }
        drop(state);
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Abandon transmission and notify the peer with `error_code`
    pub fn cancel_write(&self, error_code: VarInt) {
        let mut state = self.shared.state.lock().unwrap();
        let Some(send) = state
            .streams
            .get_mut(&self.id)
            .and_then(|e| e.send.as_mut())
        else {
            return;
        };
        if send.reset_sent.is_some() {
            return;
        }
        send.reset_sent = Some(error_code);
        let final_size = VarInt::from_u64(send.buffer.offset()).unwrap();
        send.notify.notify_one();
        let id = self.id;
        state.pending.push_back(Frame::ResetStream(ResetStream {
            id,
            error_code,
            final_size,
        }));
        state.maybe_delete(id);
        drop(state);
        self.shared.wake.notify_one();
    }
}

impl RecvStream {
    /// The stream this handle reads from
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Read received bytes in order
    ///
    /// Returns `Ok(None)` once the stream has been read to its end.
    pub async fn read(&self, buf: &mut [u8]) -> Result<Option<usize>, ReadError> {
        loop {
            let notify = {
                let mut state = self.shared.state.lock().unwrap();
                let close_err = state.close_err.clone();
                let entry = match state.streams.get_mut(&self.id) {
                    Some(entry) => entry,
                    None => return Ok(None), // stream finished and deleted
                };
                let recv = match entry.recv.as_mut() {
                    Some(recv) => recv,
                    None => return Ok(None),
                };
                if let Some((code, _)) = recv.reset_received {
                    recv.reset_delivered = true;
                    let id = self.id;
                    state.maybe_delete(id);
                    return Err(ReadError::Reset(code));
                }
                let n = recv.buffer.read(buf);
                if n > 0 {
                    // Replenish windows once half depleted
                    let read_offset = recv.buffer.read_offset();
                    if recv.max_data - read_offset < recv.window / 2 {
                        recv.max_data = read_offset + recv.window;
                        let frame = Frame::MaxStreamData {
                            id: self.id,
                            offset: recv.max_data,
                        };
                        state.pending.push_back(frame);
                    }
                    state.conn.consumed += n as u64;
                    if state.conn.local_max_data - state.conn.consumed < state.conn.window / 2 {
                        state.conn.local_max_data = state.conn.consumed + state.conn.window;
                        let limit = VarInt::from_u64(state.conn.local_max_data).unwrap();
                        state.pending.push_back(Frame::MaxData(limit));
                    }
                    let id = self.id;
                    state.maybe_delete(id);
                    drop(state);
                    self.shared.wake.notify_one();
                    return Ok(Some(n));
                }
                if recv
                    .final_size
                    .map_or(false, |size| recv.buffer.read_offset() == size)
                {
                    let id = self.id;
                    state.maybe_delete(id);
                    return Ok(None);
                }
                if let Some(err) = close_err {
                    return Err(ReadError::ConnectionClosed(err));
                }
                recv.notify.clone()
            };
            notify.notified().await;
        }
    }

    /// Stop reading, telling the peer to cease transmitting
    pub fn cancel_read(&self, error_code: VarInt) {
        let mut state = self.shared.state.lock().unwrap();
        let Some(recv) = state
            .streams
            .get_mut(&self.id)
            .and_then(|e| e.recv.as_mut())
        else {
            return;
        };
        if recv.stop_sent.is_some() || recv.reset_received.is_some() {
            return;
        }
        recv.stop_sent = Some(error_code);
        recv.buffer.clear();
        let id = self.id;
        state.pending.push_back(Frame::StopSending(StopSending { id, error_code }));
        drop(state);
        self.shared.wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn shared(side: Side) -> Arc<SharedStreams> {
        SharedStreams::new(side, 100, 100)
    }

    fn stream_frame(id: StreamId, offset: u64, data: &'static [u8], fin: bool) -> StreamFrame {
        StreamFrame {
            id,
            offset,
            fin,
            data: Bytes::from_static(data),
        }
    }

    #[tokio::test]
    async fn open_write_pull_frames() {
        let shared = shared(Side::Client);
        let (id, send, recv) = shared.open_stream(Dir::Bi).unwrap().unwrap();
        assert!(recv.is_some());
        assert_eq!(id.index(), 0);
        assert_eq!(id.initiator(), Side::Client);

        send.write_all(b"hello world").await.unwrap();
        send.finish().unwrap();

        let frames = shared.state.lock().unwrap().poll_transmit(1200);
        assert_eq!(frames.len(), 1);
        assert_matches!(
            &frames[0],
            Frame::Stream(f) if f.id == id && f.offset == 0 && f.fin && &f.data[..] == b"hello world"
        );
        // Nothing left afterwards
        assert!(shared.state.lock().unwrap().poll_transmit(1200).is_empty());
    }

    #[tokio::test]
    async fn incoming_stream_accept_and_read() {
        let shared = shared(Side::Server);
        let id = StreamId::new(Side::Client, Dir::Bi, 0);
        shared
            .state
            .lock()
            .unwrap()
            .received_stream_frame(&stream_frame(id, 0, b"request", true))
            .unwrap();

        let (accepted, send_half, recv_half) = shared.accept_stream(Dir::Bi).await.unwrap();
        assert_eq!(accepted, id);
        assert!(send_half.is_some());
        let mut buf = [0; 16];
        assert_eq!(recv_half.read(&mut buf).await.unwrap(), Some(7));
        assert_eq!(&buf[..7], b"request");
        assert_eq!(recv_half.read(&mut buf).await.unwrap(), None);
    }

    #[tokio::test]
    async fn stream_limit_enforced() {
        let shared = shared(Side::Server);
        let id = StreamId::new(Side::Client, Dir::Uni, 100);
        let err = shared
            .state
            .lock()
            .unwrap()
            .received_stream_frame(&stream_frame(id, 0, b"x", false))
            .unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::STREAM_LIMIT_ERROR);
    }

    #[tokio::test]
    async fn flow_control_violation_detected() {
        let shared = shared(Side::Server);
        let id = StreamId::new(Side::Client, Dir::Uni, 0);
        let mut state = shared.state.lock().unwrap();
        state.received_stream_frame(&stream_frame(id, 0, b"ok", false)).unwrap();
        // Shrink the advertised window to provoke the check
        state
            .streams
            .get_mut(&id)
            .unwrap()
            .recv
            .as_mut()
            .unwrap()
            .max_data = 4;
        let err = state
            .received_stream_frame(&stream_frame(id, 2, b"too much", false))
            .unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::FLOW_CONTROL_ERROR);
    }

    #[tokio::test]
    async fn inconsistent_retransmission_is_fatal() {
        let shared = shared(Side::Server);
        let id = StreamId::new(Side::Client, Dir::Uni, 0);
        let mut state = shared.state.lock().unwrap();
        state.received_stream_frame(&stream_frame(id, 0, b"abc", false)).unwrap();
        let err = state
            .received_stream_frame(&stream_frame(id, 1, b"xyz", false))
            .unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::FRAME_ENCODING_ERROR);
    }

    #[tokio::test]
    async fn reset_surfaces_to_reader() {
        let shared = shared(Side::Server);
        let id = StreamId::new(Side::Client, Dir::Uni, 0);
        shared
            .state
            .lock()
            .unwrap()
            .received_reset_stream(&ResetStream {
                id,
                error_code: VarInt(42),
                final_size: VarInt(0),
            })
            .unwrap();
        let (_, _, recv) = shared.accept_stream(Dir::Uni).await.unwrap();
        let mut buf = [0; 4];
        assert_eq!(recv.read(&mut buf).await, Err(ReadError::Reset(VarInt(42))));
    }

    #[tokio::test]
    async fn stop_sending_resets_and_fails_writer() {
        let shared = shared(Side::Client);
        let (id, send, _) = shared.open_stream(Dir::Bi).unwrap().unwrap();
        send.write_all(b"data").await.unwrap();
        shared
            .state
            .lock()
            .unwrap()
            .received_stop_sending(&StopSending {
                id,
                error_code: VarInt(9),
            })
            .unwrap();
        assert_eq!(
            send.write(b"more").await,
            Err(WriteError::Stopped(VarInt(9)))
        );
        // The queued RESET_STREAM echoes the peer's code
        let state = shared.state.lock().unwrap();
        assert!(state.pending.iter().any(|f| matches!(
            f,
            Frame::ResetStream(r) if r.id == id && r.error_code == VarInt(9)
        )));
    }

    #[tokio::test]
    async fn max_stream_data_unblocks_writer() {
        let shared = shared(Side::Client);
        let (id, send, _) = shared.open_stream(Dir::Bi).unwrap().unwrap();
        // Exhaust the stream window
        {
            let mut state = shared.state.lock().unwrap();
            let half = state
                .streams
                .get_mut(&id)
                .unwrap()
                .send
                .as_mut()
                .unwrap();
            half.max_data = 4;
        }
        assert_eq!(send.write(b"123456").await.unwrap(), 4);

        let writer = {
            let send = send.clone();
            tokio::spawn(async move { send.write(b"56").await })
        };
        tokio::task::yield_now().await;
        shared
            .state
            .lock()
            .unwrap()
            .received_max_stream_data(id, 100)
            .unwrap();
        assert_eq!(writer.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn deleting_incoming_stream_issues_credit() {
        let shared = shared(Side::Server);
        let id = StreamId::new(Side::Client, Dir::Uni, 0);
        shared
            .state
            .lock()
            .unwrap()
            .received_stream_frame(&stream_frame(id, 0, b"x", true))
            .unwrap();
        let (_, _, recv) = shared.accept_stream(Dir::Uni).await.unwrap();
        let mut buf = [0; 4];
        assert_eq!(recv.read(&mut buf).await.unwrap(), Some(1));
        assert_eq!(recv.read(&mut buf).await.unwrap(), None);
        let state = shared.state.lock().unwrap();
        assert!(!state.streams.contains_key(&id));
        assert!(state
            .pending
            .iter()
            .any(|f| matches!(f, Frame::MaxStreams { dir: Dir::Uni, count: 101 })));
    }

    #[tokio::test]
    async fn close_fails_blocked_operations() {
        let shared = shared(Side::Server);
        let accept = {
            let shared = shared.clone();
            tokio::spawn(async move { shared.accept_stream(Dir::Bi).await })
        };
        tokio::task::yield_now().await;
        shared
            .state
            .lock()
            .unwrap()
            .close(ConnectionError::TimedOut);
        assert_eq!(accept.await.unwrap().unwrap_err(), ConnectionError::TimedOut);
    }

    #[tokio::test]
    async fn streams_blocked_when_limit_reached() {
        let shared = shared(Side::Client);
        {
            let mut state = shared.state.lock().unwrap();
            state.max_open[Dir::Bi as usize] = 1;
        }
        assert!(shared.open_stream(Dir::Bi).unwrap().is_some());
        assert!(shared.open_stream(Dir::Bi).unwrap().is_none());
        let mut state = shared.state.lock().unwrap();
        assert!(state
            .pending
            .iter()
            .any(|f| matches!(f, Frame::StreamsBlocked { dir: Dir::Bi, limit: 1 })));
        // Raising the limit clears the way
        state.received_max_streams(Dir::Bi, 2);
        drop(state);
        assert!(shared.open_stream(Dir::Bi).unwrap().is_some());
    }
}
