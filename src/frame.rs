use std::{
    fmt::{self, Write},
    ops::RangeInclusive,
    time::Duration,
};

use bytes::{Buf, BufMut, Bytes};
use tinyvec::TinyVec;

use crate::{
    coding::{self, BufExt, BufMutExt, UnexpectedEnd},
    packet::ConnectionId,
    range_set::RangeSet,
    transport_error::{Error as TransportError, ErrorCode},
    Dir, StreamId, VarInt, MAX_CID_SIZE, RESET_TOKEN_SIZE,
};

/// Exponent applied to the ACK Delay field, per our (default) transport parameters
const ACK_DELAY_EXPONENT: u64 = 3;

/// A QUIC frame type
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct FrameType(u64);

impl FrameType {
    fn stream(self) -> Option<StreamInfo> {
        if STREAM_TYS.contains(&self.0) {
            Some(StreamInfo(self.0 as u8))
        } else {
            None
        }
    }
}

impl coding::Codec for FrameType {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        Ok(Self(buf.get_var()?))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write_var(self.0);
    }
}

macro_rules! frame_types {
    {$($name:ident = $val:expr,)*} => {
        impl FrameType {
            $(pub(crate) const $name: FrameType = FrameType($val);)*
        }

        impl fmt::Debug for FrameType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    _ => write!(f, "Type({:02x})", self.0)
                }
            }
        }

        impl fmt::Display for FrameType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    x if STREAM_TYS.contains(&x) => f.write_str("STREAM"),
                    _ => write!(f, "<unknown {:02x}>", self.0),
                }
            }
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct StreamInfo(u8);

impl StreamInfo {
    fn fin(self) -> bool {
        self.0 & 0x01 != 0
    }
    fn len(self) -> bool {
        self.0 & 0x02 != 0
    }
    fn off(self) -> bool {
        self.0 & 0x04 != 0
    }
}

frame_types! {
    PADDING = 0x00,
    PING = 0x01,
    ACK = 0x02,
    ACK_ECN = 0x03,
    RESET_STREAM = 0x04,
    STOP_SENDING = 0x05,
    CRYPTO = 0x06,
    NEW_TOKEN = 0x07,
    // STREAM 0x08..=0x0f
    MAX_DATA = 0x10,
    MAX_STREAM_DATA = 0x11,
    MAX_STREAMS_BIDI = 0x12,
    MAX_STREAMS_UNI = 0x13,
    DATA_BLOCKED = 0x14,
    STREAM_DATA_BLOCKED = 0x15,
    STREAMS_BLOCKED_BIDI = 0x16,
    STREAMS_BLOCKED_UNI = 0x17,
    NEW_CONNECTION_ID = 0x18,
    RETIRE_CONNECTION_ID = 0x19,
    PATH_CHALLENGE = 0x1a,
    PATH_RESPONSE = 0x1b,
    CONNECTION_CLOSE = 0x1c,
    APPLICATION_CLOSE = 0x1d,
    HANDSHAKE_DONE = 0x1e,
}

const STREAM_TYS: RangeInclusive<u64> = RangeInclusive::new(0x08, 0x0f);

/// A fully-parsed QUIC frame
#[derive(Debug, Clone)]
pub(crate) enum Frame {
    Padding,
    Ping,
    Ack(Ack),
    ResetStream(ResetStream),
    StopSending(StopSending),
    Crypto(Crypto),
    NewToken(NewToken),
    Stream(StreamFrame),
    MaxData(VarInt),
    MaxStreamData { id: StreamId, offset: u64 },
    MaxStreams { dir: Dir, count: u64 },
    DataBlocked { offset: u64 },
    StreamDataBlocked { id: StreamId, offset: u64 },
    StreamsBlocked { dir: Dir, limit: u64 },
    NewConnectionId(NewConnectionId),
    RetireConnectionId { sequence: u64 },
    PathChallenge(u64),
    PathResponse(u64),
    Close(Close),
    HandshakeDone,
}

impl Frame {
    pub(crate) fn ty(&self) -> FrameType {
        use Frame::*;
        match *self {
            Padding => FrameType::PADDING,
            Ping => FrameType::PING,
            Ack(ref x) => {
                if x.ecn.is_some() {
                    FrameType::ACK_ECN
                } else {
                    FrameType::ACK
                }
            }
            ResetStream(_) => FrameType::RESET_STREAM,
            StopSending(_) => FrameType::STOP_SENDING,
            Crypto(_) => FrameType::CRYPTO,
            NewToken(_) => FrameType::NEW_TOKEN,
            Stream(ref x) => {
                let mut ty = *STREAM_TYS.start() | 0x02;
                if x.fin {
                    ty |= 0x01;
                }
                if x.offset != 0 {
                    ty |= 0x04;
                }
                FrameType(ty)
            }
            MaxData(_) => FrameType::MAX_DATA,
            MaxStreamData { .. } => FrameType::MAX_STREAM_DATA,
            MaxStreams { dir: Dir::Bi, .. } => FrameType::MAX_STREAMS_BIDI,
            MaxStreams { dir: Dir::Uni, .. } => FrameType::MAX_STREAMS_UNI,
            DataBlocked { .. } => FrameType::DATA_BLOCKED,
            StreamDataBlocked { .. } => FrameType::STREAM_DATA_BLOCKED,
            StreamsBlocked { dir: Dir::Bi, .. } => FrameType::STREAMS_BLOCKED_BIDI,
            StreamsBlocked { dir: Dir::Uni, .. } => FrameType::STREAMS_BLOCKED_UNI,
            NewConnectionId(_) => FrameType::NEW_CONNECTION_ID,
            RetireConnectionId { .. } => FrameType::RETIRE_CONNECTION_ID,
            PathChallenge(_) => FrameType::PATH_CHALLENGE,
            PathResponse(_) => FrameType::PATH_RESPONSE,
            Close(self::Close::Connection(_)) => FrameType::CONNECTION_CLOSE,
            Close(self::Close::Application(_)) => FrameType::APPLICATION_CLOSE,
            HandshakeDone => FrameType::HANDSHAKE_DONE,
        }
    }

    /// Whether the receiver must eventually acknowledge a packet carrying this frame
    pub(crate) fn is_ack_eliciting(&self) -> bool {
        !matches!(*self, Self::Ack(_) | Self::Padding | Self::Close(_))
    }

    /// Append the wire encoding of this frame to `buf`
    pub(crate) fn encode<W: BufMut>(&self, buf: &mut W) {
        use Frame::*;
        match *self {
            Padding => buf.write(FrameType::PADDING),
            Ping => buf.write(FrameType::PING),
            Ack(ref x) => x.encode(buf),
            ResetStream(ref x) => x.encode(buf),
            StopSending(ref x) => x.encode(buf),
            Crypto(ref x) => x.encode(buf),
            NewToken(ref x) => x.encode(buf),
            Stream(ref x) => x.encode(buf),
            MaxData(x) => {
                buf.write(FrameType::MAX_DATA);
                buf.write(x);
            }
            MaxStreamData { id, offset } => {
                buf.write(FrameType::MAX_STREAM_DATA);
                buf.write(id);
                buf.write_var(offset);
            }
            MaxStreams { dir, count } => {
                buf.write(match dir {
                    Dir::Bi => FrameType::MAX_STREAMS_BIDI,
                    Dir::Uni => FrameType::MAX_STREAMS_UNI,
                });
                buf.write_var(count);
            }
            DataBlocked { offset } => {
                buf.write(FrameType::DATA_BLOCKED);
                buf.write_var(offset);
            }
            StreamDataBlocked { id, offset } => {
                buf.write(FrameType::STREAM_DATA_BLOCKED);
                buf.write(id);
                buf.write_var(offset);
            }
            StreamsBlocked { dir, limit } => {
                buf.write(match dir {
                    Dir::Bi => FrameType::STREAMS_BLOCKED_BIDI,
                    Dir::Uni => FrameType::STREAMS_BLOCKED_UNI,
                });
                buf.write_var(limit);
            }
            NewConnectionId(ref x) => x.encode(buf),
            RetireConnectionId { sequence } => {
                buf.write(FrameType::RETIRE_CONNECTION_ID);
                buf.write_var(sequence);
            }
            PathChallenge(token) => {
                buf.write(FrameType::PATH_CHALLENGE);
                buf.write(token);
            }
            PathResponse(token) => {
                buf.write(FrameType::PATH_RESPONSE);
                buf.write(token);
            }
            Close(ref x) => x.encode(buf),
            HandshakeDone => buf.write(FrameType::HANDSHAKE_DONE),
        }
    }

    /// Exact size of the wire encoding, used for packet packing decisions
    pub(crate) fn size(&self) -> usize {
        use Frame::*;
        match *self {
            Padding | Ping | HandshakeDone => 1,
            Ack(ref x) => x.size(),
            ResetStream(ref x) => x.size(),
            StopSending(ref x) => x.size(),
            Crypto(ref x) => x.size(),
            NewToken(ref x) => x.size(),
            Stream(ref x) => x.size(),
            MaxData(x) => 1 + x.size(),
            MaxStreamData { id, offset } => 1 + VarInt(id.0).size() + VarInt(offset).size(),
            MaxStreams { count, .. } => 1 + VarInt(count).size(),
            DataBlocked { offset } => 1 + VarInt(offset).size(),
            StreamDataBlocked { id, offset } => 1 + VarInt(id.0).size() + VarInt(offset).size(),
            StreamsBlocked { limit, .. } => 1 + VarInt(limit).size(),
            NewConnectionId(ref x) => x.size(),
            RetireConnectionId { sequence } => 1 + VarInt(sequence).size(),
            PathChallenge(_) | PathResponse(_) => 1 + 8,
            Close(ref x) => x.size(),
        }
    }
}

/// One contiguous run of acknowledged packet numbers
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub(crate) struct AckRange {
    pub(crate) smallest: u64,
    pub(crate) largest: u64,
}

impl AckRange {
    pub(crate) fn contains(&self, pn: u64) -> bool {
        (self.smallest..=self.largest).contains(&pn)
    }
}

pub(crate) type AckRangeVec = TinyVec<[AckRange; 4]>;

/// An ACK frame
///
/// `ranges` is ordered descending by `largest` with strictly positive gaps
/// between consecutive entries; the invariant is maintained by both the
/// parser and [`Ack::from_range_set`].
#[derive(Clone, Eq, PartialEq)]
pub(crate) struct Ack {
    pub(crate) delay: u64,
    pub(crate) ranges: AckRangeVec,
    pub(crate) ecn: Option<EcnCounts>,
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ranges = "[".to_string();
        let mut first = true;
        for range in &self.ranges {
            if !first {
                ranges.push(',');
            }
            write!(ranges, "{}..={}", range.smallest, range.largest)?;
            first = false;
        }
        ranges.push(']');
        f.debug_struct("Ack")
            .field("largest", &self.largest_acked())
            .field("delay", &self.delay)
            .field("ecn", &self.ecn)
            .field("ranges", &ranges)
            .finish()
    }
}

impl Ack {
    /// Build an ACK over the topmost `max_ranges` ranges of `set`
    ///
    /// Returns `None` if `set` is empty.
    pub(crate) fn from_range_set(
        set: &RangeSet,
        delay_time: Duration,
        max_ranges: usize,
        ecn: Option<EcnCounts>,
    ) -> Option<Self> {
        if set.is_empty() {
            return None;
        }
        let ranges = set
            .iter()
            .rev()
            .take(max_ranges)
            .map(|r| AckRange {
                smallest: r.start,
                largest: r.end - 1,
            })
            .collect();
        Some(Self {
            delay: delay_time.as_micros() as u64 >> ACK_DELAY_EXPONENT,
            ranges,
            ecn,
        })
    }

    pub(crate) fn largest_acked(&self) -> u64 {
        self.ranges[0].largest
    }

    pub(crate) fn lowest_acked(&self) -> u64 {
        self.ranges[self.ranges.len() - 1].smallest
    }

    pub(crate) fn has_missing_ranges(&self) -> bool {
        self.ranges.len() > 1
    }

    pub(crate) fn acks_packet(&self, pn: u64) -> bool {
        self.ranges.iter().any(|r| r.contains(pn))
    }

    /// The reported delay between receipt of the largest packet and this ACK
    pub(crate) fn delay_time(&self) -> Duration {
        Duration::from_micros(self.delay << ACK_DELAY_EXPONENT)
    }

    fn encode<W: BufMut>(&self, buf: &mut W) {
        buf.write(if self.ecn.is_some() {
            FrameType::ACK_ECN
        } else {
            FrameType::ACK
        });
        let first = &self.ranges[0];
        buf.write_var(first.largest);
        buf.write_var(self.delay);
        buf.write_var(self.ranges.len() as u64 - 1);
        buf.write_var(first.largest - first.smallest);
        let mut prev_smallest = first.smallest;
        for block in &self.ranges[1..] {
            buf.write_var(prev_smallest - block.largest - 2);
            buf.write_var(block.largest - block.smallest);
            prev_smallest = block.smallest;
        }
        if let Some(x) = self.ecn {
            x.encode(buf);
        }
    }

    fn size(&self) -> usize {
        let first = &self.ranges[0];
        let mut n = 1
            + VarInt(first.largest).size()
            + VarInt(self.delay).size()
            + VarInt(self.ranges.len() as u64 - 1).size()
            + VarInt(first.largest - first.smallest).size();
        let mut prev_smallest = first.smallest;
        for block in &self.ranges[1..] {
            n += VarInt(prev_smallest - block.largest - 2).size()
                + VarInt(block.largest - block.smallest).size();
            prev_smallest = block.smallest;
        }
        if let Some(x) = self.ecn {
            n += x.size();
        }
        n
    }

    fn decode<B: Buf>(bytes: &mut B, ecn: bool) -> Result<Self, IterErr> {
        let largest = bytes.get_var()?;
        let delay = bytes.get_var()?;
        let extra_ranges = bytes.get_var()?;
        let first_len = bytes.get_var()?;
        let mut smallest = largest.checked_sub(first_len).ok_or(IterErr::Malformed)?;
        let mut ranges = AckRangeVec::new();
        ranges.push(AckRange { smallest, largest });
        for _ in 0..extra_ranges {
            let gap = bytes.get_var()?;
            let len = bytes.get_var()?;
            let next_largest = smallest
                .checked_sub(gap)
                .and_then(|x| x.checked_sub(2))
                .ok_or(IterErr::Malformed)?;
            smallest = next_largest.checked_sub(len).ok_or(IterErr::Malformed)?;
            ranges.push(AckRange {
                smallest,
                largest: next_largest,
            });
        }
        let ecn = if ecn {
            Some(EcnCounts {
                ect0: bytes.get_var()?,
                ect1: bytes.get_var()?,
                ce: bytes.get_var()?,
            })
        } else {
            None
        };
        Ok(Self { delay, ranges, ecn })
    }
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub(crate) struct EcnCounts {
    pub(crate) ect0: u64,
    pub(crate) ect1: u64,
    pub(crate) ce: u64,
}

impl EcnCounts {
    fn encode<W: BufMut>(&self, out: &mut W) {
        out.write_var(self.ect0);
        out.write_var(self.ect1);
        out.write_var(self.ce);
    }

    fn size(&self) -> usize {
        VarInt(self.ect0).size() + VarInt(self.ect1).size() + VarInt(self.ce).size()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct ResetStream {
    pub(crate) id: StreamId,
    pub(crate) error_code: VarInt,
    pub(crate) final_size: VarInt,
}

impl ResetStream {
    fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::RESET_STREAM);
        out.write(self.id);
        out.write(self.error_code);
        out.write(self.final_size);
    }

    fn size(&self) -> usize {
        1 + VarInt(self.id.0).size() + self.error_code.size() + self.final_size.size()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct StopSending {
    pub(crate) id: StreamId,
    pub(crate) error_code: VarInt,
}

impl StopSending {
    fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::STOP_SENDING);
        out.write(self.id);
        out.write(self.error_code);
    }

    fn size(&self) -> usize {
        1 + VarInt(self.id.0).size() + self.error_code.size()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Crypto {
    pub(crate) offset: u64,
    pub(crate) data: Bytes,
}

impl Crypto {
    /// Smallest number of bytes a non-empty CRYPTO frame can require
    pub(crate) const SIZE_BOUND: usize = 17;

    fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::CRYPTO);
        out.write_var(self.offset);
        out.write_var(self.data.len() as u64);
        out.put_slice(&self.data);
    }

    fn size(&self) -> usize {
        1 + VarInt(self.offset).size()
            + VarInt(self.data.len() as u64).size()
            + self.data.len()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct NewToken {
    pub(crate) token: Bytes,
}

impl NewToken {
    fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::NEW_TOKEN);
        out.write_var(self.token.len() as u64);
        out.put_slice(&self.token);
    }

    fn size(&self) -> usize {
        1 + VarInt(self.token.len() as u64).size() + self.token.len()
    }
}

/// A STREAM frame
///
/// Always encoded with an explicit length so frames can be freely reordered
/// within a packet.
#[derive(Debug, Clone)]
pub(crate) struct StreamFrame {
    pub(crate) id: StreamId,
    pub(crate) offset: u64,
    pub(crate) fin: bool,
    pub(crate) data: Bytes,
}

impl StreamFrame {
    /// Header bytes a STREAM frame can require before any payload
    pub(crate) const SIZE_BOUND: usize = 1 + 8 + 8 + 8;

    fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(self.ty());
        out.write(self.id);
        if self.offset != 0 {
            out.write_var(self.offset);
        }
        out.write_var(self.data.len() as u64);
        out.put_slice(&self.data);
    }

    pub(crate) fn size(&self) -> usize {
        let mut n = 1 + VarInt(self.id.0).size();
        if self.offset != 0 {
            n += VarInt(self.offset).size();
        }
        n + VarInt(self.data.len() as u64).size() + self.data.len()
    }

    fn ty(&self) -> FrameType {
        let mut ty = *STREAM_TYS.start() | 0x02;
        if self.fin {
            ty |= 0x01;
        }
        if self.offset != 0 {
            ty |= 0x04;
        }
        FrameType(ty)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct NewConnectionId {
    pub(crate) sequence: u64,
    pub(crate) retire_prior_to: u64,
    pub(crate) id: ConnectionId,
    pub(crate) reset_token: [u8; RESET_TOKEN_SIZE],
}

impl NewConnectionId {
    fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::NEW_CONNECTION_ID);
        out.write_var(self.sequence);
        out.write_var(self.retire_prior_to);
        out.put_u8(self.id.len() as u8);
        out.put_slice(&self.id);
        out.put_slice(&self.reset_token);
    }

    fn size(&self) -> usize {
        1 + VarInt(self.sequence).size()
            + VarInt(self.retire_prior_to).size()
            + 1
            + self.id.len()
            + RESET_TOKEN_SIZE
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Close {
    Connection(ConnectionClose),
    Application(ApplicationClose),
}

impl Close {
    fn encode<W: BufMut>(&self, out: &mut W) {
        match *self {
            Self::Connection(ref x) => x.encode(out),
            Self::Application(ref x) => x.encode(out),
        }
    }

    fn size(&self) -> usize {
        match *self {
            Self::Connection(ref x) => x.size(),
            Self::Application(ref x) => x.size(),
        }
    }
}

impl From<TransportError> for Close {
    fn from(x: TransportError) -> Self {
        Self::Connection(x.into())
    }
}

/// Reason given by the transport for closing the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionClose {
    /// Class of error as encoded in the specification
    pub error_code: ErrorCode,
    /// Type of frame that caused the close
    pub frame_type: Option<FrameType>,
    /// Human-readable reason for the close
    pub reason: Bytes,
}

impl fmt::Display for ConnectionClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error_code.fmt(f)?;
        if !self.reason.is_empty() {
            f.write_str(": ")?;
            f.write_str(&String::from_utf8_lossy(&self.reason))?;
        }
        Ok(())
    }
}

impl From<TransportError> for ConnectionClose {
    fn from(x: TransportError) -> Self {
        Self {
            error_code: x.code,
            frame_type: x.frame,
            reason: x.reason.into(),
        }
    }
}

impl ConnectionClose {
    fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::CONNECTION_CLOSE);
        out.write(self.error_code);
        out.write_var(self.frame_type.map_or(0, |x| x.0));
        out.write_var(self.reason.len() as u64);
        out.put_slice(&self.reason);
    }

    fn size(&self) -> usize {
        let ty = self.frame_type.map_or(0, |x| x.0);
        1 + VarInt(u64::from(self.error_code)).size()
            + VarInt(ty).size()
            + VarInt(self.reason.len() as u64).size()
            + self.reason.len()
    }
}

/// Reason given by an application for closing the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationClose {
    /// Application-specific reason code
    pub error_code: VarInt,
    /// Human-readable reason for the close
    pub reason: Bytes,
}

impl fmt::Display for ApplicationClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.reason.is_empty() {
            f.write_str(&String::from_utf8_lossy(&self.reason))?;
            f.write_str(" (code ")?;
            self.error_code.fmt(f)?;
            f.write_str(")")?;
        } else {
            self.error_code.fmt(f)?;
        }
        Ok(())
    }
}

impl ApplicationClose {
    fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::APPLICATION_CLOSE);
        out.write(self.error_code);
        out.write_var(self.reason.len() as u64);
        out.put_slice(&self.reason);
    }

    fn size(&self) -> usize {
        1 + self.error_code.size()
            + VarInt(self.reason.len() as u64).size()
            + self.reason.len()
    }
}

/// Streaming parser over the frames of a packet payload
pub(crate) struct Iter {
    bytes: Bytes,
    last_ty: Option<FrameType>,
}

impl Iter {
    pub(crate) fn new(payload: Bytes) -> Result<Self, TransportError> {
        if payload.is_empty() {
            // "An endpoint MUST treat receipt of a packet containing no
            // frames as a connection error of type PROTOCOL_VIOLATION."
            return Err(TransportError::PROTOCOL_VIOLATION(
                "packet payload is empty",
            ));
        }
        Ok(Self {
            bytes: payload,
            last_ty: None,
        })
    }

    fn take_len(&mut self) -> Result<Bytes, UnexpectedEnd> {
        let len = self.bytes.get_var()?;
        if len > self.bytes.remaining() as u64 {
            return Err(UnexpectedEnd);
        }
        Ok(self.bytes.split_to(len as usize))
    }

    fn try_next(&mut self) -> Result<Frame, IterErr> {
        let ty = self.bytes.get::<FrameType>()?;
        self.last_ty = Some(ty);
        Ok(match ty {
            FrameType::PADDING => Frame::Padding,
            FrameType::PING => Frame::Ping,
            FrameType::ACK | FrameType::ACK_ECN => {
                Frame::Ack(Ack::decode(&mut self.bytes, ty == FrameType::ACK_ECN)?)
            }
            FrameType::RESET_STREAM => Frame::ResetStream(ResetStream {
                id: self.bytes.get()?,
                error_code: self.bytes.get()?,
                final_size: self.bytes.get()?,
            }),
            FrameType::STOP_SENDING => Frame::StopSending(StopSending {
                id: self.bytes.get()?,
                error_code: self.bytes.get()?,
            }),
            FrameType::CRYPTO => Frame::Crypto(Crypto {
                offset: self.bytes.get_var()?,
                data: self.take_len()?,
            }),
            FrameType::NEW_TOKEN => Frame::NewToken(NewToken {
                token: self.take_len()?,
            }),
            FrameType::MAX_DATA => Frame::MaxData(self.bytes.get()?),
            FrameType::MAX_STREAM_DATA => Frame::MaxStreamData {
                id: self.bytes.get()?,
                offset: self.bytes.get_var()?,
            },
            FrameType::MAX_STREAMS_BIDI => Frame::MaxStreams {
                dir: Dir::Bi,
                count: self.bytes.get_var()?,
            },
            FrameType::MAX_STREAMS_UNI => Frame::MaxStreams {
                dir: Dir::Uni,
                count: self.bytes.get_var()?,
            },
            FrameType::DATA_BLOCKED => Frame::DataBlocked {
                offset: self.bytes.get_var()?,
            },
            FrameType::STREAM_DATA_BLOCKED => Frame::StreamDataBlocked {
                id: self.bytes.get()?,
                offset: self.bytes.get_var()?,
            },
            FrameType::STREAMS_BLOCKED_BIDI => Frame::StreamsBlocked {
                dir: Dir::Bi,
                limit: self.bytes.get_var()?,
            },
            FrameType::STREAMS_BLOCKED_UNI => Frame::StreamsBlocked {
                dir: Dir::Uni,
                limit: self.bytes.get_var()?,
            },
            FrameType::NEW_CONNECTION_ID => {
                let sequence = self.bytes.get_var()?;
                let retire_prior_to = self.bytes.get_var()?;
                if retire_prior_to > sequence {
                    return Err(IterErr::Malformed);
                }
                let length = self.bytes.get::<u8>()? as usize;
                if length > MAX_CID_SIZE || length == 0 {
                    return Err(IterErr::Malformed);
                }
                if self.bytes.remaining() < length {
                    return Err(IterErr::UnexpectedEnd);
                }
                let id = ConnectionId::new(&self.bytes.chunk()[..length]);
                self.bytes.advance(length);
                if self.bytes.remaining() < RESET_TOKEN_SIZE {
                    return Err(IterErr::UnexpectedEnd);
                }
                let mut reset_token = [0; RESET_TOKEN_SIZE];
                self.bytes.copy_to_slice(&mut reset_token);
                Frame::NewConnectionId(NewConnectionId {
                    sequence,
                    retire_prior_to,
                    id,
                    reset_token,
                })
            }
            FrameType::RETIRE_CONNECTION_ID => Frame::RetireConnectionId {
                sequence: self.bytes.get_var()?,
            },
            FrameType::PATH_CHALLENGE => Frame::PathChallenge(self.bytes.get()?),
            FrameType::PATH_RESPONSE => Frame::PathResponse(self.bytes.get()?),
            FrameType::CONNECTION_CLOSE => Frame::Close(Close::Connection(ConnectionClose {
                error_code: self.bytes.get()?,
                frame_type: {
                    let x = self.bytes.get_var()?;
                    if x == 0 {
                        None
                    } else {
                        Some(FrameType(x))
                    }
                },
                reason: self.take_len()?,
            })),
            FrameType::APPLICATION_CLOSE => Frame::Close(Close::Application(ApplicationClose {
                error_code: self.bytes.get()?,
                reason: self.take_len()?,
            })),
            FrameType::HANDSHAKE_DONE => Frame::HandshakeDone,
            _ => {
                if let Some(s) = ty.stream() {
                    Frame::Stream(StreamFrame {
                        id: self.bytes.get()?,
                        offset: if s.off() { self.bytes.get_var()? } else { 0 },
                        fin: s.fin(),
                        data: if s.len() {
                            self.take_len()?
                        } else {
                            self.bytes.split_to(self.bytes.remaining())
                        },
                    })
                } else {
                    return Err(IterErr::InvalidFrameId);
                }
            }
        })
    }
}

impl Iterator for Iter {
    type Item = Result<Frame, TransportError>;
    fn next(&mut self) -> Option<Self::Item> {
        if !self.bytes.has_remaining() {
            return None;
        }
        match self.try_next() {
            Ok(x) => Some(Ok(x)),
            Err(e) => {
                // Corrupt frame; skip the rest of the packet
                self.bytes.clear();
                Some(Err(TransportError {
                    code: ErrorCode::FRAME_ENCODING_ERROR,
                    frame: self.last_ty,
                    reason: e.to_string(),
                }))
            }
        }
    }
}

impl fmt::Debug for Iter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter").finish_non_exhaustive()
    }
}

#[derive(Debug)]
enum IterErr {
    UnexpectedEnd,
    InvalidFrameId,
    Malformed,
}

impl fmt::Display for IterErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::UnexpectedEnd => "unexpected end of packet",
            Self::InvalidFrameId => "invalid frame ID",
            Self::Malformed => "malformed frame",
        })
    }
}

impl From<UnexpectedEnd> for IterErr {
    fn from(_: UnexpectedEnd) -> Self {
        Self::UnexpectedEnd
    }
}
