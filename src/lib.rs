//! QUIC v1 transport with BBR congestion control
//!
//! This crate implements the core of an IETF QUIC endpoint: packet
//! protection across the three encryption levels, loss detection and
//! retransmission scheduling driven by a pluggable congestion controller,
//! delayed-ACK generation, and flow-controlled multiplexed streams. TLS 1.3
//! message processing is delegated to a [`TlsProvider`] supplied by the
//! caller; UDP sockets are owned by the [`Endpoint`].
//!
//! The entry points are [`Endpoint::listen`] and [`Endpoint::dial`].

#![warn(missing_debug_implementations)]

use std::{fmt, ops};

mod coding;
mod varint;
pub use crate::varint::VarInt;

mod range_set;

mod frame;
pub use crate::frame::{ApplicationClose, ConnectionClose};

mod packet;
pub use crate::packet::{ConnectionId, SpaceId};

mod transport_error;
pub use crate::transport_error::{Error as TransportError, ErrorCode as TransportErrorCode};

pub mod congestion;

mod recovery;
pub use crate::recovery::{RttEstimator, SendMode};

mod tracker;

pub mod crypto;
pub use crate::crypto::setup::{HandshakeClosed, PeerParameters, TlsHandle, TlsProvider};
pub use crate::crypto::Suite;

mod streams;
pub use crate::streams::{ReadError, RecvStream, SendStream, WriteError};

mod config;
pub use crate::config::{ConfigError, QuicConfig, TlsConfig};

mod session;
pub use crate::session::{ConnectionError, Session};

mod endpoint;
pub use crate::endpoint::{ConnectError, Endpoint, Listener};

/// The QUIC version implemented
pub const VERSION: u32 = 0x0000_0001;

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl Side {
    #[inline]
    pub(crate) fn is_client(self) -> bool {
        self == Side::Client
    }
}

impl ops::Not for Side {
    type Output = Side;
    fn not(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

/// Whether a stream communicates data in both directions or only from the initiator
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Dir {
    /// Data flows in both directions
    Bi = 0,
    /// Data flows only from the stream's initiator
    Uni = 1,
}

impl Dir {
    pub(crate) fn iter() -> impl Iterator<Item = Self> {
        [Self::Bi, Self::Uni].iter().copied()
    }
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::Bi => "bidirectional",
            Self::Uni => "unidirectional",
        })
    }
}

/// Identifier for a stream within a particular connection
///
/// The low two bits encode the initiating side and the directionality; the
/// remaining 60 bits are the per-(side, direction) ordinal.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(pub(crate) u64);

impl StreamId {
    pub(crate) fn new(initiator: Side, dir: Dir, index: u64) -> Self {
        Self(index << 2 | (dir as u64) << 1 | initiator as u64)
    }

    /// Which side of a connection initiated the stream
    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    /// Which directions data flows in
    pub fn dir(self) -> Dir {
        if self.0 & 0x2 == 0 {
            Dir::Bi
        } else {
            Dir::Uni
        }
    }

    /// Distinguishes streams of the same initiator and directionality
    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let initiator = match self.initiator() {
            Side::Client => "client",
            Side::Server => "server",
        };
        write!(f, "{} {} stream {}", initiator, self.dir(), self.index())
    }
}

impl From<StreamId> for VarInt {
    fn from(x: StreamId) -> Self {
        // Stream IDs are 62 bits by construction
        Self(x.0)
    }
}

impl coding::Codec for StreamId {
    fn decode<B: bytes::Buf>(buf: &mut B) -> coding::Result<Self> {
        VarInt::decode(buf).map(|x| Self(x.into_inner()))
    }
    fn encode<B: bytes::BufMut>(&self, buf: &mut B) {
        VarInt(self.0).encode(buf)
    }
}

//
// Protocol constants shared across modules
//

/// Largest connection ID length permitted by QUIC v1
pub(crate) const MAX_CID_SIZE: usize = 20;
/// Stateless reset tokens are always 16 bytes
pub(crate) const RESET_TOKEN_SIZE: usize = 16;
/// Minimum size of a client Initial datagram
pub(crate) const MIN_INITIAL_SIZE: usize = 1200;
/// Assumed UDP payload size before path MTU information is available
pub(crate) const BASE_DATAGRAM_SIZE: u64 = 1200;
/// Granularity below which timers are not meaningful
pub(crate) const TIMER_GRANULARITY: std::time::Duration = std::time::Duration::from_millis(1);
/// Upper bound on the delay we may impose on acknowledging an ack-eliciting packet
pub(crate) const MAX_ACK_DELAY: std::time::Duration = std::time::Duration::from_millis(25);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_bits() {
        let id = StreamId::new(Side::Server, Dir::Uni, 5);
        assert_eq!(id.0, 5 << 2 | 0x2 | 0x1);
        assert_eq!(id.initiator(), Side::Server);
        assert_eq!(id.dir(), Dir::Uni);
        assert_eq!(id.index(), 5);

        let id = StreamId::new(Side::Client, Dir::Bi, 0);
        assert_eq!(id.0, 0);
        assert_eq!(id.initiator(), Side::Client);
        assert_eq!(id.dir(), Dir::Bi);
    }
}
