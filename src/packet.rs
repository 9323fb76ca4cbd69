use std::{cmp::Ordering, fmt, io, ops::Range};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;
use thiserror::Error;

use crate::{
    coding::{self, BufExt, BufMutExt},
    crypto::{HeaderKey, PacketKey},
    MAX_CID_SIZE, VERSION,
};

/// Protocol-level identifier for a connection endpoint
///
/// Opaque on the wire, 0 to 20 bytes. Servers use these as the
/// demultiplexing key for incoming datagrams.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    /// Construct cid from byte array
    ///
    /// Panics if `bytes.len() > 20`.
    pub fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= MAX_CID_SIZE);
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    /// Generate a cid of `len` random bytes
    pub(crate) fn random(len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut bytes = [0; MAX_CID_SIZE];
        rand::rng().fill_bytes(&mut bytes[..len]);
        Self {
            len: len as u8,
            bytes,
        }
    }
}

impl ::std::ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[0..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.bytes[0..self.len as usize].fmt(f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

// Packet number encryption means a header's variable-length packet number
// can't be decoded without crypto context. We first decode the plain
// invariant header, which identifies the destination cid, version, and
// packet type; the caller then selects keys and calls `finish`.
#[derive(Debug)]
pub(crate) struct PartialDecode {
    plain_header: PlainHeader,
    buf: io::Cursor<BytesMut>,
}

impl PartialDecode {
    /// Begin decoding the first packet of a datagram
    ///
    /// Returns the remainder of the datagram when packets are coalesced.
    pub(crate) fn new(
        bytes: BytesMut,
        local_cid_len: usize,
    ) -> Result<(Self, Option<BytesMut>), PacketDecodeError> {
        let mut buf = io::Cursor::new(bytes);
        let plain_header = PlainHeader::decode(&mut buf, local_cid_len)?;
        let dgram_len = buf.get_ref().len();
        let packet_len = plain_header
            .payload_len()
            .map(|len| (buf.position() + len) as usize)
            .unwrap_or(dgram_len);
        match dgram_len.cmp(&packet_len) {
            Ordering::Equal => Ok((Self { plain_header, buf }, None)),
            Ordering::Less => Err(PacketDecodeError::InvalidHeader(
                "packet too short to contain payload length",
            )),
            Ordering::Greater => {
                let rest = Some(buf.get_mut().split_off(packet_len));
                Ok((Self { plain_header, buf }, rest))
            }
        }
    }

    pub(crate) fn space(&self) -> Option<SpaceId> {
        use self::PlainHeader::*;
        match self.plain_header {
            Initial { .. } => Some(SpaceId::Initial),
            Long {
                ty: LongType::Handshake,
                ..
            } => Some(SpaceId::Handshake),
            Long {
                ty: LongType::ZeroRtt,
                ..
            } => Some(SpaceId::Data),
            Short { .. } => Some(SpaceId::Data),
            _ => None,
        }
    }

    pub(crate) fn is_initial(&self) -> bool {
        self.space() == Some(SpaceId::Initial)
    }

    /// The partially-decoded packet bytes
    pub(crate) fn data(&self) -> &[u8] {
        self.buf.get_ref()
    }

    /// Length of the packet being decoded
    pub(crate) fn len(&self) -> usize {
        self.buf.get_ref().len()
    }

    /// Recover the full header, unprotecting it if `header_key` is given
    pub(crate) fn finish(self, header_key: Option<&HeaderKey>) -> Result<Packet, PacketDecodeError> {
        use self::PlainHeader::*;
        let Self {
            plain_header,
            mut buf,
        } = self;

        if let Initial {
            dst_cid,
            src_cid,
            token_pos,
            ..
        } = plain_header
        {
            let number = Self::unprotect_header(&mut buf, header_key.unwrap())?;
            let header_len = buf.position() as usize;
            let mut bytes = buf.into_inner();

            let header_data = bytes.split_to(header_len).freeze();
            let token = header_data.slice(token_pos.start..token_pos.end);
            return Ok(Packet {
                header: Header::Initial {
                    dst_cid,
                    src_cid,
                    token,
                    number,
                },
                header_data,
                payload: bytes,
            });
        }

        let header = match plain_header {
            Long {
                ty,
                dst_cid,
                src_cid,
                ..
            } => Header::Long {
                ty,
                dst_cid,
                src_cid,
                number: Self::unprotect_header(&mut buf, header_key.unwrap())?,
            },
            Retry {
                dst_cid,
                src_cid,
                token_pos,
            } => {
                let header_len = buf.get_ref().len();
                let bytes = buf.into_inner();
                let header_data = bytes.freeze();
                return Ok(Packet {
                    header: Header::Retry {
                        dst_cid,
                        src_cid,
                        token: header_data.slice(token_pos.start..token_pos.end),
                    },
                    header_data: header_data.slice(..header_len),
                    payload: BytesMut::new(),
                });
            }
            Short { spin, dst_cid, .. } => {
                let number = Self::unprotect_header(&mut buf, header_key.unwrap())?;
                let key_phase = buf.get_ref()[0] & KEY_PHASE_BIT != 0;
                Header::Short {
                    spin,
                    key_phase,
                    dst_cid,
                    number,
                }
            }
            VersionNegotiate {
                random,
                dst_cid,
                src_cid,
            } => {
                let mut supported_versions = Vec::new();
                while buf.remaining() >= 4 {
                    supported_versions.push(buf.get::<u32>().unwrap());
                }
                Header::VersionNegotiate {
                    random,
                    dst_cid,
                    src_cid,
                    supported_versions,
                }
            }
            Initial { .. } => unreachable!(),
        };

        let header_len = buf.position() as usize;
        let mut bytes = buf.into_inner();
        Ok(Packet {
            header,
            header_data: bytes.split_to(header_len).freeze(),
            payload: bytes,
        })
    }

    fn unprotect_header(
        buf: &mut io::Cursor<BytesMut>,
        header_key: &HeaderKey,
    ) -> Result<PacketNumber, PacketDecodeError> {
        let packet_length = buf.get_ref().len();
        let pn_offset = buf.position() as usize;
        if packet_length < pn_offset + 4 + header_key.sample_size() {
            return Err(PacketDecodeError::InvalidHeader(
                "packet too short to extract header protection sample",
            ));
        }

        header_key.decrypt(pn_offset, buf.get_mut());

        let len = PacketNumber::decode_len(buf.get_ref()[0]);
        PacketNumber::decode(len, buf)
    }
}

pub(crate) struct Packet {
    pub(crate) header: Header,
    pub(crate) header_data: Bytes,
    pub(crate) payload: BytesMut,
}

impl Packet {
    pub(crate) fn reserved_bits_valid(&self) -> bool {
        let mask = match self.header {
            Header::Short { .. } => SHORT_RESERVED_BITS,
            _ => LONG_RESERVED_BITS,
        };
        self.header_data[0] & mask == 0
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Header {
    Initial {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token: Bytes,
        number: PacketNumber,
    },
    Long {
        ty: LongType,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        number: PacketNumber,
    },
    Retry {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token: Bytes,
    },
    Short {
        spin: bool,
        key_phase: bool,
        dst_cid: ConnectionId,
        number: PacketNumber,
    },
    VersionNegotiate {
        random: u8,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        supported_versions: Vec<u32>,
    },
}

impl Header {
    pub(crate) fn encode(&self, w: &mut Vec<u8>) -> PartialEncode {
        use self::Header::*;
        let start = w.len();
        match *self {
            Initial {
                ref dst_cid,
                ref src_cid,
                ref token,
                number,
            } => {
                w.write(LONG_HEADER_FORM | FIXED_BIT | number.tag());
                w.write(VERSION);
                Self::encode_cids(w, dst_cid, src_cid);
                w.write_var(token.len() as u64);
                w.put_slice(token);
                w.write::<u16>(0); // Length placeholder; see `PartialEncode::finish`
                number.encode(w);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: Some((number.len(), true)),
                }
            }
            Long {
                ty,
                ref dst_cid,
                ref src_cid,
                number,
            } => {
                w.write(LONG_HEADER_FORM | FIXED_BIT | (ty as u8) << 4 | number.tag());
                w.write(VERSION);
                Self::encode_cids(w, dst_cid, src_cid);
                w.write::<u16>(0); // Length placeholder; see `PartialEncode::finish`
                number.encode(w);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: Some((number.len(), true)),
                }
            }
            Retry {
                ref dst_cid,
                ref src_cid,
                ref token,
            } => {
                w.write(LONG_HEADER_FORM | FIXED_BIT | (0x3 << 4));
                w.write(VERSION);
                Self::encode_cids(w, dst_cid, src_cid);
                w.put_slice(token);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: None,
                }
            }
            Short {
                spin,
                key_phase,
                ref dst_cid,
                number,
            } => {
                w.write(
                    FIXED_BIT
                        | if key_phase { KEY_PHASE_BIT } else { 0 }
                        | if spin { SPIN_BIT } else { 0 }
                        | number.tag(),
                );
                w.put_slice(dst_cid);
                number.encode(w);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: Some((number.len(), false)),
                }
            }
            VersionNegotiate {
                random,
                ref dst_cid,
                ref src_cid,
                ref supported_versions,
            } => {
                w.write(LONG_HEADER_FORM | random);
                w.write::<u32>(0);
                Self::encode_cids(w, dst_cid, src_cid);
                for &v in supported_versions {
                    w.write(v);
                }
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: None,
                }
            }
        }
    }

    fn encode_cids<W: BufMut>(w: &mut W, dst_cid: &ConnectionId, src_cid: &ConnectionId) {
        w.put_u8(dst_cid.len() as u8);
        w.put_slice(dst_cid);
        w.put_u8(src_cid.len() as u8);
        w.put_slice(src_cid);
    }

    pub(crate) fn number(&self) -> Option<PacketNumber> {
        use self::Header::*;
        Some(match *self {
            Initial { number, .. } => number,
            Long { number, .. } => number,
            Short { number, .. } => number,
            _ => return None,
        })
    }
}

pub(crate) struct PartialEncode {
    pub(crate) start: usize,
    pub(crate) header_len: usize,
    // Packet number length, whether a payload length field is present
    pn: Option<(usize, bool)>,
}

impl PartialEncode {
    /// Fill in the payload length, seal the payload, and protect the header
    ///
    /// `buf` must contain the entire packet with `tag_len` trailing bytes
    /// reserved for the AEAD tag.
    pub(crate) fn finish(
        self,
        buf: &mut [u8],
        header_key: &HeaderKey,
        crypto: Option<(u64, &PacketKey)>,
    ) {
        let PartialEncode {
            start, header_len, ..
        } = self;
        let (pn_len, write_len) = match self.pn {
            Some(x) => x,
            None => return,
        };

        let buf = &mut buf[start..];
        let pn_pos = header_len - pn_len;
        if write_len {
            let len = buf.len() - header_len + pn_len;
            assert!(len < 2usize.pow(14)); // Fits in the reserved two bytes
            let mut slice = &mut buf[pn_pos - 2..pn_pos];
            slice.put_u16(len as u16 | 0b01 << 14);
        }

        if let Some((number, key)) = crypto {
            key.encrypt(number, buf, header_len);
        }

        debug_assert!(
            pn_pos + 4 + header_key.sample_size() <= buf.len(),
            "packet must be padded to at least {} bytes for header protection sampling",
            pn_pos + 4 + header_key.sample_size()
        );
        header_key.encrypt(pn_pos, buf);
    }
}

impl fmt::Debug for PartialEncode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartialEncode")
            .field("header_len", &self.header_len)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
enum PlainHeader {
    Initial {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token_pos: Range<usize>,
        len: u64,
    },
    Long {
        ty: LongType,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        len: u64,
    },
    Retry {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token_pos: Range<usize>,
    },
    Short {
        spin: bool,
        dst_cid: ConnectionId,
    },
    VersionNegotiate {
        random: u8,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    },
}

impl PlainHeader {
    fn payload_len(&self) -> Option<u64> {
        use self::PlainHeader::*;
        match self {
            Initial { len, .. } | Long { len, .. } => Some(*len),
            _ => None,
        }
    }

    fn decode(
        buf: &mut io::Cursor<BytesMut>,
        local_cid_len: usize,
    ) -> Result<Self, PacketDecodeError> {
        let first = buf.get::<u8>()?;
        if first & LONG_HEADER_FORM == 0 {
            let spin = first & SPIN_BIT != 0;
            if first & FIXED_BIT == 0 {
                return Err(PacketDecodeError::InvalidHeader("fixed bit unset"));
            }
            let dst_cid = Self::get_cid(buf, local_cid_len)?;
            Ok(Self::Short { spin, dst_cid })
        } else {
            let version = buf.get::<u32>()?;

            let dcil = buf.get::<u8>()? as usize;
            let dst_cid = Self::get_cid(buf, dcil)?;

            let scil = buf.get::<u8>()? as usize;
            let src_cid = Self::get_cid(buf, scil)?;

            if version == 0 {
                let random = first & !LONG_HEADER_FORM;
                return Ok(Self::VersionNegotiate {
                    random,
                    dst_cid,
                    src_cid,
                });
            }

            if first & FIXED_BIT == 0 {
                return Err(PacketDecodeError::InvalidHeader("fixed bit unset"));
            }

            if version != VERSION {
                return Err(PacketDecodeError::UnsupportedVersion {
                    src_cid,
                    dst_cid,
                    version,
                });
            }

            match (first & 0x30) >> 4 {
                0x0 => {
                    let token_len = buf.get_var()? as usize;
                    let token_start = buf.position() as usize;
                    if buf.remaining() < token_len {
                        return Err(PacketDecodeError::InvalidHeader("token out of bounds"));
                    }
                    buf.advance(token_len);

                    let len = buf.get_var()?;
                    Ok(Self::Initial {
                        dst_cid,
                        src_cid,
                        token_pos: token_start..token_start + token_len,
                        len,
                    })
                }
                0x1 => Ok(Self::Long {
                    ty: LongType::ZeroRtt,
                    dst_cid,
                    src_cid,
                    len: buf.get_var()?,
                }),
                0x2 => Ok(Self::Long {
                    ty: LongType::Handshake,
                    dst_cid,
                    src_cid,
                    len: buf.get_var()?,
                }),
                0x3 => {
                    // Retry carries a token and a 16-byte integrity tag in
                    // place of a protected payload
                    let token_start = buf.position() as usize;
                    let remaining = buf.remaining();
                    if remaining < RETRY_TAG_SIZE {
                        return Err(PacketDecodeError::InvalidHeader("retry packet too short"));
                    }
                    let token_len = remaining - RETRY_TAG_SIZE;
                    buf.advance(remaining);
                    Ok(Self::Retry {
                        dst_cid,
                        src_cid,
                        token_pos: token_start..token_start + token_len,
                    })
                }
                _ => unreachable!(),
            }
        }
    }

    fn get_cid(buf: &mut io::Cursor<BytesMut>, len: usize) -> Result<ConnectionId, PacketDecodeError> {
        if len > MAX_CID_SIZE {
            return Err(PacketDecodeError::InvalidHeader(
                "illegal connection ID length",
            ));
        }
        if buf.remaining() < len {
            return Err(PacketDecodeError::InvalidHeader(
                "connection ID longer than packet",
            ));
        }
        let cid = ConnectionId::new(&buf.chunk()[..len]);
        buf.advance(len);
        Ok(cid)
    }
}

/// An encoded packet number
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum PacketNumber {
    U8(u8),
    U16(u16),
    U24(u32),
    U32(u32),
}

impl PacketNumber {
    /// Smallest encoding that unambiguously identifies `n` given the
    /// peer's largest acknowledged packet number
    pub(crate) fn new(n: u64, largest_acked: u64) -> Self {
        let range = (n - largest_acked) * 2;
        if range < 1 << 8 {
            Self::U8(n as u8)
        } else if range < 1 << 16 {
            Self::U16(n as u16)
        } else if range < 1 << 24 {
            Self::U24(n as u32)
        } else if range < 1 << 32 {
            Self::U32(n as u32)
        } else {
            panic!("packet number too large to encode")
        }
    }

    pub(crate) fn len(self) -> usize {
        use self::PacketNumber::*;
        match self {
            U8(_) => 1,
            U16(_) => 2,
            U24(_) => 3,
            U32(_) => 4,
        }
    }

    pub(crate) fn encode<W: BufMut>(self, w: &mut W) {
        use self::PacketNumber::*;
        match self {
            U8(x) => w.write(x),
            U16(x) => w.write(x),
            U24(x) => w.put_uint(u64::from(x), 3),
            U32(x) => w.write(x),
        }
    }

    pub(crate) fn decode<R: Buf>(len: usize, r: &mut R) -> Result<Self, PacketDecodeError> {
        use self::PacketNumber::*;
        if r.remaining() < len {
            return Err(PacketDecodeError::InvalidHeader("packet number out of bounds"));
        }
        Ok(match len {
            1 => U8(r.get()?),
            2 => U16(r.get()?),
            3 => U24(r.get_uint(3) as u32),
            4 => U32(r.get()?),
            _ => unreachable!(),
        })
    }

    pub(crate) fn decode_len(tag: u8) -> usize {
        1 + (tag & 0x03) as usize
    }

    fn tag(self) -> u8 {
        use self::PacketNumber::*;
        match self {
            U8(_) => 0b00,
            U16(_) => 0b01,
            U24(_) => 0b10,
            U32(_) => 0b11,
        }
    }

    /// Reconstruct the full packet number from its truncated encoding
    ///
    /// Chooses the unique value within the window centered on `expected`
    /// whose low bits match, per RFC 9000 Appendix A.3.
    pub(crate) fn expand(self, expected: u64) -> u64 {
        use self::PacketNumber::*;
        let truncated = match self {
            U8(x) => u64::from(x),
            U16(x) => u64::from(x),
            U24(x) => u64::from(x),
            U32(x) => u64::from(x),
        };
        let nbits = self.len() * 8;
        let win = 1 << nbits;
        let hwin = win / 2;
        let mask = win - 1;
        // Strip the low bits of `expected` and substitute `truncated`, then
        // shift by a full window if the candidate landed outside it.
        let candidate = (expected & !mask) | truncated;
        if expected.checked_sub(hwin).map_or(false, |x| candidate <= x) {
            candidate + win
        } else if candidate > expected + hwin && candidate > win {
            candidate - win
        } else {
            candidate
        }
    }
}

/// Compose a Version Negotiation packet advertising `versions`
///
/// One randomly generated reserved version is appended so peers can't
/// ossify on the version list.
pub(crate) fn version_negotiation(
    dst_cid: &ConnectionId,
    src_cid: &ConnectionId,
    versions: &[u32],
) -> Vec<u8> {
    let mut supported_versions = versions.to_vec();
    supported_versions.push(reserved_version());
    let mut buf = Vec::new();
    Header::VersionNegotiate {
        random: (rand::rng().next_u32() as u8) & !LONG_HEADER_FORM,
        dst_cid: *dst_cid,
        src_cid: *src_cid,
        supported_versions,
    }
    .encode(&mut buf);
    buf
}

/// A version from the reserved 0x?a?a?a?a pattern
fn reserved_version() -> u32 {
    rand::rng().next_u32() & 0xf0f0_f0f0 | 0x0a0a_0a0a
}

pub(crate) fn is_reserved_version(version: u32) -> bool {
    version & 0x0f0f_0f0f == 0x0a0a_0a0a
}

/// Long packet types with uniform header structure
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum LongType {
    ZeroRtt = 0x1,
    Handshake = 0x2,
}

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub(crate) enum PacketDecodeError {
    #[error("unsupported version {version:x}")]
    UnsupportedVersion {
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        version: u32,
    },
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),
}

impl From<coding::UnexpectedEnd> for PacketDecodeError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        Self::InvalidHeader("unexpected end of packet")
    }
}

pub(crate) const LONG_HEADER_FORM: u8 = 0x80;
pub(crate) const FIXED_BIT: u8 = 0x40;
pub(crate) const SPIN_BIT: u8 = 0x20;
const SHORT_RESERVED_BITS: u8 = 0x18;
const LONG_RESERVED_BITS: u8 = 0x0c;
pub(crate) const KEY_PHASE_BIT: u8 = 0x04;
const RETRY_TAG_SIZE: usize = 16;

/// Packet number space identifiers
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum SpaceId {
    /// Unprotected packets, used to bootstrap the handshake
    Initial = 0,
    /// Packets protected with keys derived from the TLS handshake secrets
    Handshake = 1,
    /// Application data space, 1-RTT packets
    Data = 2,
}

impl SpaceId {
    pub(crate) fn iter() -> impl Iterator<Item = Self> {
        [Self::Initial, Self::Handshake, Self::Data].iter().copied()
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::Initial => "Initial",
            Self::Handshake => "Handshake",
            Self::Data => "1-RTT",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use std::io;

    fn check_pn(typed: PacketNumber, encoded: &[u8]) {
        let mut buf = Vec::new();
        typed.encode(&mut buf);
        assert_eq!(&buf[..], encoded);
        let decoded = PacketNumber::decode(typed.len(), &mut io::Cursor::new(&buf)).unwrap();
        assert_eq!(typed, decoded);
    }

    #[test]
    fn roundtrip_packet_numbers() {
        check_pn(PacketNumber::U8(0x7f), &hex!("7f"));
        check_pn(PacketNumber::U16(0x80), &hex!("0080"));
        check_pn(PacketNumber::U16(0x3fff), &hex!("3fff"));
        check_pn(PacketNumber::U32(0x0000_4000), &hex!("00004000"));
        check_pn(PacketNumber::U32(0xffff_ffff), &hex!("ffffffff"));
    }

    #[test]
    fn pn_encode() {
        check_pn(PacketNumber::new(0x10, 0), &hex!("10"));
        check_pn(PacketNumber::new(0x100, 0), &hex!("0100"));
        check_pn(PacketNumber::new(0x10000, 0), &hex!("010000"));
    }

    #[test]
    fn pn_expand_roundtrip() {
        for expected in 0..1024 {
            for actual in expected..1024 {
                assert_eq!(actual, PacketNumber::new(actual, expected).expand(expected));
            }
        }
    }

    #[test]
    fn pn_expand_window() {
        // For any truncated encoding, the expansion is the unique value in
        // (expected - 2^(8len-1), expected + 2^(8len-1)] matching the low bits
        for &(expected, truncated, len, full) in &[
            (0xa82f30ea_u64, 0x9b32, 2_usize, 0xa82f9b32_u64), // RFC 9000 A.3
            (0xabe8b3, 0xac5c02, 3, 0xac5c02),
            (255, 0, 1, 256),
            (0, 0xff, 1, 0xff),
        ] {
            let pn = match len {
                1 => PacketNumber::U8(truncated as u8),
                2 => PacketNumber::U16(truncated as u16),
                3 => PacketNumber::U24(truncated as u32),
                4 => PacketNumber::U32(truncated as u32),
                _ => unreachable!(),
            };
            let got = pn.expand(expected);
            assert_eq!(got, full);
            let hwin = 1u64 << (8 * len - 1);
            assert!(got <= expected + hwin);
            if expected >= hwin {
                assert!(got > expected - hwin || got == full);
            }
            let mask = (1u64 << (8 * len)) - 1;
            assert_eq!(got & mask, truncated & mask);
        }
    }

    #[test]
    fn version_negotiation_roundtrip() {
        let dst_cid = ConnectionId::new(&hex!("0102030405060708"));
        let src_cid = ConnectionId::new(&hex!("deadbeefcafe1337"));
        let buf = version_negotiation(&dst_cid, &src_cid, &[1001, 1003]);
        assert_eq!(buf[0] & LONG_HEADER_FORM, LONG_HEADER_FORM);

        let (decode, rest) = PartialDecode::new(buf.as_slice().into(), 8).unwrap();
        assert!(rest.is_none());
        let packet = decode.finish(None).unwrap();
        match packet.header {
            Header::VersionNegotiate {
                dst_cid: d,
                src_cid: s,
                supported_versions,
                ..
            } => {
                assert_eq!(d, dst_cid);
                assert_eq!(s, src_cid);
                assert_eq!(supported_versions.len(), 3);
                assert!(supported_versions.contains(&1001));
                assert!(supported_versions.contains(&1003));
                let reserved: Vec<_> = supported_versions
                    .iter()
                    .filter(|&&v| is_reserved_version(v))
                    .collect();
                assert_eq!(reserved.len(), 1);
            }
            h => panic!("unexpected header {h:?}"),
        }
    }

    #[test]
    fn initial_header_protection_roundtrip() {
        use crate::crypto::key_schedule::initial_keys;
        use crate::Side;

        let dcid = ConnectionId::new(&hex!("8394c8f03e515708"));
        let client = initial_keys(&dcid, Side::Client);
        let server = initial_keys(&dcid, Side::Server);

        let number = PacketNumber::U16(2);
        let header = Header::Initial {
            dst_cid: dcid,
            src_cid: ConnectionId::new(&[]),
            token: Bytes::new(),
            number,
        };
        let mut buf = Vec::new();
        let encode = header.encode(&mut buf);
        let header_len = buf.len();
        buf.resize(header_len + 32, 0); // payload
        buf[header_len] = 0x01; // PING so the payload isn't empty
        buf.resize(buf.len() + client.local.packet.tag_len(), 0);
        encode.finish(
            &mut buf,
            &client.local.header,
            Some((2, &client.local.packet)),
        );

        let (decode, rest) = PartialDecode::new(buf.as_slice().into(), 0).unwrap();
        assert!(rest.is_none());
        assert!(decode.is_initial());
        let mut packet = decode.finish(Some(&server.remote.header)).unwrap();
        assert_eq!(packet.header.number(), Some(number));
        server
            .remote
            .packet
            .decrypt(2, &packet.header_data, &mut packet.payload)
            .unwrap();
        assert_eq!(packet.payload[0], 0x01);
        assert!(packet.payload[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn coalesced_packets_split() {
        let dcid = ConnectionId::new(&hex!("8394c8f03e515708"));
        let keys = crate::crypto::key_schedule::initial_keys(&dcid, crate::Side::Client);

        let number = PacketNumber::U8(0);
        let header = Header::Initial {
            dst_cid: dcid,
            src_cid: ConnectionId::new(&[]),
            token: Bytes::new(),
            number,
        };
        let mut buf = Vec::new();
        let encode = header.encode(&mut buf);
        let header_len = buf.len();
        buf.resize(header_len + 24, 0);
        buf[header_len] = 0x01;
        buf.resize(buf.len() + keys.local.packet.tag_len(), 0);
        encode.finish(&mut buf, &keys.local.header, Some((0, &keys.local.packet)));

        // Tack a second (garbage) packet onto the datagram
        let first_len = buf.len();
        buf.extend_from_slice(&[0x40, 0xaa, 0xbb]);
        let (decode, rest) = PartialDecode::new(buf.as_slice().into(), 0).unwrap();
        assert_eq!(decode.len(), first_len);
        assert_eq!(rest.unwrap().len(), 3);
    }
}
