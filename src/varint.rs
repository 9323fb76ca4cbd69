use std::{convert::TryInto, fmt};

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::coding::{self, Codec, UnexpectedEnd};

/// An integer less than 2^62
///
/// Values of this type are suitable for encoding as a QUIC variable-length
/// integer. The two high bits of the first byte carry the encoded width
/// (1, 2, 4, or 8 bytes); the remaining bits form a big-endian unsigned
/// integer. The parser accepts all four widths for any value; the writer
/// emits the shortest one.
#[derive(Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VarInt(pub(crate) u64);

impl VarInt {
    /// The largest representable value
    pub const MAX: Self = Self((1 << 62) - 1);

    /// Construct a `VarInt` infallibly
    pub const fn from_u32(x: u32) -> Self {
        Self(x as u64)
    }

    /// Succeeds iff `x` < 2^62
    pub fn from_u64(x: u64) -> Result<Self, VarIntBoundsExceeded> {
        if x < 1 << 62 {
            Ok(Self(x))
        } else {
            Err(VarIntBoundsExceeded)
        }
    }

    /// Create a VarInt without ensuring it's in range
    ///
    /// Only use when `x` is statically known to fit in 62 bits.
    pub const fn from_u64_unchecked(x: u64) -> Self {
        Self(x)
    }

    /// Extract the integer value
    pub const fn into_inner(self) -> u64 {
        self.0
    }

    /// Number of bytes this value encodes to
    pub const fn size(self) -> usize {
        let x = self.0;
        if x < 2u64.pow(6) {
            1
        } else if x < 2u64.pow(14) {
            2
        } else if x < 2u64.pow(30) {
            4
        } else if x < 2u64.pow(62) {
            8
        } else {
            unreachable!()
        }
    }
}

impl From<VarInt> for u64 {
    fn from(x: VarInt) -> Self {
        x.0
    }
}

impl From<u8> for VarInt {
    fn from(x: u8) -> Self {
        Self(x.into())
    }
}

impl From<u16> for VarInt {
    fn from(x: u16) -> Self {
        Self(x.into())
    }
}

impl From<u32> for VarInt {
    fn from(x: u32) -> Self {
        Self(x.into())
    }
}

impl TryFrom<u64> for VarInt {
    type Error = VarIntBoundsExceeded;
    fn try_from(x: u64) -> Result<Self, Self::Error> {
        Self::from_u64(x)
    }
}

impl TryFrom<usize> for VarInt {
    type Error = VarIntBoundsExceeded;
    fn try_from(x: usize) -> Result<Self, Self::Error> {
        Self::try_from(x as u64)
    }
}

impl fmt::Debug for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Error returned when constructing a `VarInt` from a value >= 2^62
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("value too large for varint encoding")]
pub struct VarIntBoundsExceeded;

impl Codec for VarInt {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        if !buf.has_remaining() {
            return Err(UnexpectedEnd);
        }
        let mut bytes = [0; 8];
        bytes[0] = buf.chunk()[0];
        buf.advance(1);

        let x = match bytes[0] >> 6 {
            0b00 => u64::from(bytes[0]),
            0b01 => {
                if buf.remaining() < 1 {
                    return Err(UnexpectedEnd);
                }
                buf.copy_to_slice(&mut bytes[1..2]);
                u64::from(u16::from_be_bytes(bytes[..2].try_into().unwrap()) & 0x3fff)
            }
            0b10 => {
                if buf.remaining() < 3 {
                    return Err(UnexpectedEnd);
                }
                buf.copy_to_slice(&mut bytes[1..4]);
                u64::from(u32::from_be_bytes(bytes[..4].try_into().unwrap()) & 0x3fff_ffff)
            }
            0b11 => {
                if buf.remaining() < 7 {
                    return Err(UnexpectedEnd);
                }
                buf.copy_to_slice(&mut bytes[1..8]);
                u64::from_be_bytes(bytes) & 0x3fff_ffff_ffff_ffff
            }
            _ => unreachable!(),
        };
        Ok(Self(x))
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        let x = self.0;
        if x < 2u64.pow(6) {
            buf.put_u8(x as u8);
        } else if x < 2u64.pow(14) {
            buf.put_u16(0b01 << 14 | x as u16);
        } else if x < 2u64.pow(30) {
            buf.put_u32(0b10 << 30 | x as u32);
        } else if x < 2u64.pow(62) {
            buf.put_u64(0b11 << 62 | x);
        } else {
            unreachable!("malformed VarInt");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use std::io;

    fn decode(bytes: &[u8]) -> coding::Result<VarInt> {
        VarInt::decode(&mut io::Cursor::new(bytes))
    }

    #[test]
    fn rfc_vectors() {
        // RFC 9000 Appendix A.1
        assert_eq!(
            decode(&hex!("c2197c5eff14e88c")).unwrap().0,
            151_288_809_941_952_652
        );
        assert_eq!(decode(&hex!("9d7f3e7d")).unwrap().0, 494_878_333);
        assert_eq!(decode(&hex!("7bbd")).unwrap().0, 15_293);
        assert_eq!(decode(&hex!("25")).unwrap().0, 37);
        // The same value in a wider, non-minimal encoding
        assert_eq!(decode(&hex!("4025")).unwrap().0, 37);
    }

    #[test]
    fn sizes() {
        assert_eq!(VarInt(0).size(), 1);
        assert_eq!(VarInt(63).size(), 1);
        assert_eq!(VarInt(64).size(), 2);
        assert_eq!(VarInt(16383).size(), 2);
        assert_eq!(VarInt(16384).size(), 4);
        assert_eq!(VarInt(1_073_741_823).size(), 4);
        assert_eq!(VarInt(1_073_741_824).size(), 8);
        assert_eq!(VarInt::MAX.size(), 8);
    }

    #[test]
    fn bounds() {
        assert_eq!(VarInt::from_u64(1 << 62), Err(VarIntBoundsExceeded));
        assert_eq!(VarInt::from_u64((1 << 62) - 1), Ok(VarInt::MAX));
    }

    #[test]
    fn roundtrip() {
        for &x in &[
            0,
            1,
            63,
            64,
            16383,
            16384,
            1_073_741_823,
            1_073_741_824,
            (1 << 62) - 1,
        ] {
            let mut buf = Vec::new();
            VarInt(x).encode(&mut buf);
            assert_eq!(buf.len(), VarInt(x).size());
            assert_eq!(decode(&buf).unwrap().0, x);
        }
    }

    #[test]
    fn truncated() {
        assert_eq!(decode(&[]), Err(UnexpectedEnd));
        assert_eq!(decode(&hex!("40")), Err(UnexpectedEnd));
        assert_eq!(decode(&hex!("80ff00")), Err(UnexpectedEnd));
        assert_eq!(decode(&hex!("c2197c5eff14e8")), Err(UnexpectedEnd));
    }
}
