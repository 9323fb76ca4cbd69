//! Packet protection primitives
//!
//! Each direction at each encryption level owns an AEAD key, a 12-byte IV,
//! and a header protection key. The TLS machinery that negotiates secrets
//! lives behind [`setup::TlsProvider`]; everything here is pure
//! transformation of packet bytes.

use std::fmt;

use bytes::BytesMut;
use ring::aead;
use thiserror::Error;

use crate::packet::LONG_HEADER_FORM;

pub(crate) mod key_schedule;
pub mod setup;

/// A pseudo random key derivation failed or a payload failed to authenticate
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("decryption error")]
pub struct CryptoError;

impl From<ring::error::Unspecified> for CryptoError {
    fn from(_: ring::error::Unspecified) -> Self {
        Self
    }
}

/// Negotiated AEAD algorithms
///
/// The Initial level always uses AES-128-GCM; Handshake and 1-RTT use
/// whichever suite the TLS handshake selected.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Suite {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl Suite {
    pub(crate) fn aead(self) -> &'static aead::Algorithm {
        match self {
            Self::Aes128Gcm => &aead::AES_128_GCM,
            Self::Aes256Gcm => &aead::AES_256_GCM,
            Self::ChaCha20Poly1305 => &aead::CHACHA20_POLY1305,
        }
    }

    pub(crate) fn header_protection(self) -> &'static aead::quic::Algorithm {
        match self {
            Self::Aes128Gcm => &aead::quic::AES_128,
            Self::Aes256Gcm => &aead::quic::AES_256,
            Self::ChaCha20Poly1305 => &aead::quic::CHACHA20,
        }
    }

    pub(crate) fn hkdf(self) -> ring::hkdf::Algorithm {
        match self {
            // TLS_AES_256_GCM_SHA384 is the only suite hashed with SHA-384
            Self::Aes256Gcm => ring::hkdf::HKDF_SHA384,
            _ => ring::hkdf::HKDF_SHA256,
        }
    }

    pub(crate) fn key_len(self) -> usize {
        self.aead().key_len()
    }
}

/// Keys used to protect packet payloads in one direction
pub struct PacketKey {
    key: aead::LessSafeKey,
    iv: [u8; 12],
}

impl PacketKey {
    pub(crate) fn new(suite: Suite, key: &[u8], iv: [u8; 12]) -> Self {
        Self {
            key: aead::LessSafeKey::new(
                aead::UnboundKey::new(suite.aead(), key).expect("key length mismatch"),
            ),
            iv,
        }
    }

    /// The length of the AEAD tag appended to packets on encryption
    pub(crate) fn tag_len(&self) -> usize {
        self.key.algorithm().tag_len()
    }

    /// Seal the payload of a complete packet in place
    ///
    /// `buf` holds the entire packet with `tag_len` zero bytes reserved at
    /// the end; the header bytes through the packet number are the
    /// associated data.
    pub(crate) fn encrypt(&self, packet: u64, buf: &mut [u8], header_len: usize) {
        let (header, payload) = buf.split_at_mut(header_len);
        let tag_start = payload.len() - self.tag_len();
        let (plaintext, tag_space) = payload.split_at_mut(tag_start);
        let tag = self
            .key
            .seal_in_place_separate_tag(self.nonce(packet), aead::Aad::from(&*header), plaintext)
            .unwrap();
        tag_space.copy_from_slice(tag.as_ref());
    }

    /// Open a packet payload in place, truncating the tag on success
    pub(crate) fn decrypt(
        &self,
        packet: u64,
        header: &[u8],
        payload: &mut BytesMut,
    ) -> Result<(), CryptoError> {
        if payload.len() < self.tag_len() {
            return Err(CryptoError);
        }
        let plain_len = self
            .key
            .open_in_place(self.nonce(packet), aead::Aad::from(header), payload.as_mut())?
            .len();
        payload.truncate(plain_len);
        Ok(())
    }

    fn nonce(&self, packet: u64) -> aead::Nonce {
        let mut nonce = self.iv;
        for (b, x) in nonce[4..].iter_mut().zip(packet.to_be_bytes()) {
            *b ^= x;
        }
        aead::Nonce::assume_unique_for_key(nonce)
    }
}

impl fmt::Debug for PacketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketKey").finish_non_exhaustive()
    }
}

/// Key used to mask the low bits of the first byte and the packet number
pub struct HeaderKey(aead::quic::HeaderProtectionKey);

impl HeaderKey {
    pub(crate) fn new(suite: Suite, key: &[u8]) -> Self {
        Self(
            aead::quic::HeaderProtectionKey::new(suite.header_protection(), key)
                .expect("key length mismatch"),
        )
    }

    pub(crate) fn sample_size(&self) -> usize {
        self.0.algorithm().sample_len()
    }

    pub(crate) fn decrypt(&self, pn_offset: usize, packet: &mut [u8]) {
        let (header, sample) = packet.split_at_mut(pn_offset + 4);
        let mask = self.0.new_mask(&sample[0..self.sample_size()]).unwrap();
        if header[0] & LONG_HEADER_FORM == LONG_HEADER_FORM {
            // Long header: 4 bits masked
            header[0] ^= mask[0] & 0x0f;
        } else {
            // Short header: 5 bits masked
            header[0] ^= mask[0] & 0x1f;
        }
        let pn_length = 1 + (header[0] & 0x03) as usize;
        for (out, inp) in header[pn_offset..pn_offset + pn_length]
            .iter_mut()
            .zip(&mask[1..])
        {
            *out ^= inp;
        }
    }

    pub(crate) fn encrypt(&self, pn_offset: usize, packet: &mut [u8]) {
        let (header, sample) = packet.split_at_mut(pn_offset + 4);
        let mask = self.0.new_mask(&sample[0..self.sample_size()]).unwrap();
        let pn_length = 1 + (header[0] & 0x03) as usize;
        if header[0] & LONG_HEADER_FORM == LONG_HEADER_FORM {
            header[0] ^= mask[0] & 0x0f;
        } else {
            header[0] ^= mask[0] & 0x1f;
        }
        for (out, inp) in header[pn_offset..pn_offset + pn_length]
            .iter_mut()
            .zip(&mask[1..])
        {
            *out ^= inp;
        }
    }
}

impl fmt::Debug for HeaderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderKey").finish_non_exhaustive()
    }
}

/// Packet protection and header protection keys for one direction
#[derive(Debug)]
pub struct DirectionalKeys {
    pub(crate) packet: PacketKey,
    pub(crate) header: HeaderKey,
}

impl DirectionalKeys {
    /// Derive all keys for one direction from a traffic secret
    pub(crate) fn new(suite: Suite, secret: &[u8]) -> Self {
        let (key, iv, hp) = key_schedule::packet_keys(suite, secret);
        Self {
            packet: PacketKey::new(suite, &key, iv),
            header: HeaderKey::new(suite, &hp),
        }
    }
}

/// Both directions' keys for one encryption level
#[derive(Debug)]
pub struct Keys {
    /// Seals outgoing packets
    pub(crate) local: DirectionalKeys,
    /// Opens incoming packets
    pub(crate) remote: DirectionalKeys,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_xor() {
        let key = PacketKey::new(
            Suite::Aes128Gcm,
            &[0; 16],
            [0xfa, 0x04, 0x4b, 0x2f, 0x42, 0xa3, 0xfd, 0x3b, 0x46, 0xfb, 0x25, 0x5c],
        );
        // Nonce for pn=0 is the IV itself; higher packet numbers flip the
        // trailing bytes
        let n0 = key.nonce(0);
        assert_eq!(n0.as_ref()[..], key.iv[..]);
        let n1 = key.nonce(1);
        assert_eq!(n1.as_ref()[11], key.iv[11] ^ 1);
        assert_eq!(n1.as_ref()[..11], key.iv[..11]);
    }

    #[test]
    fn seal_open_roundtrip() {
        let secret = [0x17; 32];
        let keys = DirectionalKeys::new(Suite::ChaCha20Poly1305, &secret);
        let header = b"\x40header";
        let mut buf = Vec::new();
        buf.extend_from_slice(header);
        buf.extend_from_slice(b"the payload");
        buf.resize(buf.len() + keys.packet.tag_len(), 0);
        keys.packet.encrypt(7, &mut buf, header.len());

        let mut payload = BytesMut::from(&buf[header.len()..]);
        keys.packet.decrypt(7, header, &mut payload).unwrap();
        assert_eq!(&payload[..], b"the payload");

        // Tampering is detected
        let mut payload = BytesMut::from(&buf[header.len()..]);
        payload[0] ^= 1;
        assert!(keys.packet.decrypt(7, header, &mut payload).is_err());

        // Wrong packet number changes the nonce
        let mut payload = BytesMut::from(&buf[header.len()..]);
        assert!(keys.packet.decrypt(8, header, &mut payload).is_err());
    }
}
