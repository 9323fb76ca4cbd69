//! Key derivation for all three encryption levels
//!
//! Initial keys are derived from the client's destination connection ID and
//! the version-specific salt; Handshake and 1-RTT keys from the traffic
//! secrets the TLS provider hands over. All derivations go through
//! HKDF-Expand-Label with the labels `"quic key"`, `"quic iv"`, and
//! `"quic hp"`.

use ring::hkdf;

use crate::{packet::ConnectionId, Side};

use super::{DirectionalKeys, Keys, Suite};

/// Salt for deriving Initial secrets under QUIC version 1 (RFC 9001)
const INITIAL_SALT: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

/// Derive both directions' Initial keys from the client's first DCID
pub(crate) fn initial_keys(dst_cid: &ConnectionId, side: Side) -> Keys {
    let initial_secret = hkdf::Salt::new(hkdf::HKDF_SHA256, &INITIAL_SALT).extract(dst_cid);

    let client_secret = expand_label(&initial_secret, b"client in", 32);
    let server_secret = expand_label(&initial_secret, b"server in", 32);

    let client = DirectionalKeys::new(Suite::Aes128Gcm, &client_secret);
    let server = DirectionalKeys::new(Suite::Aes128Gcm, &server_secret);
    match side {
        Side::Client => Keys {
            local: client,
            remote: server,
        },
        Side::Server => Keys {
            local: server,
            remote: client,
        },
    }
}

/// Derive the packet key, IV, and header protection key from a traffic secret
pub(crate) fn packet_keys(suite: Suite, secret: &[u8]) -> (Vec<u8>, [u8; 12], Vec<u8>) {
    let prk = hkdf::Prk::new_less_safe(suite.hkdf(), secret);
    let key = expand_label(&prk, b"quic key", suite.key_len());
    let iv_bytes = expand_label(&prk, b"quic iv", 12);
    let hp = expand_label(&prk, b"quic hp", suite.key_len());
    let mut iv = [0; 12];
    iv.copy_from_slice(&iv_bytes);
    (key, iv, hp)
}

/// HKDF-Expand-Label per RFC 8446 section 7.1, with an empty context
fn expand_label(prk: &hkdf::Prk, label: &[u8], len: usize) -> Vec<u8> {
    const PREFIX: &[u8] = b"tls13 ";
    let out_len = (len as u16).to_be_bytes();
    let label_len = [(PREFIX.len() + label.len()) as u8];
    let context_len = [0u8];
    let info = [&out_len[..], &label_len, PREFIX, label, &context_len];
    let mut out = vec![0; len];
    prk.expand(&info, OkmLen(len))
        .expect("HKDF output length out of bounds")
        .fill(&mut out)
        .expect("HKDF output length mismatch");
    out
}

struct OkmLen(usize);

impl hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    // Test vectors from RFC 9001 Appendix A
    const DCID: [u8; 8] = hex!("8394c8f03e515708");

    #[test]
    fn initial_client_material() {
        let initial_secret =
            hkdf::Salt::new(hkdf::HKDF_SHA256, &INITIAL_SALT).extract(&DCID);
        let client_secret = expand_label(&initial_secret, b"client in", 32);
        assert_eq!(
            client_secret[..],
            hex!("c00cf151ca5be075ed0ebfb5c80323c42d6b7db67881289af4008f1f6c357aea")[..]
        );
        let (key, iv, hp) = packet_keys(Suite::Aes128Gcm, &client_secret);
        assert_eq!(key[..], hex!("1f369613dd76d5467730efcbe3b1a22d")[..]);
        assert_eq!(iv[..], hex!("fa044b2f42a3fd3b46fb255c")[..]);
        assert_eq!(hp[..], hex!("9f50449e04a0e810283a1e9933adedd2")[..]);
    }

    #[test]
    fn initial_server_material() {
        let initial_secret =
            hkdf::Salt::new(hkdf::HKDF_SHA256, &INITIAL_SALT).extract(&DCID);
        let server_secret = expand_label(&initial_secret, b"server in", 32);
        assert_eq!(
            server_secret[..],
            hex!("3c199828fd139efd216c155ad844cc81fb82fa8d7446fa7d78be803acdda951b")[..]
        );
        let (key, iv, hp) = packet_keys(Suite::Aes128Gcm, &server_secret);
        assert_eq!(key[..], hex!("cf3a5331653c364c88f0f379b6067e37")[..]);
        assert_eq!(iv[..], hex!("0ac1493ca1905853b0bba03e")[..]);
        assert_eq!(hp[..], hex!("c206b8d9b9f0f37644430b490eeaa314")[..]);
    }

    #[test]
    fn directions_are_mirrored() {
        let dcid = ConnectionId::new(&DCID);
        let client = initial_keys(&dcid, Side::Client);
        let server = initial_keys(&dcid, Side::Server);

        let mut buf = b"\x40x".to_vec();
        let header_len = buf.len();
        buf.extend_from_slice(b"ping");
        buf.resize(buf.len() + client.local.packet.tag_len(), 0);
        client.local.packet.encrypt(0, &mut buf, header_len);

        let mut payload = bytes::BytesMut::from(&buf[header_len..]);
        server
            .remote
            .packet
            .decrypt(0, &buf[..header_len], &mut payload)
            .unwrap();
        assert_eq!(&payload[..], b"ping");
    }
}
