//! Endpoint configuration

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::crypto::setup::TlsProvider;
use crate::streams::DEFAULT_MAX_INCOMING_STREAMS;
use crate::{MAX_CID_SIZE, VERSION};

/// A configuration field was set to an unusable value
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ConfigError {
    /// Connection IDs are limited to 20 bytes
    #[error("connection ID length out of bounds")]
    CidLengthOutOfBounds,
    /// At least one version must be offered
    #[error("no versions configured")]
    NoVersions,
}

/// Transport-level knobs for an endpoint
#[derive(Debug, Clone)]
pub struct QuicConfig {
    /// QUIC versions this endpoint supports, in preference order
    pub versions: Vec<u32>,
    /// Length of locally-issued connection IDs
    pub connection_id_length: usize,
    /// Secret from which stateless reset tokens are derived
    ///
    /// Endpoints that share this key across restarts can reset orphaned
    /// peers; when absent a random key is drawn at bind time.
    pub stateless_reset_key: Option<[u8; 32]>,
    /// Close the connection after this long without receiving an
    /// ack-eliciting packet
    pub idle_timeout: Duration,
    /// Bidirectional streams the peer may keep open
    pub max_incoming_streams: u64,
    /// Unidirectional streams the peer may keep open
    pub max_incoming_uni_streams: u64,
    /// Send PINGs to keep the connection from idling out
    pub keep_alive: bool,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            versions: vec![VERSION],
            connection_id_length: 8,
            stateless_reset_key: None,
            idle_timeout: Duration::from_secs(30),
            max_incoming_streams: DEFAULT_MAX_INCOMING_STREAMS,
            max_incoming_uni_streams: DEFAULT_MAX_INCOMING_STREAMS,
            keep_alive: false,
        }
    }
}

impl QuicConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.connection_id_length > MAX_CID_SIZE {
            return Err(ConfigError::CidLengthOutOfBounds);
        }
        if self.versions.is_empty() {
            return Err(ConfigError::NoVersions);
        }
        Ok(())
    }
}

/// TLS 1.3 configuration handed to the handshake provider
///
/// The transport itself never parses certificates; these fields are
/// carried verbatim to the [`TlsProvider`] driving the handshake.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// DER-encoded certificate chain presented to peers
    pub certificates: Vec<Vec<u8>>,
    /// DER-encoded private key matching the leaf certificate
    pub private_key: Option<Vec<u8>>,
    /// DER-encoded trust anchors for verifying the peer
    pub root_certificates: Vec<Vec<u8>>,
    /// ALPN protocol identifiers, most preferred first
    pub next_protos: Vec<Vec<u8>>,
    /// Whether to offer and accept session resumption
    pub enable_resumption: bool,
    /// The handshake implementation
    pub provider: Arc<dyn TlsProvider>,
}

impl TlsConfig {
    /// Configuration delegating everything to `provider`
    pub fn new(provider: Arc<dyn TlsProvider>) -> Self {
        Self {
            certificates: Vec::new(),
            private_key: None,
            root_certificates: Vec::new(),
            next_protos: Vec::new(),
            enable_resumption: false,
            provider,
        }
    }

    /// Set the ALPN protocols offered during the handshake
    pub fn with_alpn(mut self, protos: Vec<Vec<u8>>) -> Self {
        self.next_protos = protos;
        self
    }
}
