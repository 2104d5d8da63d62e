//! Connection identity and the one-shot handshake that establishes it.
//!
//! Right after a session comes up, the accepting side generates a fresh
//! [`ClientId`], opens a dedicated sub-stream, writes the 16 raw id bytes and
//! shuts its write half down. The initiating side accepts that sub-stream and
//! reads exactly 16 bytes. There is no length prefix: the sub-stream boundary
//! delimits the message.

use std::{fmt, str::FromStr};

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tonic::metadata::MetadataMap;
use uuid::Uuid;

use crate::transport::TransportSession;

/// Call metadata key carrying the caller's identity in canonical text form.
pub const METADATA_CLIENT_ID_KEY: &str = "brpc-metadata-client-id";

pub const CLIENT_ID_LEN: usize = 16;

/// Identity assigned to one connection for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(b: [u8; CLIENT_ID_LEN]) -> Self {
        Self(Uuid::from_bytes(b))
    }

    pub fn as_bytes(&self) -> &[u8; CLIENT_ID_LEN] {
        self.0.as_bytes()
    }

    /// Reads the identity a peer attached to an inbound call.
    pub fn from_metadata(md: &MetadataMap) -> Result<Self, MetadataError> {
        let v = md
            .get(METADATA_CLIENT_ID_KEY)
            .ok_or(MetadataError::Missing)?;
        let s = v.to_str().map_err(|_| MetadataError::Invalid)?;
        s.trim().parse().map_err(|_| MetadataError::Invalid)
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for ClientId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("client id not provided")]
    Missing,
    #[error("invalid client id")]
    Invalid,
}

impl From<MetadataError> for tonic::Status {
    fn from(err: MetadataError) -> Self {
        tonic::Status::invalid_argument(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("opening identity stream: {0:#}")]
    OpenStream(anyhow::Error),
    #[error("accepting identity stream: {0:#}")]
    AcceptStream(anyhow::Error),
    #[error("writing identity: {0}")]
    Write(std::io::Error),
    #[error("reading identity: {0}")]
    Read(std::io::Error),
    #[error("read {read} identity bytes, expected {expected}")]
    ShortIdentity { read: usize, expected: usize },
}

/// Accepting side: generate an identity and hand it to the peer.
pub async fn send_client_id(sess: &dyn TransportSession) -> Result<ClientId, NegotiationError> {
    let id = ClientId::new();
    let mut st = sess
        .open_stream()
        .await
        .map_err(NegotiationError::OpenStream)?;
    st.write_all(id.as_bytes())
        .await
        .map_err(NegotiationError::Write)?;
    st.shutdown().await.map_err(NegotiationError::Write)?;
    Ok(id)
}

/// Initiating side: take the identity the peer generated for us.
pub async fn recv_client_id(sess: &dyn TransportSession) -> Result<ClientId, NegotiationError> {
    let mut st = sess
        .accept_stream()
        .await
        .map_err(NegotiationError::AcceptStream)?;

    let mut buf = [0u8; CLIENT_ID_LEN];
    let mut read = 0;
    // The sender closes right after writing, so EOF may arrive together with
    // the final byte; only an EOF before all 16 bytes is an error.
    while read < CLIENT_ID_LEN {
        let n = st
            .read(&mut buf[read..])
            .await
            .map_err(NegotiationError::Read)?;
        if n == 0 {
            return Err(NegotiationError::ShortIdentity {
                read,
                expected: CLIENT_ID_LEN,
            });
        }
        read += n;
    }
    Ok(ClientId::from_bytes(buf))
}
