use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use tokio::sync::watch;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Application close codes carried by a session close.
///
/// QUIC sends them to the peer as the application error code; yamux has no
/// such field, so the TCP adapter only logs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0,
    InternalError = 1,
    NegotiationFailed = 2,
    CallbackFailed = 3,
    ServerShutdown = 4,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::NoError => "no_error",
            ErrorCode::InternalError => "internal_error",
            ErrorCode::NegotiationFailed => "negotiation_failed",
            ErrorCode::CallbackFailed => "callback_failed",
            ErrorCode::ServerShutdown => "server_shutdown",
        };
        write!(f, "{s}({})", self.as_u32())
    }
}

/// Errors raised by the transport adapters themselves (as opposed to the
/// underlying quinn / yamux / io errors they forward).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("tunnel: session closed")]
    SessionClosed,
    #[error("tunnel: endpoint closed")]
    EndpointClosed,
}

#[derive(Debug, Clone, Default)]
pub struct QuicListenOptions {
    pub cert_file: String,
    pub key_file: String,
    pub next_protos: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct QuicDialOptions {
    pub server_name: String,
    /// PEM bundle of trusted roots. Required unless `insecure_skip_verify`.
    pub ca_file: String,
    pub insecure_skip_verify: bool,
    pub next_protos: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct TransportListenOptions {
    pub quic: QuicListenOptions,
}

#[derive(Debug, Clone, Default)]
pub struct TransportDialOptions {
    pub quic: QuicDialOptions,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn listen(
        &self,
        addr: &str,
        opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>>;
    async fn dial(
        &self,
        addr: &str,
        opts: TransportDialOptions,
    ) -> anyhow::Result<Arc<dyn TransportSession>>;
}

#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn accept(&self) -> anyhow::Result<Arc<dyn TransportSession>>;
    fn local_addr(&self) -> Option<SocketAddr>;
    async fn close(&self) -> anyhow::Result<()>;
}

/// A live connection that carries independent sub-streams.
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream>;
    async fn accept_stream(&self) -> anyhow::Result<BoxedStream>;

    /// Flips to `true` once the session is gone, whichever side closed it.
    fn done(&self) -> watch::Receiver<bool>;

    async fn close(&self, code: ErrorCode, reason: &str);
    fn remote_addr(&self) -> Option<SocketAddr>;
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Waits until `session` reports it is gone.
pub async fn wait_done(session: &dyn TransportSession) {
    let mut done = session.done();
    // A dropped sender means the driver task is gone, which is also "done".
    let _ = done.wait_for(|d| *d).await;
}

/// Resolves once `rx` holds `true` or its sender is dropped.
pub async fn signalled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|v| *v).await;
}

pub fn parse_transport(name: &str) -> anyhow::Result<String> {
    let mut n = name.trim().to_ascii_lowercase();
    if n.is_empty() {
        n = "tcp".into();
    }
    match n.as_str() {
        "tcp" | "quic" => Ok(n),
        _ => anyhow::bail!("tunnel: unknown transport {name:?} (expected tcp|quic)"),
    }
}

pub fn default_alpn(next: &[Vec<u8>]) -> Vec<Vec<u8>> {
    if !next.is_empty() {
        return next.to_vec();
    }
    vec![b"brpc".to_vec()]
}

pub mod quic;
pub mod tcp;

pub fn transport_by_name(name: &str) -> anyhow::Result<Arc<dyn Transport>> {
    if parse_transport(name)? == "quic" {
        Ok(Arc::new(quic::QuicTransport::new()))
    } else {
        Ok(Arc::new(tcp::TcpTransport::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_transport_defaults_to_tcp() {
        assert_eq!(parse_transport("").unwrap(), "tcp");
        assert_eq!(parse_transport(" QUIC ").unwrap(), "quic");
        assert!(parse_transport("udp").is_err());
    }

    #[test]
    fn error_code_display_includes_value() {
        assert_eq!(ErrorCode::ServerShutdown.to_string(), "server_shutdown(4)");
        assert_eq!(ErrorCode::NoError.as_u32(), 0);
    }
}
