use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tonic::transport::{server::Connected, Channel, Endpoint, Uri};

use crate::identity::ClientId;
use crate::transport::BoxedStream;

/// Authority used for channels that never touch DNS; the connector ignores it.
const TUNNEL_URI: &str = "http://brpc.tunnel";

/// Per-connection info tonic attaches to every request served over a
/// [`TunnelStream`]. Read it with `request.extensions().get::<TunnelInfo>()`.
#[derive(Debug, Clone, Default)]
pub struct TunnelInfo {
    pub client_id: Option<ClientId>,
    pub remote_addr: Option<SocketAddr>,
}

/// A sub-stream handed to the RPC server as one inbound connection.
pub struct TunnelStream {
    inner: BoxedStream,
    info: TunnelInfo,
}

impl TunnelStream {
    pub fn new(inner: BoxedStream, info: TunnelInfo) -> Self {
        Self { inner, info }
    }

    pub fn info(&self) -> &TunnelInfo {
        &self.info
    }

    pub fn into_inner(self) -> BoxedStream {
        self.inner
    }
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelStream")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Connected for TunnelStream {
    type ConnectInfo = TunnelInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.info.clone()
    }
}

/// Builds an RPC client channel that speaks over exactly one sub-stream.
///
/// The channel connects lazily, so building it never blocks on the peer. The
/// sub-stream can be handed out once; if the channel ever needs to reconnect
/// the connector reports `NotConnected` and calls fail as unavailable.
pub fn channel_over(stream: BoxedStream) -> Channel {
    let slot = Arc::new(Mutex::new(Some(stream)));
    Endpoint::from_static(TUNNEL_URI).connect_with_connector_lazy(tower::service_fn(
        move |_: Uri| {
            let slot = slot.clone();
            async move {
                let st = slot
                    .lock()
                    .map_err(|_| io::Error::other("tunnel: stream slot poisoned"))?
                    .take()
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::NotConnected, "tunnel: stream already used")
                    })?;
                Ok::<_, io::Error>(TokioIo::new(st))
            }
        },
    ))
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn tunnel_stream_passes_bytes_through() {
        let (a, b) = tokio::io::duplex(1024);
        let id = ClientId::new();
        let mut st = TunnelStream::new(
            Box::new(a),
            TunnelInfo {
                client_id: Some(id),
                remote_addr: None,
            },
        );
        let mut peer = b;

        st.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        peer.write_all(b"back").await.unwrap();
        let mut buf = [0u8; 4];
        st.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"back");

        assert_eq!(st.connect_info().client_id, Some(id));
    }
}
