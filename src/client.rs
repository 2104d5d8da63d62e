//! Initiating side of the tunnel.
//!
//! A [`ClientConn`] calls the server over a sub-stream it opens itself, and can
//! serve the server's callbacks over the sub-streams the server opens.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::watch;
use tonic::{
    metadata::MetadataValue,
    service::{interceptor::InterceptedService, Interceptor},
    transport::{server::Router, Channel},
    Request, Status,
};
use tracing::{Instrument, Span};

use crate::identity::{recv_client_id, ClientId, NegotiationError, METADATA_CLIENT_ID_KEY};
use crate::listener::{MultiListener, SessionSource};
use crate::stream::channel_over;
use crate::transport::{
    signalled, transport_by_name, wait_done, ErrorCode, QuicDialOptions, TransportDialOptions,
    TransportSession,
};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub transport: String,
    /// Bounds the transport dial and, separately, the identity handshake.
    pub dial_timeout: Duration,
    /// How long `close()` waits for the embedded server to drain.
    pub drain_timeout: Duration,
    pub quic: QuicDialOptions,
    pub span: Span,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            transport: "tcp".to_string(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            quic: QuicDialOptions::default(),
            span: Span::none(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("brpc: dialing {addr}: {source:#}")]
    Dial { addr: String, source: anyhow::Error },
    #[error("brpc: dialing {addr}: timed out after {timeout:?}")]
    DialTimeout { addr: String, timeout: Duration },
    #[error("brpc: receiving client id: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error("brpc: receiving client id: timed out after {0:?}")]
    NegotiationTimeout(Duration),
    #[error("brpc: opening client->server rpc stream: {0:#}")]
    ForwardStream(anyhow::Error),
    #[error("brpc: serving: {0}")]
    Serve(#[from] tonic::transport::Error),
    #[error("brpc: already serving")]
    AlreadyServing,
    #[error("brpc: connection closed")]
    Closed,
}

/// Stamps every outgoing call with this connection's identity.
#[derive(Debug, Clone, Copy)]
pub struct ClientIdInterceptor {
    id: ClientId,
}

impl ClientIdInterceptor {
    pub fn new(id: ClientId) -> Self {
        Self { id }
    }
}

impl Interceptor for ClientIdInterceptor {
    fn call(&mut self, mut req: Request<()>) -> Result<Request<()>, Status> {
        let v = MetadataValue::try_from(self.id.to_string())
            .map_err(|_| Status::internal("brpc: client id is not valid metadata"))?;
        req.metadata_mut().insert(METADATA_CLIENT_ID_KEY, v);
        Ok(req)
    }
}

async fn cleared(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|s| !*s).await;
}

/// Flips `running` back to false when the embedded server exits.
struct RunningGuard<'a>(&'a watch::Sender<bool>);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

pub struct ClientConn {
    id: ClientId,
    session: Arc<dyn TransportSession>,
    channel: Channel,
    stop: watch::Sender<bool>,
    running: watch::Sender<bool>,
    served: AtomicBool,
    closing: AtomicBool,
    drain_timeout: Duration,
    span: Span,
}

impl std::fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConn")
            .field("id", &self.id)
            .field("remote", &self.session.remote_addr())
            .finish_non_exhaustive()
    }
}

impl ClientConn {
    /// Dials `addr`, receives this connection's identity and prepares the
    /// forward channel.
    pub async fn dial(addr: &str, opts: ClientOptions) -> Result<Self, ClientError> {
        let timeout = if opts.dial_timeout.is_zero() {
            DEFAULT_DIAL_TIMEOUT
        } else {
            opts.dial_timeout
        };
        let tr = transport_by_name(&opts.transport).map_err(|source| ClientError::Dial {
            addr: addr.to_string(),
            source,
        })?;
        let dial_opts = TransportDialOptions {
            quic: opts.quic.clone(),
        };

        let sess = match tokio::time::timeout(timeout, tr.dial(addr, dial_opts)).await {
            Ok(Ok(sess)) => sess,
            Ok(Err(source)) => {
                return Err(ClientError::Dial {
                    addr: addr.to_string(),
                    source,
                });
            }
            Err(_) => {
                return Err(ClientError::DialTimeout {
                    addr: addr.to_string(),
                    timeout,
                });
            }
        };
        tracing::debug!(parent: &opts.span, addr = %addr, transport = %tr.name(), "brpc: dialed");

        Self::connect(sess, ClientOptions {
            dial_timeout: timeout,
            ..opts
        })
        .await
    }

    /// Runs the handshake over an already established session. The session
    /// is closed if the handshake fails.
    pub async fn connect(
        session: Arc<dyn TransportSession>,
        opts: ClientOptions,
    ) -> Result<Self, ClientError> {
        let timeout = if opts.dial_timeout.is_zero() {
            DEFAULT_DIAL_TIMEOUT
        } else {
            opts.dial_timeout
        };
        match Self::handshake(&session, timeout).await {
            Ok((id, channel)) => {
                let (stop, _) = watch::channel(false);
                let (running, _) = watch::channel(false);
                tracing::info!(parent: &opts.span, id = %id, remote = ?session.remote_addr(), "brpc: connected");
                Ok(Self {
                    id,
                    session,
                    channel,
                    stop,
                    running,
                    served: AtomicBool::new(false),
                    closing: AtomicBool::new(false),
                    drain_timeout: opts.drain_timeout,
                    span: opts.span,
                })
            }
            Err(err) => {
                tracing::warn!(parent: &opts.span, err = %err, "brpc: handshake failed");
                session
                    .close(ErrorCode::InternalError, &err.to_string())
                    .await;
                Err(err)
            }
        }
    }

    async fn handshake(
        session: &Arc<dyn TransportSession>,
        timeout: Duration,
    ) -> Result<(ClientId, Channel), ClientError> {
        let id = tokio::time::timeout(timeout, recv_client_id(session.as_ref()))
            .await
            .map_err(|_| ClientError::NegotiationTimeout(timeout))??;
        let fwd = session
            .open_stream()
            .await
            .map_err(ClientError::ForwardStream)?;
        Ok((id, channel_over(fwd)))
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.session.remote_addr()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.session.local_addr()
    }

    /// Flips to true once the underlying session is gone.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.session.done()
    }

    /// Channel to the server that tags every call with this connection's
    /// identity. Build generated clients on top of it.
    pub fn channel(&self) -> InterceptedService<Channel, ClientIdInterceptor> {
        InterceptedService::new(self.channel.clone(), ClientIdInterceptor::new(self.id))
    }

    /// Serves the server's callbacks until [`close`](Self::close) or the
    /// session dies.
    pub async fn serve(&self, router: Router) -> Result<(), ClientError> {
        let (_never, rx) = watch::channel(false);
        self.serve_with_shutdown(router, rx).await
    }

    /// Like [`serve`](Self::serve), also stopping when `shutdown` turns true.
    pub async fn serve_with_shutdown(
        &self,
        router: Router,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ClientError> {
        if self.served.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyServing);
        }
        self.running.send_replace(true);
        let _running = RunningGuard(&self.running);
        if self.closing.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }

        let ml = Arc::new(MultiListener::with_span(self.span.clone()));
        ml.add_listener(Arc::new(SessionSource::new(
            self.session.clone(),
            Some(self.id),
        )));

        let mut stop = self.stop.subscribe();
        let session = self.session.clone();
        let stopped = async move {
            tokio::select! {
                _ = signalled(&mut stop) => {}
                _ = signalled(&mut shutdown) => {}
                _ = wait_done(session.as_ref()) => {}
            }
        };

        tracing::debug!(parent: &self.span, id = %self.id, "brpc: serving callbacks");
        let res = router
            .serve_with_incoming_shutdown(ml.incoming(), stopped)
            .instrument(self.span.clone())
            .await;
        if let Err(err) = ml.close().await {
            tracing::debug!(parent: &self.span, err = %err, "brpc: closing callback listener");
        }
        tracing::debug!(parent: &self.span, id = %self.id, "brpc: callback server stopped");
        res.map_err(ClientError::from)
    }

    /// Stops the embedded server (waiting up to the drain timeout), then
    /// closes the session. Later calls are no-ops.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.send_replace(true);

        let mut running = self.running.subscribe();
        if tokio::time::timeout(self.drain_timeout, cleared(&mut running))
            .await
            .is_err()
        {
            tracing::warn!(parent: &self.span, id = %self.id, timeout = ?self.drain_timeout, "brpc: callback server did not drain in time");
        }

        self.session.close(ErrorCode::NoError, "client closing").await;
        tracing::info!(parent: &self.span, id = %self.id, "brpc: closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::send_client_id;
    use crate::testutil::mem_pair;

    #[test]
    fn interceptor_sets_metadata() {
        let id = ClientId::new();
        let mut icpt = ClientIdInterceptor::new(id);
        let req = icpt.call(Request::new(())).unwrap();
        assert_eq!(ClientId::from_metadata(req.metadata()).unwrap(), id);
    }

    #[tokio::test]
    async fn connect_negotiates_and_opens_forward_stream() {
        let (client, server) = mem_pair();
        let serving = tokio::spawn(async move {
            let id = send_client_id(server.as_ref()).await.unwrap();
            let _fwd = server.accept_stream().await.unwrap();
            id
        });

        let conn = ClientConn::connect(client, ClientOptions::default())
            .await
            .unwrap();
        let id = serving.await.unwrap();
        assert_eq!(conn.id(), id);
        assert!(conn.remote_addr().is_some());
    }

    #[tokio::test]
    async fn failed_handshake_closes_session() {
        let (client, server) = mem_pair();
        let opts = ClientOptions {
            dial_timeout: Duration::from_millis(50),
            ..ClientOptions::default()
        };
        let err = ClientConn::connect(client.clone(), opts).await.unwrap_err();
        assert!(matches!(err, ClientError::NegotiationTimeout(_)));
        assert!(*server.done().borrow());
    }

    #[tokio::test]
    async fn close_without_serving_returns_promptly() {
        let (client, server) = mem_pair();
        tokio::spawn(async move {
            send_client_id(server.as_ref()).await.unwrap();
            let _fwd = server.accept_stream().await;
        });
        let conn = ClientConn::connect(client.clone(), ClientOptions::default())
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), conn.close())
            .await
            .expect("close should not block");
        assert!(*conn.done().borrow());
        conn.close().await;
    }

    #[tokio::test]
    async fn dial_unreachable_fails() {
        let opts = ClientOptions {
            dial_timeout: Duration::from_secs(2),
            ..ClientOptions::default()
        };
        // Reserve a port, then free it so nothing is listening there.
        let addr = {
            let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            ln.local_addr().unwrap()
        };
        let err = ClientConn::dial(&addr.to_string(), opts).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Dial { .. } | ClientError::DialTimeout { .. }
        ));
    }
}
