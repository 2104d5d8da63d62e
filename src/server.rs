//! Accepting side of the tunnel.
//!
//! Every accepted session is negotiated, given a callback proxy built over a
//! server-opened sub-stream, registered under its identity, and then handed to
//! the accept aggregator so the peer's own calls reach the RPC server.

use std::{net::SocketAddr, sync::Arc};

use futures_util::Stream;
use tokio::{sync::watch, task::JoinSet};
use tonic::{
    metadata::MetadataMap,
    transport::{server::Router, Channel},
    Request, Status,
};
use tracing::{Instrument, Span};

use crate::identity::{send_client_id, ClientId, NegotiationError};
use crate::listener::{is_transient, CloseError, MultiListener, SessionSource};
use crate::registry::{ClientRegistry, RegistryError};
use crate::stream::{channel_over, TunnelStream};
use crate::transport::{
    signalled, transport_by_name, wait_done, ErrorCode, TransportError, TransportListenOptions,
    TransportListener, TransportSession,
};

/// Builds the callback proxy for one connection from its channel.
pub type CallbackFactory<C> = Arc<dyn Fn(Channel) -> C + Send + Sync>;

pub struct ServerOptions<C> {
    pub callback_factory: CallbackFactory<C>,
    /// Parent span for everything the server logs. `Span::none()` keeps it
    /// silent.
    pub span: Span,
}

impl<C> ServerOptions<C> {
    pub fn new(factory: impl Fn(Channel) -> C + Send + Sync + 'static) -> Self {
        Self {
            callback_factory: Arc::new(factory),
            span: Span::none(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("brpc: listening on {addr}: {source:#}")]
    Listen {
        addr: String,
        source: anyhow::Error,
    },
    #[error("brpc: sending client id: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error("brpc: opening server->client rpc stream: {0:#}")]
    CallbackStream(anyhow::Error),
    #[error("brpc: registering client: {0}")]
    Register(#[from] RegistryError),
    #[error("brpc: server is shutting down")]
    ShuttingDown,
    #[error("brpc: accepting connection: {0:#}")]
    Accept(anyhow::Error),
    #[error("brpc: serving: {0}")]
    Serve(#[from] tonic::transport::Error),
    #[error("brpc: {0}")]
    Close(#[from] CloseError),
}

impl ServerError {
    /// Close code sent to the peer when this error ends its connection.
    fn close_code(&self) -> ErrorCode {
        match self {
            ServerError::Negotiation(_) | ServerError::Register(_) => ErrorCode::NegotiationFailed,
            ServerError::CallbackStream(_) => ErrorCode::CallbackFailed,
            ServerError::ShuttingDown => ErrorCode::ServerShutdown,
            _ => ErrorCode::InternalError,
        }
    }
}

/// Lifecycle of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connected,
    Negotiating,
    Registered,
    Serving,
    Closed,
}

pub struct Server<C> {
    factory: CallbackFactory<C>,
    registry: ClientRegistry<C>,
    listener: Arc<MultiListener>,
    shutdown: watch::Sender<bool>,
    span: Span,
}

impl<C> std::fmt::Debug for Server<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("clients", &self.registry)
            .field("listener", &self.listener)
            .finish_non_exhaustive()
    }
}

impl<C> Server<C>
where
    C: Clone + Send + Sync + 'static,
{
    pub fn new(opts: ServerOptions<C>) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            factory: opts.callback_factory,
            registry: ClientRegistry::new(),
            listener: Arc::new(MultiListener::with_span(opts.span.clone())),
            shutdown,
            span: opts.span,
        })
    }

    /// Binds a raw listener for `transport` ("tcp" or "quic").
    pub async fn listen(
        &self,
        addr: &str,
        transport: &str,
        opts: TransportListenOptions,
    ) -> Result<Box<dyn TransportListener>, ServerError> {
        let listen_err = |source| ServerError::Listen {
            addr: addr.to_string(),
            source,
        };
        let tr = transport_by_name(transport).map_err(listen_err)?;
        let ln = tr.listen(addr, opts).await.map_err(listen_err)?;
        tracing::info!(
            parent: &self.span,
            addr = %addr,
            local = ?ln.local_addr(),
            transport = %tr.name(),
            "brpc: listening"
        );
        Ok(ln)
    }

    /// Runs the accept loop and the RPC server until [`shutdown`](Self::shutdown)
    /// is called or the raw listener fails.
    pub async fn serve(
        self: &Arc<Self>,
        ln: Box<dyn TransportListener>,
        router: Router,
    ) -> Result<(), ServerError> {
        let this = self.clone();
        let mut accept = tokio::spawn(
            async move { this.accept_loop(ln).await }.instrument(self.span.clone()),
        );

        let (accept_done_tx, accept_done_rx) = tokio::sync::oneshot::channel::<()>();
        let rpc = router.serve_with_incoming_shutdown(self.incoming(), async move {
            let _ = accept_done_rx.await;
        });
        tokio::pin!(rpc);

        let mut accept_res = None;
        let rpc_res = tokio::select! {
            r = &mut rpc => r,
            r = &mut accept => {
                accept_res = Some(r);
                let _ = accept_done_tx.send(());
                rpc.await
            }
        };

        // The RPC server only returns on its own if serving failed.
        let accept_res = match accept_res {
            Some(r) => r,
            None => {
                self.shutdown();
                accept.await
            }
        };

        let accept_res = match accept_res {
            Ok(r) => r,
            Err(err) => {
                tracing::error!(parent: &self.span, err = %err, "brpc: accept loop panicked");
                Ok(())
            }
        };
        rpc_res?;
        accept_res
    }

    /// Accepts raw sessions until shutdown or a listener failure, then waits
    /// for every connection to finish and closes the accept aggregator.
    ///
    /// Callers that run their own RPC server feed it from
    /// [`incoming`](Self::incoming) and run this alongside.
    pub async fn accept_loop(
        self: &Arc<Self>,
        ln: Box<dyn TransportListener>,
    ) -> Result<(), ServerError> {
        let mut shutdown = self.shutdown.subscribe();
        let mut conns = JoinSet::new();

        let res = loop {
            tokio::select! {
                biased;
                _ = signalled(&mut shutdown) => break Ok(()),
                Some(joined) = conns.join_next(), if !conns.is_empty() => {
                    if let Err(err) = joined {
                        if err.is_panic() {
                            tracing::error!(parent: &self.span, err = %err, "brpc: connection task panicked");
                        }
                    }
                }
                sess = ln.accept() => match sess {
                    Ok(sess) => {
                        let this = self.clone();
                        conns.spawn(this.handle_conn(sess).instrument(self.span.clone()));
                    }
                    Err(err) => {
                        let listener_gone = err.downcast_ref::<TransportError>().is_some();
                        if !listener_gone && is_transient(&err) {
                            tracing::debug!(parent: &self.span, err = %format!("{err:#}"), "brpc: accept interrupted");
                            continue;
                        }
                        tracing::error!(parent: &self.span, err = %format!("{err:#}"), "brpc: accept failed");
                        self.listener.post_error(anyhow::anyhow!("{err:#}"));
                        break Err(ServerError::Accept(err));
                    }
                }
            }
        };

        // Live connections close with ServerShutdown either way.
        self.shutdown();
        if let Err(err) = ln.close().await {
            tracing::debug!(parent: &self.span, err = %format!("{err:#}"), "brpc: closing listener");
        }
        // Some listeners only release their socket on drop.
        drop(ln);
        while let Some(joined) = conns.join_next().await {
            if let Err(err) = joined {
                if err.is_panic() {
                    tracing::error!(parent: &self.span, err = %err, "brpc: connection task panicked");
                }
            }
        }
        let closed = self.listener.close().await;
        tracing::info!(parent: &self.span, "brpc: server stopped");

        res?;
        closed?;
        Ok(())
    }

    /// Sub-streams opened by connected peers, for an RPC server's
    /// `serve_with_incoming*`. Ends once the server has shut down.
    pub fn incoming(
        &self,
    ) -> impl Stream<Item = std::io::Result<TunnelStream>> + Send + 'static + use<C> {
        self.listener.incoming()
    }

    /// Stops accepting and closes every live connection. Safe to call more
    /// than once.
    pub fn shutdown(&self) {
        self.shutdown.send_if_modified(|s| {
            if *s {
                return false;
            }
            *s = true;
            true
        });
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves the peer behind an inbound call to its callback proxy.
    pub fn client_from_request<T>(&self, req: &Request<T>) -> Result<C, Status> {
        self.client_from_metadata(req.metadata())
    }

    pub fn client_from_metadata(&self, md: &MetadataMap) -> Result<C, Status> {
        let id = ClientId::from_metadata(md)?;
        self.registry
            .get(&id)
            .ok_or_else(|| Status::not_found(format!("client {id} not found")))
    }

    pub fn client(&self, id: &ClientId) -> Option<C> {
        self.registry.get(id)
    }

    /// Identities of every registered peer.
    pub fn clients(&self) -> Vec<ClientId> {
        self.registry.ids()
    }

    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    async fn handle_conn(self: Arc<Self>, sess: Arc<dyn TransportSession>) {
        let remote = sess.remote_addr();
        metrics::counter!("brpc_connections_total").increment(1);
        log_state(&self.span, None, remote, ConnState::Connected);

        let mut shutdown = self.shutdown.subscribe();
        let established = tokio::select! {
            biased;
            _ = signalled(&mut shutdown) => Err(ServerError::ShuttingDown),
            r = self.establish(&sess) => r,
        };

        let id = match established {
            Ok(id) => id,
            Err(err) => {
                if !matches!(err, ServerError::ShuttingDown) {
                    metrics::counter!("brpc_negotiation_failures_total").increment(1);
                    tracing::warn!(parent: &self.span, remote = ?remote, err = %err, "brpc: connection setup failed");
                }
                self.finish(None, &sess, err.close_code(), &err.to_string())
                    .await;
                return;
            }
        };

        tracing::info!(parent: &self.span, id = %id, remote = ?remote, "brpc: client connected");

        let code = tokio::select! {
            biased;
            _ = signalled(&mut shutdown) => ErrorCode::ServerShutdown,
            _ = wait_done(sess.as_ref()) => ErrorCode::NoError,
        };
        let reason = match code {
            ErrorCode::ServerShutdown => "server shutting down",
            _ => "session ended",
        };
        self.finish(Some(id), &sess, code, reason).await;
    }

    /// Negotiation through registration. Leaves nothing registered on error.
    async fn establish(&self, sess: &Arc<dyn TransportSession>) -> Result<ClientId, ServerError> {
        let remote = sess.remote_addr();
        log_state(&self.span, None, remote, ConnState::Negotiating);
        let id = send_client_id(sess.as_ref()).await?;

        let cb = sess
            .open_stream()
            .await
            .map_err(ServerError::CallbackStream)?;
        let client = (self.factory)(channel_over(cb));
        self.registry.add(id, client)?;
        metrics::gauge!("brpc_active_clients").set(self.registry.len() as f64);
        log_state(&self.span, Some(id), remote, ConnState::Registered);

        let source = Arc::new(SessionSource::new(sess.clone(), Some(id)));
        if !self.listener.add_listener(source) {
            self.registry.remove(&id);
            metrics::gauge!("brpc_active_clients").set(self.registry.len() as f64);
            return Err(ServerError::ShuttingDown);
        }
        log_state(&self.span, Some(id), remote, ConnState::Serving);
        Ok(id)
    }

    /// Single teardown path for a connection.
    async fn finish(
        &self,
        id: Option<ClientId>,
        sess: &Arc<dyn TransportSession>,
        code: ErrorCode,
        reason: &str,
    ) {
        if let Some(id) = id {
            // Dropping the proxy releases the callback channel once the last
            // handler clone is gone.
            drop(self.registry.remove(&id));
            metrics::gauge!("brpc_active_clients").set(self.registry.len() as f64);
        }
        sess.close(code, reason).await;
        log_state(&self.span, id, sess.remote_addr(), ConnState::Closed);
        match id {
            Some(id) => tracing::info!(parent: &self.span, id = %id, code = %code, "brpc: client disconnected"),
            None => tracing::debug!(parent: &self.span, remote = ?sess.remote_addr(), code = %code, "brpc: client disconnected"),
        }
    }
}

fn log_state(span: &Span, id: Option<ClientId>, remote: Option<SocketAddr>, state: ConnState) {
    match id {
        Some(id) => tracing::debug!(parent: span, id = %id, remote = ?remote, state = ?state, "brpc: connection state"),
        None => tracing::debug!(parent: span, remote = ?remote, state = ?state, "brpc: connection state"),
    }
}
