//! Merges many accept sources into one `accept()` for the RPC server.

use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use futures_util::Stream;
use tokio::{
    sync::{mpsc, watch, Notify},
    task::JoinSet,
};
use tracing::{Instrument, Span};

use crate::identity::ClientId;
use crate::stream::{TunnelInfo, TunnelStream};
use crate::transport::{signalled, TransportError, TransportSession};

/// Anything that yields inbound sub-streams.
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn accept(&self) -> anyhow::Result<TunnelStream>;
    async fn close(&self) -> anyhow::Result<()>;

    fn describe(&self) -> String {
        "source".to_string()
    }
}

/// Exposes the sub-streams a peer opens on one session as a [`StreamSource`].
///
/// Closing the source leaves the session alone: the task that accepted the
/// session is the only one allowed to close it.
pub struct SessionSource {
    session: Arc<dyn TransportSession>,
    info: TunnelInfo,
}

impl SessionSource {
    pub fn new(session: Arc<dyn TransportSession>, client_id: Option<ClientId>) -> Self {
        let info = TunnelInfo {
            client_id,
            remote_addr: session.remote_addr(),
        };
        Self { session, info }
    }
}

#[async_trait]
impl StreamSource for SessionSource {
    async fn accept(&self) -> anyhow::Result<TunnelStream> {
        let st = self.session.accept_stream().await?;
        Ok(TunnelStream::new(st, self.info.clone()))
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        match (&self.info.client_id, &self.info.remote_addr) {
            (Some(id), Some(addr)) => format!("session {id} ({addr})"),
            (Some(id), None) => format!("session {id}"),
            (None, Some(addr)) => format!("session {addr}"),
            (None, None) => "session".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    #[error("tunnel: listener closed")]
    Closed,
    #[error("tunnel: listener failed: {0:#}")]
    Fatal(anyhow::Error),
}

/// Errors collected while closing the remaining sources, first error first.
#[derive(Debug)]
pub struct CloseError {
    pub errors: Vec<anyhow::Error>,
}

impl std::fmt::Display for CloseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tunnel: closing listeners:")?;
        for (i, err) in self.errors.iter().enumerate() {
            let sep = if i == 0 { " " } else { "; " };
            write!(f, "{sep}{err:#}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CloseError {}

/// True for errors that just mean "the peer went away".
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(e) = cause.downcast_ref::<io::Error>() {
            return matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::NotConnected
            );
        }
        if cause.downcast_ref::<TransportError>().is_some() {
            return true;
        }
        if let Some(e) = cause.downcast_ref::<quinn::ConnectionError>() {
            return matches!(
                e,
                quinn::ConnectionError::ApplicationClosed(_)
                    | quinn::ConnectionError::ConnectionClosed(_)
                    | quinn::ConnectionError::Reset
                    | quinn::ConnectionError::TimedOut
                    | quinn::ConnectionError::LocallyClosed
            );
        }
        false
    })
}

struct State {
    next_id: u64,
    sources: HashMap<u64, Arc<dyn StreamSource>>,
    pumps: JoinSet<()>,
    closed: bool,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Accept aggregator.
///
/// One pump task per source forwards accepted streams over a capacity-1
/// channel, so a source only gets ahead of `accept()` by a single stream.
/// Fatal errors travel out of band and win over queued streams.
pub struct MultiListener {
    tx: mpsc::Sender<TunnelStream>,
    rx: tokio::sync::Mutex<mpsc::Receiver<TunnelStream>>,
    closed: watch::Sender<bool>,
    state: Arc<Mutex<State>>,
    posted: Mutex<Option<anyhow::Error>>,
    posted_notify: Notify,
    fatal: Mutex<Option<anyhow::Error>>,
    span: Span,
}

impl std::fmt::Debug for MultiListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiListener")
            .field("sources", &self.len())
            .finish_non_exhaustive()
    }
}

impl Default for MultiListener {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiListener {
    pub fn new() -> Self {
        Self::with_span(Span::none())
    }

    pub fn with_span(span: Span) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let (closed, _) = watch::channel(false);
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            closed,
            state: Arc::new(Mutex::new(State {
                next_id: 0,
                sources: HashMap::new(),
                pumps: JoinSet::new(),
                closed: false,
            })),
            posted: Mutex::new(None),
            posted_notify: Notify::new(),
            fatal: Mutex::new(None),
            span,
        }
    }

    /// Starts pumping `source`. Returns false (and drops the source) once the
    /// aggregator is closed.
    pub fn add_listener(&self, source: Arc<dyn StreamSource>) -> bool {
        let mut st = lock(&self.state);
        if st.closed {
            tracing::warn!(parent: &self.span, source = %source.describe(), "tunnel: listener closed, ignoring new source");
            return false;
        }
        while st.pumps.try_join_next().is_some() {}

        let id = st.next_id;
        st.next_id += 1;
        st.sources.insert(id, source.clone());

        let pump = pump(
            id,
            source,
            self.tx.clone(),
            self.closed.subscribe(),
            self.state.clone(),
        );
        st.pumps.spawn(pump.instrument(self.span.clone()));
        true
    }

    pub async fn accept(&self) -> Result<TunnelStream, AcceptError> {
        let mut closed = self.closed.subscribe();
        loop {
            if *closed.borrow() {
                return Err(AcceptError::Closed);
            }
            if let Some(err) = self.take_posted() {
                return Err(AcceptError::Fatal(err));
            }
            let recv = async {
                let mut rx = self.rx.lock().await;
                rx.recv().await
            };
            tokio::select! {
                biased;
                _ = signalled(&mut closed) => return Err(AcceptError::Closed),
                _ = self.posted_notify.notified() => continue,
                d = recv => {
                    return match d {
                        Some(st) => Ok(st),
                        None => Err(AcceptError::Closed),
                    };
                }
            }
        }
    }

    fn take_posted(&self) -> Option<anyhow::Error> {
        self.posted.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Makes a pending or the next `accept()` fail with `err`. Does not block;
    /// a second error posted before the first was seen replaces it.
    pub fn post_error(&self, err: anyhow::Error) {
        if self.is_closed() {
            tracing::debug!(parent: &self.span, err = %format!("{err:#}"), "tunnel: listener closed, dropping error");
            return;
        }
        *self.posted.lock().unwrap_or_else(|e| e.into_inner()) = Some(err);
        self.posted_notify.notify_one();
    }

    pub async fn close(&self) -> Result<(), CloseError> {
        let mut pumps = {
            let mut st = lock(&self.state);
            if st.closed {
                return Ok(());
            }
            st.closed = true;
            self.closed.send_replace(true);
            std::mem::take(&mut st.pumps)
        };

        while let Some(res) = pumps.join_next().await {
            if let Err(err) = res {
                if err.is_panic() {
                    tracing::error!(parent: &self.span, err = %err, "tunnel: listener pump panicked");
                }
            }
        }

        let mut sources: Vec<_> = lock(&self.state).sources.drain().collect();
        sources.sort_by_key(|(id, _)| *id);

        let mut errors = Vec::new();
        for (_, src) in sources {
            if let Err(err) = src.close().await {
                errors.push(err.context(format!("closing {}", src.describe())));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CloseError { errors })
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Number of sources whose pump is still running.
    pub fn len(&self) -> usize {
        lock(&self.state).sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The fatal error that ended [`incoming`](Self::incoming), if any.
    pub fn take_fatal(&self) -> Option<anyhow::Error> {
        self.fatal.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Adapts the aggregator into the connection stream an RPC server
    /// consumes. The stream ends when the aggregator closes or a fatal error is
    /// posted; the latter is kept for [`take_fatal`](Self::take_fatal).
    pub fn incoming(
        self: &Arc<Self>,
    ) -> impl Stream<Item = io::Result<TunnelStream>> + Send + 'static + use<> {
        futures_util::stream::unfold(self.clone(), |ml| async move {
            match ml.accept().await {
                Ok(st) => Some((Ok(st), ml)),
                Err(AcceptError::Closed) => None,
                Err(AcceptError::Fatal(err)) => {
                    tracing::error!(parent: &ml.span, err = %format!("{err:#}"), "tunnel: accept failed");
                    *ml.fatal.lock().unwrap_or_else(|e| e.into_inner()) = Some(err);
                    None
                }
            }
        })
    }
}

async fn pump(
    id: u64,
    source: Arc<dyn StreamSource>,
    tx: mpsc::Sender<TunnelStream>,
    mut closed: watch::Receiver<bool>,
    state: Arc<Mutex<State>>,
) {
    loop {
        let res = tokio::select! {
            biased;
            _ = signalled(&mut closed) => return,
            r = source.accept() => r,
        };

        match res {
            Ok(st) => {
                tokio::select! {
                    biased;
                    _ = signalled(&mut closed) => return,
                    r = tx.send(st) => {
                        if r.is_err() {
                            return;
                        }
                    }
                }
            }
            Err(err) => {
                if is_transient(&err) {
                    tracing::debug!(source = %source.describe(), err = %format!("{err:#}"), "tunnel: source ended");
                } else {
                    tracing::warn!(source = %source.describe(), err = %format!("{err:#}"), "tunnel: source failed");
                }
                lock(&state).sources.remove(&id);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use futures_util::StreamExt;

    use super::*;
    use crate::testutil::mem_pair;

    struct ChanSource {
        name: String,
        rx: tokio::sync::Mutex<mpsc::Receiver<TunnelStream>>,
        close_err: Option<&'static str>,
        closes: AtomicUsize,
    }

    impl ChanSource {
        fn new(name: &str, close_err: Option<&'static str>) -> (Arc<Self>, mpsc::Sender<TunnelStream>) {
            let (tx, rx) = mpsc::channel(16);
            let src = Arc::new(Self {
                name: name.to_string(),
                rx: tokio::sync::Mutex::new(rx),
                close_err,
                closes: AtomicUsize::new(0),
            });
            (src, tx)
        }
    }

    #[async_trait]
    impl StreamSource for ChanSource {
        async fn accept(&self) -> anyhow::Result<TunnelStream> {
            let mut rx = self.rx.lock().await;
            match rx.recv().await {
                Some(st) => Ok(st),
                None => Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            }
        }

        async fn close(&self) -> anyhow::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            match self.close_err {
                Some(msg) => Err(anyhow::anyhow!(msg)),
                None => Ok(()),
            }
        }

        fn describe(&self) -> String {
            self.name.clone()
        }
    }

    fn dummy_stream() -> TunnelStream {
        let (a, _b) = tokio::io::duplex(64);
        TunnelStream::new(Box::new(a), TunnelInfo::default())
    }

    #[tokio::test]
    async fn delivers_every_stream_from_every_source() {
        const N: usize = 4;
        const M: usize = 8;

        let ml = MultiListener::new();
        let mut producers = Vec::new();
        for i in 0..N {
            let (src, tx) = ChanSource::new(&format!("src-{i}"), None);
            assert!(ml.add_listener(src));
            producers.push(tokio::spawn(async move {
                for _ in 0..M {
                    tx.send(dummy_stream()).await.unwrap();
                }
            }));
        }

        for _ in 0..N * M {
            tokio::time::timeout(Duration::from_secs(5), ml.accept())
                .await
                .expect("accept timed out")
                .expect("accept failed");
        }
        for p in producers {
            p.await.unwrap();
        }

        // Every producer is gone, so every pump ends on EOF.
        let extra = tokio::time::timeout(Duration::from_millis(100), ml.accept()).await;
        assert!(extra.is_err(), "no stream beyond N*M expected");

        ml.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_unblocks_waiting_accept() {
        let ml = Arc::new(MultiListener::new());
        let (src, _keep_open) = ChanSource::new("idle", None);
        ml.add_listener(src.clone());

        let waiter = {
            let ml = ml.clone();
            tokio::spawn(async move { ml.accept().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(1), ml.close())
            .await
            .expect("close should not hang")
            .unwrap();

        let res = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(res, Err(AcceptError::Closed)));
        assert!(matches!(ml.accept().await, Err(AcceptError::Closed)));
        assert_eq!(src.closes.load(Ordering::SeqCst), 1);

        // Second close is a no-op.
        ml.close().await.unwrap();
        assert_eq!(src.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_collects_errors_in_order() {
        let ml = MultiListener::new();
        let (a, _ta) = ChanSource::new("a", Some("first"));
        let (b, _tb) = ChanSource::new("b", None);
        let (c, _tc) = ChanSource::new("c", Some("second"));
        ml.add_listener(a);
        ml.add_listener(b);
        ml.add_listener(c);

        let err = ml.close().await.unwrap_err();
        assert_eq!(err.errors.len(), 2);
        assert!(format!("{:#}", err.errors[0]).contains("first"));
        assert!(format!("{:#}", err.errors[1]).contains("second"));
    }

    #[tokio::test]
    async fn failed_source_is_dropped_and_others_keep_going() {
        let ml = MultiListener::new();
        let (dead, dead_tx) = ChanSource::new("dead", None);
        let (live, live_tx) = ChanSource::new("live", None);
        ml.add_listener(dead);
        ml.add_listener(live);
        drop(dead_tx);

        tokio::time::timeout(Duration::from_secs(5), async {
            while ml.len() != 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("dead source should be removed");

        live_tx.send(dummy_stream()).await.unwrap();
        ml.accept().await.unwrap();
        ml.close().await.unwrap();
    }

    #[tokio::test]
    async fn add_after_close_is_ignored() {
        let ml = MultiListener::new();
        ml.close().await.unwrap();
        let (src, _tx) = ChanSource::new("late", None);
        assert!(!ml.add_listener(src));
        assert!(ml.is_empty());
    }

    #[tokio::test]
    async fn posted_error_reaches_accept_and_ends_incoming() {
        let ml = Arc::new(MultiListener::new());
        let (src, tx) = ChanSource::new("one", None);
        ml.add_listener(src);

        tx.send(dummy_stream()).await.unwrap();
        let mut incoming = Box::pin(ml.incoming());
        assert!(incoming.next().await.unwrap().is_ok());

        ml.post_error(anyhow::anyhow!("listener died"));
        assert!(incoming.next().await.is_none());
        let fatal = ml.take_fatal().expect("fatal error recorded");
        assert!(fatal.to_string().contains("listener died"));

        ml.close().await.unwrap();
    }

    #[tokio::test]
    async fn session_source_forwards_peer_streams() {
        let (client, server) = mem_pair();
        let id = ClientId::new();
        let ml = MultiListener::new();
        ml.add_listener(Arc::new(SessionSource::new(server.clone(), Some(id))));

        let _a = client.open_stream().await.unwrap();
        let _b = client.open_stream().await.unwrap();
        for _ in 0..2 {
            let st = ml.accept().await.unwrap();
            assert_eq!(st.info().client_id, Some(id));
            assert!(st.info().remote_addr.is_some());
        }

        // The session outlives the aggregator.
        ml.close().await.unwrap();
        assert!(!*server.done().borrow());
    }

    #[test]
    fn transient_classification() {
        let reset: anyhow::Error = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert!(is_transient(&reset));
        assert!(is_transient(&anyhow::Error::from(TransportError::SessionClosed)));
        assert!(is_transient(&anyhow::Error::from(quinn::ConnectionError::TimedOut)));
        assert!(is_transient(
            &anyhow::Error::from(io::Error::from(io::ErrorKind::BrokenPipe)).context("accepting")
        ));

        let denied: anyhow::Error = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert!(!is_transient(&denied));
        assert!(!is_transient(&anyhow::anyhow!("boom")));
    }
}
