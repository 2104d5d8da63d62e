//! In-memory sessions for unit tests that don't need a real socket.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};

use crate::transport::{
    signalled, BoxedStream, ErrorCode, TransportError, TransportListener, TransportSession,
};

const PIPE_CAPACITY: usize = 64 * 1024;

/// One end of a linked pair. Streams opened here show up in the peer's
/// `accept_stream`; closing either end marks both as done.
pub struct MemSession {
    to_peer: mpsc::UnboundedSender<BoxedStream>,
    incoming: Mutex<mpsc::UnboundedReceiver<BoxedStream>>,
    done: Arc<watch::Sender<bool>>,
    closed_with: std::sync::Mutex<Option<ErrorCode>>,
    local: SocketAddr,
    remote: SocketAddr,
}

impl MemSession {
    /// Code passed to the first `close` on this end.
    pub fn close_code(&self) -> Option<ErrorCode> {
        *self.closed_with.lock().unwrap()
    }
}

pub fn mem_pair() -> (Arc<MemSession>, Arc<MemSession>) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let (done, _) = watch::channel(false);
    let done = Arc::new(done);
    let a_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 40001));
    let b_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 40002));

    let a = MemSession {
        to_peer: b_tx,
        incoming: Mutex::new(a_rx),
        done: done.clone(),
        closed_with: std::sync::Mutex::new(None),
        local: a_addr,
        remote: b_addr,
    };
    let b = MemSession {
        to_peer: a_tx,
        incoming: Mutex::new(b_rx),
        done,
        closed_with: std::sync::Mutex::new(None),
        local: b_addr,
        remote: a_addr,
    };
    (Arc::new(a), Arc::new(b))
}

#[async_trait]
impl TransportSession for MemSession {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
        if *self.done.borrow() {
            return Err(TransportError::SessionClosed.into());
        }
        let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
        self.to_peer
            .send(Box::new(theirs))
            .map_err(|_| TransportError::SessionClosed)?;
        Ok(Box::new(ours))
    }

    async fn accept_stream(&self) -> anyhow::Result<BoxedStream> {
        let mut done = self.done.subscribe();
        let mut rx = self.incoming.lock().await;
        tokio::select! {
            biased;
            _ = signalled(&mut done) => Err(TransportError::SessionClosed.into()),
            st = rx.recv() => st.ok_or_else(|| TransportError::SessionClosed.into()),
        }
    }

    fn done(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }

    async fn close(&self, code: ErrorCode, _reason: &str) {
        self.closed_with.lock().unwrap().get_or_insert(code);
        self.done.send_replace(true);
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }
}

pub type AcceptResult = anyhow::Result<Arc<dyn TransportSession>>;

/// Raw listener fed by hand: each value sent is what the next `accept`
/// returns. Dropping the sender closes it.
pub struct MemListener {
    rx: Mutex<mpsc::UnboundedReceiver<AcceptResult>>,
}

pub fn mem_listener() -> (mpsc::UnboundedSender<AcceptResult>, Box<dyn TransportListener>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Box::new(MemListener { rx: Mutex::new(rx) }))
}

#[async_trait]
impl TransportListener for MemListener {
    async fn accept(&self) -> anyhow::Result<Arc<dyn TransportSession>> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.unwrap_or_else(|| Err(TransportError::EndpointClosed.into()))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.rx.lock().await.close();
        Ok(())
    }
}
