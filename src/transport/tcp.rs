use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{
    net::TcpListener,
    net::TcpStream,
    sync::{mpsc, watch},
};

use crate::net;
use crate::transport::{
    BoxedStream, ErrorCode, Transport, TransportDialOptions, TransportError, TransportListenOptions,
    TransportListener, TransportSession,
};

const GOAWAY_TIMEOUT: Duration = Duration::from_secs(1);

/// Plain TCP with a yamux session layered on top for sub-streams.
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn listen(
        &self,
        addr: &str,
        _opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>> {
        let bind_addr = net::normalize_bind_addr(addr);
        let ln = TcpListener::bind(bind_addr.as_ref()).await?;
        Ok(Box::new(TcpTransportListener { ln }))
    }

    async fn dial(
        &self,
        addr: &str,
        _opts: TransportDialOptions,
    ) -> anyhow::Result<Arc<dyn TransportSession>> {
        let c = TcpStream::connect(addr).await?;
        c.set_nodelay(true)?;
        Ok(Arc::new(YamuxSession::client(c)))
    }
}

pub struct TcpTransportListener {
    ln: TcpListener,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&self) -> anyhow::Result<Arc<dyn TransportSession>> {
        let (c, _) = self.ln.accept().await?;
        c.set_nodelay(true)?;
        Ok(Arc::new(YamuxSession::server(c)))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }

    async fn close(&self) -> anyhow::Result<()> {
        // TcpListener doesn't have async close; drop closes.
        Ok(())
    }
}

struct YamuxSession {
    control: tokio::sync::Mutex<tokio_yamux::Control>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<tokio_yamux::StreamHandle>>,
    done: Arc<watch::Sender<bool>>,
    remote: Option<SocketAddr>,
    local: Option<SocketAddr>,
    task: tokio::task::JoinHandle<()>,
}

impl YamuxSession {
    fn server(c: TcpStream) -> Self {
        let remote = c.peer_addr().ok();
        let local = c.local_addr().ok();
        let session = tokio_yamux::Session::new_server(c, tokio_yamux::Config::default());
        Self::from_session(session, remote, local)
    }

    fn client(c: TcpStream) -> Self {
        let remote = c.peer_addr().ok();
        let local = c.local_addr().ok();
        let session = tokio_yamux::Session::new_client(c, tokio_yamux::Config::default());
        Self::from_session(session, remote, local)
    }

    fn from_session(
        mut session: tokio_yamux::Session<TcpStream>,
        remote: Option<SocketAddr>,
        local: Option<SocketAddr>,
    ) -> Self {
        let control = session.control();
        let (done, _) = watch::channel(false);
        let done = Arc::new(done);

        // The session only makes progress while this task polls it.
        let (tx, rx) = mpsc::channel::<tokio_yamux::StreamHandle>(64);
        let task_done = done.clone();
        let task = tokio::spawn(async move {
            while let Some(next) = session.next().await {
                match next {
                    Ok(st) => {
                        if tx.send(st).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(err = %err, "tunnel: yamux session ended");
                        break;
                    }
                }
            }
            task_done.send_replace(true);
        });

        Self {
            control: tokio::sync::Mutex::new(control),
            incoming: tokio::sync::Mutex::new(rx),
            done,
            remote,
            local,
            task,
        }
    }
}

#[async_trait]
impl TransportSession for YamuxSession {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
        if *self.done.borrow() {
            return Err(TransportError::SessionClosed.into());
        }
        let mut ctrl = self.control.lock().await;
        let st = ctrl.open_stream().await?;
        Ok(Box::new(st))
    }

    async fn accept_stream(&self) -> anyhow::Result<BoxedStream> {
        let mut rx = self.incoming.lock().await;
        let st = rx.recv().await.ok_or(TransportError::SessionClosed)?;
        Ok(Box::new(st))
    }

    fn done(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }

    async fn close(&self, code: ErrorCode, reason: &str) {
        tracing::debug!(code = %code, reason = %reason, remote = ?self.remote, "tunnel: closing yamux session");
        // GoAway goes out through the driver, so it has to outlive this.
        {
            let mut ctrl = self.control.lock().await;
            if tokio::time::timeout(GOAWAY_TIMEOUT, ctrl.close()).await.is_err() {
                tracing::debug!(remote = ?self.remote, "tunnel: yamux goaway timed out");
            }
        }
        self.task.abort();
        self.done.send_replace(true);
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }
}

impl Drop for YamuxSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::transport::wait_done;

    async fn pair() -> (Arc<dyn TransportSession>, Arc<dyn TransportSession>) {
        let tr = TcpTransport::new();
        let ln = tr
            .listen("127.0.0.1:0", TransportListenOptions::default())
            .await
            .unwrap();
        let addr = ln.local_addr().unwrap().to_string();
        let (client, server) = tokio::join!(
            tr.dial(&addr, TransportDialOptions::default()),
            ln.accept()
        );
        (client.unwrap(), server.unwrap())
    }

    #[tokio::test]
    async fn streams_flow_both_ways() {
        let (client, server) = pair().await;

        let mut out = server.open_stream().await.unwrap();
        out.write_all(b"ping").await.unwrap();
        out.flush().await.unwrap();

        let mut inc = client.accept_stream().await.unwrap();
        let mut buf = [0u8; 4];
        inc.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        let mut back = client.open_stream().await.unwrap();
        back.write_all(b"pong").await.unwrap();
        back.flush().await.unwrap();

        let mut got = server.accept_stream().await.unwrap();
        got.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn server_close_says_goodbye_before_stopping() {
        let (client, server) = pair().await;

        tokio::time::timeout(
            Duration::from_secs(5),
            server.close(ErrorCode::ServerShutdown, "shutting down"),
        )
        .await
        .expect("close should not hang on a live peer");

        tokio::time::timeout(Duration::from_secs(5), wait_done(client.as_ref()))
            .await
            .expect("client session should observe the goaway");
        assert!(client.open_stream().await.is_err());
    }

    #[tokio::test]
    async fn peer_close_fires_done() {
        let (client, server) = pair().await;

        client.close(ErrorCode::NoError, "bye").await;

        tokio::time::timeout(Duration::from_secs(5), wait_done(server.as_ref()))
            .await
            .expect("server session should observe disconnect");
        assert!(*client.done().borrow());
        assert!(client.open_stream().await.is_err());
    }
}
