use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use pin_project_lite::pin_project;
use quinn::{ClientConfig, Connection, Endpoint, ServerConfig, TransportConfig};
use tokio::sync::{mpsc, watch};

use crate::net;
use crate::transport::{
    BoxedStream, ErrorCode, QuicDialOptions, QuicListenOptions, Transport, TransportDialOptions,
    TransportError, TransportListenOptions, TransportListener, TransportSession, default_alpn,
};

const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// QUIC transport. Sub-streams are native QUIC bidirectional streams.
pub struct QuicTransport;

impl QuicTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for QuicTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn transport_config() -> anyhow::Result<TransportConfig> {
    let mut cfg = TransportConfig::default();
    cfg.max_idle_timeout(Some(MAX_IDLE_TIMEOUT.try_into()?));
    cfg.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    Ok(cfg)
}

#[async_trait]
impl Transport for QuicTransport {
    fn name(&self) -> &'static str {
        "quic"
    }

    async fn listen(
        &self,
        addr: &str,
        opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>> {
        let bind_addr = net::normalize_bind_addr(addr);
        let addr: SocketAddr = bind_addr.parse()?;
        let QuicListenOptions {
            cert_file,
            key_file,
            next_protos,
        } = opts.quic;

        let next_protos = default_alpn(&next_protos);
        let (cert_chain, key) = quic_tls::load_or_generate_cert(cert_file, key_file)?;

        let server_crypto = quic_tls::server_crypto_config(cert_chain, key, next_protos)?;
        let mut server_cfg = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)?,
        ));
        server_cfg.transport_config(Arc::new(transport_config()?));

        let endpoint = Endpoint::server(server_cfg, addr)?;
        Ok(Box::new(QuicTransportListener::new(endpoint)))
    }

    async fn dial(
        &self,
        addr: &str,
        opts: TransportDialOptions,
    ) -> anyhow::Result<Arc<dyn TransportSession>> {
        let QuicDialOptions {
            server_name,
            ca_file,
            insecure_skip_verify,
            next_protos,
        } = opts.quic;
        let next_protos = default_alpn(&next_protos);

        let client_crypto =
            quic_tls::client_crypto_config(insecure_skip_verify, &ca_file, next_protos)?;
        let mut client_cfg = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)?,
        ));
        client_cfg.transport_config(Arc::new(transport_config()?));

        let remote = resolve_socket_addr(addr).await?;
        let bind: SocketAddr = if remote.is_ipv6() {
            SocketAddr::from(([0u16; 8], 0))
        } else {
            SocketAddr::from(([0u8; 4], 0))
        };
        let mut endpoint = Endpoint::client(bind)?;
        endpoint.set_default_client_config(client_cfg);

        let name = if server_name.trim().is_empty() {
            "localhost".to_string()
        } else {
            server_name
        };

        let conn = endpoint.connect(remote, &name)?.await?;
        Ok(Arc::new(QuicSession::new(conn, endpoint.local_addr().ok())))
    }
}

async fn resolve_socket_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(sa);
    }
    let mut it = tokio::net::lookup_host(addr).await?;
    it.next()
        .ok_or_else(|| anyhow::anyhow!("tunnel: could not resolve {addr:?}"))
}

/// Handshakes run in their own tasks, so a stalled peer never holds up the
/// next connection.
pub struct QuicTransportListener {
    endpoint: Endpoint,
    ready: tokio::sync::Mutex<mpsc::Receiver<Connection>>,
    task: tokio::task::JoinHandle<()>,
}

impl QuicTransportListener {
    fn new(endpoint: Endpoint) -> Self {
        let (tx, rx) = mpsc::channel(16);
        let ep = endpoint.clone();
        let task = tokio::spawn(async move {
            while let Some(incoming) = ep.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let remote = incoming.remote_address();
                    match incoming.await {
                        Ok(conn) => {
                            let _ = tx.send(conn).await;
                        }
                        // One bad handshake must not take the listener down.
                        Err(err) => {
                            tracing::debug!(remote = %remote, err = %err, "tunnel: quic handshake failed");
                        }
                    }
                });
            }
        });
        Self {
            endpoint,
            ready: tokio::sync::Mutex::new(rx),
            task,
        }
    }
}

impl Drop for QuicTransportListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl TransportListener for QuicTransportListener {
    async fn accept(&self) -> anyhow::Result<Arc<dyn TransportSession>> {
        let conn = self
            .ready
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::EndpointClosed)?;
        Ok(Arc::new(QuicSession::new(conn, self.endpoint.local_addr().ok())))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr().ok()
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.endpoint
            .close(ErrorCode::ServerShutdown.as_u32().into(), b"listener closed");
        Ok(())
    }
}

struct QuicSession {
    conn: Connection,
    incoming: tokio::sync::Mutex<mpsc::Receiver<(quinn::SendStream, quinn::RecvStream)>>,
    done: Arc<watch::Sender<bool>>,
    local: Option<SocketAddr>,
    task: tokio::task::JoinHandle<()>,
}

impl QuicSession {
    fn new(conn: Connection, local: Option<SocketAddr>) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let (done, _) = watch::channel(false);
        let done = Arc::new(done);

        let c = conn.clone();
        let task_done = done.clone();
        let task = tokio::spawn(async move {
            loop {
                match c.accept_bi().await {
                    Ok(st) => {
                        if tx.send(st).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(err = %err, "tunnel: quic connection ended");
                        break;
                    }
                }
            }
            c.closed().await;
            task_done.send_replace(true);
        });

        Self {
            conn,
            incoming: tokio::sync::Mutex::new(rx),
            done,
            local,
            task,
        }
    }
}

#[async_trait]
impl TransportSession for QuicSession {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
        let (send, recv) = self.conn.open_bi().await?;
        Ok(Box::new(QuicBiStream { send, recv }))
    }

    async fn accept_stream(&self) -> anyhow::Result<BoxedStream> {
        let mut rx = self.incoming.lock().await;
        let (send, recv) = rx.recv().await.ok_or(TransportError::SessionClosed)?;
        Ok(Box::new(QuicBiStream { send, recv }))
    }

    fn done(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }

    async fn close(&self, code: ErrorCode, reason: &str) {
        self.task.abort();
        self.conn.close(code.as_u32().into(), reason.as_bytes());
        self.done.send_replace(true);
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.conn.remote_address())
    }

    /// The endpoint's bound address; a wildcard bind reports the wildcard.
    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }
}

impl Drop for QuicSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pin_project! {
    struct QuicBiStream {
        #[pin]
        send: quinn::SendStream,
        #[pin]
        recv: quinn::RecvStream,
    }
}

impl tokio::io::AsyncRead for QuicBiStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        tokio::io::AsyncRead::poll_read(self.project().recv, cx, buf)
    }
}

impl tokio::io::AsyncWrite for QuicBiStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        data: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        tokio::io::AsyncWrite::poll_write(self.project().send, cx, data)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        tokio::io::AsyncWrite::poll_flush(self.project().send, cx)
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        tokio::io::AsyncWrite::poll_shutdown(self.project().send, cx)
    }
}

mod quic_tls {
    use std::{fs, path::Path, sync::Arc};

    use rcgen::generate_simple_self_signed;
    use rustls::{
        client::danger::{ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
    };

    pub fn load_or_generate_cert(
        cert_file: String,
        key_file: String,
    ) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let cert_file = cert_file.trim();
        let key_file = key_file.trim();

        match (cert_file.is_empty(), key_file.is_empty()) {
            (false, false) => {
                let certs = load_certs(Path::new(cert_file))?;
                let key = load_key(Path::new(key_file))?;
                Ok((certs, key))
            }
            (true, true) => {
                tracing::warn!("tunnel: quic listener using a generated self-signed certificate");
                let rcgen::CertifiedKey { cert, signing_key } =
                    generate_simple_self_signed(["localhost".to_string()])?;
                let key_der =
                    PrivateKeyDer::from(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));
                Ok((vec![cert.der().clone()], key_der))
            }
            _ => anyhow::bail!(
                "tunnel: quic requires both cert_file and key_file (or neither to auto-generate)"
            ),
        }
    }

    fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
        let data = fs::read(path)?;
        let mut rd = std::io::Cursor::new(&data);
        let certs = rustls_pemfile::certs(&mut rd).collect::<Result<Vec<_>, _>>()?;
        if certs.is_empty() {
            anyhow::bail!("tunnel: no certificates found in {}", path.display());
        }
        Ok(certs)
    }

    fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
        let data = fs::read(path)?;
        let mut rd = std::io::Cursor::new(&data);
        let Some(k) = rustls_pemfile::private_key(&mut rd)? else {
            anyhow::bail!("tunnel: no private key found in {}", path.display());
        };
        Ok(k)
    }

    /// The process-wide default provider is ambiguous when more than one
    /// rustls backend is compiled in, so configs always name theirs.
    fn provider() -> Arc<rustls::crypto::CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    pub fn server_crypto_config(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        next_protos: Vec<Vec<u8>>,
    ) -> anyhow::Result<rustls::ServerConfig> {
        let mut cfg = rustls::ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        cfg.alpn_protocols = next_protos;
        Ok(cfg)
    }

    pub fn client_crypto_config(
        insecure_skip_verify: bool,
        ca_file: &str,
        next_protos: Vec<Vec<u8>>,
    ) -> anyhow::Result<rustls::ClientConfig> {
        let builder = rustls::ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?;
        let mut cfg = if insecure_skip_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(SkipServerVerification::new())
                .with_no_client_auth()
        } else {
            let ca_file = ca_file.trim();
            if ca_file.is_empty() {
                anyhow::bail!("tunnel: quic dial needs ca_file unless insecure_skip_verify is set");
            }
            let mut roots = rustls::RootCertStore::empty();
            for cert in load_certs(Path::new(ca_file))? {
                roots.add(cert)?;
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        };
        cfg.alpn_protocols = next_protos;
        Ok(cfg)
    }

    /// Accepts any server certificate.
    ///
    /// NOTE: vulnerable to MITM. Intended for local dev / testing only.
    #[derive(Debug)]
    struct SkipServerVerification(Arc<rustls::crypto::CryptoProvider>);

    impl SkipServerVerification {
        fn new() -> Arc<Self> {
            Arc::new(Self(provider()))
        }
    }

    impl ServerCertVerifier for SkipServerVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}
