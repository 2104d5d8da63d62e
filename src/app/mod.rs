use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};
use tracing::Span;

use brpc::demo::{
    self, DemoGreeter, DemoNamer, GreetRequest, greeter_client::GreeterClient,
    greeter_server::GreeterServer, namer_server::NamerServer,
};
use brpc::transport::{QuicDialOptions, QuicListenOptions, TransportListenOptions, signalled};
use brpc::{ClientConn, ClientId, ClientOptions};

pub mod admin;
pub mod config;
pub mod logging;
pub mod telemetry;

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Which side of the tunnel this process plays, with CLI overrides on top of
/// the config file.
#[derive(Debug, Clone)]
pub enum Role {
    Server {
        listen: Option<String>,
        transport: Option<String>,
    },
    Client {
        server: Option<String>,
        name: Option<String>,
        transport: Option<String>,
    },
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::Server { .. } => "server",
            Role::Client { .. } => "client",
        }
    }

    fn apply(&self, cfg: &mut config::Config) -> anyhow::Result<()> {
        let set = |dst: &mut String, v: &Option<String>| {
            if let Some(v) = v.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                *dst = v.to_string();
            }
        };
        match self {
            Role::Server { listen, transport } => {
                set(&mut cfg.server.listen_addr, listen);
                set(&mut cfg.server.transport, transport);
                cfg.server.transport = brpc::transport::parse_transport(&cfg.server.transport)?;
            }
            Role::Client {
                server,
                name,
                transport,
            } => {
                set(&mut cfg.client.server_addr, server);
                set(&mut cfg.client.name, name);
                set(&mut cfg.client.transport, transport);
                cfg.client.transport = brpc::transport::parse_transport(&cfg.client.transport)?;
            }
        }
        Ok(())
    }
}

pub async fn run(config_path: Option<PathBuf>, role: Role) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let created = config::ensure_config_file(&resolved.path)?;
    let mut cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;
    role.apply(&mut cfg)?;

    let _logrt = logging::init(&cfg.logging)?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    tracing::info!(
        config = %resolved.path.display(),
        role = role.as_str(),
        admin_addr = %cfg.admin_addr,
        "brpc: starting"
    );

    let prometheus = telemetry::init_prometheus()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    let clients: admin::ClientsSnapshot = match role {
        Role::Server { .. } => {
            let server = demo::new_server(Span::none());
            let snapshot = {
                let server = server.clone();
                Arc::new(move || server.clients()) as admin::ClientsSnapshot
            };
            let cfg = cfg.server.clone();
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { run_server(server, cfg, shutdown).await });
            snapshot
        }
        Role::Client { .. } => {
            let (current_tx, current_rx) = watch::channel(None::<ClientId>);
            let cfg = cfg.client.clone();
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { run_client(cfg, current_tx, shutdown).await });
            Arc::new(move || current_rx.borrow().iter().copied().collect::<Vec<_>>())
                as admin::ClientsSnapshot
        }
    };

    if !cfg.admin_addr.is_empty() {
        let state = admin::AdminState {
            role: role.as_str(),
            prometheus,
            clients,
            config_path: resolved.path.clone(),
        };
        let addr = cfg.admin_addr.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve(&addr, state, shutdown).await });
    }

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            let _ = shutdown_tx.send(true);
            match res {
                Some(Ok(Err(err))) => return Err(err),
                Some(Err(join_err)) => return Err(join_err.into()),
                _ => {}
            }
        }
    }

    let drain = async {
        while let Some(res) = tasks.join_next().await {
            if let Ok(Err(err)) = res {
                tracing::debug!(err = %format!("{err:#}"), "shutdown: task ended with error");
            }
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(timeout = ?DRAIN_TIMEOUT, "shutdown: tasks did not drain in time");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    tracing::info!("brpc: exited");
    Ok(())
}

async fn run_server(
    server: Arc<demo::DemoServer>,
    cfg: config::ServerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let opts = TransportListenOptions {
        quic: QuicListenOptions {
            cert_file: cfg.quic.cert_file.clone(),
            key_file: cfg.quic.key_file.clone(),
            ..QuicListenOptions::default()
        },
    };
    let ln = server.listen(&cfg.listen_addr, &cfg.transport, opts).await?;

    let router = tonic::transport::Server::builder()
        .add_service(GreeterServer::new(DemoGreeter::new(server.clone())));

    let watcher = {
        let server = server.clone();
        tokio::spawn(async move {
            signalled(&mut shutdown).await;
            server.shutdown();
        })
    };

    let res = server.serve(ln, router).await;
    watcher.abort();
    res.map_err(Into::into)
}

async fn run_client(
    cfg: config::ClientConfig,
    current: watch::Sender<Option<ClientId>>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut backoff = MIN_BACKOFF;
    let mut first = true;

    while !*shutdown.borrow() {
        if !first {
            metrics::counter!(telemetry::CLIENT_RECONNECTS_TOTAL).increment(1);
        }
        first = false;

        match client_session(&cfg, &current, shutdown.clone()).await {
            Ok(()) => backoff = MIN_BACKOFF,
            Err(err) => {
                tracing::warn!(server = %cfg.server_addr, err = %format!("{err:#}"), backoff = ?backoff, "client: session failed");
            }
        }
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = signalled(&mut shutdown) => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }

    Ok(())
}

/// One connection's lifetime: dial, serve `Namer`, greet once, then wait for
/// the session (or the process) to end.
async fn client_session(
    cfg: &config::ClientConfig,
    current: &watch::Sender<Option<ClientId>>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let opts = ClientOptions {
        transport: cfg.transport.clone(),
        dial_timeout: cfg.dial_timeout,
        quic: QuicDialOptions {
            server_name: cfg.quic.server_name.clone(),
            ca_file: cfg.quic.ca_file.clone(),
            insecure_skip_verify: cfg.quic.insecure_skip_verify,
            ..QuicDialOptions::default()
        },
        ..ClientOptions::default()
    };
    let conn = Arc::new(ClientConn::dial(&cfg.server_addr, opts).await?);
    current.send_replace(Some(conn.id()));
    tracing::info!(id = %conn.id(), server = %cfg.server_addr, "client: connected");

    let router = tonic::transport::Server::builder()
        .add_service(NamerServer::new(DemoNamer::new(cfg.name.clone())));
    let serving = {
        let conn = conn.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { conn.serve_with_shutdown(router, shutdown).await })
    };

    let mut greeter = GreeterClient::new(conn.channel());
    tokio::select! {
        _ = signalled(&mut shutdown) => {}
        res = greeter.greet(GreetRequest::default()) => match res {
            Ok(reply) => tracing::info!(message = %reply.into_inner().message, "client: greeted"),
            Err(status) => tracing::warn!(code = ?status.code(), message = %status.message(), "client: greet failed"),
        }
    }

    let res = serving.await;
    conn.close().await;
    current.send_replace(None);
    tracing::info!(id = %conn.id(), "client: disconnected");

    res.context("client: callback server task")?
        .map_err(Into::into)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Defaults as loaded from an empty file. Each call gets its own
    /// directory since tests run in parallel.
    fn base_config() -> config::Config {
        let dir = std::env::temp_dir().join(format!(
            "brpc_role_test_{}_{}",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("brpc.toml");
        std::fs::write(&path, "").unwrap();
        let cfg = config::load_config(&path).unwrap();
        let _ = std::fs::remove_dir_all(&dir);
        cfg
    }

    #[test]
    fn cli_overrides_win() {
        let mut cfg = base_config();
        Role::Client {
            server: Some("10.0.0.1:7000".into()),
            name: Some(" ada ".into()),
            transport: Some("QUIC".into()),
        }
        .apply(&mut cfg)
        .unwrap();
        assert_eq!(cfg.client.server_addr, "10.0.0.1:7000");
        assert_eq!(cfg.client.name, "ada");
        assert_eq!(cfg.client.transport, "quic");
        assert_eq!(cfg.server.listen_addr, ":7000");

        let err = Role::Server {
            listen: None,
            transport: Some("udp".into()),
        }
        .apply(&mut cfg);
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn client_loop_exits_on_shutdown_while_backing_off() {
        let cfg = config::ClientConfig {
            server_addr: "127.0.0.1:1".into(),
            dial_timeout: Duration::from_millis(200),
            ..base_config().client
        };
        let (current, _) = watch::channel(None);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move { run_client(cfg, current, rx).await });

        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("client loop should stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn client_session_greets_and_stops_with_the_server() {
        let server = demo::new_server(Span::none());
        let ln = server
            .listen("127.0.0.1:0", "tcp", TransportListenOptions::default())
            .await
            .unwrap();
        let addr = ln.local_addr().unwrap().to_string();
        let router = tonic::transport::Server::builder()
            .add_service(GreeterServer::new(DemoGreeter::new(server.clone())));
        let srv = server.clone();
        let server_task = tokio::spawn(async move { srv.serve(ln, router).await });

        let cfg = config::ClientConfig {
            server_addr: addr,
            name: "zed".into(),
            ..base_config().client
        };
        let (current, mut current_rx) = watch::channel(None);
        let (_tx, rx) = watch::channel(false);
        let session = tokio::spawn(async move { client_session(&cfg, &current, rx).await });

        let id = tokio::time::timeout(Duration::from_secs(5), current_rx.wait_for(Option::is_some))
            .await
            .unwrap()
            .map(|id| *id)
            .unwrap()
            .unwrap();
        let s = server.clone();
        tokio::time::timeout(Duration::from_secs(5), async move {
            while s.client(&id).is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        server.shutdown();
        tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .expect("session should end with the server")
            .unwrap()
            .unwrap();
        assert!(current_rx.borrow().is_none());
        server_task.await.unwrap().unwrap();
    }
}
