mod app;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "brpc",
    version,
    about = "Bidirectional gRPC over a single multiplexed connection"
)]
struct Cli {
    /// Config file (.toml/.yaml/.yml). If omitted, uses BRPC_CONFIG; then brpc.toml > brpc.yaml > brpc.yml in the CWD; then the OS default path (Linux: /etc/brpc/brpc.toml; others: user config dir).
    #[arg(long, env = "BRPC_CONFIG", global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Accept clients and serve the demo Greeter, calling back into each caller.
    Server {
        /// Listen address, overrides server.listen_addr.
        #[arg(long)]
        listen: Option<String>,
        /// tcp or quic, overrides server.transport.
        #[arg(long)]
        transport: Option<String>,
    },
    /// Dial a server, serve the demo Namer on the same connection and greet once.
    Client {
        /// Server address, overrides client.server_addr.
        #[arg(long)]
        server: Option<String>,
        /// Name returned to the server's callbacks, overrides client.name.
        #[arg(long)]
        name: Option<String>,
        /// tcp or quic, overrides client.transport.
        #[arg(long)]
        transport: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let role = match cli.command {
        Command::Server { listen, transport } => app::Role::Server { listen, transport },
        Command::Client {
            server,
            name,
            transport,
        } => app::Role::Client {
            server,
            name,
            transport,
        },
    };
    app::run(cli.config, role).await
}
