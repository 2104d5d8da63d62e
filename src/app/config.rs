use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use brpc::transport::parse_transport;

pub const CONFIG_ENV: &str = "BRPC_CONFIG";

const CANDIDATES: [&str; 3] = ["brpc.toml", "brpc.yaml", "brpc.yml"];

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConfigPathSource::Flag => "flag",
            ConfigPathSource::Env => "env",
            ConfigPathSource::Cwd => "cwd",
            ConfigPathSource::Default => "default",
        };
        f.write_str(s)
    }
}

/// Picks the config file: `--config`, then `BRPC_CONFIG`, then a `brpc.*` in
/// the working directory, then the per-OS default location.
pub fn resolve_config_path(flag: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = flag {
        // clap fills the flag from BRPC_CONFIG too; tell the two apart for logs.
        let from_env = std::env::var_os(CONFIG_ENV).is_some_and(|v| v == p.as_os_str());
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: if from_env {
                ConfigPathSource::Env
            } else {
                ConfigPathSource::Flag
            },
        });
    }

    if let Some(p) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(Path::new(&p))?,
            source: ConfigPathSource::Env,
        });
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            return Ok(discover_config_path(p).unwrap_or_else(|| p.join(CANDIDATES[0])));
        }
        return Ok(p.to_path_buf());
    }

    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    CANDIDATES
        .iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).is_ok_and(|m| m.is_file()))
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/brpc/brpc.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = directories::ProjectDirs::from("dev", "brpc", "brpc")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("brpc.toml"))
    }
}

/// Writes the default template if nothing exists at `path`. Returns whether a
/// file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!("config: {} exists but is not a regular file", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = match Format::from_path(path)? {
        Format::Toml => DEFAULT_CONFIG_TOML,
        Format::Yaml => DEFAULT_CONFIG_YAML,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("config: mkdir {}", parent.display()))?;
    }

    use std::io::Write;
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

enum Format {
    Toml,
    Yaml,
}

impl Format {
    fn from_path(path: &Path) -> anyhow::Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        match ext.as_str() {
            "toml" => Ok(Format::Toml),
            "yaml" | "yml" => Ok(Format::Yaml),
            _ => anyhow::bail!(
                "config: unsupported config extension {ext:?} (expected .toml or .yaml/.yml)"
            ),
        }
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let s = fs::read_to_string(path).with_context(|| format!("config: read {}", path.display()))?;
    let fc: FileConfig = match Format::from_path(path)? {
        Format::Toml => {
            toml::from_str(&s).with_context(|| format!("config: parse toml {}", path.display()))?
        }
        Format::Yaml => serde_yaml::from_str(&s)
            .with_context(|| format!("config: parse yaml {}", path.display()))?,
    };
    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub admin_addr: String,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub transport: String,
    pub quic: QuicServerConfig,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub transport: String,
    pub dial_timeout: Duration,
    /// Name the demo `Namer` service answers with.
    pub name: String,
    pub quic: QuicClientConfig,
}

#[derive(Debug, Clone, Default)]
pub struct QuicServerConfig {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Default)]
pub struct QuicClientConfig {
    pub server_name: String,
    pub ca_file: String,
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    server: Option<FileServer>,
    client: Option<FileClient>,
    #[serde(default)]
    admin_addr: String,
    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServer {
    listen_addr: Option<String>,
    transport: Option<String>,
    quic: Option<FileQuicServer>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    server_addr: Option<String>,
    transport: Option<String>,
    dial_timeout_ms: Option<i64>,
    name: Option<String>,
    quic: Option<FileQuicClient>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileQuicServer {
    cert_file: Option<String>,
    key_file: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileQuicClient {
    server_name: Option<String>,
    ca_file: Option<String>,
    #[serde(default)]
    insecure_skip_verify: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

/// Trimmed value, or `default` when missing or blank.
fn or_default(v: Option<&String>, default: &str) -> String {
    v.map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
        .to_string()
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let srv = fc.server.as_ref();
        let squic = srv.and_then(|s| s.quic.as_ref());
        let server = ServerConfig {
            listen_addr: or_default(srv.and_then(|s| s.listen_addr.as_ref()), ":7000"),
            transport: parse_transport(&or_default(srv.and_then(|s| s.transport.as_ref()), "tcp"))
                .context("config: server.transport")?,
            quic: QuicServerConfig {
                cert_file: or_default(squic.and_then(|q| q.cert_file.as_ref()), ""),
                key_file: or_default(squic.and_then(|q| q.key_file.as_ref()), ""),
            },
        };

        let cli = fc.client.as_ref();
        let cquic = cli.and_then(|c| c.quic.as_ref());
        let dial_ms = cli.and_then(|c| c.dial_timeout_ms).unwrap_or(5000);
        if dial_ms < 0 {
            anyhow::bail!("config: client.dial_timeout_ms must not be negative");
        }
        let client = ClientConfig {
            server_addr: or_default(cli.and_then(|c| c.server_addr.as_ref()), "127.0.0.1:7000"),
            transport: parse_transport(&or_default(cli.and_then(|c| c.transport.as_ref()), "tcp"))
                .context("config: client.transport")?,
            dial_timeout: if dial_ms == 0 {
                Duration::from_secs(5)
            } else {
                Duration::from_millis(dial_ms as u64)
            },
            name: or_default(cli.and_then(|c| c.name.as_ref()), "brpc-client"),
            quic: QuicClientConfig {
                server_name: or_default(cquic.and_then(|q| q.server_name.as_ref()), ""),
                ca_file: or_default(cquic.and_then(|q| q.ca_file.as_ref()), ""),
                insecure_skip_verify: cquic.is_some_and(|q| q.insecure_skip_verify),
            },
        };

        let mut logging = LoggingConfig::default();
        if let Some(l) = &fc.logging {
            logging.level = or_default(l.level.as_ref(), &logging.level);
            logging.format = or_default(l.format.as_ref(), &logging.format).to_ascii_lowercase();
            logging.output = or_default(l.output.as_ref(), &logging.output);
            logging.add_source = l.add_source;
        }
        if !matches!(logging.format.as_str(), "text" | "json") {
            anyhow::bail!(
                "config: logging.format {:?} (expected text|json)",
                logging.format
            );
        }

        Ok(Config {
            server,
            client,
            admin_addr: fc.admin_addr.trim().to_string(),
            logging,
        })
    }
}

const DEFAULT_CONFIG_TOML: &str = r#"# brpc configuration (auto-generated)
#
# `brpc server` listens on [server].listen_addr; `brpc client` dials
# [client].server_addr and serves callbacks over the same connection.

admin_addr = ":9090"

[server]
listen_addr = ":7000"
transport = "tcp" # tcp | quic

# [server.quic]
# cert_file = "server.crt" # leave both empty for a throwaway self-signed cert
# key_file = "server.key"

[client]
server_addr = "127.0.0.1:7000"
transport = "tcp"
dial_timeout_ms = 5000
name = "brpc-client"

# [client.quic]
# server_name = "localhost"
# ca_file = "ca.crt" # trusted roots for the server certificate
# insecure_skip_verify = false

[logging]
level = "info"   # or any tracing filter, e.g. "info,brpc=debug"
format = "text"  # text | json
output = "stderr" # stderr | stdout | discard | /path/to/file.log
add_source = false
"#;

const DEFAULT_CONFIG_YAML: &str = r#"# brpc configuration (auto-generated)
#
# `brpc server` listens on server.listen_addr; `brpc client` dials
# client.server_addr and serves callbacks over the same connection.

admin_addr: ":9090"

server:
  listen_addr: ":7000"
  transport: "tcp" # tcp | quic

client:
  server_addr: "127.0.0.1:7000"
  transport: "tcp"
  dial_timeout_ms: 5000
  name: "brpc-client"

logging:
  level: "info"
  format: "text"
  output: "stderr"
  add_source: false
"#;
