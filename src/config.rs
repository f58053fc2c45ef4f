use std::{fs::read_to_string, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Server {
    ///
    /// tcp listener
    ///
    /// Address and port the node accepts peer and client connections on.
    /// Omit (set to nothing) to disable the tcp listener.
    ///
    #[serde(default = "Server::tcp_listen")]
    pub tcp_listen: Option<SocketAddr>,
    ///
    /// local stream socket
    ///
    /// Filesystem path of the local listener, for clients on the same host.
    /// A stale socket file is removed before binding.
    ///
    #[serde(default = "Server::local_socket")]
    pub local_socket: Option<PathBuf>,
}

impl Server {
    fn tcp_listen() -> Option<SocketAddr> {
        Some("0.0.0.0:1337".parse().unwrap())
    }

    fn local_socket() -> Option<PathBuf> {
        Some(PathBuf::from("/tmp/bithorde"))
    }
}

impl Default for Server {
    fn default() -> Self {
        Self {
            tcp_listen: Self::tcp_listen(),
            local_socket: Self::local_socket(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "kebab-case")]
pub struct Bind {
    ///
    /// default bind timeout
    ///
    /// Peer-visible timeout carried on every bind request, in milliseconds.
    ///
    #[serde(default = "Bind::timeout_ms")]
    pub timeout_ms: u32,
    ///
    /// status refresh multiplier
    ///
    /// The local status-refresh timer fires at timeout-ms times this factor.
    ///
    #[serde(default = "Bind::refresh_multiplier")]
    pub refresh_multiplier: u32,
}

impl Bind {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms as u64)
    }

    fn timeout_ms() -> u32 {
        500
    }

    fn refresh_multiplier() -> u32 {
        2
    }
}

impl Default for Bind {
    fn default() -> Self {
        Self {
            timeout_ms: Self::timeout_ms(),
            refresh_multiplier: Self::refresh_multiplier(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "kebab-case")]
pub struct Routing {
    ///
    /// upstream discovery timeout
    ///
    /// Bind timeout used when probing upstream peers for an asset missing
    /// from every local store, in milliseconds.
    ///
    #[serde(default = "Routing::discovery_timeout_ms")]
    pub discovery_timeout_ms: u32,
    ///
    /// forwarded read timeout
    ///
    /// Budget for one range read proxied to an upstream, in milliseconds.
    ///
    #[serde(default = "Routing::forward_read_timeout_ms")]
    pub forward_read_timeout_ms: u32,
}

impl Routing {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms as u64)
    }

    pub fn forward_read_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_read_timeout_ms as u64)
    }

    fn discovery_timeout_ms() -> u32 {
        500
    }

    fn forward_read_timeout_ms() -> u32 {
        5000
    }
}

impl Default for Routing {
    fn default() -> Self {
        Self {
            discovery_timeout_ms: Self::discovery_timeout_ms(),
            forward_read_timeout_ms: Self::forward_read_timeout_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Storage {
    ///
    /// store directory
    ///
    /// Every regular file under it is hashed and served at startup; link
    /// requests add more. Stores are probed in configuration order.
    ///
    pub path: PathBuf,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Upstream {
    ///
    /// peer name, for logs only; the authoritative name arrives in its
    /// handshake.
    ///
    pub name: String,
    ///
    /// where to reach the peer: "host:port", or an absolute socket path.
    ///
    pub address: String,
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    ///
    /// node name
    ///
    /// Announced to every peer in the handshake.
    ///
    #[serde(default = "Config::name")]
    pub name: String,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub bind: Bind,
    #[serde(default)]
    pub routing: Routing,
    #[serde(default)]
    pub storage: Vec<Storage>,
    #[serde(default)]
    pub upstream: Vec<Upstream>,
    #[serde(default)]
    pub log: Log,
}

impl Config {
    fn name() -> String {
        "bithorde".to_string()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: Self::name(),
            server: Server::default(),
            bind: Bind::default(),
            routing: Routing::default(),
            storage: Vec::new(),
            upstream: Vec::new(),
            log: Log::default(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: bithorded --config /etc/bithorde/config.toml
    ///
    #[arg(long, short)]
    config: String,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    pub fn load() -> Result<Self> {
        Ok(toml::from_str::<Self>(&read_to_string(
            &Cli::parse().config,
        )?)?)
    }
}
