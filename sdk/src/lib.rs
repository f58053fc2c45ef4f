//! # Bithorde client SDK
//!
//! Connects to a node over TCP (`host:port`) or a local stream socket (an
//! absolute path), keeps the session alive with capped exponential
//! reconnects, and exposes the bind/read/upload surface of the protocol.
//!
//! ```no_run
//! use bithorde_sdk::{Client, ClientOptions};
//! use codec::message::{HashType, Identifier};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let client = Client::connect("/tmp/bithorde", ClientOptions::default()).await?;
//!
//! let ids = vec![Identifier::new(HashType::TREE_TIGER, vec![0xaa; 24])];
//! let mut asset = client.bind_read(ids).await?;
//!
//! let status = asset.next_status().await;
//! println!("bind answered: {:?}", status);
//! # Ok(())
//! # }
//! ```

use std::{path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use tokio::{
    io::AsyncReadExt,
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{sleep, timeout},
};

#[cfg(unix)]
use tokio::net::UnixStream;

use codec::message::{Identifier, Status};
use service::{ReadAsset, Session, SessionEvent, SessionOptions, StreamIo, UploadAsset};

/// Chunk size for streamed uploads.
pub const UPLOAD_BLOCK_SIZE: usize = 64 * 1024;

/// Where a node listens: `host:port`, or an absolute socket path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Local(PathBuf),
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "{}", addr),
            Endpoint::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug)]
pub struct EndpointParseError(String);

impl std::error::Error for EndpointParseError {}

impl std::fmt::Display for EndpointParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "not host:port or an absolute path: {:?}", self.0)
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.starts_with('/') {
            return Ok(Endpoint::Local(PathBuf::from(value)));
        }

        if value.rsplit_once(':').is_some_and(|(host, port)| {
            !host.is_empty() && port.parse::<u16>().is_ok()
        }) {
            return Ok(Endpoint::Tcp(value.to_string()));
        }

        Err(EndpointParseError(value.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Name announced to the peer in the handshake.
    pub name: String,
    /// Default peer-visible bind timeout.
    pub bind_timeout: Duration,
    pub refresh_multiplier: u32,
    /// Redial after transport loss; live read bindings are re-announced on
    /// every new handshake.
    pub reconnect: bool,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub handshake_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            name: "bhclient".to_string(),
            bind_timeout: Duration::from_millis(500),
            refresh_multiplier: 2,
            reconnect: true,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// One supervised session toward a node.
pub struct Client {
    session: Session,
    peer: watch::Receiver<Option<String>>,
    handshake_timeout: Duration,
    supervisor: JoinHandle<()>,
}

impl Client {
    /// Start dialing in the background. Use [`Client::wait_authenticated`]
    /// (or [`Client::connect`]) to block on the first handshake.
    pub fn new(endpoint: Endpoint, options: ClientOptions) -> Client {
        let (session, events) = Session::spawn(SessionOptions {
            name: options.name.clone(),
            bind_timeout: options.bind_timeout,
            refresh_multiplier: options.refresh_multiplier,
            resolver: None,
        });

        let (peer_tx, peer_rx) = watch::channel(None);
        let handshake_timeout = options.handshake_timeout;
        let supervisor = tokio::spawn(supervise(
            session.clone(),
            events,
            endpoint,
            peer_tx,
            options,
        ));

        Client {
            session,
            peer: peer_rx,
            handshake_timeout,
            supervisor,
        }
    }

    /// Parse, dial, and wait for the peer's handshake.
    pub async fn connect(endpoint: &str, options: ClientOptions) -> Result<Client> {
        let client = Client::new(endpoint.parse()?, options);
        client.wait_authenticated().await?;
        Ok(client)
    }

    /// Peer name from the current handshake, if the session is up.
    pub fn peer_name(&self) -> Option<String> {
        self.peer.borrow().clone()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn wait_authenticated(&self) -> Result<String> {
        let mut peer = self.peer.clone();

        timeout(self.handshake_timeout, async move {
            loop {
                if let Some(name) = peer.borrow_and_update().clone() {
                    return Ok(name);
                }

                peer.changed()
                    .await
                    .map_err(|_| anyhow!("session closed"))?;
            }
        })
        .await
        .context("timed out waiting for handshake")?
    }

    /// Bind a read asset by identifier set, with the default bind timeout.
    pub async fn bind_read(&self, ids: Vec<Identifier>) -> Result<ReadAsset> {
        Ok(self.session.bind_read(ids, None).await?)
    }

    /// Bind an upload of `size` streamed bytes.
    pub async fn upload(&self, size: u64) -> Result<UploadAsset> {
        Ok(self.session.bind_write(size, None).await?)
    }

    /// Ask the node to link a file local to it.
    pub async fn link(&self, path: impl Into<String>) -> Result<UploadAsset> {
        Ok(self.session.bind_write(0, Some(path.into())).await?)
    }

    /// Upload a local file by streaming, returning the identifiers the node
    /// hashed it under.
    pub async fn upload_file(&self, path: impl Into<PathBuf>) -> Result<Vec<Identifier>> {
        let path = path.into();
        let mut file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("opening {:?}", path))?;
        let size = file.metadata().await?.len();

        let mut asset = self.upload(size).await?;
        match asset.next_status().await {
            Some(update) if update.status == Status::Success => {}
            other => anyhow::bail!("upload bind refused: {:?}", other.map(|u| u.status)),
        }

        // The peer may answer link-style with identifiers straight away.
        if !asset.ids().is_empty() {
            return Ok(asset.ids().to_vec());
        }

        let mut offset = 0u64;
        let mut block = vec![0u8; UPLOAD_BLOCK_SIZE];
        loop {
            let read = file.read(&mut block).await?;
            if read == 0 {
                break;
            }

            asset
                .write(offset, Bytes::copy_from_slice(&block[..read]))
                .await?;
            offset += read as u64;
        }

        // Hashing finishes server-side; the final status carries the ids.
        match asset.next_status().await {
            Some(update) if update.status == Status::Success && !update.ids.is_empty() => {
                Ok(update.ids)
            }
            other => anyhow::bail!("upload failed: {:?}", other.map(|u| u.status)),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

async fn dial(endpoint: &Endpoint) -> std::io::Result<Box<dyn StreamIo>> {
    match endpoint {
        Endpoint::Tcp(addr) => Ok(Box::new(TcpStream::connect(addr).await?)),
        #[cfg(unix)]
        Endpoint::Local(path) => Ok(Box::new(UnixStream::connect(path).await?)),
        #[cfg(not(unix))]
        Endpoint::Local(_) => Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "local stream sockets are unix-only",
        )),
    }
}

async fn supervise(
    session: Session,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    endpoint: Endpoint,
    peer: watch::Sender<Option<String>>,
    options: ClientOptions,
) {
    loop {
        // (Re)dial with capped exponential backoff.
        let mut backoff = options.initial_backoff;
        loop {
            match dial(&endpoint).await {
                Ok(stream) => match session.attach(stream).await {
                    Ok(()) => break,
                    Err(_) => return,
                },
                Err(err) => {
                    log::warn!("dialing {} failed: {}", endpoint, err);
                    if !options.reconnect {
                        return;
                    }

                    sleep(backoff).await;
                    backoff = (backoff * 2).min(options.max_backoff);
                }
            }
        }

        // Consume session events until the transport goes away.
        loop {
            match events.recv().await {
                Some(SessionEvent::Authenticated { peer: name }) => {
                    log::info!("connected to {:?} via {}", name, endpoint);
                    peer.send_replace(Some(name));
                }
                Some(SessionEvent::Disconnected) => {
                    log::info!("lost connection to {}", endpoint);
                    peer.send_replace(None);
                    break;
                }
                None => return,
            }
        }

        if !options.reconnect {
            return;
        }

        sleep(options.initial_backoff).await;
    }
}
