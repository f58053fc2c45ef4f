//! Asset handles on both sides of the wire.
//!
//! [`ReadAsset`] and [`UploadAsset`] are the consumer and producer handles a
//! session hands to user code; all of their state transitions go through the
//! owning session task. [`Asset`] is the server-side read contract a bound
//! handle serves from, whether the bytes come from a local store or an
//! upstream peer.

use std::{future::Future, pin::Pin, time::Duration};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};

use codec::message::{Identifier, Status};

use crate::{Error, session::Command};

/// Completion of one read: what the peer (or store) answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReply {
    pub status: Status,
    pub offset: u64,
    pub content: Bytes,
}

impl ReadReply {
    pub fn failed(status: Status) -> Self {
        Self {
            status,
            offset: 0,
            content: Bytes::new(),
        }
    }
}

pub type BoxReadFuture<'a> = Pin<Box<dyn Future<Output = ReadReply> + Send + 'a>>;

/// Server-side asset surface: a passive capability of known size answering
/// range reads. One instance is owned per live served binding; dropping it
/// releases whatever backs it.
pub trait Asset: Send + Sync {
    fn size(&self) -> u64;

    /// Every identifier this asset is known under.
    fn ids(&self) -> Vec<Identifier>;

    fn read(&self, offset: u64, size: u32) -> BoxReadFuture<'_>;
}

/// Session-scoped key naming one bound asset across its whole life. Wire
/// handles can be re-assigned on reconnect; the key never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AssetKey(pub(crate) u64);

/// One status delivery for a bound asset: the peer's answer to a bind, a
/// synthesized timeout, or the disconnect notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: Status,
    pub size: Option<u64>,
    pub ids: Vec<Identifier>,
    /// Wire handle the binding currently occupies; `None` once unbound.
    pub handle: Option<u32>,
}

/// Consumer handle into a remote asset.
///
/// Created by `Session::bind_read`. Status updates arrive on an event stream
/// ([`ReadAsset::next_status`]); the first `Success` carries size and the
/// peer's full identifier set. Dropping the handle releases the binding.
pub struct ReadAsset {
    key: AssetKey,
    ids: Vec<Identifier>,
    size: Option<u64>,
    handle: Option<u32>,
    status: mpsc::UnboundedReceiver<StatusUpdate>,
    commands: mpsc::Sender<Command>,
    writable: watch::Receiver<u64>,
    released: bool,
}

impl ReadAsset {
    pub(crate) fn new(
        key: AssetKey,
        ids: Vec<Identifier>,
        status: mpsc::UnboundedReceiver<StatusUpdate>,
        commands: mpsc::Sender<Command>,
        writable: watch::Receiver<u64>,
    ) -> Self {
        Self {
            key,
            ids,
            size: None,
            handle: None,
            status,
            commands,
            writable,
            released: false,
        }
    }

    pub fn ids(&self) -> &[Identifier] {
        &self.ids
    }

    /// Size reported by the peer, known after the first `Success` status.
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Wire handle as of the last status update; `None` while unbound.
    pub fn handle(&self) -> Option<u32> {
        self.handle
    }

    pub fn is_bound(&self) -> bool {
        self.handle.is_some()
    }

    /// Await the next status delivery. `None` once the binding is gone and
    /// no further callbacks will fire.
    pub async fn next_status(&mut self) -> Option<StatusUpdate> {
        let update = self.status.recv().await?;

        if update.status == Status::Success {
            if update.size.is_some() {
                self.size = update.size;
            }
            if !update.ids.is_empty() {
                self.ids = update.ids.clone();
            }
        }
        self.handle = update.handle;

        Some(update)
    }

    /// Re-issue the bind, e.g. after a synthesized `Timeout` status.
    pub async fn rebind(&self) -> Result<(), Error> {
        self.commands
            .send(Command::Rebind { key: self.key })
            .await
            .map_err(|_| Error::SessionClosed)
    }

    /// One ranged read. Waits for outbound queue capacity when the
    /// connection is congested.
    pub async fn read(&self, offset: u64, size: u32, timeout: Duration) -> Result<ReadReply, Error> {
        loop {
            let mut writable = self.writable.clone();
            let (reply_tx, reply_rx) = oneshot::channel();

            self.commands
                .send(Command::Read {
                    key: self.key,
                    offset,
                    size,
                    timeout,
                    reply: reply_tx,
                })
                .await
                .map_err(|_| Error::SessionClosed)?;

            match reply_rx.await.map_err(|_| Error::Disconnected)? {
                Err(Error::QueueFull) => {
                    let _ = writable.changed().await;
                }
                result => return result,
            }
        }
    }

    /// Start the release handshake. The handle stays reserved until the peer
    /// acknowledges (or the session disconnects).
    pub async fn release(mut self) {
        self.released = true;
        let _ = self.commands.send(Command::Release { key: self.key }).await;
    }
}

impl Drop for ReadAsset {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.commands.try_send(Command::Release { key: self.key });
        }
    }
}

/// Producer handle for an upload toward the peer.
///
/// Either streams `size` bytes of data segments after the peer accepts the
/// bind, or names a server-local path for link-mode ingestion. The peer's
/// final `Success` status carries the hashed identifiers.
pub struct UploadAsset {
    key: AssetKey,
    size: u64,
    link: Option<String>,
    ids: Vec<Identifier>,
    status: mpsc::UnboundedReceiver<StatusUpdate>,
    commands: mpsc::Sender<Command>,
    writable: watch::Receiver<u64>,
    released: bool,
}

impl UploadAsset {
    pub(crate) fn new(
        key: AssetKey,
        size: u64,
        link: Option<String>,
        status: mpsc::UnboundedReceiver<StatusUpdate>,
        commands: mpsc::Sender<Command>,
        writable: watch::Receiver<u64>,
    ) -> Self {
        Self {
            key,
            size,
            link,
            ids: Vec::new(),
            status,
            commands,
            writable,
            released: false,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn link(&self) -> Option<&str> {
        self.link.as_deref()
    }

    /// Identifiers learned from the peer, empty until it reports them.
    pub fn ids(&self) -> &[Identifier] {
        &self.ids
    }

    pub async fn next_status(&mut self) -> Option<StatusUpdate> {
        let update = self.status.recv().await?;

        if update.status == Status::Success && !update.ids.is_empty() {
            self.ids = update.ids.clone();
        }

        Some(update)
    }

    /// Stream one data segment, waiting for queue capacity as the connection
    /// reports writable.
    pub async fn write(&self, offset: u64, content: Bytes) -> Result<(), Error> {
        loop {
            let mut writable = self.writable.clone();
            let (reply_tx, reply_rx) = oneshot::channel();

            self.commands
                .send(Command::WriteSegment {
                    key: self.key,
                    offset,
                    content: content.clone(),
                    reply: reply_tx,
                })
                .await
                .map_err(|_| Error::SessionClosed)?;

            match reply_rx.await.map_err(|_| Error::Disconnected)? {
                Err(Error::QueueFull) => {
                    let _ = writable.changed().await;
                }
                result => return result,
            }
        }
    }

    pub async fn release(mut self) {
        self.released = true;
        let _ = self.commands.send(Command::Release { key: self.key }).await;
    }
}

impl Drop for UploadAsset {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.commands.try_send(Command::Release { key: self.key });
        }
    }
}

