//! ## Asset session core
//!
//! Everything both sides of a connection share: the message-level
//! [`connection::Connection`], the per-peer [`session::Session`] state
//! machine with its binding and request tables, the consumer/producer asset
//! handles, and the server-side [`routing::Router`] that resolves inbound
//! binds against local stores and upstream peers.

pub mod asset;
pub mod connection;
pub mod handles;
pub mod routing;
pub mod session;
pub mod store;

pub use crate::{
    asset::{Asset, ReadAsset, ReadReply, StatusUpdate, UploadAsset},
    connection::StreamIo,
    routing::{Router, RouterOptions},
    session::{Session, SessionEvent, SessionOptions},
    store::{AssetStore, LinkError, MemoryStore},
};

/// Failures of local session operations. Remote failures arrive as
/// [`codec::message::Status`] values instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The session task is gone; the handle is stale.
    SessionClosed,
    /// No transport, or the binding vanished before the reply.
    Disconnected,
    /// The operation needs a live binding and there is none.
    NotBound,
    /// The outbound queue is at capacity; wait for writable and retry.
    QueueFull,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
