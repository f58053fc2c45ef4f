//! Local asset store surface.
//!
//! The session/router core only needs two operations from a store: a fast
//! identifier lookup and (possibly slow) link ingestion. How a store lays
//! content out is its own business.

use std::{path::Path, sync::Arc};

use bytes::Bytes;
use parking_lot::RwLock;

use codec::message::{Identifier, Status, overlaps};

use crate::asset::{Asset, BoxReadFuture, ReadReply};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// The path does not exist or cannot be opened for hashing.
    NotReadable,
    /// The path is not something this store can link (or the store does not
    /// ingest links at all).
    UnsupportedFormat,
}

impl std::error::Error for LinkError {}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A local content store.
///
/// `lookup` must be cheap: an index probe, no I/O beyond opening a file
/// handle. `add_link` may hash the whole file and is called off the session
/// task.
pub trait AssetStore: Send + Sync {
    fn lookup(&self, ids: &[Identifier]) -> Option<Arc<dyn Asset>>;

    fn add_link(&self, path: &Path) -> Result<Arc<dyn Asset>, LinkError>;
}

/// In-memory store of whole blobs, indexed by identifier.
///
/// # Test
///
/// ```
/// use bithorde_service::store::{AssetStore, MemoryStore};
/// use codec::message::{HashType, Identifier};
///
/// let store = MemoryStore::default();
/// let ids = vec![Identifier::new(HashType::SHA1, vec![0xaa; 20])];
/// store.insert(ids.clone(), &b"content"[..]);
///
/// let asset = store.lookup(&ids).unwrap();
/// assert_eq!(asset.size(), 7);
///
/// let other = vec![Identifier::new(HashType::SHA1, vec![0xbb; 20])];
/// assert!(store.lookup(&other).is_none());
/// ```
#[derive(Default)]
pub struct MemoryStore {
    assets: RwLock<Vec<Arc<BlobAsset>>>,
}

impl MemoryStore {
    pub fn insert(&self, ids: Vec<Identifier>, content: impl Into<Bytes>) {
        self.assets.write().push(Arc::new(BlobAsset {
            ids,
            content: content.into(),
        }));
    }

    pub fn is_empty(&self) -> bool {
        self.assets.read().is_empty()
    }
}

impl AssetStore for MemoryStore {
    fn lookup(&self, ids: &[Identifier]) -> Option<Arc<dyn Asset>> {
        self.assets
            .read()
            .iter()
            .find(|asset| overlaps(&asset.ids, ids))
            .map(|asset| asset.clone() as Arc<dyn Asset>)
    }

    fn add_link(&self, _path: &Path) -> Result<Arc<dyn Asset>, LinkError> {
        Err(LinkError::UnsupportedFormat)
    }
}

struct BlobAsset {
    ids: Vec<Identifier>,
    content: Bytes,
}

impl Asset for BlobAsset {
    fn size(&self) -> u64 {
        self.content.len() as u64
    }

    fn ids(&self) -> Vec<Identifier> {
        self.ids.clone()
    }

    fn read(&self, offset: u64, size: u32) -> BoxReadFuture<'_> {
        let reply = read_range(&self.content, offset, size);
        Box::pin(std::future::ready(reply))
    }
}

/// Range read over an in-memory blob, clamped to its end. Reads past the end
/// succeed with empty content, like reads at EOF.
pub(crate) fn read_range(content: &Bytes, offset: u64, size: u32) -> ReadReply {
    let start = (offset as usize).min(content.len());
    let end = start.saturating_add(size as usize).min(content.len());

    ReadReply {
        status: Status::Success,
        offset: start as u64,
        content: content.slice(start..end),
    }
}
