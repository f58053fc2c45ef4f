//! Server-side asset resolution.
//!
//! The router answers "who has this identifier set": local stores first, in
//! configured order, then upstream peers. An upstream hit is wrapped as a
//! local [`Asset`] that forwards range reads over the upstream session and
//! releases the remote binding when dropped.

use std::{path::PathBuf, sync::Arc, time::Duration};

use parking_lot::RwLock;

use codec::message::{Identifier, Status};

use crate::{
    asset::{Asset, BoxReadFuture, ReadAsset, ReadReply},
    session::Session,
    store::{AssetStore, LinkError},
};

#[derive(Debug, Clone, Copy)]
pub struct RouterOptions {
    /// Peer-visible timeout used when probing upstreams for an asset.
    pub discovery_timeout: Duration,
    /// Budget for one forwarded range read.
    pub forward_read_timeout: Duration,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            discovery_timeout: Duration::from_millis(500),
            forward_read_timeout: Duration::from_secs(5),
        }
    }
}

/// One authenticated peer session used for forwarding misses.
#[derive(Clone)]
pub struct Upstream {
    pub name: String,
    pub session: Session,
}

pub struct Router {
    stores: Vec<Arc<dyn AssetStore>>,
    upstreams: RwLock<Vec<Upstream>>,
    options: RouterOptions,
}

impl Router {
    pub fn new(stores: Vec<Arc<dyn AssetStore>>) -> Arc<Self> {
        Self::with_options(stores, RouterOptions::default())
    }

    pub fn with_options(stores: Vec<Arc<dyn AssetStore>>, options: RouterOptions) -> Arc<Self> {
        Arc::new(Self {
            stores,
            upstreams: RwLock::new(Vec::new()),
            options,
        })
    }

    /// Append a forwarding target; misses are tried in insertion order.
    pub fn add_upstream(&self, name: impl Into<String>, session: Session) {
        self.upstreams.write().push(Upstream {
            name: name.into(),
            session,
        });
    }

    /// Locate an asset: local stores in order, then upstream peers. `None`
    /// when nobody has it.
    pub async fn find_asset(&self, ids: &[Identifier]) -> Option<Arc<dyn Asset>> {
        for store in &self.stores {
            if let Some(asset) = store.lookup(ids) {
                return Some(asset);
            }
        }

        let upstreams: Vec<Upstream> = self.upstreams.read().clone();
        for upstream in upstreams {
            if let Some(found) = self.open_upstream(&upstream, ids).await {
                return Some(Arc::new(found));
            }
        }

        None
    }

    /// Ingest a local file into the primary store, hashing it off-task.
    pub async fn link_asset(&self, path: PathBuf) -> Result<Arc<dyn Asset>, LinkError> {
        let Some(store) = self.stores.first().cloned() else {
            log::warn!("no store configured, cannot link {:?}", path);
            return Err(LinkError::UnsupportedFormat);
        };

        tokio::task::spawn_blocking(move || store.add_link(&path))
            .await
            .map_err(|_| LinkError::NotReadable)?
    }

    /// Bind toward one upstream and wait for its verdict. The bind's own
    /// refresh timer guarantees a decisive status update, so the wait is
    /// bounded by the discovery timeout.
    async fn open_upstream(&self, upstream: &Upstream, ids: &[Identifier]) -> Option<ForwardedAsset> {
        let mut asset = upstream
            .session
            .bind_read(ids.to_vec(), Some(self.options.discovery_timeout))
            .await
            .ok()?;

        let update = asset.next_status().await?;
        if update.status != Status::Success {
            log::debug!(
                "upstream {:?} answered {:?} for {:?}",
                upstream.name,
                update.status,
                ids
            );
            // Dropping the handle releases the upstream binding.
            return None;
        }

        let size = asset.size()?;
        log::debug!(
            "asset found upstream: peer={:?}, size={}",
            upstream.name,
            size
        );

        Some(ForwardedAsset {
            size,
            ids: asset.ids().to_vec(),
            read_timeout: self.options.forward_read_timeout,
            asset,
        })
    }
}

/// Upstream-proxy asset: reads forward verbatim over the upstream session.
struct ForwardedAsset {
    size: u64,
    ids: Vec<Identifier>,
    read_timeout: Duration,
    asset: ReadAsset,
}

impl Asset for ForwardedAsset {
    fn size(&self) -> u64 {
        self.size
    }

    fn ids(&self) -> Vec<Identifier> {
        self.ids.clone()
    }

    fn read(&self, offset: u64, size: u32) -> BoxReadFuture<'_> {
        Box::pin(async move {
            match self.asset.read(offset, size, self.read_timeout).await {
                Ok(reply) => reply,
                Err(err) => {
                    log::debug!("forwarded read failed: {}", err);
                    ReadReply::failed(Status::Disconnected)
                }
            }
        })
    }
}
