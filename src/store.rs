//! Link-backed local store.
//!
//! Keeps an in-memory index from identifier to linked file. Files are hashed
//! once, at startup scan or on a link request; reads open the file and pull
//! the requested range.

use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
    sync::Arc,
};

use ahash::AHashMap;
use anyhow::Result;
use parking_lot::RwLock;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use codec::message::{HashType, Identifier, Status};
use service::{
    AssetStore, LinkError,
    asset::{Asset, BoxReadFuture, ReadReply},
};

pub struct LinkStore {
    index: RwLock<AHashMap<Identifier, Arc<LinkedAsset>>>,
}

impl LinkStore {
    /// An empty store that only grows through link requests.
    pub fn empty() -> Self {
        Self {
            index: RwLock::new(AHashMap::new()),
        }
    }

    /// Open a store over a directory, hashing and linking every regular file
    /// under it.
    pub fn open(root: &Path) -> Result<Self> {
        let store = Self::empty();
        store.scan(root)?;

        log::info!(
            "store {:?} serving {} linked assets",
            root,
            store.assets()
        );
        Ok(store)
    }

    /// Number of indexed identifiers.
    pub fn assets(&self) -> usize {
        self.index.read().len()
    }

    fn scan(&self, dir: &Path) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let kind = entry.file_type()?;

            if kind.is_dir() {
                self.scan(&path)?;
            } else if kind.is_file() {
                if let Err(err) = self.add_link(&path) {
                    log::warn!("skipping {:?}: {}", path, err);
                }
            }
        }

        Ok(())
    }
}

impl AssetStore for LinkStore {
    fn lookup(&self, ids: &[Identifier]) -> Option<Arc<dyn Asset>> {
        let index = self.index.read();
        ids.iter()
            .find_map(|id| index.get(id))
            .map(|asset| asset.clone() as Arc<dyn Asset>)
    }

    fn add_link(&self, path: &Path) -> Result<Arc<dyn Asset>, LinkError> {
        let meta = fs::metadata(path).map_err(|_| LinkError::NotReadable)?;
        if !meta.is_file() {
            return Err(LinkError::UnsupportedFormat);
        }

        let mut file = fs::File::open(path).map_err(|_| LinkError::NotReadable)?;
        let mut hasher = Sha1::new();
        let mut block = [0u8; 64 * 1024];
        loop {
            let read = file.read(&mut block).map_err(|_| LinkError::NotReadable)?;
            if read == 0 {
                break;
            }

            hasher.update(&block[..read]);
        }

        let ids = vec![Identifier::new(
            HashType::SHA1,
            hasher.finalize().to_vec(),
        )];

        let asset = Arc::new(LinkedAsset {
            size: meta.len(),
            path: path.to_path_buf(),
            ids: ids.clone(),
        });

        let mut index = self.index.write();
        for id in ids {
            index.insert(id, asset.clone());
        }

        log::info!("linked {:?}, {} bytes", path, meta.len());
        Ok(asset)
    }
}

struct LinkedAsset {
    size: u64,
    path: PathBuf,
    ids: Vec<Identifier>,
}

impl Asset for LinkedAsset {
    fn size(&self) -> u64 {
        self.size
    }

    fn ids(&self) -> Vec<Identifier> {
        self.ids.clone()
    }

    fn read(&self, offset: u64, size: u32) -> BoxReadFuture<'_> {
        Box::pin(async move {
            let offset = offset.min(self.size);
            let want = (size as u64).min(self.size - offset) as usize;

            let Ok(mut file) = tokio::fs::File::open(&self.path).await else {
                return ReadReply::failed(Status::Error);
            };

            if file.seek(std::io::SeekFrom::Start(offset)).await.is_err() {
                return ReadReply::failed(Status::Error);
            }

            let mut content = vec![0u8; want];
            let mut filled = 0;
            while filled < want {
                match file.read(&mut content[filled..]).await {
                    // The linked file shrank underneath us.
                    Ok(0) => break,
                    Ok(read) => filled += read,
                    Err(_) => return ReadReply::failed(Status::Error),
                }
            }
            content.truncate(filled);

            ReadReply {
                status: Status::Success,
                offset,
                content: content.into(),
            }
        })
    }
}
