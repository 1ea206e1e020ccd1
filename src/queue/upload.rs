use super::{DirMaker, ListingCache, TransferItem, TransferJob};
use crate::client::ConnectionId;
use crate::connection::{ConnectionManager, PooledHandle};
use crate::error::ConnectionError;
use crate::watcher::Refresh;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

/// Local -> remote.
pub struct UploadJob {
    connections: ConnectionManager,
    local: ConnectionId,
    remote: ConnectionId,
    refresher: Arc<dyn Refresh>,
    dirs: DirMaker,
    listings: ListingCache,
    written: Mutex<BTreeSet<String>>,
}

impl UploadJob {
    pub fn new(
        connections: ConnectionManager,
        remote: ConnectionId,
        refresher: Arc<dyn Refresh>,
    ) -> Self {
        Self {
            connections,
            local: ConnectionId::Local,
            remote,
            refresher,
            dirs: DirMaker::default(),
            listings: ListingCache::default(),
            written: Mutex::new(BTreeSet::new()),
        }
    }
}

#[async_trait]
impl TransferJob for UploadJob {
    fn source(&self) -> &ConnectionId {
        &self.local
    }

    fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    async fn acquire(&self) -> Result<PooledHandle, ConnectionError> {
        self.connections.transmit(&self.remote).await
    }

    async fn exists(&self, handle: &PooledHandle, destination: &str) -> Result<bool> {
        Ok(self.listings.exists(handle, destination).await)
    }

    async fn transfer(
        &self,
        handle: &PooledHandle,
        item: &TransferItem,
        destination: &str,
    ) -> Result<()> {
        self.dirs.ensure(handle, &item.dest_dir, &item.dirs).await;
        self.written.lock().extend(item.touched_dirs());

        handle.put(Path::new(&item.source.path), destination).await?;
        self.listings.insert(destination);
        Ok(())
    }

    async fn finalize(&self) {
        let written = std::mem::take(&mut *self.written.lock());
        for dir in written {
            self.refresher.refresh(&self.remote, &dir).await;
        }
    }
}
