use super::{TransferItem, TransferJob};
use crate::client::ConnectionId;
use crate::connection::{ConnectionManager, PooledHandle};
use crate::error::ConnectionError;
use crate::watcher::Refresh;
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

/// Remote -> local.
pub struct DownloadJob {
    connections: ConnectionManager,
    remote: ConnectionId,
    refresher: Arc<dyn Refresh>,
    written: Mutex<BTreeSet<String>>,
}

impl DownloadJob {
    pub fn new(
        connections: ConnectionManager,
        remote: ConnectionId,
        refresher: Arc<dyn Refresh>,
    ) -> Self {
        Self {
            connections,
            remote,
            refresher,
            written: Mutex::new(BTreeSet::new()),
        }
    }
}

#[async_trait]
impl TransferJob for DownloadJob {
    fn source(&self) -> &ConnectionId {
        &self.remote
    }

    fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    async fn acquire(&self) -> Result<PooledHandle, ConnectionError> {
        self.connections.transmit(&self.remote).await
    }

    async fn exists(&self, _handle: &PooledHandle, destination: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(destination).await?)
    }

    async fn transfer(
        &self,
        handle: &PooledHandle,
        item: &TransferItem,
        destination: &str,
    ) -> Result<()> {
        let local_path = Path::new(destination);

        // Create parent directory if needed
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        self.written.lock().extend(item.touched_dirs());

        // Touch first so watchers see the file appear while it downloads.
        tokio::fs::File::create(local_path)
            .await
            .with_context(|| format!("creating {}", local_path.display()))?;

        handle.get(&item.source.path, local_path).await
    }

    async fn finalize(&self) {
        let written = std::mem::take(&mut *self.written.lock());
        for dir in written {
            self.refresher.refresh(&ConnectionId::Local, &dir).await;
        }
    }
}
