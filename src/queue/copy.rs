//! Same-endpoint copy, move and duplicate.

use super::{ConflictAction, DirMaker, ListingCache, TransferItem, TransferJob};
use crate::client::ConnectionId;
use crate::connection::{ConnectionManager, PooledHandle};
use crate::error::ConnectionError;
use crate::utils;
use crate::watcher::Refresh;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    Copy,
    Move,
    /// Copy next to the source as `name copy`, `name copy 2`, ...
    Duplicate,
}

pub struct CopyJob {
    connections: ConnectionManager,
    id: ConnectionId,
    mode: CopyMode,
    refresher: Arc<dyn Refresh>,
    dirs: DirMaker,
    listings: ListingCache,
    written: Mutex<BTreeSet<String>>,
    /// Source directories a move may have emptied.
    emptied: Mutex<BTreeSet<String>>,
    source_parents: Mutex<BTreeSet<String>>,
}

impl CopyJob {
    pub fn new(
        connections: ConnectionManager,
        id: ConnectionId,
        mode: CopyMode,
        refresher: Arc<dyn Refresh>,
    ) -> Self {
        Self {
            connections,
            id,
            mode,
            refresher,
            dirs: DirMaker::default(),
            listings: ListingCache::default(),
            written: Mutex::new(BTreeSet::new()),
            emptied: Mutex::new(BTreeSet::new()),
            source_parents: Mutex::new(BTreeSet::new()),
        }
    }

    /// First `name copy N` not present in `taken`.
    fn copy_target(name: &str, taken: &mut HashSet<String>) -> String {
        let mut n = 1;
        loop {
            let candidate = utils::copy_name(name, n);
            if taken.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }

    async fn remove_emptied(&self) {
        let mut emptied: Vec<String> = std::mem::take(&mut *self.emptied.lock())
            .into_iter()
            .collect();
        if emptied.is_empty() {
            return;
        }
        emptied.sort_by_key(|dir| std::cmp::Reverse(dir.matches('/').count()));

        let handle = match self.connections.transmit(&self.id).await {
            Ok(handle) => handle,
            Err(e) => {
                debug!(id = %self.id, error = %e, "no handle to clean up moved directories");
                return;
            }
        };
        for dir in emptied {
            // Still holding something we didn't move (skipped conflicts, failures).
            if let Err(e) = handle.rm(&dir, false).await {
                debug!(path = %dir, error = %e, "left source directory in place");
            }
        }
    }
}

#[async_trait]
impl TransferJob for CopyJob {
    fn source(&self) -> &ConnectionId {
        &self.id
    }

    fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    async fn prepare(&self, items: &mut Vec<TransferItem>) {
        if self.mode != CopyMode::Duplicate {
            return;
        }

        let mut taken: HashMap<String, HashSet<String>> = HashMap::new();
        let mut renamed: HashMap<String, String> = HashMap::new();
        for item in items.iter_mut() {
            let root = item.source_root();
            let parent = utils::parent(&root);
            item.dest_dir = parent.clone();

            if !renamed.contains_key(&root) {
                if !taken.contains_key(&parent) {
                    let names = match self.connections.list(&self.id, &parent).await {
                        Ok(listing) => listing.into_iter().map(|entry| entry.name).collect(),
                        Err(_) => HashSet::new(),
                    };
                    taken.insert(parent.clone(), names);
                }
                let names = taken.entry(parent).or_default();
                let target = Self::copy_target(utils::basename(&root), names);
                renamed.insert(root.clone(), target);
            }

            let Some(target) = renamed.get(&root) else {
                continue;
            };
            match item.dirs.first_mut() {
                Some(first) => *first = target.clone(),
                None => item.target_name = target.clone(),
            }
        }
    }

    async fn acquire(&self) -> Result<PooledHandle, ConnectionError> {
        self.connections.transmit(&self.id).await
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

        match self.mode {
            CopyMode::Move => {
                handle.mv(&item.source.path, destination).await?;
                let root = item.source_root();
                let mut emptied = self.emptied.lock();
                let mut dir = utils::parent(&item.source.path);
                for _ in 0..item.dirs.len() {
                    emptied.insert(dir.clone());
                    dir = utils::parent(&dir);
                }
                self.source_parents.lock().insert(utils::parent(&root));
            }
            CopyMode::Copy | CopyMode::Duplicate => {
                handle.cp(&item.source.path, destination, false).await?;
            }
        }
        self.listings.insert(destination);
        Ok(())
    }

    async fn finalize(&self) {
        if self.mode == CopyMode::Move {
            self.remove_emptied().await;
        }

        let mut refresh = std::mem::take(&mut *self.written.lock());
        refresh.append(&mut self.source_parents.lock());
        for dir in refresh {
            self.refresher.refresh(&self.id, &dir).await;
        }
    }

    fn default_action(&self) -> Option<ConflictAction> {
        match self.mode {
            CopyMode::Duplicate => Some(ConflictAction::Rename),
            _ => None,
        }
    }
}
