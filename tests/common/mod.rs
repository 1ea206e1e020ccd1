#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use ferryfs::client::local::LocalClient;
use ferryfs::client::{Capabilities, ClientFactory, ConnectionId, Credential, FileItem, FileSystem};
use ferryfs::config::{PoolConfig, Protocol};
use ferryfs::connection::ConnectionManager;
use ferryfs::error::ConnectionError;
use ferryfs::queue::QueueEvent;
use ferryfs::utils;
use ferryfs::watcher::Refresh;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
}

/// A remote server kept in memory. Every handle the factory hands out shares
/// the same tree, like sessions against one real server.
pub struct MemoryServer {
    tree: Mutex<BTreeMap<String, Node>>,
    handshake_delay: Mutex<Duration>,
    active: AtomicUsize,
    peak: AtomicUsize,
    created: AtomicUsize,
    closed: AtomicUsize,
    removed: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
}

impl MemoryServer {
    pub fn new() -> Arc<Self> {
        let mut tree = BTreeMap::new();
        tree.insert("/".to_string(), Node::Dir);
        Arc::new(Self {
            tree: Mutex::new(tree),
            handshake_delay: Mutex::new(Duration::ZERO),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
            removed: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
        })
    }

    pub fn set_handshake_delay(&self, delay: Duration) {
        *self.handshake_delay.lock() = delay;
    }

    pub fn add_dir(&self, path: &str) {
        let mut tree = self.tree.lock();
        let mut dir = path.to_string();
        while dir != "/" && !dir.is_empty() {
            tree.entry(dir.clone()).or_insert(Node::Dir);
            dir = utils::parent(&dir);
        }
    }

    pub fn add_file(&self, path: &str, size: usize) {
        self.add_dir(&utils::parent(path));
        self.tree
            .lock()
            .insert(path.to_string(), Node::File(vec![b'x'; size]));
    }

    pub fn exists(&self, path: &str) -> bool {
        self.tree.lock().contains_key(path)
    }

    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        match self.tree.lock().get(path) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    /// Every file and directory below `/`, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.tree
            .lock()
            .keys()
            .filter(|path| *path != "/")
            .cloned()
            .collect()
    }

    /// Makes `rm` of `path` fail from now on.
    pub fn fail_rm(&self, path: &str) {
        self.failing.lock().insert(path.to_string());
    }

    /// Successful removals, in order.
    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().clone()
    }

    /// Most handshakes ever in progress at once.
    pub fn peak_handshakes(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    fn children(tree: &BTreeMap<String, Node>, dir: &str) -> Vec<String> {
        tree.keys()
            .filter(|path| *path != "/" && utils::parent(path) == dir)
            .cloned()
            .collect()
    }

    fn subtree(tree: &BTreeMap<String, Node>, root: &str) -> Vec<String> {
        tree.keys()
            .filter(|path| *path == root || utils::is_descendant(path, root))
            .cloned()
            .collect()
    }

    fn require_dir(tree: &BTreeMap<String, Node>, path: &str) -> Result<()> {
        match tree.get(path) {
            Some(Node::Dir) => Ok(()),
            Some(Node::File(_)) => bail!("{}: not a directory", path),
            None => bail!("{}: no such directory", path),
        }
    }
}

pub struct MemoryFs {
    server: Arc<MemoryServer>,
    opened: AtomicBool,
}

impl MemoryFs {
    fn check_open(&self) -> Result<()> {
        if self.opened.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(anyhow!("not connected"))
        }
    }
}

#[async_trait]
impl FileSystem for MemoryFs {
    async fn open(&self) -> Result<()> {
        let server = &self.server;
        let now = server.active.fetch_add(1, Ordering::SeqCst) + 1;
        server.peak.fetch_max(now, Ordering::SeqCst);
        let delay = *server.handshake_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        server.active.fetch_sub(1, Ordering::SeqCst);
        self.opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.opened.swap(false, Ordering::SeqCst) {
            self.server.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            server_side_copy: true,
            rename: true,
            permissions: false,
        }
    }

    async fn pwd(&self) -> Result<String> {
        Ok("/".to_string())
    }

    async fn ls(&self, dir: &str) -> Result<Vec<FileItem>> {
        self.check_open()?;
        let tree = self.server.tree.lock();
        MemoryServer::require_dir(&tree, dir)?;
        Ok(MemoryServer::children(&tree, dir)
            .into_iter()
            .map(|path| match &tree[&path] {
                Node::Dir => FileItem::dir(&path),
                Node::File(data) => FileItem::file(&path, data.len() as u64),
            })
            .collect())
    }

    async fn get(&self, remote_path: &str, local_path: &Path) -> Result<()> {
        self.check_open()?;
        let data = self
            .server
            .read(remote_path)
            .ok_or_else(|| anyhow!("{}: no such file", remote_path))?;
        tokio::fs::write(local_path, data).await?;
        Ok(())
    }

    async fn put(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        self.check_open()?;
        let data = tokio::fs::read(local_path).await?;
        self.write(remote_path, &data).await
    }

    async fn rm(&self, path: &str, recursive: bool) -> Result<()> {
        self.check_open()?;
        if self.server.failing.lock().contains(path) {
            bail!("{}: permission denied", path);
        }
        let mut tree = self.server.tree.lock();
        if !tree.contains_key(path) {
            bail!("{}: no such file", path);
        }
        let subtree = MemoryServer::subtree(&tree, path);
        if subtree.len() > 1 && !recursive {
            bail!("{}: directory not empty", path);
        }
        for entry in subtree {
            tree.remove(&entry);
        }
        self.server.removed.lock().push(path.to_string());
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        self.check_open()?;
        let mut tree = self.server.tree.lock();
        if tree.contains_key(path) {
            bail!("{}: already exists", path);
        }
        MemoryServer::require_dir(&tree, &utils::parent(path))?;
        tree.insert(path.to_string(), Node::Dir);
        Ok(())
    }

    async fn mv(&self, from: &str, to: &str) -> Result<()> {
        self.check_open()?;
        let mut tree = self.server.tree.lock();
        MemoryServer::require_dir(&tree, &utils::parent(to))?;
        let moved = MemoryServer::subtree(&tree, from);
        if moved.is_empty() {
            bail!("{}: no such file", from);
        }
        for path in moved {
            if let Some(node) = tree.remove(&path) {
                let renamed = format!("{}{}", to, &path[from.len()..]);
                tree.insert(renamed, node);
            }
        }
        Ok(())
    }

    async fn cp(&self, from: &str, to: &str, recursive: bool) -> Result<()> {
        self.check_open()?;
        let mut tree = self.server.tree.lock();
        MemoryServer::require_dir(&tree, &utils::parent(to))?;
        let copied = MemoryServer::subtree(&tree, from);
        if copied.is_empty() {
            bail!("{}: no such file", from);
        }
        if copied.len() > 1 && !recursive {
            bail!("{}: is a directory", from);
        }
        for path in copied {
            let node = tree[&path].clone();
            tree.insert(format!("{}{}", to, &path[from.len()..]), node);
        }
        Ok(())
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        self.check_open()?;
        let mut tree = self.server.tree.lock();
        MemoryServer::require_dir(&tree, &utils::parent(path))?;
        tree.insert(path.to_string(), Node::File(content.to_vec()));
        Ok(())
    }
}

/// Remote ids are served from one [`MemoryServer`]; `Local` is the real disk.
pub struct MemoryFactory {
    pub server: Arc<MemoryServer>,
}

impl ClientFactory for MemoryFactory {
    fn create(
        &self,
        id: &ConnectionId,
        _credential: &Credential,
    ) -> Result<Arc<dyn FileSystem>, ConnectionError> {
        if id.is_local() {
            return Ok(Arc::new(LocalClient::new()));
        }
        self.server.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryFs {
            server: self.server.clone(),
            opened: AtomicBool::new(false),
        }))
    }
}

pub fn remote_id() -> ConnectionId {
    ConnectionId::remote(Protocol::Sftp, "alice", "files.example.com", 22)
}

pub fn manager(server: &Arc<MemoryServer>, config: PoolConfig) -> ConnectionManager {
    ConnectionManager::with_factory(
        config,
        Arc::new(MemoryFactory {
            server: server.clone(),
        }),
    )
}

/// A manager with [`remote_id`] already open.
pub async fn connected(server: &Arc<MemoryServer>, config: PoolConfig) -> ConnectionManager {
    let connections = manager(server, config);
    connections
        .open(&remote_id(), Credential::password("secret"))
        .await
        .unwrap();
    connections
}

/// Remembers every refresh, in order.
#[derive(Default)]
pub struct RecordingRefresh {
    calls: Mutex<Vec<String>>,
}

impl RecordingRefresh {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, path: &str) -> usize {
        self.calls.lock().iter().filter(|p| *p == path).count()
    }
}

#[async_trait]
impl Refresh for RecordingRefresh {
    async fn refresh(&self, _id: &ConnectionId, path: &str) {
        self.calls.lock().push(path.to_string());
    }
}

/// Drains events up to and including `Complete`.
pub async fn drain(rx: &mut mpsc::UnboundedReceiver<QueueEvent>) -> Vec<QueueEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("queue never completed")
            .expect("event channel closed early");
        let complete = event == QueueEvent::Complete;
        events.push(event);
        if complete {
            return events;
        }
    }
}

pub fn errors(events: &[QueueEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            QueueEvent::Error { path, .. } => Some(path.clone()),
            _ => None,
        })
        .collect()
}

pub fn conflicts(events: &[QueueEvent]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, QueueEvent::Conflict { .. }))
        .count()
}
