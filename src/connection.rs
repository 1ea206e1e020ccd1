//! Connection manager.
//!
//! Every endpoint gets one refcounted *shared* handle used for listings and
//! metadata, plus a pool of exclusive handles lent out for transfers. Pool
//! state lives behind a `parking_lot` mutex that is never held across an await.

use crate::client::{
    Capabilities, ClientFactory, ConnectionId, Credential, DefaultClientFactory, FileItem,
    FileSystem,
};
use crate::config::PoolConfig;
use crate::error::ConnectionError;
use crate::refcount::RefCountMap;
use anyhow::anyhow;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type CloseHook = Arc<dyn Fn(&ConnectionId) + Send + Sync>;
type OpenResult = Result<Capabilities, String>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub busy: usize,
    pub connecting: usize,
    pub waiters: usize,
}

enum SlotState {
    Busy,
    Idle {
        timer: Option<JoinHandle<()>>,
        epoch: u64,
    },
}

struct Slot {
    handle: Arc<dyn FileSystem>,
    state: SlotState,
}

struct EndpointPool {
    credential: Option<Credential>,
    limit: Option<usize>,
    slots: BTreeMap<u64, Slot>,
    connecting: usize,
    waiters: VecDeque<oneshot::Sender<PooledHandle>>,
    epoch: u64,
}

impl EndpointPool {
    fn new(limit: Option<usize>) -> Self {
        Self {
            credential: None,
            limit,
            slots: BTreeMap::new(),
            connecting: 0,
            waiters: VecDeque::new(),
            epoch: 0,
        }
    }

    fn has_capacity(&self) -> bool {
        self.limit
            .map_or(true, |limit| self.slots.len() + self.connecting < limit)
    }

    /// Marks the first idle handle busy and cancels its close timer.
    fn take_idle(&mut self) -> Option<(u64, Arc<dyn FileSystem>)> {
        let (pool_id, slot) = self
            .slots
            .iter_mut()
            .find(|(_, slot)| matches!(slot.state, SlotState::Idle { .. }))?;
        if let SlotState::Idle {
            timer: Some(timer), ..
        } = std::mem::replace(&mut slot.state, SlotState::Busy)
        {
            timer.abort();
        }
        Some((*pool_id, slot.handle.clone()))
    }

    fn take_expired(&mut self, pool_id: u64, epoch: u64) -> Option<Arc<dyn FileSystem>> {
        match self.slots.get(&pool_id) {
            Some(Slot {
                state: SlotState::Idle { epoch: armed, .. },
                ..
            }) if *armed == epoch => self.slots.remove(&pool_id).map(|slot| slot.handle),
            _ => None,
        }
    }

    /// Tears the pool down, returning the idle handles for closing. Busy
    /// handles are closed by their guards; queued waiters see their sender drop.
    fn into_idle(self) -> Vec<Arc<dyn FileSystem>> {
        self.slots
            .into_values()
            .filter_map(|slot| match slot.state {
                SlotState::Idle { timer, .. } => {
                    if let Some(timer) = timer {
                        timer.abort();
                    }
                    Some(slot.handle)
                }
                SlotState::Busy => None,
            })
            .collect()
    }

    fn stats(&self) -> PoolStats {
        let idle = self
            .slots
            .values()
            .filter(|slot| matches!(slot.state, SlotState::Idle { .. }))
            .count();
        PoolStats {
            idle,
            busy: self.slots.len() - idle,
            connecting: self.connecting,
            waiters: self.waiters.len(),
        }
    }
}

#[derive(Default)]
struct State {
    shared: RefCountMap<ConnectionId, Arc<dyn FileSystem>>,
    opening: HashMap<ConnectionId, Vec<oneshot::Sender<OpenResult>>>,
    endpoints: HashMap<ConnectionId, EndpointPool>,
}

impl State {
    fn drop_if_unused(&mut self, id: &ConnectionId) {
        let unused = self
            .endpoints
            .get(id)
            .is_some_and(|pool| pool.slots.is_empty() && pool.connecting == 0);
        if unused && !self.shared.has(id) && !self.opening.contains_key(id) {
            self.endpoints.remove(id);
        }
    }
}

struct Inner {
    config: PoolConfig,
    factory: Arc<dyn ClientFactory>,
    startups: Semaphore,
    next_pool_id: AtomicU64,
    state: Mutex<State>,
    on_close: Mutex<Option<CloseHook>>,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl ConnectionManager {
    pub fn new(config: PoolConfig) -> Self {
        Self::with_factory(config, Arc::new(DefaultClientFactory))
    }

    pub fn with_factory(config: PoolConfig, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                factory,
                startups: Semaphore::new(config.max_startups.max(1)),
                next_pool_id: AtomicU64::new(1),
                state: Mutex::new(State::default()),
                on_close: Mutex::new(None),
            }),
        }
    }

    /// Called with the id whenever a connection goes away or turns out to need
    /// credentials again.
    pub fn set_close_hook(&self, hook: impl Fn(&ConnectionId) + Send + Sync + 'static) {
        *self.inner.on_close.lock() = Some(Arc::new(hook));
    }

    /// Opens (or takes another reference on) the shared handle for `id`.
    /// Concurrent first opens share one handshake and each hold a reference.
    pub async fn open(
        &self,
        id: &ConnectionId,
        credential: Credential,
    ) -> Result<Capabilities, ConnectionError> {
        let (tx, rx) = oneshot::channel();
        let leader = {
            let mut state = self.inner.state.lock();
            if state.shared.inc(id) > 0 {
                debug!(id = %id, count = state.shared.count(id), "reusing shared connection");
                return Ok(state
                    .shared
                    .get(id)
                    .map(|handle| handle.capabilities())
                    .unwrap_or_default());
            }

            if let Some(waiters) = state.opening.get_mut(id) {
                waiters.push(tx);
                None
            } else {
                let handle = self.inner.factory.create(id, &credential)?;
                let limit = self.inner.config.max_connections;
                state
                    .endpoints
                    .entry(id.clone())
                    .or_insert_with(|| EndpointPool::new(limit))
                    .credential = Some(credential);
                state.opening.insert(id.clone(), vec![tx]);
                Some(handle)
            }
        };

        if let Some(handle) = leader {
            info!(id = %id, "connecting");
            let inner = self.inner.clone();
            let id = id.clone();
            tokio::spawn(async move { inner.finish_open(id, handle).await });
        }

        match rx.await {
            Ok(Ok(capabilities)) => Ok(capabilities),
            Ok(Err(reason)) => Err(ConnectionError::Handshake {
                id: id.clone(),
                source: anyhow!(reason),
            }),
            Err(_) => Err(ConnectionError::Unavailable(id.clone())),
        }
    }

    /// Drops one reference. The last one closes the shared handle and every
    /// idle pooled handle and fails queued waiters.
    pub async fn close(&self, id: &ConnectionId) {
        let released = {
            let mut state = self.inner.state.lock();
            if !state.shared.has(id) {
                debug!(id = %id, "close for a connection that is not open");
                return;
            }
            state.shared.dec(id).map(|shared| {
                let idle = state
                    .endpoints
                    .remove(id)
                    .map(EndpointPool::into_idle)
                    .unwrap_or_default();
                (shared, idle)
            })
        };

        let Some((shared, idle)) = released else {
            return;
        };
        info!(id = %id, idle = idle.len(), "closing connection");
        close_quietly(&shared).await;
        for handle in idle {
            close_quietly(&handle).await;
        }
        self.inner.fire_close_hook(id);
    }

    pub fn is_open(&self, id: &ConnectionId) -> bool {
        self.inner.state.lock().shared.has(id)
    }

    /// The shared handle for `id`. The local filesystem needs no `open`.
    pub fn shared(&self, id: &ConnectionId) -> Result<Arc<dyn FileSystem>, ConnectionError> {
        if let Some(handle) = self.inner.state.lock().shared.get(id) {
            return Ok(handle.clone());
        }
        if id.is_local() {
            return self.inner.factory.create(id, &Credential::None);
        }
        Err(ConnectionError::NotConnected(id.clone()))
    }

    /// Lists `path` over the shared handle, filling in each item's URI.
    pub async fn list(&self, id: &ConnectionId, path: &str) -> anyhow::Result<Vec<FileItem>> {
        let handle = self.shared(id)?;
        let mut items = handle.ls(path).await?;
        for item in &mut items {
            item.uri = Some(id.uri(&item.path));
        }
        Ok(items)
    }

    /// Borrows an exclusive handle for one transfer. Waits in FIFO order when
    /// the endpoint's pool is at its limit.
    pub async fn transmit(&self, id: &ConnectionId) -> Result<PooledHandle, ConnectionError> {
        if id.is_local() {
            let handle = self.inner.factory.create(id, &Credential::None)?;
            return Ok(PooledHandle::unpooled(handle));
        }

        enum Next {
            Ready(PooledHandle),
            Establish(Arc<dyn FileSystem>),
            Wait(oneshot::Receiver<PooledHandle>),
            NeedsAuthentication,
        }

        let next = {
            let mut state = self.inner.state.lock();
            let Some(pool) = state.endpoints.get_mut(id) else {
                return Err(ConnectionError::NotConnected(id.clone()));
            };
            if let Some((pool_id, handle)) = pool.take_idle() {
                debug!(id = %id, pool_id, "reusing idle pooled connection");
                Next::Ready(PooledHandle::pooled(
                    self.inner.clone(),
                    id.clone(),
                    pool_id,
                    handle,
                ))
            } else if let Some(credential) = pool.credential.clone() {
                if pool.has_capacity() {
                    let handle = self.inner.factory.create(id, &credential)?;
                    pool.connecting += 1;
                    Next::Establish(handle)
                } else {
                    let (tx, rx) = oneshot::channel();
                    pool.waiters.push_back(tx);
                    debug!(id = %id, waiters = pool.waiters.len(), "pool exhausted, queueing");
                    Next::Wait(rx)
                }
            } else {
                Next::NeedsAuthentication
            }
        };

        match next {
            Next::Ready(handle) => Ok(handle),
            Next::NeedsAuthentication => {
                self.inner.fire_close_hook(id);
                Err(ConnectionError::NeedsAuthentication(id.clone()))
            }
            Next::Wait(rx) => rx
                .await
                .map_err(|_| ConnectionError::Unavailable(id.clone())),
            Next::Establish(handle) => {
                // Spawned so an abandoned caller still settles the pool:
                // the finished guard is dropped by the runtime and released.
                let inner = self.inner.clone();
                let task_id = id.clone();
                tokio::spawn(async move { inner.establish_pooled(task_id, handle).await })
                    .await
                    .map_err(|_| ConnectionError::Unavailable(id.clone()))?
            }
        }
    }

    pub fn set_pool_limit(&self, id: &ConnectionId, limit: Option<usize>) {
        let mut state = self.inner.state.lock();
        state
            .endpoints
            .entry(id.clone())
            .or_insert_with(|| EndpointPool::new(limit))
            .limit = limit;
    }

    /// Drops the stored credential; the next pooled connect will report
    /// `NeedsAuthentication` instead of retrying.
    pub fn forget_credentials(&self, id: &ConnectionId) {
        if let Some(pool) = self.inner.state.lock().endpoints.get_mut(id) {
            pool.credential = None;
        }
    }

    pub fn pool_stats(&self, id: &ConnectionId) -> PoolStats {
        self.inner
            .state
            .lock()
            .endpoints
            .get(id)
            .map(EndpointPool::stats)
            .unwrap_or_default()
    }
}

impl Inner {
    async fn handshake(&self, handle: &Arc<dyn FileSystem>) -> anyhow::Result<()> {
        let _permit = self.startups.acquire().await?;
        handle.open().await
    }

    async fn finish_open(self: Arc<Self>, id: ConnectionId, handle: Arc<dyn FileSystem>) {
        let result = self.handshake(&handle).await;

        let (holders, failure) = {
            let mut state = self.state.lock();
            let waiters = state.opening.remove(&id).unwrap_or_default();
            match result {
                Ok(()) => {
                    let capabilities = handle.capabilities();
                    let mut holders = 0;
                    for tx in waiters {
                        if tx.send(Ok(capabilities)).is_ok() {
                            if holders == 0 {
                                state.shared.set(id.clone(), handle.clone());
                            } else {
                                state.shared.inc(&id);
                            }
                            holders += 1;
                        }
                    }
                    if holders == 0 {
                        state.drop_if_unused(&id);
                    }
                    (holders, None)
                }
                Err(err) => {
                    let reason = format!("{:#}", err);
                    for tx in waiters {
                        let _ = tx.send(Err(reason.clone()));
                    }
                    state.drop_if_unused(&id);
                    (0, Some(reason))
                }
            }
        };

        match failure {
            Some(reason) => warn!(id = %id, error = %reason, "handshake failed"),
            None if holders == 0 => {
                debug!(id = %id, "every opener went away, closing");
                close_quietly(&handle).await;
            }
            None => info!(id = %id, holders, "connected"),
        }
    }

    async fn establish_pooled(
        self: Arc<Self>,
        id: ConnectionId,
        handle: Arc<dyn FileSystem>,
    ) -> Result<PooledHandle, ConnectionError> {
        let result = self.handshake(&handle).await;
        let reason = result.as_ref().err().map(|err| format!("{:#}", err));

        enum Outcome {
            Ready(PooledHandle),
            Gone,
            Failed,
        }

        let outcome = {
            let mut state = self.state.lock();
            match state.endpoints.get_mut(&id) {
                None => Outcome::Gone,
                Some(pool) => {
                    pool.connecting = pool.connecting.saturating_sub(1);
                    if result.is_ok() {
                        let pool_id = self.next_pool_id.fetch_add(1, Ordering::SeqCst);
                        pool.slots.insert(
                            pool_id,
                            Slot {
                                handle: handle.clone(),
                                state: SlotState::Busy,
                            },
                        );
                        debug!(id = %id, pool_id, size = pool.slots.len(), "pooled connection established");
                        Outcome::Ready(PooledHandle::pooled(
                            self.clone(),
                            id.clone(),
                            pool_id,
                            handle.clone(),
                        ))
                    } else if let Some((pool_id, idle)) = pool.take_idle() {
                        Outcome::Ready(PooledHandle::pooled(self.clone(), id.clone(), pool_id, idle))
                    } else {
                        if pool.slots.is_empty() && pool.connecting == 0 {
                            // Nothing will ever release into these.
                            pool.waiters.clear();
                        }
                        Outcome::Failed
                    }
                }
            }
        };

        if let Some(reason) = &reason {
            warn!(id = %id, error = %reason, "pooled connection failed");
        }
        match outcome {
            Outcome::Ready(guard) => Ok(guard),
            Outcome::Gone => {
                if result.is_ok() {
                    close_quietly(&handle).await;
                }
                Err(ConnectionError::NotConnected(id))
            }
            Outcome::Failed => Err(ConnectionError::Unavailable(id)),
        }
    }

    fn release(self: &Arc<Self>, id: &ConnectionId, pool_id: u64, handle: Arc<dyn FileSystem>) {
        let mut state = self.state.lock();
        let owned = state
            .endpoints
            .get(id)
            .is_some_and(|pool| pool.slots.contains_key(&pool_id));
        if !owned {
            drop(state);
            debug!(id = %id, pool_id, "released handle no longer pooled, closing");
            spawn_close(handle);
            return;
        }
        let Some(pool) = state.endpoints.get_mut(id) else {
            return;
        };

        while let Some(waiter) = pool.waiters.pop_front() {
            let guard = PooledHandle::pooled(self.clone(), id.clone(), pool_id, handle.clone());
            match waiter.send(guard) {
                Ok(()) => {
                    debug!(id = %id, pool_id, "handed pooled connection to waiter");
                    return;
                }
                Err(guard) => guard.disarm(),
            }
        }

        pool.epoch += 1;
        let epoch = pool.epoch;
        let timer = tokio::runtime::Handle::try_current().ok().map(|runtime| {
            let weak: Weak<Inner> = Arc::downgrade(self);
            let id = id.clone();
            let idle_timeout = self.config.idle_timeout();
            runtime.spawn(async move {
                tokio::time::sleep(idle_timeout).await;
                if let Some(inner) = weak.upgrade() {
                    inner.evict(&id, pool_id, epoch).await;
                }
            })
        });
        if let Some(slot) = pool.slots.get_mut(&pool_id) {
            slot.state = SlotState::Idle { timer, epoch };
        }
    }

    async fn evict(&self, id: &ConnectionId, pool_id: u64, epoch: u64) {
        let expired = self
            .state
            .lock()
            .endpoints
            .get_mut(id)
            .and_then(|pool| pool.take_expired(pool_id, epoch));
        if let Some(handle) = expired {
            debug!(id = %id, pool_id, "closing idle pooled connection");
            close_quietly(&handle).await;
        }
    }

    fn fire_close_hook(&self, id: &ConnectionId) {
        let hook = self.on_close.lock().clone();
        if let Some(hook) = hook {
            hook(id);
        }
    }
}

async fn close_quietly(handle: &Arc<dyn FileSystem>) {
    if let Err(e) = handle.close().await {
        debug!(error = %e, "close failed");
    }
}

fn spawn_close(handle: Arc<dyn FileSystem>) {
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(async move { close_quietly(&handle).await });
    }
}

struct Owner {
    inner: Arc<Inner>,
    id: ConnectionId,
    pool_id: u64,
}

/// An exclusive handle on loan from the pool. Dropping it returns the handle.
pub struct PooledHandle {
    handle: Arc<dyn FileSystem>,
    owner: Option<Owner>,
}

impl PooledHandle {
    fn pooled(inner: Arc<Inner>, id: ConnectionId, pool_id: u64, handle: Arc<dyn FileSystem>) -> Self {
        Self {
            handle,
            owner: Some(Owner { inner, id, pool_id }),
        }
    }

    /// A handle outside any pool (local disk); releasing it does nothing.
    pub fn unpooled(handle: Arc<dyn FileSystem>) -> Self {
        Self {
            handle,
            owner: None,
        }
    }

    pub fn pool_id(&self) -> Option<u64> {
        self.owner.as_ref().map(|owner| owner.pool_id)
    }

    pub fn handle(&self) -> Arc<dyn FileSystem> {
        self.handle.clone()
    }

    pub fn release(self) {}

    fn disarm(mut self) {
        self.owner = None;
    }
}

impl Deref for PooledHandle {
    type Target = dyn FileSystem;

    fn deref(&self) -> &Self::Target {
        self.handle.as_ref()
    }
}

impl Drop for PooledHandle {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner
                .inner
                .release(&owner.id, owner.pool_id, self.handle.clone());
        }
    }
}

impl fmt::Debug for PooledHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.owner {
            Some(owner) => f
                .debug_struct("PooledHandle")
                .field("id", &owner.id)
                .field("pool_id", &owner.pool_id)
                .finish(),
            None => f.write_str("PooledHandle(unpooled)"),
        }
    }
}
