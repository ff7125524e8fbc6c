//! Subscription registry and sync hub.
//!
//! Many clients watching the same resource share one poll task. Each tick
//! fetches the resource once, rebuilds the view of every distinct user among
//! the watchers, and pushes a view only to its own watchers and only when its
//! canonical form changed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use sheetsync_augment::{AugmentationError, AugmentationProvider};
use sheetsync_core::{
    enrich, AugmentationColumn, ClientId, EnrichedSnapshot, RawSnapshot, ResourceId, ServerEvent, UserId,
};
use sheetsync_storage::{ResourceFetcher, UpstreamError};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_CLIENT_BUFFER: usize = 64;

const INITIAL_FETCH_FAILED: &str = "Failed to fetch resource data";

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub poll_interval: Duration,
    pub client_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            client_buffer: DEFAULT_CLIENT_BUFFER,
        }
    }
}

impl HubConfig {
    pub fn from_env() -> Self {
        Self {
            poll_interval: std::env::var("SHEETSYNC_POLL_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_POLL_INTERVAL),
            client_buffer: std::env::var("SHEETSYNC_CLIENT_BUFFER")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .map(|n| n.max(1))
                .unwrap_or(DEFAULT_CLIENT_BUFFER),
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("client {0} is no longer connected")]
pub struct ClientGone(pub ClientId);

/// Outgoing side of one client connection.
pub trait ClientHandle: Send + Sync {
    fn id(&self) -> ClientId;
    fn send(&self, event: ServerEvent) -> Result<(), ClientGone>;
}

/// Client handle backed by a bounded channel drained by the transport.
///
/// When the buffer is full the event is dropped for this client only.
#[derive(Debug, Clone)]
pub struct ChannelClient {
    id: ClientId,
    tx: mpsc::Sender<ServerEvent>,
}

impl ChannelClient {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: ClientId::new(),
                tx,
            },
            rx,
        )
    }
}

impl ClientHandle for ChannelClient {
    fn id(&self) -> ClientId {
        self.id
    }

    fn send(&self, event: ServerEvent) -> Result<(), ClientGone> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(client_id = %self.id, event_type = event.event_type(), "client buffer full; event dropped");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ClientGone(self.id)),
        }
    }
}

/// Which augmentation layer a watcher sees: its user, or none for anonymous clients.
pub type ViewKey = Option<UserId>;

#[derive(Clone)]
pub struct Watcher {
    pub handle: Arc<dyn ClientHandle>,
    pub user_id: ViewKey,
}

/// Recurring poll task of one group. Dropping it aborts the task.
#[derive(Debug)]
pub struct PollTask {
    id: u64,
    handle: JoinHandle<()>,
}

impl PollTask {
    pub fn new(id: u64, handle: JoinHandle<()>) -> Self {
        Self { id, handle }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for PollTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Default)]
struct Group {
    watchers: HashMap<ClientId, Watcher>,
    poll_task: Option<PollTask>,
    last_raw: Option<Arc<RawSnapshot>>,
    last_broadcast: HashMap<ViewKey, EnrichedSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    pub is_first_watcher: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub is_last_watcher: bool,
}

/// Process-wide state of every actively watched resource.
///
/// Each call is atomic on its own; sequences of calls for one resource are
/// serialized by the hub's per-resource gate.
#[derive(Default)]
pub struct Registry {
    groups: Mutex<HashMap<ResourceId, Group>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-joining replaces the client's watcher, dropping its previous view if nobody else holds it.
    pub fn join(&self, resource_id: &ResourceId, watcher: Watcher) -> JoinOutcome {
        let mut groups = self.groups.lock();
        let is_first_watcher = !groups.contains_key(resource_id);
        let group = groups.entry(resource_id.clone()).or_default();
        if let Some(previous) = group.watchers.insert(watcher.handle.id(), watcher) {
            if !group.watchers.values().any(|w| w.user_id == previous.user_id) {
                group.last_broadcast.remove(&previous.user_id);
            }
        }
        JoinOutcome { is_first_watcher }
    }

    /// Leaving an unknown client or resource is a no-op.
    pub fn leave(&self, resource_id: &ResourceId, client_id: ClientId) -> LeaveOutcome {
        let mut groups = self.groups.lock();
        let Some(group) = groups.get_mut(resource_id) else {
            return LeaveOutcome { is_last_watcher: false };
        };
        let Some(removed) = group.watchers.remove(&client_id) else {
            return LeaveOutcome { is_last_watcher: false };
        };
        if !group.watchers.values().any(|w| w.user_id == removed.user_id) {
            group.last_broadcast.remove(&removed.user_id);
        }
        LeaveOutcome {
            is_last_watcher: group.watchers.is_empty(),
        }
    }

    /// Replaces any previous task. A task for an untracked resource is aborted immediately.
    pub fn set_poll_task(&self, resource_id: &ResourceId, task: PollTask) {
        if let Some(group) = self.groups.lock().get_mut(resource_id) {
            group.poll_task = Some(task);
        }
    }

    pub fn cancel_poll_task(&self, resource_id: &ResourceId) {
        let task = self
            .groups
            .lock()
            .get_mut(resource_id)
            .and_then(|g| g.poll_task.take());
        drop(task);
    }

    pub fn has_poll_task(&self, resource_id: &ResourceId) -> bool {
        self.groups
            .lock()
            .get(resource_id)
            .is_some_and(|g| g.poll_task.is_some())
    }

    pub fn is_current_poll_task(&self, resource_id: &ResourceId, task_id: u64) -> bool {
        self.groups
            .lock()
            .get(resource_id)
            .and_then(|g| g.poll_task.as_ref())
            .is_some_and(|t| t.id == task_id)
    }

    pub fn last_broadcast(&self, resource_id: &ResourceId, view: &ViewKey) -> Option<EnrichedSnapshot> {
        self.groups
            .lock()
            .get(resource_id)
            .and_then(|g| g.last_broadcast.get(view).cloned())
    }

    pub fn set_last_broadcast(&self, resource_id: &ResourceId, view: ViewKey, snapshot: EnrichedSnapshot) {
        if let Some(group) = self.groups.lock().get_mut(resource_id) {
            group.last_broadcast.insert(view, snapshot);
        }
    }

    pub fn last_raw(&self, resource_id: &ResourceId) -> Option<Arc<RawSnapshot>> {
        self.groups
            .lock()
            .get(resource_id)
            .and_then(|g| g.last_raw.clone())
    }

    pub fn set_last_raw(&self, resource_id: &ResourceId, raw: Arc<RawSnapshot>) {
        if let Some(group) = self.groups.lock().get_mut(resource_id) {
            group.last_raw = Some(raw);
        }
    }

    pub fn remove_group(&self, resource_id: &ResourceId) {
        let removed = self.groups.lock().remove(resource_id);
        drop(removed);
    }

    /// Distinct views among the current watchers of a resource.
    pub fn views(&self, resource_id: &ResourceId) -> Vec<ViewKey> {
        let groups = self.groups.lock();
        let Some(group) = groups.get(resource_id) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        group
            .watchers
            .values()
            .filter(|w| seen.insert(w.user_id.clone()))
            .map(|w| w.user_id.clone())
            .collect()
    }

    pub fn watchers_of_view(&self, resource_id: &ResourceId, view: &ViewKey) -> Vec<Arc<dyn ClientHandle>> {
        self.groups
            .lock()
            .get(resource_id)
            .map(|g| {
                g.watchers
                    .values()
                    .filter(|w| &w.user_id == view)
                    .map(|w| w.handle.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn resources_watched_by(&self, client_id: ClientId) -> Vec<ResourceId> {
        self.groups
            .lock()
            .iter()
            .filter(|(_, g)| g.watchers.contains_key(&client_id))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn is_tracked(&self, resource_id: &ResourceId) -> bool {
        self.groups.lock().contains_key(resource_id)
    }

    pub fn watcher_count(&self, resource_id: &ResourceId) -> usize {
        self.groups
            .lock()
            .get(resource_id)
            .map_or(0, |g| g.watchers.len())
    }

    pub fn group_count(&self) -> usize {
        self.groups.lock().len()
    }
}

struct HubInner {
    registry: Registry,
    fetcher: Arc<dyn ResourceFetcher>,
    augmentation: Arc<dyn AugmentationProvider>,
    gates: Mutex<HashMap<ResourceId, Arc<AsyncMutex<()>>>>,
    config: HubConfig,
    next_task_id: AtomicU64,
}

/// Orchestrates subscriptions, polling and fan-out. Cheap to clone.
#[derive(Clone)]
pub struct SyncHub {
    inner: Arc<HubInner>,
}

impl SyncHub {
    pub fn new(
        fetcher: Arc<dyn ResourceFetcher>,
        augmentation: Arc<dyn AugmentationProvider>,
        config: HubConfig,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                registry: Registry::new(),
                fetcher,
                augmentation,
                gates: Mutex::new(HashMap::new()),
                config,
                next_task_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Join the resource's group and push one snapshot to `client`.
    ///
    /// The first watcher triggers an upstream fetch and starts the group's
    /// poll task; later watchers are served from the group's last snapshot.
    /// If the initial fetch fails the client receives an `error` event, its
    /// join is rolled back and no poll task is started.
    pub async fn subscribe(
        &self,
        resource_id: ResourceId,
        client: Arc<dyn ClientHandle>,
        user_id: Option<UserId>,
    ) -> Result<(), UpstreamError> {
        let inner = &self.inner;
        let user_id = user_id.filter(|u| !u.as_str().is_empty());
        let client_id = client.id();
        let gate = inner.gate(&resource_id);
        let serialized = gate.lock().await;

        let columns = inner
            .columns_for(&resource_id, user_id.as_ref())
            .await
            .unwrap_or_else(|err| {
                warn!(resource_id = %resource_id, error = %err, "augmentation lookup failed; subscribing without columns");
                Vec::new()
            });
        let joined = inner.registry.join(
            &resource_id,
            Watcher {
                handle: client.clone(),
                user_id: user_id.clone(),
            },
        );
        info!(
            resource_id = %resource_id,
            client_id = %client_id,
            user_id = ?user_id,
            first_watcher = joined.is_first_watcher,
            columns = columns.len(),
            "client subscribed"
        );

        let snapshot = match inner.registry.last_raw(&resource_id) {
            Some(raw) if !joined.is_first_watcher => inner.view_for_joiner(&resource_id, &raw, user_id, &columns),
            _ => match inner.fetcher.fetch(&resource_id).await {
                Ok(raw) => {
                    let view = enrich(&raw, &columns);
                    inner.registry.set_last_raw(&resource_id, raw);
                    inner.registry.set_last_broadcast(&resource_id, user_id, view.clone());
                    view
                }
                Err(err) => {
                    warn!(resource_id = %resource_id, client_id = %client_id, error = %err, "initial fetch failed");
                    if client.send(ServerEvent::error(INITIAL_FETCH_FAILED)).is_err() {
                        debug!(client_id = %client_id, "client gone before error delivery");
                    }
                    inner.release_watcher(&resource_id, client_id);
                    drop(serialized);
                    drop(gate);
                    inner.prune_gates();
                    return Err(err);
                }
            },
        };

        if client.send(ServerEvent::Snapshot(snapshot)).is_err() {
            debug!(client_id = %client_id, "client gone before initial snapshot");
        }
        if !inner.registry.has_poll_task(&resource_id) {
            inner.start_polling(&resource_id);
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, resource_id: &ResourceId, client_id: ClientId) {
        let inner = &self.inner;
        let gate = inner.gate(resource_id);
        let serialized = gate.lock().await;
        inner.release_watcher(resource_id, client_id);
        drop(serialized);
        drop(gate);
        inner.prune_gates();
    }

    /// Leave every group the client is watching.
    ///
    /// Groups are left concurrently, so a resource stuck in an upstream read
    /// only delays leaving that one group.
    pub async fn disconnect(&self, client_id: ClientId) {
        let resources = self.inner.registry.resources_watched_by(client_id);
        join_all(
            resources
                .iter()
                .map(|resource_id| self.unsubscribe(resource_id, client_id)),
        )
        .await;
        info!(client_id = %client_id, groups = resources.len(), "client disconnected");
    }
}

impl HubInner {
    fn gate(&self, resource_id: &ResourceId) -> Arc<AsyncMutex<()>> {
        self.gates
            .lock()
            .entry(resource_id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Forget every gate nobody holds or waits on. A dropped gate is recreated on next use.
    fn prune_gates(&self) {
        self.gates.lock().retain(|_, gate| Arc::strong_count(gate) > 1);
    }

    #[cfg(test)]
    fn gate_count(&self) -> usize {
        self.gates.lock().len()
    }

    async fn columns_for(
        &self,
        resource_id: &ResourceId,
        user_id: Option<&UserId>,
    ) -> Result<Vec<AugmentationColumn>, AugmentationError> {
        match user_id {
            Some(user_id) => self.augmentation.list_columns(resource_id, user_id).await,
            None => Ok(Vec::new()),
        }
    }

    /// Snapshot for a client joining an already-polled group, without an upstream fetch.
    fn view_for_joiner(
        &self,
        resource_id: &ResourceId,
        raw: &RawSnapshot,
        view: ViewKey,
        columns: &[AugmentationColumn],
    ) -> EnrichedSnapshot {
        match self.registry.last_broadcast(resource_id, &view) {
            Some(existing) if existing.reflects_columns(columns) => existing,
            // Other watchers of this view still hold the stored snapshot; the
            // next tick reconciles them.
            Some(_) => enrich(raw, columns),
            None => {
                let fresh = enrich(raw, columns);
                self.registry.set_last_broadcast(resource_id, view, fresh.clone());
                fresh
            }
        }
    }

    fn release_watcher(&self, resource_id: &ResourceId, client_id: ClientId) {
        let left = self.registry.leave(resource_id, client_id);
        debug!(resource_id = %resource_id, client_id = %client_id, last = left.is_last_watcher, "client left group");
        if left.is_last_watcher {
            self.registry.cancel_poll_task(resource_id);
            self.registry.remove_group(resource_id);
            info!(resource_id = %resource_id, "stopped polling; no active watchers");
        }
    }

    fn start_polling(self: &Arc<Self>, resource_id: &ResourceId) {
        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let period = self.config.poll_interval;
        let hub: Weak<HubInner> = Arc::downgrade(self);
        let polled = resource_id.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(hub) = hub.upgrade() else {
                    break;
                };
                if !hub.poll_tick(&polled, task_id).await {
                    hub.prune_gates();
                    break;
                }
            }
        });

        self.registry.set_poll_task(resource_id, PollTask::new(task_id, handle));
        info!(resource_id = %resource_id, task_id, interval_ms = period.as_millis() as u64, "started polling");
    }

    /// One re-fetch-and-compare cycle. Returns false once the task is no longer current.
    async fn poll_tick(&self, resource_id: &ResourceId, task_id: u64) -> bool {
        let gate = self.gate(resource_id);
        let _serialized = gate.lock().await;
        if !self.registry.is_current_poll_task(resource_id, task_id) {
            debug!(resource_id = %resource_id, task_id, "stale poll task exiting");
            return false;
        }

        let raw = match self.fetcher.fetch(resource_id).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(resource_id = %resource_id, error = %err, "poll fetch failed; retrying next interval");
                return true;
            }
        };

        for view in self.registry.views(resource_id) {
            let columns = match self.columns_for(resource_id, view.as_ref()).await {
                Ok(columns) => columns,
                Err(err) => {
                    warn!(resource_id = %resource_id, user_id = ?view, error = %err, "augmentation lookup failed; view skipped this tick");
                    continue;
                }
            };
            let next = enrich(&raw, &columns);
            let changed = self
                .registry
                .last_broadcast(resource_id, &view)
                .map_or(true, |prev| !prev.same_content(&next));
            if !changed {
                continue;
            }

            let targets = self.registry.watchers_of_view(resource_id, &view);
            info!(
                resource_id = %resource_id,
                user_id = ?view,
                fingerprint = %next.fingerprint().unwrap_or_default(),
                watchers = targets.len(),
                "snapshot changed; broadcasting"
            );
            self.registry.set_last_broadcast(resource_id, view, next.clone());
            for client in targets {
                if let Err(gone) = client.send(ServerEvent::Snapshot(next.clone())) {
                    debug!(resource_id = %resource_id, error = %gone, "skipping disconnected watcher");
                }
            }
        }

        self.registry.set_last_raw(resource_id, raw);
        true
    }
}
