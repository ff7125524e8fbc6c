use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sheetsync_augment::{
    AugmentationError, AugmentationProvider, CellEdit, InMemoryAugmentationStore, ValueGrid,
};
use sheetsync_core::{
    AugmentationColumn, CellValue, EnrichedSnapshot, RawSnapshot, ResourceId, Row, ServerEvent, UserId,
};
use sheetsync_hub::{ChannelClient, ClientHandle, HubConfig, SyncHub};
use sheetsync_storage::{ResourceFetcher, UpstreamError};
use tokio::sync::{mpsc, Semaphore};

const INTERVAL: Duration = Duration::from_secs(5);

struct ScriptedFetcher {
    next: Mutex<Option<RawSnapshot>>,
    stalled: Mutex<HashSet<ResourceId>>,
    fetches: AtomicUsize,
}

impl ScriptedFetcher {
    fn serving(amount: &str) -> Arc<Self> {
        Arc::new(Self {
            next: Mutex::new(Some(budget(amount))),
            stalled: Mutex::new(HashSet::new()),
            fetches: AtomicUsize::new(0),
        })
    }

    fn serve(&self, amount: &str) {
        *self.next.lock() = Some(budget(amount));
    }

    /// Later reads of `resource_id` never complete.
    fn stall(&self, resource_id: &ResourceId) {
        self.stalled.lock().insert(resource_id.clone());
    }

    fn fail(&self) {
        *self.next.lock() = None;
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceFetcher for ScriptedFetcher {
    async fn fetch(&self, resource_id: &ResourceId) -> Result<Arc<RawSnapshot>, UpstreamError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let stalled = self.stalled.lock().contains(resource_id);
        if stalled {
            std::future::pending::<()>().await;
        }
        tokio::task::yield_now().await;
        self.next
            .lock()
            .clone()
            .map(Arc::new)
            .ok_or_else(|| UpstreamError::EmptyResource(resource_id.clone()))
    }
}

fn budget(amount: &str) -> RawSnapshot {
    let row: Row = [
        ("Item".to_string(), CellValue::from("rent")),
        ("Amount".to_string(), CellValue::from(amount)),
    ]
    .into_iter()
    .collect();
    RawSnapshot::new("Budget", "Sheet1", vec!["Item".into(), "Amount".into()], vec![row])
        .expect("valid snapshot")
}

/// In-memory columns whose lookups for one user wait until a permit is released.
struct StallingAugmentation {
    store: InMemoryAugmentationStore,
    stalled_user: UserId,
    release: Semaphore,
}

#[async_trait]
impl AugmentationProvider for StallingAugmentation {
    async fn list_columns(
        &self,
        resource_id: &ResourceId,
        user_id: &UserId,
    ) -> Result<Vec<AugmentationColumn>, AugmentationError> {
        if *user_id == self.stalled_user {
            if let Ok(permit) = self.release.acquire().await {
                permit.forget();
            }
        }
        self.store.list_columns(resource_id, user_id).await
    }

    async fn add_column(
        &self,
        resource_id: &ResourceId,
        user_id: &UserId,
        name: &str,
        data_type: &str,
    ) -> Result<AugmentationColumn, AugmentationError> {
        self.store.add_column(resource_id, user_id, name, data_type).await
    }

    async fn list_values(
        &self,
        resource_id: &ResourceId,
        user_id: &UserId,
    ) -> Result<ValueGrid, AugmentationError> {
        self.store.list_values(resource_id, user_id).await
    }

    async fn save_value(
        &self,
        resource_id: &ResourceId,
        user_id: &UserId,
        edit: &CellEdit,
    ) -> Result<(), AugmentationError> {
        self.store.save_value(resource_id, user_id, edit).await
    }
}

struct Fixture {
    hub: SyncHub,
    fetcher: Arc<ScriptedFetcher>,
    store: Arc<InMemoryAugmentationStore>,
}

fn fixture() -> Fixture {
    let fetcher = ScriptedFetcher::serving("1200");
    let store = Arc::new(InMemoryAugmentationStore::new());
    let hub = SyncHub::new(
        fetcher.clone(),
        store.clone(),
        HubConfig {
            poll_interval: INTERVAL,
            client_buffer: 16,
        },
    );
    Fixture { hub, fetcher, store }
}

fn client() -> (Arc<dyn ClientHandle>, mpsc::Receiver<ServerEvent>) {
    let (client, rx) = ChannelClient::new(16);
    (Arc::new(client), rx)
}

fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn only_snapshot(rx: &mut mpsc::Receiver<ServerEvent>) -> EnrichedSnapshot {
    let mut events = drain(rx);
    assert_eq!(events.len(), 1, "expected exactly one event, got {events:?}");
    match events.remove(0) {
        ServerEvent::Snapshot(snapshot) => snapshot,
        other => panic!("expected snapshot, got {other:?}"),
    }
}

async fn next_tick() {
    tokio::time::sleep(INTERVAL + Duration::from_millis(100)).await;
}

/// Let every spawned task run until it blocks.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn late_joiner_sees_own_columns_and_group_is_removed_when_empty() {
    let fx = fixture();
    let s1 = ResourceId::from("S1");
    let bob = UserId::from("bob");
    fx.store.add_column(&s1, &bob, "Notes", "TEXT").await.unwrap();

    let (a, mut rx_a) = client();
    fx.hub.subscribe(s1.clone(), a.clone(), None).await.unwrap();
    let seen_a = only_snapshot(&mut rx_a);
    assert_eq!(seen_a.headers, seen_a.original_headers);
    assert!(seen_a.dynamic_columns.is_empty());

    let (b, mut rx_b) = client();
    fx.hub.subscribe(s1.clone(), b.clone(), Some(bob)).await.unwrap();
    let seen_b = only_snapshot(&mut rx_b);
    assert_eq!(seen_b.headers, vec!["Item", "Amount", "Notes"]);
    assert_eq!(seen_b.original_headers, vec!["Item", "Amount"]);
    assert!(drain(&mut rx_a).is_empty());
    assert_eq!(fx.fetcher.fetches(), 1);

    fx.hub.unsubscribe(&s1, a.id()).await;
    assert!(fx.hub.registry().is_tracked(&s1));
    fx.hub.unsubscribe(&s1, b.id()).await;
    assert!(!fx.hub.registry().is_tracked(&s1));
    assert_eq!(fx.hub.registry().group_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn unchanged_data_is_not_rebroadcast() {
    let fx = fixture();
    let s1 = ResourceId::from("S1");
    let (a, mut rx) = client();
    fx.hub.subscribe(s1.clone(), a, None).await.unwrap();
    only_snapshot(&mut rx);

    next_tick().await;
    assert_eq!(fx.fetcher.fetches(), 2);
    assert!(drain(&mut rx).is_empty());

    fx.fetcher.serve("1250");
    next_tick().await;
    let updated = only_snapshot(&mut rx);
    assert_eq!(updated.rows[0]["Amount"], CellValue::from("1250"));

    next_tick().await;
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_tick_keeps_polling() {
    let fx = fixture();
    let s1 = ResourceId::from("S1");
    let (a, mut rx) = client();
    fx.hub.subscribe(s1.clone(), a, None).await.unwrap();
    only_snapshot(&mut rx);

    fx.fetcher.fail();
    next_tick().await;
    assert_eq!(fx.fetcher.fetches(), 2);
    assert!(drain(&mut rx).is_empty());
    assert!(fx.hub.registry().has_poll_task(&s1));

    fx.fetcher.serve("900");
    next_tick().await;
    assert_eq!(fx.fetcher.fetches(), 3);
    let recovered = only_snapshot(&mut rx);
    assert_eq!(recovered.rows[0]["Amount"], CellValue::from("900"));
}

#[tokio::test(start_paused = true)]
async fn failed_initial_fetch_reports_error_and_leaves_no_group() {
    let fx = fixture();
    fx.fetcher.fail();
    let s1 = ResourceId::from("S1");
    let (a, mut rx) = client();

    let result = fx.hub.subscribe(s1.clone(), a, None).await;
    assert!(result.is_err());
    assert_eq!(
        drain(&mut rx),
        vec![ServerEvent::error("Failed to fetch resource data")]
    );
    assert!(!fx.hub.registry().is_tracked(&s1));

    next_tick().await;
    assert_eq!(fx.fetcher.fetches(), 1);
}

#[tokio::test(start_paused = true)]
async fn polling_stops_after_last_watcher_leaves() {
    let fx = fixture();
    let s1 = ResourceId::from("S1");
    let (a, mut rx) = client();
    fx.hub.subscribe(s1.clone(), a.clone(), None).await.unwrap();
    only_snapshot(&mut rx);

    fx.hub.unsubscribe(&s1, a.id()).await;
    fx.hub.unsubscribe(&s1, a.id()).await;
    fx.fetcher.serve("1");
    next_tick().await;
    next_tick().await;
    assert_eq!(fx.fetcher.fetches(), 1);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test(start_paused = true)]
async fn disconnect_leaves_every_group() {
    let fx = fixture();
    let (a, mut rx) = client();
    let (other, _rx_other) = client();
    for id in ["S1", "S2", "S3"] {
        fx.hub.subscribe(ResourceId::from(id), a.clone(), None).await.unwrap();
    }
    fx.hub.subscribe(ResourceId::from("S2"), other.clone(), None).await.unwrap();
    assert_eq!(drain(&mut rx).len(), 3);

    fx.hub.disconnect(a.id()).await;
    assert!(fx.hub.registry().resources_watched_by(a.id()).is_empty());
    assert_eq!(fx.hub.registry().group_count(), 1);
    assert_eq!(fx.hub.registry().watcher_count(&ResourceId::from("S2")), 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_not_held_up_by_a_stalled_resource() {
    let fx = fixture();
    let ids = ["SLOW", "FAST1", "FAST2", "FAST3"].map(ResourceId::from);
    let (a, mut rx) = client();
    for id in &ids {
        fx.hub.subscribe(id.clone(), a.clone(), None).await.unwrap();
    }
    assert_eq!(drain(&mut rx).len(), ids.len());

    fx.fetcher.stall(&ids[0]);
    next_tick().await;
    let fetches = fx.fetcher.fetches();
    assert_eq!(fetches, 2 * ids.len());

    let hub = fx.hub.clone();
    let client_id = a.id();
    let leaving = tokio::spawn(async move { hub.disconnect(client_id).await });
    settle().await;

    assert!(!leaving.is_finished());
    assert_eq!(fx.hub.registry().group_count(), 1);
    assert!(fx.hub.registry().is_tracked(&ids[0]));
    for id in &ids[1..] {
        assert!(!fx.hub.registry().is_tracked(id));
    }

    next_tick().await;
    next_tick().await;
    assert_eq!(fx.fetcher.fetches(), fetches);
}

#[tokio::test(start_paused = true)]
async fn tick_queued_behind_the_last_leave_never_runs() {
    let fetcher = ScriptedFetcher::serving("1200");
    let augmentation = Arc::new(StallingAugmentation {
        store: InMemoryAugmentationStore::new(),
        stalled_user: UserId::from("slow"),
        release: Semaphore::new(0),
    });
    let hub = SyncHub::new(
        fetcher.clone(),
        augmentation.clone(),
        HubConfig {
            poll_interval: INTERVAL,
            client_buffer: 16,
        },
    );
    let s1 = ResourceId::from("S1");

    let (a, mut rx_a) = client();
    hub.subscribe(s1.clone(), a.clone(), None).await.unwrap();
    only_snapshot(&mut rx_a);

    // b's subscribe holds the resource gate while its columns load; both
    // leaves then queue on the gate ahead of the first tick.
    let (b, mut rx_b) = client();
    let joining = tokio::spawn({
        let (hub, s1, b) = (hub.clone(), s1.clone(), b.clone());
        async move { hub.subscribe(s1, b, Some(UserId::from("slow"))).await }
    });
    settle().await;
    let mut leaves = Vec::new();
    for client_id in [a.id(), b.id()] {
        let (hub, s1) = (hub.clone(), s1.clone());
        leaves.push(tokio::spawn(async move { hub.unsubscribe(&s1, client_id).await }));
        settle().await;
    }

    fetcher.serve("1300");
    tokio::time::sleep(INTERVAL).await;
    assert_eq!(fetcher.fetches(), 1);

    augmentation.release.add_permits(1);
    joining.await.unwrap().unwrap();
    for leave in leaves {
        leave.await.unwrap();
    }
    assert!(!hub.registry().is_tracked(&s1));

    next_tick().await;
    next_tick().await;
    assert_eq!(fetcher.fetches(), 1);
    assert!(drain(&mut rx_a).is_empty());
    let seen_b = only_snapshot(&mut rx_b);
    assert_eq!(seen_b.rows[0]["Amount"], CellValue::from("1200"));
}

#[tokio::test(start_paused = true)]
async fn views_are_isolated_per_user() {
    let fx = fixture();
    let s1 = ResourceId::from("S1");
    let (ann, bob) = (UserId::from("ann"), UserId::from("bob"));
    fx.store.add_column(&s1, &ann, "Owner", "TEXT").await.unwrap();
    fx.store.add_column(&s1, &bob, "Due", "DATE").await.unwrap();

    let (a, mut rx_a) = client();
    let (b, mut rx_b) = client();
    fx.hub.subscribe(s1.clone(), a, Some(ann)).await.unwrap();
    fx.hub.subscribe(s1.clone(), b, Some(bob)).await.unwrap();
    assert_eq!(only_snapshot(&mut rx_a).headers, vec!["Item", "Amount", "Owner"]);
    assert_eq!(only_snapshot(&mut rx_b).headers, vec!["Item", "Amount", "Due"]);

    fx.fetcher.serve("1300");
    next_tick().await;
    let seen_a = only_snapshot(&mut rx_a);
    let seen_b = only_snapshot(&mut rx_b);
    assert_eq!(seen_a.dynamic_columns[0].name, "Owner");
    assert_eq!(seen_b.dynamic_columns[0].name, "Due");
}

#[tokio::test(start_paused = true)]
async fn column_added_between_ticks_reaches_only_its_owner() {
    let fx = fixture();
    let s1 = ResourceId::from("S1");
    let ann = UserId::from("ann");

    let (a, mut rx_a) = client();
    let (anon, mut rx_anon) = client();
    fx.hub.subscribe(s1.clone(), a, Some(ann.clone())).await.unwrap();
    fx.hub.subscribe(s1.clone(), anon, None).await.unwrap();
    only_snapshot(&mut rx_a);
    only_snapshot(&mut rx_anon);

    fx.store.add_column(&s1, &ann, "Notes", "TEXT").await.unwrap();
    next_tick().await;
    assert_eq!(only_snapshot(&mut rx_a).headers, vec!["Item", "Amount", "Notes"]);
    assert!(drain(&mut rx_anon).is_empty());
}

#[tokio::test(start_paused = true)]
async fn concurrent_first_subscribers_share_one_fetch_and_one_task() {
    let fx = fixture();
    let s1 = ResourceId::from("S1");
    let (a, mut rx_a) = client();
    let (b, mut rx_b) = client();

    let (ra, rb) = tokio::join!(
        fx.hub.subscribe(s1.clone(), a, None),
        fx.hub.subscribe(s1.clone(), b, None),
    );
    ra.unwrap();
    rb.unwrap();
    assert_eq!(fx.fetcher.fetches(), 1);
    only_snapshot(&mut rx_a);
    only_snapshot(&mut rx_b);

    next_tick().await;
    assert_eq!(fx.fetcher.fetches(), 2);
}
