mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{long_alert, MemoryAlertStore, MemoryCacheStore, MemoryJobQueue};
use tickwatch::alert_cache::AlertCache;
use tickwatch::cache::CacheStore;
use tickwatch::dispatch::{LtpMap, TickDispatcher};
use tickwatch::engine::{AlertEngine, EngineRouter};
use tickwatch::notify::{JobQueue, Notifier};
use tickwatch::proto::FeedBody;
use tickwatch::sessions::{Rooms, ServerMessage};
use tickwatch::store::AlertStore;

struct Harness {
    cache: Arc<MemoryCacheStore>,
    store: Arc<MemoryAlertStore>,
    rooms: Arc<Rooms>,
    dispatcher: Arc<TickDispatcher>,
}

async fn harness(alerts: Vec<tickwatch::models::Alert>) -> Harness {
    let cache = Arc::new(MemoryCacheStore::new());
    let store = Arc::new(MemoryAlertStore::with_alerts(alerts));
    let alert_cache = AlertCache::new(Arc::clone(&store) as Arc<dyn AlertStore>);
    alert_cache.refresh().await.expect("refresh");
    let rooms = Rooms::new();
    let notifier = Notifier::new(
        Arc::new(MemoryJobQueue::new()) as Arc<dyn JobQueue>,
        None,
        Arc::clone(&store) as Arc<dyn AlertStore>,
        Arc::clone(&alert_cache),
    );
    let engine = AlertEngine::new(
        alert_cache,
        Arc::clone(&store) as Arc<dyn AlertStore>,
        notifier,
        Arc::clone(&rooms),
    );
    let (router, _workers) = EngineRouter::start(engine, 2);
    let dispatcher = TickDispatcher::new(
        Arc::clone(&cache) as Arc<dyn CacheStore>,
        Arc::clone(&rooms),
        router,
    );
    Harness {
        cache,
        store,
        rooms,
        dispatcher,
    }
}

#[test]
fn ltp_map_is_capped() {
    let mut map = LtpMap::new(3);
    for i in 0..10 {
        map.insert(&format!("sym-{}", i), i as f64);
    }
    assert_eq!(map.len(), 3);
    assert_eq!(map.get("sym-9"), Some(9.0));
    assert_eq!(map.get("sym-0"), None);

    // Updating an existing entry must not grow the map.
    map.insert("sym-9", 42.0);
    assert_eq!(map.len(), 3);
    assert_eq!(map.get("sym-9"), Some(42.0));
}

#[tokio::test]
async fn flush_keeps_only_the_newest_tick_per_instrument() {
    let h = harness(Vec::new()).await;

    h.dispatcher
        .on_tick("NSE:ACME", FeedBody::from_ltp(101.0, Some(99.0)))
        .await;
    h.dispatcher
        .on_tick("NSE:ACME", FeedBody::from_ltp(102.0, Some(99.0)))
        .await;
    h.dispatcher
        .on_tick("NSE:OTHER", FeedBody::from_ltp(55.0, None))
        .await;
    assert_eq!(h.dispatcher.buffered().await, 2);

    h.dispatcher.flush().await.expect("flush");
    assert_eq!(h.dispatcher.buffered().await, 0);

    let ticks = h
        .cache
        .last_ticks(&["NSE:ACME".to_owned(), "NSE:OTHER".to_owned()])
        .await
        .expect("read");
    let acme: FeedBody =
        serde_json::from_str(ticks[0].as_ref().expect("acme tick")).expect("json");
    assert_eq!(acme.ltp(), Some(102.0));
    assert!(ticks[1].is_some());

    // Close prices ride along in the same flush.
    let closes = h
        .cache
        .last_closes(&["NSE:ACME".to_owned()])
        .await
        .expect("read");
    assert_eq!(closes[0].as_deref(), Some("99"));

    // An idle flush is a no-op.
    h.dispatcher.flush().await.expect("empty flush");
}

#[tokio::test]
async fn repeated_ltp_is_not_rebroadcast() {
    let h = harness(Vec::new()).await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    h.rooms.join("NSE:ACME", 1, tx);

    h.dispatcher
        .on_tick("NSE:ACME", FeedBody::from_ltp(101.0, None))
        .await;
    h.dispatcher
        .on_tick("NSE:ACME", FeedBody::from_ltp(101.0, None))
        .await;
    h.dispatcher
        .on_tick("NSE:ACME", FeedBody::from_ltp(102.0, None))
        .await;

    let mut tick_events = 0;
    while let Ok(message) = rx.try_recv() {
        if let ServerMessage::Tick { symbol, .. } = message {
            assert_eq!(symbol, "NSE:ACME");
            tick_events += 1;
        }
    }
    assert_eq!(tick_events, 2);
}

#[tokio::test]
async fn ticks_reach_the_engine_asynchronously() {
    let h = harness(vec![long_alert("a1", "NSE:ACME", 100.0, 95.0, 110.0)]).await;

    h.dispatcher
        .on_tick("NSE:ACME", FeedBody::from_ltp(94.0, None))
        .await;

    // The hand-off is non-blocking; poll for the worker to land.
    let mut recorded = 0;
    for _ in 0..100 {
        recorded = h.store.recorded_updates().len();
        if recorded > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(recorded, 1);
    assert_eq!(
        h.store.recorded_updates()[0].new_status,
        tickwatch::models::AlertStatus::SlHit
    );
}
