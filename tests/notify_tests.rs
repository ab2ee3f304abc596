mod common;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;

use common::{
    long_alert, MemoryAlertStore, MemoryJobQueue, ScriptedTransport, TransportScript,
};
use tickwatch::alert_cache::AlertCache;
use tickwatch::models::{Alert, AlertDetails, AlertStatus, AlertUpdate, NotificationJob};
use tickwatch::notify::{Channel, JobQueue, Notifier, Transport};
use tickwatch::store::AlertStore;

struct Harness {
    store: Arc<MemoryAlertStore>,
    cache: Arc<AlertCache>,
    queue: Arc<MemoryJobQueue>,
    notifier: Arc<Notifier>,
}

async fn harness(alerts: Vec<Alert>) -> Harness {
    let store = Arc::new(MemoryAlertStore::with_alerts(alerts));
    let cache = AlertCache::new(Arc::clone(&store) as Arc<dyn AlertStore>);
    cache.refresh().await.expect("refresh");
    let queue = Arc::new(MemoryJobQueue::new());
    let notifier = Notifier::new(
        Arc::clone(&queue) as Arc<dyn JobQueue>,
        None,
        Arc::clone(&store) as Arc<dyn AlertStore>,
        Arc::clone(&cache),
    );
    Harness {
        store,
        cache,
        queue,
        notifier,
    }
}

fn update_for(alert: &Alert, status: AlertStatus, ltp: f64) -> AlertUpdate {
    AlertUpdate {
        alert_id: alert.id.clone(),
        user_id: alert.user_id.clone(),
        old_status: alert.status,
        new_status: status,
        entry_crossed: true,
        ltp,
    }
}

fn job_with_attempts(attempts: u32) -> NotificationJob {
    let alert = long_alert("a1", "NSE:ACME", 100.0, 95.0, 110.0);
    NotificationJob {
        id: "job-1".to_owned(),
        user_id: alert.user_id.clone(),
        priority: 1,
        attempts,
        recipient: alert.owner.email.clone(),
        alert_details: AlertDetails::from_update(
            &alert,
            &update_for(&alert, AlertStatus::SlHit, 94.0),
            Utc::now(),
        ),
    }
}

#[tokio::test]
async fn submit_enqueues_both_durable_channels() {
    let alert = long_alert("a1", "NSE:ACME", 100.0, 95.0, 110.0);
    let h = harness(vec![alert.clone()]).await;

    h.notifier
        .submit(&alert, &update_for(&alert, AlertStatus::Enter, 98.0), Utc::now())
        .await;

    let email = h.queue.pending(Channel::Email);
    assert_eq!(email.len(), 1);
    assert_eq!(email[0].recipient, "u1@example.com");
    assert_eq!(email[0].priority, 2);
    assert_eq!(email[0].alert_details.trading_symbol, "NSE:ACME-EQ");

    let chat = h.queue.pending(Channel::Chat);
    assert_eq!(chat.len(), 1);
    assert_eq!(chat[0].recipient, "chat-u1");
}

#[tokio::test]
async fn terminal_statuses_outrank_enter() {
    let alert = long_alert("a1", "NSE:ACME", 100.0, 95.0, 110.0);
    let h = harness(vec![alert.clone()]).await;

    h.notifier
        .submit(&alert, &update_for(&alert, AlertStatus::SlHit, 94.0), Utc::now())
        .await;
    assert_eq!(h.queue.pending(Channel::Email)[0].priority, 1);
}

#[tokio::test]
async fn disabled_channels_get_no_jobs() {
    let mut alert = long_alert("a1", "NSE:ACME", 100.0, 95.0, 110.0);
    alert.owner.email_enabled = false;
    alert.owner.telegram_enabled = false;
    let h = harness(vec![alert.clone()]).await;

    h.notifier
        .submit(&alert, &update_for(&alert, AlertStatus::Enter, 98.0), Utc::now())
        .await;
    assert!(h.queue.pending(Channel::Email).is_empty());
    assert!(h.queue.pending(Channel::Chat).is_empty());
}

#[tokio::test]
async fn worker_delivers_and_completes() {
    let alert = long_alert("a1", "NSE:ACME", 100.0, 95.0, 110.0);
    let h = harness(vec![alert.clone()]).await;
    h.notifier
        .submit(&alert, &update_for(&alert, AlertStatus::Enter, 98.0), Utc::now())
        .await;

    let scripted = Arc::new(ScriptedTransport::always_ok());
    let transport: Arc<dyn Transport> = Arc::clone(&scripted) as Arc<dyn Transport>;
    assert!(h.notifier.work_one(Channel::Email, &transport).await);

    assert_eq!(scripted.delivered_count(), 1);
    assert!(h.queue.pending(Channel::Email).is_empty());
    assert_eq!(h.queue.completed_count(Channel::Email), 1);

    // Queue drained: the next pass is idle.
    assert!(!h.notifier.work_one(Channel::Email, &transport).await);
}

#[tokio::test]
async fn transient_failure_reschedules_with_backoff() {
    let alert = long_alert("a1", "NSE:ACME", 100.0, 95.0, 110.0);
    let h = harness(vec![alert.clone()]).await;
    h.notifier
        .submit(&alert, &update_for(&alert, AlertStatus::Enter, 98.0), Utc::now())
        .await;

    let transport: Arc<dyn Transport> = Arc::new(ScriptedTransport::scripted(vec![
        TransportScript::FailTransient,
    ]));
    assert!(h.notifier.work_one(Channel::Email, &transport).await);

    // Re-queued, not completed, and not yet due.
    let pending = h.queue.pending(Channel::Email);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 1);
    assert_eq!(h.queue.completed_count(Channel::Email), 0);
    assert!(!h.notifier.work_one(Channel::Email, &transport).await);
}

#[tokio::test]
async fn attempts_ceiling_drops_the_job() {
    let h = harness(Vec::new()).await;
    h.queue
        .enqueue(Channel::Email, &job_with_attempts(2), Utc::now())
        .await
        .expect("enqueue");

    let transport: Arc<dyn Transport> = Arc::new(ScriptedTransport::scripted(vec![
        TransportScript::FailTransient,
    ]));
    assert!(h.notifier.work_one(Channel::Email, &transport).await);

    assert!(h.queue.pending(Channel::Email).is_empty());
    assert_eq!(h.queue.completed_count(Channel::Email), 1);
}

#[tokio::test]
async fn invalid_recipient_disables_the_chat_channel() {
    let alert = long_alert("a1", "NSE:ACME", 100.0, 95.0, 110.0);
    let h = harness(vec![alert.clone()]).await;
    h.notifier
        .submit(&alert, &update_for(&alert, AlertStatus::Enter, 98.0), Utc::now())
        .await;

    let transport: Arc<dyn Transport> = Arc::new(ScriptedTransport::scripted(vec![
        TransportScript::FailPermanent,
    ]));
    assert!(h.notifier.work_one(Channel::Chat, &transport).await);

    // Durable store and hydrated cache both see the channel go dark.
    assert_eq!(
        *h.store.telegram_disabled.lock().unwrap(),
        vec!["u1".to_owned()]
    );
    let cached = h.cache.alerts_for("NSE:ACME").await;
    assert!(!cached[0].owner.telegram_enabled);
    assert!(cached[0].owner.telegram_chat_id.is_none());

    // No retry, and later transitions enqueue no chat jobs.
    assert!(h.queue.pending(Channel::Chat).is_empty());
    h.notifier
        .submit(
            &cached[0],
            &update_for(&cached[0], AlertStatus::TargetHit, 110.0),
            Utc::now(),
        )
        .await;
    assert!(h.queue.pending(Channel::Chat).is_empty());
    assert_eq!(h.queue.pending(Channel::Email).len(), 2);
}

#[tokio::test]
async fn same_instant_jobs_pop_in_priority_order() {
    let queue = MemoryJobQueue::new();
    let now = Utc::now();

    let mut low = job_with_attempts(0);
    low.id = "low".to_owned();
    low.priority = 2;
    let mut high = job_with_attempts(0);
    high.id = "high".to_owned();
    high.priority = 1;

    queue.enqueue(Channel::Email, &low, now).await.expect("low");
    queue
        .enqueue(Channel::Email, &high, now)
        .await
        .expect("high");

    let first = queue
        .dequeue_due(Channel::Email, now)
        .await
        .expect("pop")
        .expect("job");
    assert_eq!(first.id, "high");
}

#[tokio::test]
async fn completed_jobs_are_purged_by_age() {
    let queue = MemoryJobQueue::new();
    let now = Utc::now();
    queue
        .complete(Channel::Email, "done-1", now)
        .await
        .expect("complete");

    let purged = queue
        .purge_completed(Channel::Email, now + ChronoDuration::seconds(1))
        .await
        .expect("purge");
    assert_eq!(purged, 1);
    assert_eq!(queue.completed_count(Channel::Email), 0);
}
