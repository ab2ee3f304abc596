//! Notification dispatch: durable per-channel job queues with
//! priority and delayed retry, rate-limited workers, and permanent
//! recipient-failure handling. Push is best-effort and unqueued.
//!
//! Queue layout per channel: a due sorted set (score = ready-at
//! millis, member = `{priority}:{id}` so same-instant jobs pop in
//! priority order), a payload hash, and a completed sorted set purged
//! on a timer. Delivery is at-least-once; the transports are expected
//! to tolerate the occasional duplicate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::alert_cache::AlertCache;
use crate::constants::app_constants::*;
use crate::constants::Keys;
use crate::models::{Alert, AlertDetails, AlertUpdate, NotificationJob, Result};
use crate::store::AlertStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Email,
    Chat,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Chat => "chat",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum TransportError {
    // Recipient invalid: never retried, disables the channel.
    Permanent(String),
    // Anything else: retried with backoff.
    Transient(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Permanent(msg) => write!(f, "permanent: {}", msg),
            TransportError::Transient(msg) => write!(f, "transient: {}", msg),
        }
    }
}

// Transport performs the actual delivery hop for one channel. The
// provider protocols (SMTP, bot APIs, push services) live behind the
// delivery service this trait posts to.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, job: &NotificationJob) -> std::result::Result<(), TransportError>;
}

// WebhookTransport hands the job payload to an external delivery
// service over HTTP. A 4xx answer means the recipient is bad.
pub struct WebhookTransport {
    client: reqwest::Client,
    url: String,
}

impl WebhookTransport {
    pub fn new(url: &str) -> Self {
        WebhookTransport {
            client: reqwest::Client::new(),
            url: url.to_owned(),
        }
    }
}

#[derive(serde::Serialize)]
struct WebhookBody<'a> {
    recipient: &'a str,
    #[serde(rename = "alertDetails")]
    alert_details: &'a AlertDetails,
}

#[async_trait]
impl Transport for WebhookTransport {
    async fn deliver(&self, job: &NotificationJob) -> std::result::Result<(), TransportError> {
        let body = WebhookBody {
            recipient: &job.recipient,
            alert_details: &job.alert_details,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_client_error() {
            Err(TransportError::Permanent(format!(
                "delivery service rejected recipient: {}",
                status
            )))
        } else {
            Err(TransportError::Transient(format!(
                "delivery service returned {}",
                status
            )))
        }
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(
        &self,
        channel: Channel,
        job: &NotificationJob,
        ready_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Pops one job whose ready-at time has passed, or None.
    async fn dequeue_due(
        &self,
        channel: Channel,
        now: DateTime<Utc>,
    ) -> Result<Option<NotificationJob>>;

    async fn complete(&self, channel: Channel, job_id: &str, now: DateTime<Utc>) -> Result<()>;

    async fn depth(&self, channel: Channel) -> Result<u64>;

    /// Drops completed markers older than the cutoff; returns how
    /// many were removed.
    async fn purge_completed(&self, channel: Channel, cutoff: DateTime<Utc>) -> Result<u64>;
}

pub struct RedisJobQueue {
    manager: ConnectionManager,
}

impl RedisJobQueue {
    pub fn new(manager: ConnectionManager) -> Self {
        RedisJobQueue { manager }
    }
}

fn member_for(job: &NotificationJob) -> String {
    format!("{}:{}", job.priority, job.id)
}

fn id_from_member(member: &str) -> &str {
    member.split_once(':').map(|(_, id)| id).unwrap_or(member)
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(
        &self,
        channel: Channel,
        job: &NotificationJob,
        ready_at: DateTime<Utc>,
    ) -> Result<()> {
        let payload = serde_json::to_string(job)?;
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.cmd("HSET")
            .arg(Keys::queue_jobs(channel.as_str()))
            .arg(&job.id)
            .arg(payload)
            .ignore();
        pipe.cmd("ZADD")
            .arg(Keys::queue_due(channel.as_str()))
            .arg(ready_at.timestamp_millis())
            .arg(member_for(job))
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn dequeue_due(
        &self,
        channel: Channel,
        now: DateTime<Utc>,
    ) -> Result<Option<NotificationJob>> {
        let due_key = Keys::queue_due(channel.as_str());
        let mut conn = self.manager.clone();

        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&due_key)
            .arg("-inf")
            .arg(now.timestamp_millis())
            .arg("LIMIT")
            .arg(0)
            .arg(1)
            .query_async(&mut conn)
            .await?;
        let Some(member) = members.into_iter().next() else {
            return Ok(None);
        };

        let removed: i64 = redis::cmd("ZREM")
            .arg(&due_key)
            .arg(&member)
            .query_async(&mut conn)
            .await?;
        if removed == 0 {
            // Another worker won the pop.
            return Ok(None);
        }

        let payload: Option<String> = redis::cmd("HGET")
            .arg(Keys::queue_jobs(channel.as_str()))
            .arg(id_from_member(&member))
            .query_async(&mut conn)
            .await?;
        match payload {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn complete(&self, channel: Channel, job_id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.cmd("HDEL")
            .arg(Keys::queue_jobs(channel.as_str()))
            .arg(job_id)
            .ignore();
        pipe.cmd("ZADD")
            .arg(Keys::queue_done(channel.as_str()))
            .arg(now.timestamp_millis())
            .arg(job_id)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn depth(&self, channel: Channel) -> Result<u64> {
        let mut conn = self.manager.clone();
        let depth: u64 = redis::cmd("ZCARD")
            .arg(Keys::queue_due(channel.as_str()))
            .query_async(&mut conn)
            .await?;
        Ok(depth)
    }

    async fn purge_completed(&self, channel: Channel, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut conn = self.manager.clone();
        let purged: u64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(Keys::queue_done(channel.as_str()))
            .arg("-inf")
            .arg(cutoff.timestamp_millis())
            .query_async(&mut conn)
            .await?;
        Ok(purged)
    }
}

fn new_job_id() -> String {
    let mut rng = rand::thread_rng();
    format!("{:016x}{:08x}", rng.gen::<u64>(), rng.gen::<u32>())
}

fn retry_delay(attempts: u32) -> chrono::Duration {
    let delay = NOTIFY_BACKOFF_BASE.saturating_mul(2u32.saturating_pow(attempts.saturating_sub(1)));
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(2))
}

// Notifier owns job submission and the channel workers.
pub struct Notifier {
    queue: Arc<dyn JobQueue>,
    push: Option<Arc<dyn Transport>>,
    store: Arc<dyn AlertStore>,
    cache: Arc<AlertCache>,
}

impl Notifier {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        push: Option<Arc<dyn Transport>>,
        store: Arc<dyn AlertStore>,
        cache: Arc<AlertCache>,
    ) -> Arc<Self> {
        Arc::new(Notifier {
            queue,
            push,
            store,
            cache,
        })
    }

    /// Queues email/chat jobs for one qualifying transition and fires
    /// the best-effort push. Enqueue failures are logged; the alert
    /// state change stands either way.
    pub async fn submit(&self, alert: &Alert, update: &AlertUpdate, at: DateTime<Utc>) {
        let details = AlertDetails::from_update(alert, update, at);
        let priority = if update.new_status.is_terminal() {
            PRIORITY_TERMINAL
        } else {
            PRIORITY_ENTER
        };

        if alert.owner.email_enabled && !alert.owner.email.is_empty() {
            let job = NotificationJob {
                id: new_job_id(),
                user_id: alert.user_id.clone(),
                priority,
                attempts: 0,
                recipient: alert.owner.email.clone(),
                alert_details: details.clone(),
            };
            if let Err(e) = self.queue.enqueue(Channel::Email, &job, at).await {
                log::error!("email enqueue failed for alert {}: {}", alert.id, e);
            }
        }

        if alert.owner.telegram_enabled {
            if let Some(chat_id) = &alert.owner.telegram_chat_id {
                let job = NotificationJob {
                    id: new_job_id(),
                    user_id: alert.user_id.clone(),
                    priority,
                    attempts: 0,
                    recipient: chat_id.clone(),
                    alert_details: details.clone(),
                };
                if let Err(e) = self.queue.enqueue(Channel::Chat, &job, at).await {
                    log::error!("chat enqueue failed for alert {}: {}", alert.id, e);
                }
            }
        }

        if let (Some(push), Some(token)) = (&self.push, &alert.owner.device_token) {
            let job = NotificationJob {
                id: new_job_id(),
                user_id: alert.user_id.clone(),
                priority,
                attempts: 0,
                recipient: token.clone(),
                alert_details: details,
            };
            let push = Arc::clone(push);
            let store = Arc::clone(&self.store);
            let cache = Arc::clone(&self.cache);
            let user_id = alert.user_id.clone();
            tokio::spawn(async move {
                match push.deliver(&job).await {
                    Ok(()) => {}
                    Err(TransportError::Permanent(reason)) => {
                        log::warn!("push token invalid for user {}: {}", user_id, reason);
                        if let Err(e) = store.clear_device_token(&user_id).await {
                            log::error!("clearing device token for {} failed: {}", user_id, e);
                        }
                        cache.clear_owner_device_token(&user_id).await;
                    }
                    Err(TransportError::Transient(reason)) => {
                        log::warn!("push delivery failed for user {}: {}", user_id, reason);
                    }
                }
            });
        }
    }

    async fn disable_channel(&self, channel: Channel, user_id: &str) {
        let outcome = match channel {
            Channel::Chat => {
                self.cache.disable_owner_telegram(user_id).await;
                self.store.disable_telegram(user_id).await
            }
            Channel::Email => {
                self.cache.disable_owner_email(user_id).await;
                self.store.disable_email(user_id).await
            }
        };
        if let Err(e) = outcome {
            log::error!("disabling {} channel for {} failed: {}", channel, user_id, e);
        }
    }

    /// One dequeue-deliver-settle step, factored out for tests.
    pub async fn work_one(&self, channel: Channel, transport: &Arc<dyn Transport>) -> bool {
        let now = Utc::now();
        let job = match self.queue.dequeue_due(channel, now).await {
            Ok(Some(job)) => job,
            Ok(None) => return false,
            Err(e) => {
                log::error!("{} dequeue failed: {}", channel, e);
                return false;
            }
        };

        match transport.deliver(&job).await {
            Ok(()) => {
                if let Err(e) = self.queue.complete(channel, &job.id, now).await {
                    log::warn!("completing {} job {} failed: {}", channel, job.id, e);
                }
            }
            Err(TransportError::Permanent(reason)) => {
                log::warn!(
                    "{} recipient invalid for user {}: {}",
                    channel,
                    job.user_id,
                    reason
                );
                self.disable_channel(channel, &job.user_id).await;
                if let Err(e) = self.queue.complete(channel, &job.id, now).await {
                    log::warn!("completing {} job {} failed: {}", channel, job.id, e);
                }
            }
            Err(TransportError::Transient(reason)) => {
                let mut job = job;
                job.attempts += 1;
                if job.attempts >= NOTIFY_MAX_ATTEMPTS {
                    log::error!(
                        "{} job {} dropped after {} attempts: {}",
                        channel,
                        job.id,
                        job.attempts,
                        reason
                    );
                    if let Err(e) = self.queue.complete(channel, &job.id, now).await {
                        log::warn!("completing {} job {} failed: {}", channel, job.id, e);
                    }
                } else {
                    let ready_at = now + retry_delay(job.attempts);
                    if let Err(e) = self.queue.enqueue(channel, &job, ready_at).await {
                        log::error!("requeue of {} job {} failed: {}", channel, job.id, e);
                    }
                }
            }
        }
        true
    }

    pub fn spawn_worker(
        self: &Arc<Self>,
        channel: Channel,
        transport: Arc<dyn Transport>,
        rate_per_sec: u32,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let notifier = Arc::clone(self);
        let period = Duration::from_millis(1_000 / u64::from(rate_per_sec.max(1)));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        notifier.work_one(channel, &transport).await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    pub fn spawn_purger(
        self: &Arc<Self>,
        channels: Vec<Channel>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let notifier = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(COMPLETED_PURGE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let cutoff = Utc::now()
                            - chrono::Duration::from_std(COMPLETED_RETENTION)
                                .unwrap_or_else(|_| chrono::Duration::hours(1));
                        for channel in &channels {
                            if let Err(e) = notifier.queue.purge_completed(*channel, cutoff).await {
                                log::warn!("purge of {} completed jobs failed: {}", channel, e);
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    pub async fn queue_depth(&self, channel: Channel) -> Result<u64> {
        self.queue.depth(channel).await
    }
}
