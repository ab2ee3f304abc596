//! Process-lifecycle coordinator.
//!
//! Every service is an explicit, injected value constructed in one
//! place; there are no lazy singletons. `App::build` wires the graph,
//! `App::start` brings the background tasks up, `App::shutdown` tears
//! them down in order: stop accepting sessions, stop the feed client,
//! drain the tick buffer, drop the store handles. Notification queues
//! are not drained; their durability is their drain.

use redis::aio::ConnectionManager;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use crate::alert_cache::AlertCache;
use crate::cache::{CacheStore, RedisCacheStore};
use crate::config::Config;
use crate::constants::app_constants::*;
use crate::dispatch::TickDispatcher;
use crate::engine::{AlertEngine, EngineRouter};
use crate::models::{HealthReport, QueueDepth, Result, TickwatchError, UpstreamHealth};
use crate::notify::{Channel, JobQueue, Notifier, RedisJobQueue, Transport, WebhookTransport};
use crate::sessions::{GatewaySecretAuth, Rooms, ServerMessage, SessionServer};
use crate::store::{AlertStore, MongoAlertStore};
use crate::subscriptions::{AlertSubscriptionManager, SubscriptionRegistry};
use crate::ticker::{AccessTokenSource, ConnectionState, Ticker, TickerEvent, TickerHandle};

// Bridges the ticker's lazy token fetch to the durable store, where
// the external refresher keeps the bearer token current.
struct StoreTokenSource {
    store: Arc<dyn AlertStore>,
}

#[async_trait::async_trait]
impl AccessTokenSource for StoreTokenSource {
    async fn feed_token(&self) -> Result<Option<String>> {
        self.store.feed_token().await
    }
}

pub struct App {
    config: Config,
    rooms: Arc<Rooms>,
    cache: Arc<dyn CacheStore>,
    store: Arc<dyn AlertStore>,
    alert_cache: Arc<AlertCache>,
    notifier: Arc<Notifier>,
    dispatcher: Arc<TickDispatcher>,
    manager: Arc<AlertSubscriptionManager>,
    session_server: Arc<SessionServer>,
    ticker_handle: TickerHandle,
    ticker: Option<Ticker>,
    shutdown_tx: watch::Sender<bool>,
    ticker_task: Option<tokio::task::JoinHandle<()>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl App {
    pub async fn build(config: Config) -> Result<App> {
        let redis_client = redis::Client::open(config.redis_url.as_str())?;
        let redis_conn = ConnectionManager::new(redis_client).await?;

        let cache: Arc<dyn CacheStore> = Arc::new(RedisCacheStore::new(redis_conn.clone()));
        let store: Arc<dyn AlertStore> =
            Arc::new(MongoAlertStore::connect(&config.mongo_url, &config.mongo_db).await?);
        let queue: Arc<dyn JobQueue> = Arc::new(RedisJobQueue::new(redis_conn));

        let rooms = Rooms::new();
        let alert_cache = AlertCache::new(Arc::clone(&store));

        let push_transport: Option<Arc<dyn Transport>> = config
            .push_webhook_url
            .as_deref()
            .map(|url| Arc::new(WebhookTransport::new(url)) as Arc<dyn Transport>);
        let notifier = Notifier::new(
            queue,
            push_transport,
            Arc::clone(&store),
            Arc::clone(&alert_cache),
        );

        let engine = AlertEngine::new(
            Arc::clone(&alert_cache),
            Arc::clone(&store),
            Arc::clone(&notifier),
            Arc::clone(&rooms),
        );
        let (router, engine_tasks) = EngineRouter::start(engine, config.engine_workers);
        let dispatcher = TickDispatcher::new(Arc::clone(&cache), Arc::clone(&rooms), router);

        let registry = SubscriptionRegistry::new(Arc::clone(&cache));

        let token_source = Arc::new(StoreTokenSource {
            store: Arc::clone(&store),
        });
        let (ticker, ticker_handle) = Ticker::builder(&config.feed_auth_url, token_source)
            .resubscribe_source(Arc::clone(&registry) as _)
            .build()?;

        let manager = AlertSubscriptionManager::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            ticker_handle.clone(),
        );

        let session_server = SessionServer::new(
            &config.session_bind,
            Arc::clone(&rooms),
            Arc::clone(&cache),
            Arc::clone(&store),
            Arc::clone(&registry),
            ticker_handle.clone(),
            Arc::clone(&dispatcher),
            GatewaySecretAuth::new(&config.gateway_secret),
        );

        let (shutdown_tx, _) = watch::channel(false);

        Ok(App {
            config,
            rooms,
            cache,
            store,
            alert_cache,
            notifier,
            dispatcher,
            manager,
            session_server,
            ticker_handle,
            ticker: Some(ticker),
            shutdown_tx,
            ticker_task: None,
            tasks: engine_tasks,
        })
    }

    pub fn ticker_handle(&self) -> TickerHandle {
        self.ticker_handle.clone()
    }

    pub async fn start(&mut self) -> Result<()> {
        let shutdown = self.shutdown_tx.subscribe();

        // The engine refuses ticks until the cache is warm; load it
        // eagerly so the gate opens before the first frame arrives.
        if let Err(e) = self.alert_cache.refresh().await {
            log::warn!("initial alert cache refresh failed: {}", e);
        }
        if let Err(e) = self.manager.sync_once().await {
            log::warn!("initial subscription sync failed: {}", e);
        }

        let ticker = self
            .ticker
            .take()
            .ok_or_else(|| TickwatchError::other("app already started"))?;
        self.ticker_task = Some(tokio::spawn(async move {
            if let Err(e) = ticker.serve().await {
                log::error!("feed client stopped: {}", e);
            }
        }));

        self.tasks.push(self.spawn_event_pump());
        self.tasks
            .push(self.dispatcher.spawn_flusher(shutdown.clone()));
        self.tasks.push(
            self.alert_cache
                .spawn_refresher(ALERT_REFRESH_INTERVAL, shutdown.clone()),
        );
        self.tasks.push(
            self.manager
                .spawn(SUBSCRIPTION_SYNC_INTERVAL, shutdown.clone()),
        );

        if let Some(url) = self.config.email_webhook_url.clone() {
            let transport: Arc<dyn Transport> = Arc::new(WebhookTransport::new(&url));
            self.tasks.push(self.notifier.spawn_worker(
                Channel::Email,
                transport,
                self.config.email_rate_per_sec,
                shutdown.clone(),
            ));
        } else {
            log::warn!("no email delivery webhook configured; email jobs will queue");
        }
        if let Some(url) = self.config.chat_webhook_url.clone() {
            let transport: Arc<dyn Transport> = Arc::new(WebhookTransport::new(&url));
            self.tasks.push(self.notifier.spawn_worker(
                Channel::Chat,
                transport,
                self.config.chat_rate_per_sec,
                shutdown.clone(),
            ));
        } else {
            log::warn!("no chat delivery webhook configured; chat jobs will queue");
        }
        self.tasks.push(
            self.notifier
                .spawn_purger(vec![Channel::Email, Channel::Chat], shutdown.clone()),
        );

        let server = Arc::clone(&self.session_server);
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = server.run(shutdown).await {
                log::error!("session server stopped: {}", e);
            }
        }));

        Ok(())
    }

    fn spawn_event_pump(&self) -> tokio::task::JoinHandle<()> {
        let mut events = self.ticker_handle.subscribe_events();
        let dispatcher = Arc::clone(&self.dispatcher);
        let rooms = Arc::clone(&self.rooms);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TickerEvent::Tick { instrument, body }) => {
                        dispatcher.on_tick(&instrument, body).await;
                    }
                    Ok(TickerEvent::Connect { reconnected }) => {
                        log::info!("upstream feed connected (reconnected: {})", reconnected);
                        if reconnected {
                            // Clients refresh derived state on this signal.
                            rooms.broadcast(ServerMessage::WsReconnected);
                        }
                    }
                    Ok(TickerEvent::Reconnect(attempt, delay)) => {
                        log::warn!("upstream reconnect attempt {} in {:?}", attempt, delay);
                    }
                    Ok(TickerEvent::Close(code, reason)) => {
                        log::warn!("upstream feed closed ({}): {}", code, reason);
                    }
                    Ok(TickerEvent::Error(message)) => {
                        log::error!("upstream feed error: {}", message);
                    }
                    Ok(TickerEvent::Exhausted(attempts)) => {
                        log::error!(
                            "upstream reconnect exhausted after {} attempts; waiting on operator",
                            attempts
                        );
                    }
                    Err(broadcast::error::RecvError::Lagged(dropped)) => {
                        // Market data is lossy by contract.
                        log::warn!("event pump lagged; {} feed events dropped", dropped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub async fn health(&self) -> HealthReport {
        let state = self.ticker_handle.state();
        let mut queues = Vec::new();
        for channel in [Channel::Email, Channel::Chat] {
            let depth = self.notifier.queue_depth(channel).await.unwrap_or(0);
            queues.push(QueueDepth {
                channel: channel.as_str().to_owned(),
                depth,
            });
        }
        HealthReport {
            upstream: UpstreamHealth {
                state: state.as_str().to_owned(),
                connected: state == ConnectionState::Open,
            },
            cache_ok: self.cache.ping().await.is_ok(),
            store_ok: self.store.ping().await.is_ok(),
            sessions: self.session_server.session_count(),
            rooms: self.rooms.room_count(),
            queues,
        }
    }

    pub async fn shutdown(mut self) {
        log::info!("shutting down");

        // Stops the session listener and every periodic task; the
        // flusher performs its final flush on this signal.
        let _ = self.shutdown_tx.send(true);

        // The feed client loops on reconnect forever; cut it off.
        if let Some(task) = self.ticker_task.take() {
            task.abort();
        }

        // Anything decoded after the flusher's last pass.
        if let Err(e) = self.dispatcher.flush().await {
            log::warn!("shutdown tick flush failed: {}", e);
        }

        // Watch-driven tasks exit on the signal; the engine workers
        // and the event pump idle on channels and get cut off.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}
