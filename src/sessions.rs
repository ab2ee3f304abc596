//! Live client fan-out.
//!
//! Each authenticated socket joins its `user:{id}` room and one room
//! per instrument it watches. The dispatcher and the engine emit into
//! rooms; sessions forward to their sockets. Inbound traffic is a
//! closed set of typed messages handled by one match.

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::cache::CacheStore;
use crate::dispatch::TickDispatcher;
use crate::models::{AlertStatus, Position, Result, TickwatchError};
use crate::proto::FeedBody;
use crate::store::AlertStore;
use crate::subscriptions::SubscriptionRegistry;
use crate::ticker::TickerHandle;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertStatusPayload {
    pub alert_id: String,
    pub status: AlertStatus,
    pub symbol: String,
    pub price: f64,
    pub position: Position,
    pub trade_type: String,
    pub entry_crossed: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertTriggeredPayload {
    pub alert_id: String,
    pub symbol: String,
    pub status: AlertStatus,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

// ServerMessage is everything the core emits to a client socket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerMessage {
    #[serde(rename = "tick")]
    Tick {
        symbol: String,
        tick: serde_json::Value,
    },
    #[serde(rename = "alert_status_updated")]
    AlertStatusUpdated(AlertStatusPayload),
    #[serde(rename = "alert_triggered")]
    AlertTriggered(AlertTriggeredPayload),
    #[serde(rename = "ws-reconnected")]
    WsReconnected,
    #[serde(rename = "error")]
    Error { message: String },
}

// ClientMessage is everything a client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "addStock")]
    AddStock { symbol: String },
    #[serde(rename = "removeStock")]
    RemoveStock { symbol: String },
    // Served by the history subsystem, not the core.
    #[serde(rename = "request-history")]
    RequestHistory(serde_json::Value),
    // Testing only: inject a tick as if decoded from the feed.
    #[serde(rename = "tick")]
    Tick {
        symbol: String,
        tick: serde_json::Value,
    },
}

type SessionSender = mpsc::UnboundedSender<ServerMessage>;

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// Rooms maps room names to the sessions currently joined. Emission is
// synchronous and never blocks a producer: sends go through unbounded
// session channels.
#[derive(Default)]
pub struct Rooms {
    inner: Mutex<HashMap<String, HashMap<u64, SessionSender>>>,
}

impl Rooms {
    pub fn new() -> Arc<Self> {
        Arc::new(Rooms::default())
    }

    pub fn user_room(user_id: &str) -> String {
        format!("user:{}", user_id)
    }

    pub fn join(&self, room: &str, session_id: u64, sender: SessionSender) {
        let mut rooms = relock(&self.inner);
        rooms
            .entry(room.to_owned())
            .or_default()
            .insert(session_id, sender);
    }

    pub fn leave(&self, room: &str, session_id: u64) {
        let mut rooms = relock(&self.inner);
        if let Some(members) = rooms.get_mut(room) {
            members.remove(&session_id);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }

    pub fn remove_session(&self, session_id: u64) {
        let mut rooms = relock(&self.inner);
        rooms.retain(|_, members| {
            members.remove(&session_id);
            !members.is_empty()
        });
    }

    pub fn emit(&self, room: &str, message: ServerMessage) {
        let rooms = relock(&self.inner);
        if let Some(members) = rooms.get(room) {
            for sender in members.values() {
                let _ = sender.send(message.clone());
            }
        }
    }

    /// Emits to every connected session exactly once.
    pub fn broadcast(&self, message: ServerMessage) {
        let rooms = relock(&self.inner);
        let mut seen = BTreeSet::new();
        for members in rooms.values() {
            for (session_id, sender) in members {
                if seen.insert(*session_id) {
                    let _ = sender.send(message.clone());
                }
            }
        }
    }

    pub fn room_count(&self) -> usize {
        relock(&self.inner).len()
    }

    pub fn session_count(&self) -> usize {
        let rooms = relock(&self.inner);
        let mut seen = BTreeSet::new();
        for members in rooms.values() {
            seen.extend(members.keys().copied());
        }
        seen.len()
    }

    pub fn members(&self, room: &str) -> usize {
        relock(&self.inner)
            .get(room)
            .map(HashMap::len)
            .unwrap_or(0)
    }
}

// Session authentication is owned by the external gateway; the core
// only verifies that the connection came through it.
#[async_trait::async_trait]
pub trait SessionAuth: Send + Sync {
    async fn authenticate(&self, user_id: &str, token: &str) -> bool;
}

pub struct GatewaySecretAuth {
    secret: String,
}

impl GatewaySecretAuth {
    pub fn new(secret: &str) -> Arc<Self> {
        Arc::new(GatewaySecretAuth {
            secret: secret.to_owned(),
        })
    }
}

#[async_trait::async_trait]
impl SessionAuth for GatewaySecretAuth {
    async fn authenticate(&self, _user_id: &str, token: &str) -> bool {
        !self.secret.is_empty() && token == self.secret
    }
}

pub struct SessionServer {
    bind_addr: String,
    rooms: Arc<Rooms>,
    cache: Arc<dyn CacheStore>,
    store: Arc<dyn AlertStore>,
    registry: Arc<SubscriptionRegistry>,
    ticker: TickerHandle,
    dispatcher: Arc<TickDispatcher>,
    auth: Arc<dyn SessionAuth>,
    next_session: AtomicU64,
    user_sessions: Mutex<HashMap<String, usize>>,
}

impl SessionServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bind_addr: &str,
        rooms: Arc<Rooms>,
        cache: Arc<dyn CacheStore>,
        store: Arc<dyn AlertStore>,
        registry: Arc<SubscriptionRegistry>,
        ticker: TickerHandle,
        dispatcher: Arc<TickDispatcher>,
        auth: Arc<dyn SessionAuth>,
    ) -> Arc<Self> {
        Arc::new(SessionServer {
            bind_addr: bind_addr.to_owned(),
            rooms,
            cache,
            store,
            registry,
            ticker,
            dispatcher,
            auth,
            next_session: AtomicU64::new(0),
            user_sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn session_count(&self) -> usize {
        relock(&self.user_sessions).values().sum()
    }

    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|e| TickwatchError::other(format!("bind {} failed: {}", self.bind_addr, e)))?;
        log::info!("session server listening on {}", self.bind_addr);
        self.run_on(listener, shutdown).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn run_on(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut shutdown_rx = shutdown.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            log::debug!("session connection from {}", peer);
                            let server = Arc::clone(&self);
                            let session_shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                server.handle_socket(stream, session_shutdown).await;
                            });
                        }
                        Err(e) => log::warn!("session accept failed: {}", e),
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }
        Ok(())
    }

    async fn handle_socket(self: Arc<Self>, stream: TcpStream, mut shutdown: watch::Receiver<bool>) {
        let mut query = None;
        let callback = |request: &Request, response: Response| {
            query = request.uri().query().map(str::to_owned);
            Ok(response)
        };
        let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                log::debug!("handshake failed: {}", e);
                return;
            }
        };
        let (mut ws_tx, mut ws_rx) = ws.split();

        let (user_id, token) = parse_credentials(query.as_deref());
        let authorized = match &user_id {
            Some(user_id) => self.auth.authenticate(user_id, token.as_deref().unwrap_or("")).await,
            None => false,
        };
        let Some(user_id) = user_id.filter(|_| authorized) else {
            let refusal = ServerMessage::Error {
                message: "unauthorized".to_owned(),
            };
            if let Ok(json) = serde_json::to_string(&refusal) {
                let _ = ws_tx.send(Message::Text(json.into())).await;
            }
            let _ = ws_tx.close().await;
            return;
        };

        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
        {
            let mut users = relock(&self.user_sessions);
            *users.entry(user_id.clone()).or_insert(0) += 1;
        }

        // Alerts and watchlist load in parallel; the union is the
        // session's starting instrument set.
        let (alert_instruments, watchlist) = tokio::join!(
            self.store.user_alert_instruments(&user_id),
            self.cache.user_stocks(&user_id),
        );
        let mut instruments: BTreeSet<String> = BTreeSet::new();
        match alert_instruments {
            Ok(list) => instruments.extend(list),
            Err(e) => log::warn!("alert instruments for {} unavailable: {}", user_id, e),
        }
        match watchlist {
            Ok(list) => instruments.extend(list),
            Err(e) => log::warn!("watchlist for {} unavailable: {}", user_id, e),
        }

        self.rooms
            .join(&Rooms::user_room(&user_id), session_id, tx.clone());
        let mut joined: BTreeSet<String> = instruments;
        for instrument in &joined {
            self.rooms.join(instrument, session_id, tx.clone());
        }
        let initial: Vec<String> = joined.iter().cloned().collect();
        self.register_instruments(&user_id, &initial, &tx).await;

        loop {
            tokio::select! {
                outbound = rx.recv() => {
                    match outbound {
                        Some(message) => {
                            let json = match serde_json::to_string(&message) {
                                Ok(json) => json,
                                Err(e) => {
                                    log::warn!("outbound message not serializable: {}", e);
                                    continue;
                                }
                            };
                            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                inbound = ws_rx.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_client_message(&user_id, session_id, &tx, &mut joined, &text)
                                .await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::debug!("session {} socket error: {}", session_id, e);
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        self.rooms.remove_session(session_id);
        let last_for_user = {
            let mut users = relock(&self.user_sessions);
            match users.get_mut(&user_id) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        users.remove(&user_id);
                        true
                    } else {
                        false
                    }
                }
                None => true,
            }
        };
        if last_for_user {
            let instruments: Vec<String> = joined.into_iter().collect();
            self.user_cleanup(&user_id, &instruments).await;
        }
    }

    async fn handle_client_message(
        &self,
        user_id: &str,
        session_id: u64,
        tx: &SessionSender,
        joined: &mut BTreeSet<String>,
        text: &str,
    ) {
        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                // Errors on socket events go to that socket only.
                let _ = tx.send(ServerMessage::Error {
                    message: format!("unrecognized message: {}", e),
                });
                return;
            }
        };

        match message {
            ClientMessage::AddStock { symbol } => {
                if let Err(e) = self.cache.add_user_stock(user_id, &symbol).await {
                    log::warn!("watchlist add for {} failed: {}", user_id, e);
                }
                self.rooms.join(&symbol, session_id, tx.clone());
                joined.insert(symbol.clone());
                self.register_instruments(user_id, &[symbol], tx).await;
            }
            ClientMessage::RemoveStock { symbol } => {
                if let Err(e) = self.cache.remove_user_stock(user_id, &symbol).await {
                    log::warn!("watchlist remove for {} failed: {}", user_id, e);
                }
                self.rooms.leave(&symbol, session_id);
                joined.remove(&symbol);
                self.release_instrument(user_id, &symbol).await;
            }
            ClientMessage::RequestHistory(_) => {
                // The history subsystem sits outside the core.
                log::debug!("history request from {} ignored", user_id);
            }
            ClientMessage::Tick { symbol, tick } => {
                // Accept either a full feed body or a bare {ltp, cp}.
                let parsed = serde_json::from_value::<FeedBody>(tick.clone())
                    .ok()
                    .filter(|body| body.ltp().is_some());
                let body = match parsed {
                    Some(body) => body,
                    None => match tick.get("ltp").and_then(serde_json::Value::as_f64) {
                        Some(ltp) => FeedBody::from_ltp(
                            ltp,
                            tick.get("cp").and_then(serde_json::Value::as_f64),
                        ),
                        None => {
                            let _ = tx.send(ServerMessage::Error {
                                message: "tick payload needs an ltp".to_owned(),
                            });
                            return;
                        }
                    },
                };
                self.dispatcher.on_tick(&symbol, body).await;
            }
        }
    }

    // Registers viewer interest, subscribes upstream on fresh 0-to-1
    // edges with no cached price, and emits one initial tick per
    // instrument from a single batched read.
    async fn register_instruments(&self, user_id: &str, instruments: &[String], tx: &SessionSender) {
        if instruments.is_empty() {
            return;
        }

        let mut first_viewer: BTreeSet<String> = BTreeSet::new();
        for instrument in instruments {
            match self.cache.add_viewer(instrument, user_id).await {
                Ok(1) => {
                    first_viewer.insert(instrument.clone());
                }
                Ok(_) => {}
                Err(e) => log::warn!("viewer registration for {} failed: {}", instrument, e),
            }
            if let Err(e) = self.cache.add_global(instrument).await {
                log::warn!("global registration for {} failed: {}", instrument, e);
            }
        }

        let ticks = self
            .cache
            .last_ticks(instruments)
            .await
            .unwrap_or_else(|e| {
                log::warn!("batched tick read failed: {}", e);
                vec![None; instruments.len()]
            });
        let closes = self
            .cache
            .last_closes(instruments)
            .await
            .unwrap_or_else(|e| {
                log::warn!("batched close read failed: {}", e);
                vec![None; instruments.len()]
            });

        let mut to_subscribe = Vec::new();
        for (index, instrument) in instruments.iter().enumerate() {
            let cached = ticks.get(index).map(Option::is_some).unwrap_or(false)
                || closes.get(index).map(Option::is_some).unwrap_or(false);
            if first_viewer.contains(instrument) && !cached {
                to_subscribe.push(instrument.clone());
            }
        }
        if !to_subscribe.is_empty() {
            if let Err(e) = self.ticker.subscribe(to_subscribe) {
                log::warn!("upstream subscribe failed: {}", e);
            }
        }

        for (index, instrument) in instruments.iter().enumerate() {
            let tick = ticks
                .get(index)
                .and_then(Option::as_ref)
                .and_then(|json| serde_json::from_str::<serde_json::Value>(json).ok())
                .or_else(|| {
                    closes
                        .get(index)
                        .and_then(Option::as_ref)
                        .and_then(|raw| raw.parse::<f64>().ok())
                        .and_then(|close| {
                            serde_json::to_value(FeedBody::from_ltp(close, Some(close))).ok()
                        })
                });
            if let Some(tick) = tick {
                let _ = tx.send(ServerMessage::Tick {
                    symbol: instrument.clone(),
                    tick,
                });
            }
        }
    }

    // The last viewer leaving unsubscribes upstream unless the
    // instrument is held by a persistent alert.
    async fn release_instrument(&self, user_id: &str, instrument: &str) {
        match self.cache.remove_viewer(instrument, user_id).await {
            Ok(0) => match self.registry.should_subscribe(instrument).await {
                Ok(true) => {}
                Ok(false) => {
                    if let Err(e) = self.ticker.unsubscribe(vec![instrument.to_owned()]) {
                        log::warn!("upstream unsubscribe failed: {}", e);
                    }
                    if let Err(e) = self.cache.remove_global(instrument).await {
                        log::warn!("global removal for {} failed: {}", instrument, e);
                    }
                }
                Err(e) => log::warn!("interest check for {} failed: {}", instrument, e),
            },
            Ok(_) => {}
            Err(e) => log::warn!("viewer removal for {} failed: {}", instrument, e),
        }
    }

    // Runs when a user's last session disconnects: drop their viewer
    // registrations but keep anything their active alerts still need.
    async fn user_cleanup(&self, user_id: &str, instruments: &[String]) {
        for instrument in instruments {
            self.release_instrument(user_id, instrument).await;
        }
    }
}

fn parse_credentials(query: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(query) = query else {
        return (None, None);
    };
    let mut user_id = None;
    let mut token = None;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "user_id" => user_id = Some(value.into_owned()),
            "token" => token = Some(value.into_owned()),
            _ => {}
        }
    }
    (user_id, token)
}
