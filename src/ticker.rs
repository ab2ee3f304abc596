use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use prost::Message as _;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::constants::app_constants::*;
use crate::constants::Labels;
use crate::models::{Result, TickwatchError, TickwatchErrorKind};
use crate::proto::{FeedBody, FeedResponse};

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

// ConnectionState tracks the upstream socket lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
        }
    }
}

// Command types for internal communication
#[derive(Debug, Clone)]
enum TickerCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

// Event types for the ticker
#[derive(Debug, Clone)]
pub enum TickerEvent {
    Tick { instrument: String, body: FeedBody },
    Connect { reconnected: bool },
    Close(u16, String),
    Error(String),
    Reconnect(u32, Duration),
    Exhausted(u32),
}

// Source of the upstream bearer token; fetched lazily per connect
// attempt so an externally refreshed token is picked up without a
// restart.
#[async_trait::async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn feed_token(&self) -> Result<Option<String>>;
}

// Source of the full subscription set re-issued after a reconnect
// (interactive viewers plus persistent-alert stocks).
#[async_trait::async_trait]
pub trait ResubscribeSource: Send + Sync {
    async fn resubscribe_set(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Serialize)]
struct SubscribeFrame<'a> {
    guid: String,
    method: &'static str,
    data: SubscribeData<'a>,
}

#[derive(Debug, Serialize)]
struct SubscribeData<'a> {
    mode: &'static str,
    #[serde(rename = "instrumentKeys")]
    instrument_keys: &'a [String],
}

#[derive(Debug, Deserialize)]
struct AuthEnvelope {
    data: AuthData,
}

#[derive(Debug, Deserialize)]
struct AuthData {
    authorized_redirect_uri: String,
}

// Handle for controlling the ticker after it starts
#[derive(Clone)]
pub struct TickerHandle {
    command_sender: mpsc::UnboundedSender<TickerCommand>,
    event_sender: broadcast::Sender<TickerEvent>,
    state: watch::Receiver<ConnectionState>,
}

impl TickerHandle {
    pub fn subscribe(&self, instruments: Vec<String>) -> Result<()> {
        if instruments.is_empty() {
            return Ok(());
        }
        self.command_sender
            .send(TickerCommand::Subscribe(instruments))
            .map_err(|_| TickwatchError::transport("ticker command channel closed"))
    }

    pub fn unsubscribe(&self, instruments: Vec<String>) -> Result<()> {
        if instruments.is_empty() {
            return Ok(());
        }
        self.command_sender
            .send(TickerCommand::Unsubscribe(instruments))
            .map_err(|_| TickwatchError::transport("ticker command channel closed"))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TickerEvent> {
        self.event_sender.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }
}

pub struct Ticker {
    auth_url: String,
    http_client: reqwest::Client,
    tokens: Arc<dyn AccessTokenSource>,
    resubscribe_source: Option<Arc<dyn ResubscribeSource>>,
    auto_reconnect: bool,
    reconnect_max_attempts: u32,
    reconnect_base_delay: Duration,
    reconnect_max_delay: Duration,
    reconnect_jitter: Duration,
    connect_timeout: Duration,
    auth_timeout: Duration,
    subscribed: HashSet<String>,
    // channels
    state_sender: watch::Sender<ConnectionState>,
    event_sender: broadcast::Sender<TickerEvent>,
    command_receiver: mpsc::UnboundedReceiver<TickerCommand>,
    command_sender: mpsc::UnboundedSender<TickerCommand>,
}

impl Ticker {
    pub fn new(auth_url: &str, tokens: Arc<dyn AccessTokenSource>) -> (Self, TickerHandle) {
        let (event_tx, _) = broadcast::channel(10_000);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let ticker = Self {
            auth_url: auth_url.to_owned(),
            http_client: reqwest::Client::new(),
            tokens,
            resubscribe_source: None,
            auto_reconnect: true,
            reconnect_max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
            reconnect_base_delay: RECONNECT_BASE_DELAY,
            reconnect_max_delay: RECONNECT_MAX_DELAY,
            reconnect_jitter: RECONNECT_JITTER,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            subscribed: HashSet::new(),
            state_sender: state_tx,
            event_sender: event_tx.clone(),
            command_receiver: command_rx,
            command_sender: command_tx.clone(),
        };

        let handle = TickerHandle {
            command_sender: command_tx,
            event_sender: event_tx,
            state: state_rx,
        };

        (ticker, handle)
    }

    pub fn builder(auth_url: &str, tokens: Arc<dyn AccessTokenSource>) -> TickerBuilder {
        TickerBuilder::new(auth_url, tokens)
    }

    pub fn set_resubscribe_source(&mut self, source: Arc<dyn ResubscribeSource>) {
        self.resubscribe_source = Some(source);
    }

    pub fn set_auto_reconnect(&mut self, enable: bool) {
        self.auto_reconnect = enable;
    }

    pub fn set_reconnect_max_attempts(&mut self, attempts: u32) {
        self.reconnect_max_attempts = attempts;
    }

    pub fn set_reconnect_max_delay(&mut self, delay: Duration) -> Result<()> {
        if delay < self.reconnect_base_delay {
            return Err(TickwatchError::config(format!(
                "reconnect max delay can't be less than the base delay ({:?})",
                self.reconnect_base_delay
            )));
        }
        self.reconnect_max_delay = delay;
        Ok(())
    }

    pub fn set_connect_timeout(&mut self, timeout: Duration) {
        self.connect_timeout = timeout;
    }

    // Jittered exponential backoff: base * 2^(attempt-1) plus up to
    // the jitter window, capped at the max delay.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .reconnect_base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let jitter_ms = self.reconnect_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        (exp + jitter).min(self.reconnect_max_delay)
    }

    pub async fn serve(mut self) -> Result<()> {
        let mut attempts: u32 = 0;

        loop {
            if attempts >= self.reconnect_max_attempts {
                let _ = self.event_sender.send(TickerEvent::Exhausted(attempts));
                let _ = self.state_sender.send(ConnectionState::Disconnected);
                return Err(TickwatchError::new(TickwatchErrorKind::UpstreamExhausted(
                    attempts,
                )));
            }

            if attempts > 0 {
                let delay = self.reconnect_delay(attempts);
                let _ = self
                    .event_sender
                    .send(TickerEvent::Reconnect(attempts, delay));
                sleep(delay).await;
            }

            // Commands issued while disconnected only adjust the local
            // bookkeeping; the reconnect re-derives the upstream state.
            self.drain_pending_commands();

            let _ = self.state_sender.send(ConnectionState::Connecting);

            let ws_url = match self.authorize().await {
                Ok(url) => url,
                Err(e) => {
                    let _ = self.event_sender.send(TickerEvent::Error(e.to_string()));
                    let _ = self.state_sender.send(ConnectionState::Disconnected);
                    if !self.auto_reconnect {
                        return Err(e);
                    }
                    attempts += 1;
                    continue;
                }
            };

            match tokio::time::timeout(self.connect_timeout, connect_async(ws_url.as_str())).await {
                Ok(Ok((ws_stream, _))) => {
                    let reconnected = attempts > 0;
                    attempts = 0;

                    let _ = self.state_sender.send(ConnectionState::Open);
                    let _ = self.event_sender.send(TickerEvent::Connect { reconnected });

                    // Initial connect and reconnect both derive the
                    // subscription set the same way and issue one sub.
                    self.resubscribe().await;

                    self.handle_connection(ws_stream).await;

                    let _ = self.state_sender.send(ConnectionState::Disconnected);
                    if !self.auto_reconnect {
                        return Ok(());
                    }
                }
                Ok(Err(e)) => {
                    let _ = self
                        .event_sender
                        .send(TickerEvent::Error(format!("connection failed: {}", e)));
                    let _ = self.state_sender.send(ConnectionState::Disconnected);
                    if !self.auto_reconnect {
                        return Err(e.into());
                    }
                }
                Err(_) => {
                    let _ = self.event_sender.send(TickerEvent::Error(format!(
                        "connection timed out after {:?}",
                        self.connect_timeout
                    )));
                    let _ = self.state_sender.send(ConnectionState::Disconnected);
                    if !self.auto_reconnect {
                        return Err(TickwatchError::transport("connection timed out"));
                    }
                }
            }

            attempts += 1;
        }
    }

    // Exchanges the bearer token for the ephemeral redirect URL.
    async fn authorize(&self) -> Result<String> {
        let token = self
            .tokens
            .feed_token()
            .await?
            .ok_or_else(|| TickwatchError::auth("no feed token in the durable store"))?;

        let response = self
            .http_client
            .get(&self.auth_url)
            .bearer_auth(token)
            .timeout(self.auth_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TickwatchError::auth(format!(
                "feed authorizer returned {}",
                status
            )));
        }

        let envelope: AuthEnvelope = response.json().await?;
        Ok(envelope.data.authorized_redirect_uri)
    }

    async fn handle_connection(
        &mut self,
        ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) {
        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => self.handle_frame(&data),
                        Some(Ok(Message::Text(_))) => {
                            // Upstream market-status notices; nothing to act on.
                        }
                        Some(Ok(Message::Close(close_frame))) => {
                            let _ = self.state_sender.send(ConnectionState::Closing);
                            let (code, reason) = match close_frame {
                                Some(frame) => (frame.code.into(), frame.reason.to_string()),
                                None => (1000, "normal closure".to_string()),
                            };
                            let _ = self.event_sender.send(TickerEvent::Close(code, reason));
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let _ = self
                                .event_sender
                                .send(TickerEvent::Error(format!("websocket error: {}", e)));
                            break;
                        }
                        None => {
                            let _ = self
                                .event_sender
                                .send(TickerEvent::Close(1006, "stream ended".to_string()));
                            break;
                        }
                    }
                }
                cmd = self.command_receiver.recv() => {
                    match cmd {
                        Some(command) => {
                            if let Err(e) = self.send_command(&mut write, command).await {
                                let _ = self
                                    .event_sender
                                    .send(TickerEvent::Error(format!("send failed: {}", e)));
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    }

    // A bad frame is logged and skipped; it never tears the
    // connection down.
    fn handle_frame(&self, data: &[u8]) {
        let response = match FeedResponse::decode(data) {
            Ok(response) => response,
            Err(e) => {
                log::warn!("skipping undecodable feed frame ({} bytes): {}", data.len(), e);
                return;
            }
        };

        for (instrument, body) in response.feeds {
            let _ = self.event_sender.send(TickerEvent::Tick { instrument, body });
        }
    }

    // The select loop is the only writer, so upstream frames are
    // naturally serialized.
    async fn send_command(&mut self, write: &mut WsWriter, command: TickerCommand) -> Result<()> {
        let (method, instruments) = match command {
            TickerCommand::Subscribe(instruments) => {
                for key in &instruments {
                    self.subscribed.insert(key.clone());
                }
                (Labels::METHOD_SUB, instruments)
            }
            TickerCommand::Unsubscribe(instruments) => {
                for key in &instruments {
                    self.subscribed.remove(key);
                }
                (Labels::METHOD_UNSUB, instruments)
            }
        };

        let frame = SubscribeFrame {
            guid: format!("{:016x}", rand::thread_rng().gen::<u64>()),
            method,
            data: SubscribeData {
                mode: Labels::MODE_FULL,
                instrument_keys: &instruments,
            },
        };

        let payload = serde_json::to_string(&frame)?;
        write.send(Message::Text(payload.into())).await?;
        Ok(())
    }

    fn drain_pending_commands(&mut self) {
        while let Ok(command) = self.command_receiver.try_recv() {
            match command {
                TickerCommand::Subscribe(instruments) => {
                    self.subscribed.extend(instruments);
                }
                TickerCommand::Unsubscribe(instruments) => {
                    for key in &instruments {
                        self.subscribed.remove(key);
                    }
                }
            }
        }
    }

    // After a reconnect the full interest set is re-derived and
    // re-issued as one `sub` frame.
    async fn resubscribe(&mut self) {
        let instruments: Vec<String> = match &self.resubscribe_source {
            Some(source) => match source.resubscribe_set().await {
                Ok(instruments) => instruments,
                Err(e) => {
                    log::warn!("resubscribe set unavailable, using tracked set: {}", e);
                    self.subscribed.iter().cloned().collect()
                }
            },
            None => self.subscribed.iter().cloned().collect(),
        };

        if instruments.is_empty() {
            return;
        }

        self.subscribed = instruments.iter().cloned().collect();
        let _ = self
            .command_sender
            .send(TickerCommand::Subscribe(instruments));
    }
}

pub struct TickerBuilder {
    auth_url: String,
    tokens: Arc<dyn AccessTokenSource>,
    resubscribe_source: Option<Arc<dyn ResubscribeSource>>,
    auto_reconnect: Option<bool>,
    reconnect_max_attempts: Option<u32>,
    reconnect_max_delay: Option<Duration>,
    connect_timeout: Option<Duration>,
}

impl TickerBuilder {
    pub fn new(auth_url: &str, tokens: Arc<dyn AccessTokenSource>) -> Self {
        Self {
            auth_url: auth_url.to_owned(),
            tokens,
            resubscribe_source: None,
            auto_reconnect: None,
            reconnect_max_attempts: None,
            reconnect_max_delay: None,
            connect_timeout: None,
        }
    }

    pub fn resubscribe_source(mut self, source: Arc<dyn ResubscribeSource>) -> Self {
        self.resubscribe_source = Some(source);
        self
    }

    pub fn auto_reconnect(mut self, enable: bool) -> Self {
        self.auto_reconnect = Some(enable);
        self
    }

    pub fn reconnect_max_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_max_attempts = Some(attempts);
        self
    }

    pub fn reconnect_max_delay(mut self, delay: Duration) -> Self {
        self.reconnect_max_delay = Some(delay);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<(Ticker, TickerHandle)> {
        let (mut ticker, handle) = Ticker::new(&self.auth_url, self.tokens);

        if let Some(source) = self.resubscribe_source {
            ticker.set_resubscribe_source(source);
        }
        if let Some(auto_reconnect) = self.auto_reconnect {
            ticker.set_auto_reconnect(auto_reconnect);
        }
        if let Some(attempts) = self.reconnect_max_attempts {
            ticker.set_reconnect_max_attempts(attempts);
        }
        if let Some(delay) = self.reconnect_max_delay {
            ticker.set_reconnect_max_delay(delay)?;
        }
        if let Some(timeout) = self.connect_timeout {
            ticker.set_connect_timeout(timeout);
        }

        Ok((ticker, handle))
    }
}
