pub mod app_constants {
    use std::time::Duration;

    pub const TICKWATCH_NAME: &str = "tickwatch";
    pub const TICKWATCH_VERSION: &str = env!("CARGO_PKG_VERSION");

    // Upstream feed client
    pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 10;
    pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
    pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);
    pub const RECONNECT_JITTER: Duration = Duration::from_secs(2);

    // Tick dispatch
    pub const TICK_FLUSH_INTERVAL: Duration = Duration::from_millis(100);
    pub const LAST_TICK_TTL_SECS: i64 = 24 * 60 * 60;
    pub const LTP_MAP_CAPACITY: usize = 8_192;
    pub const DEFAULT_ENGINE_WORKERS: usize = 4;

    // Background reconcilers
    pub const ALERT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
    pub const SUBSCRIPTION_SYNC_INTERVAL: Duration = Duration::from_secs(60);

    // Durable store
    pub const BULK_WRITE_TIMEOUT: Duration = Duration::from_secs(15);

    // Notification dispatch
    pub const NOTIFY_MAX_ATTEMPTS: u32 = 3;
    pub const NOTIFY_BACKOFF_BASE: Duration = Duration::from_secs(2);
    pub const DEFAULT_EMAIL_RATE_PER_SEC: u32 = 5;
    pub const DEFAULT_CHAT_RATE_PER_SEC: u32 = 10;
    pub const COMPLETED_PURGE_INTERVAL: Duration = Duration::from_secs(60);
    pub const COMPLETED_RETENTION: Duration = Duration::from_secs(60 * 60);
    pub const PRIORITY_TERMINAL: u8 = 1;
    pub const PRIORITY_ENTER: u8 = 2;
}

// Cache-store key layout. Every shared structure in the cache store is
// named here so the hot path and the reconcilers cannot drift apart.
pub struct Keys;

impl Keys {
    pub const LAST_TICK: &'static str = "stock:lastTick";
    pub const LAST_CLOSE: &'static str = "stock:lastClose";
    pub const GLOBAL_STOCKS: &'static str = "global:stocks";
    pub const PERSISTENT_STOCKS: &'static str = "persistent:stocks";

    pub fn stock_users(instrument: &str) -> String {
        format!("stock:{}:users", instrument)
    }

    pub fn user_stocks(user_id: &str) -> String {
        format!("user:{}:stocks", user_id)
    }

    pub fn queue_due(channel: &str) -> String {
        format!("notify:{}:due", channel)
    }

    pub fn queue_jobs(channel: &str) -> String {
        format!("notify:{}:jobs", channel)
    }

    pub fn queue_done(channel: &str) -> String {
        format!("notify:{}:done", channel)
    }
}

// Socket event names shared with connected clients.
pub struct Events;

impl Events {
    pub const TICK: &'static str = "tick";
    pub const ALERT_STATUS_UPDATED: &'static str = "alert_status_updated";
    pub const ALERT_TRIGGERED: &'static str = "alert_triggered";
    pub const WS_RECONNECTED: &'static str = "ws-reconnected";
    pub const ADD_STOCK: &'static str = "addStock";
    pub const REMOVE_STOCK: &'static str = "removeStock";
    pub const REQUEST_HISTORY: &'static str = "request-history";
}

// Upstream subscribe protocol labels.
pub struct Labels;

impl Labels {
    pub const METHOD_SUB: &'static str = "sub";
    pub const METHOD_UNSUB: &'static str = "unsub";
    pub const MODE_FULL: &'static str = "full";
}
