use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod error;

pub use error::{Result, TickwatchError, TickwatchErrorKind};

// AlertStatus represents the state machine position of an alert.
// slHit and targetHit are terminal; an alert in a terminal status is
// never re-evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlertStatus {
    Pending,
    NearEntry,
    Enter,
    Running,
    SlHit,
    TargetHit,
}

impl AlertStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AlertStatus::SlHit | AlertStatus::TargetHit)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Pending => "pending",
            AlertStatus::NearEntry => "nearEntry",
            AlertStatus::Enter => "enter",
            AlertStatus::Running => "running",
            AlertStatus::SlHit => "slHit",
            AlertStatus::TargetHit => "targetHit",
        }
    }
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Position is the direction of the trading plan. Each variant carries
// its own predicate set; the engine never branches on the raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Long,
    Short,
}

impl Position {
    // Stop loss is inclusive in both directions.
    pub fn sl_hit(&self, ltp: f64, stop_loss: f64) -> bool {
        match self {
            Position::Long => ltp <= stop_loss,
            Position::Short => ltp >= stop_loss,
        }
    }

    // Target is inclusive in both directions.
    pub fn target_hit(&self, ltp: f64, target: f64) -> bool {
        match self {
            Position::Long => ltp >= target,
            Position::Short => ltp <= target,
        }
    }

    // Price is inside the activation zone, strictly between stop loss
    // and entry.
    pub fn enters(&self, ltp: f64, entry: f64, stop_loss: f64) -> bool {
        match self {
            Position::Long => ltp < entry && ltp > stop_loss,
            Position::Short => ltp > entry && ltp < stop_loss,
        }
    }

    // Price crossed the entry level between the previous evaluation
    // and this one.
    pub fn crossed_entry(&self, prev: f64, ltp: f64, entry: f64) -> bool {
        match self {
            Position::Long => prev < entry && ltp >= entry,
            Position::Short => prev > entry && ltp <= entry,
        }
    }

    // Price is on the far side of entry but within a 1% band of it.
    pub fn near_entry(&self, ltp: f64, entry: f64) -> bool {
        match self {
            Position::Long => ltp > entry && (ltp - entry) / entry * 100.0 <= 1.0,
            Position::Short => ltp < entry && (entry - ltp) / entry * 100.0 <= 1.0,
        }
    }

    // Price sits between entry and target without touching either
    // boundary condition.
    pub fn still_running(&self, ltp: f64, entry: f64, stop_loss: f64, target: f64) -> bool {
        match self {
            Position::Long => entry <= ltp && ltp < target && ltp > stop_loss,
            Position::Short => target < ltp && ltp < stop_loss,
        }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Position::Long => f.write_str("long"),
            Position::Short => f.write_str("short"),
        }
    }
}

// User carries the delivery handles needed to notify an alert owner.
// The record itself is owned by the external auth subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub email_enabled: bool,
    #[serde(default)]
    pub device_token: Option<String>,
    #[serde(default)]
    pub telegram_chat_id: Option<String>,
    #[serde(default)]
    pub telegram_enabled: bool,
}

// Alert is a user-owned trading plan hydrated with its owner. Only the
// engine mutates status, entry_crossed and last_ltp; everything else
// is written by the external CRUD surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub user_id: String,
    pub instrument_key: String,
    pub trading_symbol: String,
    pub position: Position,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub target_price: f64,
    #[serde(default)]
    pub level: Option<i32>,
    #[serde(default)]
    pub trade_type: String,
    pub status: AlertStatus,
    #[serde(default)]
    pub entry_crossed: bool,
    #[serde(default)]
    pub last_ltp: Option<f64>,
    // Legacy fallback for the first evaluation; read but never written.
    #[serde(default)]
    pub cmp: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub owner: User,
}

impl Alert {
    // The reference price for the crossed-entry check: last evaluated
    // price, then the legacy cmp field, then the entry itself.
    pub fn prev_price(&self) -> f64 {
        self.last_ltp.or(self.cmp).unwrap_or(self.entry_price)
    }
}

// AlertUpdate is one state-machine step for one alert, applied to the
// in-memory cache first and batched into a single durable bulk write.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertUpdate {
    pub alert_id: String,
    pub user_id: String,
    pub old_status: AlertStatus,
    pub new_status: AlertStatus,
    pub entry_crossed: bool,
    pub ltp: f64,
}

impl AlertUpdate {
    pub fn status_changed(&self) -> bool {
        self.new_status != self.old_status
    }
}

// AlertDetails is the self-contained snapshot embedded in
// notification jobs; workers never re-read the alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertDetails {
    pub trading_symbol: String,
    pub status: AlertStatus,
    pub current_price: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub target_price: f64,
    pub position: Position,
    pub trade_type: String,
    #[serde(default)]
    pub level: Option<i32>,
    pub triggered_at: DateTime<Utc>,
}

impl AlertDetails {
    pub fn from_update(alert: &Alert, update: &AlertUpdate, at: DateTime<Utc>) -> Self {
        AlertDetails {
            trading_symbol: alert.trading_symbol.clone(),
            status: update.new_status,
            current_price: update.ltp,
            entry_price: alert.entry_price,
            stop_loss: alert.stop_loss,
            target_price: alert.target_price,
            position: alert.position,
            trade_type: alert.trade_type.clone(),
            level: alert.level,
            triggered_at: at,
        }
    }
}

// NotificationJob is the durable queue payload: a recipient handle and
// a frozen snapshot of the alert at trigger time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationJob {
    pub id: String,
    pub user_id: String,
    pub priority: u8,
    pub attempts: u32,
    pub recipient: String,
    pub alert_details: AlertDetails,
}

// Component health, surfaced by the coordinator. The HTTP endpoint
// that would serve this lives outside the core.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub upstream: UpstreamHealth,
    pub cache_ok: bool,
    pub store_ok: bool,
    pub sessions: usize,
    pub rooms: usize,
    pub queues: Vec<QueueDepth>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamHealth {
    pub state: String,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueDepth {
    pub channel: String,
    pub depth: u64,
}
