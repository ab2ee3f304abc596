pub mod app;
pub mod config;

pub mod cache;
pub mod proto;
pub mod store;

pub mod alert_cache;
pub mod dispatch;
pub mod engine;
pub mod notify;
pub mod sessions;
pub mod subscriptions;
pub mod ticker;

pub use app::App;
pub use config::Config;
pub use models::*;
pub use ticker::{ConnectionState, Ticker, TickerBuilder, TickerEvent, TickerHandle};

pub mod constants;
#[path = "models/mod.rs"]
pub mod models;
pub use constants::app_constants::*;
pub use constants::{Events, Keys, Labels};

// Re-export the tick hot path
pub use dispatch::{LtpMap, TickDispatcher};
pub use engine::{transition, AlertEngine, EngineRouter};

// Re-export alert state
pub use alert_cache::AlertCache;
pub use store::{AlertStore, MongoAlertStore};

// Re-export subscription bookkeeping
pub use cache::{CacheStore, Interest, RedisCacheStore};
pub use subscriptions::{AlertSubscriptionManager, SubscriptionRegistry, SyncOutcome};

// Re-export notification dispatch
pub use notify::{Channel, JobQueue, Notifier, RedisJobQueue, Transport, TransportError};

// Re-export the live fan-out surface
pub use sessions::{ClientMessage, Rooms, ServerMessage, SessionAuth, SessionServer};
