//! In-process cache of every non-terminal alert, keyed by instrument.
//!
//! A background refresher rebuilds the map from the durable store
//! every 30 s (or on demand after external CRUD) and swaps it in
//! whole; the engine mutates entries in place between refreshes. The
//! engine refuses to process ticks until the first refresh lands.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};

use crate::models::{Alert, AlertUpdate, Result};
use crate::store::AlertStore;

pub struct AlertCache {
    alerts: RwLock<HashMap<String, Vec<Alert>>>,
    store: Arc<dyn AlertStore>,
    refresh_lock: Mutex<()>,
    ready: AtomicBool,
}

impl AlertCache {
    pub fn new(store: Arc<dyn AlertStore>) -> Arc<Self> {
        Arc::new(AlertCache {
            alerts: RwLock::new(HashMap::new()),
            store,
            refresh_lock: Mutex::new(()),
            ready: AtomicBool::new(false),
        })
    }

    /// True once the first refresh has completed.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Rebuilds the map from the durable store and swaps it in.
    /// Returns false when a refresh was already in flight (the
    /// concurrent request is a no-op by design of the caller contract).
    pub async fn refresh(&self) -> Result<bool> {
        let _guard = match self.refresh_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => return Ok(false),
        };

        let loaded = self.store.load_active_alerts().await?;
        let mut fresh: HashMap<String, Vec<Alert>> = HashMap::new();
        for alert in loaded {
            fresh
                .entry(alert.instrument_key.clone())
                .or_default()
                .push(alert);
        }

        let mut map = self.alerts.write().await;
        *map = fresh;
        drop(map);

        self.ready.store(true, Ordering::Release);
        Ok(true)
    }

    /// Cloned working set for one instrument.
    pub async fn alerts_for(&self, instrument: &str) -> Vec<Alert> {
        let map = self.alerts.read().await;
        map.get(instrument).cloned().unwrap_or_default()
    }

    pub async fn instrument_count(&self) -> usize {
        self.alerts.read().await.len()
    }

    pub async fn alert_count(&self) -> usize {
        self.alerts.read().await.values().map(Vec::len).sum()
    }

    /// Applies one state-machine step in place. Terminal transitions
    /// remove the alert from the working set so it is never
    /// re-evaluated.
    pub async fn apply(&self, update: &AlertUpdate, instrument: &str) {
        let mut map = self.alerts.write().await;
        let Some(list) = map.get_mut(instrument) else {
            return;
        };

        if update.new_status.is_terminal() {
            list.retain(|a| a.id != update.alert_id);
            if list.is_empty() {
                map.remove(instrument);
            }
            return;
        }

        if let Some(alert) = list.iter_mut().find(|a| a.id == update.alert_id) {
            alert.status = update.new_status;
            alert.entry_crossed = update.entry_crossed;
            alert.last_ltp = Some(update.ltp);
        }
    }

    /// Mirrors a permanent chat-channel failure onto the hydrated
    /// owners so in-flight evaluations stop enqueueing chat jobs.
    pub async fn disable_owner_telegram(&self, user_id: &str) {
        let mut map = self.alerts.write().await;
        for list in map.values_mut() {
            for alert in list.iter_mut().filter(|a| a.user_id == user_id) {
                alert.owner.telegram_enabled = false;
                alert.owner.telegram_chat_id = None;
            }
        }
    }

    /// Same, for a bouncing email address.
    pub async fn disable_owner_email(&self, user_id: &str) {
        let mut map = self.alerts.write().await;
        for list in map.values_mut() {
            for alert in list.iter_mut().filter(|a| a.user_id == user_id) {
                alert.owner.email_enabled = false;
            }
        }
    }

    /// Same, for an invalid push token.
    pub async fn clear_owner_device_token(&self, user_id: &str) {
        let mut map = self.alerts.write().await;
        for list in map.values_mut() {
            for alert in list.iter_mut().filter(|a| a.user_id == user_id) {
                alert.owner.device_token = None;
            }
        }
    }

    pub fn spawn_refresher(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = cache.refresh().await {
                            log::error!("alert cache refresh failed: {}", e);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}
