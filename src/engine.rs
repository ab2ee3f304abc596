//! The alert state machine.
//!
//! `transition` is the pure per-alert step; `AlertEngine::process`
//! runs it across every alert on an instrument for one tick, applies
//! the results to the in-memory cache first, persists them in a
//! single bulk write, and fans out notifications and live events.
//! `EngineRouter` pins each instrument to one worker so transitions
//! for a single alert are serialized and ordered while distinct
//! instruments evaluate in parallel.

use chrono::{DateTime, Utc};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::alert_cache::AlertCache;
use crate::constants::app_constants::LTP_MAP_CAPACITY;
use crate::dispatch::LtpMap;
use crate::models::{Alert, AlertStatus, AlertUpdate, Position};
use crate::notify::Notifier;
use crate::sessions::{AlertStatusPayload, AlertTriggeredPayload, Rooms, ServerMessage};
use crate::store::AlertStore;

/// One state-machine step. First matching rule wins; `entry_crossed`
/// only ever moves from false to true.
pub fn transition(
    position: Position,
    entry: f64,
    stop_loss: f64,
    target: f64,
    old_status: AlertStatus,
    entry_crossed: bool,
    prev: f64,
    ltp: f64,
) -> (AlertStatus, bool) {
    let mut crossed = entry_crossed;

    let status = if position.sl_hit(ltp, stop_loss) {
        AlertStatus::SlHit
    } else if position.target_hit(ltp, target) && crossed {
        AlertStatus::TargetHit
    } else if position.enters(ltp, entry, stop_loss) && !crossed {
        crossed = true;
        AlertStatus::Enter
    } else if crossed && position.crossed_entry(prev, ltp, entry) {
        AlertStatus::Running
    } else if matches!(old_status, AlertStatus::Enter | AlertStatus::Running)
        && crossed
        && (position.still_running(ltp, entry, stop_loss, target)
            || position.enters(ltp, entry, stop_loss))
    {
        AlertStatus::Running
    } else if position.near_entry(ltp, entry) && !crossed {
        AlertStatus::NearEntry
    } else {
        AlertStatus::Pending
    };

    (status, crossed)
}

fn step(alert: &Alert, ltp: f64) -> (AlertStatus, bool) {
    transition(
        alert.position,
        alert.entry_price,
        alert.stop_loss,
        alert.target_price,
        alert.status,
        alert.entry_crossed,
        alert.prev_price(),
        ltp,
    )
}

pub struct AlertEngine {
    cache: Arc<AlertCache>,
    store: Arc<dyn AlertStore>,
    notifier: Arc<Notifier>,
    rooms: Arc<Rooms>,
    last_processed: Mutex<LtpMap>,
}

impl AlertEngine {
    pub fn new(
        cache: Arc<AlertCache>,
        store: Arc<dyn AlertStore>,
        notifier: Arc<Notifier>,
        rooms: Arc<Rooms>,
    ) -> Arc<Self> {
        Arc::new(AlertEngine {
            cache,
            store,
            notifier,
            rooms,
            last_processed: Mutex::new(LtpMap::new(LTP_MAP_CAPACITY)),
        })
    }

    pub async fn process(&self, instrument: &str, ltp: f64) {
        if !ltp.is_finite() {
            return;
        }
        // Transitions before the first cache load would be dropped;
        // refuse until the refresher has run once.
        if !self.cache.is_ready() {
            return;
        }

        {
            let mut seen = self.last_processed.lock().await;
            if seen.get(instrument) == Some(ltp) {
                return;
            }
            seen.insert(instrument, ltp);
        }

        let alerts = self.cache.alerts_for(instrument).await;
        if alerts.is_empty() {
            return;
        }

        let now = Utc::now();
        let mut staged: Vec<(Alert, AlertUpdate)> = Vec::new();

        for alert in alerts {
            if alert.status.is_terminal() {
                continue;
            }

            let (new_status, crossed) = step(&alert, ltp);
            if new_status == alert.status
                && Some(ltp) == alert.last_ltp
                && crossed == alert.entry_crossed
            {
                continue;
            }

            let update = AlertUpdate {
                alert_id: alert.id.clone(),
                user_id: alert.user_id.clone(),
                old_status: alert.status,
                new_status,
                entry_crossed: crossed,
                ltp,
            };

            // Readers must see the new state immediately; the durable
            // write follows.
            self.cache.apply(&update, instrument).await;
            staged.push((alert, update));
        }

        if staged.is_empty() {
            return;
        }

        let updates: Vec<AlertUpdate> = staged.iter().map(|(_, u)| u.clone()).collect();
        if let Err(e) = self.store.bulk_update(&updates).await {
            // The cache already holds the new state; the next refresh
            // reconciles against whatever the store accepted.
            log::error!(
                "bulk write of {} alert update(s) for {} failed: {}",
                updates.len(),
                instrument,
                e
            );
        }

        for (alert, update) in &staged {
            if !update.status_changed() {
                continue;
            }
            self.emit_live(alert, update, now);
            if matches!(
                update.new_status,
                AlertStatus::Enter | AlertStatus::SlHit | AlertStatus::TargetHit
            ) {
                self.notifier.submit(alert, update, now).await;
            }
        }
    }

    fn emit_live(&self, alert: &Alert, update: &AlertUpdate, at: DateTime<Utc>) {
        let room = Rooms::user_room(&alert.user_id);

        self.rooms.emit(
            &room,
            ServerMessage::AlertStatusUpdated(AlertStatusPayload {
                alert_id: alert.id.clone(),
                status: update.new_status,
                symbol: alert.trading_symbol.clone(),
                price: update.ltp,
                position: alert.position,
                trade_type: alert.trade_type.clone(),
                entry_crossed: update.entry_crossed,
                timestamp: at,
            }),
        );

        if update.new_status.is_terminal() {
            self.rooms.emit(
                &room,
                ServerMessage::AlertTriggered(AlertTriggeredPayload {
                    alert_id: alert.id.clone(),
                    symbol: alert.trading_symbol.clone(),
                    status: update.new_status,
                    price: update.ltp,
                    timestamp: at,
                }),
            );
        }
    }
}

// EngineRouter fans ticks out to a fixed worker pool, hashed by
// instrument key.
#[derive(Clone)]
pub struct EngineRouter {
    workers: Arc<Vec<mpsc::UnboundedSender<(String, f64)>>>,
}

impl EngineRouter {
    pub fn start(
        engine: Arc<AlertEngine>,
        workers: usize,
    ) -> (Self, Vec<tokio::task::JoinHandle<()>>) {
        let count = workers.max(1);
        let mut senders = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);

        for _ in 0..count {
            let (tx, mut rx) = mpsc::unbounded_channel::<(String, f64)>();
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                while let Some((instrument, ltp)) = rx.recv().await {
                    engine.process(&instrument, ltp).await;
                }
            }));
            senders.push(tx);
        }

        (
            EngineRouter {
                workers: Arc::new(senders),
            },
            handles,
        )
    }

    /// Non-blocking hand-off from the decode path.
    pub fn dispatch(&self, instrument: String, ltp: f64) {
        let mut hasher = DefaultHasher::new();
        instrument.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.workers.len();
        let _ = self.workers[index].send((instrument, ltp));
    }
}
