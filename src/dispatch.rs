//! Per-tick dispatch: coalesced last-tick persistence, broadcast
//! dedup, viewer fan-out and the non-blocking hand-off to the alert
//! engine. Nothing in this path waits on notification I/O.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

use crate::cache::CacheStore;
use crate::constants::app_constants::{LTP_MAP_CAPACITY, TICK_FLUSH_INTERVAL};
use crate::engine::EngineRouter;
use crate::models::Result;
use crate::proto::FeedBody;
use crate::sessions::{Rooms, ServerMessage};

// LtpMap is a capped instrument-to-price map with FIFO eviction. The
// cap keeps long-running processes bounded across arbitrarily wide
// instrument universes.
pub struct LtpMap {
    capacity: usize,
    values: HashMap<String, f64>,
    order: VecDeque<String>,
}

impl LtpMap {
    pub fn new(capacity: usize) -> Self {
        LtpMap {
            capacity: capacity.max(1),
            values: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&self, instrument: &str) -> Option<f64> {
        self.values.get(instrument).copied()
    }

    pub fn insert(&mut self, instrument: &str, price: f64) {
        if self.values.insert(instrument.to_owned(), price).is_none() {
            self.order.push_back(instrument.to_owned());
            while self.order.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.values.remove(&evicted);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

pub struct TickDispatcher {
    cache: Arc<dyn CacheStore>,
    rooms: Arc<Rooms>,
    router: EngineRouter,
    buffer: Mutex<HashMap<String, FeedBody>>,
    last_broadcast: Mutex<LtpMap>,
}

impl TickDispatcher {
    pub fn new(cache: Arc<dyn CacheStore>, rooms: Arc<Rooms>, router: EngineRouter) -> Arc<Self> {
        Arc::new(TickDispatcher {
            cache,
            rooms,
            router,
            buffer: Mutex::new(HashMap::new()),
            last_broadcast: Mutex::new(LtpMap::new(LTP_MAP_CAPACITY)),
        })
    }

    pub async fn on_tick(&self, instrument: &str, body: FeedBody) {
        // Coalesce: only the newest body per instrument survives until
        // the next flush.
        {
            let mut buffer = self.buffer.lock().await;
            buffer.insert(instrument.to_owned(), body.clone());
        }

        let ltp = body.ltp();

        // Broadcast dedup on the last traded price. Frames without a
        // price pass through; there is nothing to compare.
        let broadcast = match ltp {
            Some(price) => {
                let mut last = self.last_broadcast.lock().await;
                if last.get(instrument) == Some(price) {
                    false
                } else {
                    last.insert(instrument, price);
                    true
                }
            }
            None => true,
        };

        if broadcast {
            match serde_json::to_value(&body) {
                Ok(tick) => self.rooms.emit(
                    instrument,
                    ServerMessage::Tick {
                        symbol: instrument.to_owned(),
                        tick,
                    },
                ),
                Err(e) => log::warn!("tick for {} not serializable: {}", instrument, e),
            }
        }

        // Alert evaluation is handed off in-process; the engine does
        // its own per-instrument dedup.
        if let Some(price) = ltp {
            self.router.dispatch(instrument.to_owned(), price);
        }
    }

    /// Drains the coalescing buffer into one pipelined write against
    /// the cache store.
    pub async fn flush(&self) -> Result<()> {
        let drained: HashMap<String, FeedBody> = {
            let mut buffer = self.buffer.lock().await;
            std::mem::take(&mut *buffer)
        };
        if drained.is_empty() {
            return Ok(());
        }

        let mut ticks = Vec::with_capacity(drained.len());
        let mut closes = Vec::new();
        for (instrument, body) in &drained {
            match serde_json::to_string(body) {
                Ok(json) => ticks.push((instrument.clone(), json)),
                Err(e) => log::warn!("dropping unserializable tick for {}: {}", instrument, e),
            }
            if let Some(close) = body.close() {
                closes.push((instrument.clone(), close.to_string()));
            }
        }

        self.cache.put_ticks(&ticks).await?;
        if !closes.is_empty() {
            self.cache.put_closes(&closes).await?;
        }
        Ok(())
    }

    pub async fn buffered(&self) -> usize {
        self.buffer.lock().await.len()
    }

    pub fn spawn_flusher(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_FLUSH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = dispatcher.flush().await {
                            // Tick persistence is lossy by contract; a
                            // failed flush only widens the window.
                            log::warn!("tick buffer flush failed: {}", e);
                        }
                    }
                    _ = shutdown.changed() => {
                        if let Err(e) = dispatcher.flush().await {
                            log::warn!("final tick buffer flush failed: {}", e);
                        }
                        break;
                    }
                }
            }
        })
    }
}
