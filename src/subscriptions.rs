//! Subscription interest bookkeeping.
//!
//! The registry answers "does anyone care about this instrument" from
//! the two interest sources (interactive viewers, persistent-alert
//! stocks) in one pipelined round-trip. The manager reconciles the
//! persistent set against the durable store once a minute and drives
//! the feed client accordingly.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::cache::CacheStore;
use crate::models::Result;
use crate::store::AlertStore;
use crate::ticker::{ResubscribeSource, TickerHandle};

pub struct SubscriptionRegistry {
    cache: Arc<dyn CacheStore>,
}

impl SubscriptionRegistry {
    pub fn new(cache: Arc<dyn CacheStore>) -> Arc<Self> {
        Arc::new(SubscriptionRegistry { cache })
    }

    pub async fn should_subscribe(&self, instrument: &str) -> Result<bool> {
        let interest = self.cache.interest(&[instrument.to_owned()]).await?;
        Ok(interest.first().map(|i| i.subscribable()).unwrap_or(false))
    }

    /// Keeps only the instruments with at least one interest source,
    /// resolved in a single pipelined round-trip.
    pub async fn filter_subscribable(&self, instruments: &[String]) -> Result<Vec<String>> {
        if instruments.is_empty() {
            return Ok(Vec::new());
        }
        let interest = self.cache.interest(instruments).await?;
        Ok(instruments
            .iter()
            .zip(interest)
            .filter(|(_, i)| i.subscribable())
            .map(|(instrument, _)| instrument.clone())
            .collect())
    }
}

#[async_trait]
impl ResubscribeSource for SubscriptionRegistry {
    // The reconnect subscription set: global viewer stocks united with
    // persistent-alert stocks, filtered down to live interest.
    async fn resubscribe_set(&self) -> Result<Vec<String>> {
        let mut union: BTreeSet<String> = self.cache.global_stocks().await?.into_iter().collect();
        union.extend(self.cache.persistent_stocks().await?);
        let instruments: Vec<String> = union.into_iter().collect();
        self.filter_subscribable(&instruments).await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub subscribed: Vec<String>,
    pub unsubscribed: Vec<String>,
}

// AlertSubscriptionManager keeps the persistent-stock set equal to
// the distinct instruments of non-terminal alerts.
pub struct AlertSubscriptionManager {
    store: Arc<dyn AlertStore>,
    cache: Arc<dyn CacheStore>,
    ticker: TickerHandle,
    running: AtomicBool,
}

impl AlertSubscriptionManager {
    pub fn new(
        store: Arc<dyn AlertStore>,
        cache: Arc<dyn CacheStore>,
        ticker: TickerHandle,
    ) -> Arc<Self> {
        Arc::new(AlertSubscriptionManager {
            store,
            cache,
            ticker,
            running: AtomicBool::new(false),
        })
    }

    /// One reconciliation pass. Overlapping invocations are excluded;
    /// the loser returns an empty outcome.
    pub async fn sync_once(&self) -> Result<SyncOutcome> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(SyncOutcome::default());
        }
        let outcome = self.sync_inner().await;
        self.running.store(false, Ordering::Release);
        outcome
    }

    async fn sync_inner(&self) -> Result<SyncOutcome> {
        let needed: HashSet<String> = self.store.active_instruments().await?.into_iter().collect();
        let current: HashSet<String> = self
            .cache
            .persistent_stocks()
            .await?
            .into_iter()
            .collect();

        let mut subscribed: Vec<String> = Vec::new();
        for instrument in needed.difference(&current) {
            self.cache.add_persistent(instrument).await?;
            subscribed.push(instrument.clone());
        }
        subscribed.sort();
        if !subscribed.is_empty() {
            self.ticker.subscribe(subscribed.clone())?;
        }

        let mut unsubscribed: Vec<String> = Vec::new();
        for instrument in current.difference(&needed) {
            self.cache.remove_persistent(instrument).await?;
            // Interactive viewers keep the upstream subscription alive.
            if self.cache.viewer_count(instrument).await? == 0 {
                unsubscribed.push(instrument.clone());
            }
        }
        unsubscribed.sort();
        if !unsubscribed.is_empty() {
            self.ticker.unsubscribe(unsubscribed.clone())?;
        }

        Ok(SyncOutcome {
            subscribed,
            unsubscribed,
        })
    }

    pub fn spawn(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match manager.sync_once().await {
                            Ok(outcome) => {
                                if !outcome.subscribed.is_empty() || !outcome.unsubscribed.is_empty() {
                                    log::info!(
                                        "subscription sync: +{} -{}",
                                        outcome.subscribed.len(),
                                        outcome.unsubscribed.len()
                                    );
                                }
                            }
                            // Transient; the next cycle recovers.
                            Err(e) => log::error!("subscription sync failed: {}", e),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}
