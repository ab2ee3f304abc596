//! In-memory fakes for the service seams, shared across the suites.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use tickwatch::models::{Alert, AlertStatus, AlertUpdate, NotificationJob, Position, Result, User};
use tickwatch::notify::{Channel, JobQueue, Transport, TransportError};
use tickwatch::cache::{CacheStore, Interest};
use tickwatch::store::AlertStore;

pub fn test_user(id: &str) -> User {
    User {
        id: id.to_owned(),
        email: format!("{}@example.com", id),
        email_enabled: true,
        device_token: None,
        telegram_chat_id: Some(format!("chat-{}", id)),
        telegram_enabled: true,
    }
}

pub fn long_alert(id: &str, instrument: &str, entry: f64, stop_loss: f64, target: f64) -> Alert {
    Alert {
        id: id.to_owned(),
        user_id: "u1".to_owned(),
        instrument_key: instrument.to_owned(),
        trading_symbol: format!("{}-EQ", instrument),
        position: Position::Long,
        entry_price: entry,
        stop_loss,
        target_price: target,
        level: Some(1),
        trade_type: "swing".to_owned(),
        status: AlertStatus::Pending,
        entry_crossed: false,
        last_ltp: None,
        cmp: None,
        created_at: Utc::now(),
        owner: test_user("u1"),
    }
}

pub fn short_alert(id: &str, instrument: &str, entry: f64, stop_loss: f64, target: f64) -> Alert {
    Alert {
        position: Position::Short,
        ..long_alert(id, instrument, entry, stop_loss, target)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Cache store fake
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryCacheStore {
    pub ticks: Mutex<HashMap<String, String>>,
    pub closes: Mutex<HashMap<String, String>>,
    pub viewers: Mutex<HashMap<String, Vec<String>>>,
    pub user_stocks: Mutex<HashMap<String, Vec<String>>>,
    pub global: Mutex<Vec<String>>,
    pub persistent: Mutex<Vec<String>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_persistent(instruments: &[&str]) -> Self {
        let store = Self::default();
        *lock(&store.persistent) = instruments.iter().map(|s| s.to_string()).collect();
        store
    }

    fn set_insert(set: &Mutex<Vec<String>>, value: &str) {
        let mut set = lock(set);
        if !set.iter().any(|v| v == value) {
            set.push(value.to_owned());
        }
    }

    fn set_remove(set: &Mutex<Vec<String>>, value: &str) {
        lock(set).retain(|v| v != value);
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn put_ticks(&self, entries: &[(String, String)]) -> Result<()> {
        let mut ticks = lock(&self.ticks);
        for (instrument, json) in entries {
            ticks.insert(instrument.clone(), json.clone());
        }
        Ok(())
    }

    async fn put_closes(&self, entries: &[(String, String)]) -> Result<()> {
        let mut closes = lock(&self.closes);
        for (instrument, value) in entries {
            closes.insert(instrument.clone(), value.clone());
        }
        Ok(())
    }

    async fn last_ticks(&self, instruments: &[String]) -> Result<Vec<Option<String>>> {
        let ticks = lock(&self.ticks);
        Ok(instruments.iter().map(|i| ticks.get(i).cloned()).collect())
    }

    async fn last_closes(&self, instruments: &[String]) -> Result<Vec<Option<String>>> {
        let closes = lock(&self.closes);
        Ok(instruments.iter().map(|i| closes.get(i).cloned()).collect())
    }

    async fn add_viewer(&self, instrument: &str, user_id: &str) -> Result<u64> {
        let mut viewers = lock(&self.viewers);
        let entry = viewers.entry(instrument.to_owned()).or_default();
        if !entry.iter().any(|v| v == user_id) {
            entry.push(user_id.to_owned());
        }
        Ok(entry.len() as u64)
    }

    async fn remove_viewer(&self, instrument: &str, user_id: &str) -> Result<u64> {
        let mut viewers = lock(&self.viewers);
        let entry = viewers.entry(instrument.to_owned()).or_default();
        entry.retain(|v| v != user_id);
        Ok(entry.len() as u64)
    }

    async fn viewer_count(&self, instrument: &str) -> Result<u64> {
        Ok(lock(&self.viewers)
            .get(instrument)
            .map(|v| v.len() as u64)
            .unwrap_or(0))
    }

    async fn add_user_stock(&self, user_id: &str, instrument: &str) -> Result<()> {
        let mut stocks = lock(&self.user_stocks);
        let entry = stocks.entry(user_id.to_owned()).or_default();
        if !entry.iter().any(|v| v == instrument) {
            entry.push(instrument.to_owned());
        }
        Ok(())
    }

    async fn remove_user_stock(&self, user_id: &str, instrument: &str) -> Result<()> {
        let mut stocks = lock(&self.user_stocks);
        if let Some(entry) = stocks.get_mut(user_id) {
            entry.retain(|v| v != instrument);
        }
        Ok(())
    }

    async fn user_stocks(&self, user_id: &str) -> Result<Vec<String>> {
        Ok(lock(&self.user_stocks)
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn add_global(&self, instrument: &str) -> Result<()> {
        Self::set_insert(&self.global, instrument);
        Ok(())
    }

    async fn remove_global(&self, instrument: &str) -> Result<()> {
        Self::set_remove(&self.global, instrument);
        Ok(())
    }

    async fn global_stocks(&self) -> Result<Vec<String>> {
        Ok(lock(&self.global).clone())
    }

    async fn add_persistent(&self, instrument: &str) -> Result<()> {
        Self::set_insert(&self.persistent, instrument);
        Ok(())
    }

    async fn remove_persistent(&self, instrument: &str) -> Result<()> {
        Self::set_remove(&self.persistent, instrument);
        Ok(())
    }

    async fn persistent_stocks(&self) -> Result<Vec<String>> {
        Ok(lock(&self.persistent).clone())
    }

    async fn is_persistent(&self, instrument: &str) -> Result<bool> {
        Ok(lock(&self.persistent).iter().any(|v| v == instrument))
    }

    async fn interest(&self, instruments: &[String]) -> Result<Vec<Interest>> {
        let viewers = lock(&self.viewers);
        let persistent = lock(&self.persistent);
        Ok(instruments
            .iter()
            .map(|instrument| Interest {
                viewers: viewers
                    .get(instrument)
                    .map(|v| v.len() as u64)
                    .unwrap_or(0),
                persistent: persistent.iter().any(|v| v == instrument),
            })
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Durable store fake
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryAlertStore {
    pub alerts: Mutex<Vec<Alert>>,
    pub updates: Mutex<Vec<AlertUpdate>>,
    pub telegram_disabled: Mutex<Vec<String>>,
    pub email_disabled: Mutex<Vec<String>>,
    pub tokens_cleared: Mutex<Vec<String>>,
    pub token: Mutex<Option<String>>,
}

impl MemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alerts(alerts: Vec<Alert>) -> Self {
        let store = Self::default();
        *lock(&store.alerts) = alerts;
        store
    }

    pub fn set_token(&self, token: &str) {
        *lock(&self.token) = Some(token.to_owned());
    }

    pub fn recorded_updates(&self) -> Vec<AlertUpdate> {
        lock(&self.updates).clone()
    }
}

#[async_trait]
impl AlertStore for MemoryAlertStore {
    async fn load_active_alerts(&self) -> Result<Vec<Alert>> {
        Ok(lock(&self.alerts)
            .iter()
            .filter(|a| !a.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn bulk_update(&self, updates: &[AlertUpdate]) -> Result<()> {
        let mut recorded = lock(&self.updates);
        recorded.extend(updates.iter().cloned());
        drop(recorded);

        let mut alerts = lock(&self.alerts);
        for update in updates {
            if let Some(alert) = alerts.iter_mut().find(|a| a.id == update.alert_id) {
                alert.status = update.new_status;
                alert.entry_crossed = update.entry_crossed;
                alert.last_ltp = Some(update.ltp);
            }
        }
        Ok(())
    }

    async fn active_instruments(&self) -> Result<Vec<String>> {
        let mut instruments: Vec<String> = lock(&self.alerts)
            .iter()
            .filter(|a| !a.status.is_terminal())
            .map(|a| a.instrument_key.clone())
            .collect();
        instruments.sort();
        instruments.dedup();
        Ok(instruments)
    }

    async fn user_alert_instruments(&self, user_id: &str) -> Result<Vec<String>> {
        let mut instruments: Vec<String> = lock(&self.alerts)
            .iter()
            .filter(|a| !a.status.is_terminal() && a.user_id == user_id)
            .map(|a| a.instrument_key.clone())
            .collect();
        instruments.sort();
        instruments.dedup();
        Ok(instruments)
    }

    async fn active_alert_count(&self, instrument: &str) -> Result<u64> {
        Ok(lock(&self.alerts)
            .iter()
            .filter(|a| !a.status.is_terminal() && a.instrument_key == instrument)
            .count() as u64)
    }

    async fn disable_telegram(&self, user_id: &str) -> Result<()> {
        lock(&self.telegram_disabled).push(user_id.to_owned());
        Ok(())
    }

    async fn disable_email(&self, user_id: &str) -> Result<()> {
        lock(&self.email_disabled).push(user_id.to_owned());
        Ok(())
    }

    async fn clear_device_token(&self, user_id: &str) -> Result<()> {
        lock(&self.tokens_cleared).push(user_id.to_owned());
        Ok(())
    }

    async fn feed_token(&self) -> Result<Option<String>> {
        Ok(lock(&self.token).clone())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Job queue fake (redis semantics: due by ready-at, priority tiebreak)
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryJobQueue {
    pub due: Mutex<HashMap<&'static str, Vec<(i64, String, NotificationJob)>>>,
    pub completed: Mutex<HashMap<&'static str, Vec<(i64, String)>>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self, channel: Channel) -> Vec<NotificationJob> {
        lock(&self.due)
            .get(channel.as_str())
            .map(|jobs| jobs.iter().map(|(_, _, job)| job.clone()).collect())
            .unwrap_or_default()
    }

    pub fn completed_count(&self, channel: Channel) -> usize {
        lock(&self.completed)
            .get(channel.as_str())
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(
        &self,
        channel: Channel,
        job: &NotificationJob,
        ready_at: DateTime<Utc>,
    ) -> Result<()> {
        let member = format!("{}:{}", job.priority, job.id);
        lock(&self.due).entry(channel.as_str()).or_default().push((
            ready_at.timestamp_millis(),
            member,
            job.clone(),
        ));
        Ok(())
    }

    async fn dequeue_due(
        &self,
        channel: Channel,
        now: DateTime<Utc>,
    ) -> Result<Option<NotificationJob>> {
        let mut due = lock(&self.due);
        let Some(jobs) = due.get_mut(channel.as_str()) else {
            return Ok(None);
        };
        jobs.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        let now_ms = now.timestamp_millis();
        if let Some(index) = jobs.iter().position(|(ready, _, _)| *ready <= now_ms) {
            let (_, _, job) = jobs.remove(index);
            return Ok(Some(job));
        }
        Ok(None)
    }

    async fn complete(&self, channel: Channel, job_id: &str, now: DateTime<Utc>) -> Result<()> {
        lock(&self.completed)
            .entry(channel.as_str())
            .or_default()
            .push((now.timestamp_millis(), job_id.to_owned()));
        Ok(())
    }

    async fn depth(&self, channel: Channel) -> Result<u64> {
        Ok(lock(&self.due)
            .get(channel.as_str())
            .map(|jobs| jobs.len() as u64)
            .unwrap_or(0))
    }

    async fn purge_completed(&self, channel: Channel, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut completed = lock(&self.completed);
        let Some(entries) = completed.get_mut(channel.as_str()) else {
            return Ok(0);
        };
        let before = entries.len();
        let cutoff_ms = cutoff.timestamp_millis();
        entries.retain(|(at, _)| *at > cutoff_ms);
        Ok((before - entries.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// Transport fake
// ---------------------------------------------------------------------------

pub enum TransportScript {
    Succeed,
    FailPermanent,
    FailTransient,
}

pub struct ScriptedTransport {
    pub script: Mutex<Vec<TransportScript>>,
    pub delivered: Mutex<Vec<NotificationJob>>,
}

impl ScriptedTransport {
    pub fn always_ok() -> Self {
        ScriptedTransport {
            script: Mutex::new(Vec::new()),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn scripted(script: Vec<TransportScript>) -> Self {
        ScriptedTransport {
            script: Mutex::new(script),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn delivered_count(&self) -> usize {
        lock(&self.delivered).len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn deliver(&self, job: &NotificationJob) -> std::result::Result<(), TransportError> {
        let step = {
            let mut script = lock(&self.script);
            if script.is_empty() {
                TransportScript::Succeed
            } else {
                script.remove(0)
            }
        };
        match step {
            TransportScript::Succeed => {
                lock(&self.delivered).push(job.clone());
                Ok(())
            }
            TransportScript::FailPermanent => {
                Err(TransportError::Permanent("chat not found".to_owned()))
            }
            TransportScript::FailTransient => {
                Err(TransportError::Transient("delivery service 503".to_owned()))
            }
        }
    }
}
