//! Durable store: alerts with hydrated owners, bulk status writes,
//! active-instrument queries, channel disabling and the feed token.
//!
//! The trait is the seam the engine and reconcilers depend on;
//! [`MongoAlertStore`] is the production implementation.

use async_trait::async_trait;
use futures_util::TryStreamExt;
use mongodb::bson::{doc, oid::ObjectId, Bson, Document};
use mongodb::options::{UpdateOneModel, WriteModel};
use mongodb::{Client, Collection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::constants::app_constants::BULK_WRITE_TIMEOUT;
use crate::models::{Alert, AlertStatus, AlertUpdate, Position, Result, TickwatchError, User};

#[async_trait]
pub trait AlertStore: Send + Sync {
    /// All non-terminal alerts with their owner hydrated. Alerts whose
    /// owner record is missing are dropped here, not downstream.
    async fn load_active_alerts(&self) -> Result<Vec<Alert>>;

    /// One bulk write applying status/last_ltp/entry_crossed per alert.
    async fn bulk_update(&self, updates: &[AlertUpdate]) -> Result<()>;

    /// Distinct instrument keys carrying at least one non-terminal alert.
    async fn active_instruments(&self) -> Result<Vec<String>>;

    /// Distinct instrument keys of one user's non-terminal alerts.
    async fn user_alert_instruments(&self, user_id: &str) -> Result<Vec<String>>;

    async fn active_alert_count(&self, instrument: &str) -> Result<u64>;

    /// Recipient-invalid handling: turn the chat channel off for good.
    async fn disable_telegram(&self, user_id: &str) -> Result<()>;

    /// Recipient-invalid handling for bouncing email addresses.
    async fn disable_email(&self, user_id: &str) -> Result<()>;

    /// Recipient-invalid handling for push tokens.
    async fn clear_device_token(&self, user_id: &str) -> Result<()>;

    /// Newest upstream bearer token, written by the external refresher.
    async fn feed_token(&self) -> Result<Option<String>>;

    async fn ping(&self) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct AlertDoc {
    #[serde(rename = "_id")]
    id: ObjectId,
    user_id: ObjectId,
    instrument_key: String,
    trading_symbol: String,
    position: Position,
    entry_price: f64,
    stop_loss: f64,
    target_price: f64,
    #[serde(default)]
    level: Option<i32>,
    #[serde(default)]
    trade_type: String,
    status: AlertStatus,
    #[serde(default)]
    entry_crossed: bool,
    #[serde(default)]
    last_ltp: Option<f64>,
    #[serde(default)]
    cmp: Option<f64>,
    created_at: mongodb::bson::DateTime,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserDoc {
    #[serde(rename = "_id")]
    id: ObjectId,
    email: String,
    #[serde(default = "default_true")]
    email_enabled: bool,
    #[serde(default)]
    device_token: Option<String>,
    #[serde(default)]
    telegram_chat_id: Option<String>,
    #[serde(default)]
    telegram_enabled: bool,
}

impl UserDoc {
    fn into_user(self) -> User {
        User {
            id: self.id.to_hex(),
            email: self.email,
            email_enabled: self.email_enabled,
            device_token: self.device_token,
            telegram_chat_id: self.telegram_chat_id,
            telegram_enabled: self.telegram_enabled,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenDoc {
    access_token: String,
}

fn active_filter() -> Document {
    doc! {
        "status": { "$nin": [AlertStatus::SlHit.as_str(), AlertStatus::TargetHit.as_str()] }
    }
}

pub struct MongoAlertStore {
    client: Client,
    alerts: Collection<AlertDoc>,
    users: Collection<UserDoc>,
    tokens: Collection<TokenDoc>,
}

impl MongoAlertStore {
    pub async fn connect(uri: &str, database: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri).await?;
        let db = client.database(database);
        Ok(MongoAlertStore {
            alerts: db.collection("alerts"),
            users: db.collection("users"),
            tokens: db.collection("tokens"),
            client,
        })
    }

    fn hydrate(doc: AlertDoc, owners: &HashMap<ObjectId, User>) -> Option<Alert> {
        let owner = owners.get(&doc.user_id)?.clone();
        Some(Alert {
            id: doc.id.to_hex(),
            user_id: doc.user_id.to_hex(),
            instrument_key: doc.instrument_key,
            trading_symbol: doc.trading_symbol,
            position: doc.position,
            entry_price: doc.entry_price,
            stop_loss: doc.stop_loss,
            target_price: doc.target_price,
            level: doc.level,
            trade_type: doc.trade_type,
            status: doc.status,
            entry_crossed: doc.entry_crossed,
            last_ltp: doc.last_ltp,
            cmp: doc.cmp,
            created_at: chrono::DateTime::from_timestamp_millis(doc.created_at.timestamp_millis())
                .unwrap_or_else(chrono::Utc::now),
            owner,
        })
    }

    fn distinct_strings(values: Vec<Bson>) -> Vec<String> {
        values
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_owned))
            .collect()
    }
}

#[async_trait]
impl AlertStore for MongoAlertStore {
    async fn load_active_alerts(&self) -> Result<Vec<Alert>> {
        let mut cursor = self.alerts.find(active_filter()).await?;
        let mut docs = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            docs.push(doc);
        }

        let user_ids: Vec<ObjectId> = docs.iter().map(|d| d.user_id).collect();
        let mut owners = HashMap::new();
        if !user_ids.is_empty() {
            let mut users = self
                .users
                .find(doc! { "_id": { "$in": user_ids } })
                .await?;
            while let Some(user) = users.try_next().await? {
                owners.insert(user.id, user.clone().into_user());
            }
        }

        let total = docs.len();
        let alerts: Vec<Alert> = docs
            .into_iter()
            .filter_map(|d| Self::hydrate(d, &owners))
            .collect();
        if alerts.len() < total {
            log::warn!(
                "dropped {} alert(s) without a resolvable owner",
                total - alerts.len()
            );
        }
        Ok(alerts)
    }

    async fn bulk_update(&self, updates: &[AlertUpdate]) -> Result<()> {
        let ns = self.alerts.namespace();
        let models: Vec<WriteModel> = updates
            .iter()
            .filter_map(|u| {
                let id = ObjectId::parse_str(&u.alert_id).ok()?;
                Some(WriteModel::UpdateOne(
                    UpdateOneModel::builder()
                        .namespace(ns.clone())
                        .filter(doc! { "_id": id })
                        .update(doc! { "$set": {
                            "status": u.new_status.as_str(),
                            "last_ltp": u.ltp,
                            "entry_crossed": u.entry_crossed,
                        }})
                        .build(),
                ))
            })
            .collect();
        if models.is_empty() {
            return Ok(());
        }

        let write = async { self.client.bulk_write(models).await };
        match tokio::time::timeout(BULK_WRITE_TIMEOUT, write).await {
            Ok(outcome) => {
                outcome?;
                Ok(())
            }
            Err(_) => Err(TickwatchError::other(format!(
                "bulk write of {} update(s) timed out",
                updates.len()
            ))),
        }
    }

    async fn active_instruments(&self) -> Result<Vec<String>> {
        let values = self
            .alerts
            .distinct("instrument_key", active_filter())
            .await?;
        Ok(Self::distinct_strings(values))
    }

    async fn user_alert_instruments(&self, user_id: &str) -> Result<Vec<String>> {
        let oid = match ObjectId::parse_str(user_id) {
            Ok(oid) => oid,
            Err(_) => return Ok(Vec::new()),
        };
        let mut filter = active_filter();
        filter.insert("user_id", oid);
        let values = self.alerts.distinct("instrument_key", filter).await?;
        Ok(Self::distinct_strings(values))
    }

    async fn active_alert_count(&self, instrument: &str) -> Result<u64> {
        let mut filter = active_filter();
        filter.insert("instrument_key", instrument);
        Ok(self.alerts.count_documents(filter).await?)
    }

    async fn disable_telegram(&self, user_id: &str) -> Result<()> {
        let oid = ObjectId::parse_str(user_id)
            .map_err(|e| TickwatchError::other(format!("bad user id {}: {}", user_id, e)))?;
        self.users
            .update_one(
                doc! { "_id": oid },
                doc! {
                    "$set": { "telegram_enabled": false },
                    "$unset": { "telegram_chat_id": "" },
                },
            )
            .await?;
        Ok(())
    }

    async fn disable_email(&self, user_id: &str) -> Result<()> {
        let oid = ObjectId::parse_str(user_id)
            .map_err(|e| TickwatchError::other(format!("bad user id {}: {}", user_id, e)))?;
        self.users
            .update_one(doc! { "_id": oid }, doc! { "$set": { "email_enabled": false } })
            .await?;
        Ok(())
    }

    async fn clear_device_token(&self, user_id: &str) -> Result<()> {
        let oid = ObjectId::parse_str(user_id)
            .map_err(|e| TickwatchError::other(format!("bad user id {}: {}", user_id, e)))?;
        self.users
            .update_one(doc! { "_id": oid }, doc! { "$unset": { "device_token": "" } })
            .await?;
        Ok(())
    }

    async fn feed_token(&self) -> Result<Option<String>> {
        let token = self
            .tokens
            .find_one(doc! {})
            .sort(doc! { "created_at": -1 })
            .await?;
        Ok(token.map(|t| t.access_token))
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await?;
        Ok(())
    }
}
