//! Shared cache store: last tick/close hashes, viewer and watchlist
//! sets, the persistent-alert stock set, and pipelined batch reads.
//!
//! The engine and sessions talk to the [`CacheStore`] trait; the
//! process wires in [`RedisCacheStore`], tests wire in a fake.

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::constants::app_constants::LAST_TICK_TTL_SECS;
use crate::constants::Keys;
use crate::models::Result;

// Interest in one instrument from both subscription sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub viewers: u64,
    pub persistent: bool,
}

impl Interest {
    pub fn subscribable(&self) -> bool {
        self.viewers > 0 || self.persistent
    }
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Pipelined multi-field write of the freshest tick per instrument,
    /// refreshing the 24 h TTL on the hash in the same round-trip.
    async fn put_ticks(&self, entries: &[(String, String)]) -> Result<()>;

    /// Same, for the last-close hash.
    async fn put_closes(&self, entries: &[(String, String)]) -> Result<()>;

    /// Batched read of last ticks, one slot per requested instrument.
    async fn last_ticks(&self, instruments: &[String]) -> Result<Vec<Option<String>>>;

    async fn last_closes(&self, instruments: &[String]) -> Result<Vec<Option<String>>>;

    /// Adds the user to the instrument's viewer set; returns the
    /// viewer count after the add (1 means this user is the first).
    async fn add_viewer(&self, instrument: &str, user_id: &str) -> Result<u64>;

    /// Removes the user from the viewer set; returns the count after
    /// the removal (0 means the set just drained).
    async fn remove_viewer(&self, instrument: &str, user_id: &str) -> Result<u64>;

    async fn viewer_count(&self, instrument: &str) -> Result<u64>;

    async fn add_user_stock(&self, user_id: &str, instrument: &str) -> Result<()>;
    async fn remove_user_stock(&self, user_id: &str, instrument: &str) -> Result<()>;
    async fn user_stocks(&self, user_id: &str) -> Result<Vec<String>>;

    async fn add_global(&self, instrument: &str) -> Result<()>;
    async fn remove_global(&self, instrument: &str) -> Result<()>;
    async fn global_stocks(&self) -> Result<Vec<String>>;

    async fn add_persistent(&self, instrument: &str) -> Result<()>;
    async fn remove_persistent(&self, instrument: &str) -> Result<()>;
    async fn persistent_stocks(&self) -> Result<Vec<String>>;
    async fn is_persistent(&self, instrument: &str) -> Result<bool>;

    /// One pipelined round-trip answering, per instrument, how many
    /// viewers it has and whether it is a persistent-alert stock.
    async fn interest(&self, instruments: &[String]) -> Result<Vec<Interest>>;

    async fn ping(&self) -> Result<()>;
}

pub struct RedisCacheStore {
    manager: ConnectionManager,
}

impl RedisCacheStore {
    pub fn new(manager: ConnectionManager) -> Self {
        RedisCacheStore { manager }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(RedisCacheStore::new(manager))
    }

    async fn put_hash(&self, key: &str, entries: &[(String, String)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        for (field, value) in entries {
            pipe.cmd("HSET").arg(key).arg(field).arg(value).ignore();
        }
        pipe.cmd("EXPIRE").arg(key).arg(LAST_TICK_TTL_SECS).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn hash_multi_get(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.manager.clone();
        let values: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn set_add(&self, key: String, member: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_remove(&self, key: String, member: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_members(&self, key: String) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await?;
        Ok(members)
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn put_ticks(&self, entries: &[(String, String)]) -> Result<()> {
        self.put_hash(Keys::LAST_TICK, entries).await
    }

    async fn put_closes(&self, entries: &[(String, String)]) -> Result<()> {
        self.put_hash(Keys::LAST_CLOSE, entries).await
    }

    async fn last_ticks(&self, instruments: &[String]) -> Result<Vec<Option<String>>> {
        self.hash_multi_get(Keys::LAST_TICK, instruments).await
    }

    async fn last_closes(&self, instruments: &[String]) -> Result<Vec<Option<String>>> {
        self.hash_multi_get(Keys::LAST_CLOSE, instruments).await
    }

    async fn add_viewer(&self, instrument: &str, user_id: &str) -> Result<u64> {
        let key = Keys::stock_users(instrument);
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.cmd("SADD").arg(&key).arg(user_id).ignore();
        pipe.cmd("SCARD").arg(&key);
        let (count,): (u64,) = pipe.query_async(&mut conn).await?;
        Ok(count)
    }

    async fn remove_viewer(&self, instrument: &str, user_id: &str) -> Result<u64> {
        let key = Keys::stock_users(instrument);
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.cmd("SREM").arg(&key).arg(user_id).ignore();
        pipe.cmd("SCARD").arg(&key);
        let (count,): (u64,) = pipe.query_async(&mut conn).await?;
        Ok(count)
    }

    async fn viewer_count(&self, instrument: &str) -> Result<u64> {
        let mut conn = self.manager.clone();
        let count: u64 = redis::cmd("SCARD")
            .arg(Keys::stock_users(instrument))
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn add_user_stock(&self, user_id: &str, instrument: &str) -> Result<()> {
        self.set_add(Keys::user_stocks(user_id), instrument).await
    }

    async fn remove_user_stock(&self, user_id: &str, instrument: &str) -> Result<()> {
        self.set_remove(Keys::user_stocks(user_id), instrument).await
    }

    async fn user_stocks(&self, user_id: &str) -> Result<Vec<String>> {
        self.set_members(Keys::user_stocks(user_id)).await
    }

    async fn add_global(&self, instrument: &str) -> Result<()> {
        self.set_add(Keys::GLOBAL_STOCKS.to_string(), instrument).await
    }

    async fn remove_global(&self, instrument: &str) -> Result<()> {
        self.set_remove(Keys::GLOBAL_STOCKS.to_string(), instrument).await
    }

    async fn global_stocks(&self) -> Result<Vec<String>> {
        self.set_members(Keys::GLOBAL_STOCKS.to_string()).await
    }

    async fn add_persistent(&self, instrument: &str) -> Result<()> {
        self.set_add(Keys::PERSISTENT_STOCKS.to_string(), instrument).await
    }

    async fn remove_persistent(&self, instrument: &str) -> Result<()> {
        self.set_remove(Keys::PERSISTENT_STOCKS.to_string(), instrument)
            .await
    }

    async fn persistent_stocks(&self) -> Result<Vec<String>> {
        self.set_members(Keys::PERSISTENT_STOCKS.to_string()).await
    }

    async fn is_persistent(&self, instrument: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let member: bool = redis::cmd("SISMEMBER")
            .arg(Keys::PERSISTENT_STOCKS)
            .arg(instrument)
            .query_async(&mut conn)
            .await?;
        Ok(member)
    }

    async fn interest(&self, instruments: &[String]) -> Result<Vec<Interest>> {
        if instruments.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        for instrument in instruments {
            pipe.cmd("SCARD").arg(Keys::stock_users(instrument));
            pipe.cmd("SISMEMBER")
                .arg(Keys::PERSISTENT_STOCKS)
                .arg(instrument);
        }
        let raw: Vec<i64> = pipe.query_async(&mut conn).await?;
        let interests = raw
            .chunks(2)
            .map(|pair| Interest {
                viewers: pair[0].max(0) as u64,
                persistent: pair.get(1).copied().unwrap_or(0) != 0,
            })
            .collect();
        Ok(interests)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
