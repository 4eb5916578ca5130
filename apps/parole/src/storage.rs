use anyhow::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use tracing::warn;

use crate::protocol::Timeout;

/// Crash-recoverable bookkeeping for undelivered expiries. The store only
/// needs atomic single-key operations; multi-key consistency is the
/// application's problem.
#[async_trait]
pub trait TimeoutStore: Send + Sync {
    /// Upserts the record under its identity key.
    async fn put(&self, timeout: &Timeout) -> Result<()>;
    /// Looks up one record by identity key.
    async fn get(&self, key: &str) -> Result<Option<Timeout>>;
    /// Every record still awaiting confirmed delivery.
    async fn all(&self) -> Result<HashMap<String, Timeout>>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Overwrites the replay-queue snapshot written at shutdown.
    async fn save_snapshot(&self, entries: &[Timeout]) -> Result<()>;
    /// Reads and clears the replay-queue snapshot from the previous run.
    async fn take_snapshot(&self) -> Result<Vec<Timeout>>;
}

pub struct RedisStore {
    redis: ConnectionManager,
    namespace: String,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, namespace: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;

        Ok(Self {
            redis,
            namespace: namespace.to_string(),
        })
    }

    fn timeouts_key(&self) -> String {
        format!("{}:timeouts", self.namespace)
    }

    fn snapshot_key(&self) -> String {
        format!("{}:timeouts:replay", self.namespace)
    }
}

#[async_trait]
impl TimeoutStore for RedisStore {
    async fn put(&self, timeout: &Timeout) -> Result<()> {
        let mut conn = self.redis.clone();
        let value = serde_json::to_string(timeout)?;
        conn.hset::<_, _, _, ()>(self.timeouts_key(), timeout.storage_key(), value)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Timeout>> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.hget(self.timeouts_key(), key).await?;

        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn all(&self) -> Result<HashMap<String, Timeout>> {
        let mut conn = self.redis.clone();
        let raw: HashMap<String, String> = conn.hgetall(self.timeouts_key()).await?;

        let mut records = HashMap::with_capacity(raw.len());
        for (key, json) in raw {
            match serde_json::from_str(&json) {
                Ok(timeout) => {
                    records.insert(key, timeout);
                }
                Err(err) => warn!(%key, error = %err, "skipping undecodable timeout record"),
            }
        }
        Ok(records)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        conn.hdel::<_, _, ()>(self.timeouts_key(), key).await?;
        Ok(())
    }

    async fn save_snapshot(&self, entries: &[Timeout]) -> Result<()> {
        let mut conn = self.redis.clone();
        let value = serde_json::to_string(entries)?;
        conn.set::<_, _, ()>(self.snapshot_key(), value).await?;
        Ok(())
    }

    async fn take_snapshot(&self) -> Result<Vec<Timeout>> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(self.snapshot_key()).await?;

        let Some(json) = value else {
            return Ok(Vec::new());
        };
        conn.del::<_, ()>(self.snapshot_key()).await?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryStore;
    use super::*;
    use crate::protocol::PunishmentKind;

    fn expiry(user: &str) -> Timeout {
        Timeout {
            kind: PunishmentKind::Ban,
            guild_id: "g1".to_string(),
            user_id: user.to_string(),
            moderator_id: None,
            issued_at: 0,
            expires_at: 1000,
            reason: None,
        }
    }

    #[test_deadline::deadline]
    async fn records_are_keyed_by_guild_and_user() {
        let store = MemoryStore::default();
        store.put(&expiry("u1")).await.unwrap();
        store.put(&expiry("u2")).await.unwrap();

        assert_eq!(store.get("g1:u1").await.unwrap(), Some(expiry("u1")));
        let all = store.all().await.unwrap();
        assert_eq!(all.len(), 2);

        store.delete("g1:u1").await.unwrap();
        assert_eq!(store.get("g1:u1").await.unwrap(), None);
        assert_eq!(store.all().await.unwrap().len(), 1);
    }

    #[test_deadline::deadline]
    async fn taking_the_snapshot_clears_it() {
        let store = MemoryStore::default();
        assert!(store.take_snapshot().await.unwrap().is_empty());

        store
            .save_snapshot(&[expiry("u1"), expiry("u2")])
            .await
            .unwrap();
        let recovered = store.take_snapshot().await.unwrap();
        assert_eq!(recovered, vec![expiry("u1"), expiry("u2")]);
        assert!(store.take_snapshot().await.unwrap().is_empty());
    }
}
