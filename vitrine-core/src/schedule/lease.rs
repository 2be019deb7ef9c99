//! Short-TTL firing lease serializing trigger firings across scheduler
//! instances.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::Result;

#[async_trait]
pub trait FiringLease: Send + Sync {
    /// Try to take the lease; false means another holder has it.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Extend a held lease while a firing is still in progress.
    async fn renew(&self, key: &str, ttl: Duration) -> Result<bool>;
}

/// Single-process lease, sufficient when one scheduler instance runs.
#[derive(Default)]
pub struct MemoryLease {
    held: Mutex<HashMap<String, Instant>>,
}

impl std::fmt::Debug for MemoryLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLease").finish_non_exhaustive()
    }
}

impl MemoryLease {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FiringLease for MemoryLease {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut held = self.held.lock().await;
        let now = Instant::now();
        held.retain(|_, expiry| *expiry > now);
        if held.contains_key(key) {
            return Ok(false);
        }
        held.insert(key.to_string(), now + ttl);
        Ok(true)
    }

    async fn renew(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut held = self.held.lock().await;
        match held.get_mut(key) {
            Some(expiry) if *expiry > Instant::now() => {
                *expiry = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Redis-backed lease: `SET key NX PX ttl`, renewed with `PEXPIRE`.
#[cfg(feature = "database")]
pub mod redis_lease {
    use super::*;
    use redis::aio::ConnectionManager;

    use crate::error::CatalogError;

    #[derive(Clone)]
    pub struct RedisLease {
        conn: ConnectionManager,
    }

    impl std::fmt::Debug for RedisLease {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RedisLease").finish_non_exhaustive()
        }
    }

    impl RedisLease {
        pub fn new(conn: ConnectionManager) -> Self {
            Self { conn }
        }

        pub async fn connect(redis_url: &str) -> Result<Self> {
            let client = redis::Client::open(redis_url)
                .map_err(|err| CatalogError::Index(err.to_string()))?;
            let conn = ConnectionManager::new(client)
                .await
                .map_err(|err| CatalogError::Index(err.to_string()))?;
            Ok(Self::new(conn))
        }
    }

    #[async_trait]
    impl FiringLease for RedisLease {
        async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
            let mut conn = self.conn.clone();
            let taken: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg("1")
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut conn)
                .await
                .map_err(|err| CatalogError::Index(err.to_string()))?;
            Ok(taken.is_some())
        }

        async fn renew(&self, key: &str, ttl: Duration) -> Result<bool> {
            let mut conn = self.conn.clone();
            let extended: i64 = redis::cmd("PEXPIRE")
                .arg(key)
                .arg(ttl.as_millis() as u64)
                .query_async(&mut conn)
                .await
                .map_err(|err| CatalogError::Index(err.to_string()))?;
            Ok(extended == 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn a_held_lease_blocks_other_acquirers_until_expiry() {
        let lease = MemoryLease::new();
        assert!(
            lease
                .acquire("scheduler:x", Duration::from_millis(50))
                .await
                .unwrap()
        );
        assert!(
            !lease
                .acquire("scheduler:x", Duration::from_millis(50))
                .await
                .unwrap()
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(
            lease
                .acquire("scheduler:x", Duration::from_millis(50))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn renew_only_extends_live_leases() {
        let lease = MemoryLease::new();
        lease
            .acquire("scheduler:y", Duration::from_millis(40))
            .await
            .unwrap();
        assert!(
            lease
                .renew("scheduler:y", Duration::from_millis(40))
                .await
                .unwrap()
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(
            !lease
                .renew("scheduler:y", Duration::from_millis(40))
                .await
                .unwrap()
        );
    }
}
