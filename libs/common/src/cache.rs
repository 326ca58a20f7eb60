//! Redis cache module for the ride-sharing backend
//!
//! This module provides functionality for connecting to Redis and performing
//! the key-value, key-scan and set operations the session stores are built on.

use anyhow::Result;
use redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use tracing::info;

/// Number of keys requested per `SCAN` round trip
const SCAN_BATCH: usize = 200;

/// Configuration for Redis connection
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
}

impl RedisConfig {
    /// Create a new RedisConfig from environment variables
    ///
    /// # Environment Variables
    /// - `REDIS_URL`: Redis connection URL (default: "redis://localhost:6379")
    /// - `REDIS_MAX_CONNECTIONS`: Maximum number of connections (default: 10)
    pub fn from_env() -> Result<Self> {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let max_connections = std::env::var("REDIS_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .unwrap_or(10);

        Ok(RedisConfig {
            url,
            max_connections,
        })
    }
}

/// Redis connection pool
///
/// Wraps a single multiplexed connection; clones share it.
#[derive(Clone)]
pub struct RedisPool {
    conn: MultiplexedConnection,
}

impl RedisPool {
    /// Initialize a new Redis connection pool
    pub async fn new(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.clone())?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("Redis client initialized with URL: {}", config.url);
        Ok(RedisPool { conn })
    }

    fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    /// Set a key-value pair in Redis with optional TTL
    pub async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<()> {
        let mut conn = self.connection();

        if let Some(ttl) = ttl_seconds {
            let _: () = conn.set_ex(key, value, ttl).await?;
        } else {
            let _: () = conn.set(key, value).await?;
        }

        Ok(())
    }

    /// Get a value from Redis by key
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    /// Get several values in one round trip, in key order
    pub async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.connection();
        let values: Vec<Option<String>> = redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        Ok(values)
    }

    /// Delete a key from Redis, returning whether it existed
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection();
        let removed: u64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    /// Check whether a key is present
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection();
        let present: bool = conn.exists(key).await?;
        Ok(present)
    }

    /// Collect every key matching `pattern` using cursor-based `SCAN`
    ///
    /// Never blocks the server the way `KEYS` does, but walks the whole
    /// keyspace, so keep it off request paths.
    pub async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.connection();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            keys.extend(batch);

            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    /// Add a member to a set and make sure the set lives at least `ttl_seconds`
    pub async fn sadd_with_expiry(&self, key: &str, member: &str, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.connection();
        let _: () = conn.sadd(key, member).await?;

        let current: i64 = conn.ttl(key).await?;
        if current < ttl_seconds as i64 {
            let _: () = conn.expire(key, ttl_seconds as i64).await?;
        }

        Ok(())
    }

    /// Remove a member from a set
    pub async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.connection();
        let _: () = conn.srem(key, member).await?;
        Ok(())
    }

    /// List the members of a set
    pub async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.connection();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    /// Check if Redis is reachable
    pub async fn health_check(&self) -> Result<bool> {
        let mut conn = self.connection();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(pong == "PONG")
    }
}
