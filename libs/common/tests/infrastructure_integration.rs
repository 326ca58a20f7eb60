//! Integration tests for the infrastructure components
//!
//! These tests verify that the PostgreSQL database and Redis cache
//! are properly configured and accessible from the application.

use common::{
    cache::{RedisConfig, RedisPool},
    database::{DatabaseConfig, health_check, init_pool},
};
use sqlx::Row;

/// Test that verifies both PostgreSQL and Redis are accessible
/// and can perform basic operations
#[tokio::test]
#[ignore = "requires running PostgreSQL and Redis instances"]
async fn test_infrastructure_integration() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize PostgreSQL connection pool
    let db_config = DatabaseConfig::from_env()?;
    let pool = init_pool(&db_config).await?;

    assert!(health_check(&pool).await?, "Database health check failed");

    let row = sqlx::query("SELECT 1 as result").fetch_one(&pool).await?;
    let result: i32 = row.get("result");
    assert_eq!(result, 1, "PostgreSQL simple query test failed");

    // Initialize Redis client
    let redis_config = RedisConfig::from_env()?;
    let redis_pool = RedisPool::new(&redis_config).await?;

    assert!(
        redis_pool.health_check().await?,
        "Redis health check failed"
    );

    // Session-shaped key with TTL, indexed in a per-user set
    let test_key = "session:integration-test";
    redis_pool.set(test_key, "{}", Some(10)).await?;
    redis_pool
        .sadd_with_expiry("user_sessions:integration-test", "integration-test", 10)
        .await?;

    let keys = redis_pool.scan_keys("session:integration-*").await?;
    assert!(keys.contains(&test_key.to_string()), "Redis SCAN test failed");

    assert!(redis_pool.delete(test_key).await?);
    redis_pool
        .srem("user_sessions:integration-test", "integration-test")
        .await?;

    assert_eq!(
        redis_pool.get(test_key).await?,
        None,
        "Redis delete operation failed"
    );

    Ok(())
}
