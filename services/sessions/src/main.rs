use std::sync::Arc;

use anyhow::Result;
use common::cache::{RedisConfig, RedisPool};
use common::database::{self, DatabaseConfig};
use sqlx::migrate::Migrator;
use tokio::net::TcpListener;
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;

use sessions::{
    Reconciler, SessionManager,
    clock::{Clock, SystemClock},
    config::AppConfig,
    limiter::{SessionLimiter, SessionLimiterConfig},
    routes, scheduler,
    state::AppState,
    store::{EphemeralSessionStore, PgSessionRecordStore, RedisSessionStore, SessionRecordStore},
};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_max_level(Level::INFO)
        .init();

    info!("Starting session service");

    let config = AppConfig::load()?;

    // Initialize database connection pool
    let db_config = DatabaseConfig::from_env()?;
    let pool = database::init_pool(&db_config).await?;
    database::run_migrations(&pool, &MIGRATOR).await?;

    // Check database connectivity
    if database::health_check(&pool).await? {
        info!("Database connection successful");
    } else {
        anyhow::bail!("Failed to connect to database");
    }

    // Initialize Redis connection
    let redis_config = RedisConfig::from_env()?;
    let redis_pool = RedisPool::new(&redis_config).await?;
    if !redis_pool.health_check().await? {
        anyhow::bail!("Failed to connect to Redis");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ephemeral: Arc<dyn EphemeralSessionStore> =
        Arc::new(RedisSessionStore::new(redis_pool, clock.clone()));
    let records: Arc<dyn SessionRecordStore> = Arc::new(PgSessionRecordStore::new(pool));

    let limiter = SessionLimiter::new(
        SessionLimiterConfig {
            max_concurrent_sessions: config.session.max_concurrent_sessions,
            store_timeout: config.session.store_timeout(),
        },
        ephemeral.clone(),
        records.clone(),
    );
    let session_manager = SessionManager::new(
        ephemeral.clone(),
        records.clone(),
        limiter,
        clock.clone(),
        config.session.store_timeout(),
    );
    let reconciler = Reconciler::new(ephemeral, records, clock, config.reconciler.clone());

    // Start the reconciliation scheduler
    let mut scheduler = scheduler::start_reconciliation(reconciler.clone()).await?;

    info!("Session service initialized successfully");

    let app = routes::create_router(AppState {
        session_manager,
        reconciler,
    });

    let listener = TcpListener::bind(&config.server.bind_address).await?;
    info!("Session service listening on {}", config.server.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    info!("Shutting down session service");
    scheduler.shutdown().await?;

    Ok(())
}
