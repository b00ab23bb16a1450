use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::authz::binder::verify_released;
use crate::config;

/// Errors from DatabaseManager
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Missing configuration: {0}")]
    ConfigMissing(&'static str),

    #[error("Invalid database URL")]
    InvalidDatabaseUrl,

    #[error("Invalid role name: {0}")]
    InvalidRoleName(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Process-wide pools: the application pool (row policies apply) and the
/// migration pool (schema owner, used by `scopectl`)
pub struct DatabaseManager {
    pools: Arc<RwLock<HashMap<&'static str, PgPool>>>,
}

impl DatabaseManager {
    fn instance() -> &'static DatabaseManager {
        use std::sync::OnceLock;
        static INSTANCE: OnceLock<DatabaseManager> = OnceLock::new();
        INSTANCE.get_or_init(|| DatabaseManager {
            pools: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    const APP_POOL: &'static str = "app";
    const MIGRATION_POOL: &'static str = "migration";

    /// Pool every unit of work draws from. Connections assume the
    /// configured application role and are checked on release.
    pub async fn app_pool() -> Result<PgPool, DatabaseError> {
        let manager = Self::instance();
        if let Some(pool) = manager.cached(Self::APP_POOL).await {
            return Ok(pool);
        }
        let url = Self::connection_string("DATABASE_URL")?;
        let app_role = config::config().database.app_role.clone();
        let pool = Self::app_pool_options(app_role)?.connect(&url).await?;
        Ok(manager.store(Self::APP_POOL, pool).await)
    }

    /// Pool for DDL. Uses `MIGRATION_DATABASE_URL`, falling back to `DATABASE_URL`.
    pub async fn migration_pool() -> Result<PgPool, DatabaseError> {
        let manager = Self::instance();
        if let Some(pool) = manager.cached(Self::MIGRATION_POOL).await {
            return Ok(pool);
        }
        let url = Self::connection_string("MIGRATION_DATABASE_URL")
            .or_else(|_| Self::connection_string("DATABASE_URL"))?;
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(config::config().database.connection_timeout))
            .connect(&url)
            .await?;
        Ok(manager.store(Self::MIGRATION_POOL, pool).await)
    }

    /// Options for an application pool: `SET ROLE` on connect, and any
    /// connection released with a context still bound is closed.
    pub fn app_pool_options(app_role: Option<String>) -> Result<PgPoolOptions, DatabaseError> {
        let settings = &config::config().database;

        let set_role = match app_role {
            Some(role) if Self::is_valid_role_name(&role) => {
                Some(format!("SET ROLE {}", Self::quote_identifier(&role)))
            }
            Some(role) => return Err(DatabaseError::InvalidRoleName(role)),
            None => None,
        };

        Ok(PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(Duration::from_secs(settings.connection_timeout))
            .after_connect(move |conn, _meta| {
                let set_role = set_role.clone();
                Box::pin(async move {
                    if let Some(sql) = set_role {
                        conn.execute(sql.as_str()).await?;
                    }
                    Ok(())
                })
            })
            .after_release(|conn, _meta| Box::pin(async move { verify_released(conn).await })))
    }

    async fn cached(&self, name: &str) -> Option<PgPool> {
        self.pools.read().await.get(name).cloned()
    }

    async fn store(&self, name: &'static str, pool: PgPool) -> PgPool {
        let mut pools = self.pools.write().await;
        // Another task may have raced us here; keep the first pool
        let pool = pools.entry(name).or_insert(pool).clone();
        info!("Created database pool: {}", name);
        pool
    }

    /// Read a connection URL from `var`, applying a `DATABASE_NAME` override
    fn connection_string(var: &'static str) -> Result<String, DatabaseError> {
        let base = std::env::var(var).map_err(|_| DatabaseError::ConfigMissing(var))?;
        let mut url = url::Url::parse(&base).map_err(|_| DatabaseError::InvalidDatabaseUrl)?;
        if !matches!(url.scheme(), "postgres" | "postgresql") {
            return Err(DatabaseError::InvalidDatabaseUrl);
        }
        if let Ok(name) = std::env::var("DATABASE_NAME") {
            url.set_path(&format!("/{}", name));
        }
        Ok(url.into())
    }

    /// Pings the application pool
    pub async fn health_check() -> Result<(), DatabaseError> {
        let pool = Self::app_pool().await?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok(())
    }

    /// Close and remove all pools (e.g., on shutdown)
    pub async fn close_all() {
        let manager = Self::instance();
        let mut pools = manager.pools.write().await;
        for (name, pool) in pools.drain() {
            pool.close().await;
            info!("Closed database pool: {}", name);
        }
    }

    /// Quote SQL identifier to prevent injection
    pub fn quote_identifier(name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    /// Role names we are willing to interpolate into DDL
    pub fn is_valid_role_name(name: &str) -> bool {
        !name.is_empty()
            && name.len() <= 63
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !name.starts_with(|c: char| c.is_ascii_digit())
    }
}
