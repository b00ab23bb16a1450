use anyhow::Context;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use orgscope::api::{router, AppState};
use orgscope::authz::executor::ScopedExecutor;
use orgscope::authz::guard::PrivilegeGuard;
use orgscope::config::{self, Environment};
use orgscope::database::manager::DatabaseManager;
use orgscope::middleware::Readiness;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present so cargo run picks up DATABASE_URL, JWT_SECRET, etc.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = config::config();
    tracing::info!("Starting orgscope in {:?} mode", config.environment);

    let pool = DatabaseManager::app_pool().await.context("connecting application pool")?;

    // Refuse to serve if row policies can be bypassed (outside development)
    let guard = PrivilegeGuard::default();
    let report = guard.verify(&pool).await.context("running privilege guard")?;
    PrivilegeGuard::enforce(&report, config.environment)?;

    let readiness = Readiness::new(true);
    if let Some(secs) = config.authz.guard_interval_secs {
        tokio::spawn(watch_privileges(
            guard,
            pool.clone(),
            readiness.clone(),
            config.environment,
            Duration::from_secs(secs),
        ));
    }

    let state = AppState::new(ScopedExecutor::from_pool(pool), readiness);
    let app = router(state);

    let port = std::env::var("PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(3000);

    let bind_addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;

    tracing::info!("orgscope listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server")?;

    DatabaseManager::close_all().await;
    Ok(())
}

/// Re-runs the guard and flips readiness. Development keeps serving.
async fn watch_privileges(
    guard: PrivilegeGuard,
    pool: sqlx::PgPool,
    readiness: Readiness,
    environment: Environment,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately and startup already checked
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match guard.verify(&pool).await {
            Ok(report) => {
                let ready = PrivilegeGuard::enforce(&report, environment).is_ok();
                readiness.set(ready);
            }
            Err(e) => {
                tracing::error!(error = %e, "privilege guard could not run");
                readiness.set(environment == Environment::Development);
            }
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
