//! Shared fixtures for the database-backed tests.
//!
//! Tests run only when `TEST_DATABASE_URL` points at a scratch database whose
//! login role is a superuser (fixtures are written around row policies and
//! test roles are created on the fly). Without it every test returns early.
#![allow(dead_code)]

use std::sync::Once;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use orgscope::api::{router, AppState};
use orgscope::auth::{generate_jwt, Claims};
use orgscope::authz::binder::ContextBinder;
use orgscope::authz::executor::{PgScopeBackend, ScopedExecutor};
use orgscope::authz::hierarchy::HierarchyResolver;
use orgscope::authz::predicates::PolicyCatalog;
use orgscope::database::manager::DatabaseManager;
use orgscope::database::migrate::PolicyMigrator;
use orgscope::middleware::Readiness;

pub const TEST_ROLE: &str = "orgscope_test_app";
pub const TEST_SECRET: &str = "orgscope-integration-secret";

/// Serializes role creation across concurrently running test binaries
const ROLE_LOCK_KEY: i64 = 0x6f72_6773_7465_7374;

static ENV: Once = Once::new();

/// Must run before anything touches `CONFIG`
fn configure_env() {
    ENV.call_once(|| {
        std::env::set_var("JWT_SECRET", TEST_SECRET);
        std::env::set_var("AUTHZ_UNIT_OF_WORK_TIMEOUT_MS", "10000");
    });
}

pub struct TestDb {
    pub url: String,
    /// Superuser pool, bypasses row policies
    pub admin: PgPool,
    /// Pool running as `TEST_ROLE`, subject to row policies
    pub app: PgPool,
}

/// Hierarchy `F -> U -> L` plus a sibling union `U2 -> L2` under `F`
#[derive(Debug, Clone, Copy)]
pub struct Tree {
    pub federation: Uuid,
    pub union: Uuid,
    pub local: Uuid,
    pub sibling: Uuid,
    pub sibling_local: Uuid,
}

impl Tree {
    pub fn all(&self) -> Vec<Uuid> {
        vec![self.federation, self.union, self.local, self.sibling, self.sibling_local]
    }
}

pub async fn database() -> Result<Option<TestDb>> {
    configure_env();
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set; skipping database test");
        return Ok(None);
    };

    let admin = PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .context("connecting admin pool")?;

    ensure_role(&admin, TEST_ROLE, "NOLOGIN").await?;
    PolicyMigrator::new(PolicyCatalog::standard(), Some(TEST_ROLE.to_string()))
        .apply(&admin)
        .await
        .context("installing row policies")?;

    let app = app_pool(&url, TEST_ROLE, 8).await?;
    Ok(Some(TestDb { url, admin, app }))
}

pub async fn app_pool(url: &str, role: &str, max_connections: u32) -> Result<PgPool> {
    Ok(DatabaseManager::app_pool_options(Some(role.to_string()))?
        .max_connections(max_connections)
        .connect(url)
        .await?)
}

/// Create `role` if missing and let the login user `SET ROLE` to it
pub async fn ensure_role(admin: &PgPool, role: &str, attributes: &str) -> Result<()> {
    let mut tx = admin.begin().await?;
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(ROLE_LOCK_KEY)
        .execute(&mut *tx)
        .await?;

    let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_roles WHERE rolname::text = $1)")
        .bind(role)
        .fetch_one(&mut *tx)
        .await?;
    if !exists {
        let quoted = DatabaseManager::quote_identifier(role);
        sqlx::query(&format!("CREATE ROLE {} {}", quoted, attributes))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("GRANT {} TO CURRENT_USER", quoted))
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

impl TestDb {
    pub fn executor(&self) -> ScopedExecutor {
        ScopedExecutor::from_pool(self.app.clone())
    }

    /// Executor whose binder accepts `Direction::Global` for system admins
    pub fn global_executor(&self) -> ScopedExecutor {
        let backend = PgScopeBackend::new(self.app.clone(), ContextBinder::new(HierarchyResolver::from_config(), true));
        ScopedExecutor::new(backend, Duration::from_secs(10))
    }

    pub async fn insert_org(&self, id: Uuid, parent: Option<Uuid>, kind: &str, path: &[Uuid]) -> Result<()> {
        sqlx::query(
            "INSERT INTO organizations (id, parent_id, name, slug, kind, materialized_path, depth) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(id)
        .bind(parent)
        .bind(format!("{} {}", kind, &id.simple().to_string()[..8]))
        .bind(format!("{}-{}", kind, id.simple()))
        .bind(kind)
        .bind(path.to_vec())
        .bind(path.len() as i32 - 1)
        .execute(&self.admin)
        .await?;
        Ok(())
    }

    pub async fn seed_tree(&self) -> Result<Tree> {
        let tree = Tree {
            federation: Uuid::new_v4(),
            union: Uuid::new_v4(),
            local: Uuid::new_v4(),
            sibling: Uuid::new_v4(),
            sibling_local: Uuid::new_v4(),
        };
        let Tree { federation: f, union: u, local: l, sibling: u2, sibling_local: l2 } = tree;

        self.insert_org(f, None, "federation", &[f]).await?;
        self.insert_org(u, Some(f), "union", &[f, u]).await?;
        self.insert_org(l, Some(u), "local", &[f, u, l]).await?;
        self.insert_org(u2, Some(f), "union", &[f, u2]).await?;
        self.insert_org(l2, Some(u2), "local", &[f, u2, l2]).await?;
        Ok(tree)
    }

    /// One claim per organization in `orgs`
    pub async fn seed_claims(&self, orgs: &[Uuid]) -> Result<()> {
        for org in orgs {
            sqlx::query("INSERT INTO claims (organization_id, title) VALUES ($1, 'fixture claim')")
                .bind(org)
                .execute(&self.admin)
                .await?;
        }
        Ok(())
    }

    pub async fn path_of(&self, org: Uuid) -> Result<(Vec<Uuid>, i32)> {
        Ok(sqlx::query_as("SELECT materialized_path, depth FROM organizations WHERE id = $1")
            .bind(org)
            .fetch_one(&self.admin)
            .await?)
    }
}

pub struct TestServer {
    pub base_url: String,
}

/// Serve the router in-process on a free port
pub async fn spawn_server(executor: ScopedExecutor, readiness: Readiness) -> Result<TestServer> {
    let port = portpicker::pick_unused_port().context("failed to pick free port")?;
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    let app = router(AppState::new(executor, readiness));

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            eprintln!("test server stopped: {}", e);
        }
    });

    Ok(TestServer {
        base_url: format!("http://127.0.0.1:{}", port),
    })
}

pub fn token(user_id: Uuid, organization_id: Uuid, role: &str) -> Result<String> {
    Ok(generate_jwt(&Claims::new(user_id, organization_id, role))?)
}
