use sqlx::{PgConnection, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::authz::context::{
    keys, AuthorizationContext, BoundContext, Direction, Principal, Role, VisibilitySet, SESSION_KEYS,
};
use crate::authz::error::AuthzError;
use crate::authz::hierarchy::HierarchyResolver;

/// SQLSTATE for "current transaction is aborted"
const IN_FAILED_TRANSACTION: &str = "25P02";

/// Result of resetting session state. Clearing never fails the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearOutcome {
    Cleared,
    /// The transaction is aborted; its rollback discards the settings
    PendingRollback,
    Failed(String),
}

pub(crate) fn is_aborted_transaction(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(IN_FAILED_TRANSACTION),
        _ => false,
    }
}

/// Writes an authorization context into a connection's transaction-local
/// session state and takes it out again.
#[derive(Debug, Clone)]
pub struct ContextBinder {
    resolver: HierarchyResolver,
    allow_global: bool,
}

impl ContextBinder {
    pub fn new(resolver: HierarchyResolver, allow_global: bool) -> Self {
        Self { resolver, allow_global }
    }

    pub fn from_config() -> Self {
        Self::new(
            HierarchyResolver::from_config(),
            crate::config::CONFIG.authz.allow_global_scope,
        )
    }

    pub fn resolver(&self) -> &HierarchyResolver {
        &self.resolver
    }

    /// Compute the visibility set for `principal` looking in `direction`
    pub async fn resolve(
        &self,
        conn: &mut PgConnection,
        principal: &Principal,
        direction: Direction,
    ) -> Result<VisibilitySet, AuthzError> {
        let org = principal.organization_id;
        let ids = match direction {
            Direction::Downward => self.resolver.descendants_of(conn, org).await?,
            Direction::Upward => self.resolver.ancestors_of(conn, org).await?,
            Direction::Exact => {
                self.resolver.ensure_exists(conn, org).await?;
                Vec::new()
            }
            Direction::Global => {
                if principal.role < Role::SystemAdmin || !self.allow_global {
                    return Err(AuthzError::Forbidden {
                        role: principal.role,
                        direction,
                    });
                }
                self.resolver.ensure_exists(conn, org).await?;
                Vec::new()
            }
        };
        Ok(VisibilitySet::new(org, ids))
    }

    /// Bind a fresh context. The connection must be inside a transaction and
    /// must not already carry a context.
    pub async fn bind(
        &self,
        conn: &mut PgConnection,
        principal: &Principal,
        direction: Direction,
    ) -> Result<AuthorizationContext, AuthzError> {
        if let Some(existing) = self.current_token(conn).await? {
            return Err(AuthzError::ContextAlreadyBound(existing));
        }

        let visible = self.resolve(conn, principal, direction).await?;
        let context = AuthorizationContext::new(principal, direction, visible);

        let values = context.session_values();
        let sql = set_config_sql();
        let mut query = sqlx::query(&sql);
        for (key, value) in SESSION_KEYS.iter().zip(values.iter()) {
            query = query.bind(*key).bind(value.as_str());
        }
        query
            .execute(&mut *conn)
            .await
            .map_err(|e| AuthzError::ContextBinding(e.to_string()))?;

        match self.current_token(conn).await? {
            Some(token) if token == context.token => {}
            other => {
                return Err(AuthzError::ContextBinding(format!(
                    "token read-back mismatch (expected {}, found {:?})",
                    context.token, other
                )))
            }
        }

        debug!(
            token = %context.token,
            user_id = %context.user_id,
            org = %context.organization_id,
            role = %context.role,
            direction = %context.direction,
            visible = context.visible.len(),
            global = context.global,
            "bound authorization context"
        );
        Ok(context)
    }

    /// Reset every session key to empty. Safe to call repeatedly.
    pub async fn clear(&self, conn: &mut PgConnection) -> ClearOutcome {
        let sql = clear_sql();
        let mut query = sqlx::query(&sql);
        for key in SESSION_KEYS {
            query = query.bind(key);
        }
        match query.execute(&mut *conn).await {
            Ok(_) => ClearOutcome::Cleared,
            Err(e) if is_aborted_transaction(&e) => {
                debug!("transaction aborted, settings discarded on rollback");
                ClearOutcome::PendingRollback
            }
            Err(e) => {
                warn!(error = %e, "failed to clear authorization context");
                ClearOutcome::Failed(e.to_string())
            }
        }
    }

    pub async fn current_token(&self, conn: &mut PgConnection) -> Result<Option<Uuid>, AuthzError> {
        read_token(conn).await
    }

    /// Read back whatever context is bound to this connection
    pub async fn current(&self, conn: &mut PgConnection) -> Result<Option<BoundContext>, AuthzError> {
        let sql = current_setting_sql();
        let mut query = sqlx::query(&sql);
        for key in SESSION_KEYS {
            query = query.bind(key);
        }
        let row = query.fetch_one(&mut *conn).await?;

        let mut values: [Option<String>; 7] = Default::default();
        for (i, slot) in values.iter_mut().enumerate() {
            *slot = row.try_get(i)?;
        }
        BoundContext::from_settings(&values)
    }

    pub async fn require_bound(&self, conn: &mut PgConnection) -> Result<BoundContext, AuthzError> {
        self.current(conn).await?.ok_or(AuthzError::ContextNotBound)
    }
}

async fn read_token(conn: &mut PgConnection) -> Result<Option<Uuid>, AuthzError> {
    let raw: Option<String> = sqlx::query_scalar("SELECT current_setting($1, true)")
        .bind(keys::CONTEXT_TOKEN)
        .fetch_one(&mut *conn)
        .await?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(token) => Uuid::parse_str(token)
            .map(Some)
            .map_err(|e| AuthzError::ContextBinding(format!("unreadable context token: {}", e))),
    }
}

/// Pool `after_release` check: `Ok(false)` tells the pool to close a
/// connection that still carries a context instead of reusing it.
pub async fn verify_released(conn: &mut PgConnection) -> Result<bool, sqlx::Error> {
    match read_token(conn).await {
        Ok(None) => Ok(true),
        Ok(Some(token)) => {
            warn!(%token, "connection returned to pool with a bound context, closing it");
            Ok(false)
        }
        Err(AuthzError::Database(e)) => Err(e),
        Err(e) => {
            warn!(error = %e, "connection returned with unreadable context, closing it");
            Ok(false)
        }
    }
}

fn set_config_sql() -> String {
    let calls: Vec<String> = (0..SESSION_KEYS.len())
        .map(|i| format!("set_config(${}, ${}, true)", i * 2 + 1, i * 2 + 2))
        .collect();
    format!("SELECT {}", calls.join(", "))
}

fn clear_sql() -> String {
    let calls: Vec<String> = (1..=SESSION_KEYS.len())
        .map(|i| format!("set_config(${}, '', true)", i))
        .collect();
    format!("SELECT {}", calls.join(", "))
}

fn current_setting_sql() -> String {
    let calls: Vec<String> = (1..=SESSION_KEYS.len())
        .map(|i| format!("current_setting(${}, true)", i))
        .collect();
    format!("SELECT {}", calls.join(", "))
}
