use async_trait::async_trait;
use futures::future::BoxFuture;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

use crate::authz::binder::{ClearOutcome, ContextBinder};
use crate::authz::context::{AuthorizationContext, BoundContext, Direction, Principal, Role};
use crate::authz::error::AuthzError;
use crate::authz::hierarchy::{HierarchyResolver, NewOrganization, Organization, PathUpdate};

/// Transaction handling behind the executor. `PgScopeBackend` is the real
/// one; tests substitute a recording backend.
#[async_trait]
pub trait ScopeBackend: Send + Sync + 'static {
    type Session: Send;

    async fn begin(&self) -> Result<Self::Session, AuthzError>;

    async fn bind(
        &self,
        session: &mut Self::Session,
        principal: &Principal,
        direction: Direction,
    ) -> Result<AuthorizationContext, AuthzError>;

    async fn clear(&self, session: &mut Self::Session) -> ClearOutcome;

    async fn commit(&self, session: Self::Session) -> Result<(), AuthzError>;

    async fn rollback(&self, session: Self::Session) -> Result<(), AuthzError>;

    /// Called from `Drop` when a unit of work is cancelled mid-flight.
    /// Must clear and roll back without blocking.
    fn abandon(&self, session: Self::Session);
}

/// Pooled Postgres transactions with context bound via `ContextBinder`
#[derive(Debug, Clone)]
pub struct PgScopeBackend {
    pool: PgPool,
    binder: ContextBinder,
    statement_timeout_ms: u64,
}

impl PgScopeBackend {
    pub fn new(pool: PgPool, binder: ContextBinder) -> Self {
        Self {
            pool,
            binder,
            statement_timeout_ms: 0,
        }
    }

    pub fn with_statement_timeout(mut self, ms: u64) -> Self {
        self.statement_timeout_ms = ms;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn binder(&self) -> &ContextBinder {
        &self.binder
    }
}

#[async_trait]
impl ScopeBackend for PgScopeBackend {
    type Session = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Session, AuthzError> {
        let mut tx = self.pool.begin().await?;
        if self.statement_timeout_ms > 0 {
            sqlx::query("SELECT set_config('statement_timeout', $1, true)")
                .bind(format!("{}ms", self.statement_timeout_ms))
                .execute(&mut *tx)
                .await?;
        }
        Ok(tx)
    }

    async fn bind(
        &self,
        session: &mut Self::Session,
        principal: &Principal,
        direction: Direction,
    ) -> Result<AuthorizationContext, AuthzError> {
        self.binder.bind(&mut **session, principal, direction).await
    }

    async fn clear(&self, session: &mut Self::Session) -> ClearOutcome {
        self.binder.clear(&mut **session).await
    }

    async fn commit(&self, session: Self::Session) -> Result<(), AuthzError> {
        session.commit().await?;
        Ok(())
    }

    async fn rollback(&self, session: Self::Session) -> Result<(), AuthzError> {
        session.rollback().await?;
        Ok(())
    }

    fn abandon(&self, mut session: Self::Session) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let binder = self.binder.clone();
                handle.spawn(async move {
                    let outcome = binder.clear(&mut *session).await;
                    if let Err(e) = session.rollback().await {
                        warn!(error = %e, ?outcome, "rollback of abandoned unit of work failed");
                    }
                });
            }
            // No runtime left; dropping the transaction queues its rollback
            Err(_) => drop(session),
        }
    }
}

/// Owns the session until it is released. Dropping it unreleased (the
/// unit-of-work future was cancelled) hands the session to `abandon`.
struct SessionGuard<B: ScopeBackend> {
    backend: Arc<B>,
    session: Option<B::Session>,
}

impl<B: ScopeBackend> SessionGuard<B> {
    fn new(backend: Arc<B>, session: B::Session) -> Self {
        Self {
            backend,
            session: Some(session),
        }
    }

    fn session_mut(&mut self) -> Result<&mut B::Session, AuthzError> {
        self.session.as_mut().ok_or(AuthzError::ScopeReleased)
    }

    /// Clear, then commit or roll back. Runs at most once.
    async fn release(&mut self, commit: bool) -> Result<(), AuthzError> {
        let Some(mut session) = self.session.take() else {
            return Err(AuthzError::ScopeReleased);
        };

        match self.backend.clear(&mut session).await {
            ClearOutcome::Cleared if commit => self.backend.commit(session).await,
            ClearOutcome::Cleared => self.backend.rollback(session).await,
            ClearOutcome::PendingRollback => {
                self.backend.rollback(session).await?;
                if commit {
                    Err(AuthzError::TransactionAborted)
                } else {
                    Ok(())
                }
            }
            ClearOutcome::Failed(msg) => {
                if let Err(e) = self.backend.rollback(session).await {
                    warn!(error = %e, "rollback after failed clear also failed");
                }
                Err(AuthzError::ContextClear(msg))
            }
        }
    }
}

impl<B: ScopeBackend> Drop for SessionGuard<B> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            warn!("unit of work dropped before release, abandoning session");
            self.backend.abandon(session);
        }
    }
}

/// Handle given to a unit of work: the bound session plus its context
pub struct Scope<'s, B: ScopeBackend> {
    session: &'s mut B::Session,
    context: &'s mut AuthorizationContext,
    backend: &'s B,
}

impl<'s, B: ScopeBackend> Scope<'s, B> {
    pub fn context(&self) -> &AuthorizationContext {
        &*self.context
    }

    pub fn session(&mut self) -> &mut B::Session {
        &mut *self.session
    }

    /// Clear and rebind with the same principal and direction so the
    /// visibility set reflects tree changes made in this unit of work
    pub async fn refresh(&mut self) -> Result<(), AuthzError> {
        match self.backend.clear(&mut *self.session).await {
            ClearOutcome::Cleared => {}
            ClearOutcome::PendingRollback => return Err(AuthzError::TransactionAborted),
            ClearOutcome::Failed(msg) => return Err(AuthzError::ContextClear(msg)),
        }
        let principal = self.context.principal();
        let direction = self.context.direction;
        *self.context = self.backend.bind(&mut *self.session, &principal, direction).await?;
        debug!(token = %self.context.token, visible = self.context.visible.len(), "refreshed context");
        Ok(())
    }
}

impl<'s> Scope<'s, PgScopeBackend> {
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut **self.session
    }

    pub fn resolver(&self) -> &HierarchyResolver {
        self.backend.binder.resolver()
    }

    /// The context as the database sees it, read back from session settings
    pub async fn bound_context(&mut self) -> Result<BoundContext, AuthzError> {
        self.backend.binder.require_bound(&mut **self.session).await
    }

    /// Every organization in the bound visibility set
    pub async fn visible_organizations(&mut self) -> Result<Vec<Organization>, AuthzError> {
        let resolver = self.backend.binder.resolver();
        if self.context.global {
            let sql = format!(
                "SELECT {} FROM organizations ORDER BY depth, name",
                Organization::COLUMNS
            );
            let rows = sqlx::query(&sql).fetch_all(&mut **self.session).await?;
            return rows.iter().map(Organization::from_row).collect();
        }
        let ids: Vec<Uuid> = self.context.visible.iter().copied().collect();
        resolver.fetch_many(&mut **self.session, &ids).await
    }

    pub async fn organization(&mut self, org: Uuid) -> Result<Organization, AuthzError> {
        self.context.require_visible(org)?;
        self.backend.binder.resolver().fetch(&mut **self.session, org).await
    }

    /// Lineage of a visible organization, limited to what the context may see
    pub async fn ancestors_of(&mut self, org: Uuid) -> Result<Vec<Uuid>, AuthzError> {
        self.context.require_visible(org)?;
        let lineage = self.backend.binder.resolver().ancestors_of(&mut **self.session, org).await?;
        Ok(lineage.into_iter().filter(|id| self.context.can_see(id)).collect())
    }

    /// Subtree of a visible organization, limited to what the context may see
    pub async fn descendants_of(&mut self, org: Uuid) -> Result<Vec<Uuid>, AuthzError> {
        self.context.require_visible(org)?;
        let subtree = self.backend.binder.resolver().descendants_of(&mut **self.session, org).await?;
        Ok(subtree.into_iter().filter(|id| self.context.can_see(id)).collect())
    }

    /// Reparent a visible organization under another visible one. Requires admin.
    pub async fn move_subtree(&mut self, org: Uuid, new_parent: Uuid) -> Result<Vec<PathUpdate>, AuthzError> {
        self.context.require_role(Role::Admin)?;
        self.context.require_visible(org)?;
        self.context.require_visible(new_parent)?;

        let updates = self
            .backend
            .binder
            .resolver()
            .move_subtree(&mut **self.session, org, new_parent)
            .await?;
        self.refresh().await?;
        Ok(updates)
    }

    /// Create an organization under a visible parent. Roots need global scope.
    pub async fn create_organization(&mut self, new: &NewOrganization) -> Result<Organization, AuthzError> {
        self.context.require_role(Role::Admin)?;
        match new.parent_id {
            Some(parent) => self.context.require_visible(parent)?,
            None if self.context.global => {}
            None => {
                return Err(AuthzError::Forbidden {
                    role: self.context.role,
                    direction: self.context.direction,
                })
            }
        }

        let created = self
            .backend
            .binder
            .resolver()
            .create_organization(&mut **self.session, new)
            .await?;
        self.refresh().await?;
        Ok(created)
    }
}

/// Runs units of work with an authorization context bound for exactly
/// their duration. The single entry point for scoped data access.
pub struct ScopedExecutor<B: ScopeBackend = PgScopeBackend> {
    backend: Arc<B>,
    timeout: Duration,
}

impl<B: ScopeBackend> Clone for ScopedExecutor<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            timeout: self.timeout,
        }
    }
}

impl ScopedExecutor<PgScopeBackend> {
    /// Executor over `pool` with limits from `CONFIG`
    pub fn from_pool(pool: PgPool) -> Self {
        let config = crate::config::config();
        let backend = PgScopeBackend::new(pool, ContextBinder::from_config())
            .with_statement_timeout(config.database.statement_timeout_ms);
        Self::new(backend, config.authz.unit_of_work_timeout())
    }
}

impl<B: ScopeBackend> ScopedExecutor<B> {
    pub fn new(backend: B, timeout: Duration) -> Self {
        Self {
            backend: Arc::new(backend),
            timeout,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Begin a transaction, bind `principal` looking in `direction`, run
    /// `work`, then clear and commit (or roll back on any failure).
    ///
    /// Bind happens once and clear happens once on every path, including
    /// bind failure and timeout. Cancelling the returned future abandons
    /// the session, which clears and rolls back in the background.
    pub async fn run<T, E, F>(&self, principal: Principal, direction: Direction, work: F) -> Result<T, E>
    where
        F: for<'s> FnOnce(Scope<'s, B>) -> BoxFuture<'s, Result<T, E>> + Send,
        E: From<AuthzError> + Send,
        T: Send,
    {
        let span = tracing::info_span!(
            "unit_of_work",
            user_id = %principal.user_id,
            org = %principal.organization_id,
            role = %principal.role,
            %direction,
        );
        self.run_bound(principal, direction, work).instrument(span).await
    }

    async fn run_bound<T, E, F>(&self, principal: Principal, direction: Direction, work: F) -> Result<T, E>
    where
        F: for<'s> FnOnce(Scope<'s, B>) -> BoxFuture<'s, Result<T, E>> + Send,
        E: From<AuthzError> + Send,
        T: Send,
    {
        let started = Instant::now();
        let session = self.backend.begin().await?;
        let mut guard = SessionGuard::new(self.backend.clone(), session);

        let bound = self.backend.bind(guard.session_mut()?, &principal, direction).await;
        let mut context = match bound {
            Ok(context) => context,
            Err(e) => {
                if let Err(release_err) = guard.release(false).await {
                    warn!(error = %release_err, "release after failed bind");
                }
                return Err(e.into());
            }
        };

        let outcome = {
            let scope = Scope {
                session: guard.session_mut()?,
                context: &mut context,
                backend: &*self.backend,
            };
            tokio::time::timeout(self.timeout, work(scope)).await
        };

        let result = match outcome {
            Ok(Ok(value)) => guard.release(true).await.map(|_| value).map_err(E::from),
            Ok(Err(e)) => {
                if let Err(release_err) = guard.release(false).await {
                    warn!(error = %release_err, "release after failed unit of work");
                }
                Err(e)
            }
            Err(_) => {
                warn!(timeout = ?self.timeout, "unit of work timed out");
                if let Err(release_err) = guard.release(false).await {
                    warn!(error = %release_err, "release after timeout");
                }
                Err(AuthzError::Timeout(self.timeout).into())
            }
        };

        debug!(
            token = %context.token,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "unit of work finished"
        );
        result
    }
}
