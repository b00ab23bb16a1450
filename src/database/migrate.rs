use serde::Serialize;
use sqlx::{Executor, PgPool};
use thiserror::Error;
use tracing::{error, info};

use crate::authz::error::AuthzError;
use crate::authz::guard::{evaluate_tables, Finding, PrivilegeGuard, Severity};
use crate::authz::predicates::PolicyCatalog;
use crate::database::manager::{DatabaseError, DatabaseManager};

/// Governed tables and the policy version table
pub const SCHEMA_SQL: &str = include_str!("../../sql/schema.sql");

/// Transaction-scoped advisory lock key serializing migrations
const MIGRATION_LOCK_KEY: i64 = 0x6f72_6773_6d69_6772;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Authz(#[from] AuthzError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error("Policy verification failed with {} critical finding(s)", .0.len())]
    Verification(Vec<Finding>),

    #[error("Migration role {0} must be superuser or BYPASSRLS to own the tree helpers")]
    HelperOwner(String),
}

/// Rendered DDL for one migration run
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    pub fingerprint: String,
    pub policy_sql: String,
    pub grant_sql: Option<String>,
}

impl MigrationPlan {
    pub fn full_sql(&self) -> String {
        let mut sql = String::from(SCHEMA_SQL);
        sql.push('\n');
        sql.push_str(&self.policy_sql);
        if let Some(grants) = &self.grant_sql {
            sql.push_str(grants);
        }
        sql
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub fingerprint: String,
    pub previous_fingerprint: Option<String>,
    /// False for dry runs
    pub applied: bool,
    pub tables: Vec<String>,
    pub findings: Vec<Finding>,
}

/// Installs the schema, helper functions and row policies in one
/// transaction, then re-reads the live catalogs before committing.
#[derive(Debug, Clone)]
pub struct PolicyMigrator {
    catalog: PolicyCatalog,
    app_role: Option<String>,
}

impl PolicyMigrator {
    pub fn new(catalog: PolicyCatalog, app_role: Option<String>) -> Self {
        Self { catalog, app_role }
    }

    pub fn from_config() -> Self {
        Self::new(
            PolicyCatalog::standard(),
            crate::config::config().database.app_role.clone(),
        )
    }

    pub fn catalog(&self) -> &PolicyCatalog {
        &self.catalog
    }

    pub fn plan(&self) -> Result<MigrationPlan, MigrationError> {
        self.catalog.validate()?;

        let grant_sql = match &self.app_role {
            Some(role) if DatabaseManager::is_valid_role_name(role) => {
                Some(self.catalog.render_grants(&DatabaseManager::quote_identifier(role)))
            }
            Some(role) => return Err(DatabaseError::InvalidRoleName(role.clone()).into()),
            None => None,
        };

        Ok(MigrationPlan {
            fingerprint: self.catalog.fingerprint(),
            policy_sql: self.catalog.render(),
            grant_sql,
        })
    }

    /// Validate and render without touching the database
    pub fn dry_run(&self) -> Result<(MigrationPlan, MigrationReport), MigrationError> {
        let plan = self.plan()?;
        let report = MigrationReport {
            fingerprint: plan.fingerprint.clone(),
            previous_fingerprint: None,
            applied: false,
            tables: self.table_names(),
            findings: Vec::new(),
        };
        Ok((plan, report))
    }

    pub async fn apply(&self, pool: &PgPool) -> Result<MigrationReport, MigrationError> {
        let plan = self.plan()?;
        let mut tx = pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        // The tree helpers run as their owner, and forced policies would
        // filter an owner that can't bypass them
        let (owner, bypasses): (String, bool) = sqlx::query_as(
            "SELECT current_user::text, rolsuper OR rolbypassrls FROM pg_roles WHERE rolname = current_user",
        )
        .fetch_one(&mut *tx)
        .await?;
        if !bypasses {
            tx.rollback().await?;
            return Err(MigrationError::HelperOwner(owner));
        }

        // No bind parameters, so this goes over the simple protocol and may
        // carry many statements
        (&mut *tx).execute(plan.full_sql().as_str()).await?;

        let previous: Option<String> =
            sqlx::query_scalar("SELECT fingerprint FROM authz.policy_versions ORDER BY id DESC LIMIT 1")
                .fetch_optional(&mut *tx)
                .await?;

        if previous.as_deref() != Some(plan.fingerprint.as_str()) {
            sqlx::query("INSERT INTO authz.policy_versions (fingerprint, tables) VALUES ($1, $2)")
                .bind(&plan.fingerprint)
                .bind(self.catalog.table_names())
                .execute(&mut *tx)
                .await?;
        }

        let guard = PrivilegeGuard::new(self.catalog.clone());
        let tables = guard.table_facts(&mut tx).await?;
        let policies = guard.policy_facts(&mut tx).await?;
        let findings = evaluate_tables(&self.catalog, &tables, &policies);

        let critical: Vec<Finding> = findings
            .iter()
            .filter(|f| f.severity == Severity::Critical)
            .cloned()
            .collect();
        if !critical.is_empty() {
            for finding in &critical {
                error!(kind = ?finding.kind, subject = %finding.subject, detail = %finding.detail, "policy verification failed");
            }
            tx.rollback().await?;
            return Err(MigrationError::Verification(critical));
        }

        tx.commit().await?;
        info!(
            fingerprint = %plan.fingerprint,
            previous = ?previous,
            tables = self.catalog.tables().len(),
            "row policies applied"
        );

        Ok(MigrationReport {
            fingerprint: plan.fingerprint,
            previous_fingerprint: previous,
            applied: true,
            tables: self.table_names(),
            findings,
        })
    }

    fn table_names(&self) -> Vec<String> {
        self.catalog.table_names().into_iter().map(String::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_covers_schema_policies_and_grants() {
        let migrator = PolicyMigrator::new(PolicyCatalog::standard(), Some("orgscope_app".to_string()));
        let plan = migrator.plan().unwrap();
        let sql = plan.full_sql();

        assert!(sql.contains("CREATE TABLE IF NOT EXISTS organizations"));
        assert!(sql.contains("CREATE INDEX IF NOT EXISTS organizations_path_gin"));
        assert!(sql.contains("ALTER TABLE claims FORCE ROW LEVEL SECURITY"));
        assert!(sql.contains("GRANT EXECUTE ON ALL FUNCTIONS IN SCHEMA authz TO \"orgscope_app\""));
        // Tree helpers exist before grants, and revoke PUBLIC before the role gets them back
        assert!(sql.find("FUNCTION authz.org_lineage(") < sql.find("GRANT EXECUTE"));
        assert!(sql.find("CREATE TABLE IF NOT EXISTS organizations") < sql.find("FUNCTION authz.org_subtree("));
        assert!(sql.contains("GRANT SELECT, INSERT, UPDATE, DELETE ON claims TO \"orgscope_app\""));
        // Tables exist before policies reference them
        assert!(sql.find("CREATE TABLE IF NOT EXISTS claims") < sql.find("ALTER TABLE claims"));
    }

    #[test]
    fn plan_without_role_has_no_grants() {
        let plan = PolicyMigrator::new(PolicyCatalog::standard(), None).plan().unwrap();
        assert!(plan.grant_sql.is_none());
        assert!(!plan.full_sql().contains("GRANT"));
    }

    #[test]
    fn plan_rejects_unsafe_role_names() {
        let migrator = PolicyMigrator::new(PolicyCatalog::standard(), Some("app\"; DROP".to_string()));
        assert!(matches!(
            migrator.plan(),
            Err(MigrationError::Database(DatabaseError::InvalidRoleName(_)))
        ));
    }

    #[test]
    fn dry_run_reports_fingerprint_without_applying() {
        let migrator = PolicyMigrator::new(PolicyCatalog::standard(), None);
        let (plan, report) = migrator.dry_run().unwrap();
        assert!(!report.applied);
        assert_eq!(report.fingerprint, plan.fingerprint);
        assert_eq!(report.tables.len(), PolicyCatalog::standard().tables().len());
    }
}
