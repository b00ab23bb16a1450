use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{error, info, warn};

use crate::authz::error::AuthzError;
use crate::authz::predicates::{reference_cycles, scan_references, PolicyCatalog, PolicyCommand};
use crate::config::Environment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    RoleIsSuperuser,
    RoleBypassesRls,
    InheritsBypassRole,
    SessionUserPrivileged,
    TableMissing,
    RlsDisabled,
    RlsNotForced,
    NoPolicies,
    MissingPolicy,
    UnconstrainedPolicy,
    NonLeafPredicate,
    CircularPredicate,
    UnvettedFunction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub severity: Severity,
    /// Role, table or `table.policy` the finding is about
    pub subject: String,
    pub detail: String,
}

impl Finding {
    fn critical(kind: FindingKind, subject: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            severity: Severity::Critical,
            subject: subject.into(),
            detail: detail.into(),
        }
    }

    fn warning(kind: FindingKind, subject: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            severity: Severity::Warning,
            subject: subject.into(),
            detail: detail.into(),
        }
    }
}

/// Privilege attributes of a database role
#[derive(Debug, Clone, Default, Serialize)]
pub struct RoleFacts {
    pub name: String,
    pub superuser: bool,
    pub bypass_rls: bool,
    /// Roles this one is (transitively) a member of that are superuser or BYPASSRLS
    pub privileged_memberships: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableFacts {
    pub name: String,
    pub rls_enabled: bool,
    pub rls_forced: bool,
}

/// One row of `pg_policies`
#[derive(Debug, Clone, Serialize)]
pub struct PolicyFacts {
    pub table: String,
    pub name: String,
    /// `SELECT`, `INSERT`, `UPDATE`, `DELETE` or `ALL`
    pub command: String,
    pub permissive: bool,
    pub using_expr: Option<String>,
    pub check_expr: Option<String>,
}

impl PolicyFacts {
    fn applies_to(&self, command: PolicyCommand) -> bool {
        self.command == "ALL" || self.command == command.as_sql()
    }

    fn expressions(&self) -> impl Iterator<Item = &str> {
        self.using_expr.iter().chain(self.check_expr.iter()).map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GuardReport {
    pub safe: bool,
    pub role: String,
    pub session_user: String,
    pub checked_tables: usize,
    pub findings: Vec<Finding>,
    pub checked_at: DateTime<Utc>,
}

impl GuardReport {
    pub fn critical(&self) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Critical)
            .count()
    }

    pub fn log(&self) {
        for finding in &self.findings {
            match finding.severity {
                Severity::Critical => error!(
                    kind = ?finding.kind,
                    subject = %finding.subject,
                    detail = %finding.detail,
                    "privilege guard finding"
                ),
                Severity::Warning => warn!(
                    kind = ?finding.kind,
                    subject = %finding.subject,
                    detail = %finding.detail,
                    "privilege guard finding"
                ),
            }
        }
        info!(
            safe = self.safe,
            role = %self.role,
            session_user = %self.session_user,
            tables = self.checked_tables,
            findings = self.findings.len(),
            "privilege guard finished"
        );
    }
}

/// The application role must not be able to skip row policies
pub fn evaluate_role(role: &RoleFacts) -> Vec<Finding> {
    let mut findings = Vec::new();
    if role.superuser {
        findings.push(Finding::critical(
            FindingKind::RoleIsSuperuser,
            &role.name,
            format!("role {} is a superuser and ignores row-level security", role.name),
        ));
    }
    if role.bypass_rls {
        findings.push(Finding::critical(
            FindingKind::RoleBypassesRls,
            &role.name,
            format!("role {} has BYPASSRLS", role.name),
        ));
    }
    for parent in &role.privileged_memberships {
        findings.push(Finding::critical(
            FindingKind::InheritsBypassRole,
            &role.name,
            format!("role {} is a member of privileged role {}", role.name, parent),
        ));
    }
    findings
}

/// The login role can `RESET ROLE`, so it must be unprivileged too
pub fn evaluate_session_user(session: &RoleFacts, app_role: &str) -> Vec<Finding> {
    if session.name == app_role {
        return Vec::new();
    }
    let mut reasons = Vec::new();
    if session.superuser {
        reasons.push("superuser".to_string());
    }
    if session.bypass_rls {
        reasons.push("BYPASSRLS".to_string());
    }
    reasons.extend(session.privileged_memberships.iter().map(|r| format!("member of {}", r)));

    if reasons.is_empty() {
        return Vec::new();
    }
    vec![Finding::critical(
        FindingKind::SessionUserPrivileged,
        &session.name,
        format!(
            "login role {} is privileged ({}); RESET ROLE would escape row policies",
            session.name,
            reasons.join(", ")
        ),
    )]
}

fn is_literal_true(expr: &str) -> bool {
    let mut e = expr.trim();
    while let Some(inner) = e.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        e = inner.trim();
    }
    e.eq_ignore_ascii_case("true")
}

/// Check governed tables against the catalog
pub fn evaluate_tables(catalog: &PolicyCatalog, tables: &[TableFacts], policies: &[PolicyFacts]) -> Vec<Finding> {
    let mut findings = Vec::new();
    let names = catalog.table_names();
    let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for governed in catalog.tables() {
        let Some(facts) = tables.iter().find(|t| t.name == governed.name) else {
            findings.push(Finding::critical(
                FindingKind::TableMissing,
                governed.name,
                format!("governed table {} does not exist", governed.name),
            ));
            continue;
        };

        if !facts.rls_enabled {
            findings.push(Finding::critical(
                FindingKind::RlsDisabled,
                governed.name,
                "row level security is not enabled",
            ));
        }
        if !facts.rls_forced {
            findings.push(Finding::critical(
                FindingKind::RlsNotForced,
                governed.name,
                "row level security is not forced; the table owner bypasses it",
            ));
        }

        let on_table: Vec<&PolicyFacts> = policies.iter().filter(|p| p.table == governed.name).collect();
        if on_table.is_empty() {
            findings.push(Finding::critical(
                FindingKind::NoPolicies,
                governed.name,
                "no policies installed",
            ));
            continue;
        }

        for command in PolicyCommand::ALL {
            let expected = governed.policy_name(command);
            if !on_table.iter().any(|p| p.name == expected && p.applies_to(command)) {
                findings.push(Finding::critical(
                    FindingKind::MissingPolicy,
                    governed.name,
                    format!("policy {} for {} is missing", expected, command),
                ));
            }
        }

        for policy in &on_table {
            let subject = format!("{}.{}", policy.table, policy.name);

            let open = policy.expressions().any(is_literal_true)
                || (policy.using_expr.is_none() && policy.check_expr.is_none());
            if policy.permissive && open {
                findings.push(Finding::critical(
                    FindingKind::UnconstrainedPolicy,
                    &subject,
                    "permissive policy admits every row",
                ));
            }

            for expr in policy.expressions() {
                let refs = scan_references(expr, &names);
                for table in &refs.tables {
                    findings.push(Finding::critical(
                        FindingKind::NonLeafPredicate,
                        &subject,
                        format!("predicate reads governed table {}", table),
                    ));
                    edges.entry(governed.name.to_string()).or_default().insert(table.clone());
                }
                for function in refs.unvetted_functions() {
                    findings.push(Finding::warning(
                        FindingKind::UnvettedFunction,
                        &subject,
                        format!("predicate calls {}(), which is not on the vetted list", function),
                    ));
                }
            }
        }
    }

    for cycle in reference_cycles(&edges) {
        let mut chain = cycle.clone();
        if let Some(first) = cycle.first() {
            chain.push(first.clone());
        }
        findings.push(Finding::critical(
            FindingKind::CircularPredicate,
            cycle.join(","),
            format!("policies reference each other: {}", chain.join(" -> ")),
        ));
    }

    findings
}

/// Combine all checks into a report
pub fn evaluate(
    role: &RoleFacts,
    session: &RoleFacts,
    catalog: &PolicyCatalog,
    tables: &[TableFacts],
    policies: &[PolicyFacts],
) -> GuardReport {
    let mut findings = evaluate_role(role);
    findings.extend(evaluate_session_user(session, &role.name));
    findings.extend(evaluate_tables(catalog, tables, policies));

    GuardReport {
        safe: !findings.iter().any(|f| f.severity == Severity::Critical),
        role: role.name.clone(),
        session_user: session.name.clone(),
        checked_tables: catalog.tables().len(),
        findings,
        checked_at: Utc::now(),
    }
}

/// Verifies against the live catalogs that row policies cannot be bypassed
#[derive(Debug, Clone)]
pub struct PrivilegeGuard {
    catalog: PolicyCatalog,
}

impl Default for PrivilegeGuard {
    fn default() -> Self {
        Self::new(PolicyCatalog::standard())
    }
}

impl PrivilegeGuard {
    pub fn new(catalog: PolicyCatalog) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &PolicyCatalog {
        &self.catalog
    }

    /// Run on a connection from `pool`, i.e. as the role the application uses
    pub async fn verify(&self, pool: &PgPool) -> Result<GuardReport, AuthzError> {
        let mut conn = pool.acquire().await?;
        self.verify_conn(&mut conn).await
    }

    pub async fn verify_conn(&self, conn: &mut PgConnection) -> Result<GuardReport, AuthzError> {
        let (current, session): (String, String) =
            sqlx::query_as("SELECT current_user::text, session_user::text")
                .fetch_one(&mut *conn)
                .await?;

        let role = role_facts(conn, &current).await?;
        let session_facts = if session == current {
            role.clone()
        } else {
            role_facts(conn, &session).await?
        };
        let tables = self.table_facts(conn).await?;
        let policies = self.policy_facts(conn).await?;

        Ok(evaluate(&role, &session_facts, &self.catalog, &tables, &policies))
    }

    pub async fn table_facts(&self, conn: &mut PgConnection) -> Result<Vec<TableFacts>, AuthzError> {
        let rows: Vec<(String, bool, bool)> = sqlx::query_as(
            r#"
            SELECT c.relname::text, c.relrowsecurity, c.relforcerowsecurity
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = current_schema()
              AND c.relkind IN ('r', 'p')
              AND c.relname::text = ANY($1)
            "#,
        )
        .bind(self.catalog.table_names())
        .fetch_all(&mut *conn)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(name, rls_enabled, rls_forced)| TableFacts {
                name,
                rls_enabled,
                rls_forced,
            })
            .collect())
    }

    pub async fn policy_facts(&self, conn: &mut PgConnection) -> Result<Vec<PolicyFacts>, AuthzError> {
        let rows: Vec<(String, String, String, String, Option<String>, Option<String>)> = sqlx::query_as(
            r#"
            SELECT tablename::text, policyname::text, cmd, permissive, qual, with_check
            FROM pg_policies
            WHERE schemaname = current_schema()
              AND tablename::text = ANY($1)
            ORDER BY tablename, policyname
            "#,
        )
        .bind(self.catalog.table_names())
        .fetch_all(&mut *conn)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(table, name, command, permissive, using_expr, check_expr)| PolicyFacts {
                table,
                name,
                command,
                permissive: permissive.eq_ignore_ascii_case("PERMISSIVE"),
                using_expr,
                check_expr,
            })
            .collect())
    }

    /// Fatal outside development, loud everywhere
    pub fn enforce(report: &GuardReport, environment: Environment) -> Result<(), AuthzError> {
        report.log();
        if report.safe {
            return Ok(());
        }
        match environment {
            Environment::Development => {
                warn!(
                    critical = report.critical(),
                    "privilege guard failed; continuing because APP_ENV is development"
                );
                Ok(())
            }
            Environment::Staging | Environment::Production => Err(AuthzError::PrivilegeGuardFailure {
                critical: report.critical(),
            }),
        }
    }
}

async fn role_facts(conn: &mut PgConnection, name: &str) -> Result<RoleFacts, AuthzError> {
    let attrs: Option<(bool, bool)> =
        sqlx::query_as("SELECT rolsuper, rolbypassrls FROM pg_roles WHERE rolname::text = $1")
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?;
    let (superuser, bypass_rls) = attrs.unwrap_or((false, false));

    let privileged_memberships: Vec<String> = sqlx::query_scalar(
        r#"
        WITH RECURSIVE memberships(roleid) AS (
            SELECT oid FROM pg_roles WHERE rolname::text = $1
            UNION
            SELECT m.roleid
            FROM pg_auth_members m
            JOIN memberships ms ON m.member = ms.roleid
        )
        SELECT r.rolname::text
        FROM memberships ms
        JOIN pg_roles r ON r.oid = ms.roleid
        WHERE r.rolname::text <> $1
          AND (r.rolsuper OR r.rolbypassrls)
        ORDER BY 1
        "#,
    )
    .bind(name)
    .fetch_all(&mut *conn)
    .await?;

    Ok(RoleFacts {
        name: name.to_string(),
        superuser,
        bypass_rls,
        privileged_memberships,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::predicates::GovernedTable;

    fn app_role() -> RoleFacts {
        RoleFacts {
            name: "orgscope_app".to_string(),
            ..Default::default()
        }
    }

    fn healthy(catalog: &PolicyCatalog) -> (Vec<TableFacts>, Vec<PolicyFacts>) {
        let tables = catalog
            .tables()
            .iter()
            .map(|t| TableFacts {
                name: t.name.to_string(),
                rls_enabled: true,
                rls_forced: true,
            })
            .collect();
        let policies = catalog
            .expected_policies()
            .into_iter()
            .map(|p| {
                let governed = catalog.table(p.table).unwrap();
                let (using_expr, check_expr) = match p.command {
                    PolicyCommand::Select => (Some(governed.read.render()), None),
                    PolicyCommand::Insert => (
                        None,
                        Some(governed.insert_check.as_ref().unwrap_or(&governed.write).render()),
                    ),
                    PolicyCommand::Update => (Some(governed.write.render()), Some(governed.write.render())),
                    PolicyCommand::Delete => (Some(governed.write.render()), None),
                };
                PolicyFacts {
                    table: p.table.to_string(),
                    name: p.name,
                    command: p.command.as_sql().to_string(),
                    permissive: true,
                    using_expr,
                    check_expr,
                }
            })
            .collect();
        (tables, policies)
    }

    #[test]
    fn healthy_catalog_is_safe() {
        let catalog = PolicyCatalog::standard();
        let (tables, policies) = healthy(&catalog);
        let report = evaluate(&app_role(), &app_role(), &catalog, &tables, &policies);
        assert!(report.safe, "{:?}", report.findings);
        assert!(report.findings.is_empty());
        assert_eq!(report.checked_tables, catalog.tables().len());
    }

    #[test]
    fn bypass_role_is_named_in_findings() {
        let catalog = PolicyCatalog::standard();
        let (tables, policies) = healthy(&catalog);
        let role = RoleFacts {
            name: "reporting".to_string(),
            bypass_rls: true,
            ..Default::default()
        };
        let report = evaluate(&role, &role, &catalog, &tables, &policies);
        assert!(!report.safe);
        let finding = report
            .findings
            .iter()
            .find(|f| f.kind == FindingKind::RoleBypassesRls)
            .unwrap();
        assert_eq!(finding.subject, "reporting");
        assert!(finding.detail.contains("reporting"));
    }

    #[test]
    fn inherited_privilege_and_superuser_are_critical() {
        let role = RoleFacts {
            name: "app".to_string(),
            superuser: true,
            bypass_rls: false,
            privileged_memberships: vec!["admins".to_string()],
        };
        let findings = evaluate_role(&role);
        assert_eq!(findings.len(), 2);
        assert!(findings.iter().all(|f| f.severity == Severity::Critical));
        assert!(findings.iter().any(|f| f.kind == FindingKind::InheritsBypassRole && f.detail.contains("admins")));
    }

    #[test]
    fn privileged_login_role_can_escape_via_reset_role() {
        let login = RoleFacts {
            name: "postgres".to_string(),
            superuser: true,
            ..Default::default()
        };
        let findings = evaluate_session_user(&login, "orgscope_app");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, FindingKind::SessionUserPrivileged);
        assert!(evaluate_session_user(&app_role(), "orgscope_app").is_empty());
    }

    #[test]
    fn missing_forced_mode_and_policies_are_reported() {
        let catalog = PolicyCatalog::new(vec![
            GovernedTable::org_scoped("claims", "organization_id"),
            GovernedTable::org_scoped("deadlines", "organization_id"),
            GovernedTable::org_scoped("dues_payments", "organization_id"),
        ]);
        let (mut tables, mut policies) = healthy(&catalog);
        tables[0].rls_forced = false;
        tables.retain(|t| t.name != "dues_payments");
        policies.retain(|p| !(p.table == "deadlines" && p.command == "DELETE"));

        let findings = evaluate_tables(&catalog, &tables, &policies);
        let kinds: Vec<FindingKind> = findings.iter().map(|f| f.kind).collect();
        assert!(kinds.contains(&FindingKind::RlsNotForced));
        assert!(kinds.contains(&FindingKind::TableMissing));
        assert!(findings
            .iter()
            .any(|f| f.kind == FindingKind::MissingPolicy && f.detail.contains("deadlines_delete_scope")));
    }

    #[test]
    fn extra_open_policy_is_unconstrained() {
        let catalog = PolicyCatalog::new(vec![GovernedTable::org_scoped("claims", "organization_id")]);
        let (tables, mut policies) = healthy(&catalog);
        policies.push(PolicyFacts {
            table: "claims".to_string(),
            name: "debug_all".to_string(),
            command: "ALL".to_string(),
            permissive: true,
            using_expr: Some("true".to_string()),
            check_expr: None,
        });
        let findings = evaluate_tables(&catalog, &tables, &policies);
        assert!(findings
            .iter()
            .any(|f| f.kind == FindingKind::UnconstrainedPolicy && f.subject == "claims.debug_all"));
    }

    #[test]
    fn open_organization_read_is_unconstrained() {
        let catalog = PolicyCatalog::standard();
        let (tables, mut policies) = healthy(&catalog);
        let select = policies
            .iter_mut()
            .find(|p| p.name == "organizations_select_scope")
            .unwrap();
        select.using_expr = Some("true".to_string());

        let findings = evaluate_tables(&catalog, &tables, &policies);
        assert!(findings.iter().any(|f| f.kind == FindingKind::UnconstrainedPolicy
            && f.subject == "organizations.organizations_select_scope"
            && f.severity == Severity::Critical));
    }

    #[test]
    fn parenthesized_literal_true_is_open() {
        assert!(is_literal_true("(true)"));
        assert!(is_literal_true(" ((TRUE)) "));
        assert!(!is_literal_true("(authz.global_scope() OR true_flag)"));
    }

    #[test]
    fn cross_table_predicates_form_a_cycle() {
        let catalog = PolicyCatalog::new(vec![
            GovernedTable::org_scoped("claims", "organization_id"),
            GovernedTable::org_scoped("organization_members", "organization_id"),
        ]);
        let (tables, mut policies) = healthy(&catalog);
        for p in policies.iter_mut() {
            if p.command == "SELECT" {
                let other = if p.table == "claims" { "organization_members" } else { "claims" };
                p.using_expr = Some(format!(
                    "(EXISTS ( SELECT 1 FROM {} x WHERE (x.organization_id = organization_id)))",
                    other
                ));
            }
        }
        let findings = evaluate_tables(&catalog, &tables, &policies);
        assert!(findings.iter().any(|f| f.kind == FindingKind::NonLeafPredicate));
        let cycle = findings
            .iter()
            .find(|f| f.kind == FindingKind::CircularPredicate)
            .unwrap();
        assert_eq!(cycle.subject, "claims,organization_members");
    }

    #[test]
    fn unvetted_function_is_a_warning() {
        let catalog = PolicyCatalog::new(vec![GovernedTable::org_scoped("claims", "organization_id")]);
        let (tables, mut policies) = healthy(&catalog);
        policies[0].using_expr = Some("(organization_id = my_scope())".to_string());
        let report = evaluate(&app_role(), &app_role(), &catalog, &tables, &policies);
        assert!(report.safe);
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].severity, Severity::Warning);
    }

    #[test]
    fn enforce_is_fatal_outside_development() {
        let catalog = PolicyCatalog::standard();
        let report = evaluate(&app_role(), &app_role(), &catalog, &[], &[]);
        assert!(!report.safe);
        assert!(PrivilegeGuard::enforce(&report, Environment::Development).is_ok());
        assert!(matches!(
            PrivilegeGuard::enforce(&report, Environment::Production),
            Err(AuthzError::PrivilegeGuardFailure { .. })
        ));
        assert!(PrivilegeGuard::enforce(&report, Environment::Staging).is_err());
    }
}
