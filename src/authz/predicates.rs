//! Declarative row-level policies for governed tables.
//!
//! Predicates are built from leaf checks against the bound session context
//! only, so a policy can never consult another governed table. The catalog
//! renders to DDL that enables and forces row-level security and installs
//! one policy per command.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::authz::context::{keys, Role};
use crate::authz::error::AuthzError;

/// Schema holding the helper functions and the policy version table
pub const AUTHZ_SCHEMA: &str = "authz";

/// Functions a policy expression may call
pub const VETTED_FUNCTIONS: &[&str] = &[
    "authz.visible_org_ids",
    "authz.current_user_id",
    "authz.current_role_rank",
    "authz.global_scope",
    "current_setting",
    "coalesce",
    "nullif",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Column holds an organization in the visibility set (or scope is global)
    OrgVisible { column: &'static str },
    /// Column holds the bound user id
    OwnedByCurrentUser { column: &'static str },
    RoleAtLeast(Role),
    Always,
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    pub fn org(column: &'static str) -> Self {
        Predicate::OrgVisible { column }
    }

    pub fn owner(column: &'static str) -> Self {
        Predicate::OwnedByCurrentUser { column }
    }

    pub fn render(&self) -> String {
        match self {
            Predicate::OrgVisible { column } => format!(
                "({schema}.global_scope() OR {column} = ANY ({schema}.visible_org_ids()))",
                schema = AUTHZ_SCHEMA,
                column = column
            ),
            Predicate::OwnedByCurrentUser { column } => {
                format!("({} = {}.current_user_id())", column, AUTHZ_SCHEMA)
            }
            Predicate::RoleAtLeast(role) => {
                format!("({}.current_role_rank() >= {})", AUTHZ_SCHEMA, role.rank())
            }
            Predicate::Always => "(true)".to_string(),
            Predicate::And(parts) => join(parts, " AND "),
            Predicate::Or(parts) => join(parts, " OR "),
        }
    }

    /// Columns the predicate reads from the row
    pub fn columns(&self) -> BTreeSet<&'static str> {
        let mut out = BTreeSet::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut BTreeSet<&'static str>) {
        match self {
            Predicate::OrgVisible { column } | Predicate::OwnedByCurrentUser { column } => {
                out.insert(*column);
            }
            Predicate::And(parts) | Predicate::Or(parts) => {
                for p in parts {
                    p.collect_columns(out);
                }
            }
            Predicate::RoleAtLeast(_) | Predicate::Always => {}
        }
    }

    /// True when the predicate admits rows regardless of bound context
    pub fn is_unconstrained(&self) -> bool {
        match self {
            Predicate::Always => true,
            Predicate::And(parts) => parts.iter().all(Predicate::is_unconstrained),
            Predicate::Or(parts) => parts.iter().any(Predicate::is_unconstrained),
            _ => false,
        }
    }

    fn check_shape(&self) -> Result<(), String> {
        match self {
            Predicate::And(parts) | Predicate::Or(parts) => {
                if parts.is_empty() {
                    return Err("empty AND/OR group".to_string());
                }
                parts.iter().try_for_each(Predicate::check_shape)
            }
            Predicate::OrgVisible { column } | Predicate::OwnedByCurrentUser { column } => {
                if is_identifier(column) {
                    Ok(())
                } else {
                    Err(format!("invalid column name '{}'", column))
                }
            }
            Predicate::RoleAtLeast(_) | Predicate::Always => Ok(()),
        }
    }
}

fn join(parts: &[Predicate], sep: &str) -> String {
    let rendered: Vec<String> = parts.iter().map(Predicate::render).collect();
    format!("({})", rendered.join(sep))
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Command a policy applies to, spelled like `pg_policies.cmd`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PolicyCommand {
    Select,
    Insert,
    Update,
    Delete,
}

impl PolicyCommand {
    pub const ALL: [PolicyCommand; 4] = [
        PolicyCommand::Select,
        PolicyCommand::Insert,
        PolicyCommand::Update,
        PolicyCommand::Delete,
    ];

    pub fn as_sql(&self) -> &'static str {
        match self {
            PolicyCommand::Select => "SELECT",
            PolicyCommand::Insert => "INSERT",
            PolicyCommand::Update => "UPDATE",
            PolicyCommand::Delete => "DELETE",
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            PolicyCommand::Select => "select",
            PolicyCommand::Insert => "insert",
            PolicyCommand::Update => "update",
            PolicyCommand::Delete => "delete",
        }
    }
}

impl fmt::Display for PolicyCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// A table under row-level security
#[derive(Debug, Clone)]
pub struct GovernedTable {
    pub name: &'static str,
    pub read: Predicate,
    pub write: Predicate,
    /// Check for new rows when it differs from `write`
    pub insert_check: Option<Predicate>,
}

impl GovernedTable {
    /// Rows scoped by one organization column for every command
    pub fn org_scoped(name: &'static str, column: &'static str) -> Self {
        Self {
            name,
            read: Predicate::org(column),
            write: Predicate::org(column),
            insert_check: None,
        }
    }

    pub fn policy_name(&self, command: PolicyCommand) -> String {
        format!("{}_{}_scope", self.name, command.suffix())
    }

    fn render_policy(&self, command: PolicyCommand) -> String {
        let name = self.policy_name(command);
        let body = match command {
            PolicyCommand::Select => format!("USING {}", self.read.render()),
            PolicyCommand::Insert => format!(
                "WITH CHECK {}",
                self.insert_check.as_ref().unwrap_or(&self.write).render()
            ),
            PolicyCommand::Update => format!(
                "USING {} WITH CHECK {}",
                self.write.render(),
                self.write.render()
            ),
            PolicyCommand::Delete => format!("USING {}", self.write.render()),
        };
        format!(
            "DROP POLICY IF EXISTS {name} ON {table};\n\
             CREATE POLICY {name} ON {table} AS PERMISSIVE FOR {cmd} {body};\n",
            name = name,
            table = self.name,
            cmd = command.as_sql(),
            body = body
        )
    }
}

/// Policy name and command expected on a governed table
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ExpectedPolicy {
    pub table: &'static str,
    pub name: String,
    pub command: PolicyCommand,
}

#[derive(Debug, Clone)]
pub struct PolicyCatalog {
    tables: Vec<GovernedTable>,
}

impl PolicyCatalog {
    pub fn new(tables: Vec<GovernedTable>) -> Self {
        Self { tables }
    }

    /// Every tenant-scoped table in the schema
    pub fn standard() -> Self {
        Self::new(vec![
            GovernedTable {
                name: "organizations",
                // Children are created under a visible parent before the
                // new id can be in the set
                read: Predicate::org("id"),
                write: Predicate::org("id"),
                insert_check: Some(Predicate::Or(vec![Predicate::org("id"), Predicate::org("parent_id")])),
            },
            GovernedTable::org_scoped("organization_members", "organization_id"),
            GovernedTable::org_scoped("claims", "organization_id"),
            GovernedTable::org_scoped("dues_payments", "organization_id"),
            GovernedTable::org_scoped("deadlines", "organization_id"),
            GovernedTable {
                name: "member_documents",
                read: Predicate::And(vec![
                    Predicate::org("organization_id"),
                    Predicate::Or(vec![
                        Predicate::owner("uploaded_by"),
                        Predicate::RoleAtLeast(Role::Officer),
                    ]),
                ]),
                write: Predicate::And(vec![
                    Predicate::org("organization_id"),
                    Predicate::Or(vec![
                        Predicate::owner("uploaded_by"),
                        Predicate::RoleAtLeast(Role::Officer),
                    ]),
                ]),
                insert_check: None,
            },
        ])
    }

    pub fn tables(&self) -> &[GovernedTable] {
        &self.tables
    }

    pub fn table_names(&self) -> Vec<&'static str> {
        self.tables.iter().map(|t| t.name).collect()
    }

    pub fn table(&self, name: &str) -> Option<&GovernedTable> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn expected_policies(&self) -> Vec<ExpectedPolicy> {
        self.tables
            .iter()
            .flat_map(|t| {
                PolicyCommand::ALL.into_iter().map(move |command| ExpectedPolicy {
                    table: t.name,
                    name: t.policy_name(command),
                    command,
                })
            })
            .collect()
    }

    /// Reject catalogs that could not be enforced as declared
    pub fn validate(&self) -> Result<(), AuthzError> {
        let mut seen = BTreeSet::new();
        for table in &self.tables {
            if !is_identifier(table.name) {
                return Err(AuthzError::PolicyCatalog(format!("invalid table name '{}'", table.name)));
            }
            if !seen.insert(table.name) {
                return Err(AuthzError::PolicyCatalog(format!("table '{}' declared twice", table.name)));
            }
            let mut predicates = vec![&table.read, &table.write];
            predicates.extend(table.insert_check.as_ref());
            for predicate in predicates {
                predicate
                    .check_shape()
                    .map_err(|e| AuthzError::PolicyCatalog(format!("{}: {}", table.name, e)))?;
            }
            if table.write.is_unconstrained()
                || table.insert_check.as_ref().is_some_and(Predicate::is_unconstrained)
            {
                return Err(AuthzError::PolicyCatalog(format!(
                    "{}: write predicates must depend on the bound context",
                    table.name
                )));
            }
        }
        Ok(())
    }

    /// Leaf helper functions reading only session settings
    pub fn render_helpers(&self) -> String {
        format!(
            r#"CREATE SCHEMA IF NOT EXISTS {schema};

CREATE OR REPLACE FUNCTION {schema}.visible_org_ids() RETURNS uuid[]
    LANGUAGE sql STABLE
    AS $$ SELECT COALESCE(NULLIF(current_setting('{visible}', true), ''), '{{}}')::uuid[] $$;

CREATE OR REPLACE FUNCTION {schema}.current_user_id() RETURNS uuid
    LANGUAGE sql STABLE
    AS $$ SELECT NULLIF(current_setting('{user}', true), '')::uuid $$;

CREATE OR REPLACE FUNCTION {schema}.current_role_rank() RETURNS integer
    LANGUAGE sql STABLE
    AS $$ SELECT COALESCE(NULLIF(current_setting('{rank}', true), '')::integer, -1) $$;

CREATE OR REPLACE FUNCTION {schema}.global_scope() RETURNS boolean
    LANGUAGE sql STABLE
    AS $$ SELECT COALESCE(current_setting('{global}', true) = 'on', false) $$;
"#,
            schema = AUTHZ_SCHEMA,
            visible = keys::VISIBLE_ORG_IDS,
            user = keys::USER_ID,
            rank = keys::ROLE_RANK,
            global = keys::GLOBAL_SCOPE,
        )
    }

    /// `SECURITY DEFINER` readers of the organization tree. The binder
    /// resolves visibility before any context is bound, so it cannot go
    /// through the scoped `organizations` policy. They return ids and path
    /// columns only and are not executable by `PUBLIC`.
    pub fn render_tree_helpers(&self) -> String {
        format!(
            r#"
CREATE OR REPLACE FUNCTION {schema}.org_exists(target uuid) RETURNS boolean
    LANGUAGE sql STABLE SECURITY DEFINER SET search_path FROM CURRENT
    AS $$ SELECT EXISTS (SELECT 1 FROM organizations o WHERE o.id = target) $$;

CREATE OR REPLACE FUNCTION {schema}.org_lineage(target uuid)
    RETURNS TABLE (id uuid, parent_id uuid, kind text, materialized_path uuid[], depth integer)
    LANGUAGE sql STABLE SECURITY DEFINER SET search_path FROM CURRENT
    AS $$
        SELECT a.id, a.parent_id, a.kind, a.materialized_path, a.depth
        FROM organizations o
        JOIN organizations a ON a.id = ANY (o.materialized_path)
        WHERE o.id = target
        ORDER BY a.depth
    $$;

CREATE OR REPLACE FUNCTION {schema}.lock_org_lineage(target uuid)
    RETURNS TABLE (id uuid, parent_id uuid, kind text, materialized_path uuid[], depth integer)
    LANGUAGE sql VOLATILE SECURITY DEFINER SET search_path FROM CURRENT
    AS $$
        SELECT a.id, a.parent_id, a.kind, a.materialized_path, a.depth
        FROM organizations o
        JOIN organizations a ON a.id = ANY (o.materialized_path)
        WHERE o.id = target
        ORDER BY a.depth
        FOR SHARE OF a
    $$;

CREATE OR REPLACE FUNCTION {schema}.org_subtree(target uuid)
    RETURNS TABLE (id uuid, depth integer)
    LANGUAGE sql STABLE SECURITY DEFINER SET search_path FROM CURRENT
    AS $$
        SELECT o.id, o.depth
        FROM organizations o
        WHERE o.materialized_path @> ARRAY[target]
        ORDER BY o.depth
    $$;

CREATE OR REPLACE FUNCTION {schema}.org_closure(target uuid, max_hops integer)
    RETURNS TABLE (id uuid, hops integer)
    LANGUAGE sql STABLE SECURITY DEFINER SET search_path FROM CURRENT
    AS $$
        WITH RECURSIVE walk(node_id, walked) AS (
            SELECT o.id, 0 FROM organizations o WHERE o.id = target
            UNION ALL
            SELECT c.id, w.walked + 1
            FROM organizations c
            JOIN walk w ON c.parent_id = w.node_id
            WHERE w.walked < max_hops
        )
        SELECT node_id, walked FROM walk ORDER BY walked
    $$;

REVOKE ALL ON FUNCTION {schema}.org_exists(uuid) FROM PUBLIC;
REVOKE ALL ON FUNCTION {schema}.org_lineage(uuid) FROM PUBLIC;
REVOKE ALL ON FUNCTION {schema}.lock_org_lineage(uuid) FROM PUBLIC;
REVOKE ALL ON FUNCTION {schema}.org_subtree(uuid) FROM PUBLIC;
REVOKE ALL ON FUNCTION {schema}.org_closure(uuid, integer) FROM PUBLIC;
"#,
            schema = AUTHZ_SCHEMA,
        )
    }

    pub fn render_policies(&self) -> String {
        let mut out = String::new();
        for table in &self.tables {
            out.push_str(&format!(
                "\nALTER TABLE {t} ENABLE ROW LEVEL SECURITY;\nALTER TABLE {t} FORCE ROW LEVEL SECURITY;\n",
                t = table.name
            ));
            for command in PolicyCommand::ALL {
                out.push_str(&table.render_policy(command));
            }
        }
        out
    }

    /// Grants for the application role; `role` must already be quoted
    pub fn render_grants(&self, role: &str) -> String {
        let mut out = format!(
            "\nGRANT USAGE ON SCHEMA {schema} TO {role};\n\
             GRANT EXECUTE ON ALL FUNCTIONS IN SCHEMA {schema} TO {role};\n",
            schema = AUTHZ_SCHEMA,
            role = role
        );
        for table in &self.tables {
            out.push_str(&format!(
                "GRANT SELECT, INSERT, UPDATE, DELETE ON {} TO {};\n",
                table.name, role
            ));
        }
        out
    }

    /// Full policy DDL, excluding grants
    pub fn render(&self) -> String {
        format!(
            "{}{}{}",
            self.render_helpers(),
            self.render_tree_helpers(),
            self.render_policies()
        )
    }

    /// SHA-256 of the rendered DDL, hex encoded
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.render().as_bytes());
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// Tables and functions mentioned by a policy expression
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct References {
    pub tables: BTreeSet<String>,
    pub functions: BTreeSet<String>,
}

impl References {
    pub fn unvetted_functions(&self) -> Vec<&str> {
        self.functions
            .iter()
            .map(String::as_str)
            .filter(|f| !VETTED_FUNCTIONS.contains(f))
            .collect()
    }
}

/// Scan a deparsed policy expression (as in `pg_policies.qual`) for
/// references to `tables` and for function calls. String literals are skipped.
pub fn scan_references(expr: &str, tables: &[&str]) -> References {
    let mut refs = References::default();
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '\'' {
            i += 1;
            while i < chars.len() {
                if chars[i] == '\'' {
                    if chars.get(i + 1) == Some(&'\'') {
                        i += 2;
                        continue;
                    }
                    break;
                }
                i += 1;
            }
            i += 1;
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' || c == '"' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || matches!(chars[i], '_' | '.' | '"')) {
                i += 1;
            }
            let token: String = chars[start..i]
                .iter()
                .filter(|ch| **ch != '"')
                .collect::<String>()
                .to_ascii_lowercase();
            let token = token.trim_end_matches('.').to_string();

            if chars.get(i) == Some(&'(') {
                refs.functions.insert(token.strip_prefix("pg_catalog.").unwrap_or(&token).to_string());
            } else {
                let unqualified = token.strip_prefix("public.").unwrap_or(&token);
                if tables.contains(&unqualified) {
                    refs.tables.insert(unqualified.to_string());
                }
            }
            continue;
        }
        i += 1;
    }

    refs
}

/// Cycles in a table reference graph (edge: policy on `from` reads `to`).
/// Each cycle is reported once, starting from its smallest table name.
pub fn reference_cycles(edges: &BTreeMap<String, BTreeSet<String>>) -> Vec<Vec<String>> {
    fn visit(
        node: &str,
        edges: &BTreeMap<String, BTreeSet<String>>,
        stack: &mut Vec<String>,
        done: &mut BTreeSet<String>,
        found: &mut BTreeSet<Vec<String>>,
    ) {
        if let Some(pos) = stack.iter().position(|n| n == node) {
            let mut cycle = stack[pos..].to_vec();
            if let Some(min) = cycle.iter().enumerate().min_by(|a, b| a.1.cmp(b.1)).map(|(i, _)| i) {
                cycle.rotate_left(min);
            }
            found.insert(cycle);
            return;
        }
        if done.contains(node) {
            return;
        }
        stack.push(node.to_string());
        if let Some(next) = edges.get(node) {
            for to in next {
                visit(to, edges, stack, done, found);
            }
        }
        stack.pop();
        done.insert(node.to_string());
    }

    let mut found = BTreeSet::new();
    let mut done = BTreeSet::new();
    for node in edges.keys() {
        visit(node, edges, &mut Vec::new(), &mut done, &mut found);
    }
    found.into_iter().collect()
}
