use chrono::{SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};
use std::collections::BTreeSet;
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{NewOrganization, OrgNode, OrgTree, Organization, OrganizationKind, PathUpdate};
use crate::authz::error::{AuthzError, HierarchyError};
use crate::authz::predicates::AUTHZ_SCHEMA;

/// Transaction-scoped advisory lock key serializing tree mutations
pub const HIERARCHY_LOCK_KEY: i64 = 0x6f72_6773_636f_7065;

/// How `descendants_of` reads the subtree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescendantStrategy {
    /// `materialized_path @> ARRAY[org]`, served by the GIN index
    MaterializedPath,
    /// Depth-capped recursive walk over `parent_id`
    RecursiveClosure,
}

impl FromStr for DescendantStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "materialized_path" | "path" => Ok(DescendantStrategy::MaterializedPath),
            "recursive_closure" | "recursive" => Ok(DescendantStrategy::RecursiveClosure),
            other => Err(format!("unknown descendant strategy '{}'", other)),
        }
    }
}

/// Reads and mutates the persisted organization tree.
///
/// All methods take a connection so they run inside whatever transaction
/// the caller holds; mutations additionally take `HIERARCHY_LOCK_KEY`.
/// Lineage, subtree and existence reads go through the `authz` tree
/// helpers, which see the whole tree whatever context is bound. Row reads
/// and writes go through the scoped `organizations` policies.
#[derive(Debug, Clone)]
pub struct HierarchyResolver {
    max_depth: usize,
    strategy: DescendantStrategy,
}

const NODE_COLUMNS: &str = "id, parent_id, kind, materialized_path, depth";

fn node_from_row(row: &PgRow) -> Result<OrgNode, AuthzError> {
    let kind: String = row.try_get("kind")?;
    let depth: i32 = row.try_get("depth")?;
    Ok(OrgNode {
        id: row.try_get("id")?,
        parent_id: row.try_get("parent_id")?,
        kind: kind.parse()?,
        path: row.try_get("materialized_path")?,
        depth: depth.max(0) as usize,
    })
}

impl HierarchyResolver {
    pub fn new(max_depth: usize, strategy: DescendantStrategy) -> Self {
        Self { max_depth, strategy }
    }

    pub fn from_config() -> Self {
        let authz = &crate::config::CONFIG.authz;
        Self::new(authz.max_hierarchy_depth, authz.descendant_strategy)
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn strategy(&self) -> DescendantStrategy {
        self.strategy
    }

    pub async fn fetch(&self, conn: &mut PgConnection, org: Uuid) -> Result<Organization, AuthzError> {
        let sql = format!("SELECT {} FROM organizations WHERE id = $1", Organization::COLUMNS);
        let row = sqlx::query(&sql)
            .bind(org)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or(HierarchyError::OrgNotFound(org))?;
        Organization::from_row(&row)
    }

    pub async fn fetch_many(&self, conn: &mut PgConnection, ids: &[Uuid]) -> Result<Vec<Organization>, AuthzError> {
        let sql = format!(
            "SELECT {} FROM organizations WHERE id = ANY($1) ORDER BY depth, name",
            Organization::COLUMNS
        );
        let rows = sqlx::query(&sql).bind(ids).fetch_all(&mut *conn).await?;
        rows.iter().map(Organization::from_row).collect()
    }

    /// Whether `org` exists, whether or not the bound context can see it
    pub async fn exists(&self, conn: &mut PgConnection, org: Uuid) -> Result<bool, AuthzError> {
        let sql = format!("SELECT {}.org_exists($1)", AUTHZ_SCHEMA);
        Ok(sqlx::query_scalar(&sql).bind(org).fetch_one(&mut *conn).await?)
    }

    pub async fn ensure_exists(&self, conn: &mut PgConnection, org: Uuid) -> Result<(), AuthzError> {
        if self.exists(conn, org).await? {
            Ok(())
        } else {
            Err(HierarchyError::OrgNotFound(org).into())
        }
    }

    /// Rows named by the materialized path of `org`; `lock` takes them
    /// `FOR SHARE`
    async fn lineage_nodes(&self, conn: &mut PgConnection, org: Uuid, lock: bool) -> Result<Vec<OrgNode>, AuthzError> {
        let function = if lock { "lock_org_lineage" } else { "org_lineage" };
        let sql = format!("SELECT {} FROM {}.{}($1)", NODE_COLUMNS, AUTHZ_SCHEMA, function);
        let rows = sqlx::query(&sql).bind(org).fetch_all(&mut *conn).await?;
        rows.iter().map(node_from_row).collect()
    }

    /// Root-first lineage of `org`, ending with `org`, taken from the
    /// materialized path and checked against every ancestor's stored row.
    pub async fn ancestors_of(&self, conn: &mut PgConnection, org: Uuid) -> Result<Vec<Uuid>, AuthzError> {
        let nodes = self.lineage_nodes(conn, org, false).await?;
        let path = nodes
            .iter()
            .find(|n| n.id == org)
            .map(|n| n.path.clone())
            .ok_or(HierarchyError::OrgNotFound(org))?;

        if path.len() > self.max_depth + 1 {
            return Err(HierarchyError::DepthExceeded {
                org,
                max: self.max_depth,
            }
            .into());
        }

        let tree = OrgTree::from_nodes(nodes, self.max_depth);
        tree.check_lineage(org)?;

        debug!(%org, depth = path.len() - 1, "resolved ancestors");
        Ok(path)
    }

    /// `org` plus every descendant
    pub async fn descendants_of(&self, conn: &mut PgConnection, org: Uuid) -> Result<Vec<Uuid>, AuthzError> {
        let ids = match self.strategy {
            DescendantStrategy::MaterializedPath => self.descendants_by_path(conn, org).await?,
            DescendantStrategy::RecursiveClosure => self.descendants_by_closure(conn, org).await?,
        };
        debug!(%org, count = ids.len(), strategy = ?self.strategy, "resolved descendants");
        Ok(ids)
    }

    async fn descendants_by_path(&self, conn: &mut PgConnection, org: Uuid) -> Result<Vec<Uuid>, AuthzError> {
        let sql = format!("SELECT id, depth FROM {}.org_subtree($1) ORDER BY depth", AUTHZ_SCHEMA);
        let rows: Vec<(Uuid, i32)> = sqlx::query_as(&sql).bind(org).fetch_all(&mut *conn).await?;

        let Some(anchor_depth) = rows.iter().find(|(id, _)| *id == org).map(|(_, d)| *d) else {
            return Err(HierarchyError::OrgNotFound(org).into());
        };

        if rows
            .iter()
            .any(|(_, d)| (*d - anchor_depth) as i64 > self.max_depth as i64 || *d as i64 > self.max_depth as i64)
        {
            return Err(HierarchyError::DepthExceeded {
                org,
                max: self.max_depth,
            }
            .into());
        }

        Ok(rows.into_iter().map(|(id, _)| id).collect())
    }

    async fn descendants_by_closure(&self, conn: &mut PgConnection, org: Uuid) -> Result<Vec<Uuid>, AuthzError> {
        // One hop past the limit so overflow is detectable rather than truncated
        let sql = format!("SELECT id, hops FROM {}.org_closure($1, $2) ORDER BY hops", AUTHZ_SCHEMA);
        let rows: Vec<(Uuid, i32)> = sqlx::query_as(&sql)
            .bind(org)
            .bind(self.max_depth as i32 + 1)
            .fetch_all(&mut *conn)
            .await?;

        if rows.is_empty() {
            return Err(HierarchyError::OrgNotFound(org).into());
        }
        if rows.iter().any(|(_, hops)| *hops as usize > self.max_depth) {
            return Err(HierarchyError::DepthExceeded {
                org,
                max: self.max_depth,
            }
            .into());
        }

        let mut seen = BTreeSet::new();
        let mut out = Vec::with_capacity(rows.len());
        for (id, _) in rows {
            if !seen.insert(id) {
                return Err(HierarchyError::InconsistentPath {
                    org: id,
                    detail: "reached twice while walking parent links".to_string(),
                }
                .into());
            }
            out.push(id);
        }
        Ok(out)
    }

    /// Compare the path-containment answer with the parent-link closure.
    /// Returns the subtree size when both agree.
    pub async fn verify_subtree(&self, conn: &mut PgConnection, org: Uuid) -> Result<usize, AuthzError> {
        let by_path: BTreeSet<Uuid> = self.descendants_by_path(conn, org).await?.into_iter().collect();
        let by_links: BTreeSet<Uuid> = self.descendants_by_closure(conn, org).await?.into_iter().collect();

        if by_path != by_links {
            let only_path = by_path.difference(&by_links).count();
            let only_links = by_links.difference(&by_path).count();
            warn!(%org, only_path, only_links, "materialized path disagrees with parent links");
            return Err(HierarchyError::InconsistentPath {
                org,
                detail: format!(
                    "{} node(s) only reachable by path, {} only by parent link",
                    only_path, only_links
                ),
            }
            .into());
        }
        Ok(by_path.len())
    }

    /// Load every organization into an arena for auditing
    pub async fn load_tree(&self, conn: &mut PgConnection) -> Result<OrgTree, AuthzError> {
        let sql = format!("SELECT {} FROM organizations", NODE_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
        let nodes = rows.iter().map(node_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(OrgTree::from_nodes(nodes, self.max_depth))
    }

    async fn lock_tree(&self, conn: &mut PgConnection) -> Result<(), AuthzError> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(HIERARCHY_LOCK_KEY)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Reparent `org` under `new_parent`, rewriting path and depth for the
    /// whole subtree. Must run inside a transaction; concurrent moves queue
    /// on the tree lock.
    pub async fn move_subtree(
        &self,
        conn: &mut PgConnection,
        org: Uuid,
        new_parent: Uuid,
    ) -> Result<Vec<PathUpdate>, AuthzError> {
        self.lock_tree(conn).await?;

        if new_parent == org {
            return Err(HierarchyError::CycleDetected { org, new_parent }.into());
        }

        let subtree_sql = format!(
            "SELECT {} FROM organizations WHERE materialized_path @> ARRAY[$1]::uuid[] ORDER BY depth FOR UPDATE",
            NODE_COLUMNS
        );
        let subtree = sqlx::query(&subtree_sql)
            .bind(org)
            .fetch_all(&mut *conn)
            .await?
            .iter()
            .map(node_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        if !subtree.iter().any(|n| n.id == org) {
            return Err(self.missing_or_hidden(conn, org).await);
        }

        // Row policies may have hidden part of the subtree from the lock
        let whole = self.descendants_by_path(conn, org).await?;
        if whole.len() != subtree.len() {
            warn!(
                %org,
                locked = subtree.len(),
                total = whole.len(),
                "subtree is only partly inside the bound scope"
            );
            return Err(AuthzError::NotVisible(org));
        }

        // The new parent must be writable in scope; its ancestors need not be
        let parent: Option<Uuid> = sqlx::query_scalar("SELECT id FROM organizations WHERE id = $1 FOR SHARE")
            .bind(new_parent)
            .fetch_optional(&mut *conn)
            .await?;
        if parent.is_none() {
            return Err(self.missing_or_hidden(conn, new_parent).await);
        }

        let lineage = self.lineage_nodes(conn, new_parent, true).await?;
        let tree = OrgTree::from_nodes(lineage.into_iter().chain(subtree), self.max_depth);
        let updates = tree.plan_move(org, new_parent)?;

        let ids: Vec<Uuid> = updates.iter().map(|u| u.id).collect();
        let paths: Vec<String> = updates.iter().map(PathUpdate::path_literal).collect();
        let depths: Vec<i32> = updates.iter().map(|u| u.depth as i32).collect();

        let result = sqlx::query(
            r#"
            UPDATE organizations AS o
            SET parent_id = CASE WHEN o.id = $4 THEN $5 ELSE o.parent_id END,
                materialized_path = u.path::uuid[],
                depth = u.depth,
                updated_at = now()
            FROM UNNEST($1::uuid[], $2::text[], $3::int4[]) AS u(id, path, depth)
            WHERE o.id = u.id
            "#,
        )
        .bind(&ids)
        .bind(&paths)
        .bind(&depths)
        .bind(org)
        .bind(new_parent)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() != updates.len() as u64 {
            // Row policies filtered part of the subtree
            warn!(
                %org,
                planned = updates.len(),
                updated = result.rows_affected(),
                "reparent touched fewer rows than planned"
            );
            return Err(AuthzError::NotVisible(org));
        }

        info!(%org, %new_parent, nodes = updates.len(), "moved subtree");
        Ok(updates)
    }

    /// Insert a new organization, deriving path and depth from its parent
    pub async fn create_organization(
        &self,
        conn: &mut PgConnection,
        new: &NewOrganization,
    ) -> Result<Organization, AuthzError> {
        self.lock_tree(conn).await?;

        let id = Uuid::new_v4();
        let (path, depth) = match new.parent_id {
            Some(parent_id) => {
                let parent = self.fetch(conn, parent_id).await?;
                OrganizationKind::check_nesting(parent.kind, new.kind)?;
                let mut path = parent.materialized_path.clone();
                path.push(id);
                let depth = path.len() - 1;
                if depth > self.max_depth {
                    return Err(HierarchyError::DepthExceeded {
                        org: parent_id,
                        max: self.max_depth,
                    }
                    .into());
                }
                (path, depth as i32)
            }
            None => (vec![id], 0),
        };

        // No RETURNING: the new id only joins the visibility set on refresh,
        // so the select policy would reject reading the row back
        let now = Utc::now().trunc_subsecs(6);
        sqlx::query(
            "INSERT INTO organizations \
             (id, parent_id, name, slug, kind, materialized_path, depth, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)",
        )
        .bind(id)
        .bind(new.parent_id)
        .bind(&new.name)
        .bind(&new.slug)
        .bind(new.kind.as_str())
        .bind(&path)
        .bind(depth)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        info!(%id, kind = %new.kind, parent = ?new.parent_id, "created organization");
        Ok(Organization {
            id,
            parent_id: new.parent_id,
            name: new.name.clone(),
            slug: new.slug.clone(),
            kind: new.kind,
            materialized_path: path,
            depth,
            created_at: now,
            updated_at: now,
        })
    }

    /// Distinguish "absent" from "filtered by row policy" for locking reads
    async fn missing_or_hidden(&self, conn: &mut PgConnection, org: Uuid) -> AuthzError {
        match self.exists(conn, org).await {
            Ok(true) => AuthzError::NotVisible(org),
            Ok(false) => HierarchyError::OrgNotFound(org).into(),
            Err(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_strategies() {
        assert_eq!(
            "materialized_path".parse::<DescendantStrategy>().unwrap(),
            DescendantStrategy::MaterializedPath
        );
        assert_eq!(
            "recursive".parse::<DescendantStrategy>().unwrap(),
            DescendantStrategy::RecursiveClosure
        );
        assert!("bfs".parse::<DescendantStrategy>().is_err());
    }

    #[test]
    fn path_literal_casts_to_uuid_array() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let update = PathUpdate {
            id: b,
            parent_id: Some(a),
            path: vec![a, b],
            depth: 1,
        };
        assert_eq!(update.path_literal(), format!("{{{},{}}}", a, b));
    }
}
