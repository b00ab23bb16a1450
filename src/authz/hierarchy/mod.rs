//! Organization tree: kinds and nesting rules, the persisted record, the
//! in-memory arena used for checks and move planning, and the database
//! resolver.

pub mod resolver;
pub mod tree;

pub use resolver::{DescendantStrategy, HierarchyResolver};
pub use tree::{OrgNode, OrgTree, PathUpdate};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::Row;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::authz::error::{AuthzError, HierarchyError};

/// Organization type in the labour hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrganizationKind {
    Congress,
    Federation,
    Union,
    Local,
    Chapter,
    SectorCouncil,
}

impl OrganizationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrganizationKind::Congress => "congress",
            OrganizationKind::Federation => "federation",
            OrganizationKind::Union => "union",
            OrganizationKind::Local => "local",
            OrganizationKind::Chapter => "chapter",
            OrganizationKind::SectorCouncil => "sector_council",
        }
    }

    /// Kinds allowed directly beneath this one
    pub fn allowed_children(&self) -> &'static [OrganizationKind] {
        use OrganizationKind::*;
        match self {
            Congress => &[Federation, Union, SectorCouncil],
            Federation => &[Union, SectorCouncil],
            Union => &[Local, SectorCouncil],
            Local => &[Chapter],
            Chapter | SectorCouncil => &[],
        }
    }

    pub fn can_contain(&self, child: OrganizationKind) -> bool {
        self.allowed_children().contains(&child)
    }

    pub fn check_nesting(parent: OrganizationKind, child: OrganizationKind) -> Result<(), HierarchyError> {
        if parent.can_contain(child) {
            Ok(())
        } else {
            Err(HierarchyError::InvalidNesting { parent, child })
        }
    }
}

impl fmt::Display for OrganizationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrganizationKind {
    type Err = HierarchyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "congress" => Ok(OrganizationKind::Congress),
            "federation" => Ok(OrganizationKind::Federation),
            "union" => Ok(OrganizationKind::Union),
            "local" => Ok(OrganizationKind::Local),
            "chapter" => Ok(OrganizationKind::Chapter),
            "sector_council" => Ok(OrganizationKind::SectorCouncil),
            other => Err(HierarchyError::UnknownKind(other.to_string())),
        }
    }
}

/// Persisted organization row
#[derive(Debug, Clone, Serialize)]
pub struct Organization {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub name: String,
    pub slug: String,
    pub kind: OrganizationKind,
    pub materialized_path: Vec<Uuid>,
    pub depth: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Organization {
    pub const COLUMNS: &'static str =
        "id, parent_id, name, slug, kind, materialized_path, depth, created_at, updated_at";

    pub fn from_row(row: &PgRow) -> Result<Self, AuthzError> {
        let kind: String = row.try_get("kind")?;
        Ok(Self {
            id: row.try_get("id")?,
            parent_id: row.try_get("parent_id")?,
            name: row.try_get("name")?,
            slug: row.try_get("slug")?,
            kind: kind.parse()?,
            materialized_path: row.try_get("materialized_path")?,
            depth: row.try_get("depth")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub fn node(&self) -> OrgNode {
        OrgNode {
            id: self.id,
            parent_id: self.parent_id,
            kind: self.kind,
            path: self.materialized_path.clone(),
            depth: self.depth.max(0) as usize,
        }
    }
}

/// Input for creating an organization
#[derive(Debug, Clone, Deserialize)]
pub struct NewOrganization {
    pub name: String,
    pub slug: String,
    pub kind: OrganizationKind,
    pub parent_id: Option<Uuid>,
}
