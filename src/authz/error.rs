use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::authz::context::{Direction, Role};
use crate::authz::hierarchy::OrganizationKind;

/// Organization-tree errors raised by the hierarchy resolver and `OrgTree`
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HierarchyError {
    #[error("Organization not found: {0}")]
    OrgNotFound(Uuid),

    #[error("Cycle detected: cannot move {org} under {new_parent}")]
    CycleDetected { org: Uuid, new_parent: Uuid },

    #[error("Integrity error: materialized path of {org} is inconsistent: {detail}")]
    InconsistentPath { org: Uuid, detail: String },

    #[error("Hierarchy depth limit {max} exceeded at {org}")]
    DepthExceeded { org: Uuid, max: usize },

    #[error("Invalid nesting: {child} cannot be placed under {parent}")]
    InvalidNesting {
        parent: OrganizationKind,
        child: OrganizationKind,
    },

    #[error("Unknown organization kind: {0}")]
    UnknownKind(String),
}

impl HierarchyError {
    /// Integrity failures mean the stored tree cannot be trusted
    pub fn is_integrity(&self) -> bool {
        matches!(self, HierarchyError::InconsistentPath { .. })
    }
}

/// Errors from the authorization layer
#[derive(Debug, Error)]
pub enum AuthzError {
    #[error(transparent)]
    Hierarchy(#[from] HierarchyError),

    /// Organization exists but lies outside the bound visibility set
    #[error("Organization {0} is not visible in the current scope")]
    NotVisible(Uuid),

    #[error("Role {role} may not use {direction} scope")]
    Forbidden { role: Role, direction: Direction },

    #[error("Role {required} required, principal has {actual}")]
    InsufficientRole { required: Role, actual: Role },

    #[error("Context binding failed: {0}")]
    ContextBinding(String),

    #[error("Connection already carries authorization context {0}")]
    ContextAlreadyBound(Uuid),

    #[error("No authorization context is bound to this connection")]
    ContextNotBound,

    #[error("Failed to clear authorization context: {0}")]
    ContextClear(String),

    #[error("Unit of work finished with an aborted transaction")]
    TransactionAborted,

    #[error("Unit of work timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unit of work session was already released")]
    ScopeReleased,

    #[error("Privilege guard failed with {critical} critical finding(s)")]
    PrivilegeGuardFailure { critical: usize },

    #[error("Policy catalog rejected: {0}")]
    PolicyCatalog(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl AuthzError {
    /// True for the "absent" and "present but hidden" cases, which callers
    /// may render identically
    pub fn is_not_found_like(&self) -> bool {
        matches!(
            self,
            AuthzError::NotVisible(_) | AuthzError::Hierarchy(HierarchyError::OrgNotFound(_))
        )
    }
}
