//! Row-level authorization for the organization hierarchy.
//!
//! Data access goes through [`ScopedExecutor::run`], which binds an
//! [`AuthorizationContext`] into one pooled transaction, runs the caller's
//! work, and clears the context before the connection is released. Row
//! policies installed by [`PolicyCatalog`] do the actual filtering, and
//! [`PrivilegeGuard`] checks that nothing can bypass them.

pub mod binder;
pub mod context;
pub mod error;
pub mod executor;
pub mod guard;
pub mod hierarchy;
pub mod predicates;

pub use binder::{verify_released, ClearOutcome, ContextBinder};
pub use context::{AuthorizationContext, BoundContext, Direction, Principal, Role, VisibilitySet};
pub use error::{AuthzError, HierarchyError};
pub use executor::{PgScopeBackend, Scope, ScopeBackend, ScopedExecutor};
pub use guard::{Finding, FindingKind, GuardReport, PrivilegeGuard, Severity};
pub use hierarchy::{HierarchyResolver, NewOrganization, Organization, OrganizationKind};
pub use predicates::{PolicyCatalog, Predicate};
