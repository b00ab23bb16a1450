use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::authz::error::AuthzError;

/// Session variables read by the `authz.*` predicate helpers.
/// Order matters: `SESSION_KEYS` and `AuthorizationContext::session_values` line up.
pub mod keys {
    pub const USER_ID: &str = "app.current_user_id";
    pub const ORGANIZATION_ID: &str = "app.current_organization_id";
    pub const ROLE: &str = "app.current_role";
    pub const ROLE_RANK: &str = "app.current_role_rank";
    pub const VISIBLE_ORG_IDS: &str = "app.visible_org_ids";
    pub const GLOBAL_SCOPE: &str = "app.global_scope";
    pub const CONTEXT_TOKEN: &str = "app.context_token";
}

pub const SESSION_KEYS: [&str; 7] = [
    keys::USER_ID,
    keys::ORGANIZATION_ID,
    keys::ROLE,
    keys::ROLE_RANK,
    keys::VISIBLE_ORG_IDS,
    keys::GLOBAL_SCOPE,
    keys::CONTEXT_TOKEN,
];

/// Ordered privilege level of a principal
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum Role {
    Member = 0,
    Steward = 1,
    Officer = 2,
    Admin = 3,
    SystemAdmin = 4,
}

impl Role {
    /// Map a raw role claim onto the ordered role set.
    /// Legacy names collapse (`super_admin` -> admin, `guest` -> member) and
    /// anything unrecognised falls back to member.
    pub fn normalize(raw: &str) -> Role {
        match raw.trim().to_ascii_lowercase().as_str() {
            "system_admin" => Role::SystemAdmin,
            "admin" | "super_admin" => Role::Admin,
            "officer" => Role::Officer,
            "steward" => Role::Steward,
            _ => Role::Member,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Member => "member",
            Role::Steward => "steward",
            Role::Officer => "officer",
            Role::Admin => "admin",
            Role::SystemAdmin => "system_admin",
        }
    }

    pub fn rank(&self) -> i32 {
        *self as i32
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which way the visibility set extends from the principal's organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Self plus every descendant
    Downward,
    /// Ancestors plus self, for compliance roll-ups
    Upward,
    /// Self only
    Exact,
    /// Every organization; explicit opt-in for system administrators
    Global,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Downward => "downward",
            Direction::Upward => "upward",
            Direction::Exact => "exact",
            Direction::Global => "global",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "down" | "downward" => Ok(Direction::Downward),
            "up" | "upward" => Ok(Direction::Upward),
            "exact" | "self" => Ok(Direction::Exact),
            "global" => Ok(Direction::Global),
            other => Err(format!("unknown direction '{}'", other)),
        }
    }
}

/// The authenticated actor, as handed over by request middleware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub role: Role,
}

impl Principal {
    pub fn new(user_id: Uuid, organization_id: Uuid, role: Role) -> Self {
        Self {
            user_id,
            organization_id,
            role,
        }
    }
}

/// Organization ids a context may access. Never empty: the anchor
/// organization is always a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VisibilitySet {
    orgs: BTreeSet<Uuid>,
}

impl VisibilitySet {
    pub fn new(anchor: Uuid, ids: impl IntoIterator<Item = Uuid>) -> Self {
        let mut orgs: BTreeSet<Uuid> = ids.into_iter().collect();
        orgs.insert(anchor);
        Self { orgs }
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.orgs.contains(id)
    }

    pub fn len(&self) -> usize {
        self.orgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orgs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Uuid> {
        self.orgs.iter()
    }

    /// Postgres array literal, castable with `::uuid[]`
    pub fn to_pg_array(&self) -> String {
        let body: Vec<String> = self.orgs.iter().map(Uuid::to_string).collect();
        format!("{{{}}}", body.join(","))
    }

    pub fn parse_pg_array(raw: &str) -> Result<BTreeSet<Uuid>, AuthzError> {
        let inner = raw
            .trim()
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
            .ok_or_else(|| AuthzError::ContextBinding(format!("malformed visibility array: {}", raw)))?;
        inner
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| {
                Uuid::parse_str(s.trim().trim_matches('"'))
                    .map_err(|e| AuthzError::ContextBinding(format!("bad visibility id '{}': {}", s, e)))
            })
            .collect()
    }
}

/// Request-scoped authorization state bound into one connection
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationContext {
    /// Identifies this binding; a connection carrying a token is `Bound`
    pub token: Uuid,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub role: Role,
    pub direction: Direction,
    pub visible: VisibilitySet,
    pub global: bool,
}

impl AuthorizationContext {
    pub fn new(principal: &Principal, direction: Direction, visible: VisibilitySet) -> Self {
        Self {
            token: Uuid::new_v4(),
            user_id: principal.user_id,
            organization_id: principal.organization_id,
            role: principal.role,
            direction,
            visible,
            global: direction == Direction::Global,
        }
    }

    pub fn principal(&self) -> Principal {
        Principal::new(self.user_id, self.organization_id, self.role)
    }

    pub fn can_see(&self, org: &Uuid) -> bool {
        self.global || self.visible.contains(org)
    }

    pub fn require_visible(&self, org: Uuid) -> Result<(), AuthzError> {
        if self.can_see(&org) {
            Ok(())
        } else {
            Err(AuthzError::NotVisible(org))
        }
    }

    pub fn require_role(&self, required: Role) -> Result<(), AuthzError> {
        if self.role >= required {
            Ok(())
        } else {
            Err(AuthzError::InsufficientRole {
                required,
                actual: self.role,
            })
        }
    }

    /// Values for `SESSION_KEYS`, in the same order
    pub fn session_values(&self) -> [String; 7] {
        [
            self.user_id.to_string(),
            self.organization_id.to_string(),
            self.role.as_str().to_string(),
            self.role.rank().to_string(),
            self.visible.to_pg_array(),
            if self.global { "on".to_string() } else { "off".to_string() },
            self.token.to_string(),
        ]
    }
}

/// A context as read back from session state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoundContext {
    pub token: Uuid,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub role: Role,
    pub visible_organization_ids: BTreeSet<Uuid>,
    pub global: bool,
}

impl BoundContext {
    /// Parse raw `current_setting` values (ordered like `SESSION_KEYS`).
    /// An empty or missing token means nothing is bound.
    pub fn from_settings(values: &[Option<String>; 7]) -> Result<Option<Self>, AuthzError> {
        let get = |i: usize| values[i].as_deref().map(str::trim).filter(|v| !v.is_empty());

        let Some(token) = get(6) else {
            return Ok(None);
        };

        let parse_uuid = |i: usize| -> Result<Uuid, AuthzError> {
            let raw = get(i).ok_or_else(|| {
                AuthzError::ContextBinding(format!("{} missing while a context is bound", SESSION_KEYS[i]))
            })?;
            Uuid::parse_str(raw)
                .map_err(|e| AuthzError::ContextBinding(format!("{}: {}", SESSION_KEYS[i], e)))
        };

        Ok(Some(Self {
            token: Uuid::parse_str(token)
                .map_err(|e| AuthzError::ContextBinding(format!("context token: {}", e)))?,
            user_id: parse_uuid(0)?,
            organization_id: parse_uuid(1)?,
            role: Role::normalize(get(2).unwrap_or_default()),
            visible_organization_ids: match get(4) {
                Some(raw) => VisibilitySet::parse_pg_array(raw)?,
                None => BTreeSet::new(),
            },
            global: get(5) == Some("on"),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_legacy_roles() {
        assert_eq!(Role::normalize("super_admin"), Role::Admin);
        assert_eq!(Role::normalize("guest"), Role::Member);
        assert_eq!(Role::normalize("Officer"), Role::Officer);
        assert_eq!(Role::normalize("steward"), Role::Steward);
        assert_eq!(Role::normalize(""), Role::Member);
        assert_eq!(Role::normalize("root"), Role::Member);
        assert_eq!(Role::normalize("system_admin"), Role::SystemAdmin);
    }

    #[test]
    fn roles_are_ordered() {
        assert!(Role::Member < Role::Steward);
        assert!(Role::Officer < Role::Admin);
        assert!(Role::Admin < Role::SystemAdmin);
        assert_eq!(Role::Admin.rank(), 3);
    }

    #[test]
    fn parses_directions() {
        assert_eq!("down".parse::<Direction>().unwrap(), Direction::Downward);
        assert_eq!("Upward".parse::<Direction>().unwrap(), Direction::Upward);
        assert_eq!("exact".parse::<Direction>().unwrap(), Direction::Exact);
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn visibility_always_contains_anchor() {
        let anchor = Uuid::new_v4();
        let set = VisibilitySet::new(anchor, Vec::new());
        assert_eq!(set.len(), 1);
        assert!(set.contains(&anchor));
    }

    #[test]
    fn visibility_array_parses_back() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let set = VisibilitySet::new(a, vec![b, a]);
        let literal = set.to_pg_array();
        assert!(literal.starts_with('{') && literal.ends_with('}'));
        let parsed = VisibilitySet::parse_pg_array(&literal).unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parsed.contains(&a) && parsed.contains(&b));
        assert!(VisibilitySet::parse_pg_array("not-an-array").is_err());
    }

    #[test]
    fn bound_context_reads_back_settings() {
        let principal = Principal::new(Uuid::new_v4(), Uuid::new_v4(), Role::Officer);
        let ctx = AuthorizationContext::new(
            &principal,
            Direction::Downward,
            VisibilitySet::new(principal.organization_id, vec![Uuid::new_v4()]),
        );
        let raw = ctx.session_values().map(Some);
        let bound = BoundContext::from_settings(&raw).unwrap().unwrap();
        assert_eq!(bound.token, ctx.token);
        assert_eq!(bound.user_id, principal.user_id);
        assert_eq!(bound.role, Role::Officer);
        assert_eq!(bound.visible_organization_ids.len(), 2);
        assert!(!bound.global);
    }

    #[test]
    fn empty_token_means_unbound() {
        let cleared: [Option<String>; 7] = std::array::from_fn(|_| Some(String::new()));
        assert!(BoundContext::from_settings(&cleared).unwrap().is_none());
        let unset: [Option<String>; 7] = std::array::from_fn(|_| None);
        assert!(BoundContext::from_settings(&unset).unwrap().is_none());
    }

    #[test]
    fn global_flag_only_for_global_direction() {
        let principal = Principal::new(Uuid::new_v4(), Uuid::new_v4(), Role::SystemAdmin);
        let set = VisibilitySet::new(principal.organization_id, Vec::new());
        let down = AuthorizationContext::new(&principal, Direction::Downward, set.clone());
        assert!(!down.global);
        assert!(!down.can_see(&Uuid::new_v4()));
        let global = AuthorizationContext::new(&principal, Direction::Global, set);
        assert!(global.global);
        assert!(global.can_see(&Uuid::new_v4()));
    }
}
