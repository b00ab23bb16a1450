// handlers/mod.rs - HTTP handlers
//
// Public:    /health
// Protected: /api/* (JWT required; every data access runs inside a scoped unit of work)

pub mod context;
pub mod health;
pub mod organizations;

use serde::Deserialize;

use crate::authz::context::Direction;

/// `?direction=` on scoped routes; downward when omitted
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ScopeQuery {
    #[serde(default = "default_direction")]
    pub direction: Direction,
}

fn default_direction() -> Direction {
    Direction::Downward
}
