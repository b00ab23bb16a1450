pub mod auth;
pub mod readiness;
pub mod response;

pub use auth::jwt_auth_middleware;
pub use readiness::{readiness_middleware, Readiness};
pub use response::{ApiResponse, ApiResult};
