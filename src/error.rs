// HTTP API Error Types
use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::{json, Value};

use crate::authz::error::{AuthzError, HierarchyError};
use crate::database::manager::DatabaseError;

/// HTTP API error with appropriate status codes and client-friendly messages
#[derive(Debug)]
pub enum ApiError {
    // 400 Bad Request
    BadRequest(String),

    // 401 Unauthorized
    Unauthorized(String),

    // 403 Forbidden
    Forbidden(String),

    // 404 Not Found
    NotFound(String),

    // 409 Conflict
    Conflict(String),

    // 500 Internal Server Error
    InternalServerError(String),

    // 503 Service Unavailable
    ServiceUnavailable(String),
}

impl ApiError {
    /// Get HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::BadRequest(_) => 400,
            ApiError::Unauthorized(_) => 401,
            ApiError::Forbidden(_) => 403,
            ApiError::NotFound(_) => 404,
            ApiError::Conflict(_) => 409,
            ApiError::InternalServerError(_) => 500,
            ApiError::ServiceUnavailable(_) => 503,
        }
    }

    /// Get client-safe error message
    pub fn message(&self) -> &str {
        match self {
            ApiError::BadRequest(msg)
            | ApiError::Unauthorized(msg)
            | ApiError::Forbidden(msg)
            | ApiError::NotFound(msg)
            | ApiError::Conflict(msg)
            | ApiError::InternalServerError(msg)
            | ApiError::ServiceUnavailable(msg) => msg,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "success": false,
            "error": self.message(),
            "code": self.error_code()
        })
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::InternalServerError(_) => "INTERNAL_SERVER_ERROR",
            ApiError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
        }
    }
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        ApiError::Unauthorized(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        ApiError::Forbidden(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        ApiError::Conflict(message.into())
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        ApiError::InternalServerError(message.into())
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        ApiError::ServiceUnavailable(message.into())
    }
}

impl From<AuthzError> for ApiError {
    fn from(err: AuthzError) -> Self {
        match err {
            // Hidden and absent organizations look the same to the client;
            // only the log tells them apart
            AuthzError::NotVisible(org) => {
                tracing::info!(%org, "organization outside bound scope");
                ApiError::not_found("Organization not found")
            }
            AuthzError::Hierarchy(HierarchyError::OrgNotFound(org)) => {
                tracing::debug!(%org, "organization does not exist");
                ApiError::not_found("Organization not found")
            }
            AuthzError::Hierarchy(HierarchyError::CycleDetected { .. }) => ApiError::conflict(err.to_string()),
            AuthzError::Hierarchy(
                HierarchyError::InvalidNesting { .. }
                | HierarchyError::DepthExceeded { .. }
                | HierarchyError::UnknownKind(_),
            ) => ApiError::bad_request(err.to_string()),
            AuthzError::Forbidden { .. } | AuthzError::InsufficientRole { .. } => ApiError::forbidden(err.to_string()),
            AuthzError::Timeout(_) => {
                tracing::warn!(error = %err, "unit of work timed out");
                ApiError::service_unavailable("Request processing timed out")
            }
            AuthzError::PrivilegeGuardFailure { .. } => {
                tracing::error!(error = %err, "privilege guard failure");
                ApiError::service_unavailable("Service is not accepting requests")
            }
            AuthzError::Database(sqlx_err) => {
                // Log the real error but return generic message
                tracing::error!("SQLx error: {}", sqlx_err);
                ApiError::internal_server_error("Database error occurred")
            }
            other => {
                tracing::error!(error = %other, "authorization failure");
                ApiError::internal_server_error("An error occurred while processing your request")
            }
        }
    }
}

impl From<DatabaseError> for ApiError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::Sqlx(sqlx::Error::PoolTimedOut) => {
                ApiError::service_unavailable("Database temporarily unavailable")
            }
            other => {
                tracing::error!("Database error: {}", other);
                ApiError::internal_server_error("Database error occurred")
            }
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for ApiError {}

// Automatic HTTP response conversion for Axum
impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.to_json())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::context::{Direction, Role};
    use crate::authz::hierarchy::OrganizationKind;
    use std::time::Duration;
    use uuid::Uuid;

    #[test]
    fn hidden_and_missing_organizations_both_map_to_404() {
        let hidden = ApiError::from(AuthzError::NotVisible(Uuid::new_v4()));
        let missing = ApiError::from(AuthzError::from(HierarchyError::OrgNotFound(Uuid::new_v4())));
        assert_eq!(hidden.status_code(), 404);
        assert_eq!(missing.status_code(), 404);
        assert_eq!(hidden.message(), missing.message());
    }

    #[test]
    fn hierarchy_errors_map_to_client_statuses() {
        let id = Uuid::new_v4();
        let cycle = HierarchyError::CycleDetected { org: id, new_parent: id };
        assert_eq!(ApiError::from(AuthzError::from(cycle)).status_code(), 409);

        let nesting = HierarchyError::InvalidNesting {
            parent: OrganizationKind::Local,
            child: OrganizationKind::Congress,
        };
        assert_eq!(ApiError::from(AuthzError::from(nesting)).status_code(), 400);

        let inconsistent = HierarchyError::InconsistentPath { org: id, detail: "gap".into() };
        assert_eq!(ApiError::from(AuthzError::from(inconsistent)).status_code(), 500);
    }

    #[test]
    fn role_failures_are_forbidden() {
        let err = AuthzError::InsufficientRole {
            required: Role::Admin,
            actual: Role::Member,
        };
        assert_eq!(ApiError::from(err).status_code(), 403);

        let err = AuthzError::Forbidden {
            role: Role::Officer,
            direction: Direction::Global,
        };
        assert_eq!(ApiError::from(err).error_code(), "FORBIDDEN");
    }

    #[test]
    fn timeouts_and_guard_failures_are_unavailable() {
        assert_eq!(ApiError::from(AuthzError::Timeout(Duration::from_secs(1))).status_code(), 503);
        assert_eq!(
            ApiError::from(AuthzError::PrivilegeGuardFailure { critical: 2 }).status_code(),
            503
        );
        assert_eq!(
            ApiError::from(AuthzError::ContextAlreadyBound(Uuid::new_v4())).status_code(),
            500
        );
    }

    #[test]
    fn json_body_carries_code() {
        let body = ApiError::conflict("cycle").to_json();
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "CONFLICT");
        assert_eq!(body["error"], "cycle");
    }
}
