// handlers/context.rs - GET /api/authz/context
//
// Binds a context for the caller and reads it back from the session, so
// clients see exactly what the row policies will see.

use axum::{
    extract::{Query, State},
    Extension,
};

use crate::api::AppState;
use crate::authz::context::{BoundContext, Principal};
use crate::error::ApiError;
use crate::handlers::ScopeQuery;
use crate::middleware::{ApiResponse, ApiResult};

pub async fn current_context(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<ScopeQuery>,
) -> ApiResult<BoundContext> {
    let bound = state
        .executor
        .run(principal, query.direction, |mut scope| {
            Box::pin(async move { scope.bound_context().await })
        })
        .await
        .map_err(ApiError::from)?;

    Ok(ApiResponse::success(bound))
}
