use axum::{extract::Request, extract::State, middleware::Next, response::Response};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::ApiError;

/// Whether the last privilege guard run found the deployment safe. Scoped
/// routes refuse traffic while it is false.
#[derive(Debug, Clone)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn new(ready: bool) -> Self {
        Self(Arc::new(AtomicBool::new(ready)))
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, ready: bool) {
        let previous = self.0.swap(ready, Ordering::AcqRel);
        if previous != ready {
            tracing::warn!(ready, "readiness changed");
        }
    }
}

pub async fn readiness_middleware(
    State(readiness): State<Readiness>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !readiness.is_ready() {
        return Err(ApiError::service_unavailable("Privilege guard reported an unsafe configuration"));
    }
    Ok(next.run(request).await)
}
