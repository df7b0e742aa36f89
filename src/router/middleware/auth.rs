//! Admin subtree authentication.
//!
//! A shared-secret header check applied via
//! `axum::middleware::from_fn_with_state`. This checks only that the
//! configured shared header value was forwarded — actual caller
//! authentication happens upstream at the reverse proxy, and this check is
//! defense-in-depth that the proxy's allowlist is actually in front of the
//! request.

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::AppError;
use crate::router::AppState;

const HEADER_NAME: &str = "x-admin-token";

pub async fn require_admin_header(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = &state.config.admin_shared_header else {
        // No secret configured: rely entirely on the upstream IP allowlist.
        return next.run(request).await;
    };

    let provided = request.headers().get(HEADER_NAME).and_then(|h| h.to_str().ok());
    if provided != Some(expected.as_str()) {
        return AppError::InvalidRequest("missing or invalid admin header".into()).into_response();
    }

    next.run(request).await
}
