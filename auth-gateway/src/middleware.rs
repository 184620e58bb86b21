//! Axum middleware that authenticates every request it wraps.

use crate::authenticator::Authenticator;
use crate::error::AuthError;
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::debug;

/// Extract the credential from an `Authorization: Bearer <token>` header.
pub fn bearer_token(request: &Request) -> Option<&str> {
    let value = request.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Reject unauthenticated requests; on success the
/// [`Principal`](crate::Principal) is inserted into the request extensions.
pub async fn require_authentication(
    State(authenticator): State<Arc<dyn Authenticator>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(&request).map(str::to_owned) else {
        return AuthError::MissingCredential.into_response();
    };

    match authenticator.authenticate(&token).await {
        Ok(principal) => {
            debug!(subject = %principal.subject, method = %authenticator.method(), "Request authenticated");
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}
