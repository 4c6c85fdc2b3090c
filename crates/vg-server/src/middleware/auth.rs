//! Authentication middleware.
//!
//! Validates `Authorization: Bearer <credential>` on protected routes and
//! injects the resulting [`Caller`] into request extensions. Stream-scoped
//! credentials are refused here; they are only honoured by the streaming
//! endpoint, which reads them from the query string.

use axum::extract::State;
use axum::http::{header, HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use vg_core::Error;

use crate::context::AppContext;
use crate::error::AppError;
use crate::middleware::request_id::RequestId;
use crate::token::{Caller, TokenScope, TokenSigner};

/// Extract the bearer credential from request headers.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Resolve a session-scoped caller from a raw credential.
pub fn session_caller(tokens: &TokenSigner, token: &str) -> vg_core::Result<Caller> {
    let caller = Caller::from(tokens.verify(token)?);
    match caller.scope {
        TokenScope::Session => Ok(caller),
        TokenScope::Stream { .. } => Err(Error::Unauthorized(
            "stream credentials are only valid for streaming".into(),
        )),
    }
}

/// Authentication middleware. Applied to protected routes only.
pub async fn auth_middleware(
    State(ctx): State<AppContext>,
    mut request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, Response> {
    let request_id = request.extensions().get::<RequestId>().cloned();

    let resolved = match bearer_token(request.headers()) {
        Some(token) => session_caller(&ctx.tokens, token),
        None => Err(Error::Unauthorized("authentication required".into())),
    };

    match resolved {
        Ok(caller) => {
            tracing::debug!(user_id = %caller.user_id, role = %caller.role, "Authenticated");
            request.extensions_mut().insert(caller);
            Ok(next.run(request).await)
        }
        Err(e) => {
            let mut err = AppError::new(e);
            if let Some(RequestId(id)) = request_id {
                err = err.with_request_id(id);
            }
            Err(err.into_response())
        }
    }
}
