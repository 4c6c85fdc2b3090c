//! Error-to-HTTP response conversion.
//!
//! Implements `IntoResponse` for [`vg_core::Error`] so that route handlers
//! can return `Result<T, AppError>` and use `?` on core results.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Seconds a client should wait before retrying a not-ready resource.
pub const NOT_READY_RETRY_AFTER_SECS: u32 = 5;

/// Wrapper so we can implement `IntoResponse` for an external type.
#[derive(Debug)]
pub struct AppError {
    inner: vg_core::Error,
    request_id: Option<String>,
}

impl AppError {
    pub fn new(inner: vg_core::Error) -> Self {
        Self {
            inner,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, id: String) -> Self {
        self.request_id = Some(id);
        self
    }

    pub fn inner(&self) -> &vg_core::Error {
        &self.inner
    }
}

impl From<vg_core::Error> for AppError {
    fn from(e: vg_core::Error) -> Self {
        Self::new(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.inner.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        // Server-side detail (paths, SQL, tool stderr) stays in the log.
        let message = if status.is_server_error() {
            tracing::error!(
                status = %status,
                error = %self.inner,
                request_id = self.request_id.as_deref().unwrap_or("-"),
                "Server error in API handler"
            );
            "An internal error occurred".to_string()
        } else {
            self.inner.to_string()
        };

        let body = json!({
            "error": message,
            "code": self.inner.code(),
            "request_id": self.request_id,
        });

        let mut response = (status, axum::Json(body)).into_response();
        if matches!(self.inner, vg_core::Error::NotReady(_)) {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(NOT_READY_RETRY_AFTER_SECS),
            );
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn not_found_produces_404() {
        let err = AppError::new(vg_core::Error::not_found("video", "abc"));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn unauthorized_and_forbidden_are_distinct() {
        let unauth = AppError::new(vg_core::Error::Unauthorized("bad token".into())).into_response();
        let forbid = AppError::new(vg_core::Error::Forbidden("not yours".into())).into_response();
        assert_eq!(unauth.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(forbid.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn not_ready_is_retryable() {
        let response = AppError::new(vg_core::Error::NotReady("processing".into())).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            &NOT_READY_RETRY_AFTER_SECS.to_string()
        );
    }

    #[tokio::test]
    async fn storage_error_is_generic_to_clients() {
        let response = AppError::new(vg_core::Error::Storage(
            "blob videos/x.mp4 unreadable at /srv/blobs/videos/x.mp4".into(),
        ))
        .with_request_id("req-1".into())
        .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = body_json(response).await;
        assert_eq!(body["code"], "storage_error");
        assert_eq!(body["request_id"], "req-1");
        assert!(!body["error"].as_str().unwrap().contains("/srv"));
    }

    #[tokio::test]
    async fn validation_message_is_kept() {
        let response =
            AppError::new(vg_core::Error::Validation("title is required".into())).into_response();
        let body = body_json(response).await;
        assert_eq!(body["code"], "validation_error");
        assert!(body["error"].as_str().unwrap().contains("title is required"));
    }
}
