//! Server-Sent Events (SSE) status endpoint.
//!
//! `GET /api/status/events?token=...` binds one [`StatusConnection`] per
//! client. The owner subscription is requested while the connection is still
//! handshaking and flushed once the response stream is first polled, so the
//! earliest status update of an upload started in parallel is not lost. No
//! history is replayed; clients re-fetch `GET /api/videos/{id}` on connect.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use serde::Deserialize;
use tokio::sync::mpsc;
use vg_core::events::{ConnectionSubscription, StatusConnection, STATUS_EVENT_NAME};
use vg_core::Error;

use crate::context::AppContext;
use crate::error::AppError;
use crate::middleware::auth::{bearer_token, session_caller};

const HEARTBEAT_SECS: u64 = 15;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Session credential; `EventSource` cannot set headers.
    pub token: Option<String>,
}

/// Tears the subscription down when the client goes away.
struct ConnectionGuard {
    subscription: ConnectionSubscription,
    connection: Arc<StatusConnection>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
        self.connection.mark_disconnected();
        tracing::debug!("Status stream closed");
    }
}

/// GET /api/status/events -- SSE stream of the caller's status updates.
pub async fn status_events(
    State(ctx): State<AppContext>,
    Query(params): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, AppError> {
    let token = params
        .token
        .as_deref()
        .filter(|t| !t.is_empty())
        .or_else(|| bearer_token(&headers))
        .ok_or_else(|| Error::Unauthorized("a session credential is required".into()))?;
    let caller = session_caller(&ctx.tokens, token)?;
    let owner = caller.user_id;

    let connection = StatusConnection::new(ctx.status.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = connection.subscribe(owner, tx);
    let shutdown = ctx.shutdown.clone();

    let stream = async_stream::stream! {
        let guard = ConnectionGuard { subscription, connection };
        let flushed = guard.connection.mark_ready();
        tracing::debug!(owner = %owner, flushed, "Status stream ready");

        yield Ok(Event::default()
            .event("ready")
            .data(format!(r#"{{"ownerId":"{owner}"}}"#)));

        let mut heartbeat = tokio::time::interval(Duration::from_secs(HEARTBEAT_SECS));
        heartbeat.tick().await;

        loop {
            tokio::select! {
                next = rx.recv() => {
                    let Some(event) = next else { break };
                    match serde_json::to_string(&event) {
                        Ok(data) => yield Ok(Event::default().event(STATUS_EVENT_NAME).data(data)),
                        Err(e) => tracing::warn!("Unserializable status event: {e}"),
                    }
                }
                _ = heartbeat.tick() => {
                    yield Ok(Event::default()
                        .event("heartbeat")
                        .data(r#"{"type":"heartbeat"}"#));
                }
                _ = shutdown.cancelled() => break,
            }
        }

        drop(guard);
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(HEARTBEAT_SECS))
            .text("ping"),
    ))
}
