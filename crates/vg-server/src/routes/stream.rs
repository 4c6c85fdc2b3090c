//! Streaming gate and byte-range endpoint.
//!
//! `GET /api/videos/stream/{id}?token=...` sits outside the auth middleware:
//! media elements cannot attach an `Authorization` header, so the credential
//! rides in the query string. Either a session credential or a stream
//! credential bound to this video is accepted.

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap};
use axum::response::Response;
use serde::Deserialize;
use vg_core::{Error, ProcessingState, Result, SensitivityVerdict, VideoId};
use vg_db::models::VideoRecord;

use crate::context::AppContext;
use crate::error::AppError;
use crate::middleware::auth::bearer_token;
use crate::routes::streaming_helpers::{serve_blob, video_content_type};
use crate::token::{Caller, TokenScope};

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub token: Option<String>,
}

/// Ownership and visibility: the owner, any elevated caller, or a member of
/// the record's organization when the record is public.
pub fn check_visibility(caller: &Caller, record: &VideoRecord) -> Result<()> {
    if caller.is_elevated() || record.visible_to(caller.user_id, caller.org.as_deref()) {
        Ok(())
    } else {
        Err(Error::Forbidden("you do not have access to this video".into()))
    }
}

/// Flagged content is reserved for elevated callers, owners included.
pub fn check_verdict(caller: &Caller, record: &VideoRecord) -> Result<()> {
    if record.verdict == SensitivityVerdict::Flagged && !caller.is_elevated() {
        return Err(Error::Forbidden(
            "this video is held for moderation review".into(),
        ));
    }
    Ok(())
}

/// Decide whether `caller` may stream `record`.
///
/// Checks run in a fixed order and stop at the first failure: credential
/// scope, existence, visibility, readiness, then sensitivity.
pub fn authorize_stream<'a>(
    caller: &Caller,
    id: VideoId,
    record: Option<&'a VideoRecord>,
) -> Result<&'a VideoRecord> {
    if let TokenScope::Stream { video } = caller.scope {
        if video != id {
            return Err(Error::Unauthorized(
                "stream credential was issued for a different video".into(),
            ));
        }
    }

    let record = record.ok_or_else(|| Error::not_found("video", id))?;
    check_visibility(caller, record)?;

    if record.state != ProcessingState::Completed {
        return Err(Error::NotReady(format!(
            "video {id} is {} and not yet available",
            record.state
        )));
    }

    check_verdict(caller, record)?;
    Ok(record)
}

/// Resolve the caller from `?token=`, falling back to a bearer header.
fn stream_caller(ctx: &AppContext, query: &StreamQuery, headers: &HeaderMap) -> Result<Caller> {
    let token = query
        .token
        .as_deref()
        .filter(|t| !t.is_empty())
        .or_else(|| bearer_token(headers))
        .ok_or_else(|| Error::Unauthorized("a streaming credential is required".into()))?;
    Ok(Caller::from(ctx.tokens.verify(token)?))
}

/// GET /api/videos/stream/{id}
pub async fn stream_video(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> std::result::Result<Response, AppError> {
    let caller = stream_caller(&ctx, &query, &headers)?;

    let id: VideoId = id
        .parse()
        .map_err(|_| Error::Validation("invalid video id".into()))?;

    let record = {
        let conn = vg_db::pool::get_conn(&ctx.db)?;
        vg_db::queries::videos::get_video(&conn, id)?
    };
    let record = match authorize_stream(&caller, id, record.as_ref()) {
        Ok(record) => record,
        Err(e) => {
            tracing::debug!(video_id = %id, user_id = %caller.user_id, error = %e, "Stream refused");
            return Err(e.into());
        }
    };

    let blob = ctx.blobs.open(&record.blob_handle).await.map_err(|e| {
        tracing::error!(
            video_id = %id,
            handle = %record.blob_handle,
            error = %e,
            "Completed video has unreadable media"
        );
        Error::Storage(format!("media for video {id} is unreadable"))
    })?;

    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    let content_type = video_content_type(&record.mime_type, &record.original_filename);

    tracing::debug!(video_id = %id, user_id = %caller.user_id, range = ?range, "Streaming");
    Ok(serve_blob(blob, &content_type, range).await?)
}
