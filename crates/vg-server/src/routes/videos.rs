//! Video ingestion, metadata, moderation, and credential routes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::io::StreamReader;
use vg_core::{Error, ProcessingState, SensitivityVerdict, UserId, VideoId};
use vg_db::models::VideoRecord;
use vg_db::queries::videos::{self, NewVideo};

use crate::blob::{BlobNamespace, BlobStore, StoredBlob};
use crate::context::AppContext;
use crate::error::AppError;
use crate::routes::stream::{authorize_stream, check_verdict, check_visibility};
use crate::token::Caller;

const MAX_TITLE_CHARS: usize = 200;
const MAX_TAGS: usize = 32;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadAccepted {
    pub record_id: VideoId,
    pub state: ProcessingState,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoResponse {
    pub id: VideoId,
    pub owner_id: UserId,
    pub organization: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub original_filename: String,
    pub byte_size: i64,
    pub mime_type: String,
    pub state: ProcessingState,
    pub progress: u8,
    pub error_message: Option<String>,
    pub verdict: SensitivityVerdict,
    pub verdict_overridden: bool,
    pub is_public: bool,
    pub duration_seconds: Option<f64>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub codec: Option<String>,
    pub bitrate: Option<i64>,
    pub has_audio: Option<bool>,
    pub thumbnail_handle: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl VideoResponse {
    pub fn from_record(r: VideoRecord) -> Self {
        Self {
            id: r.id,
            owner_id: r.owner_id,
            organization: r.organization,
            title: r.title,
            description: r.description,
            tags: r.tags,
            original_filename: r.original_filename,
            byte_size: r.byte_size,
            mime_type: r.mime_type,
            state: r.state,
            progress: r.progress,
            error_message: r.error_message,
            verdict: r.verdict,
            verdict_overridden: r.verdict_overridden,
            is_public: r.is_public,
            duration_seconds: r.duration_secs,
            width: r.width,
            height: r.height,
            codec: r.codec,
            bitrate: r.bitrate,
            has_audio: r.has_audio,
            thumbnail_handle: r.thumbnail_handle,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamTokenResponse {
    pub token: String,
    pub expires_in: u64,
    pub stream_url: String,
}

#[derive(Debug, Deserialize)]
pub struct ModerationRequest {
    pub verdict: SensitivityVerdict,
}

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

/// Tracks the stored blob of an upload in progress. Rejections call
/// [`BlobCleanup::discard`] before responding; dropping an armed guard
/// (client abort) removes the blob on a spawned task.
struct BlobCleanup {
    blobs: Arc<dyn BlobStore>,
    handle: Option<String>,
}

impl BlobCleanup {
    fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs, handle: None }
    }

    fn track(&mut self, handle: &str) {
        self.handle = Some(handle.to_string());
    }

    fn disarm(&mut self) {
        self.handle = None;
    }

    /// Delete the tracked blob now rather than on drop.
    async fn discard(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match self.blobs.delete(&handle).await {
            Ok(()) => tracing::debug!(handle = %handle, "Removed rejected upload"),
            Err(e) => tracing::warn!(handle = %handle, "Failed to remove rejected upload: {e}"),
        }
    }
}

impl Drop for BlobCleanup {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let blobs = self.blobs.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(e) = blobs.delete(&handle).await {
                        tracing::warn!(handle = %handle, "Failed to remove rejected upload: {e}");
                    } else {
                        tracing::debug!(handle = %handle, "Removed rejected upload");
                    }
                });
            }
            Err(_) => tracing::warn!(handle = %handle, "No runtime to remove rejected upload"),
        }
    }
}

#[derive(Debug, Default)]
struct UploadForm {
    title: Option<String>,
    description: Option<String>,
    tags: Vec<String>,
    is_public: bool,
    file: Option<UploadedFile>,
}

#[derive(Debug)]
struct UploadedFile {
    blob: StoredBlob,
    mime_type: String,
    original_filename: String,
}

fn multipart_error(e: impl std::fmt::Display) -> Error {
    Error::Validation(format!("malformed multipart body: {e}"))
}

/// Parse `tags` as a JSON array or a comma-separated list.
pub fn parse_tags(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    let items: Vec<String> = if raw.starts_with('[') {
        serde_json::from_str(raw).unwrap_or_default()
    } else {
        raw.split(',').map(String::from).collect()
    };

    let mut tags: Vec<String> = Vec::new();
    for tag in items {
        let tag = tag.trim().to_string();
        if !tag.is_empty() && !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags.truncate(MAX_TAGS);
    tags
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Validate the title; returns the trimmed value.
pub fn validate_title(title: Option<&str>) -> vg_core::Result<String> {
    let title = title.map(str::trim).unwrap_or("");
    if title.is_empty() {
        return Err(Error::Validation("title is required".into()));
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(Error::Validation(format!(
            "title must be at most {MAX_TITLE_CHARS} characters"
        )));
    }
    Ok(title.to_string())
}

async fn read_form(
    ctx: &AppContext,
    multipart: &mut Multipart,
    cleanup: &mut BlobCleanup,
) -> vg_core::Result<UploadForm> {
    let mut form = UploadForm::default();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                if form.file.is_some() {
                    return Err(Error::Validation("exactly one file is allowed".into()));
                }
                let mime_type = field
                    .content_type()
                    .map(|m| m.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
                    .unwrap_or_default();
                if !ctx.config.upload.allows(&mime_type) {
                    return Err(Error::Validation(format!(
                        "content type '{mime_type}' is not an accepted video format"
                    )));
                }
                let original_filename = field
                    .file_name()
                    .map(|f| f.rsplit(['/', '\\']).next().unwrap_or(f).to_string())
                    .filter(|f| !f.is_empty())
                    .unwrap_or_else(|| "upload".to_string());

                let client_failed = Arc::new(AtomicBool::new(false));
                let stream = field.map_err({
                    let client_failed = client_failed.clone();
                    move |e| {
                        client_failed.store(true, Ordering::Relaxed);
                        std::io::Error::other(e)
                    }
                });
                let mut reader = StreamReader::new(Box::pin(stream));
                let blob = ctx
                    .blobs
                    .save(
                        BlobNamespace::Videos,
                        vg_core::extension_for_mime(&mime_type),
                        &mut reader,
                        ctx.config.upload.max_bytes,
                    )
                    .await
                    .map_err(|e| {
                        if client_failed.load(Ordering::Relaxed) {
                            tracing::debug!("Upload body ended before the file was complete: {e}");
                            multipart_error("file upload was interrupted")
                        } else {
                            e
                        }
                    })?;
                cleanup.track(&blob.handle);
                tracing::debug!(handle = %blob.handle, size = blob.size, "Upload stored");

                form.file = Some(UploadedFile {
                    blob,
                    mime_type,
                    original_filename,
                });
            }
            "title" => form.title = Some(field.text().await.map_err(multipart_error)?),
            "description" => {
                let text = field.text().await.map_err(multipart_error)?;
                let text = text.trim();
                form.description = (!text.is_empty()).then(|| text.to_string());
            }
            "tags" => form.tags = parse_tags(&field.text().await.map_err(multipart_error)?),
            "public" | "isPublic" => {
                form.is_public = parse_bool(&field.text().await.map_err(multipart_error)?)
            }
            other => tracing::debug!(field = other, "Ignoring unknown upload field"),
        }
    }

    Ok(form)
}

/// Read and validate the form, then create the record. Any stored blob is
/// left tracked by `cleanup` for the caller to discard on error.
async fn accept_upload(
    ctx: &AppContext,
    caller: &Caller,
    multipart: &mut Multipart,
    cleanup: &mut BlobCleanup,
) -> vg_core::Result<VideoRecord> {
    let form = read_form(ctx, multipart, cleanup).await?;

    let title = validate_title(form.title.as_deref())?;
    let file = form
        .file
        .ok_or_else(|| Error::Validation("a video file is required".into()))?;
    let byte_size = i64::try_from(file.blob.size)
        .map_err(|_| Error::Validation("file is too large".into()))?;

    let conn = vg_db::pool::get_conn(&ctx.db)?;
    videos::create_video(
        &conn,
        &NewVideo {
            owner_id: caller.user_id,
            organization: caller.org.as_deref(),
            title: &title,
            description: form.description.as_deref(),
            tags: &form.tags,
            original_filename: &file.original_filename,
            blob_handle: &file.blob.handle,
            byte_size,
            mime_type: &file.mime_type,
            is_public: form.is_public,
        },
    )
}

/// POST /api/videos
///
/// Multipart fields: `file` (required), `title` (required), `description`,
/// `tags`, `public`. Returns as soon as the record exists; processing
/// continues in the background.
pub async fn upload_video(
    State(ctx): State<AppContext>,
    Extension(caller): Extension<Caller>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadAccepted>), AppError> {
    if !caller.role.can_upload() {
        return Err(Error::Forbidden(format!("role '{}' may not upload", caller.role)).into());
    }

    let mut cleanup = BlobCleanup::new(ctx.blobs.clone());
    let record = match accept_upload(&ctx, &caller, &mut multipart, &mut cleanup).await {
        Ok(record) => record,
        Err(e) => {
            cleanup.discard().await;
            return Err(e.into());
        }
    };
    cleanup.disarm();

    tracing::info!(
        video_id = %record.id,
        owner = %caller.user_id,
        size = record.byte_size,
        mime = %record.mime_type,
        "Upload accepted"
    );

    if let Err(e) = ctx.jobs.enqueue(record.id) {
        // The record stays in `uploading`; the startup sweep picks it up.
        tracing::error!(video_id = %record.id, "Could not schedule processing: {e}");
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadAccepted {
            record_id: record.id,
            state: record.state,
        }),
    ))
}

// ---------------------------------------------------------------------------
// Read / moderation / credentials
// ---------------------------------------------------------------------------

fn parse_video_id(id: &str) -> vg_core::Result<VideoId> {
    id.parse()
        .map_err(|_| Error::Validation("invalid video id".into()))
}

fn load(ctx: &AppContext, id: VideoId) -> vg_core::Result<VideoRecord> {
    let conn = vg_db::pool::get_conn(&ctx.db)?;
    videos::get_video(&conn, id)?.ok_or_else(|| Error::not_found("video", id))
}

/// GET /api/videos/{id}
pub async fn get_video(
    State(ctx): State<AppContext>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<VideoResponse>, AppError> {
    let id = parse_video_id(&id)?;
    let record = load(&ctx, id)?;
    check_visibility(&caller, &record)?;
    Ok(Json(VideoResponse::from_record(record)))
}

/// POST /api/videos/{id}/moderation
pub async fn moderate_video(
    State(ctx): State<AppContext>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    Json(body): Json<ModerationRequest>,
) -> Result<Json<VideoResponse>, AppError> {
    let id = parse_video_id(&id)?;
    if !caller.is_elevated() {
        return Err(Error::Forbidden("moderation requires elevated privilege".into()).into());
    }

    let record = {
        let conn = vg_db::pool::get_conn(&ctx.db)?;
        if !videos::override_verdict(&conn, id, body.verdict)? {
            return Err(Error::not_found("video", id).into());
        }
        videos::get_video(&conn, id)?.ok_or_else(|| Error::not_found("video", id))?
    };

    tracing::info!(
        video_id = %id,
        moderator = %caller.user_id,
        verdict = %body.verdict,
        "Verdict overridden"
    );
    Ok(Json(VideoResponse::from_record(record)))
}

/// POST /api/videos/{id}/stream-token
///
/// Mints a short-lived credential bound to one video for use in a media
/// element's `src`. Only issued when the caller could stream right now.
pub async fn issue_stream_token(
    State(ctx): State<AppContext>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<StreamTokenResponse>, AppError> {
    let id = parse_video_id(&id)?;
    let record = {
        let conn = vg_db::pool::get_conn(&ctx.db)?;
        videos::get_video(&conn, id)?
    };
    authorize_stream(&caller, id, record.as_ref())?;

    let ttl = ctx.config.auth.stream_token_ttl_secs;
    let token = ctx
        .tokens
        .issue_stream(&caller, id, i64::try_from(ttl).unwrap_or(i64::MAX / 2))?;

    Ok(Json(StreamTokenResponse {
        stream_url: format!("/api/videos/stream/{id}?token={token}"),
        token,
        expires_in: ttl,
    }))
}

/// GET /api/videos/{id}/thumbnail
pub async fn get_thumbnail(
    State(ctx): State<AppContext>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let id = parse_video_id(&id)?;
    let record = load(&ctx, id)?;
    check_visibility(&caller, &record)?;
    check_verdict(&caller, &record)?;

    let handle = record
        .thumbnail_handle
        .as_deref()
        .ok_or_else(|| Error::not_found("thumbnail", id))?;

    let blob = ctx.blobs.open(handle).await.map_err(|e| {
        tracing::error!(video_id = %id, handle, error = %e, "Thumbnail is unreadable");
        Error::Storage(format!("thumbnail for video {id} is unreadable"))
    })?;
    let mut reader = blob.reader;
    let capacity = usize::try_from(blob.len).unwrap_or(0);
    let mut bytes = Vec::with_capacity(capacity);
    tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut bytes)
        .await
        .map_err(|e| Error::Storage(format!("thumbnail read failed: {e}")))?;

    Ok((
        [
            (header::CONTENT_TYPE, "image/jpeg"),
            (header::CACHE_CONTROL, "private, max-age=3600"),
        ],
        bytes,
    )
        .into_response())
}
