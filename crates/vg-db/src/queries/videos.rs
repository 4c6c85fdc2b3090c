//! Video record operations.
//!
//! Pipeline writes are per-field `UPDATE`s guarded by the record's `version`
//! and by its state, so a stale or post-terminal writer touches zero rows and
//! gets [`Error::Conflict`] back. Every guarded write bumps `version` and
//! returns the new value for the caller's next write.
//!
//! Verdict writes are not versioned: the pipeline writes the verdict at most
//! once (guarded by `verdict = 'pending'`) and only an explicit moderation
//! override replaces it afterwards.

use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use vg_core::{Error, Result, SensitivityVerdict, UserId, VideoId};

use crate::models::VideoRecord;

const COLS: &str = "id, owner_id, organization, title, description, tags,
    original_filename, blob_handle, byte_size, mime_type, duration_secs, width,
    height, codec, bitrate, has_audio, thumbnail_handle, state, progress,
    error_message, verdict, verdict_overridden, is_public, deleted, deleted_at,
    version, created_at, updated_at";

/// Timestamps are fixed-width UTC so that string comparison orders them.
pub fn timestamp(at: chrono::DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn now() -> String {
    timestamp(Utc::now())
}

/// Fields supplied at upload-accept time.
#[derive(Debug, Clone)]
pub struct NewVideo<'a> {
    pub owner_id: UserId,
    pub organization: Option<&'a str>,
    pub title: &'a str,
    pub description: Option<&'a str>,
    pub tags: &'a [String],
    pub original_filename: &'a str,
    pub blob_handle: &'a str,
    pub byte_size: i64,
    pub mime_type: &'a str,
    pub is_public: bool,
}

/// Technical metadata written after a successful probe.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeFields {
    pub duration_secs: Option<f64>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub codec: Option<String>,
    pub bitrate: Option<i64>,
    pub has_audio: bool,
}

/// Map the result of a `RETURNING version` guarded update.
fn guarded(id: VideoId, result: rusqlite::Result<Option<i64>>) -> Result<i64> {
    match result {
        Ok(Some(v)) => Ok(v),
        Ok(None) => Err(Error::Conflict(format!(
            "video {id} was modified concurrently or is no longer in a writable state"
        ))),
        Err(e) => Err(Error::database(e.to_string())),
    }
}

/// Create a new record in state `uploading`.
pub fn create_video(conn: &Connection, new: &NewVideo<'_>) -> Result<VideoRecord> {
    let id = VideoId::new();
    let now = now();
    let tags = serde_json::to_string(new.tags).map_err(|e| Error::Internal(e.to_string()))?;

    conn.execute(
        "INSERT INTO videos (id, owner_id, organization, title, description, tags,
            original_filename, blob_handle, byte_size, mime_type, is_public,
            created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
        rusqlite::params![
            id.to_string(),
            new.owner_id.to_string(),
            new.organization,
            new.title,
            new.description,
            tags,
            new.original_filename,
            new.blob_handle,
            new.byte_size,
            new.mime_type,
            new.is_public,
            &now,
        ],
    )
    .map_err(|e| Error::database(e.to_string()))?;

    get_video(conn, id)?.ok_or_else(|| Error::not_found("video", id))
}

/// Get a non-deleted record by ID.
pub fn get_video(conn: &Connection, id: VideoId) -> Result<Option<VideoRecord>> {
    let q = format!("SELECT {COLS} FROM videos WHERE id = ?1 AND deleted = 0");
    let result = conn.query_row(&q, [id.to_string()], VideoRecord::from_row);
    match result {
        Ok(v) => Ok(Some(v)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(Error::database(e.to_string())),
    }
}

/// Move an `uploading` record into `processing` with an initial progress.
pub fn begin_processing(conn: &Connection, id: VideoId, version: i64, progress: u8) -> Result<i64> {
    let result = conn
        .query_row(
            "UPDATE videos
             SET state = 'processing', progress = ?1, error_message = NULL,
                 version = version + 1, updated_at = ?2
             WHERE id = ?3 AND version = ?4 AND state = 'uploading' AND deleted = 0
             RETURNING version",
            rusqlite::params![progress.min(100), now(), id.to_string(), version],
            |row| row.get(0),
        )
        .optional();
    guarded(id, result)
}

/// Raise progress on a `processing` record. Progress never decreases, and
/// reaching 100 completes the record.
pub fn advance_progress(conn: &Connection, id: VideoId, version: i64, progress: u8) -> Result<i64> {
    let progress = progress.min(100);
    let result = conn
        .query_row(
            "UPDATE videos
             SET progress = ?1,
                 state = CASE WHEN ?1 >= 100 THEN 'completed' ELSE 'processing' END,
                 version = version + 1, updated_at = ?2
             WHERE id = ?3 AND version = ?4 AND state = 'processing' AND progress <= ?1
             RETURNING version",
            rusqlite::params![progress, now(), id.to_string(), version],
            |row| row.get(0),
        )
        .optional();
    guarded(id, result)
}

/// Persist technical metadata from a successful probe.
pub fn set_probe_fields(
    conn: &Connection,
    id: VideoId,
    version: i64,
    fields: &ProbeFields,
) -> Result<i64> {
    let result = conn
        .query_row(
            "UPDATE videos
             SET duration_secs = ?1, width = ?2, height = ?3, codec = ?4,
                 bitrate = ?5, has_audio = ?6,
                 version = version + 1, updated_at = ?7
             WHERE id = ?8 AND version = ?9 AND state = 'processing'
             RETURNING version",
            rusqlite::params![
                fields.duration_secs,
                fields.width,
                fields.height,
                fields.codec,
                fields.bitrate,
                fields.has_audio,
                now(),
                id.to_string(),
                version,
            ],
            |row| row.get(0),
        )
        .optional();
    guarded(id, result)
}

/// Record the thumbnail blob handle.
pub fn set_thumbnail(conn: &Connection, id: VideoId, version: i64, handle: &str) -> Result<i64> {
    let result = conn
        .query_row(
            "UPDATE videos
             SET thumbnail_handle = ?1, version = version + 1, updated_at = ?2
             WHERE id = ?3 AND version = ?4 AND state = 'processing'
             RETURNING version",
            rusqlite::params![handle, now(), id.to_string(), version],
            |row| row.get(0),
        )
        .optional();
    guarded(id, result)
}

/// Mark a non-terminal record `failed` with progress 0.
///
/// Not version-checked: this is the orchestrator's last-resort write and
/// must land regardless of which step the failure interrupted. Returns
/// `false` if the record was already terminal (or missing).
pub fn fail_video(conn: &Connection, id: VideoId, message: &str) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE videos
             SET state = 'failed', progress = 0, error_message = ?1,
                 version = version + 1, updated_at = ?2
             WHERE id = ?3 AND state IN ('uploading', 'processing')",
            rusqlite::params![message, now(), id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Write the pipeline's verdict if none has been set yet.
pub fn set_verdict_if_pending(
    conn: &Connection,
    id: VideoId,
    verdict: SensitivityVerdict,
) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE videos SET verdict = ?1, updated_at = ?2
             WHERE id = ?3 AND verdict = 'pending'",
            rusqlite::params![verdict.as_str(), now(), id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Replace the verdict as an explicit moderation action.
pub fn override_verdict(
    conn: &Connection,
    id: VideoId,
    verdict: SensitivityVerdict,
) -> Result<bool> {
    if verdict == SensitivityVerdict::Pending {
        return Err(Error::Validation(
            "a moderation override must be 'safe' or 'flagged'".into(),
        ));
    }
    let n = conn
        .execute(
            "UPDATE videos SET verdict = ?1, verdict_overridden = 1, updated_at = ?2
             WHERE id = ?3 AND deleted = 0",
            rusqlite::params![verdict.as_str(), now(), id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Records stuck in `uploading`/`processing` since before `older_than`.
pub fn list_stale(conn: &Connection, older_than: &str) -> Result<Vec<VideoRecord>> {
    let q = format!(
        "SELECT {COLS} FROM videos
         WHERE state IN ('uploading', 'processing') AND updated_at < ?1 AND deleted = 0
         ORDER BY created_at ASC"
    );
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([older_than], VideoRecord::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

/// Put an interrupted record back to `uploading` so it can be re-queued.
/// Derived fields from the interrupted run are cleared.
pub fn reset_for_reprocessing(conn: &Connection, id: VideoId) -> Result<Option<i64>> {
    conn.query_row(
        "UPDATE videos
         SET state = 'uploading', progress = 0, error_message = NULL,
             duration_secs = NULL, width = NULL, height = NULL, codec = NULL,
             bitrate = NULL, has_audio = NULL, thumbnail_handle = NULL,
             version = version + 1, updated_at = ?1
         WHERE id = ?2 AND state IN ('uploading', 'processing') AND deleted = 0
         RETURNING version",
        rusqlite::params![now(), id.to_string()],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| Error::database(e.to_string()))
}

/// Soft-delete a record. The row and its blobs are kept.
pub fn soft_delete(conn: &Connection, id: VideoId) -> Result<bool> {
    let now = now();
    let n = conn
        .execute(
            "UPDATE videos SET deleted = 1, deleted_at = ?1, updated_at = ?1
             WHERE id = ?2 AND deleted = 0",
            rusqlite::params![now, id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}
