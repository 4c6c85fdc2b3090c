//! Background processing: job queue, orchestrator, and startup recovery.
//!
//! Each queued video id is orchestrated by one task at a time; the worker loop
//! refuses a second concurrent orchestration for an id already in flight.
//! That single-writer rule is what lets field updates go without per-record
//! locks. The version check on every update in `vg_db::queries::videos`
//! enforces it at the storage layer.
//!
//! The orchestrator walks a record `uploading -> processing -> completed |
//! failed`, publishing a status event after every persisted step:
//!
//! | step               | progress |
//! |--------------------|----------|
//! | begin              | 10       |
//! | probed             | 30       |
//! | thumbnail attempted| 80       |
//! | completed          | 100      |
//!
//! When the prober is unavailable the record goes straight from 10 to 100
//! with no derived metadata. Classification runs in both paths, before any
//! prober work.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashSet;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use vg_av::{thumbnail_seek, MediaProbe};
use vg_core::events::StatusEvent;
use vg_core::{Error, Result, SensitivityVerdict, UserId, VideoId};
use vg_db::models::VideoRecord;
use vg_db::queries::videos::{self, ProbeFields};

use crate::blob::BlobNamespace;
use crate::classifier::classify_with_retry;
use crate::context::AppContext;

pub const PROGRESS_STARTED: u8 = 10;
pub const PROGRESS_PROBED: u8 = 30;
pub const PROGRESS_THUMBNAIL: u8 = 80;
pub const PROGRESS_DONE: u8 = 100;

// ---------------------------------------------------------------------------
// Job queue
// ---------------------------------------------------------------------------

/// Sending half of the in-process orchestration queue.
#[derive(Debug, Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<VideoId>,
}

/// Receiving half, consumed by [`run_processor`].
#[derive(Debug)]
pub struct JobReceiver {
    rx: mpsc::UnboundedReceiver<VideoId>,
}

impl JobQueue {
    pub fn new() -> (Self, JobReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, JobReceiver { rx })
    }

    /// Schedule `id` for orchestration.
    pub fn enqueue(&self, id: VideoId) -> Result<()> {
        self.tx
            .send(id)
            .map_err(|_| Error::Internal("processing queue is closed".into()))?;
        tracing::debug!(video_id = %id, "Queued for processing");
        Ok(())
    }
}

/// How an orchestration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// Completed without prober-derived metadata.
    Degraded,
    Failed,
    /// The record was missing or not in `uploading`.
    Skipped,
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

/// Start the background processor.
///
/// Runs until the cancellation token is triggered or every [`JobQueue`] is
/// dropped, then waits for in-flight orchestrations to reach a terminal
/// state.
pub async fn run_processor(ctx: AppContext, mut jobs: JobReceiver, cancel: CancellationToken) {
    tracing::info!("Video processor started");

    let in_flight: Arc<DashSet<VideoId>> = Arc::new(DashSet::new());
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            next = jobs.rx.recv() => {
                let Some(id) = next else { break };
                if !in_flight.insert(id) {
                    tracing::debug!(video_id = %id, "Already processing; ignoring duplicate");
                    continue;
                }
                let ctx = ctx.clone();
                let in_flight = in_flight.clone();
                tasks.spawn(async move {
                    run_job(&ctx, id).await;
                    in_flight.remove(&id);
                });
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!("Processing worker task failed: {e}");
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Video processor shutting down");
                break;
            }
        }
    }

    if !tasks.is_empty() {
        tracing::info!(count = tasks.len(), "Waiting for in-flight orchestrations");
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!("Processing worker task failed: {e}");
        }
    }

    tracing::info!("Video processor stopped");
}

/// Orchestrate one record inside a recovery boundary.
///
/// The orchestration runs in its own task so that a panic as well as an
/// error leaves the record `failed` rather than stranded in `processing`.
pub async fn run_job(ctx: &AppContext, id: VideoId) {
    let task_ctx = ctx.clone();
    let handle = tokio::spawn(async move { process_video(&task_ctx, id).await });

    let failure = match handle.await {
        Ok(Ok(outcome)) => {
            tracing::info!(video_id = %id, ?outcome, "Orchestration finished");
            None
        }
        Ok(Err(e)) => {
            tracing::error!(video_id = %id, error = %e, "Orchestration error");
            Some(e.to_string())
        }
        Err(join_err) if join_err.is_panic() => {
            tracing::error!(video_id = %id, "Orchestration panicked");
            Some("processing task panicked".to_string())
        }
        Err(join_err) => {
            tracing::error!(video_id = %id, "Orchestration aborted: {join_err}");
            Some("processing task was aborted".to_string())
        }
    };

    if let Some(message) = failure {
        if let Err(e) = mark_failed(ctx, id, &message) {
            tracing::error!(video_id = %id, "Could not record failure: {e}");
        }
    }
}

/// Last-resort transition to `failed`, publishing the failure if it landed.
fn mark_failed(ctx: &AppContext, id: VideoId, message: &str) -> Result<()> {
    let conn = vg_db::pool::get_conn(&ctx.db)?;
    let Some(record) = videos::get_video(&conn, id)? else {
        return Ok(());
    };
    if videos::fail_video(&conn, id, message)? {
        publish(ctx, record.owner_id, StatusEvent::failed(id, message));
    }
    Ok(())
}

fn publish(ctx: &AppContext, owner: UserId, event: StatusEvent) {
    let record_id = event.record_id;
    let progress = event.progress;
    let delivered = ctx.status.publish(owner, event);
    tracing::debug!(video_id = %record_id, progress, delivered, "Published status");
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drive a record from `uploading` to a terminal state.
///
/// A probe failure is handled here (the record becomes `failed`); a
/// thumbnail failure is logged and skipped. Any other error is returned for
/// [`run_job`] to record.
pub async fn process_video(ctx: &AppContext, id: VideoId) -> Result<Outcome> {
    let record = {
        let conn = vg_db::pool::get_conn(&ctx.db)?;
        videos::get_video(&conn, id)?
    };
    let Some(record) = record else {
        tracing::warn!(video_id = %id, "Queued video no longer exists");
        return Ok(Outcome::Skipped);
    };
    if record.state != vg_core::ProcessingState::Uploading {
        tracing::debug!(video_id = %id, state = %record.state, "Not awaiting processing; skipping");
        return Ok(Outcome::Skipped);
    }

    let owner = record.owner_id;
    let processing = &ctx.config.processing;

    // -- begin ----------------------------------------------------------------
    let mut version = {
        let conn = vg_db::pool::get_conn(&ctx.db)?;
        videos::begin_processing(&conn, id, record.version, PROGRESS_STARTED)?
    };
    publish(ctx, owner, StatusEvent::processing(id, PROGRESS_STARTED));
    tracing::info!(video_id = %id, owner = %owner, "Processing started");

    // -- classify --------------------------------------------------------------
    classify(ctx, &record).await?;

    // -- degraded path ---------------------------------------------------------
    if !ctx.prober.is_available() {
        tracing::warn!(video_id = %id, prober = ctx.prober.name(), "Prober unavailable; completing without metadata");
        let conn = vg_db::pool::get_conn(&ctx.db)?;
        videos::advance_progress(&conn, id, version, PROGRESS_DONE)?;
        publish(ctx, owner, StatusEvent::completed(id, None, None));
        return Ok(Outcome::Degraded);
    }

    let source = ctx
        .blobs
        .local_path(&record.blob_handle)
        .ok_or_else(|| Error::Storage(format!("blob {} has no local path", record.blob_handle)));

    // -- probe -----------------------------------------------------------------
    let probe = match source.as_ref() {
        Ok(path) => probe_with_timeout(ctx, path, processing.probe_timeout_secs).await,
        Err(e) => Err(Error::Probe(e.to_string())),
    };
    let probe = match probe {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(video_id = %id, error = %e, "Probe failed");
            let message = e.to_string();
            let conn = vg_db::pool::get_conn(&ctx.db)?;
            if videos::fail_video(&conn, id, &message)? {
                publish(ctx, owner, StatusEvent::failed(id, message));
            }
            return Ok(Outcome::Failed);
        }
    };
    tracing::info!(
        video_id = %id,
        duration = ?probe.duration_secs,
        width = ?probe.width,
        height = ?probe.height,
        codec = ?probe.codec,
        "Probed"
    );

    version = {
        let conn = vg_db::pool::get_conn(&ctx.db)?;
        let v = videos::set_probe_fields(&conn, id, version, &probe_fields(&probe))?;
        videos::advance_progress(&conn, id, v, PROGRESS_PROBED)?
    };
    publish(
        ctx,
        owner,
        StatusEvent::processing(id, PROGRESS_PROBED).with_duration(probe.duration_secs),
    );

    // -- thumbnail -------------------------------------------------------------
    let thumbnail = match source {
        Ok(path) => generate_thumbnail(ctx, id, &path, probe.duration_secs).await,
        Err(_) => None,
    };
    version = {
        let conn = vg_db::pool::get_conn(&ctx.db)?;
        let v = match thumbnail.as_deref() {
            Some(handle) => videos::set_thumbnail(&conn, id, version, handle)?,
            None => version,
        };
        videos::advance_progress(&conn, id, v, PROGRESS_THUMBNAIL)?
    };
    publish(
        ctx,
        owner,
        StatusEvent::processing(id, PROGRESS_THUMBNAIL)
            .with_duration(probe.duration_secs)
            .with_thumbnail(thumbnail.clone()),
    );

    // -- finalize --------------------------------------------------------------
    {
        let conn = vg_db::pool::get_conn(&ctx.db)?;
        videos::advance_progress(&conn, id, version, PROGRESS_DONE)?;
    }
    publish(
        ctx,
        owner,
        StatusEvent::completed(id, thumbnail, probe.duration_secs),
    );

    Ok(Outcome::Completed)
}

/// Classify the record's text and persist the verdict once. If the
/// classifier keeps failing the record is flagged for manual review.
async fn classify(ctx: &AppContext, record: &VideoRecord) -> Result<()> {
    let attempts = ctx.config.processing.classify_attempts;
    let verdict = match classify_with_retry(
        ctx.classifier.as_ref(),
        &record.title,
        record.description.as_deref(),
        attempts,
    )
    .await
    {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(video_id = %record.id, error = %e, "Classification failed; flagging for review");
            SensitivityVerdict::Flagged
        }
    };

    let conn = vg_db::pool::get_conn(&ctx.db)?;
    if videos::set_verdict_if_pending(&conn, record.id, verdict)? {
        tracing::info!(video_id = %record.id, verdict = %verdict, "Classified");
    }
    Ok(())
}

async fn probe_with_timeout(
    ctx: &AppContext,
    path: &Path,
    timeout_secs: u64,
) -> Result<MediaProbe> {
    let timeout = Duration::from_secs(timeout_secs);
    match tokio::time::timeout(timeout, ctx.prober.probe(path)).await {
        Ok(Ok(probe)) => Ok(probe),
        Ok(Err(Error::Probe(msg))) => Err(Error::Probe(msg)),
        Ok(Err(other)) => Err(Error::Probe(other.to_string())),
        Err(_) => Err(Error::Probe(format!("probe timed out after {timeout_secs}s"))),
    }
}

/// Render and store a thumbnail. Every failure is absorbed.
async fn generate_thumbnail(
    ctx: &AppContext,
    id: VideoId,
    source: &Path,
    duration_secs: Option<f64>,
) -> Option<String> {
    let processing = &ctx.config.processing;
    let seek = thumbnail_seek(duration_secs, processing.fallback_seek_secs);
    let timeout = Duration::from_secs(processing.thumbnail_timeout_secs);

    let rendered = tokio::time::timeout(
        timeout,
        ctx.prober.thumbnail(source, seek, processing.thumbnail_width),
    )
    .await;

    let bytes = match rendered {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            tracing::warn!(video_id = %id, seek, error = %e, "Thumbnail failed; continuing without one");
            return None;
        }
        Err(_) => {
            tracing::warn!(video_id = %id, seek, "Thumbnail timed out; continuing without one");
            return None;
        }
    };

    match ctx
        .blobs
        .save_bytes(BlobNamespace::Thumbnails, "jpg", &bytes)
        .await
    {
        Ok(blob) => {
            tracing::debug!(video_id = %id, handle = %blob.handle, "Thumbnail stored");
            Some(blob.handle)
        }
        Err(e) => {
            tracing::warn!(video_id = %id, error = %e, "Thumbnail could not be stored; continuing without one");
            None
        }
    }
}

fn probe_fields(probe: &MediaProbe) -> ProbeFields {
    ProbeFields {
        duration_secs: probe.duration_secs,
        width: probe.width.and_then(|w| i32::try_from(w).ok()),
        height: probe.height.and_then(|h| i32::try_from(h).ok()),
        codec: probe.codec.clone(),
        bitrate: probe.bitrate.and_then(|b| i64::try_from(b).ok()),
        has_audio: probe.has_audio,
    }
}

// ---------------------------------------------------------------------------
// Recovery sweep
// ---------------------------------------------------------------------------

/// Re-queue records left in `uploading`/`processing` by a previous process.
///
/// Only records untouched for `processing.stale_after_secs` are reset, so a
/// sweep never races an orchestration that is still making progress.
pub fn recover_stale(ctx: &AppContext) -> Result<usize> {
    let stale_after = i64::try_from(ctx.config.processing.stale_after_secs)
        .unwrap_or(i64::MAX)
        .min(i64::MAX / 1000);
    let cutoff = Utc::now()
        .checked_sub_signed(chrono::Duration::seconds(stale_after))
        .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
    let cutoff = videos::timestamp(cutoff);

    let conn = vg_db::pool::get_conn(&ctx.db)?;
    let stale = videos::list_stale(&conn, &cutoff)?;

    let mut requeued = 0;
    for record in stale {
        if videos::reset_for_reprocessing(&conn, record.id)?.is_some() {
            tracing::info!(video_id = %record.id, previous_state = %record.state, "Re-queueing stale video");
            ctx.jobs.enqueue(record.id)?;
            requeued += 1;
        }
    }

    if requeued > 0 {
        tracing::info!(count = requeued, "Recovery sweep re-queued stale videos");
    }
    Ok(requeued)
}
