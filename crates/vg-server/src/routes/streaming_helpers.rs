//! Shared streaming helpers: range parsing, content-type selection, and
//! chunked blob serving via `ReaderStream`.

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use vg_core::Error;

use crate::blob::OpenBlob;

/// Read size for streamed bodies.
const STREAM_CHUNK_BYTES: usize = 64 * 1024;

/// A single syntactically valid byte-range spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `start-end` or open-ended `start-`.
    From { start: u64, end: Option<u64> },
    /// `-N`: the final N bytes.
    Suffix(u64),
}

/// What to send for a request against an asset of known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangePlan {
    Full,
    /// Inclusive byte offsets.
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

/// Parse a `Range: bytes=...` header value.
///
/// Returns `None` for anything other than exactly one well-formed range,
/// including multi-range requests.
pub fn parse_range_header(value: &str) -> Option<ByteRange> {
    let spec = value.trim().strip_prefix("bytes=")?.trim();
    if spec.contains(',') {
        return None;
    }
    let (start_str, end_str) = spec.split_once('-')?;
    let (start_str, end_str) = (start_str.trim(), end_str.trim());

    if start_str.is_empty() {
        return Some(ByteRange::Suffix(end_str.parse().ok()?));
    }

    let start: u64 = start_str.parse().ok()?;
    let end: Option<u64> = if end_str.is_empty() {
        None
    } else {
        Some(end_str.parse().ok()?)
    };
    if matches!(end, Some(end) if end < start) {
        return None;
    }

    Some(ByteRange::From { start, end })
}

/// Decide what to serve for an optional `Range` header against `size` bytes.
///
/// Unparseable or multiple ranges fall back to the whole asset.
pub fn plan_range(range_header: Option<&str>, size: u64) -> RangePlan {
    let Some(range) = range_header.and_then(parse_range_header) else {
        return RangePlan::Full;
    };
    if size == 0 {
        return RangePlan::Unsatisfiable;
    }
    let last = size - 1;

    match range {
        ByteRange::From { start, .. } if start >= size => RangePlan::Unsatisfiable,
        ByteRange::From { start, end } => RangePlan::Partial {
            start,
            end: end.unwrap_or(last).min(last),
        },
        ByteRange::Suffix(0) => RangePlan::Unsatisfiable,
        ByteRange::Suffix(n) => RangePlan::Partial {
            start: size.saturating_sub(n),
            end: last,
        },
    }
}

/// Guess the MIME type from a file extension.
pub fn guess_content_type(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "mpg" | "mpeg" => "video/mpeg",
        "ogv" => "video/ogg",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    }
}

/// Content type for a stored video: the recorded MIME type when it is a
/// `video/*` type, otherwise a guess from the original filename.
pub fn video_content_type(mime_type: &str, original_filename: &str) -> String {
    let base = mime_type.split(';').next().unwrap_or("").trim();
    if base.starts_with("video/") {
        base.to_string()
    } else {
        guess_content_type(original_filename).to_string()
    }
}

/// Serve an opened blob, honouring an optional `Range` header.
///
/// Reads are done in 64KB chunks so memory stays bounded regardless of
/// asset size.
pub async fn serve_blob(
    blob: OpenBlob,
    content_type: &str,
    range_header: Option<&str>,
) -> Result<Response, Error> {
    let OpenBlob { mut reader, len } = blob;

    match plan_range(range_header, len) {
        RangePlan::Unsatisfiable => Ok((
            StatusCode::RANGE_NOT_SATISFIABLE,
            [
                (header::CONTENT_RANGE, format!("bytes */{len}")),
                (header::ACCEPT_RANGES, "bytes".to_string()),
            ],
            Body::empty(),
        )
            .into_response()),
        RangePlan::Partial { start, end } => {
            let length = end - start + 1;
            reader
                .seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|e| Error::Storage(format!("seek to {start} failed: {e}")))?;

            // Wrap in a Take to limit reads to exactly `length` bytes.
            let limited = reader.take(length);
            let body = Body::from_stream(ReaderStream::with_capacity(limited, STREAM_CHUNK_BYTES));

            Ok((
                StatusCode::PARTIAL_CONTENT,
                [
                    (header::CONTENT_TYPE, content_type.to_string()),
                    (header::CONTENT_RANGE, format!("bytes {start}-{end}/{len}")),
                    (header::CONTENT_LENGTH, length.to_string()),
                    (header::ACCEPT_RANGES, "bytes".to_string()),
                ],
                body,
            )
                .into_response())
        }
        RangePlan::Full => {
            let body = Body::from_stream(ReaderStream::with_capacity(
                reader.take(len),
                STREAM_CHUNK_BYTES,
            ));

            Ok((
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, content_type.to_string()),
                    (header::CONTENT_LENGTH, len.to_string()),
                    (header::ACCEPT_RANGES, "bytes".to_string()),
                ],
                body,
            )
                .into_response())
        }
    }
}
