//! Rust structs mapping to database tables.
//!
//! Each model implements `from_row` for constructing itself from a
//! `rusqlite::Row`. The column order is fixed by the `COLS` constant of the
//! matching query module.

use std::str::FromStr;

use serde::Serialize;
use uuid::Uuid;
use vg_core::{ProcessingState, SensitivityVerdict, UserId, VideoId};

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

/// Parse a UUID-based ID from a text column.
fn parse_id<T: From<Uuid>>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    let uuid = Uuid::parse_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(T::from(uuid))
}

/// Parse a text column through a `FromStr` impl with a `String` error.
fn parse_enum<T: FromStr<Err = String>>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    s.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn parse_tags(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Vec<String>> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

// ---------------------------------------------------------------------------
// VideoRecord
// ---------------------------------------------------------------------------

/// A persisted video record.
///
/// `version` is bumped by every pipeline write; stale writers are rejected by
/// the queries in [`crate::queries::videos`].
#[derive(Debug, Clone, Serialize)]
pub struct VideoRecord {
    pub id: VideoId,
    pub owner_id: UserId,
    pub organization: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub original_filename: String,
    pub blob_handle: String,
    pub byte_size: i64,
    pub mime_type: String,
    pub duration_secs: Option<f64>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub codec: Option<String>,
    pub bitrate: Option<i64>,
    pub has_audio: Option<bool>,
    pub thumbnail_handle: Option<String>,
    pub state: ProcessingState,
    pub progress: u8,
    pub error_message: Option<String>,
    pub verdict: SensitivityVerdict,
    pub verdict_overridden: bool,
    pub is_public: bool,
    pub deleted: bool,
    pub deleted_at: Option<String>,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl VideoRecord {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        let progress: i64 = row.get(18)?;
        Ok(Self {
            id: parse_id(row, 0)?,
            owner_id: parse_id(row, 1)?,
            organization: row.get(2)?,
            title: row.get(3)?,
            description: row.get(4)?,
            tags: parse_tags(row, 5)?,
            original_filename: row.get(6)?,
            blob_handle: row.get(7)?,
            byte_size: row.get(8)?,
            mime_type: row.get(9)?,
            duration_secs: row.get(10)?,
            width: row.get(11)?,
            height: row.get(12)?,
            codec: row.get(13)?,
            bitrate: row.get(14)?,
            has_audio: row.get(15)?,
            thumbnail_handle: row.get(16)?,
            state: parse_enum(row, 17)?,
            progress: progress.clamp(0, 100) as u8,
            error_message: row.get(19)?,
            verdict: parse_enum(row, 20)?,
            verdict_overridden: row.get(21)?,
            is_public: row.get(22)?,
            deleted: row.get(23)?,
            deleted_at: row.get(24)?,
            version: row.get(25)?,
            created_at: row.get(26)?,
            updated_at: row.get(27)?,
        })
    }

    /// Whether the owner, or a same-organization caller for public records,
    /// may see this record.
    pub fn visible_to(&self, caller: UserId, caller_org: Option<&str>) -> bool {
        if self.owner_id == caller {
            return true;
        }
        match (self.is_public, self.organization.as_deref(), caller_org) {
            (true, Some(org), Some(theirs)) => org == theirs,
            _ => false,
        }
    }
}
