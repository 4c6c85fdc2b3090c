//! Domain enums for video processing state, sensitivity verdicts, and caller
//! roles.
//!
//! All enums serialize in lowercase (via `serde(rename_all = "lowercase")`),
//! implement `Display` manually, and parse back from the same strings so they
//! can be stored as TEXT columns.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// ProcessingState
// ---------------------------------------------------------------------------

/// Lifecycle state of a video record.
///
/// `uploading -> processing -> {completed | failed}`. Both `completed` and
/// `failed` are terminal for the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingState {
    Uploading,
    Processing,
    Completed,
    Failed,
}

impl ProcessingState {
    /// Whether the pipeline may no longer mutate a record in this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploading" => Ok(Self::Uploading),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown processing state: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// SensitivityVerdict
// ---------------------------------------------------------------------------

/// Outcome of content-sensitivity classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensitivityVerdict {
    Pending,
    Safe,
    Flagged,
}

impl SensitivityVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Safe => "safe",
            Self::Flagged => "flagged",
        }
    }
}

impl fmt::Display for SensitivityVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensitivityVerdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "safe" => Ok(Self::Safe),
            "flagged" => Ok(Self::Flagged),
            other => Err(format!("unknown sensitivity verdict: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

/// Privilege level carried by a caller's credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Editor,
    Moderator,
    Admin,
}

impl Role {
    /// Moderators and admins bypass ownership and sensitivity gating.
    pub fn has_elevated_privilege(self) -> bool {
        matches!(self, Self::Moderator | Self::Admin)
    }

    /// Viewers may watch but not upload.
    pub fn can_upload(self) -> bool {
        !matches!(self, Self::Viewer)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Editor => "editor",
            Self::Moderator => "moderator",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "viewer" => Ok(Self::Viewer),
            "editor" => Ok(Self::Editor),
            "moderator" => Ok(Self::Moderator),
            "admin" => Ok(Self::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Container helpers
// ---------------------------------------------------------------------------

/// Map a declared video MIME type to the file extension used for storage.
pub fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "video/quicktime" => "mov",
        "video/x-matroska" => "mkv",
        "video/x-msvideo" => "avi",
        "video/mpeg" => "mpeg",
        "video/ogg" => "ogv",
        _ => "bin",
    }
}
