//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON and carries all
//! sub-configs for the server, credentials, uploads, external tools,
//! processing and moderation. Every section defaults sensibly so a completely
//! empty `{}` file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::Error;

/// Default maximum upload size: 500 MiB.
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 500 * 1024 * 1024;

/// Signing secrets shorter than this produce a startup warning.
pub const MIN_SECRET_BYTES: usize = 32;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub upload: UploadConfig,
    pub tools: ToolsConfig,
    pub processing: ProcessingConfig,
    pub moderation: ModerationConfig,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0; a random port will be assigned".into());
        }

        if self.auth.token_secret.trim().is_empty() {
            warnings.push(
                "auth.token_secret is not set; the server will refuse to start".into(),
            );
        } else if self.auth.token_secret.len() < MIN_SECRET_BYTES {
            warnings.push(format!(
                "auth.token_secret is shorter than {MIN_SECRET_BYTES} bytes; credentials are weakly signed"
            ));
        }

        if self.auth.stream_token_ttl_secs > 3600 {
            warnings.push(
                "auth.stream_token_ttl_secs exceeds one hour; stream tokens leak into logs".into(),
            );
        }

        if self.upload.max_bytes == 0 {
            warnings.push("upload.max_bytes is 0; every upload will be rejected".into());
        }

        if self.upload.allowed_mime_types.is_empty() {
            warnings.push("upload.allowed_mime_types is empty; every upload will be rejected".into());
        }

        if !(0.0..=1.0).contains(&self.moderation.noise_rate) {
            warnings.push(format!(
                "moderation.noise_rate {} is outside [0, 1]; it will be clamped",
                self.moderation.noise_rate
            ));
        }

        if self.processing.probe_timeout_secs == 0 {
            warnings.push("processing.probe_timeout_secs is 0; every probe will time out".into());
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// HTTP server and storage locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    /// Root directory of the local blob store (`videos/`, `thumbnails/`).
    pub blob_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            db_path: PathBuf::from("./data/vidgate.db"),
            blob_dir: PathBuf::from("./data/blobs"),
        }
    }
}

/// Credential signing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC secret used to sign and verify credentials.
    pub token_secret: String,
    /// Lifetime of general session credentials.
    pub session_ttl_hours: u64,
    /// Lifetime of narrowly-scoped streaming credentials.
    pub stream_token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret: String::new(),
            session_ttl_hours: 24,
            stream_token_ttl_secs: 300,
        }
    }
}

impl AuthConfig {
    /// The configured signing secret. There is no built-in fallback; an
    /// unset or blank secret is a validation error.
    pub fn signing_secret(&self) -> Result<&str> {
        if self.token_secret.trim().is_empty() {
            return Err(Error::Validation(
                "auth.token_secret must be set to a private value".into(),
            ));
        }
        Ok(&self.token_secret)
    }
}

/// Upload validation limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub max_bytes: u64,
    pub allowed_mime_types: Vec<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            allowed_mime_types: [
                "video/mp4",
                "video/webm",
                "video/quicktime",
                "video/x-matroska",
                "video/x-msvideo",
                "video/mpeg",
                "video/ogg",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl UploadConfig {
    /// Whether `mime` (ignoring parameters like `; codecs=...`) is allowed.
    pub fn allows(&self, mime: &str) -> bool {
        let base = mime.split(';').next().unwrap_or("").trim();
        self.allowed_mime_types
            .iter()
            .any(|m| m.eq_ignore_ascii_case(base))
    }
}

/// Paths to external CLI tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
}

/// Orchestrator tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Upper bound on a single ffprobe invocation.
    pub probe_timeout_secs: u64,
    /// Upper bound on a single thumbnail extraction.
    pub thumbnail_timeout_secs: u64,
    /// Thumbnail width in pixels (height keeps aspect ratio).
    pub thumbnail_width: u32,
    /// Seek position used when the duration is unknown.
    pub fallback_seek_secs: f64,
    /// Records stuck in `uploading`/`processing` longer than this are
    /// re-queued at startup.
    pub stale_after_secs: u64,
    /// Attempts made at classification before giving up.
    pub classify_attempts: u32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            probe_timeout_secs: 30,
            thumbnail_timeout_secs: 30,
            thumbnail_width: 320,
            fallback_seek_secs: 1.0,
            stale_after_secs: 900,
            classify_attempts: 3,
        }
    }
}

/// Sensitivity classifier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModerationConfig {
    /// Tokens whose presence in title/description flags a video.
    pub deny_list: Vec<String>,
    /// Probability of a non-deterministic flag for otherwise clean input.
    pub noise_rate: f64,
    /// Fixed RNG seed; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            deny_list: ["explicit", "nsfw", "gore", "violence", "adult"]
                .into_iter()
                .map(String::from)
                .collect(),
            noise_rate: 0.10,
            seed: None,
        }
    }
}
