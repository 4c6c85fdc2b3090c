//! # vg-av
//!
//! External media tool integration for vidgate.
//!
//! This crate provides:
//!
//! - **Tool discovery** ([`ToolRegistry`]) -- find and cache paths to ffmpeg
//!   and ffprobe once per process.
//! - **Command execution** ([`ToolCommand`]) -- async builder with timeout
//!   support for running external processes.
//! - **Probing** ([`MediaProber`], [`FfmpegProber`]) -- technical metadata
//!   extraction and single-frame thumbnails.

pub mod command;
pub mod probe;
pub mod tools;

// ---- Re-exports for convenience ----

pub use command::{ToolCommand, ToolOutput};
pub use probe::{thumbnail_seek, FfmpegProber, MediaProbe, MediaProber};
pub use tools::{ToolConfig, ToolInfo, ToolRegistry};
