//! vg-core: shared types, IDs, errors, configuration, and the status channel.
//!
//! This crate is the foundational dependency for all other vg-* crates,
//! providing type-safe identifiers, a unified error type, the video
//! processing domain enums, application configuration, and the per-owner
//! publish/subscribe channel that carries processing progress to clients.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod media;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, Result};
pub use ids::*;
pub use media::*;
