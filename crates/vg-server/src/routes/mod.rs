//! Route handlers for the HTTP API.

pub mod events;
pub mod health;
pub mod stream;
pub mod streaming_helpers;
pub mod videos;
