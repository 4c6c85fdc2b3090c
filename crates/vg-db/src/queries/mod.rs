//! Database query modules.

pub mod videos;
