//! vg-db: database access and persistence layer.
//!
//! This crate provides SQLite-backed storage with connection pooling,
//! embedded migrations, the [`models::VideoRecord`] model, and field-level
//! update queries used by the processing pipeline.

pub mod migrations;
pub mod models;
pub mod pool;
pub mod queries;
