//! Core data models for the guest photo collection service.
//!
//! These entities represent buckets, guest sessions, uploads and scan events.
//! They map cleanly to database tables via `sqlx::FromRow` and serialize
//! naturally as JSON via `serde`.

pub mod bucket;
pub mod project;
pub mod scan_event;
pub mod session;
pub mod upload;
