//! Core data models for the storage engine.
//!
//! `StorageObject` maps onto the `storage_objects` table through
//! `StorageObjectRow` (`sqlx::FromRow`) and serializes as JSON via `serde`.

pub mod metrics;
pub mod object;
