//! Durable session and task records for the Grove engine.
//!
//! The store is the only component with persistence authority: session and
//! task records written here are the source of truth that survives a process
//! restart. All other orchestration state (context slots, agent handles) is
//! transient and rebuilt on resume.
//!
//! # Main types
//!
//! - [`SessionStore`] — Capability trait for durable record storage.
//! - [`FileSessionStore`] — JSON-file-per-record implementation.
//! - [`SessionRecord`] / [`TaskRecord`] — The persisted record shapes.

/// Persisted record types and status enums.
pub mod records;
/// The store capability trait and its file-backed implementation.
pub mod store;

pub use records::{SessionRecord, SessionStatus, TaskRecord, TaskState};
pub use store::{FileSessionStore, SessionStore};
