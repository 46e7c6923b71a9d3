//! Repository layer for database access.
//!
//! Every table is reached through a trait with a SQLx implementation so the
//! services above can be exercised against real SQLite in tests.

pub mod local_notification;
pub mod statistics;

pub use local_notification::*;
pub use statistics::*;
