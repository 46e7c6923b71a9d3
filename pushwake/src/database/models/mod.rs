//! Database models for pushwake.
//!
//! These models map directly to the database schema.

pub mod local_notification;
pub mod statistics;

pub use local_notification::*;
pub use statistics::*;
