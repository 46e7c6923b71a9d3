//! pushwake: reliable deferred execution for a push SDK.
//!
//! Local notifications scheduled for a future time and push engagement
//! statistics are persisted in SQLite, re-armed after restarts and held back
//! by a readiness gate until the SDK has finished initializing.

pub mod alarm;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod notification;
pub mod readiness;
pub mod services;
pub mod statistics;

pub use error::{Error, Result};
