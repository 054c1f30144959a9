//! Marteau Core Library
//!
//! Shared functionality for Marteau components:
//! - Configuration resolution and hierarchy
//! - `SQLite` pool helpers for the shared job/node store
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
