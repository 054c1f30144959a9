//! `SQLite` storage shared by every Marteau worker process.
//!
//! Provides persistence for running jobs, pid correlation, results,
//! consoles and the node registry.

mod db;
mod models;
mod queries_console;
mod queries_jobs;
mod queries_nodes;


pub use db::{Database, DatabaseError};
pub use models::*;
pub use queries_jobs::FinishJobParams;
