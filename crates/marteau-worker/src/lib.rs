//! Marteau worker library
//!
//! Execution side of the Marteau load-testing service:
//! - Stream redirection of child process output into per-job consoles
//! - Ordered shell steps and the `run_loadtest` pipeline
//! - Node reservation for distributed runs
//! - Job lifecycle records, results and retention
//! - `SQLite` storage shared by every worker process

pub mod console;
pub mod job;
pub mod lifecycle;
pub mod nodes;
pub mod redirector;
pub mod runner;
pub mod storage;
