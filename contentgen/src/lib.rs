//! contentgen library crate.
//!
//! Orchestrates long-running content-generation tasks: a SQLite task store,
//! a per-task log sink, a worker pool that drives pipeline stages with
//! cooperative cancellation, an HTTP API, and the store operations behind the
//! administrative force-cancel path.

pub mod api;
pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod logging;
pub mod orchestrator;

pub use error::{Error, Result};
