//! Repository layer for database access.

pub mod task;

pub use task::*;
