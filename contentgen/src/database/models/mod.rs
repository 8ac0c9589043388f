//! Database models.
//!
//! These map one-to-one onto the schema; conversion into domain types
//! validates the enum columns.

pub mod task;

pub use task::*;
