//! Database module for pingshard.
//!
//! Provides the document store abstraction, a SQLite implementation with
//! embedded migrations, and the document models.

mod document;
mod models;
mod store;
pub mod timefmt;

pub use document::*;
pub use models::*;
pub use store::*;
