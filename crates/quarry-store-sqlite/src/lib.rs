//! SQLite backend for the quarry time-series cache.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. Coverage records are JSON documents
//! edited in place with SQLite's JSON functions; rows live in one table per
//! (collection, year).

mod encode;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::SqliteStore;

#[cfg(test)]
mod tests;
