//! Coverage tracking and incremental fetch for a financial time-series cache.
//!
//! Storage backends implement [`store::DocumentStore`]; data sources
//! implement [`feeder::Feeder`]. [`collection::DynamicCollection`] ties the
//! two together. This crate has no database dependency of its own beyond the
//! in-process [`memory::MemoryStore`].

#![allow(async_fn_in_trait)]

pub mod audit;
pub mod calendar;
pub mod collection;
pub mod config;
pub mod coverage;
pub mod error;
pub mod feeder;
pub mod interval;
pub mod ledger;
pub mod locks;
pub mod memory;
pub mod partition;
pub mod planner;
pub mod query;
pub mod report;
pub mod rolling;
pub mod row;
pub mod store;

pub use collection::DynamicCollection;
pub use error::{Error, Result};
pub use interval::{IntervalSet, TimeInterval, Timestamp};
pub use row::Row;
