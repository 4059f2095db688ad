//! Postgres-backed keel stores.
//!
//! This crate provides `PostgreSQL` implementations of the core keel traits:
//!
//! - [`Store`] - An implementation of [`keel_core::store::EventStore`] and
//!   [`keel_core::subscription::SubscribableStore`]
//! - [`projection::Store`] - An implementation of
//!   [`keel_core::projection::ProjectionStore`]
//!
//! Both use the same database and can share a connection pool.

mod config;
mod error;
pub mod projection;
mod store;

pub use config::Config;
pub use error::Error;
pub use store::Store;
