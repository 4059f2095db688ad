//! Core traits and types for the keel event store.
//!
//! This crate provides the storage-independent parts of keel:
//!
//! - [`store`] - The event store contract (`EventStore`) and an in-memory store
//! - [`event`] - Events, commands and the `DomainEvent` capability
//! - [`query`] - Instance-scoped event queries (`SearchQuery`)
//! - [`unique`] - Transactional unique constraints
//! - [`statement`] / [`projection`] - Idempotent table mutations and typed
//!   reducer registries
//! - [`handler`] - Watermarked projection catch-up (`Handler`)
//! - [`repository`] - Write models and command execution with retry
//! - [`error`] - The error taxonomy shared by every backend
//!
//! # Example
//!
//! ```
//! use keel_core::{context::Context, store::inmemory};
//!
//! let store = inmemory::Store::new();
//! let ctx = Context::new("instance-1");
//! assert_eq!(ctx.instance_id(), "instance-1");
//! assert!(store.is_empty());
//! ```
//!
//! Most users should depend on the `keel` crate, which re-exports these
//! modules together with the derive macro and the Postgres backend.

pub mod aggregate;
pub mod concurrency;
pub mod context;
pub mod error;
pub mod event;
pub mod handler;
pub mod instance;
pub mod projection;
pub mod query;
pub mod repository;
pub mod statement;
pub mod store;
pub mod subscription;
pub mod unique;
