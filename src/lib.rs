#![doc = include_str!("../README.md")]

#[cfg(feature = "test-util")]
pub use keel_core::test;
pub use keel_core::{
    aggregate,
    aggregate::{Aggregate, WriteModel},
    concurrency,
    context,
    context::Context,
    error,
    error::{Error, ErrorKind, Result},
    event,
    event::{Command, DomainEvent, Envelope, Event, PushCommand},
    handler,
    handler::{Handler, HandlerConfig, HandlerHandle},
    instance,
    projection,
    projection::{Projection, ProjectionStore, Reduce, Reducers},
    query,
    query::SearchQuery,
    repository,
    repository::Repository,
    statement,
    subscription,
    unique,
    unique::UniqueConstraint,
};
// Re-export the derive so consumers only depend on `keel`.
pub use keel_macros::DomainEvent;

pub mod store {
    pub use keel_core::store::{EventStore, PreparedCommand, inmemory, prepare_commands};

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use keel_postgres::{Config, Error, Store, projection};
    }
}
