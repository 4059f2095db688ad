//! The event store contract.
//!
//! [`EventStore`] covers the four inbound operations: `push`, `filter`,
//! `latest_sequence` and `instance_ids`. Backends share the command
//! preparation in [`prepare_commands`] so validation and instance resolution
//! behave the same everywhere.
use std::future::Future;

use chrono::{DateTime, Utc};

use crate::{
    aggregate::Aggregate,
    concurrency::ConcurrencyConflict,
    context::Context,
    error::{Error, Result},
    event::{Command, Event},
    query::SearchQuery,
    unique::UniqueConstraint,
};

pub mod inmemory;

/// Append-only event storage scoped by instance.
pub trait EventStore: Send + Sync {
    /// Append `commands` as events in one transaction.
    ///
    /// Sequences are assigned at commit time. Either every command is
    /// persisted together with its unique constraints, or nothing is. An
    /// empty batch returns an empty result without touching storage.
    fn push<'a>(
        &'a self,
        ctx: &'a Context,
        commands: &'a [&'a dyn Command],
    ) -> impl Future<Output = Result<Vec<Event>>> + Send + 'a;

    /// Events matching `query` in commit order.
    fn filter<'a>(
        &'a self,
        ctx: &'a Context,
        query: &'a SearchQuery,
    ) -> impl Future<Output = Result<Vec<Event>>> + Send + 'a;

    /// Creation time of the newest event matching `query`.
    fn latest_sequence<'a>(
        &'a self,
        ctx: &'a Context,
        query: &'a SearchQuery,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>>> + Send + 'a;

    /// Distinct instances that have events matching `query`, sorted.
    ///
    /// This is the one read that accepts
    /// [`InstanceScope::All`](crate::query::InstanceScope::All).
    fn instance_ids<'a>(
        &'a self,
        ctx: &'a Context,
        query: &'a SearchQuery,
    ) -> impl Future<Output = Result<Vec<String>>> + Send + 'a;
}

/// A command after validation, payload serialization and instance
/// resolution.
#[derive(Clone, Debug, PartialEq)]
pub struct PreparedCommand {
    pub aggregate: Aggregate,
    pub event_type: String,
    pub creator: String,
    pub payload: Option<serde_json::Value>,
    pub unique_constraints: Vec<UniqueConstraint>,
    pub expected_sequence: Option<u64>,
}

impl PreparedCommand {
    /// Compare the declared expected sequence with the aggregate's current
    /// one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] when they differ.
    pub fn check_expected_sequence(&self, current: u64) -> Result<()> {
        match self.expected_sequence {
            Some(expected) if expected != current => Err(ConcurrencyConflict {
                aggregate_type: self.aggregate.aggregate_type.clone(),
                aggregate_id: self.aggregate.id.clone(),
                expected: (expected > 0).then_some(expected),
                actual: (current > 0).then_some(current),
            }
            .into()),
            _ => Ok(()),
        }
    }
}

/// Validate and serialize `commands`, resolving their instance from `ctx`.
///
/// Error messages name the index of the offending command.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] for empty identifiers, an instance
/// other than the context's, or a payload that fails to serialize.
pub fn prepare_commands(ctx: &Context, commands: &[&dyn Command]) -> Result<Vec<PreparedCommand>> {
    let mut prepared = Vec::with_capacity(commands.len());

    for (index, command) in commands.iter().enumerate() {
        let mut aggregate = command.aggregate().clone();
        if aggregate.instance_id.is_empty() {
            aggregate.instance_id = ctx.instance_id().to_owned();
        } else if aggregate.instance_id != ctx.instance_id() {
            return Err(Error::invalid_argument(format!(
                "command {index}: instance {} differs from context instance {}",
                aggregate.instance_id,
                ctx.instance_id()
            )));
        }

        for (field, value) in [
            ("instance id", aggregate.instance_id.as_str()),
            ("aggregate type", aggregate.aggregate_type.as_str()),
            ("aggregate id", aggregate.id.as_str()),
            ("event type", command.event_type()),
        ] {
            if value.is_empty() {
                return Err(Error::invalid_argument(format!(
                    "command {index}: {field} must not be empty"
                )));
            }
        }

        let payload = command.payload().map_err(|error| {
            Error::invalid_argument(format!("command {index}: unable to serialize payload: {error}"))
        })?;

        prepared.push(PreparedCommand {
            aggregate,
            event_type: command.event_type().to_owned(),
            creator: command.creator().to_owned(),
            payload,
            unique_constraints: command.unique_constraints(),
            expected_sequence: command.expected_sequence(),
        });
    }

    Ok(prepared)
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::event::{DomainEvent, PushCommand};

    #[derive(Serialize, Deserialize)]
    struct OrgAdded {
        name: String,
    }

    impl DomainEvent for OrgAdded {
        const AGGREGATE_TYPE: &'static str = "org";
        const EVENT_TYPE: &'static str = "org.added";
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("intentional serialization failure"))
        }
    }

    impl<'de> Deserialize<'de> for Unserializable {
        fn deserialize<D: serde::Deserializer<'de>>(_: D) -> Result<Self, D::Error> {
            Ok(Self)
        }
    }

    impl DomainEvent for Unserializable {
        const AGGREGATE_TYPE: &'static str = "org";
        const EVENT_TYPE: &'static str = "org.broken";
    }

    fn added(id: &str) -> PushCommand<OrgAdded> {
        PushCommand::new(id, id, OrgAdded { name: "ACME".to_owned() })
    }

    #[test]
    fn prepare_resolves_instance_from_context() {
        let ctx = Context::new("i1");
        let command = added("o1");

        let prepared = prepare_commands(&ctx, &[&command]).unwrap();

        assert_eq!(prepared[0].aggregate.instance_id, "i1");
        assert_eq!(prepared[0].event_type, "org.added");
        assert_eq!(prepared[0].payload, Some(serde_json::json!({ "name": "ACME" })));
    }

    #[test]
    fn prepare_rejects_foreign_instance() {
        let ctx = Context::new("i1");
        let command = added("o1").with_instance("i2");

        let error = prepare_commands(&ctx, &[&command]).unwrap_err();

        assert!(matches!(error, Error::InvalidArgument(ref msg) if msg.contains("command 0")));
    }

    #[test]
    fn prepare_reports_failing_index() {
        let ctx = Context::new("i1");
        let ok = added("o1");
        let empty_id = added("");
        let broken = PushCommand::new("o2", "o2", Unserializable);

        let error = prepare_commands(&ctx, &[&ok, &empty_id]).unwrap_err();
        assert!(matches!(error, Error::InvalidArgument(ref msg) if msg.contains("command 1: aggregate id")));

        let error = prepare_commands(&ctx, &[&ok, &ok, &broken]).unwrap_err();
        assert!(matches!(error, Error::InvalidArgument(ref msg) if msg.contains("command 2")));
    }

    #[test]
    fn expected_sequence_mismatch_is_a_conflict() {
        let ctx = Context::new("i1");
        let command = added("o1").expect_sequence(0);
        let prepared = prepare_commands(&ctx, &[&command]).unwrap().remove(0);

        assert!(prepared.check_expected_sequence(0).is_ok());
        let error = prepared.check_expected_sequence(3).unwrap_err();
        match error {
            Error::Conflict(conflict) => {
                assert_eq!(conflict.expected, None);
                assert_eq!(conflict.actual, Some(3));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }
}
