//! Events, commands and the typed domain-event capability.
//!
//! [`Command`] is what callers hand to
//! [`EventStore::push`](crate::store::EventStore::push); [`Event`] is what
//! comes back and what filters return. Concrete payloads implement
//! [`DomainEvent`] (usually via `#[derive(DomainEvent)]`) and are wrapped in a
//! [`PushCommand`] so that one batch can mix event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    aggregate::Aggregate,
    error::{Error, Result},
    unique::UniqueConstraint,
};

/// A committed event.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    /// Store-assigned insert order. Filters return events in commit order,
    /// which in Postgres groups by transaction before position.
    pub position: u64,
    pub aggregate: Aggregate,
    pub event_type: String,
    /// Per-aggregate sequence, starting at 1.
    pub sequence: u64,
    /// Per `(instance, aggregate type)` sequence, starting at 1.
    pub aggregate_type_sequence: u64,
    /// Aggregate sequence before this event; 0 for the first event.
    pub previous_aggregate_sequence: u64,
    /// Aggregate-type sequence before this event; 0 for the first event.
    pub previous_aggregate_type_sequence: u64,
    pub payload: Option<serde_json::Value>,
    /// Server time of the writing transaction.
    pub created_at: DateTime<Utc>,
    pub creator: String,
    pub editor_service: String,
}

impl Event {
    /// Whether this event carries the tags of `E`.
    #[must_use]
    pub fn is<E: DomainEvent>(&self) -> bool {
        self.aggregate.aggregate_type == E::AGGREGATE_TYPE && self.event_type == E::EVENT_TYPE
    }

    /// Decode the payload as `E`.
    ///
    /// A missing payload decodes like JSON `null`, falling back to `{}` so
    /// that both unit structs and structs with only optional fields work.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] (`reduce.wrong.event.type`) when the
    /// tags or the payload do not match `E`.
    pub fn decode<E: DomainEvent>(&self) -> Result<E> {
        if !self.is::<E>() {
            return Err(wrong_event_type::<E>(self, "tag mismatch"));
        }
        let decoded = match &self.payload {
            Some(payload) => E::deserialize(payload),
            None => E::deserialize(&serde_json::Value::Null).or_else(|_| {
                E::deserialize(&serde_json::Value::Object(serde_json::Map::new()))
            }),
        };
        decoded.map_err(|error| wrong_event_type::<E>(self, &error.to_string()))
    }
}

fn wrong_event_type<E: DomainEvent>(event: &Event, detail: &str) -> Error {
    Error::invalid_argument(format!(
        "reduce.wrong.event.type: expected {}/{}, got {}/{} at sequence {}: {detail}",
        E::AGGREGATE_TYPE,
        E::EVENT_TYPE,
        event.aggregate.aggregate_type,
        event.event_type,
        event.sequence,
    ))
}

/// A typed event payload.
///
/// ```ignore
/// #[derive(Serialize, Deserialize, DomainEvent)]
/// #[event(aggregate = "user", unique = Self::claim_username)]
/// struct UserAdded {
///     username: String,
/// }
/// ```
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    const AGGREGATE_TYPE: &'static str;
    const EVENT_TYPE: &'static str;

    fn unique_constraints(&self) -> Vec<UniqueConstraint> {
        Vec::new()
    }
}

/// Intent to append one event. Object safe, so a batch can mix payload types.
pub trait Command: Send + Sync {
    fn aggregate(&self) -> &Aggregate;
    fn event_type(&self) -> &str;
    /// User or service that issued the command.
    fn creator(&self) -> &str;

    /// Serialized payload; `None` stores an empty payload.
    ///
    /// # Errors
    ///
    /// Returns the serializer's error.
    fn payload(&self) -> Result<Option<serde_json::Value>, serde_json::Error>;

    fn unique_constraints(&self) -> Vec<UniqueConstraint>;

    /// Sequence the command was decided against; `Some(0)` expects a new
    /// aggregate. `None` skips the check.
    fn expected_sequence(&self) -> Option<u64> {
        None
    }
}

/// The standard [`Command`] wrapping a [`DomainEvent`].
#[derive(Clone, Debug)]
pub struct PushCommand<E> {
    aggregate: Aggregate,
    creator: String,
    event: E,
    expected_sequence: Option<u64>,
}

impl<E: DomainEvent> PushCommand<E> {
    /// Target aggregate `E::AGGREGATE_TYPE/id` in the context instance.
    #[must_use]
    pub fn new(id: impl Into<String>, resource_owner: impl Into<String>, event: E) -> Self {
        Self {
            aggregate: Aggregate::new(E::AGGREGATE_TYPE, id, resource_owner),
            creator: String::new(),
            event,
            expected_sequence: None,
        }
    }

    #[must_use]
    pub fn with_creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = creator.into();
        self
    }

    #[must_use]
    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.aggregate.instance_id = instance_id.into();
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.aggregate.version = version.into();
        self
    }

    /// Refuse the push unless the aggregate is still at `sequence`.
    #[must_use]
    pub const fn expect_sequence(mut self, sequence: u64) -> Self {
        self.expected_sequence = Some(sequence);
        self
    }

    #[must_use]
    pub const fn event(&self) -> &E {
        &self.event
    }
}

impl<E: DomainEvent> Command for PushCommand<E> {
    fn aggregate(&self) -> &Aggregate {
        &self.aggregate
    }

    fn event_type(&self) -> &str {
        E::EVENT_TYPE
    }

    fn creator(&self) -> &str {
        &self.creator
    }

    fn payload(&self) -> Result<Option<serde_json::Value>, serde_json::Error> {
        match serde_json::to_value(&self.event)? {
            serde_json::Value::Null => Ok(None),
            value => Ok(Some(value)),
        }
    }

    fn unique_constraints(&self) -> Vec<UniqueConstraint> {
        self.event.unique_constraints()
    }

    fn expected_sequence(&self) -> Option<u64> {
        self.expected_sequence
    }
}

/// A decoded payload together with the event it came from.
#[derive(Clone, Debug)]
pub struct Envelope<'a, E> {
    event: &'a Event,
    data: E,
}

impl<'a, E: DomainEvent> Envelope<'a, E> {
    /// # Errors
    ///
    /// See [`Event::decode`].
    pub fn decode(event: &'a Event) -> Result<Self> {
        Ok(Self {
            data: event.decode()?,
            event,
        })
    }
}

impl<E> Envelope<'_, E> {
    #[must_use]
    pub const fn data(&self) -> &E {
        &self.data
    }

    #[must_use]
    pub const fn event(&self) -> &Event {
        self.event
    }

    #[must_use]
    pub fn aggregate_id(&self) -> &str {
        &self.event.aggregate.id
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.event.aggregate.instance_id
    }

    #[must_use]
    pub fn resource_owner(&self) -> &str {
        &self.event.aggregate.resource_owner
    }

    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.event.sequence
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.event.created_at
    }
}
