//! In-memory event store for tests and demos.
//!
//! [`Store`] keeps every event in one vector behind a lock. Writers are
//! serialized by the lock, so concurrent pushes can never observe the same
//! "next sequence". Sequences are derived from the stored events on every
//! push rather than kept in counters.
//!
//! # Example
//!
//! ```
//! use keel_core::store::inmemory;
//!
//! let store = inmemory::Store::new();
//! assert!(store.is_empty());
//! ```

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio_stream::{StreamExt as _, wrappers::BroadcastStream};

use crate::{
    context::Context,
    error::{Error, Result},
    event::{Command, Event},
    query::SearchQuery,
    store::{EventStore, PreparedCommand, prepare_commands},
    subscription::{Notification, NotificationStream, SubscribableStore, notifications_for},
    unique::{UniqueAction, UniqueConstraint},
};

const NOTIFICATION_CAPACITY: usize = 1024;

/// `(instance_id, unique_type, unique_field)`
type UniqueKey = (String, String, String);

/// In-memory event store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<RwLock<Inner>>,
    notifications: broadcast::Sender<Notification>,
    editor_service: String,
}

#[derive(Default)]
struct Inner {
    events: Vec<Event>,
    unique_constraints: HashSet<UniqueKey>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            notifications,
            editor_service: "keel".to_owned(),
        }
    }

    /// Service name recorded on every event.
    #[must_use]
    pub fn with_editor_service(mut self, editor_service: impl Into<String>) -> Self {
        self.editor_service = editor_service.into();
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().map_or(0, |inner| inner.events.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `(instance, type, field)` is currently claimed.
    #[must_use]
    pub fn has_unique_constraint(&self, instance_id: &str, unique_type: &str, field: &str) -> bool {
        let key = (
            instance_id.to_owned(),
            unique_type.to_owned(),
            field.to_lowercase(),
        );
        self.read()
            .is_ok_and(|inner| inner.unique_constraints.contains(&key))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner.read().map_err(|_| poisoned())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner.write().map_err(|_| poisoned())
    }

    fn push_prepared(&self, prepared: Vec<PreparedCommand>) -> Result<Vec<Event>> {
        let mut inner = self.write()?;
        let created_at = Utc::now();

        // Counters start from what is stored and then chain through the batch.
        let mut aggregate_heads: HashMap<(String, String, String), (u64, String)> = HashMap::new();
        let mut type_heads: HashMap<(String, String), u64> = HashMap::new();
        let mut staged = Vec::with_capacity(prepared.len());
        let mut constraints = Vec::new();
        let first_position = inner.events.len() as u64 + 1;

        for (offset, command) in prepared.into_iter().enumerate() {
            let aggregate = &command.aggregate;
            let aggregate_key = (
                aggregate.instance_id.clone(),
                aggregate.aggregate_type.clone(),
                aggregate.id.clone(),
            );
            let (previous_sequence, owner) = aggregate_heads
                .entry(aggregate_key)
                .or_insert_with(|| aggregate_head(&inner.events, aggregate))
                .clone();
            let previous_type_sequence = *type_heads
                .entry((aggregate.instance_id.clone(), aggregate.aggregate_type.clone()))
                .or_insert_with(|| type_head(&inner.events, aggregate));

            command.check_expected_sequence(previous_sequence)?;

            let mut aggregate = command.aggregate;
            if !owner.is_empty() {
                aggregate.resource_owner = owner;
            }
            let event = Event {
                position: first_position + offset as u64,
                event_type: command.event_type,
                sequence: previous_sequence + 1,
                aggregate_type_sequence: previous_type_sequence + 1,
                previous_aggregate_sequence: previous_sequence,
                previous_aggregate_type_sequence: previous_type_sequence,
                payload: command.payload,
                created_at,
                creator: command.creator,
                editor_service: self.editor_service.clone(),
                aggregate,
            };

            aggregate_heads.insert(
                (
                    event.aggregate.instance_id.clone(),
                    event.aggregate.aggregate_type.clone(),
                    event.aggregate.id.clone(),
                ),
                (event.sequence, event.aggregate.resource_owner.clone()),
            );
            type_heads.insert(
                (
                    event.aggregate.instance_id.clone(),
                    event.aggregate.aggregate_type.clone(),
                ),
                event.aggregate_type_sequence,
            );
            constraints.extend(
                command
                    .unique_constraints
                    .into_iter()
                    .map(|constraint| (event.aggregate.instance_id.clone(), constraint)),
            );
            staged.push(event);
        }

        let mut unique_constraints = inner.unique_constraints.clone();
        for (instance_id, constraint) in constraints {
            apply_unique_constraint(&mut unique_constraints, &instance_id, &constraint)?;
        }

        inner.unique_constraints = unique_constraints;
        inner.events.extend(staged.iter().cloned());
        drop(inner);

        tracing::debug!(events_pushed = staged.len(), "events committed");
        for notification in notifications_for(&staged) {
            // No receivers is fine; notifications are only a wake-up hint.
            let _ = self.notifications.send(notification);
        }

        Ok(staged)
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> Error {
    Error::Internal {
        message: "in-memory store lock poisoned".to_owned(),
        source: None,
    }
}

/// Sequence and resource owner of the aggregate's latest event.
fn aggregate_head(events: &[Event], aggregate: &crate::aggregate::Aggregate) -> (u64, String) {
    events
        .iter()
        .filter(|event| {
            event.aggregate.instance_id == aggregate.instance_id
                && event.aggregate.aggregate_type == aggregate.aggregate_type
                && event.aggregate.id == aggregate.id
        })
        .max_by_key(|event| event.sequence)
        .map_or((0, String::new()), |event| {
            (event.sequence, event.aggregate.resource_owner.clone())
        })
}

fn type_head(events: &[Event], aggregate: &crate::aggregate::Aggregate) -> u64 {
    events
        .iter()
        .filter(|event| {
            event.aggregate.instance_id == aggregate.instance_id
                && event.aggregate.aggregate_type == aggregate.aggregate_type
        })
        .map(|event| event.aggregate_type_sequence)
        .max()
        .unwrap_or(0)
}

fn apply_unique_constraint(
    claims: &mut HashSet<UniqueKey>,
    instance_id: &str,
    constraint: &UniqueConstraint,
) -> Result<()> {
    let key = (
        instance_id.to_owned(),
        constraint.unique_type.clone(),
        constraint.unique_field.to_lowercase(),
    );
    match constraint.action {
        UniqueAction::Add => {
            if !claims.insert(key) {
                return Err(Error::already_exists(constraint.error_message.clone()));
            }
        }
        UniqueAction::Remove => {
            if !claims.remove(&key) {
                tracing::warn!(
                    instance_id,
                    unique_type = %constraint.unique_type,
                    unique_field = %constraint.unique_field,
                    "removed unique constraint did not exist"
                );
            }
        }
        UniqueAction::InstanceRemove => {
            claims.retain(|(instance, _, _)| instance != instance_id);
        }
    }
    Ok(())
}

impl EventStore for Store {
    #[tracing::instrument(skip(self, ctx, commands), fields(instance_id = ctx.instance_id(), commands = commands.len()))]
    fn push<'a>(
        &'a self,
        ctx: &'a Context,
        commands: &'a [&'a dyn Command],
    ) -> impl Future<Output = Result<Vec<Event>>> + Send + 'a {
        let result = if commands.is_empty() {
            Ok(Vec::new())
        } else {
            prepare_commands(ctx, commands).and_then(|prepared| self.push_prepared(prepared))
        };
        std::future::ready(result)
    }

    #[tracing::instrument(skip(self, ctx, query))]
    fn filter<'a>(
        &'a self,
        ctx: &'a Context,
        query: &'a SearchQuery,
    ) -> impl Future<Output = Result<Vec<Event>>> + Send + 'a {
        let result = (|| -> Result<Vec<Event>> {
            let instance_id = query.instance_id(ctx)?;
            let inner = self.read()?;
            let matching = inner.events.iter().filter(|event| {
                event.aggregate.instance_id == instance_id && query.matches(event)
            });
            let limit = query.limit().map_or(usize::MAX, |limit| limit as usize);
            let events: Vec<Event> = if query.is_desc() {
                matching.rev().take(limit).cloned().collect()
            } else {
                matching.take(limit).cloned().collect()
            };
            tracing::trace!(events = events.len(), "filtered events");
            Ok(events)
        })();
        std::future::ready(result)
    }

    fn latest_sequence<'a>(
        &'a self,
        ctx: &'a Context,
        query: &'a SearchQuery,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>>> + Send + 'a {
        let result = (|| -> Result<Option<DateTime<Utc>>> {
            let instance_id = query.instance_id(ctx)?;
            let inner = self.read()?;
            Ok(inner
                .events
                .iter()
                .filter(|event| event.aggregate.instance_id == instance_id && query.matches(event))
                .map(|event| event.created_at)
                .max())
        })();
        std::future::ready(result)
    }

    fn instance_ids<'a>(
        &'a self,
        ctx: &'a Context,
        query: &'a SearchQuery,
    ) -> impl Future<Output = Result<Vec<String>>> + Send + 'a {
        let result = (|| -> Result<Vec<String>> {
            let scope = query.instance_filter(ctx)?;
            let inner = self.read()?;
            let mut ids: Vec<String> = inner
                .events
                .iter()
                .filter(|event| {
                    scope.is_none_or(|id| id == event.aggregate.instance_id) && query.matches(event)
                })
                .map(|event| event.aggregate.instance_id.clone())
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            ids.sort();
            Ok(ids)
        })();
        std::future::ready(result)
    }
}

impl SubscribableStore for Store {
    fn notifications(&self) -> NotificationStream {
        Box::pin(BroadcastStream::new(self.notifications.subscribe()).filter_map(Result::ok))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use tokio_stream::StreamExt as _;

    use super::*;
    use crate::event::{DomainEvent, PushCommand};

    #[derive(Clone, Serialize, Deserialize)]
    struct UserAdded {
        username: String,
    }

    impl DomainEvent for UserAdded {
        const AGGREGATE_TYPE: &'static str = "user";
        const EVENT_TYPE: &'static str = "user.added";

        fn unique_constraints(&self) -> Vec<UniqueConstraint> {
            vec![UniqueConstraint::add("username", &self.username, "Errors.User.Taken")]
        }
    }

    #[derive(Clone, Serialize, Deserialize)]
    struct UserRemoved {
        username: String,
    }

    impl DomainEvent for UserRemoved {
        const AGGREGATE_TYPE: &'static str = "user";
        const EVENT_TYPE: &'static str = "user.removed";

        fn unique_constraints(&self) -> Vec<UniqueConstraint> {
            vec![UniqueConstraint::remove("username", &self.username)]
        }
    }

    fn user_added(id: &str, username: &str) -> PushCommand<UserAdded> {
        PushCommand::new(
            id,
            "org1",
            UserAdded {
                username: username.to_owned(),
            },
        )
        .with_creator("admin")
    }

    #[tokio::test]
    async fn push_empty_batch_is_a_no_op() {
        let store = Store::new();
        let events = store.push(&Context::new("i1"), &[]).await.unwrap();
        assert!(events.is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn batch_chains_sequences_per_aggregate_and_type() {
        let store = Store::new();
        let ctx = Context::new("i1");
        let a = user_added("u1", "alice");
        let b = user_added("u2", "bob");
        let c = PushCommand::new("u1", "org1", UserRemoved { username: "alice".to_owned() });

        let events = store.push(&ctx, &[&a, &b, &c]).await.unwrap();

        let sequences: Vec<_> = events
            .iter()
            .map(|e| (e.aggregate.id.as_str(), e.sequence, e.aggregate_type_sequence))
            .collect();
        assert_eq!(sequences, [("u1", 1, 1), ("u2", 1, 2), ("u1", 2, 3)]);
        assert_eq!(events[2].previous_aggregate_sequence, 1);
        assert_eq!(events[2].previous_aggregate_type_sequence, 2);
        assert!(events.iter().all(|e| e.created_at == events[0].created_at));
    }

    #[tokio::test]
    async fn resource_owner_is_inherited_from_existing_aggregate() {
        let store = Store::new();
        let ctx = Context::new("i1");
        store.push(&ctx, &[&user_added("u1", "alice")]).await.unwrap();

        let moved = PushCommand::new("u1", "org2", UserRemoved { username: "alice".to_owned() });
        let events = store.push(&ctx, &[&moved]).await.unwrap();

        assert_eq!(events[0].aggregate.resource_owner, "org1");
    }

    #[tokio::test]
    async fn ownerless_aggregate_takes_the_latest_owner() {
        let store = Store::new();
        let ctx = Context::new("i1");
        let removed = |owner: &str| {
            PushCommand::new("u1", owner, UserRemoved { username: "alice".to_owned() })
        };
        store.push(&ctx, &[&removed("")]).await.unwrap();
        store.push(&ctx, &[&removed("org2")]).await.unwrap();

        let events = store.push(&ctx, &[&removed("org3")]).await.unwrap();

        assert_eq!(events[0].aggregate.resource_owner, "org2");
    }

    #[tokio::test]
    async fn failed_batch_leaves_no_trace() {
        let store = Store::new();
        let ctx = Context::new("i1");
        store.push(&ctx, &[&user_added("u1", "alice")]).await.unwrap();

        let ok = user_added("u2", "bob");
        let duplicate = user_added("u3", "ALICE");
        let error = store.push(&ctx, &[&ok, &duplicate]).await.unwrap_err();

        assert!(matches!(error, Error::AlreadyExists { ref message, .. } if message == "Errors.User.Taken"));
        assert_eq!(store.len(), 1);
        assert!(!store.has_unique_constraint("i1", "username", "bob"));
    }

    #[tokio::test]
    async fn expected_sequence_is_checked_against_batch_state() {
        let store = Store::new();
        let ctx = Context::new("i1");
        let first = user_added("u1", "alice").expect_sequence(0);
        let second = PushCommand::new("u1", "org1", UserRemoved { username: "alice".to_owned() })
            .expect_sequence(0);

        let error = store.push(&ctx, &[&first, &second]).await.unwrap_err();

        assert!(matches!(error, Error::Conflict(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn filter_orders_limits_and_scopes() {
        let store = Store::new();
        store
            .push(&Context::new("i1"), &[&user_added("u1", "a"), &user_added("u2", "b")])
            .await
            .unwrap();
        store
            .push(&Context::new("i2"), &[&user_added("u3", "a")])
            .await
            .unwrap();

        let query = SearchQuery::builder().order_desc().limit(1).build().unwrap();
        let latest = store.filter(&Context::new("i1"), &query).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].aggregate.id, "u2");

        let all = SearchQuery::builder().all_instances().build().unwrap();
        let ids = store.instance_ids(&Context::new("i1"), &all).await.unwrap();
        assert_eq!(ids, ["i1", "i2"]);
        assert!(store.filter(&Context::new("i1"), &all).await.is_err());
    }

    #[tokio::test]
    async fn latest_sequence_is_none_without_events() {
        let store = Store::new();
        let query = SearchQuery::builder().build().unwrap();

        assert_eq!(store.latest_sequence(&Context::new("i1"), &query).await.unwrap(), None);
    }

    #[tokio::test]
    async fn notifications_are_sent_per_instance_and_type() {
        let store = Store::new();
        let mut notifications = store.notifications();
        store
            .push(&Context::new("i1"), &[&user_added("u1", "a"), &user_added("u2", "b")])
            .await
            .unwrap();

        let notification = notifications.next().await.unwrap();
        assert_eq!(
            notification,
            Notification {
                instance_id: "i1".to_owned(),
                aggregate_type: "user".to_owned(),
            }
        );
    }
}
