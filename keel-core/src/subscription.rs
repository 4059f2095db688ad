//! Commit notifications.
//!
//! Stores that can announce commits implement [`SubscribableStore`]. A
//! notification only says that `(instance, aggregate type)` has new events;
//! consumers still read them through
//! [`EventStore::filter`](crate::store::EventStore::filter). Delivery is best
//! effort: a lagging or restarted consumer falls back to polling.

use std::{collections::HashSet, pin::Pin};

use futures_core::Stream;

use crate::{event::Event, store::EventStore};

/// New events exist for this `(instance, aggregate type)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Notification {
    pub instance_id: String,
    pub aggregate_type: String,
}

/// Boxed notification stream returned by
/// [`SubscribableStore::notifications`].
pub type NotificationStream = Pin<Box<dyn Stream<Item = Notification> + Send + 'static>>;

/// An [`EventStore`] that announces commits.
pub trait SubscribableStore: EventStore {
    /// Notifications for commits made after the call.
    fn notifications(&self) -> NotificationStream;
}

/// One notification per distinct `(instance, aggregate type)` of `events`,
/// in first-seen order.
#[must_use]
pub fn notifications_for(events: &[Event]) -> Vec<Notification> {
    let mut seen = HashSet::new();
    events
        .iter()
        .map(|event| Notification {
            instance_id: event.aggregate.instance_id.clone(),
            aggregate_type: event.aggregate.aggregate_type.clone(),
        })
        .filter(|notification| seen.insert(notification.clone()))
        .collect()
}
