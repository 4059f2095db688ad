//! Tenant teardown.
//!
//! Pushing [`InstanceRemoved`] releases every unique claim of the instance in
//! the same transaction, and every [`Handler`](crate::handler::Handler)
//! deletes the instance's rows when it reduces the event.

use serde::{Deserialize, Serialize};

use crate::{
    event::{DomainEvent, PushCommand},
    unique::UniqueConstraint,
};

/// Aggregate type of instance lifecycle events.
pub const AGGREGATE_TYPE: &str = "instance";

/// The instance and all data scoped to it were removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRemoved;

impl DomainEvent for InstanceRemoved {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE;
    const EVENT_TYPE: &'static str = "instance.removed";

    fn unique_constraints(&self) -> Vec<UniqueConstraint> {
        vec![UniqueConstraint::instance_remove()]
    }
}

/// Command removing `instance_id`. The instance is its own aggregate and
/// resource owner.
#[must_use]
pub fn remove_instance(instance_id: &str) -> PushCommand<InstanceRemoved> {
    PushCommand::new(instance_id, instance_id, InstanceRemoved).with_instance(instance_id)
}
