//! Aggregate keys and write models.
//!
//! An aggregate is never stored on its own: it is the key events are ordered
//! under. A [`WriteModel`] is the command side's view of one aggregate,
//! rebuilt by reducing its events in sequence order (see
//! [`Repository`](crate::repository::Repository)).

use serde::{Deserialize, Serialize};

use crate::{error::Result, event::Event};

/// Identifies one entity stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Aggregate {
    /// Tenant the aggregate belongs to. An empty value is resolved from the
    /// push context.
    pub instance_id: String,
    /// Owner declared by the command. Existing aggregates keep the owner
    /// recorded on their latest event.
    pub resource_owner: String,
    pub aggregate_type: String,
    pub id: String,
    pub version: String,
}

impl Aggregate {
    /// Create a key with version `v1` that inherits the context instance.
    #[must_use]
    pub fn new(
        aggregate_type: impl Into<String>,
        id: impl Into<String>,
        resource_owner: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: String::new(),
            resource_owner: resource_owner.into(),
            aggregate_type: aggregate_type.into(),
            id: id.into(),
            version: "v1".to_owned(),
        }
    }

    #[must_use]
    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

/// State reduced from one aggregate's events.
///
/// ```ignore
/// #[derive(Default)]
/// struct OrgWriteModel {
///     name: String,
///     removed: bool,
/// }
///
/// impl WriteModel for OrgWriteModel {
///     const AGGREGATE_TYPE: &'static str = "org";
///
///     fn reduce(&mut self, event: &Event) -> Result<()> {
///         if event.is::<OrgAdded>() {
///             self.name = event.decode::<OrgAdded>()?.name;
///         } else if event.is::<OrgRemoved>() {
///             self.removed = true;
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait WriteModel: Default + Send {
    const AGGREGATE_TYPE: &'static str;

    /// Event types to load. An empty slice loads every event of the
    /// aggregate.
    fn event_types() -> &'static [&'static str] {
        &[]
    }

    /// Fold one event into the state.
    ///
    /// # Errors
    ///
    /// Implementations typically propagate payload decode failures.
    fn reduce(&mut self, event: &Event) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_aggregate_defaults_to_v1_and_context_instance() {
        let aggregate = Aggregate::new("user", "u1", "org1");

        assert_eq!(aggregate.version, "v1");
        assert!(aggregate.instance_id.is_empty());
        assert_eq!(aggregate.with_instance("i1").instance_id, "i1");
    }
}
