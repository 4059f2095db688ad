//! Structured event queries.
//!
//! Values given for the same field are OR'd, different fields are AND'd.
//! Results are always in commit order (ascending unless
//! [`SearchQueryBuilder::order_desc`] is set).
//!
//! ```
//! use keel_core::query::SearchQuery;
//!
//! let query = SearchQuery::builder()
//!     .aggregate_types(["user"])
//!     .event_types(["user.added", "user.renamed"])
//!     .sequence_greater(10)
//!     .limit(100)
//!     .build()
//!     .unwrap();
//! assert_eq!(query.limit(), Some(100));
//! ```

use chrono::{DateTime, Utc};

use crate::{
    context::Context,
    error::{Error, Result},
    event::Event,
};

/// Which instance a query reads.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum InstanceScope {
    /// The instance carried by the [`Context`].
    #[default]
    Context,
    /// An explicit instance, e.g. for system jobs acting on a tenant.
    Instance(String),
    /// Every instance. Only accepted by `instance_ids`.
    All,
}

/// A validated event query. Build it with [`SearchQuery::builder`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchQuery {
    pub(crate) instance: InstanceScope,
    pub(crate) aggregate_types: Vec<String>,
    pub(crate) aggregate_ids: Vec<String>,
    pub(crate) event_types: Vec<String>,
    pub(crate) resource_owner: Option<String>,
    pub(crate) sequence_greater: Option<u64>,
    pub(crate) sequence_less: Option<u64>,
    pub(crate) aggregate_type_sequence_greater: Option<u64>,
    pub(crate) created_after: Option<DateTime<Utc>>,
    pub(crate) created_before: Option<DateTime<Utc>>,
    pub(crate) limit: Option<u32>,
    pub(crate) desc: bool,
}

/// Builder for [`SearchQuery`].
#[derive(Clone, Debug, Default)]
pub struct SearchQueryBuilder {
    query: SearchQuery,
}

impl SearchQuery {
    #[must_use]
    pub fn builder() -> SearchQueryBuilder {
        SearchQueryBuilder::default()
    }

    /// Resolve the instance this query reads, rejecting the `All` scope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for [`InstanceScope::All`] or an
    /// empty context instance.
    pub fn instance_id<'a>(&'a self, ctx: &'a Context) -> Result<&'a str> {
        let instance = match &self.instance {
            InstanceScope::Context => ctx.instance_id(),
            InstanceScope::Instance(id) => id.as_str(),
            InstanceScope::All => {
                return Err(Error::invalid_argument(
                    "events can only be read within a single instance",
                ));
            }
        };
        if instance.is_empty() {
            return Err(Error::invalid_argument("instance id must not be empty"));
        }
        Ok(instance)
    }

    /// Like [`instance_id`](Self::instance_id) but `None` for
    /// [`InstanceScope::All`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an empty instance.
    pub fn instance_filter<'a>(&'a self, ctx: &'a Context) -> Result<Option<&'a str>> {
        match self.instance {
            InstanceScope::All => Ok(None),
            _ => self.instance_id(ctx).map(Some),
        }
    }

    #[must_use]
    pub fn aggregate_types(&self) -> &[String] {
        &self.aggregate_types
    }

    #[must_use]
    pub fn aggregate_ids(&self) -> &[String] {
        &self.aggregate_ids
    }

    #[must_use]
    pub fn event_types(&self) -> &[String] {
        &self.event_types
    }

    #[must_use]
    pub fn resource_owner(&self) -> Option<&str> {
        self.resource_owner.as_deref()
    }

    #[must_use]
    pub const fn sequence_greater(&self) -> Option<u64> {
        self.sequence_greater
    }

    #[must_use]
    pub const fn sequence_less(&self) -> Option<u64> {
        self.sequence_less
    }

    #[must_use]
    pub const fn aggregate_type_sequence_greater(&self) -> Option<u64> {
        self.aggregate_type_sequence_greater
    }

    #[must_use]
    pub const fn created_after(&self) -> Option<DateTime<Utc>> {
        self.created_after
    }

    #[must_use]
    pub const fn created_before(&self) -> Option<DateTime<Utc>> {
        self.created_before
    }

    #[must_use]
    pub const fn limit(&self) -> Option<u32> {
        self.limit
    }

    #[must_use]
    pub const fn is_desc(&self) -> bool {
        self.desc
    }

    /// Whether `event` satisfies every predicate except the instance scope
    /// and limit. Stores that filter in memory use this.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        let any = |values: &[String], value: &str| {
            values.is_empty() || values.iter().any(|candidate| candidate == value)
        };

        any(&self.aggregate_types, &event.aggregate.aggregate_type)
            && any(&self.aggregate_ids, &event.aggregate.id)
            && any(&self.event_types, &event.event_type)
            && self
                .resource_owner
                .as_deref()
                .is_none_or(|owner| owner == event.aggregate.resource_owner)
            && self.sequence_greater.is_none_or(|seq| event.sequence > seq)
            && self.sequence_less.is_none_or(|seq| event.sequence < seq)
            && self
                .aggregate_type_sequence_greater
                .is_none_or(|seq| event.aggregate_type_sequence > seq)
            && self.created_after.is_none_or(|at| event.created_at > at)
            && self.created_before.is_none_or(|at| event.created_at < at)
    }
}

impl SearchQueryBuilder {
    /// Read `instance_id` instead of the context instance.
    #[must_use]
    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.query.instance = InstanceScope::Instance(instance_id.into());
        self
    }

    /// Span every instance. Only valid for `instance_ids`.
    #[must_use]
    pub fn all_instances(mut self) -> Self {
        self.query.instance = InstanceScope::All;
        self
    }

    #[must_use]
    pub fn aggregate_types<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.query.aggregate_types.extend(types.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn aggregate_ids<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.query.aggregate_ids.extend(ids.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn event_types<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.query.event_types.extend(types.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn resource_owner(mut self, owner: impl Into<String>) -> Self {
        self.query.resource_owner = Some(owner.into());
        self
    }

    #[must_use]
    pub const fn sequence_greater(mut self, sequence: u64) -> Self {
        self.query.sequence_greater = Some(sequence);
        self
    }

    #[must_use]
    pub const fn sequence_less(mut self, sequence: u64) -> Self {
        self.query.sequence_less = Some(sequence);
        self
    }

    #[must_use]
    pub const fn aggregate_type_sequence_greater(mut self, sequence: u64) -> Self {
        self.query.aggregate_type_sequence_greater = Some(sequence);
        self
    }

    #[must_use]
    pub const fn created_after(mut self, at: DateTime<Utc>) -> Self {
        self.query.created_after = Some(at);
        self
    }

    #[must_use]
    pub const fn created_before(mut self, at: DateTime<Utc>) -> Self {
        self.query.created_before = Some(at);
        self
    }

    #[must_use]
    pub const fn limit(mut self, limit: u32) -> Self {
        self.query.limit = Some(limit);
        self
    }

    /// Newest first.
    #[must_use]
    pub const fn order_desc(mut self) -> Self {
        self.query.desc = true;
        self
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a zero limit, empty values,
    /// inverted ranges, or aggregate ids without an aggregate type.
    pub fn build(self) -> Result<SearchQuery> {
        let query = self.query;

        if query.limit == Some(0) {
            return Err(Error::invalid_argument("limit must be greater than zero"));
        }
        if let InstanceScope::Instance(id) = &query.instance
            && id.is_empty()
        {
            return Err(Error::invalid_argument("instance id must not be empty"));
        }
        for (field, values) in [
            ("aggregate type", &query.aggregate_types),
            ("aggregate id", &query.aggregate_ids),
            ("event type", &query.event_types),
        ] {
            if values.iter().any(String::is_empty) {
                return Err(Error::invalid_argument(format!("{field} must not be empty")));
            }
        }
        if query.resource_owner.as_deref() == Some("") {
            return Err(Error::invalid_argument("resource owner must not be empty"));
        }
        if !query.aggregate_ids.is_empty() && query.aggregate_types.is_empty() {
            return Err(Error::invalid_argument(
                "aggregate ids require at least one aggregate type",
            ));
        }
        if let (Some(greater), Some(less)) = (query.sequence_greater, query.sequence_less)
            && greater.saturating_add(1) >= less
        {
            return Err(Error::invalid_argument(format!(
                "empty sequence range: > {greater} and < {less}"
            )));
        }
        if let (Some(after), Some(before)) = (query.created_after, query.created_before)
            && after >= before
        {
            return Err(Error::invalid_argument("created_after must precede created_before"));
        }

        Ok(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_limit_is_rejected() {
        let error = SearchQuery::builder().limit(0).build().unwrap_err();
        assert!(matches!(error, Error::InvalidArgument(_)));
    }

    #[test]
    fn aggregate_ids_require_a_type() {
        let error = SearchQuery::builder().aggregate_ids(["u1"]).build().unwrap_err();
        assert!(matches!(error, Error::InvalidArgument(_)));
    }

    #[test]
    fn empty_values_are_rejected() {
        assert!(SearchQuery::builder().event_types([""]).build().is_err());
        assert!(SearchQuery::builder().instance_id("").build().is_err());
        assert!(SearchQuery::builder().resource_owner("").build().is_err());
    }

    #[test]
    fn inverted_sequence_range_is_rejected() {
        let error = SearchQuery::builder()
            .sequence_greater(5)
            .sequence_less(6)
            .build()
            .unwrap_err();
        assert!(matches!(error, Error::InvalidArgument(_)));

        assert!(
            SearchQuery::builder()
                .sequence_greater(5)
                .sequence_less(7)
                .build()
                .is_ok()
        );
    }

    #[test]
    fn instance_resolves_from_context_unless_overridden() {
        let ctx = Context::new("i1");
        let scoped = SearchQuery::builder().build().unwrap();
        let explicit = SearchQuery::builder().instance_id("i2").build().unwrap();

        assert_eq!(scoped.instance_id(&ctx).unwrap(), "i1");
        assert_eq!(explicit.instance_id(&ctx).unwrap(), "i2");
    }

    #[test]
    fn all_instances_cannot_read_events() {
        let ctx = Context::new("i1");
        let query = SearchQuery::builder().all_instances().build().unwrap();

        assert!(matches!(query.instance_id(&ctx), Err(Error::InvalidArgument(_))));
        assert_eq!(query.instance_filter(&ctx).unwrap(), None);
    }

    #[test]
    fn empty_context_instance_is_rejected() {
        let ctx = Context::new("");
        let query = SearchQuery::builder().build().unwrap();

        assert!(query.instance_id(&ctx).is_err());
    }
}
