//! Read-side primitives.
//!
//! A [`Projection`] owns a relational [`Table`] and a typed registry of
//! reducers ([`Reducers`]) that turn events into
//! [`Statement`](crate::statement::Statement)s. A [`ProjectionStore`] applies
//! those statements together with the projection's watermark; the
//! [`Handler`](crate::handler::Handler) drives the catch-up loop.
use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    event::{DomainEvent, Envelope, Event},
    statement::{Applied, Statement, StatementBatch},
};

pub mod inmemory;

/// Column types a projection table may declare.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Text,
    Int64,
    Bool,
    Timestamp,
    Jsonb,
    TextArray,
    /// Stored as a 64-bit integer.
    Enum,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

impl ColumnDef {
    #[must_use]
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
        }
    }

    #[must_use]
    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// Schema of a projection table.
///
/// ```
/// use keel_core::projection::{ColumnDef, ColumnType, Table};
///
/// let table = Table::new("projections.orgs")
///     .column(ColumnDef::new("instance_id", ColumnType::Text))
///     .column(ColumnDef::new("id", ColumnType::Text))
///     .column(ColumnDef::new("name", ColumnType::Text))
///     .primary_key(["instance_id", "id"])
///     .instance_column("instance_id");
/// assert!(table.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    name: String,
    columns: Vec<ColumnDef>,
    primary_key: Vec<String>,
    instance_column: String,
}

impl Table {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            instance_column: String::new(),
        }
    }

    #[must_use]
    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    #[must_use]
    pub fn primary_key<I, T>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    /// The column holding the instance id. Every write is scoped by it and
    /// instance removal deletes by it.
    #[must_use]
    pub fn instance_column(mut self, column: impl Into<String>) -> Self {
        self.instance_column = column.into();
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    #[must_use]
    pub fn column_def(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|column| column.name == name)
    }

    #[must_use]
    pub fn primary_key_columns(&self) -> &[String] {
        &self.primary_key
    }

    #[must_use]
    pub fn instance_column_name(&self) -> &str {
        &self.instance_column
    }

    /// The schema part of a `schema.table` name, if any.
    #[must_use]
    pub fn schema(&self) -> Option<&str> {
        self.name.split_once('.').map(|(schema, _)| schema)
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for invalid identifiers, duplicate
    /// or missing columns, a missing or nullable primary key, or a missing
    /// text instance column.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(Error::invalid_argument(message));

        let mut parts = self.name.split('.');
        let valid_name = match (parts.next(), parts.next(), parts.next()) {
            (Some(table), None, None) => is_identifier(table),
            (Some(schema), Some(table), None) => is_identifier(schema) && is_identifier(table),
            _ => false,
        };
        if !valid_name {
            return invalid(format!("invalid table name {:?}", self.name));
        }
        if self.columns.is_empty() {
            return invalid(format!("table {} has no columns", self.name));
        }
        let mut seen = HashSet::new();
        for column in &self.columns {
            if !is_identifier(&column.name) {
                return invalid(format!("invalid column name {:?}", column.name));
            }
            if !seen.insert(column.name.as_str()) {
                return invalid(format!("duplicate column {} in {}", column.name, self.name));
            }
        }
        if self.primary_key.is_empty() {
            return invalid(format!("table {} has no primary key", self.name));
        }
        for key in &self.primary_key {
            match self.column_def(key) {
                Some(column) if column.nullable => {
                    return invalid(format!("primary key column {key} must not be nullable"));
                }
                Some(_) => {}
                None => return invalid(format!("primary key column {key} is not declared")),
            }
        }
        match self.column_def(&self.instance_column) {
            Some(column) if column.column_type == ColumnType::Text && !column.nullable => Ok(()),
            Some(_) => invalid(format!(
                "instance column {} must be a non-null text column",
                self.instance_column
            )),
            None => invalid(format!("table {} needs an instance column", self.name)),
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_lowercase() || first == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && name.len() <= 63
}

/// Reduce one event type into a statement.
///
/// ```ignore
/// impl Reduce<UserRenamed> for UserProjection {
///     fn reduce(&self, event: &Envelope<'_, UserRenamed>) -> Result<Statement> {
///         Ok(Statement::update(
///             event.event(),
///             NonEmpty::new(Column::new("name", &event.data().name)),
///             vec![Condition::eq("id", event.aggregate_id())],
///         ))
///     }
/// }
/// ```
pub trait Reduce<E: DomainEvent> {
    /// # Errors
    ///
    /// Implementations return [`Error::InvalidArgument`] for events they
    /// cannot reduce.
    fn reduce(&self, event: &Envelope<'_, E>) -> Result<Statement>;
}

type ReduceFn<P> = Box<dyn Fn(&P, &Event) -> Result<Statement> + Send + Sync>;

struct Entry<P> {
    aggregate_type: &'static str,
    event_type: &'static str,
    reduce: ReduceFn<P>,
}

/// Builder for a projection's `(aggregate type, event type)` -> reducer
/// mapping. Validated when the handler is created.
pub struct Reducers<P> {
    entries: Vec<Entry<P>>,
}

impl<P: 'static> Reducers<P> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register `P`'s [`Reduce<E>`] implementation.
    #[must_use]
    pub fn event<E>(self) -> Self
    where
        E: DomainEvent,
        P: Reduce<E>,
    {
        self.event_with::<E, _>(|projection, envelope| projection.reduce(envelope))
    }

    /// Register a closure as the reducer for `E`.
    #[must_use]
    pub fn event_with<E, F>(mut self, reduce: F) -> Self
    where
        E: DomainEvent,
        F: Fn(&P, &Envelope<'_, E>) -> Result<Statement> + Send + Sync + 'static,
    {
        self.entries.push(Entry {
            aggregate_type: E::AGGREGATE_TYPE,
            event_type: E::EVENT_TYPE,
            reduce: Box::new(move |projection, event| {
                let envelope = Envelope::<E>::decode(event)?;
                reduce(projection, &envelope)
            }),
        });
        self
    }

    /// Whether a reducer for `E` is registered.
    #[must_use]
    pub fn contains<E: DomainEvent>(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.aggregate_type == E::AGGREGATE_TYPE && entry.event_type == E::EVENT_TYPE)
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an empty registry or a pair
    /// registered twice.
    pub fn build(self) -> Result<ReducerRegistry<P>> {
        if self.entries.is_empty() {
            return Err(Error::invalid_argument("projection registers no reducers"));
        }
        let mut reducers: HashMap<&'static str, HashMap<&'static str, ReduceFn<P>>> =
            HashMap::new();
        let mut event_types: BTreeMap<&'static str, Vec<&'static str>> = BTreeMap::new();
        for entry in self.entries {
            let by_event = reducers.entry(entry.aggregate_type).or_default();
            if by_event.insert(entry.event_type, entry.reduce).is_some() {
                return Err(Error::invalid_argument(format!(
                    "reducer for {}/{} registered twice",
                    entry.aggregate_type, entry.event_type
                )));
            }
            event_types
                .entry(entry.aggregate_type)
                .or_default()
                .push(entry.event_type);
        }
        Ok(ReducerRegistry {
            reducers,
            event_types,
        })
    }
}

impl<P: 'static> Default for Reducers<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Validated reducer lookup.
pub struct ReducerRegistry<P> {
    reducers: HashMap<&'static str, HashMap<&'static str, ReduceFn<P>>>,
    event_types: BTreeMap<&'static str, Vec<&'static str>>,
}

impl<P> ReducerRegistry<P> {
    /// Registered event types grouped by aggregate type.
    #[must_use]
    pub const fn event_types(&self) -> &BTreeMap<&'static str, Vec<&'static str>> {
        &self.event_types
    }

    #[must_use]
    pub fn handles(&self, aggregate_type: &str) -> bool {
        self.event_types.contains_key(aggregate_type)
    }

    /// Reduce `event`. `None` when no reducer is registered for it, which is
    /// a deliberate skip.
    ///
    /// # Errors
    ///
    /// Propagates the reducer's error, including
    /// `reduce.wrong.event.type` decode failures.
    pub fn reduce(&self, projection: &P, event: &Event) -> Result<Option<Statement>> {
        let reducer = self
            .reducers
            .get(event.aggregate.aggregate_type.as_str())
            .and_then(|by_event| by_event.get(event.event_type.as_str()));
        match reducer {
            Some(reduce) => reduce(projection, event).map(Some),
            None => {
                tracing::trace!(
                    aggregate_type = %event.aggregate.aggregate_type,
                    event_type = %event.event_type,
                    "no reducer registered"
                );
                Ok(None)
            }
        }
    }
}

/// A read model backed by one table.
pub trait Projection: Send + Sync + Sized + 'static {
    /// Unique name, also the watermark key.
    const NAME: &'static str;

    fn table(&self) -> Table;

    fn reducers(&self) -> Reducers<Self>;
}

/// Identifies one watermark.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatermarkKey {
    pub projection: String,
    pub instance_id: String,
    pub aggregate_type: String,
}

impl WatermarkKey {
    #[must_use]
    pub fn new(
        projection: impl Into<String>,
        instance_id: impl Into<String>,
        aggregate_type: impl Into<String>,
    ) -> Self {
        Self {
            projection: projection.into(),
            instance_id: instance_id.into(),
            aggregate_type: aggregate_type.into(),
        }
    }
}

impl StatementBatch {
    #[must_use]
    pub fn key(&self) -> WatermarkKey {
        WatermarkKey::new(&self.projection, &self.instance_id, &self.aggregate_type)
    }

    /// Reject statements outside the batch's instance or aggregate type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] naming the offending statement.
    pub fn check_scope(&self) -> Result<()> {
        match self.statements.iter().find(|statement| {
            statement.instance_id != self.instance_id
                || statement.aggregate_type != self.aggregate_type
        }) {
            Some(statement) => Err(Error::invalid_argument(format!(
                "statement for {}/{} at sequence {} does not belong to batch {}/{}",
                statement.instance_id,
                statement.aggregate_type,
                statement.aggregate_type_sequence,
                self.instance_id,
                self.aggregate_type
            ))),
            None => Ok(()),
        }
    }
}

/// Storage for projection tables and their watermarks.
///
/// `apply` must lock the watermark, skip statements at or below it, apply
/// the rest, and advance it to `batch.watermark` in one transaction.
pub trait ProjectionStore: Send + Sync {
    /// Create the table (and schema) if missing.
    fn prepare<'a>(&'a self, table: &'a Table) -> impl Future<Output = Result<()>> + Send + 'a;

    /// Current watermark; 0 when nothing was processed yet.
    fn watermark<'a>(
        &'a self,
        key: &'a WatermarkKey,
    ) -> impl Future<Output = Result<u64>> + Send + 'a;

    fn apply<'a>(
        &'a self,
        table: &'a Table,
        batch: StatementBatch,
    ) -> impl Future<Output = Result<Applied>> + Send + 'a;
}
