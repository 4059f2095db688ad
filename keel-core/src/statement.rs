//! Table mutations produced by reducers.
//!
//! A [`Statement`] records the event it was reduced from (its aggregate-type
//! sequence is what the projection watermark advances to) and zero or more
//! [`Operation`]s. Every operation is idempotent so a batch can be applied
//! again after a crash:
//!
//! - `Create` is a no-op when the primary key already exists.
//! - `Upsert` never overwrites `only_on_insert` columns.
//! - `Update` and `Delete` tolerate zero matching rows.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
pub use nonempty::NonEmpty;

use crate::{
    error::{Error, Result},
    event::Event,
    projection::{ColumnType, Table},
};

/// A column value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
    TextArray(Vec<String>),
}

impl Value {
    /// Whether this value may be stored in a column of type `column_type`.
    #[must_use]
    pub const fn fits(&self, column_type: ColumnType) -> bool {
        matches!(
            (self, column_type),
            (Self::Null, _)
                | (Self::Bool(_), ColumnType::Bool)
                | (Self::Int(_), ColumnType::Int64 | ColumnType::Enum)
                | (Self::Text(_), ColumnType::Text)
                | (Self::Timestamp(_), ColumnType::Timestamp)
                | (Self::Json(_), ColumnType::Jsonb)
                | (Self::TextArray(_), ColumnType::TextArray)
        )
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.partial_cmp(b),
            (Self::Int(a), Self::Int(b)) => a.partial_cmp(b),
            (Self::Text(a), Self::Text(b)) => a.partial_cmp(b),
            (Self::Timestamp(a), Self::Timestamp(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

/// Sequences and other unsigned counters; values past `i64::MAX` have no
/// column representation.
impl TryFrom<u64> for Value {
    type Error = Error;

    fn try_from(value: u64) -> Result<Self> {
        i64::try_from(value)
            .map(Self::Int)
            .map_err(|_| Error::invalid_argument(format!("{value} does not fit a bigint column")))
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&String> for Value {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

impl From<Vec<String>> for Value {
    fn from(value: Vec<String>) -> Self {
        Self::TextArray(value)
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// A named value written by an operation.
#[derive(Clone, Debug, PartialEq)]
pub struct Column {
    pub name: String,
    pub value: Value,
    /// Only written when the row is inserted (upserts keep the old value).
    pub only_on_insert: bool,
}

impl Column {
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            only_on_insert: false,
        }
    }

    #[must_use]
    pub const fn only_on_insert(mut self) -> Self {
        self.only_on_insert = true;
        self
    }
}

/// Comparison used by a [`Condition`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comparison {
    Equals,
    Less,
    Greater,
    IsNull,
}

/// A row predicate. Conditions of one operation are AND'd.
#[derive(Clone, Debug, PartialEq)]
pub struct Condition {
    pub column: String,
    pub comparison: Comparison,
    pub value: Value,
}

impl Condition {
    #[must_use]
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            comparison: Comparison::Equals,
            value: value.into(),
        }
    }

    #[must_use]
    pub fn less(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            comparison: Comparison::Less,
            value: value.into(),
        }
    }

    #[must_use]
    pub fn greater(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            comparison: Comparison::Greater,
            value: value.into(),
        }
    }

    #[must_use]
    pub fn is_null(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            comparison: Comparison::IsNull,
            value: Value::Null,
        }
    }

    /// Evaluate against a stored value. `Null` only ever matches `IsNull`.
    #[must_use]
    pub fn matches(&self, stored: &Value) -> bool {
        match self.comparison {
            Comparison::IsNull => *stored == Value::Null,
            _ if *stored == Value::Null || self.value == Value::Null => false,
            Comparison::Equals => *stored == self.value,
            Comparison::Less => stored.partial_cmp(&self.value) == Some(Ordering::Less),
            Comparison::Greater => stored.partial_cmp(&self.value) == Some(Ordering::Greater),
        }
    }
}

/// One table mutation.
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    Create {
        columns: NonEmpty<Column>,
    },
    Upsert {
        conflict_columns: NonEmpty<String>,
        columns: NonEmpty<Column>,
    },
    Update {
        values: NonEmpty<Column>,
        conditions: Vec<Condition>,
    },
    Delete {
        conditions: Vec<Condition>,
    },
}

impl Operation {
    /// Add the instance scope: writes get the instance column, updates and
    /// deletes get an instance condition.
    fn scoped(&self, table: &Table, instance_id: &str) -> Result<Self> {
        let instance_column = table.instance_column_name();
        let scope_columns = |columns: &NonEmpty<Column>| -> Result<NonEmpty<Column>> {
            let mut columns = columns.clone();
            let existing = columns
                .iter()
                .find(|column| column.name == instance_column)
                .map(|column| column.value.clone());
            match existing {
                Some(value) if value != Value::from(instance_id) => {
                    return Err(Error::invalid_argument(format!(
                        "column {instance_column} must be {instance_id}, got {value:?}"
                    )));
                }
                Some(_) => {}
                None => columns.push(Column::new(instance_column, instance_id)),
            }
            Ok(columns)
        };
        let scope_conditions = |conditions: &[Condition]| -> Result<Vec<Condition>> {
            if conditions.is_empty() {
                return Err(Error::invalid_argument(format!(
                    "update or delete on {} needs at least one condition",
                    table.name()
                )));
            }
            let mut conditions = conditions.to_vec();
            conditions.push(Condition::eq(instance_column, instance_id));
            Ok(conditions)
        };

        let scoped = match self {
            Self::Create { columns } => Self::Create {
                columns: scope_columns(columns)?,
            },
            Self::Upsert {
                conflict_columns,
                columns,
            } => {
                let mut conflict_columns = conflict_columns.clone();
                if !conflict_columns.iter().any(|name| name == instance_column) {
                    conflict_columns.push(instance_column.to_owned());
                }
                Self::Upsert {
                    conflict_columns,
                    columns: scope_columns(columns)?,
                }
            }
            Self::Update { values, conditions } => {
                if values.iter().any(|column| column.name == instance_column) {
                    return Err(Error::invalid_argument(format!(
                        "column {instance_column} of {} cannot be updated",
                        table.name()
                    )));
                }
                Self::Update {
                    values: values.clone(),
                    conditions: scope_conditions(conditions)?,
                }
            }
            Self::Delete { conditions } => Self::Delete {
                conditions: scope_conditions(conditions)?,
            },
        };
        scoped.validate(table)?;
        Ok(scoped)
    }

    fn validate(&self, table: &Table) -> Result<()> {
        let check_column = |name: &str, value: Option<&Value>| -> Result<()> {
            let definition = table.column_def(name).ok_or_else(|| {
                Error::invalid_argument(format!("unknown column {name} in table {}", table.name()))
            })?;
            if let Some(value) = value {
                if !value.fits(definition.column_type) {
                    return Err(Error::invalid_argument(format!(
                        "value {value:?} does not fit column {name} of type {:?}",
                        definition.column_type
                    )));
                }
                if *value == Value::Null && !definition.nullable {
                    return Err(Error::invalid_argument(format!(
                        "column {name} of table {} is not nullable",
                        table.name()
                    )));
                }
            }
            Ok(())
        };
        let check_columns = |columns: &NonEmpty<Column>| -> Result<()> {
            columns
                .iter()
                .try_for_each(|column| check_column(&column.name, Some(&column.value)))
        };

        match self {
            Self::Create { columns } => check_columns(columns),
            Self::Upsert {
                conflict_columns,
                columns,
            } => {
                for name in conflict_columns.iter() {
                    if !columns.iter().any(|column| &column.name == name) {
                        return Err(Error::invalid_argument(format!(
                            "conflict column {name} is not among the upserted columns"
                        )));
                    }
                }
                let key = table.primary_key_columns();
                if conflict_columns.len() != key.len()
                    || !key
                        .iter()
                        .all(|name| conflict_columns.iter().any(|column| column == name))
                {
                    return Err(Error::invalid_argument(format!(
                        "upsert on {} must conflict on its primary key {key:?}",
                        table.name()
                    )));
                }
                check_columns(columns)
            }
            Self::Update { values, conditions } => {
                check_columns(values)?;
                conditions
                    .iter()
                    .try_for_each(|condition| check_column(&condition.column, None))
            }
            Self::Delete { conditions } => conditions
                .iter()
                .try_for_each(|condition| check_column(&condition.column, None)),
        }
    }
}

/// The reduced form of one event.
#[derive(Clone, Debug, PartialEq)]
pub struct Statement {
    pub instance_id: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub sequence: u64,
    pub aggregate_type_sequence: u64,
    pub created_at: DateTime<Utc>,
    pub operations: Vec<Operation>,
}

impl Statement {
    /// A statement that changes nothing but still advances the watermark.
    #[must_use]
    pub fn no_op(event: &Event) -> Self {
        Self {
            instance_id: event.aggregate.instance_id.clone(),
            aggregate_type: event.aggregate.aggregate_type.clone(),
            aggregate_id: event.aggregate.id.clone(),
            sequence: event.sequence,
            aggregate_type_sequence: event.aggregate_type_sequence,
            created_at: event.created_at,
            operations: Vec::new(),
        }
    }

    /// Insert a row; replays of an existing primary key are ignored.
    #[must_use]
    pub fn create(event: &Event, columns: NonEmpty<Column>) -> Self {
        Self::no_op(event).with(Operation::Create { columns })
    }

    /// Insert or update on `conflict_columns`, which must name the primary
    /// key. The instance column always joins the conflict target.
    #[must_use]
    pub fn upsert<I, T>(event: &Event, conflict_columns: I, columns: NonEmpty<Column>) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut names = conflict_columns.into_iter().map(Into::into);
        let statement = Self::no_op(event);
        match names.next() {
            Some(head) => statement.with(Operation::Upsert {
                conflict_columns: NonEmpty {
                    head,
                    tail: names.collect(),
                },
                columns,
            }),
            // Without conflict columns an upsert degenerates to a create.
            None => statement.with(Operation::Create { columns }),
        }
    }

    #[must_use]
    pub fn update(event: &Event, values: NonEmpty<Column>, conditions: Vec<Condition>) -> Self {
        Self::no_op(event).with(Operation::Update { values, conditions })
    }

    #[must_use]
    pub fn delete(event: &Event, conditions: Vec<Condition>) -> Self {
        Self::no_op(event).with(Operation::Delete { conditions })
    }

    /// Append another operation; all operations apply in the same
    /// transaction.
    #[must_use]
    pub fn with(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    /// The operations with the statement's instance scope applied, checked
    /// against the table definition. Stores apply these, never the raw
    /// operations.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for unknown columns, type or
    /// nullability mismatches, unconditional updates or deletes, and writes
    /// naming another instance.
    pub fn scoped_operations(&self, table: &Table) -> Result<Vec<Operation>> {
        self.operations
            .iter()
            .map(|operation| operation.scoped(table, &self.instance_id))
            .collect()
    }

    /// # Errors
    ///
    /// See [`scoped_operations`](Self::scoped_operations).
    pub fn validate(&self, table: &Table) -> Result<()> {
        self.scoped_operations(table).map(|_| ())
    }
}

/// Statements of one `(projection, instance, aggregate type)` batch and the
/// watermark to record once they are applied.
#[derive(Clone, Debug, PartialEq)]
pub struct StatementBatch {
    pub projection: String,
    pub instance_id: String,
    pub aggregate_type: String,
    pub statements: Vec<Statement>,
    /// Aggregate-type sequence of the last event read, reduced or not.
    pub watermark: u64,
}

/// What a projection store did with a batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Applied {
    pub statements: usize,
    /// Statements at or below the stored watermark.
    pub skipped: usize,
    pub watermark: u64,
}
