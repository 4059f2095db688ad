//! In-memory projection store.
//!
//! Tables are vectors of rows behind one lock. `apply` works on a copy of the
//! target table and swaps it in together with the new watermark, so a failed
//! batch leaves no partial state behind.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crate::{
    error::{Error, Result},
    projection::{ProjectionStore, Table, WatermarkKey},
    statement::{Applied, Column, Condition, Operation, StatementBatch, Value},
};

/// One stored row, keyed by column name.
pub type Row = BTreeMap<String, Value>;

#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    tables: HashMap<String, Vec<Row>>,
    watermarks: HashMap<WatermarkKey, u64>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows of `table`, in insertion order.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.read()
            .ok()
            .and_then(|inner| inner.tables.get(table).cloned())
            .unwrap_or_default()
    }

    /// Rows of `table` matching every condition.
    #[must_use]
    pub fn find(&self, table: &str, conditions: &[Condition]) -> Vec<Row> {
        self.rows(table)
            .into_iter()
            .filter(|row| matches_all(row, conditions))
            .collect()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner.read().map_err(|_| poisoned())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner.write().map_err(|_| poisoned())
    }

    fn apply_batch(&self, table: &Table, batch: StatementBatch) -> Result<Applied> {
        batch.check_scope()?;
        let key = batch.key();

        let mut inner = self.write()?;
        let current = inner.watermarks.get(&key).copied().unwrap_or(0);
        let mut rows = inner
            .tables
            .get(table.name())
            .cloned()
            .ok_or_else(|| Error::invalid_argument(format!("table {} is not prepared", table.name())))?;

        let mut applied = Applied {
            watermark: current.max(batch.watermark),
            ..Applied::default()
        };
        for statement in &batch.statements {
            if statement.aggregate_type_sequence <= current {
                applied.skipped += 1;
                continue;
            }
            for operation in statement.scoped_operations(table)? {
                apply_operation(table, &mut rows, operation)?;
            }
            applied.statements += 1;
        }

        inner.tables.insert(table.name().to_owned(), rows);
        inner.watermarks.insert(key, applied.watermark);
        Ok(applied)
    }
}

fn poisoned() -> Error {
    Error::Internal {
        message: "in-memory projection store lock poisoned".to_owned(),
        source: None,
    }
}

fn matches_all(row: &Row, conditions: &[Condition]) -> bool {
    conditions.iter().all(|condition| {
        condition.matches(row.get(&condition.column).unwrap_or(&Value::Null))
    })
}

fn new_row(table: &Table, columns: &[Column]) -> Row {
    let mut row: Row = table
        .columns()
        .iter()
        .map(|column| (column.name.clone(), Value::Null))
        .collect();
    for column in columns {
        row.insert(column.name.clone(), column.value.clone());
    }
    row
}

fn same_key(row: &Row, candidate: &Row, key: &[String]) -> bool {
    key.iter().all(|column| row.get(column) == candidate.get(column))
}

fn duplicate_key(table: &Table, rows: &[Row], index: usize) -> Result<()> {
    let key = table.primary_key_columns();
    let row = &rows[index];
    if rows
        .iter()
        .enumerate()
        .any(|(other, existing)| other != index && same_key(existing, row, key))
    {
        let values: Vec<_> = key.iter().map(|column| row.get(column)).collect();
        return Err(Error::already_exists(format!(
            "duplicate primary key {values:?} in table {}",
            table.name()
        )));
    }
    Ok(())
}

fn apply_operation(table: &Table, rows: &mut Vec<Row>, operation: Operation) -> Result<()> {
    match operation {
        Operation::Create { columns } => {
            let columns: Vec<Column> = columns.into();
            let row = new_row(table, &columns);
            if rows
                .iter()
                .any(|existing| same_key(existing, &row, table.primary_key_columns()))
            {
                tracing::debug!(table = table.name(), "row exists, create ignored");
            } else {
                rows.push(row);
            }
        }
        Operation::Upsert {
            conflict_columns,
            columns,
        } => {
            let columns: Vec<Column> = columns.into();
            let conflict_columns: Vec<String> = conflict_columns.into();
            let row = new_row(table, &columns);
            match rows
                .iter_mut()
                .find(|existing| same_key(existing, &row, &conflict_columns))
            {
                Some(existing) => {
                    for column in columns.into_iter().filter(|column| {
                        !column.only_on_insert && !conflict_columns.contains(&column.name)
                    }) {
                        existing.insert(column.name, column.value);
                    }
                }
                None => rows.push(row),
            }
        }
        Operation::Update { values, conditions } => {
            let updated: Vec<usize> = rows
                .iter()
                .enumerate()
                .filter(|(_, row)| matches_all(row, &conditions))
                .map(|(index, _)| index)
                .collect();
            if updated.is_empty() {
                tracing::debug!(table = table.name(), "update matched no rows");
            }
            for &index in &updated {
                for column in values.iter() {
                    rows[index].insert(column.name.clone(), column.value.clone());
                }
            }
            let key = table.primary_key_columns();
            if values.iter().any(|column| key.contains(&column.name)) {
                for &index in &updated {
                    duplicate_key(table, rows, index)?;
                }
            }
        }
        Operation::Delete { conditions } => {
            rows.retain(|row| !matches_all(row, &conditions));
        }
    }
    Ok(())
}

impl ProjectionStore for Store {
    fn prepare<'a>(&'a self, table: &'a Table) -> impl Future<Output = Result<()>> + Send + 'a {
        let result = table.validate().and_then(|()| {
            self.write()?
                .tables
                .entry(table.name().to_owned())
                .or_default();
            Ok(())
        });
        std::future::ready(result)
    }

    fn watermark<'a>(
        &'a self,
        key: &'a WatermarkKey,
    ) -> impl Future<Output = Result<u64>> + Send + 'a {
        let result = self
            .read()
            .map(|inner| inner.watermarks.get(key).copied().unwrap_or(0));
        std::future::ready(result)
    }

    #[tracing::instrument(skip(self, table, batch), fields(projection = %batch.projection, instance_id = %batch.instance_id, statements = batch.statements.len()))]
    fn apply<'a>(
        &'a self,
        table: &'a Table,
        batch: StatementBatch,
    ) -> impl Future<Output = Result<Applied>> + Send + 'a {
        std::future::ready(self.apply_batch(table, batch))
    }
}
