//! PostgreSQL projection tables and watermarks.
//!
//! [`Store`] creates projection tables from their [`Table`] definition and
//! applies statement batches. Each batch runs in one transaction that locks
//! the `(projection, instance, aggregate type)` watermark row, so two
//! handlers can never interleave writes for the same key.

use chrono::{DateTime, Utc};
use keel_core::{
    error::Result,
    projection::{ColumnType, ProjectionStore, Table, WatermarkKey},
    statement::{
        Applied, Column, Comparison, Condition, NonEmpty, Operation, StatementBatch, Value,
    },
};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};

use crate::error::{Error, to_i64, to_u64};

/// A PostgreSQL-backed [`ProjectionStore`].
///
/// Shares its database with [`crate::Store`] but needs its own
/// [`migrate`](Self::migrate) call for the watermark table.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the watermark table (idempotent).
    ///
    /// # Errors
    ///
    /// Returns a `sqlx::Error` if the schema creation query fails.
    #[tracing::instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS keel_watermarks (
                projection_name TEXT NOT NULL,
                instance_id     TEXT NOT NULL,
                aggregate_type  TEXT NOT NULL,
                watermark       BIGINT NOT NULL DEFAULT 0,
                updated_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (projection_name, instance_id, aggregate_type)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_table(&self, table: &Table) -> Result<(), Error> {
        table.validate()?;

        if let Some(schema) = table.schema() {
            sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
                .execute(&self.pool)
                .await?;
        }

        let columns = table
            .columns()
            .iter()
            .map(|column| {
                let null = if column.nullable { "" } else { " NOT NULL" };
                format!("{} {}{null}", column.name, sql_type(column.column_type))
            })
            .collect::<Vec<_>>()
            .join(", ");
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} ({columns}, PRIMARY KEY ({}))",
            table.name(),
            table.primary_key_columns().join(", ")
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    async fn read_watermark(&self, key: &WatermarkKey) -> Result<u64, Error> {
        let watermark: Option<i64> = sqlx::query_scalar(
            r"
            SELECT watermark FROM keel_watermarks
            WHERE projection_name = $1 AND instance_id = $2 AND aggregate_type = $3
            ",
        )
        .bind(&key.projection)
        .bind(&key.instance_id)
        .bind(&key.aggregate_type)
        .fetch_optional(&self.pool)
        .await?;
        watermark.map_or(Ok(0), |value| to_u64("watermark", value))
    }

    async fn apply_batch(&self, table: &Table, batch: StatementBatch) -> Result<Applied, Error> {
        batch.check_scope()?;
        let key = batch.key();

        let mut tx = self.pool.begin().await?;
        let current = lock_watermark(&mut tx, &key).await?;

        let mut applied = Applied {
            watermark: current,
            ..Applied::default()
        };
        for statement in &batch.statements {
            if statement.aggregate_type_sequence <= current {
                applied.skipped += 1;
                continue;
            }
            for operation in statement.scoped_operations(table)? {
                execute_operation(&mut tx, table, &operation).await?;
            }
            applied.statements += 1;
        }

        applied.watermark = current.max(batch.watermark);
        sqlx::query(
            r"
            UPDATE keel_watermarks
            SET watermark = $4, updated_at = now()
            WHERE projection_name = $1 AND instance_id = $2 AND aggregate_type = $3
            ",
        )
        .bind(&key.projection)
        .bind(&key.instance_id)
        .bind(&key.aggregate_type)
        .bind(to_i64("watermark", applied.watermark)?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(applied)
    }
}

impl ProjectionStore for Store {
    async fn prepare<'a>(&'a self, table: &'a Table) -> Result<()> {
        Ok(self.create_table(table).await?)
    }

    async fn watermark<'a>(&'a self, key: &'a WatermarkKey) -> Result<u64> {
        Ok(self.read_watermark(key).await?)
    }

    #[tracing::instrument(
        skip(self, table, batch),
        fields(
            projection = %batch.projection,
            instance_id = %batch.instance_id,
            aggregate_type = %batch.aggregate_type,
            statements = batch.statements.len()
        )
    )]
    async fn apply<'a>(&'a self, table: &'a Table, batch: StatementBatch) -> Result<Applied> {
        let applied = self.apply_batch(table, batch).await?;
        tracing::debug!(
            applied = applied.statements,
            skipped = applied.skipped,
            watermark = applied.watermark,
            "statements applied"
        );
        Ok(applied)
    }
}

const fn sql_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Text => "TEXT",
        ColumnType::Int64 | ColumnType::Enum => "BIGINT",
        ColumnType::Bool => "BOOLEAN",
        ColumnType::Timestamp => "TIMESTAMPTZ",
        ColumnType::Jsonb => "JSONB",
        ColumnType::TextArray => "TEXT[]",
    }
}

/// Ensure the watermark row exists and lock it for the transaction.
async fn lock_watermark(
    tx: &mut Transaction<'_, Postgres>,
    key: &WatermarkKey,
) -> Result<u64, Error> {
    sqlx::query(
        r"
        INSERT INTO keel_watermarks (projection_name, instance_id, aggregate_type, watermark)
        VALUES ($1, $2, $3, 0)
        ON CONFLICT (projection_name, instance_id, aggregate_type) DO NOTHING
        ",
    )
    .bind(&key.projection)
    .bind(&key.instance_id)
    .bind(&key.aggregate_type)
    .execute(&mut **tx)
    .await?;

    let watermark: i64 = sqlx::query_scalar(
        r"
        SELECT watermark FROM keel_watermarks
        WHERE projection_name = $1 AND instance_id = $2 AND aggregate_type = $3
        FOR UPDATE
        ",
    )
    .bind(&key.projection)
    .bind(&key.instance_id)
    .bind(&key.aggregate_type)
    .fetch_one(&mut **tx)
    .await?;
    to_u64("watermark", watermark)
}

async fn execute_operation(
    tx: &mut Transaction<'_, Postgres>,
    table: &Table,
    operation: &Operation,
) -> Result<(), Error> {
    let mut qb = QueryBuilder::<Postgres>::new("");
    match operation {
        Operation::Create { columns } => {
            push_insert(&mut qb, table, columns);
            qb.push(" ON CONFLICT (")
                .push(table.primary_key_columns().join(", "))
                .push(") DO NOTHING");
        }
        Operation::Upsert {
            conflict_columns,
            columns,
        } => {
            push_insert(&mut qb, table, columns);
            let conflict: Vec<&str> = conflict_columns.iter().map(String::as_str).collect();
            qb.push(" ON CONFLICT (").push(conflict.join(", ")).push(")");
            let updated: Vec<&str> = columns
                .iter()
                .filter(|column| !column.only_on_insert && !conflict.contains(&column.name.as_str()))
                .map(|column| column.name.as_str())
                .collect();
            if updated.is_empty() {
                qb.push(" DO NOTHING");
            } else {
                qb.push(" DO UPDATE SET ");
                let assignments: Vec<String> = updated
                    .iter()
                    .map(|name| format!("{name} = EXCLUDED.{name}"))
                    .collect();
                qb.push(assignments.join(", "));
            }
        }
        Operation::Update { values, conditions } => {
            qb.push("UPDATE ").push(table.name()).push(" SET ");
            let mut separated = false;
            for column in values.iter() {
                if separated {
                    qb.push(", ");
                }
                separated = true;
                qb.push(&column.name).push(" = ");
                push_value(&mut qb, table, &column.name, &column.value);
            }
            push_where(&mut qb, table, conditions);
        }
        Operation::Delete { conditions } => {
            qb.push("DELETE FROM ").push(table.name());
            push_where(&mut qb, table, conditions);
        }
    }

    let result = qb.build().execute(&mut **tx).await?;
    tracing::trace!(rows = result.rows_affected(), "operation executed");
    Ok(())
}

fn push_insert(qb: &mut QueryBuilder<'_, Postgres>, table: &Table, columns: &NonEmpty<Column>) {
    let names: Vec<&str> = columns.iter().map(|column| column.name.as_str()).collect();
    qb.push("INSERT INTO ")
        .push(table.name())
        .push(" (")
        .push(names.join(", "))
        .push(") VALUES (");
    for (index, column) in columns.iter().enumerate() {
        if index > 0 {
            qb.push(", ");
        }
        push_value(qb, table, &column.name, &column.value);
    }
    qb.push(")");
}

fn push_where(qb: &mut QueryBuilder<'_, Postgres>, table: &Table, conditions: &[Condition]) {
    qb.push(" WHERE ");
    for (index, condition) in conditions.iter().enumerate() {
        if index > 0 {
            qb.push(" AND ");
        }
        qb.push(&condition.column);
        match condition.comparison {
            Comparison::IsNull => {
                qb.push(" IS NULL");
                continue;
            }
            Comparison::Equals => qb.push(" = "),
            Comparison::Less => qb.push(" < "),
            Comparison::Greater => qb.push(" > "),
        };
        push_value(qb, table, &condition.column, &condition.value);
    }
}

/// Bind `value`. `Null` is bound with the column's type so Postgres can
/// infer the parameter.
fn push_value(qb: &mut QueryBuilder<'_, Postgres>, table: &Table, column: &str, value: &Value) {
    match value {
        Value::Null => {
            let column_type = table
                .column_def(column)
                .map_or(ColumnType::Text, |definition| definition.column_type);
            match column_type {
                ColumnType::Text => qb.push_bind(None::<String>),
                ColumnType::Int64 | ColumnType::Enum => qb.push_bind(None::<i64>),
                ColumnType::Bool => qb.push_bind(None::<bool>),
                ColumnType::Timestamp => qb.push_bind(None::<DateTime<Utc>>),
                ColumnType::Jsonb => qb.push_bind(None::<sqlx::types::Json<serde_json::Value>>),
                ColumnType::TextArray => qb.push_bind(None::<Vec<String>>),
            };
        }
        Value::Bool(value) => {
            qb.push_bind(*value);
        }
        Value::Int(value) => {
            qb.push_bind(*value);
        }
        Value::Text(value) => {
            qb.push_bind(value.clone());
        }
        Value::Timestamp(value) => {
            qb.push_bind(*value);
        }
        Value::Json(value) => {
            qb.push_bind(sqlx::types::Json(value.clone()));
        }
        Value::TextArray(values) => {
            qb.push_bind(values.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_types_map_to_postgres_types() {
        assert_eq!(sql_type(ColumnType::Enum), "BIGINT");
        assert_eq!(sql_type(ColumnType::TextArray), "TEXT[]");
        assert_eq!(sql_type(ColumnType::Timestamp), "TIMESTAMPTZ");
    }

    #[test]
    fn update_compiles_to_parameterized_sql() {
        let table = Table::new("projections.users")
            .column(keel_core::projection::ColumnDef::new("instance_id", ColumnType::Text))
            .column(keel_core::projection::ColumnDef::new("id", ColumnType::Text))
            .column(keel_core::projection::ColumnDef::new("name", ColumnType::Text).nullable())
            .primary_key(["instance_id", "id"])
            .instance_column("instance_id");
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE users SET name = ");
        push_value(&mut qb, &table, "name", &Value::Null);
        push_where(
            &mut qb,
            &table,
            &[Condition::eq("id", "u1"), Condition::is_null("name")],
        );

        assert_eq!(
            qb.sql(),
            "UPDATE users SET name = $1 WHERE id = $2 AND name IS NULL"
        );
    }
}
