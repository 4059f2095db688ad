use std::collections::HashMap;

use chrono::{DateTime, Utc};
use keel_core::{
    error::Error as CoreError,
    event::Event,
    store::PreparedCommand,
    subscription::notifications_for,
    unique::{UniqueAction, UniqueConstraint},
};
use sqlx::{Postgres, QueryBuilder, Row, Transaction};

use super::{EVENTS_NOTIFY_CHANNEL, Store};
use crate::error::{Error, to_i64, to_u64};

/// `(aggregate_type, aggregate_id)` within the batch's instance.
type AggregateKey = (String, String);

impl Store {
    /// Run [`push_once`](Self::push_once) until it commits, fails for a
    /// non-transient reason, or the retry policy is exhausted.
    pub(super) async fn push_with_retry(
        &self,
        commands: &[PreparedCommand],
    ) -> keel_core::error::Result<Vec<Event>> {
        let policy = self.config().push_retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.push_once(commands).await {
                Ok(events) => return Ok(events),
                Err(error) if error.is_transient() && policy.should_retry(attempt) => {
                    tracing::debug!(attempt, error = %error, "push aborted by concurrent writer, retrying");
                    tokio::time::sleep(policy.backoff(attempt)).await;
                }
                Err(error) if error.is_transient() => {
                    tracing::warn!(attempt, error = %error, "push retries exhausted");
                    return Err(CoreError::Retryable {
                        attempts: attempt,
                        source: Box::new(error),
                    });
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    async fn push_once(&self, commands: &[PreparedCommand]) -> Result<Vec<Event>, Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        let mut aggregate_heads: HashMap<AggregateKey, (u64, String)> = HashMap::new();
        let mut type_heads: HashMap<String, u64> = HashMap::new();
        let mut staged = Vec::with_capacity(commands.len());

        for command in commands {
            let aggregate = &command.aggregate;
            let key = (aggregate.aggregate_type.clone(), aggregate.id.clone());
            let (previous_sequence, owner) = match aggregate_heads.get(&key) {
                Some(head) => head.clone(),
                None => aggregate_head(&mut tx, command).await?,
            };
            let previous_type_sequence = match type_heads.get(&aggregate.aggregate_type) {
                Some(head) => *head,
                None => type_head(&mut tx, command).await?,
            };

            command.check_expected_sequence(previous_sequence)?;

            let mut aggregate = aggregate.clone();
            if !owner.is_empty() {
                aggregate.resource_owner = owner;
            }
            let sequence = previous_sequence + 1;
            let aggregate_type_sequence = previous_type_sequence + 1;

            aggregate_heads.insert(key, (sequence, aggregate.resource_owner.clone()));
            type_heads.insert(aggregate.aggregate_type.clone(), aggregate_type_sequence);

            staged.push(Event {
                // Filled in from RETURNING below.
                position: 0,
                aggregate,
                event_type: command.event_type.clone(),
                sequence,
                aggregate_type_sequence,
                previous_aggregate_sequence: previous_sequence,
                previous_aggregate_type_sequence: previous_type_sequence,
                payload: command.payload.clone(),
                created_at: DateTime::<Utc>::UNIX_EPOCH,
                creator: command.creator.clone(),
                editor_service: self.config().editor_service.clone(),
            });
        }

        insert_events(&mut tx, &mut staged).await?;

        for (command, event) in commands.iter().zip(&staged) {
            for constraint in &command.unique_constraints {
                apply_unique_constraint(&mut tx, &event.aggregate.instance_id, constraint).await?;
            }
        }

        if self.config().notify {
            for notification in notifications_for(&staged) {
                let payload = serde_json::json!({
                    "instance_id": notification.instance_id,
                    "aggregate_type": notification.aggregate_type,
                })
                .to_string();
                sqlx::query("SELECT pg_notify($1, $2)")
                    .bind(EVENTS_NOTIFY_CHANNEL)
                    .bind(payload)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        tracing::debug!(events_pushed = staged.len(), "events committed");
        Ok(staged)
    }
}

async fn aggregate_head(
    tx: &mut Transaction<'_, Postgres>,
    command: &PreparedCommand,
) -> Result<(u64, String), Error> {
    let aggregate = &command.aggregate;
    let row = sqlx::query(
        r"
        SELECT sequence, resource_owner
        FROM keel_events
        WHERE instance_id = $1 AND aggregate_type = $2 AND aggregate_id = $3
        ORDER BY sequence DESC
        LIMIT 1
        ",
    )
    .bind(&aggregate.instance_id)
    .bind(&aggregate.aggregate_type)
    .bind(&aggregate.id)
    .fetch_optional(&mut **tx)
    .await?;

    match row {
        Some(row) => Ok((
            to_u64("sequence", row.try_get("sequence")?)?,
            row.try_get("resource_owner")?,
        )),
        None => Ok((0, String::new())),
    }
}

async fn type_head(
    tx: &mut Transaction<'_, Postgres>,
    command: &PreparedCommand,
) -> Result<u64, Error> {
    let head: i64 = sqlx::query_scalar(
        r"
        SELECT COALESCE(MAX(aggregate_type_sequence), 0)
        FROM keel_events
        WHERE instance_id = $1 AND aggregate_type = $2
        ",
    )
    .bind(&command.aggregate.instance_id)
    .bind(&command.aggregate.aggregate_type)
    .fetch_one(&mut **tx)
    .await?;
    to_u64("aggregate_type_sequence", head)
}

/// Insert `events` and copy the store-assigned position and timestamp back.
async fn insert_events(
    tx: &mut Transaction<'_, Postgres>,
    events: &mut [Event],
) -> Result<(), Error> {
    struct Bound<'a> {
        event: &'a Event,
        sequence: i64,
        aggregate_type_sequence: i64,
        previous_aggregate_sequence: i64,
        previous_aggregate_type_sequence: i64,
    }

    let bound = events
        .iter()
        .map(|event| {
            Ok(Bound {
                event,
                sequence: to_i64("sequence", event.sequence)?,
                aggregate_type_sequence: to_i64(
                    "aggregate_type_sequence",
                    event.aggregate_type_sequence,
                )?,
                previous_aggregate_sequence: to_i64(
                    "previous_aggregate_sequence",
                    event.previous_aggregate_sequence,
                )?,
                previous_aggregate_type_sequence: to_i64(
                    "previous_aggregate_type_sequence",
                    event.previous_aggregate_type_sequence,
                )?,
            })
        })
        .collect::<Result<Vec<_>, Error>>()?;

    let rows = {
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO keel_events (instance_id, aggregate_type, aggregate_id, aggregate_version, \
             sequence, aggregate_type_sequence, previous_aggregate_sequence, \
             previous_aggregate_type_sequence, event_type, payload, resource_owner, creator, \
             editor_service) ",
        );
        qb.push_values(bound, |mut b, row| {
            let event = row.event;
            b.push_bind(&event.aggregate.instance_id)
                .push_bind(&event.aggregate.aggregate_type)
                .push_bind(&event.aggregate.id)
                .push_bind(&event.aggregate.version)
                .push_bind(row.sequence)
                .push_bind(row.aggregate_type_sequence)
                .push_bind(row.previous_aggregate_sequence)
                .push_bind(row.previous_aggregate_type_sequence)
                .push_bind(&event.event_type)
                .push_bind(event.payload.as_ref().map(sqlx::types::Json))
                .push_bind(&event.aggregate.resource_owner)
                .push_bind(&event.creator)
                .push_bind(&event.editor_service);
        });
        qb.push(" RETURNING position, created_at");

        qb.build().fetch_all(&mut **tx).await?
    };
    if rows.len() != events.len() {
        return Err(Error::MissingReturnedRow);
    }
    // A multi-row INSERT returns rows in VALUES order.
    for (event, row) in events.iter_mut().zip(rows) {
        event.position = to_u64("position", row.try_get("position")?)?;
        event.created_at = row.try_get("created_at")?;
    }
    Ok(())
}

async fn apply_unique_constraint(
    tx: &mut Transaction<'_, Postgres>,
    instance_id: &str,
    constraint: &UniqueConstraint,
) -> Result<(), Error> {
    let field = constraint.unique_field.to_lowercase();
    match constraint.action {
        UniqueAction::Add => {
            let inserted = sqlx::query(
                r"
                INSERT INTO keel_unique_constraints (instance_id, unique_type, unique_field)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                ",
            )
            .bind(instance_id)
            .bind(&constraint.unique_type)
            .bind(&field)
            .execute(&mut **tx)
            .await?
            .rows_affected();
            if inserted == 0 {
                return Err(CoreError::already_exists(constraint.error_message.clone()).into());
            }
        }
        UniqueAction::Remove => {
            let removed = sqlx::query(
                r"
                DELETE FROM keel_unique_constraints
                WHERE instance_id = $1 AND unique_type = $2 AND unique_field = $3
                ",
            )
            .bind(instance_id)
            .bind(&constraint.unique_type)
            .bind(&field)
            .execute(&mut **tx)
            .await?
            .rows_affected();
            if removed == 0 {
                tracing::warn!(
                    instance_id,
                    unique_type = %constraint.unique_type,
                    unique_field = %constraint.unique_field,
                    "removed unique constraint did not exist"
                );
            }
        }
        UniqueAction::InstanceRemove => {
            sqlx::query("DELETE FROM keel_unique_constraints WHERE instance_id = $1")
                .bind(instance_id)
                .execute(&mut **tx)
                .await?;
        }
    }
    Ok(())
}
