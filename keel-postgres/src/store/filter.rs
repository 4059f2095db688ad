use chrono::{DateTime, Utc};
use keel_core::{aggregate::Aggregate, event::Event, query::SearchQuery};
use sqlx::{Postgres, QueryBuilder, Row, postgres::PgRow};

use super::Store;
use crate::error::{Error, to_i64, to_u64};

const EVENT_COLUMNS: &str = "instance_id, aggregate_type, aggregate_id, aggregate_version, \
     sequence, aggregate_type_sequence, previous_aggregate_sequence, \
     previous_aggregate_type_sequence, event_type, payload, resource_owner, creator, \
     editor_service, created_at, position";

impl Store {
    pub(super) async fn filter_events(
        &self,
        instance_id: &str,
        query: &SearchQuery,
    ) -> Result<Vec<Event>, Error> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {EVENT_COLUMNS} FROM keel_events"));
        push_conditions(&mut qb, Some(instance_id), query)?;
        push_settled(&mut qb, query);
        qb.push(if query.is_desc() {
            " ORDER BY transaction_id DESC, position DESC"
        } else {
            " ORDER BY transaction_id ASC, position ASC"
        });
        if let Some(limit) = query.limit() {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(decode_row).collect()
    }

    /// `created_at` of the last event in commit order.
    pub(super) async fn latest_created_at(
        &self,
        instance_id: &str,
        query: &SearchQuery,
    ) -> Result<Option<DateTime<Utc>>, Error> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT created_at FROM keel_events");
        push_conditions(&mut qb, Some(instance_id), query)?;
        push_settled(&mut qb, query);
        qb.push(" ORDER BY transaction_id DESC, position DESC LIMIT 1");
        Ok(qb
            .build_query_scalar::<DateTime<Utc>>()
            .fetch_optional(&self.pool)
            .await?)
    }

    pub(super) async fn distinct_instance_ids(
        &self,
        instance_id: Option<&str>,
        query: &SearchQuery,
    ) -> Result<Vec<String>, Error> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT DISTINCT instance_id FROM keel_events");
        push_conditions(&mut qb, instance_id, query)?;
        qb.push(" ORDER BY instance_id");
        Ok(qb.build_query_scalar::<String>().fetch_all(&self.pool).await?)
    }
}

/// Hide events of transactions at or past the snapshot's xmin: a running
/// transaction with a smaller id may still commit events that order before
/// them. Reads of given aggregates skip this, their sequences are already
/// commit ordered.
fn push_settled(qb: &mut QueryBuilder<'_, Postgres>, query: &SearchQuery) {
    if query.aggregate_ids().is_empty() {
        qb.push(" AND transaction_id < pg_snapshot_xmin(pg_current_snapshot())");
    }
}

/// Append the `WHERE` clause for `query`. `instance_id` of `None` spans
/// every instance.
fn push_conditions<'a>(
    qb: &mut QueryBuilder<'a, Postgres>,
    instance_id: Option<&'a str>,
    query: &'a SearchQuery,
) -> Result<(), Error> {
    qb.push(" WHERE TRUE");
    if let Some(instance_id) = instance_id {
        qb.push(" AND instance_id = ").push_bind(instance_id);
    }
    if !query.aggregate_types().is_empty() {
        qb.push(" AND aggregate_type = ANY(")
            .push_bind(query.aggregate_types())
            .push(")");
    }
    if !query.aggregate_ids().is_empty() {
        qb.push(" AND aggregate_id = ANY(")
            .push_bind(query.aggregate_ids())
            .push(")");
    }
    if !query.event_types().is_empty() {
        qb.push(" AND event_type = ANY(")
            .push_bind(query.event_types())
            .push(")");
    }
    if let Some(owner) = query.resource_owner() {
        qb.push(" AND resource_owner = ").push_bind(owner);
    }
    if let Some(sequence) = query.sequence_greater() {
        qb.push(" AND sequence > ")
            .push_bind(to_i64("sequence", sequence)?);
    }
    if let Some(sequence) = query.sequence_less() {
        qb.push(" AND sequence < ")
            .push_bind(to_i64("sequence", sequence)?);
    }
    if let Some(sequence) = query.aggregate_type_sequence_greater() {
        qb.push(" AND aggregate_type_sequence > ")
            .push_bind(to_i64("aggregate_type_sequence", sequence)?);
    }
    if let Some(at) = query.created_after() {
        qb.push(" AND created_at > ").push_bind(at);
    }
    if let Some(at) = query.created_before() {
        qb.push(" AND created_at < ").push_bind(at);
    }
    Ok(())
}

fn decode_row(row: &PgRow) -> Result<Event, Error> {
    let payload: Option<sqlx::types::Json<serde_json::Value>> = row.try_get("payload")?;
    Ok(Event {
        position: to_u64("position", row.try_get("position")?)?,
        aggregate: Aggregate {
            instance_id: row.try_get("instance_id")?,
            resource_owner: row.try_get("resource_owner")?,
            aggregate_type: row.try_get("aggregate_type")?,
            id: row.try_get("aggregate_id")?,
            version: row.try_get("aggregate_version")?,
        },
        event_type: row.try_get("event_type")?,
        sequence: to_u64("sequence", row.try_get("sequence")?)?,
        aggregate_type_sequence: to_u64(
            "aggregate_type_sequence",
            row.try_get("aggregate_type_sequence")?,
        )?,
        previous_aggregate_sequence: to_u64(
            "previous_aggregate_sequence",
            row.try_get("previous_aggregate_sequence")?,
        )?,
        previous_aggregate_type_sequence: to_u64(
            "previous_aggregate_type_sequence",
            row.try_get("previous_aggregate_type_sequence")?,
        )?,
        payload: payload.map(|json| json.0),
        created_at: row.try_get("created_at")?,
        creator: row.try_get("creator")?,
        editor_service: row.try_get("editor_service")?,
    })
}
