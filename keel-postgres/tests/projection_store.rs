//! Integration tests for `PostgreSQL` projections.
//!
//! These tests require Docker to be running and will spin up a `PostgreSQL`
//! container using testcontainers.

use keel_core::{
    context::Context,
    error::{Error, Result},
    event::{DomainEvent, Envelope, PushCommand},
    handler::{Handler, HandlerConfig},
    instance::remove_instance,
    projection::{
        ColumnDef, ColumnType, Projection, ProjectionStore, Reduce, Reducers, Table, WatermarkKey,
    },
    statement::{Column, Condition, NonEmpty, Statement, StatementBatch},
    store::EventStore,
};
use keel_postgres::{Store, projection};
use nonempty::nonempty;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;

struct TestDb {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestDb {
    async fn new() -> Self {
        let container = Postgres::default().with_tag("16-alpine").start().await.unwrap();
        let host = container.get_host().await.unwrap();
        let port = container.get_host_port_ipv4(5432).await.unwrap();

        let connection_string = format!("postgres://postgres:postgres@{host}:{port}/postgres");
        let pool = PgPool::connect(&connection_string).await.unwrap();

        Self {
            _container: container,
            pool,
        }
    }

    async fn stores(&self) -> (Store, projection::Store) {
        let events = Store::new(self.pool.clone());
        events.migrate().await.unwrap();
        let tables = projection::Store::new(self.pool.clone());
        tables.migrate().await.unwrap();
        (events, tables)
    }

    async fn names(&self, instance_id: &str) -> Vec<(String, String)> {
        sqlx::query(
            "SELECT id, name FROM projections.users WHERE instance_id = $1 ORDER BY id",
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .unwrap()
        .into_iter()
        .map(|row| (row.get("id"), row.get("name")))
        .collect()
    }
}

#[derive(Serialize, Deserialize)]
struct UserAdded {
    name: String,
}

impl DomainEvent for UserAdded {
    const AGGREGATE_TYPE: &'static str = "user";
    const EVENT_TYPE: &'static str = "user.added";
}

#[derive(Serialize, Deserialize)]
struct UserRenamed {
    name: String,
}

impl DomainEvent for UserRenamed {
    const AGGREGATE_TYPE: &'static str = "user";
    const EVENT_TYPE: &'static str = "user.renamed";
}

#[derive(Serialize, Deserialize)]
struct UserRemoved;

impl DomainEvent for UserRemoved {
    const AGGREGATE_TYPE: &'static str = "user";
    const EVENT_TYPE: &'static str = "user.removed";
}

struct Users;

impl Projection for Users {
    const NAME: &'static str = "projections.users";

    fn table(&self) -> Table {
        Table::new("projections.users")
            .column(ColumnDef::new("instance_id", ColumnType::Text))
            .column(ColumnDef::new("id", ColumnType::Text))
            .column(ColumnDef::new("name", ColumnType::Text))
            .column(ColumnDef::new("created_at", ColumnType::Timestamp))
            .column(ColumnDef::new("nickname", ColumnType::Text).nullable())
            .primary_key(["instance_id", "id"])
            .instance_column("instance_id")
    }

    fn reducers(&self) -> Reducers<Self> {
        Reducers::new()
            .event::<UserAdded>()
            .event::<UserRenamed>()
            .event::<UserRemoved>()
    }
}

impl Reduce<UserAdded> for Users {
    fn reduce(&self, event: &Envelope<'_, UserAdded>) -> Result<Statement> {
        Ok(Statement::upsert(
            event.event(),
            ["instance_id", "id"],
            nonempty![
                Column::new("id", event.aggregate_id()),
                Column::new("name", &event.data().name),
                Column::new("created_at", event.created_at()).only_on_insert(),
                Column::new("nickname", None::<String>),
            ],
        ))
    }
}

impl Reduce<UserRenamed> for Users {
    fn reduce(&self, event: &Envelope<'_, UserRenamed>) -> Result<Statement> {
        Ok(Statement::update(
            event.event(),
            NonEmpty::new(Column::new("name", &event.data().name)),
            vec![Condition::eq("id", event.aggregate_id())],
        ))
    }
}

impl Reduce<UserRemoved> for Users {
    fn reduce(&self, event: &Envelope<'_, UserRemoved>) -> Result<Statement> {
        Ok(Statement::delete(
            event.event(),
            vec![Condition::eq("id", event.aggregate_id())],
        ))
    }
}

fn added(id: &str, name: &str) -> PushCommand<UserAdded> {
    PushCommand::new(id, "org1", UserAdded { name: name.to_owned() })
}

fn renamed(id: &str, name: &str) -> PushCommand<UserRenamed> {
    PushCommand::new(id, "org1", UserRenamed { name: name.to_owned() })
}

#[tokio::test]
async fn handler_projects_events_into_the_table() {
    let db = TestDb::new().await;
    let (events, tables) = db.stores().await;
    let ctx = Context::new("i1");
    events
        .push(&ctx, &[&added("u1", "Alice"), &added("u2", "Bob"), &renamed("u1", "Alicia")])
        .await
        .unwrap();
    events
        .push(&ctx, &[&PushCommand::new("u2", "org1", UserRemoved)])
        .await
        .unwrap();

    let handler = Handler::new(Users, events, tables, HandlerConfig::default()).unwrap();
    let report = handler.trigger(&ctx).await.unwrap();

    assert_eq!(report.events, 4);
    assert_eq!(db.names("i1").await, vec![("u1".to_owned(), "Alicia".to_owned())]);
    let watermark = handler
        .sink()
        .watermark(&WatermarkKey::new(Users::NAME, "i1", "user"))
        .await
        .unwrap();
    assert_eq!(watermark, 4);
}

#[tokio::test]
async fn replayed_batches_are_skipped() {
    let db = TestDb::new().await;
    let (events, tables) = db.stores().await;
    let ctx = Context::new("i1");
    let pushed = events
        .push(&ctx, &[&added("u1", "Alice"), &renamed("u1", "Alicia")])
        .await
        .unwrap();
    let handler = Handler::new(Users, events, tables.clone(), HandlerConfig::default()).unwrap();
    handler.trigger(&ctx).await.unwrap();

    // Replay the add only: a stale statement must not undo the rename.
    let stale = StatementBatch {
        projection: Users::NAME.to_owned(),
        instance_id: "i1".to_owned(),
        aggregate_type: "user".to_owned(),
        statements: vec![Users.reduce(&Envelope::<UserAdded>::decode(&pushed[0]).unwrap()).unwrap()],
        watermark: pushed[0].aggregate_type_sequence,
    };
    let applied = tables.apply(&Users.table(), stale).await.unwrap();

    assert_eq!(applied.statements, 0);
    assert_eq!(applied.skipped, 1);
    assert_eq!(applied.watermark, 2);
    assert_eq!(db.names("i1").await, vec![("u1".to_owned(), "Alicia".to_owned())]);
}

#[tokio::test]
async fn instances_are_projected_independently() {
    let db = TestDb::new().await;
    let (events, tables) = db.stores().await;
    events
        .push(&Context::new("i1"), &[&added("u1", "Alice")])
        .await
        .unwrap();
    events
        .push(&Context::new("i2"), &[&added("u1", "Zed")])
        .await
        .unwrap();

    let handler = Handler::new(Users, events, tables, HandlerConfig::default()).unwrap();
    handler.trigger_all().await.unwrap();

    assert_eq!(db.names("i1").await, vec![("u1".to_owned(), "Alice".to_owned())]);
    assert_eq!(db.names("i2").await, vec![("u1".to_owned(), "Zed".to_owned())]);
}

#[tokio::test]
async fn instance_removal_deletes_the_instance_rows() {
    let db = TestDb::new().await;
    let (events, tables) = db.stores().await;
    let ctx = Context::new("i9");
    events.push(&ctx, &[&added("u1", "Alice")]).await.unwrap();
    events
        .push(&Context::new("i1"), &[&added("u1", "Bob")])
        .await
        .unwrap();
    let handler = Handler::new(Users, events, tables, HandlerConfig::default()).unwrap();
    handler.trigger(&ctx).await.unwrap();

    handler
        .store()
        .push(&ctx, &[&remove_instance("i9")])
        .await
        .unwrap();
    handler.trigger_all().await.unwrap();

    assert!(db.names("i9").await.is_empty());
    assert_eq!(db.names("i1").await, vec![("u1".to_owned(), "Bob".to_owned())]);
}

#[tokio::test]
async fn invalid_statements_roll_back_the_batch() {
    let db = TestDb::new().await;
    let (_, tables) = db.stores().await;
    let table = Users.table();
    tables.prepare(&table).await.unwrap();
    let ctx = Context::new("i1");
    let event_store = keel_core::store::inmemory::Store::new();
    let pushed = event_store
        .push(&ctx, &[&added("u1", "Alice"), &renamed("u1", "Alicia")])
        .await
        .unwrap();

    let valid = Users.reduce(&Envelope::<UserAdded>::decode(&pushed[0]).unwrap()).unwrap();
    let invalid = Statement::update(
        &pushed[1],
        NonEmpty::new(Column::new("missing", "x")),
        vec![Condition::eq("id", "u1")],
    );
    let error = tables
        .apply(&table, StatementBatch {
            projection: Users::NAME.to_owned(),
            instance_id: "i1".to_owned(),
            aggregate_type: "user".to_owned(),
            statements: vec![valid, invalid],
            watermark: 2,
        })
        .await
        .unwrap_err();

    assert!(matches!(error, Error::InvalidArgument(_)));
    assert!(db.names("i1").await.is_empty());
    let watermark = tables
        .watermark(&WatermarkKey::new(Users::NAME, "i1", "user"))
        .await
        .unwrap();
    assert_eq!(watermark, 0);
}

#[tokio::test]
async fn rekeying_into_an_existing_row_is_rejected() {
    let db = TestDb::new().await;
    let (_, tables) = db.stores().await;
    let table = Users.table();
    tables.prepare(&table).await.unwrap();
    let ctx = Context::new("i1");
    let event_store = keel_core::store::inmemory::Store::new();
    let pushed = event_store
        .push(
            &ctx,
            &[&added("u1", "Alice"), &added("u2", "Bob"), &renamed("u2", "Bobby")],
        )
        .await
        .unwrap();

    let statements = vec![
        Users.reduce(&Envelope::<UserAdded>::decode(&pushed[0]).unwrap()).unwrap(),
        Users.reduce(&Envelope::<UserAdded>::decode(&pushed[1]).unwrap()).unwrap(),
        Statement::update(
            &pushed[2],
            NonEmpty::new(Column::new("id", "u1")),
            vec![Condition::eq("id", "u2")],
        ),
    ];
    let error = tables
        .apply(&table, StatementBatch {
            projection: Users::NAME.to_owned(),
            instance_id: "i1".to_owned(),
            aggregate_type: "user".to_owned(),
            statements,
            watermark: 3,
        })
        .await
        .unwrap_err();

    assert!(matches!(error, Error::AlreadyExists { .. }));
    assert!(db.names("i1").await.is_empty());
}
