//! Organizations end to end on the in-memory stores: a write model decides
//! commands, unique constraints guard names, a projection keeps a read table.
//!
//! Run with: `RUST_LOG=keel=debug cargo run --example quickstart --features test-util`

use keel::{
    Context, DomainEvent, Envelope, Event, Handler, HandlerConfig, Projection, PushCommand,
    Reduce, Reducers, Repository, Result, UniqueConstraint, WriteModel,
    event::Command,
    instance::remove_instance,
    projection::{ColumnDef, ColumnType, Table, inmemory as tables},
    statement::{Column, Condition, NonEmpty, Statement, Value},
    store::{EventStore, inmemory},
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

// Events

#[derive(Debug, Serialize, Deserialize, DomainEvent)]
#[event(aggregate = "org", unique = Self::claim_name)]
pub struct OrgAdded {
    pub name: String,
}

impl OrgAdded {
    fn claim_name(&self) -> Vec<UniqueConstraint> {
        vec![UniqueConstraint::add(
            "org_name",
            &self.name,
            "Errors.Org.AlreadyExists",
        )]
    }
}

/// Renames move the claim from the old name to the new one.
#[derive(Debug, Serialize, Deserialize, DomainEvent)]
#[event(aggregate = "org", unique = Self::move_claim)]
pub struct OrgRenamed {
    pub old_name: String,
    pub name: String,
}

impl OrgRenamed {
    fn move_claim(&self) -> Vec<UniqueConstraint> {
        vec![
            UniqueConstraint::remove("org_name", &self.old_name),
            UniqueConstraint::add("org_name", &self.name, "Errors.Org.AlreadyExists"),
        ]
    }
}

// Write model

#[derive(Debug, Default)]
struct OrgWriteModel {
    name: Option<String>,
}

impl WriteModel for OrgWriteModel {
    const AGGREGATE_TYPE: &'static str = "org";

    fn reduce(&mut self, event: &Event) -> Result<()> {
        if event.is::<OrgAdded>() {
            self.name = Some(event.decode::<OrgAdded>()?.name);
        } else if event.is::<OrgRenamed>() {
            self.name = Some(event.decode::<OrgRenamed>()?.name);
        }
        Ok(())
    }
}

// Projection

struct Orgs;

impl Projection for Orgs {
    const NAME: &'static str = "projections.orgs";

    fn table(&self) -> Table {
        Table::new("projections.orgs")
            .column(ColumnDef::new("instance_id", ColumnType::Text))
            .column(ColumnDef::new("id", ColumnType::Text))
            .column(ColumnDef::new("name", ColumnType::Text))
            .column(ColumnDef::new("sequence", ColumnType::Int64))
            .primary_key(["instance_id", "id"])
            .instance_column("instance_id")
    }

    fn reducers(&self) -> Reducers<Self> {
        Reducers::new().event::<OrgAdded>().event::<OrgRenamed>()
    }
}

impl Reduce<OrgAdded> for Orgs {
    fn reduce(&self, event: &Envelope<'_, OrgAdded>) -> Result<Statement> {
        Ok(Statement::create(
            event.event(),
            NonEmpty {
                head: Column::new("id", event.aggregate_id()),
                tail: vec![
                    Column::new("name", &event.data().name),
                    Column::new("sequence", Value::try_from(event.sequence())?),
                ],
            },
        ))
    }
}

impl Reduce<OrgRenamed> for Orgs {
    fn reduce(&self, event: &Envelope<'_, OrgRenamed>) -> Result<Statement> {
        Ok(Statement::update(
            event.event(),
            NonEmpty {
                head: Column::new("name", &event.data().name),
                tail: vec![Column::new("sequence", Value::try_from(event.sequence())?)],
            },
            vec![Condition::eq("id", event.aggregate_id())],
        ))
    }
}

/// Rename `id`, reloading and retrying when another writer got there first.
async fn rename(
    repository: &Repository<inmemory::Store>,
    ctx: &Context,
    id: &str,
    name: &str,
) -> Result<Vec<Event>> {
    repository
        .execute::<OrgWriteModel, _>(ctx, id, |loaded| {
            let Some(old_name) = loaded.state.name.clone() else {
                return Err(keel::Error::not_found(format!("org {id}")));
            };
            if old_name == name {
                return Ok(Vec::new());
            }
            let command: Box<dyn Command> = Box::new(PushCommand::new(
                id,
                &loaded.resource_owner,
                OrgRenamed {
                    old_name,
                    name: name.to_owned(),
                },
            ));
            Ok(vec![command])
        })
        .await
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let store = inmemory::Store::new().with_editor_service("quickstart");
    let repository = Repository::new(store.clone());
    let acme = Context::new("acme");
    let globex = Context::new("globex");

    keel::test::seed(
        &store,
        &acme,
        &[
            &PushCommand::new("o1", "o1", OrgAdded { name: "Sales".to_owned() }),
            &PushCommand::new("o2", "o2", OrgAdded { name: "Support".to_owned() }),
        ],
    )
    .await;
    // Names are unique per instance only.
    keel::test::seed(
        &store,
        &globex,
        &[&PushCommand::new("o1", "o1", OrgAdded { name: "Sales".to_owned() })],
    )
    .await;

    match store
        .push(
            &acme,
            &[&PushCommand::new("o3", "o3", OrgAdded { name: "sales".to_owned() })],
        )
        .await
    {
        Err(error) => tracing::info!(%error, "duplicate org rejected"),
        Ok(_) => tracing::warn!("duplicate org unexpectedly accepted"),
    }

    let renamed = rename(&repository, &acme, "o2", "Customer Care").await?;
    tracing::info!(events = renamed.len(), "renamed o2, \"Support\" is free again");

    let handler = Handler::new(Orgs, store.clone(), tables::Store::new(), HandlerConfig::default())?;
    let report = handler.trigger_all().await?;
    tracing::info!(?report, "projected");
    for row in handler.sink().rows(Orgs::NAME) {
        tracing::info!(?row, "org");
    }

    store.push(&globex, &[&remove_instance("globex")]).await?;
    handler.trigger(&globex).await?;
    tracing::info!(
        rows = handler.sink().rows(Orgs::NAME).len(),
        "globex removed"
    );

    Ok(())
}
