//! Projection tests written with the reducer harness.

use keel::{
    DomainEvent, Envelope, ErrorKind, Projection, PushCommand, Reduce, Reducers, Result,
    instance::remove_instance,
    projection::{ColumnDef, ColumnType, Table},
    statement::{Column, Condition, NonEmpty, Statement, Value},
    test::{ReducerHarness, seed},
};
use nonempty::nonempty;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, DomainEvent)]
#[event(aggregate = "instance", kind = "instance.domain.added")]
struct DomainAdded {
    domain: String,
    generated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, DomainEvent)]
#[event(aggregate = "instance", kind = "instance.domain.primary.set")]
struct PrimaryDomainSet {
    domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, DomainEvent)]
#[event(aggregate = "instance", kind = "instance.domain.removed")]
struct DomainRemoved {
    domain: String,
}

/// Custom domains of an instance, one row per domain.
struct InstanceDomains;

const DOMAINS: &str = "projections.instance_domains";

impl Projection for InstanceDomains {
    const NAME: &'static str = DOMAINS;

    fn table(&self) -> Table {
        Table::new(DOMAINS)
            .column(ColumnDef::new("instance_id", ColumnType::Text))
            .column(ColumnDef::new("domain", ColumnType::Text))
            .column(ColumnDef::new("is_generated", ColumnType::Bool))
            .column(ColumnDef::new("is_primary", ColumnType::Bool))
            .column(ColumnDef::new("sequence", ColumnType::Int64))
            .primary_key(["instance_id", "domain"])
            .instance_column("instance_id")
    }

    fn reducers(&self) -> Reducers<Self> {
        Reducers::new()
            .event::<DomainAdded>()
            .event::<PrimaryDomainSet>()
            .event::<DomainRemoved>()
    }
}

impl Reduce<DomainAdded> for InstanceDomains {
    fn reduce(&self, event: &Envelope<'_, DomainAdded>) -> Result<Statement> {
        Ok(Statement::create(
            event.event(),
            nonempty![
                Column::new("domain", &event.data().domain),
                Column::new("is_generated", event.data().generated),
                Column::new("is_primary", false),
                Column::new("sequence", Value::try_from(event.sequence())?),
            ],
        ))
    }
}

impl Reduce<PrimaryDomainSet> for InstanceDomains {
    fn reduce(&self, event: &Envelope<'_, PrimaryDomainSet>) -> Result<Statement> {
        let domain = &event.data().domain;
        Ok(Statement::no_op(event.event())
            .with(keel::statement::Operation::Update {
                values: NonEmpty::new(Column::new("is_primary", false)),
                conditions: vec![Condition::eq("is_primary", true)],
            })
            .with(keel::statement::Operation::Update {
                values: nonempty![
                    Column::new("is_primary", true),
                    Column::new("sequence", Value::try_from(event.sequence())?),
                ],
                conditions: vec![Condition::eq("domain", domain)],
            }))
    }
}

impl Reduce<DomainRemoved> for InstanceDomains {
    fn reduce(&self, event: &Envelope<'_, DomainRemoved>) -> Result<Statement> {
        Ok(Statement::delete(
            event.event(),
            vec![Condition::eq("domain", &event.data().domain)],
        ))
    }
}

fn added(instance: &str, domain: &str, generated: bool) -> PushCommand<DomainAdded> {
    PushCommand::new(
        instance,
        instance,
        DomainAdded {
            domain: domain.to_owned(),
            generated,
        },
    )
}

fn primary(instance: &str, domain: &str) -> PushCommand<PrimaryDomainSet> {
    PushCommand::new(
        instance,
        instance,
        PrimaryDomainSet {
            domain: domain.to_owned(),
        },
    )
}

#[tokio::test]
async fn primary_domain_moves_between_rows() {
    let rows = ReducerHarness::new(InstanceDomains, "i1")
        .given(&[
            &added("i1", "i1.keel.cloud", true),
            &added("i1", "login.acme.com", false),
            &primary("i1", "i1.keel.cloud"),
            &primary("i1", "login.acme.com"),
        ])
        .await
        .then_rows()
        .await;

    assert_eq!(rows.len(), 2);
    let primary: Vec<_> = rows
        .iter()
        .filter(|row| row["is_primary"] == Value::from(true))
        .collect();
    assert_eq!(primary.len(), 1);
    assert_eq!(primary[0]["domain"], Value::from("login.acme.com"));
    assert_eq!(primary[0]["sequence"], Value::Int(4));
}

#[tokio::test]
async fn removed_domains_disappear() {
    let rows = ReducerHarness::new(InstanceDomains, "i1")
        .given(&[&added("i1", "i1.keel.cloud", true), &added("i1", "old.acme.com", false)])
        .await
        .given(&[&PushCommand::new(
            "i1",
            "i1",
            DomainRemoved {
                domain: "old.acme.com".to_owned(),
            },
        )])
        .await
        .then_rows()
        .await;

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["is_generated"], Value::from(true));
}

#[tokio::test]
async fn instance_removal_clears_the_instance() {
    let harness = ReducerHarness::new(InstanceDomains, "i1")
        .given(&[&added("i1", "i1.keel.cloud", true)])
        .await;
    seed(harness.events(), harness.context(), &[&remove_instance("i1")]).await;

    let rows = harness.then_rows().await;

    assert!(rows.is_empty());
}

#[tokio::test]
async fn rows_carry_the_harness_instance() {
    let harness = ReducerHarness::new(InstanceDomains, "acme")
        .given(&[&added("acme", "acme.keel.cloud", true)])
        .await;

    let rows = harness.then_rows().await;

    assert_eq!(rows[0]["instance_id"], Value::from("acme"));
    assert_eq!(harness.context().instance_id(), "acme");
}

#[tokio::test]
async fn reducer_type_errors_surface() {
    #[derive(Serialize, Deserialize)]
    struct Malformed {
        domain: u64,
    }

    impl DomainEvent for Malformed {
        const AGGREGATE_TYPE: &'static str = "instance";
        const EVENT_TYPE: &'static str = "instance.domain.added";
    }

    let error = ReducerHarness::new(InstanceDomains, "i1")
        .given(&[&PushCommand::new("i1", "i1", Malformed { domain: 7 })])
        .await
        .then_error()
        .await;

    assert_eq!(error.kind(), ErrorKind::InvalidArgument);
}
