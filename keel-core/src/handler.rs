//! Projection catch-up.
//!
//! A [`Handler`] keeps one projection's table current. For every
//! `(instance, aggregate type)` it reads the watermark, fetches the next
//! events of the registered types, reduces them and applies the statements
//! together with the new watermark. [`Handler::start`] runs that loop in the
//! background, woken by commit notifications and a requeue ticker.
//!
//! # Example
//!
//! ```ignore
//! let handler = Handler::new(UserProjection, store.clone(), sink, HandlerConfig::default())?;
//! handler.trigger(&Context::new("i1")).await?;
//!
//! let running = handler.start();
//! // ...
//! running.stop().await?;
//! ```

use std::{sync::Arc, time::Duration};

use serde::Deserialize;
use tokio::{
    sync::{OnceCell, oneshot},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_stream::StreamExt as _;

use crate::{
    concurrency::RetryPolicy,
    context::Context,
    error::{Error, Result},
    event::Event,
    instance::{self, InstanceRemoved},
    projection::{Projection, ProjectionStore, ReducerRegistry, Table, WatermarkKey},
    query::SearchQuery,
    statement::{Applied, Condition, Statement, StatementBatch},
    store::EventStore,
    subscription::SubscribableStore,
};

/// Handler tuning.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Maximum events fetched and applied per transaction.
    pub bulk_limit: u32,
    /// Interval of the background catch-up over all instances.
    pub requeue_every: Duration,
    /// Deadline of one background trigger.
    pub trigger_timeout: Duration,
    /// Retries of batches the projection store aborted.
    pub retry: RetryPolicy,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            bulk_limit: 200,
            requeue_every: Duration::from_secs(60),
            trigger_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl HandlerConfig {
    #[must_use]
    pub const fn with_bulk_limit(mut self, bulk_limit: u32) -> Self {
        self.bulk_limit = bulk_limit;
        self
    }

    #[must_use]
    pub const fn with_requeue_every(mut self, requeue_every: Duration) -> Self {
        self.requeue_every = requeue_every;
        self
    }

    #[must_use]
    pub const fn with_trigger_timeout(mut self, trigger_timeout: Duration) -> Self {
        self.trigger_timeout = trigger_timeout;
        self
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// What one trigger did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TriggerReport {
    /// Transactions committed.
    pub batches: usize,
    /// Events fetched from the store.
    pub events: usize,
    /// Statements applied.
    pub statements: usize,
    /// Statements skipped because the watermark was already past them.
    pub skipped: usize,
}

impl TriggerReport {
    fn add(&mut self, events: usize, applied: Applied) {
        self.batches += 1;
        self.events += events;
        self.statements += applied.statements;
        self.skipped += applied.skipped;
    }

    fn merge(&mut self, other: Self) {
        self.batches += other.batches;
        self.events += other.events;
        self.statements += other.statements;
        self.skipped += other.skipped;
    }
}

/// Drives one projection from an event store into a projection store.
pub struct Handler<P, S, W> {
    inner: Arc<Inner<P, S, W>>,
}

struct Inner<P, S, W> {
    projection: P,
    registry: ReducerRegistry<P>,
    /// Aggregate types in processing order, instance lifecycle last.
    aggregate_types: Vec<&'static str>,
    table: Table,
    store: S,
    sink: W,
    config: HandlerConfig,
    prepared: OnceCell<()>,
}

impl<P, S, W> Clone for Handler<P, S, W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P, S, W> Handler<P, S, W>
where
    P: Projection,
    S: EventStore,
    W: ProjectionStore,
{
    /// Validate the projection and build its reducer registry.
    ///
    /// Every handler reduces [`InstanceRemoved`] into a delete of the
    /// instance's rows unless the projection registers its own reducer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an invalid table, an empty
    /// registry or a reducer registered twice.
    pub fn new(projection: P, store: S, sink: W, config: HandlerConfig) -> Result<Self> {
        if config.bulk_limit == 0 {
            return Err(Error::invalid_argument("bulk limit must be positive"));
        }
        let table = projection.table();
        table.validate()?;

        let mut reducers = projection.reducers();
        if !reducers.contains::<InstanceRemoved>() {
            let instance_column = table.instance_column_name().to_owned();
            reducers = reducers.event_with::<InstanceRemoved, _>(move |_, removed| {
                Ok(Statement::delete(
                    removed.event(),
                    vec![Condition::eq(instance_column.as_str(), removed.instance_id())],
                ))
            });
        }
        let registry = reducers.build()?;

        let mut aggregate_types: Vec<&'static str> = registry.event_types().keys().copied().collect();
        aggregate_types.sort_by_key(|aggregate_type| *aggregate_type == instance::AGGREGATE_TYPE);

        Ok(Self {
            inner: Arc::new(Inner {
                projection,
                registry,
                aggregate_types,
                table,
                store,
                sink,
                config,
                prepared: OnceCell::new(),
            }),
        })
    }

    pub fn table(&self) -> &Table {
        &self.inner.table
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn sink(&self) -> &W {
        &self.inner.sink
    }

    /// Registered aggregate types in processing order.
    pub(crate) fn aggregate_types(&self) -> &[&'static str] {
        &self.inner.aggregate_types
    }

    pub(crate) fn event_types(&self, aggregate_type: &str) -> Vec<&'static str> {
        self.inner
            .registry
            .event_types()
            .get(aggregate_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether events of `aggregate_type` concern this projection.
    #[must_use]
    pub fn handles(&self, aggregate_type: &str) -> bool {
        self.inner.registry.handles(aggregate_type)
    }

    /// Bring the projection up to date for the context's instance.
    ///
    /// Runs until every registered aggregate type returns a short batch.
    /// The whole run is bounded by the context's deadline.
    ///
    /// # Errors
    ///
    /// Returns the first reduce, validation or storage error. Batches
    /// committed before the error stay committed; the failing batch left its
    /// watermark untouched.
    #[tracing::instrument(skip(self, ctx), fields(projection = P::NAME, instance_id = ctx.instance_id()))]
    pub async fn trigger(&self, ctx: &Context) -> Result<TriggerReport> {
        ctx.run(async {
            self.prepare().await?;
            let mut report = TriggerReport::default();
            for &aggregate_type in &self.inner.aggregate_types {
                report.merge(self.catch_up(ctx, aggregate_type).await?);
            }
            if report.batches > 0 {
                tracing::debug!(?report, "projection advanced");
            }
            Ok(report)
        })
        .await
    }

    /// [`trigger`](Self::trigger) every instance that has events.
    ///
    /// Each instance gets its own deadline of
    /// [`HandlerConfig::trigger_timeout`]. A failing instance does not stop
    /// the others.
    ///
    /// # Errors
    ///
    /// Returns the first error after all instances were tried.
    pub async fn trigger_all(&self) -> Result<TriggerReport> {
        let query = SearchQuery::builder()
            .all_instances()
            .aggregate_types(self.inner.aggregate_types.iter().copied())
            .build()?;
        let system = Context::new("").with_timeout(self.inner.config.trigger_timeout);
        let instances = self.inner.store.instance_ids(&system, &query).await?;

        let mut report = TriggerReport::default();
        let mut first_error = None;
        for instance_id in instances {
            let ctx = Context::new(instance_id).with_timeout(self.inner.config.trigger_timeout);
            match self.trigger(&ctx).await {
                Ok(instance_report) => report.merge(instance_report),
                Err(error) => {
                    tracing::error!(
                        projection = P::NAME,
                        instance_id = ctx.instance_id(),
                        %error,
                        "projection trigger failed"
                    );
                    first_error.get_or_insert(error);
                }
            }
        }
        first_error.map_or(Ok(report), Err)
    }

    /// Catch up every instance, logging a failure instead of returning it.
    async fn requeue(&self) {
        if let Err(error) = self.trigger_all().await {
            tracing::warn!(projection = P::NAME, %error, "requeued trigger failed");
        }
    }

    async fn prepare(&self) -> Result<()> {
        self.inner
            .prepared
            .get_or_try_init(|| self.inner.sink.prepare(&self.inner.table))
            .await
            .map(|_| ())
    }

    async fn catch_up(&self, ctx: &Context, aggregate_type: &'static str) -> Result<TriggerReport> {
        let inner = &self.inner;
        let instance_id = ctx.instance_id();
        let key = WatermarkKey::new(P::NAME, instance_id, aggregate_type);
        let event_types = self.event_types(aggregate_type);

        let mut report = TriggerReport::default();
        loop {
            let watermark = inner.sink.watermark(&key).await?;
            let query = SearchQuery::builder()
                .instance_id(instance_id)
                .aggregate_types([aggregate_type])
                .event_types(event_types.iter().copied())
                .aggregate_type_sequence_greater(watermark)
                .limit(inner.config.bulk_limit)
                .build()?;
            let events = inner.store.filter(ctx, &query).await?;
            let Some(last) = events.last() else {
                break;
            };

            let batch = StatementBatch {
                projection: P::NAME.to_owned(),
                instance_id: instance_id.to_owned(),
                aggregate_type: aggregate_type.to_owned(),
                statements: self.reduce(&events)?,
                watermark: last.aggregate_type_sequence,
            };
            let applied = self.apply(batch).await?;
            tracing::trace!(
                aggregate_type,
                events = events.len(),
                watermark = applied.watermark,
                "batch applied"
            );
            report.add(events.len(), applied);

            if events.len() < inner.config.bulk_limit as usize {
                break;
            }
        }
        Ok(report)
    }

    pub(crate) fn reduce(&self, events: &[Event]) -> Result<Vec<Statement>> {
        events
            .iter()
            .map(|event| {
                self.inner
                    .registry
                    .reduce(&self.inner.projection, event)
                    .map(|statement| statement.unwrap_or_else(|| Statement::no_op(event)))
            })
            .collect()
    }

    async fn apply(&self, batch: StatementBatch) -> Result<Applied> {
        let retry = self.inner.config.retry;
        let mut attempt = 1;
        loop {
            match self.inner.sink.apply(&self.inner.table, batch.clone()).await {
                Err(error) if error.is_retryable() && retry.should_retry(attempt) => {
                    let delay = retry.backoff(attempt);
                    tracing::warn!(%error, attempt, ?delay, "statement batch aborted, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

impl<P, S, W> Handler<P, S, W>
where
    P: Projection,
    S: SubscribableStore + 'static,
    W: ProjectionStore + 'static,
{
    /// Spawn the background loop.
    ///
    /// The loop catches up every instance once at start and then on every
    /// requeue tick, and triggers single instances when a notification
    /// names an aggregate type this projection handles. Errors are logged
    /// and retried on the next wake-up.
    #[must_use]
    pub fn start(&self) -> HandlerHandle {
        let handler = self.clone();
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let config = handler.inner.config;
            let mut notifications = handler.inner.store.notifications();
            let mut live = true;
            let mut requeue = tokio::time::interval(config.requeue_every);
            requeue.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => {
                        tracing::debug!(projection = P::NAME, "handler stopped");
                        break;
                    }
                    _ = requeue.tick() => handler.requeue().await,
                    notification = notifications.next(), if live => {
                        let Some(notification) = notification else {
                            tracing::debug!(projection = P::NAME, "notifications ended, polling only");
                            live = false;
                            continue;
                        };
                        if !handler.handles(&notification.aggregate_type) {
                            continue;
                        }
                        let ctx = Context::new(notification.instance_id)
                            .with_timeout(config.trigger_timeout);
                        if let Err(error) = handler.trigger(&ctx).await {
                            tracing::error!(
                                projection = P::NAME,
                                instance_id = ctx.instance_id(),
                                %error,
                                "projection trigger failed"
                            );
                        }
                    }
                }
            }
        });

        HandlerHandle {
            stop_tx: Some(stop_tx),
            task,
        }
    }
}

/// Handle to a running handler loop.
///
/// Dropping the handle does **not** stop the loop. Call
/// [`stop()`](HandlerHandle::stop) for a graceful shutdown.
pub struct HandlerHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl HandlerHandle {
    /// Stop the loop and wait for the in-flight trigger to finish.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the loop panicked.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        self.task
            .await
            .map_err(|error| Error::internal("handler task panicked", error))
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}
