//! Command-side orchestration.
//!
//! [`Repository`] loads a [`WriteModel`] from the store, lets the caller
//! decide which events to push, and pushes them with the loaded sequence as
//! the expected sequence. Conflicting writers and aborted transactions are
//! retried from a fresh load.

use crate::{
    aggregate::{Aggregate, WriteModel},
    concurrency::RetryPolicy,
    context::Context,
    error::{Error, Result},
    event::{Command, Event},
    query::SearchQuery,
    store::EventStore,
    unique::UniqueConstraint,
};

/// A write model together with the position it was loaded at.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Loaded<M> {
    pub state: M,
    /// Sequence of the aggregate's latest event; 0 if it has none.
    pub sequence: u64,
    /// Owner recorded on the aggregate's latest event.
    pub resource_owner: String,
}

impl<M> Loaded<M> {
    /// Whether the aggregate has no events yet.
    #[must_use]
    pub const fn is_new(&self) -> bool {
        self.sequence == 0
    }
}

/// Loads write models and pushes decided commands.
#[derive(Clone, Debug)]
pub struct Repository<S> {
    store: S,
    retry: RetryPolicy,
}

impl<S> Repository<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub const fn store(&self) -> &S {
        &self.store
    }
}

impl<S: EventStore> Repository<S> {
    /// Rebuild `M` for aggregate `id` of the context instance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the aggregate has no events, or the
    /// first error of the store or of [`WriteModel::reduce`].
    pub async fn load<M: WriteModel>(&self, ctx: &Context, id: &str) -> Result<Loaded<M>> {
        let loaded = self.load_or_default::<M>(ctx, id).await?;
        if loaded.is_new() {
            return Err(Error::not_found(format!(
                "{} {id} not found in instance {}",
                M::AGGREGATE_TYPE,
                ctx.instance_id()
            )));
        }
        Ok(loaded)
    }

    /// Like [`load`](Self::load), but an aggregate without events yields
    /// the default state at sequence 0.
    ///
    /// # Errors
    ///
    /// Store and reduce errors.
    #[tracing::instrument(skip(self, ctx), fields(instance_id = ctx.instance_id(), aggregate_type = M::AGGREGATE_TYPE))]
    pub async fn load_or_default<M: WriteModel>(
        &self,
        ctx: &Context,
        id: &str,
    ) -> Result<Loaded<M>> {
        // Every event is read so `sequence` is the aggregate's head even when
        // the model only reduces some types.
        let query = SearchQuery::builder()
            .aggregate_types([M::AGGREGATE_TYPE])
            .aggregate_ids([id])
            .build()?;
        let events = self.store.filter(ctx, &query).await?;

        let wanted = M::event_types();
        let mut loaded = Loaded::<M>::default();
        for event in &events {
            if !event.aggregate.resource_owner.is_empty() {
                loaded.resource_owner.clone_from(&event.aggregate.resource_owner);
            }
            if wanted.is_empty() || wanted.contains(&event.event_type.as_str()) {
                loaded.state.reduce(event)?;
            }
            loaded.sequence = loaded.sequence.max(event.sequence);
        }
        tracing::trace!(events = events.len(), sequence = loaded.sequence, "write model loaded");
        Ok(loaded)
    }

    /// Load `M`, call `decide` and push its commands.
    ///
    /// The first command addressing the loaded aggregate is pushed with the
    /// loaded sequence as its expected sequence. When the push reports a
    /// retryable error the model is reloaded and `decide` runs again, up to
    /// the configured [`RetryPolicy`]. An empty decision pushes nothing.
    ///
    /// # Errors
    ///
    /// Returns the error of `decide`, the last retryable error once the
    /// policy is exhausted, or any non-retryable store error.
    #[tracing::instrument(skip(self, ctx, decide), fields(instance_id = ctx.instance_id(), aggregate_type = M::AGGREGATE_TYPE))]
    pub async fn execute<M, F>(&self, ctx: &Context, id: &str, mut decide: F) -> Result<Vec<Event>>
    where
        M: WriteModel,
        F: FnMut(&Loaded<M>) -> Result<Vec<Box<dyn Command>>> + Send,
    {
        let mut attempt = 1;
        loop {
            let loaded = self.load_or_default::<M>(ctx, id).await?;
            let commands = decide(&loaded)?;
            if commands.is_empty() {
                return Ok(Vec::new());
            }

            let first_own = commands.iter().position(|command| {
                let aggregate = command.aggregate();
                aggregate.aggregate_type == M::AGGREGATE_TYPE && aggregate.id == id
            });
            let expecting: Vec<Expecting<'_>> = commands
                .iter()
                .enumerate()
                .map(|(index, command)| Expecting {
                    inner: command.as_ref(),
                    expected: (Some(index) == first_own).then_some(loaded.sequence),
                })
                .collect();
            let refs: Vec<&dyn Command> = expecting.iter().map(|c| c as &dyn Command).collect();

            match self.store.push(ctx, &refs).await {
                Ok(events) => return Ok(events),
                Err(error) if error.is_retryable() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.backoff(attempt);
                    tracing::warn!(%error, attempt, ?delay, "push rejected, reloading");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// Overrides the expected sequence of a borrowed command.
struct Expecting<'a> {
    inner: &'a dyn Command,
    expected: Option<u64>,
}

impl Command for Expecting<'_> {
    fn aggregate(&self) -> &Aggregate {
        self.inner.aggregate()
    }

    fn event_type(&self) -> &str {
        self.inner.event_type()
    }

    fn creator(&self) -> &str {
        self.inner.creator()
    }

    fn payload(&self) -> Result<Option<serde_json::Value>, serde_json::Error> {
        self.inner.payload()
    }

    fn unique_constraints(&self) -> Vec<UniqueConstraint> {
        self.inner.unique_constraints()
    }

    fn expected_sequence(&self) -> Option<u64> {
        self.expected.or_else(|| self.inner.expected_sequence())
    }
}
