//! Per-call context: the tenant the call acts for and its deadline.

use std::{future::Future, time::Duration};

use tokio::time::Instant;

use crate::error::{Error, Result};

/// Carries the caller's instance (tenant) and an optional deadline.
///
/// Every store operation takes a `Context`; queries without an explicit
/// instance are scoped to [`Context::instance_id`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Context {
    instance_id: String,
    deadline: Option<Instant>,
}

impl Context {
    #[must_use]
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            deadline: None,
        }
    }

    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// The same deadline, acting for another instance.
    #[must_use]
    pub fn for_instance(&self, instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            deadline: self.deadline,
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Drive `fut` to completion, aborting it when the deadline passes.
    ///
    /// Dropping an in-flight transaction rolls it back, so an expired call
    /// leaves state as of the last commit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeadlineExceeded`] when the deadline elapses first,
    /// otherwise whatever `fut` returns.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| Error::DeadlineExceeded)?,
            None => fut.await,
        }
    }
}
