use keel_core::concurrency::RetryPolicy;
use serde::Deserialize;

/// Settings of the `PostgreSQL` event store.
///
/// Deserializes with defaults for every missing field:
///
/// ```
/// let config: keel_postgres::Config =
///     serde_json::from_str(r#"{ "editor_service": "admin-api" }"#).unwrap();
/// assert!(config.notify);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Recorded on every pushed event.
    pub editor_service: String,
    /// Retries of push transactions aborted by serialization failures.
    pub push_retry: RetryPolicy,
    /// Emit `pg_notify` on commit so handlers wake up early.
    pub notify: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            editor_service: "keel".to_owned(),
            push_retry: RetryPolicy::default(),
            notify: true,
        }
    }
}

impl Config {
    #[must_use]
    pub fn with_editor_service(mut self, editor_service: impl Into<String>) -> Self {
        self.editor_service = editor_service.into();
        self
    }

    #[must_use]
    pub const fn with_push_retry(mut self, push_retry: RetryPolicy) -> Self {
        self.push_retry = push_retry;
        self
    }

    #[must_use]
    pub const fn with_notify(mut self, notify: bool) -> Self {
        self.notify = notify;
        self
    }
}
