use std::sync::Arc;

use keel_core::subscription::Notification;
use serde::Deserialize;
use sqlx::postgres::PgListener;
use tokio::{
    sync::{Mutex, broadcast},
    task::JoinHandle,
};

use super::EVENTS_NOTIFY_CHANNEL;
use crate::Error;

const LIVE_BUFFER_CAPACITY: usize = 1024;

/// Forwards `keel_events` notifications from one shared listener connection
/// to every subscriber.
#[derive(Clone)]
pub(in crate::store) struct LivePump {
    inner: Arc<LivePumpInner>,
}

struct LivePumpInner {
    pool: sqlx::PgPool,
    sender: broadcast::Sender<Notification>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Deserialize)]
struct NotificationPayload {
    instance_id: String,
    aggregate_type: String,
}

impl LivePump {
    #[must_use]
    pub(in crate::store) fn new(pool: sqlx::PgPool) -> Self {
        let (sender, _) = broadcast::channel(LIVE_BUFFER_CAPACITY);
        Self {
            inner: Arc::new(LivePumpInner {
                pool,
                sender,
                task: Mutex::new(None),
            }),
        }
    }

    pub(in crate::store) async fn subscribe(&self) -> broadcast::Receiver<Notification> {
        // Subscribe before starting so nothing sent by a fresh pump is missed.
        let receiver = self.inner.sender.subscribe();
        self.ensure_running().await;
        receiver
    }

    /// Start the listener task, or restart it after it gave up.
    async fn ensure_running(&self) {
        let mut task_guard = self.inner.task.lock().await;
        if task_guard.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let pool = self.inner.pool.clone();
        let sender = self.inner.sender.clone();
        *task_guard = Some(tokio::spawn(run_live_pump(pool, sender)));
    }
}

async fn run_live_pump(pool: sqlx::PgPool, sender: broadcast::Sender<Notification>) {
    let mut listener = match PgListener::connect_with(&pool).await {
        Ok(listener) => listener,
        Err(error) => {
            tracing::error!("live pump failed to connect listener: {error}");
            return;
        }
    };

    if let Err(error) = listener.listen(EVENTS_NOTIFY_CHANNEL).await {
        tracing::error!("live pump failed to listen on channel: {error}");
        return;
    }

    loop {
        let notification = match listener.recv().await {
            Ok(notification) => notification,
            Err(error) => {
                tracing::error!("live pump listener receive failed: {error}");
                return;
            }
        };
        match decode_notification(notification.payload()) {
            // No receivers is fine; consumers poll on their own schedule too.
            Ok(notification) => {
                let _ = sender.send(notification);
            }
            Err(error) => tracing::warn!("ignoring malformed notification: {error}"),
        }
    }
}

pub(in crate::store) fn decode_notification(payload: &str) -> Result<Notification, Error> {
    let NotificationPayload {
        instance_id,
        aggregate_type,
    } = serde_json::from_str(payload).map_err(|error| Error::Deserialization(Box::new(error)))?;
    Ok(Notification {
        instance_id,
        aggregate_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_payload_decodes() {
        let notification =
            decode_notification(r#"{"instance_id":"i1","aggregate_type":"user"}"#).unwrap();

        assert_eq!(
            notification,
            Notification {
                instance_id: "i1".to_owned(),
                aggregate_type: "user".to_owned(),
            }
        );
    }

    #[test]
    fn malformed_payload_is_rejected() {
        assert!(matches!(
            decode_notification("42"),
            Err(Error::Deserialization(_))
        ));
    }
}
