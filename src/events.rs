//! Cross-component event hub
//!
//! The hub fans model-changed events out to named handlers. Each handler
//! owns a bounded pending queue drained by a dedicated task; publishing
//! never blocks the producer. A full queue drops the event - the producers
//! (the store, the scheduler) will publish again on the next mutation and
//! reconciliation is idempotent, so a dropped event only delays a pass.

use std::fmt;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A model-changed notification fanned out to registered handlers.
#[derive(Clone, Debug)]
pub struct ModelEvent {
    /// Name of the model that changed.
    pub model_name: String,
    /// Version the change applies to.
    pub version: u32,
}

impl fmt::Display for ModelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.model_name, self.version)
    }
}

/// Fan-out hub for model events.
///
/// Handlers register under a name with a queue size; each registration
/// spawns a drain task that invokes the handler closure per event.
#[derive(Default)]
pub struct EventHub {
    senders: Mutex<Vec<(String, mpsc::Sender<ModelEvent>)>>,
}

impl EventHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named model-event handler with a bounded pending queue.
    ///
    /// Must be called from within a tokio runtime: the drain task is
    /// spawned immediately.
    pub fn register_model_event_handler<F>(&self, name: &str, queue_size: usize, handler: F)
    where
        F: Fn(ModelEvent) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel(queue_size);
        self.senders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((name.to_string(), tx));

        let handler_name = name.to_string();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handler(event);
            }
            debug!(handler = %handler_name, "event handler stopped");
        });
    }

    /// Publish a model event to every registered handler.
    ///
    /// Non-blocking: a handler whose queue is full misses this event.
    pub fn publish_model_event(&self, source: &str, event: ModelEvent) {
        let senders = self.senders.lock().unwrap_or_else(|e| e.into_inner());
        for (name, tx) in senders.iter() {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        handler = %name,
                        source = %source,
                        event = %event,
                        "pending event queue full, dropping event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(handler = %name, source = %source, "event handler gone");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn registered_handler_receives_published_events() {
        let hub = EventHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        hub.register_model_event_handler("test.handler", 10, move |event| {
            tx.send(event.model_name).unwrap();
        });

        hub.publish_model_event(
            "test",
            ModelEvent {
                model_name: "m1".to_string(),
                version: 1,
            },
        );
        hub.publish_model_event(
            "test",
            ModelEvent {
                model_name: "m2".to_string(),
                version: 3,
            },
        );

        assert_eq!(rx.recv().await.unwrap(), "m1");
        assert_eq!(rx.recv().await.unwrap(), "m2");
    }

    #[tokio::test]
    async fn publish_without_handlers_is_a_no_op() {
        let hub = EventHub::new();
        hub.publish_model_event(
            "test",
            ModelEvent {
                model_name: "m1".to_string(),
                version: 1,
            },
        );
    }

    #[tokio::test]
    async fn every_handler_sees_each_event() {
        let hub = EventHub::new();
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        for _ in 0..3 {
            let count = count.clone();
            hub.register_model_event_handler("counting", 10, move |_| {
                count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            });
        }

        hub.publish_model_event(
            "test",
            ModelEvent {
                model_name: "m1".to_string(),
                version: 1,
            },
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let hub = EventHub::new();
        let processed = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let handler_processed = processed.clone();
        hub.register_model_event_handler("slow", 1, move |_| {
            handler_processed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        // The drain task never runs between these publishes (no await
        // point), so the single-slot queue fills after the first event and
        // the rest are dropped rather than blocking the publisher.
        for i in 0..32 {
            hub.publish_model_event(
                "test",
                ModelEvent {
                    model_name: format!("m{i}"),
                    version: 1,
                },
            );
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(processed.load(std::sync::atomic::Ordering::SeqCst) < 32);
    }
}
