//! Handler registry shared by both transports.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{BusError, Message, TopicPattern};

/// Error type surfaced by subscription handlers.
///
/// Handler errors never reach producers; the consumer loop logs them and
/// moves on to the next handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed future returned by a subscription handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;

/// Subscription callback invoked with each matching message.
pub type Handler = Arc<dyn Fn(Message) -> HandlerFuture + Send + Sync>;

/// Wrap a plain async closure into a boxed [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |msg| Box::pin(f(msg)))
}

struct PatternEntry {
    pattern: TopicPattern,
    handlers: Vec<Handler>,
}

/// Pattern → ordered handler list, owned by exactly one transport.
///
/// Pattern insertion order and per-pattern registration order are both
/// preserved, which fixes fan-out order for a matched message. Mutated only
/// by `subscribe`, read only by the consumer loop;
/// [`matching`](SubscriptionTable::matching) returns a snapshot taken at
/// dequeue time, so subscriptions added mid-fan-out never affect the
/// in-flight message.
#[derive(Default)]
pub struct SubscriptionTable {
    entries: RwLock<Vec<PatternEntry>>,
}

impl SubscriptionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler` under `pattern`, creating the pattern entry on first use.
    pub fn insert(&self, pattern: &str, handler: Handler) -> Result<(), BusError> {
        let pattern = TopicPattern::new(pattern)?;
        let mut entries = self.entries.write();

        if let Some(entry) = entries.iter_mut().find(|e| e.pattern == pattern) {
            entry.handlers.push(handler);
        } else {
            entries.push(PatternEntry {
                pattern,
                handlers: vec![handler],
            });
        }
        Ok(())
    }

    /// Snapshot of every handler matching `topic`, in pattern-then-registration order.
    pub fn matching(&self, topic: &str) -> Vec<Handler> {
        let entries = self.entries.read();
        let mut matched = Vec::new();
        for entry in entries.iter() {
            if entry.pattern.matches(topic) {
                matched.extend(entry.handlers.iter().cloned());
            }
        }
        matched
    }

    /// Number of distinct registered patterns.
    pub fn pattern_count(&self) -> usize {
        self.entries.read().len()
    }
}

impl fmt::Debug for SubscriptionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read();
        let mut map = f.debug_map();
        for entry in entries.iter() {
            map.entry(&entry.pattern.as_str(), &entry.handlers.len());
        }
        map.finish()
    }
}

/// Fan `msg` out to every matching handler, isolating failures.
///
/// Handlers run sequentially and each is awaited to completion before the
/// next; a failing handler is logged and skipped. Both transports route all
/// deliveries through here so the isolation policy is uniform.
pub(crate) async fn dispatch(table: &SubscriptionTable, msg: &Message) {
    for handler in table.matching(&msg.topic) {
        if let Err(error) = handler(msg.clone()).await {
            tracing::warn!(topic = %msg.topic, %error, "subscription handler failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    use crate::message::fields;

    fn recording_handler(seen: Arc<Mutex<Vec<String>>>, tag: &str) -> Handler {
        let tag = tag.to_string();
        handler(move |msg| {
            let seen = Arc::clone(&seen);
            let tag = tag.clone();
            async move {
                seen.lock().push(format!("{tag}:{}", msg.topic));
                Ok::<(), HandlerError>(())
            }
        })
    }

    #[test]
    fn test_insert_rejects_empty_pattern() {
        let table = SubscriptionTable::new();
        let result = table.insert("", handler(|_| async { Ok::<(), HandlerError>(()) }));
        assert!(result.is_err());
        assert_eq!(table.pattern_count(), 0);
    }

    #[test]
    fn test_matching_respects_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let table = SubscriptionTable::new();
        table
            .insert("story.*", recording_handler(Arc::clone(&seen), "first"))
            .unwrap();
        table
            .insert("story.created", recording_handler(Arc::clone(&seen), "exact"))
            .unwrap();
        table
            .insert("story.*", recording_handler(Arc::clone(&seen), "second"))
            .unwrap();

        let matched = table.matching("story.created");
        assert_eq!(matched.len(), 3);
        assert_eq!(table.pattern_count(), 2);

        assert!(table.matching("saga.started").is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_isolates_handler_failures() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let table = SubscriptionTable::new();

        table
            .insert(
                "saga.*",
                handler(|_| async { Err::<(), HandlerError>("boom".into()) }),
            )
            .unwrap();
        table
            .insert("saga.*", recording_handler(Arc::clone(&seen), "after"))
            .unwrap();

        let msg = Message::new("saga.started", fields(json!({ "saga_id": "s1" }))).unwrap();
        dispatch(&table, &msg).await;

        assert_eq!(seen.lock().as_slice(), ["after:saga.started"]);
    }

    #[tokio::test]
    async fn test_dispatch_fans_out_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let table = SubscriptionTable::new();
        table
            .insert("story.*", recording_handler(Arc::clone(&seen), "a"))
            .unwrap();
        table
            .insert("story.*", recording_handler(Arc::clone(&seen), "b"))
            .unwrap();

        let msg = Message::new("story.updated", fields(json!({}))).unwrap();
        dispatch(&table, &msg).await;

        assert_eq!(
            seen.lock().as_slice(),
            ["a:story.updated", "b:story.updated"]
        );
    }
}
