use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use shared::MultiError;
use tokio::sync::Mutex;

/// One destination stream at an event-style sink.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopedDestination {
    pub peer_name: String,
    pub destination: String,
    pub partition_key: Option<String>,
}

impl fmt::Display for ScopedDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.partition_key {
            Some(key) => write!(f, "{}/{}[{}]", self.peer_name, self.destination, key),
            None => write!(f, "{}/{}", self.peer_name, self.destination),
        }
    }
}

/// The seam a vendor producer client plugs into. Sends one batch to one
/// destination; per-destination append order equals send order.
#[async_trait]
pub trait EventSender: Send + Sync {
    async fn send(&self, destination: &ScopedDestination, events: Vec<String>)
        -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
struct EventBatch {
    events: Vec<String>,
    num_bytes: usize,
}

impl EventBatch {
    fn try_add(&mut self, event: &str, max_batch_bytes: usize) -> bool {
        let projected = self.num_bytes + event.len();
        if !self.events.is_empty() && projected > max_batch_bytes {
            return false;
        }
        self.num_bytes = projected;
        self.events.push(event.to_string());
        true
    }
}

/// Size-bounded, per-destination batching with automatic flush. A given
/// event is added to exactly one batch; `flush_all` drains everything in
/// parallel and clears internal state.
pub struct EventBatches<S: EventSender> {
    batches: Mutex<HashMap<ScopedDestination, EventBatch>>,
    sender: Arc<S>,
    max_batch_bytes: usize,
}

impl<S: EventSender + 'static> EventBatches<S> {
    pub fn new(sender: Arc<S>, max_batch_bytes: usize) -> Self {
        Self {
            batches: Mutex::new(HashMap::new()),
            sender,
            max_batch_bytes: max_batch_bytes.max(1),
        }
    }

    /// Appends an event. On overflow the full batch is sent synchronously
    /// and the append retried against a fresh batch.
    pub async fn add_event(
        &self,
        destination: ScopedDestination,
        event: String,
    ) -> anyhow::Result<()> {
        let full = {
            let mut batches = self.batches.lock().await;
            let batch = batches.entry(destination.clone()).or_default();
            if batch.try_add(&event, self.max_batch_bytes) {
                return Ok(());
            }
            batches.remove(&destination).unwrap_or_default()
        };

        tracing::info!(destination = %destination, "event batch full, sending early");
        self.sender.send(&destination, full.events).await?;

        let mut batches = self.batches.lock().await;
        let batch = batches.entry(destination).or_default();
        batch.try_add(&event, self.max_batch_bytes);
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.batches.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.batches.lock().await.is_empty()
    }

    /// Drains all batches with at most `max_parallelism` concurrent sends
    /// and returns the number of events flushed. Partial failure surfaces
    /// as a joined error; successful sends are not rolled back.
    pub async fn flush_all(&self, max_parallelism: usize) -> anyhow::Result<u64> {
        let drained: Vec<(ScopedDestination, EventBatch)> = {
            let mut batches = self.batches.lock().await;
            batches.drain().collect()
        };

        if drained.is_empty() {
            tracing::info!("no events to send");
            return Ok(0);
        }

        let sender = self.sender.clone();
        let results = stream::iter(drained)
            .map(|(destination, batch)| {
                let sender = sender.clone();
                async move {
                    let num_events = batch.events.len() as u64;
                    sender
                        .send(&destination, batch.events)
                        .await
                        .map(|_| {
                            tracing::info!(
                                destination = %destination,
                                "pushed {num_events} events"
                            );
                            num_events
                        })
                        .map_err(|err| err.context(format!("flush to {destination} failed")))
                }
            })
            .buffer_unordered(max_parallelism.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut flushed = 0u64;
        let mut errors = MultiError::new();
        for result in results {
            match result {
                Ok(n) => flushed += n,
                Err(err) => errors.push(err),
            }
        }

        if errors.is_empty() {
            Ok(flushed)
        } else {
            Err(anyhow::anyhow!("{errors}"))
        }
    }

    pub async fn clear(&self) {
        self.batches.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<HashMap<ScopedDestination, Vec<Vec<String>>>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fail_destination: Option<String>,
    }

    #[async_trait]
    impl EventSender for RecordingSender {
        async fn send(
            &self,
            destination: &ScopedDestination,
            events: Vec<String>,
        ) -> anyhow::Result<()> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail_destination.as_deref() == Some(destination.destination.as_str()) {
                anyhow::bail!("send refused");
            }
            self.sent
                .lock()
                .await
                .entry(destination.clone())
                .or_default()
                .push(events);
            Ok(())
        }
    }

    fn dest(name: &str) -> ScopedDestination {
        ScopedDestination {
            peer_name: "hub".to_string(),
            destination: name.to_string(),
            partition_key: None,
        }
    }

    #[tokio::test]
    async fn overflow_sends_full_batch_and_retries() {
        let sender = Arc::new(RecordingSender::default());
        let batches = EventBatches::new(sender.clone(), 8);
        batches.add_event(dest("t"), "aaaa".into()).await.unwrap();
        batches.add_event(dest("t"), "bbbb".into()).await.unwrap();
        // 9 bytes projected: previous batch flushes, event lands in a new one
        batches.add_event(dest("t"), "c".into()).await.unwrap();

        let sent = sender.sent.lock().await;
        let flushed = sent.get(&dest("t")).unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0], vec!["aaaa".to_string(), "bbbb".to_string()]);
        drop(sent);

        let total = batches.flush_all(4).await.unwrap();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn flush_clears_state_and_counts_events() {
        let sender = Arc::new(RecordingSender::default());
        let batches = EventBatches::new(sender.clone(), 1024);
        for i in 0..10 {
            batches
                .add_event(dest(&format!("t{}", i % 3)), format!("e{i}"))
                .await
                .unwrap();
        }
        let total = batches.flush_all(4).await.unwrap();
        assert_eq!(total, 10);
        assert!(batches.is_empty().await);
        assert_eq!(batches.flush_all(4).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn per_destination_order_is_preserved() {
        let sender = Arc::new(RecordingSender::default());
        let batches = EventBatches::new(sender.clone(), 4);
        for i in 0..6 {
            batches.add_event(dest("t"), format!("e{i}")).await.unwrap();
        }
        batches.flush_all(1).await.unwrap();

        let sent = sender.sent.lock().await;
        let all: Vec<String> = sent
            .get(&dest("t"))
            .unwrap()
            .iter()
            .flatten()
            .cloned()
            .collect();
        assert_eq!(all, vec!["e0", "e1", "e2", "e3", "e4", "e5"]);
    }

    #[tokio::test]
    async fn partial_failure_is_joined_but_successes_stick() {
        let sender = Arc::new(RecordingSender {
            fail_destination: Some("bad".to_string()),
            ..Default::default()
        });
        let batches = EventBatches::new(sender.clone(), 1024);
        batches.add_event(dest("good"), "x".into()).await.unwrap();
        batches.add_event(dest("bad"), "y".into()).await.unwrap();

        let err = batches.flush_all(4).await.unwrap_err();
        assert!(err.to_string().contains("bad"), "got: {err:#}");
        let sent = sender.sent.lock().await;
        assert!(sent.contains_key(&dest("good")));
        drop(sent);
        assert!(batches.is_empty().await);
    }

    #[tokio::test]
    async fn flush_respects_parallelism_cap() {
        let sender = Arc::new(RecordingSender::default());
        let batches = EventBatches::new(sender.clone(), 1024);
        for i in 0..8 {
            batches
                .add_event(dest(&format!("t{i}")), "e".into())
                .await
                .unwrap();
        }
        batches.flush_all(2).await.unwrap();
        assert!(sender.max_in_flight.load(Ordering::SeqCst) <= 2);
    }
}
