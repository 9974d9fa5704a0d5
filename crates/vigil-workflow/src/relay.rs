use std::sync::Mutex;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use vigil_core::RunEvent;

/// Fans one engine event sequence out to any number of consumers.
///
/// Each subscriber gets a bounded channel. `pump` awaits every send, so a slow
/// subscriber slows the run down instead of losing events.
#[derive(Default)]
pub struct EventRelay {
    sinks: Mutex<Vec<mpsc::Sender<RunEvent>>>,
}

impl EventRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, capacity: usize) -> ReceiverStream<RunEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        ReceiverStream::new(rx)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sinks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Forward every event to every live subscriber, in order.
    ///
    /// Returns the last event seen, which for an engine stream is the
    /// terminal (or suspension) event.
    pub async fn pump<S>(&self, mut events: S) -> Option<RunEvent>
    where
        S: Stream<Item = RunEvent> + Unpin,
    {
        let mut last = None;
        while let Some(event) = events.next().await {
            let sinks: Vec<_> = self
                .sinks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();

            let mut closed = 0;
            for sink in &sinks {
                if sink.send(event.clone()).await.is_err() {
                    closed += 1;
                }
            }
            if closed > 0 {
                debug!(closed, "Pruning closed relay subscribers");
                self.sinks
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .retain(|s| !s.is_closed());
            }
            last = Some(event);
        }
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::types::RunId;

    fn events(n: usize) -> Vec<RunEvent> {
        let run_id = RunId::from_string("r");
        (0..n)
            .map(|i| RunEvent::StepStarted {
                run_id: run_id.clone(),
                step_id: format!("s{}", i),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_every_event() {
        let relay = EventRelay::new();
        let a = relay.subscribe(2);
        let b = relay.subscribe(2);

        // Capacity 2 is smaller than the event count; readers drain concurrently
        let reader_a = tokio::spawn(a.collect::<Vec<_>>());
        let reader_b = tokio::spawn(b.collect::<Vec<_>>());

        let sent = events(10);
        let last = relay.pump(futures::stream::iter(sent.clone())).await;
        assert_eq!(last, sent.last().cloned());

        drop(relay);
        assert_eq!(reader_a.await.unwrap(), sent);
        assert_eq!(reader_b.await.unwrap(), sent);
    }

    #[tokio::test]
    async fn test_closed_subscribers_are_pruned() {
        let relay = EventRelay::new();
        let kept = relay.subscribe(16);
        let dropped = relay.subscribe(16);
        drop(dropped);

        relay.pump(futures::stream::iter(events(3))).await;
        assert_eq!(relay.subscriber_count(), 1);
        drop(relay);
        assert_eq!(kept.collect::<Vec<_>>().await.len(), 3);
    }

    #[tokio::test]
    async fn test_empty_stream_returns_none() {
        let relay = EventRelay::new();
        assert!(relay.pump(futures::stream::iter(Vec::new())).await.is_none());
    }
}
