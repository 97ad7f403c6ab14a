//! Bounded channel sink for streaming run events to a dashboard.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::warn;

use super::EventSink;
use crate::core::RunEvent;

/// Forwards events into a bounded channel.
///
/// `emit` waits for capacity; `try_emit` drops the event when the channel is
/// full or closed and counts the drop.
#[derive(Debug)]
pub struct ChannelEventSink {
    tx: mpsc::Sender<RunEvent>,
    emitted: AtomicU64,
    dropped: AtomicU64,
}

impl ChannelEventSink {
    /// Creates a sink and the receiver its events arrive on.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<RunEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                emitted: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Returns the number of events delivered to the channel.
    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Returns the number of events dropped.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn emit(&self, event: RunEvent) {
        if self.tx.send(event).await.is_ok() {
            self.emitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn try_emit(&self, event: RunEvent) {
        let event_type = event.event_type.clone();
        match self.tx.try_send(event) {
            Ok(()) => {
                self.emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                let dropped_total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    event_type = %event_type,
                    dropped_total,
                    "Event dropped: channel full or closed"
                );
            }
        }
    }
}
