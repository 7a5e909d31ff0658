//! Output router: delivers container output to at most one live subscriber
//! per group, buffering when none is attached.
//!
//! Buffer-then-live: `subscribe` first drains any buffered events into the
//! new sink (in order), then registers as the live subscriber so subsequent
//! `emit` calls are delivered directly. The buffer is bounded; overflow
//! drops the oldest entry.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use agenthost_core::RouterEvent;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Bound on the per-group fallback message buffer. Chosen per the spec's
/// open question (drop-oldest preferred over plumbing backpressure into the
/// container runner).
const BUFFER_CAPACITY: usize = 1000;

/// Opaque handle returned by `subscribe`. Only the holder of a matching
/// token may `unsubscribe` — a stale token from a superseded subscriber is a
/// no-op rather than tearing down the new one.
pub type SubscriptionToken = u64;

struct GroupChannel {
    subscriber: Option<(SubscriptionToken, mpsc::UnboundedSender<RouterEvent>)>,
    buffer: VecDeque<RouterEvent>,
}

impl GroupChannel {
    fn new() -> Self {
        Self {
            subscriber: None,
            buffer: VecDeque::new(),
        }
    }

    fn push_buffered(&mut self, event: RouterEvent) {
        if self.buffer.len() >= BUFFER_CAPACITY {
            self.buffer.pop_front();
        }
        self.buffer.push_back(event);
    }
}

#[derive(Clone)]
pub struct OutputRouter {
    groups: Arc<Mutex<HashMap<String, GroupChannel>>>,
    next_token: Arc<AtomicU64>,
}

impl OutputRouter {
    pub fn new() -> Self {
        Self {
            groups: Arc::new(Mutex::new(HashMap::new())),
            next_token: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Attach a new live subscriber for `group_folder`. Any buffered events
    /// are pushed onto the returned receiver first, in order, before the
    /// subscriber is registered for live delivery.
    pub async fn subscribe(
        &self,
        group_folder: &str,
    ) -> (SubscriptionToken, mpsc::UnboundedReceiver<RouterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        let mut groups = self.groups.lock().await;
        let channel = groups
            .entry(group_folder.to_string())
            .or_insert_with(GroupChannel::new);

        for event in channel.buffer.drain(..) {
            let _ = tx.send(event);
        }
        channel.subscriber = Some((token, tx));

        (token, rx)
    }

    /// Detach a subscriber. No-op if `token` no longer matches the current
    /// live subscriber (it was superseded or already removed).
    pub async fn unsubscribe(&self, group_folder: &str, token: SubscriptionToken) {
        let mut groups = self.groups.lock().await;
        if let Some(channel) = groups.get_mut(group_folder) {
            if matches!(&channel.subscriber, Some((t, _)) if *t == token) {
                channel.subscriber = None;
            }
        }
    }

    /// Deliver an event: directly to a live subscriber, or into the
    /// fallback buffer if none is attached.
    pub async fn emit(&self, group_folder: &str, event: RouterEvent) {
        let mut groups = self.groups.lock().await;
        let channel = groups
            .entry(group_folder.to_string())
            .or_insert_with(GroupChannel::new);

        let delivered = match &channel.subscriber {
            Some((_, tx)) => tx.send(event.clone()).is_ok(),
            None => false,
        };

        if !delivered {
            if channel.subscriber.is_some() {
                // Subscriber's receiver was dropped without unsubscribing.
                channel.subscriber = None;
                debug!(group_folder, "subscriber channel closed, falling back to buffer");
            }
            channel.push_buffered(event);
        }
    }

    /// Drain and return the buffered events for a group without attaching a
    /// subscriber. Exposed for diagnostics and tests.
    pub async fn drain_buffer(&self, group_folder: &str) -> Vec<RouterEvent> {
        let mut groups = self.groups.lock().await;
        match groups.get_mut(group_folder) {
            Some(channel) => channel.buffer.drain(..).collect(),
            None => Vec::new(),
        }
    }
}

impl Default for OutputRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_without_subscriber_buffers() {
        let router = OutputRouter::new();
        router
            .emit("team-a", RouterEvent::Message { text: "hi".into() })
            .await;
        let buffered = router.drain_buffer("team-a").await;
        assert_eq!(buffered.len(), 1);
    }

    #[tokio::test]
    async fn subscribe_drains_buffer_before_live() {
        let router = OutputRouter::new();
        router
            .emit("team-a", RouterEvent::Message { text: "buffered".into() })
            .await;

        let (_token, mut rx) = router.subscribe("team-a").await;
        router
            .emit("team-a", RouterEvent::Message { text: "live".into() })
            .await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first, RouterEvent::Message { text: "buffered".into() });
        assert_eq!(second, RouterEvent::Message { text: "live".into() });
    }

    #[tokio::test]
    async fn unsubscribe_with_stale_token_is_noop() {
        let router = OutputRouter::new();
        let (token_a, _rx_a) = router.subscribe("team-a").await;
        let (_token_b, mut rx_b) = router.subscribe("team-a").await;

        // token_a was superseded by the second subscribe; unsubscribing it
        // must not remove the live (second) subscriber.
        router.unsubscribe("team-a", token_a).await;

        router
            .emit("team-a", RouterEvent::Done { session_id: None })
            .await;
        assert!(rx_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn buffer_overflow_drops_oldest() {
        let router = OutputRouter::new();
        for i in 0..(BUFFER_CAPACITY + 10) {
            router
                .emit("team-a", RouterEvent::Message { text: i.to_string() })
                .await;
        }
        let buffered = router.drain_buffer("team-a").await;
        assert_eq!(buffered.len(), BUFFER_CAPACITY);
        assert_eq!(buffered[0], RouterEvent::Message { text: "10".to_string() });
    }
}
