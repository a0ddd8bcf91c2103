use crate::event::{EventHandler, EventKind, TopicEvent};
use futures::future::join_all;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// Default number of events kept in history.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

pub type SubscriptionId = u64;

type HandlerList = Vec<(SubscriptionId, Arc<dyn EventHandler>)>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("timed out after {0:?} waiting for correlation id")]
    TimedOut(Duration),
    #[error("wait cancelled")]
    Cancelled,
    #[error("event bus closed")]
    Closed,
}

struct Inner {
    handlers: RwLock<HashMap<EventKind, HandlerList>>,
    history: Mutex<VecDeque<TopicEvent>>,
    capacity: usize,
    next_id: AtomicU64,
}

/// Publish/subscribe channel with a bounded history.
///
/// Cloning is cheap and every clone shares the same subscribers and history.
/// Buses are built explicitly and handed to whoever needs them, so tests can
/// run with independent instances.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.inner.capacity)
            .field("history", &self.history_len())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                handlers: RwLock::new(HashMap::new()),
                history: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
                capacity: capacity.max(1),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let mut handlers = self.inner.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.entry(kind).or_default().push((id, handler));
        trace!(%kind, id, "subscribed");
        id
    }

    /// Returns `false` when the subscription was already gone.
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut handlers = self.inner.handlers.write().unwrap_or_else(|e| e.into_inner());
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sid, _)| *sid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&kind);
        }
        removed
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// Records the event and awaits every current subscriber concurrently.
    ///
    /// Handler failures are logged, never returned.
    pub async fn publish(&self, event: TopicEvent) {
        {
            let mut history = self.inner.history.lock().unwrap_or_else(|e| e.into_inner());
            if history.len() == self.inner.capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        // snapshot before awaiting so handlers may (un)subscribe freely
        let handlers: HandlerList = {
            let handlers = self.inner.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers.get(&event.kind).cloned().unwrap_or_default()
        };

        debug!(
            kind = %event.kind,
            topic = %event.topic_name,
            conversation_id = %event.conversation_id,
            subscribers = handlers.len(),
            "publishing event"
        );

        let calls = handlers.iter().map(|(_, handler)| {
            let event = event.clone();
            async move { (handler.name().to_string(), handler.handle(event).await) }
        });
        for (name, result) in join_all(calls).await {
            if let Err(err) = result {
                error!(handler = %name, kind = %event.kind, error = %err, "event handler failed");
            }
        }
    }

    pub async fn publish_all(&self, events: Vec<TopicEvent>) {
        for event in events {
            self.publish(event).await;
        }
    }

    pub fn history(&self) -> Vec<TopicEvent> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn history_len(&self) -> usize {
        self.inner.history.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    fn history_where(&self, pred: impl Fn(&TopicEvent) -> bool) -> Vec<TopicEvent> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| pred(e))
            .cloned()
            .collect()
    }

    pub fn history_for_conversation(&self, conversation_id: &str) -> Vec<TopicEvent> {
        self.history_where(|e| e.conversation_id == conversation_id)
    }

    /// Topic names compare case-insensitively.
    pub fn history_for_topic(&self, topic_name: &str, conversation_id: &str) -> Vec<TopicEvent> {
        self.history_where(|e| {
            e.conversation_id == conversation_id && e.topic_name.eq_ignore_ascii_case(topic_name)
        })
    }

    pub fn history_for_correlation(&self, correlation_id: &str) -> Vec<TopicEvent> {
        self.history_where(|e| e.correlation_id.as_deref() == Some(correlation_id))
    }

    pub fn clear_history(&self) {
        self.inner.history.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Registers interest in the first `kind` event carrying `correlation_id`.
    ///
    /// The subscription is taken before history is consulted, so an event
    /// published between the two steps is not lost.
    pub fn awaiter(&self, kind: EventKind, correlation_id: &str) -> CompletionAwaiter {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Arc::new(CorrelationHandler {
            correlation_id: correlation_id.to_string(),
            tx,
        });
        let id = self.subscribe(kind, handler);

        let early = self
            .history_for_correlation(correlation_id)
            .into_iter()
            .find(|e| e.kind == kind);

        CompletionAwaiter {
            bus: self.clone(),
            kind,
            subscription: Some(id),
            correlation_id: correlation_id.to_string(),
            early,
            rx,
        }
    }
}

struct CorrelationHandler {
    correlation_id: String,
    tx: mpsc::UnboundedSender<TopicEvent>,
}

#[async_trait::async_trait]
impl EventHandler for CorrelationHandler {
    async fn handle(&self, event: TopicEvent) -> anyhow::Result<()> {
        if event.correlation_id.as_deref() == Some(self.correlation_id.as_str()) {
            // receiver may already be gone after a timeout
            let _ = self.tx.send(event);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "correlation-awaiter"
    }
}

/// Pending wait for one correlated event.
///
/// Dropping the awaiter removes its subscription, so an abandoned or timed
/// out wait leaves nothing behind on the bus.
pub struct CompletionAwaiter {
    bus: EventBus,
    kind: EventKind,
    subscription: Option<SubscriptionId>,
    correlation_id: String,
    early: Option<TopicEvent>,
    rx: mpsc::UnboundedReceiver<TopicEvent>,
}

impl std::fmt::Debug for CompletionAwaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionAwaiter")
            .field("kind", &self.kind)
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}

impl CompletionAwaiter {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Non-blocking check for an already delivered event.
    pub fn try_take(&mut self) -> Option<TopicEvent> {
        if let Some(event) = self.early.take() {
            return Some(event);
        }
        self.rx.try_recv().ok()
    }

    pub async fn wait(&mut self, timeout: Duration, cancel: &CancellationToken) -> Result<TopicEvent, WaitError> {
        if let Some(event) = self.try_take() {
            return Ok(event);
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(WaitError::Cancelled),
            received = tokio::time::timeout(timeout, self.rx.recv()) => match received {
                Ok(Some(event)) => Ok(event),
                Ok(None) => Err(WaitError::Closed),
                Err(_) => Err(WaitError::TimedOut(timeout)),
            },
        }
    }
}

impl Drop for CompletionAwaiter {
    fn drop(&mut self) {
        if let Some(id) = self.subscription.take() {
            self.bus.unsubscribe(self.kind, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::handler_fn;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn event(kind: EventKind, topic: &str, conv: &str) -> TopicEvent {
        TopicEvent::new(kind, topic, conv, json!({}))
    }

    #[tokio::test]
    async fn publish_reaches_subscribers_of_kind_only() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.subscribe(
            EventKind::MessageReceived,
            handler_fn("count", move |_| {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        bus.publish(event(EventKind::MessageReceived, "A", "c")).await;
        bus.publish(event(EventKind::ResponseSent, "A", "c")).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.history_len(), 2);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = bus.subscribe(
            EventKind::ResponseSent,
            handler_fn("count", move |_| {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        assert!(bus.unsubscribe(EventKind::ResponseSent, id));
        assert!(!bus.unsubscribe(EventKind::ResponseSent, id));
        bus.publish(event(EventKind::ResponseSent, "A", "c")).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_others() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.subscribe(EventKind::CardDisplayed, handler_fn("broken", |_| anyhow::bail!("nope")));
        bus.subscribe(
            EventKind::CardDisplayed,
            handler_fn("ok", move |_| {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        bus.publish(event(EventKind::CardDisplayed, "A", "c")).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let bus = EventBus::new(1000);
        for i in 0..1001 {
            bus.publish(TopicEvent::new(EventKind::MessageReceived, "A", "c", json!({ "n": i }))).await;
        }
        let history = bus.history();
        assert_eq!(history.len(), 1000);
        assert_eq!(history[0].payload["n"], 1);
        assert_eq!(history[999].payload["n"], 1000);
    }

    #[tokio::test]
    async fn history_queries() {
        let bus = EventBus::default();
        bus.publish(event(EventKind::MessageReceived, "Profile", "c1")).await;
        bus.publish(event(EventKind::MessageReceived, "Greeting", "c1")).await;
        bus.publish(event(EventKind::MessageReceived, "Profile", "c2")).await;
        bus.publish(event(EventKind::SubTopicCompleted, "Address", "c1").with_correlation("x")).await;

        assert_eq!(bus.history_for_conversation("c1").len(), 3);
        assert_eq!(bus.history_for_topic("profile", "c1").len(), 1);
        assert_eq!(bus.history_for_correlation("x").len(), 1);
        assert!(bus.history_for_correlation("y").is_empty());
    }

    #[tokio::test]
    async fn awaiter_matches_correlation_only() {
        let bus = EventBus::default();
        let mut awaiter = bus.awaiter(EventKind::SubTopicCompleted, "wanted");
        assert_eq!(bus.subscriber_count(EventKind::SubTopicCompleted), 1);

        bus.publish(event(EventKind::SubTopicCompleted, "Address", "c").with_correlation("other")).await;
        bus.publish(event(EventKind::SubTopicCompleted, "Address", "c").with_correlation("wanted")).await;

        let got = awaiter
            .wait(Duration::from_millis(100), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(got.correlation_id.as_deref(), Some("wanted"));
        drop(awaiter);
        assert_eq!(bus.subscriber_count(EventKind::SubTopicCompleted), 0);
    }

    #[tokio::test]
    async fn awaiter_sees_event_already_in_history() {
        let bus = EventBus::default();
        bus.publish(event(EventKind::SubTopicCompleted, "Address", "c").with_correlation("early")).await;
        let mut awaiter = bus.awaiter(EventKind::SubTopicCompleted, "early");
        assert!(awaiter.try_take().is_some());
    }

    #[tokio::test]
    async fn awaiter_times_out_and_unsubscribes() {
        let bus = EventBus::default();
        let mut awaiter = bus.awaiter(EventKind::SubTopicCompleted, "never");
        let res = awaiter.wait(Duration::from_millis(20), &CancellationToken::new()).await;
        assert_eq!(res.unwrap_err(), WaitError::TimedOut(Duration::from_millis(20)));
        drop(awaiter);
        assert_eq!(bus.subscriber_count(EventKind::SubTopicCompleted), 0);
    }

    #[tokio::test]
    async fn awaiter_honours_cancellation() {
        let bus = EventBus::default();
        let mut awaiter = bus.awaiter(EventKind::SubTopicCompleted, "c");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res = awaiter.wait(Duration::from_secs(5), &cancel).await;
        assert_eq!(res.unwrap_err(), WaitError::Cancelled);
        drop(awaiter);
        assert_eq!(bus.subscriber_count(EventKind::SubTopicCompleted), 0);
    }
}
