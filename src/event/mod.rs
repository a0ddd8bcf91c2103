use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

pub mod bus;

pub use bus::{CompletionAwaiter, EventBus, SubscriptionId, WaitError};

/// Kinds of events travelling over the [`EventBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MessageReceived,
    ResponseSent,
    TopicTransitionRequested,
    CardDisplayed,
    ConversationReset,
    SubTopicCompleted,
    TopicActivated,
    ActivityFailed,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::MessageReceived => "message_received",
            EventKind::ResponseSent => "response_sent",
            EventKind::TopicTransitionRequested => "topic_transition_requested",
            EventKind::CardDisplayed => "card_displayed",
            EventKind::ConversationReset => "conversation_reset",
            EventKind::SubTopicCompleted => "sub_topic_completed",
            EventKind::TopicActivated => "topic_activated",
            EventKind::ActivityFailed => "activity_failed",
        };
        f.write_str(name)
    }
}

/// Immutable record of something that happened in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TopicEvent {
    pub id: String,
    pub kind: EventKind,
    pub topic_name: String,
    pub conversation_id: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TopicEvent {
    pub fn new(kind: EventKind, topic_name: &str, conversation_id: &str, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            topic_name: topic_name.to_string(),
            conversation_id: conversation_id.to_string(),
            payload,
            correlation_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_correlation(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_string());
        self
    }

    pub fn message_received(topic_name: &str, conversation_id: &str, text: &str) -> Self {
        Self::new(EventKind::MessageReceived, topic_name, conversation_id, json!({ "text": text }))
    }

    pub fn response_sent(topic_name: &str, conversation_id: &str, text: &str) -> Self {
        Self::new(EventKind::ResponseSent, topic_name, conversation_id, json!({ "text": text }))
    }

    /// `mode` is `"chain"` for fire-and-continue and `"wait"` for a blocking hand-down.
    pub fn transition_requested(from: &str, conversation_id: &str, target: &str, mode: &str) -> Self {
        Self::new(
            EventKind::TopicTransitionRequested,
            from,
            conversation_id,
            json!({ "target": target, "mode": mode }),
        )
    }

    pub fn card_displayed(topic_name: &str, conversation_id: &str, activity_id: &str, card: Value) -> Self {
        Self::new(
            EventKind::CardDisplayed,
            topic_name,
            conversation_id,
            json!({ "activity": activity_id, "card": card }),
        )
    }

    pub fn conversation_reset(topic_name: &str, conversation_id: &str) -> Self {
        Self::new(EventKind::ConversationReset, topic_name, conversation_id, Value::Null)
    }

    /// Completion signal a sub-topic publishes as its final act.
    pub fn sub_topic_completed(
        topic_name: &str,
        conversation_id: &str,
        correlation_id: &str,
        completion: Value,
        resume_data: Value,
    ) -> Self {
        Self::new(
            EventKind::SubTopicCompleted,
            topic_name,
            conversation_id,
            json!({ "completion": completion, "resume_data": resume_data }),
        )
        .with_correlation(correlation_id)
    }

    pub fn topic_activated(topic_name: &str, conversation_id: &str, confidence: f32) -> Self {
        Self::new(
            EventKind::TopicActivated,
            topic_name,
            conversation_id,
            json!({ "confidence": confidence }),
        )
    }

    pub fn activity_failed(topic_name: &str, conversation_id: &str, activity_id: &str, error: &str) -> Self {
        Self::new(
            EventKind::ActivityFailed,
            topic_name,
            conversation_id,
            json!({ "activity": activity_id, "error": error }),
        )
    }
}

/// Subscriber of the [`EventBus`].
///
/// Handlers of the same event run concurrently, so they must not assume
/// exclusive access to anything they share.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: TopicEvent) -> anyhow::Result<()>;

    /// Used in log records when the handler fails.
    fn name(&self) -> &str;
}

struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(TopicEvent) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, event: TopicEvent) -> anyhow::Result<()> {
        (self.f)(event)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Wraps a synchronous closure as a handler.
pub fn handler_fn<F>(name: &str, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(TopicEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler {
        name: name.to_string(),
        f,
    })
}
