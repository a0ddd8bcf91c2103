use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::TopicEvent;

/// Outcome of one conversation turn, handed back to the chat service.
///
/// `is_completed` and `requires_input` never hold together in a well-formed
/// result; the constructors below keep it that way.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TopicResult {
    pub text: String,
    /// Opaque rendered payload (e.g. a serialized card), forwarded untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendered: Option<String>,
    pub requires_input: bool,
    pub is_completed: bool,
    pub is_handled: bool,
    pub keep_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_topic_name: Option<String>,
    #[serde(default)]
    pub outbox: Vec<TopicEvent>,
    /// What the topic produced when it completed.
    #[serde(default)]
    pub completion: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TopicResult {
    /// The topic asked something and stays active for the answer.
    pub fn needs_input(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            requires_input: true,
            is_handled: true,
            keep_active: true,
            ..Default::default()
        }
    }

    pub fn completed(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_completed: true,
            is_handled: true,
            ..Default::default()
        }
    }

    /// The topic declined the message.
    pub fn not_handled() -> Self {
        Self::default()
    }

    /// The topic took the message but its flow failed.
    pub fn failed(text: impl Into<String>, error: impl ToString) -> Self {
        Self {
            text: text.into(),
            is_handled: true,
            error: Some(error.to_string()),
            ..Default::default()
        }
    }

    /// Generic reply when nothing could make sense of the message.
    pub fn could_not_understand(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            requires_input: true,
            is_handled: true,
            ..Default::default()
        }
    }

    /// The turn was cancelled before the topic settled; it stays active.
    pub fn cancelled() -> Self {
        Self {
            is_handled: true,
            keep_active: true,
            error: Some("turn cancelled".to_string()),
            ..Default::default()
        }
    }

    pub fn with_rendered(mut self, rendered: impl Into<String>) -> Self {
        self.rendered = Some(rendered.into());
        self
    }

    pub fn with_next_topic(mut self, topic: impl Into<String>) -> Self {
        self.next_topic_name = Some(topic.into());
        self
    }

    pub fn with_event(mut self, event: TopicEvent) -> Self {
        self.outbox.push(event);
        self
    }

    pub fn with_completion(mut self, completion: Value) -> Self {
        self.completion = completion;
        self
    }

    pub fn keep_active(mut self, keep: bool) -> Self {
        self.keep_active = keep;
        self
    }

    pub fn is_well_formed(&self) -> bool {
        !(self.is_completed && self.requires_input)
    }

    /// Appends what another topic produced later in the same turn.
    ///
    /// Text is joined line by line; flags, hand-off and completion come from
    /// `followup` since it is the later state of the conversation.
    pub fn merge_followup(mut self, followup: TopicResult) -> Self {
        self.text = match (self.text.is_empty(), followup.text.is_empty()) {
            (_, true) => self.text,
            (true, false) => followup.text,
            (false, false) => format!("{}\n{}", self.text, followup.text),
        };
        self.rendered = followup.rendered.or(self.rendered);
        self.requires_input = followup.requires_input;
        self.is_completed = followup.is_completed;
        self.is_handled = self.is_handled || followup.is_handled;
        self.keep_active = followup.keep_active;
        self.next_topic_name = followup.next_topic_name;
        self.outbox.extend(followup.outbox);
        self.completion = followup.completion;
        self.error = followup.error.or(self.error);
        self
    }
}
