use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ConfigError;
use crate::flow::topic_flow::FlowError;
use crate::message::Message;

pub mod flow_topic;
pub mod manager;
pub mod registry;
pub mod result;

pub use flow_topic::{FlowTopic, FlowTopicBuilder};
pub use manager::{TopicManager, TopicManagerBuilder};
pub use registry::{RoutedTopic, TopicRegistry};
pub use result::TopicResult;

/// Common priorities. Higher values are asked first.
pub mod priority {
    pub const SYSTEM: i32 = 1000;
    pub const HIGH: i32 = 100;
    pub const NORMAL: i32 = 50;
    pub const LOW: i32 = 10;
    pub const FALLBACK: i32 = i32::MIN;
}

#[derive(Debug, Error)]
pub enum TopicError {
    #[error("topic `{topic}` could not score the message: {reason}")]
    Probe { topic: String, reason: String },

    #[error("missing required collaborator: {0}")]
    MissingCollaborator(&'static str),

    #[error("topic `{0}` is terminated")]
    Terminated(String),

    #[error("terminating `{topic}` failed: {reason}")]
    Termination { topic: String, reason: String },

    #[error(transparent)]
    Flow(#[from] FlowError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("operation cancelled")]
    Cancelled,
}

/// A named, prioritized unit of conversational capability.
#[async_trait]
pub trait Topic: Send + Sync + Debug {
    /// Unique within a registry, compared case-insensitively.
    fn name(&self) -> &str;

    fn priority(&self) -> i32;

    /// How well this topic can handle `message`, in `[0, 1]`.
    async fn can_handle(&self, message: &Message, cancel: &CancellationToken) -> Result<f32, TopicError>;

    async fn process_message(&self, message: &Message, cancel: &CancellationToken) -> TopicResult;

    fn is_terminated(&self) -> bool;

    /// Idempotent; a second call is a no-op.
    fn terminate(&self) -> Result<(), TopicError>;

    async fn terminate_async(&self, _cancel: &CancellationToken) -> Result<(), TopicError> {
        self.terminate()
    }

    /// Drops any conversation progress so the topic starts fresh next time.
    async fn reset(&self);
}

pub type SharedTopic = Arc<dyn Topic>;

/// Scores a message against keywords.
///
/// An exact match scores 1.0, a keyword found as a word (or phrase) 0.8 and a
/// word merely starting with a keyword 0.4.
pub fn keyword_confidence(message: &Message, keywords: &[&str]) -> f32 {
    let text = message.normalized();
    if text.is_empty() {
        return 0.0;
    }
    let words: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    let mut best = 0.0f32;
    for keyword in keywords {
        let keyword = keyword.to_lowercase();
        if text == keyword {
            return 1.0;
        }
        if keyword.contains(' ') {
            if text.contains(&keyword) {
                best = best.max(0.8);
            }
        } else if words.iter().any(|w| *w == keyword) {
            best = best.max(0.8);
        } else if words.iter().any(|w| w.starts_with(&keyword)) {
            best = best.max(0.4);
        }
    }
    best
}

/// Fallback topic used when no other topic is confident enough.
#[derive(Debug)]
pub struct DefaultTopic {
    name: String,
    reply: String,
    terminated: AtomicBool,
}

pub const DEFAULT_REPLY: &str = "Sorry, I didn't understand that. Could you rephrase?";

impl DefaultTopic {
    pub fn new(name: &str) -> Self {
        Self::with_reply(name, DEFAULT_REPLY)
    }

    pub fn with_reply(name: &str, reply: &str) -> Self {
        Self {
            name: name.to_string(),
            reply: reply.to_string(),
            terminated: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Topic for DefaultTopic {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        priority::FALLBACK
    }

    async fn can_handle(&self, _message: &Message, _cancel: &CancellationToken) -> Result<f32, TopicError> {
        Ok(0.0)
    }

    async fn process_message(&self, message: &Message, _cancel: &CancellationToken) -> TopicResult {
        debug!(topic = %self.name, conversation_id = %message.conversation_id(), "falling back");
        TopicResult::could_not_understand(self.reply.clone())
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn terminate(&self) -> Result<(), TopicError> {
        self.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn reset(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_scores() {
        let m = |t: &str| Message::text("c", t);
        assert_eq!(keyword_confidence(&m("Hello"), &["hello", "hi"]), 1.0);
        assert_eq!(keyword_confidence(&m("well hello there"), &["hello"]), 0.8);
        assert_eq!(keyword_confidence(&m("please start over now"), &["start over"]), 0.8);
        assert_eq!(keyword_confidence(&m("profiles"), &["profile"]), 0.4);
        assert_eq!(keyword_confidence(&m("weather"), &["hello"]), 0.0);
        assert_eq!(keyword_confidence(&m("   "), &["hello"]), 0.0);
    }

    #[tokio::test]
    async fn default_topic_asks_again() {
        let topic = DefaultTopic::new("Default");
        let res = topic.process_message(&Message::text("c", "??"), &CancellationToken::new()).await;
        assert!(res.requires_input && res.is_handled && !res.keep_active);
        assert_eq!(res.text, DEFAULT_REPLY);
        topic.terminate().unwrap();
        topic.terminate().unwrap();
        assert!(topic.is_terminated());
    }
}
