use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{DefaultTopic, SharedTopic, Topic};
use crate::config::OrchestratorConfig;
use crate::message::Message;

/// The topic picked for a message.
#[derive(Debug, Clone)]
pub struct RoutedTopic {
    pub topic: SharedTopic,
    pub confidence: f32,
    /// True when nothing cleared the floor and the default topic was chosen.
    pub fallback: bool,
}

/// Working set of topics for one conversation, keyed case-insensitively.
#[derive(Debug)]
pub struct TopicRegistry {
    topics: DashMap<String, SharedTopic>,
    confidence_floor: f32,
    default_topic: String,
    terminate_timeout: Duration,
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new(&OrchestratorConfig::default())
    }
}

impl TopicRegistry {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            topics: DashMap::new(),
            confidence_floor: config.confidence_floor,
            default_topic: config.default_topic.clone(),
            terminate_timeout: config.terminate_timeout,
        }
    }

    /// Registers `topic` unless its name is already taken.
    ///
    /// Returns whether the topic was added.
    pub fn register(&self, topic: SharedTopic) -> bool {
        let key = topic.name().to_lowercase();
        if self.topics.contains_key(&key) {
            debug!(topic = %topic.name(), "topic already registered, ignoring");
            return false;
        }
        info!(topic = %topic.name(), priority = topic.priority(), "registered topic");
        self.topics.insert(key, topic);
        true
    }

    /// All topics, highest priority first, then by name.
    pub fn get_all(&self) -> Vec<SharedTopic> {
        let mut topics: Vec<SharedTopic> = self.topics.iter().map(|e| e.value().clone()).collect();
        topics.sort_by(|a, b| {
            b.priority()
                .cmp(&a.priority())
                .then_with(|| a.name().to_lowercase().cmp(&b.name().to_lowercase()))
        });
        topics
    }

    pub fn get_by_name(&self, name: &str) -> Option<SharedTopic> {
        self.topics.get(&name.to_lowercase()).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn confidence_floor(&self) -> f32 {
        self.confidence_floor
    }

    /// The configured fallback topic, registering a plain one if missing.
    pub fn default_topic(&self) -> SharedTopic {
        if let Some(topic) = self.get_by_name(&self.default_topic) {
            return topic;
        }
        let topic: SharedTopic = Arc::new(DefaultTopic::new(&self.default_topic));
        self.register(topic.clone());
        topic
    }

    /// Picks the topic most confident about `message`.
    ///
    /// Topics are asked in descending priority; a candidate replaces the best
    /// so far only with a strictly greater confidence, so ties go to the
    /// higher priority. Below the floor the default topic wins with 1.0.
    /// Returns `None` only when the turn is cancelled.
    #[tracing::instrument(skip(self, message, cancel), fields(conversation_id = %message.conversation_id()))]
    pub async fn find_best_topic(&self, message: &Message, cancel: &CancellationToken) -> Option<RoutedTopic> {
        let default_key = self.default_topic.to_lowercase();
        let mut best: Option<SharedTopic> = None;
        let mut best_confidence = 0.0f32;

        for topic in self.get_all() {
            if cancel.is_cancelled() {
                return None;
            }
            if topic.is_terminated() || topic.name().to_lowercase() == default_key {
                continue;
            }
            let confidence = match topic.can_handle(message, cancel).await {
                Ok(c) if c.is_nan() => 0.0,
                Ok(c) => c.clamp(0.0, 1.0),
                Err(err) => {
                    warn!(topic = %topic.name(), error = %err, "confidence probe failed, skipping");
                    continue;
                }
            };
            debug!(topic = %topic.name(), confidence, "probed topic");
            if confidence > best_confidence {
                best_confidence = confidence;
                best = Some(topic);
            }
        }

        match best {
            Some(topic) if best_confidence >= self.confidence_floor => Some(RoutedTopic {
                topic,
                confidence: best_confidence,
                fallback: false,
            }),
            _ => {
                debug!(best_confidence, floor = self.confidence_floor, "falling back to default topic");
                Some(RoutedTopic {
                    topic: self.default_topic(),
                    confidence: 1.0,
                    fallback: true,
                })
            }
        }
    }

    /// Terminates every topic and empties the registry.
    pub fn reset(&self) {
        self.terminate();
        self.topics.clear();
        info!("topic registry reset");
    }

    /// Terminates every topic; failures are logged and skipped.
    pub fn terminate(&self) {
        for topic in self.get_all() {
            if topic.is_terminated() {
                continue;
            }
            if let Err(err) = topic.terminate() {
                error!(topic = %topic.name(), error = %err, "topic termination failed");
            }
        }
    }

    /// Terminates every topic concurrently, bounded by the terminate timeout.
    ///
    /// On timeout the pending terminations are cancelled and every topic is
    /// terminated synchronously instead.
    pub async fn terminate_async(&self, cancel: &CancellationToken) {
        let topics: Vec<SharedTopic> = self.get_all().into_iter().filter(|t| !t.is_terminated()).collect();
        if topics.is_empty() {
            return;
        }
        let child = cancel.child_token();
        let pending = join_all(topics.iter().map(|topic| {
            let child = child.clone();
            async move { (topic.name().to_string(), topic.terminate_async(&child).await) }
        }));

        match tokio::time::timeout(self.terminate_timeout, pending).await {
            Ok(outcomes) => {
                for (name, outcome) in outcomes {
                    if let Err(err) = outcome {
                        error!(topic = %name, error = %err, "async termination failed");
                    }
                }
            }
            Err(_) => {
                child.cancel();
                warn!(timeout = ?self.terminate_timeout, "async termination timed out, forcing");
                self.terminate();
            }
        }
    }
}
