use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::TopicRegistry;
use super::{SharedTopic, TopicError, TopicResult, DEFAULT_REPLY};
use crate::config::OrchestratorConfig;
use crate::event::{EventBus, EventKind, TopicEvent};
use crate::flow::session::SharedConversation;
use crate::logger::TurnTelemetry;
use crate::message::Message;

const MANAGER: &str = "TopicManager";

/// A parent topic blocked until `child` completes.
#[derive(Debug)]
struct Suspended {
    parent: SharedTopic,
    child: String,
}

#[derive(Debug, Default)]
struct TurnState {
    active: Option<SharedTopic>,
    suspended: Vec<Suspended>,
}

/// Routes each message of one conversation to a topic.
///
/// The active topic gets first refusal; otherwise the registry picks one.
/// Hand-offs requested by a topic (`next_topic_name`) run in the same turn,
/// and a completing sub-topic gives control back to its suspended parent.
#[derive(Debug)]
pub struct TopicManager {
    registry: Arc<TopicRegistry>,
    conversation: SharedConversation,
    bus: EventBus,
    config: OrchestratorConfig,
    telemetry: TurnTelemetry,
    turn: Mutex<TurnState>,
}

#[derive(Default)]
pub struct TopicManagerBuilder {
    registry: Option<Arc<TopicRegistry>>,
    conversation: Option<SharedConversation>,
    bus: Option<EventBus>,
    config: Option<OrchestratorConfig>,
    topics: Vec<SharedTopic>,
}

impl TopicManagerBuilder {
    pub fn conversation(mut self, conversation: SharedConversation) -> Self {
        self.conversation = Some(conversation);
        self
    }

    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn registry(mut self, registry: Arc<TopicRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn topic(mut self, topic: SharedTopic) -> Self {
        self.topics.push(topic);
        self
    }

    pub fn build(self) -> Result<TopicManager, TopicError> {
        let conversation = self.conversation.ok_or(TopicError::MissingCollaborator("conversation"))?;
        let bus = self.bus.ok_or(TopicError::MissingCollaborator("event bus"))?;
        let config = self.config.unwrap_or_default();
        let registry = self.registry.unwrap_or_else(|| Arc::new(TopicRegistry::new(&config)));
        for topic in self.topics {
            registry.register(topic);
        }
        // make sure routing always has somewhere to fall back to
        registry.default_topic();

        Ok(TopicManager {
            registry,
            conversation,
            bus,
            config,
            telemetry: TurnTelemetry::new(),
            turn: Mutex::new(TurnState::default()),
        })
    }
}

impl TopicManager {
    pub fn builder() -> TopicManagerBuilder {
        TopicManagerBuilder::default()
    }

    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    pub fn conversation(&self) -> &SharedConversation {
        &self.conversation
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub async fn active_topic_name(&self) -> Option<String> {
        self.turn.lock().await.active.as_ref().map(|t| t.name().to_string())
    }

    /// Names of the parents waiting on a sub-topic, outermost first.
    pub async fn suspended_topic_names(&self) -> Vec<String> {
        self.turn
            .lock()
            .await
            .suspended
            .iter()
            .map(|s| s.parent.name().to_string())
            .collect()
    }

    /// Handles one inbound message and returns the reply of the turn.
    #[tracing::instrument(
        name = "handle_message",
        skip(self, message, cancel),
        fields(conversation_id = %self.conversation.conversation_id())
    )]
    pub async fn handle_message(&self, message: &Message, cancel: &CancellationToken) -> TopicResult {
        let conversation_id = self.conversation.conversation_id().to_string();
        self.telemetry
            .instrument_turn(&conversation_id, || self.run_turn(message, cancel))
            .await
    }

    async fn run_turn(&self, message: &Message, cancel: &CancellationToken) -> TopicResult {
        let conversation_id = self.conversation.conversation_id();
        if self.conversation.is_terminated() {
            warn!("message for a terminated conversation");
            return TopicResult::not_handled();
        }

        let mut turn = self.turn.lock().await;
        let current = turn.active.as_ref().map(|t| t.name().to_string()).unwrap_or_default();
        self.bus
            .publish(TopicEvent::message_received(&current, conversation_id, message.text_content()))
            .await;

        self.expire_hand_down(&mut turn).await;

        let mut handled: Option<(SharedTopic, TopicResult)> = None;

        if let Some(active) = turn.active.clone() {
            if active.is_terminated() {
                turn.active = None;
            } else {
                let result = active.process_message(message, cancel).await;
                if result.is_handled {
                    handled = Some((active, result));
                } else {
                    debug!(topic = %active.name(), "active topic declined, routing");
                    turn.active = None;
                }
            }
        }

        if handled.is_none() {
            let Some(routed) = self.registry.find_best_topic(message, cancel).await else {
                return TopicResult::cancelled();
            };
            info!(topic = %routed.topic.name(), confidence = routed.confidence, fallback = routed.fallback, "routed message");
            if !routed.fallback {
                self.bus
                    .publish(TopicEvent::topic_activated(routed.topic.name(), conversation_id, routed.confidence))
                    .await;
            }
            let result = routed.topic.process_message(message, cancel).await;
            if result.is_handled {
                handled = Some((routed.topic, result));
            }
        }

        let result = match handled {
            Some((topic, result)) => self.settle(&mut turn, topic, result, message, cancel).await,
            None => TopicResult::could_not_understand(DEFAULT_REPLY),
        };
        drop(turn);

        let replied = self.active_topic_name().await.unwrap_or_default();
        self.bus
            .publish(TopicEvent::response_sent(&replied, conversation_id, &result.text))
            .await;
        result
    }

    /// Gives control back to a parent whose sub-topic outlived its deadline.
    async fn expire_hand_down(&self, turn: &mut TurnState) {
        let Some(waiting) = turn.suspended.last() else {
            return;
        };
        let wf = self.conversation.workflow();
        let expired = match wf.subtopic_deadline(&waiting.child) {
            Some(deadline) => deadline <= Utc::now().timestamp_millis(),
            None => false,
        };
        if !expired {
            return;
        }
        let Some(waiting) = turn.suspended.pop() else {
            return;
        };
        warn!(parent = %waiting.parent.name(), child = %waiting.child, "sub-topic hand-down expired");
        if let Some(child) = self.registry.get_by_name(&waiting.child) {
            child.reset().await;
        }
        turn.active = Some(waiting.parent);
    }

    /// Follows hand-offs and completions until the turn comes to rest.
    async fn settle(
        &self,
        turn: &mut TurnState,
        mut topic: SharedTopic,
        first: TopicResult,
        message: &Message,
        cancel: &CancellationToken,
    ) -> TopicResult {
        let conversation_id = self.conversation.conversation_id();
        let wf = self.conversation.workflow();
        let mut current = first;
        let mut merged: Option<TopicResult> = None;
        let mut hops = 0usize;

        loop {
            self.conversation.add_topic_to_history(topic.name());

            let reset_requested = current.outbox.iter().any(|e| e.kind == EventKind::ConversationReset);
            self.bus.publish_all(current.outbox.clone()).await;

            let next_topic = current.next_topic_name.clone();
            let waits = current.requires_input || current.keep_active;
            let completed = current.is_completed;
            let keep_active = current.keep_active;
            let result = match merged.take() {
                None => current,
                Some(prev) => prev.merge_followup(current),
            };

            if reset_requested {
                self.reset_state(turn).await;
                return result.keep_active(false);
            }

            let mut follow: Option<SharedTopic> = None;
            if let Some(target) = next_topic {
                match self.registry.get_by_name(&target) {
                    Some(child) if !child.is_terminated() => {
                        if waits {
                            turn.suspended.push(Suspended {
                                parent: topic.clone(),
                                child: child.name().to_string(),
                            });
                        }
                        self.bus
                            .publish(TopicEvent::topic_activated(child.name(), conversation_id, 1.0))
                            .await;
                        follow = Some(child);
                    }
                    _ if waits => {
                        // nothing can complete this hand-down, so the parent's wait ends now
                        warn!(topic = %topic.name(), %target, "hand-down target unavailable, resuming parent");
                        wf.clear_subtopic_deadline(&target);
                        follow = Some(topic.clone());
                    }
                    _ => warn!(topic = %topic.name(), %target, "hand-off to unknown topic ignored"),
                }
            } else if completed {
                let waited_on = turn
                    .suspended
                    .last()
                    .is_some_and(|waiting| waiting.child.eq_ignore_ascii_case(topic.name()));
                if waited_on {
                    if let Some(waiting) = turn.suspended.pop() {
                        debug!(parent = %waiting.parent.name(), child = %topic.name(), "returning to parent");
                        follow = Some(waiting.parent);
                    }
                } else if !turn.suspended.is_empty() {
                    debug!(topic = %topic.name(), "completed while a parent waits on another topic");
                } else if let Some(next) = wf.pop_topic_chain() {
                    match self.registry.get_by_name(&next) {
                        Some(chained) if !chained.is_terminated() => {
                            self.bus
                                .publish(TopicEvent::topic_activated(chained.name(), conversation_id, 1.0))
                                .await;
                            follow = Some(chained);
                        }
                        _ => warn!(topic = %next, "chained topic not registered"),
                    }
                }
            }

            match follow {
                Some(next) if hops < self.config.max_handoff_depth => {
                    hops += 1;
                    merged = Some(result);
                    current = next.process_message(message, cancel).await;
                    topic = next;
                }
                follow => {
                    if follow.is_some() {
                        warn!(topic = %topic.name(), hops, "hand-off depth exceeded, stopping");
                    }
                    if keep_active && !completed {
                        turn.active = Some(topic.clone());
                        self.conversation.set_current_topic_name(Some(topic.name()));
                    } else {
                        turn.active = None;
                        self.conversation.set_current_topic_name(None);
                    }
                    return result;
                }
            }
        }
    }

    async fn reset_state(&self, turn: &mut TurnState) {
        let wf = self.conversation.workflow();
        wf.clear();
        wf.set_conversation_active(true);
        turn.active = None;
        turn.suspended.clear();
        for topic in self.registry.get_all() {
            topic.reset().await;
        }
        info!(conversation_id = %self.conversation.conversation_id(), "conversation reset");
    }

    /// Clears the conversation state and every topic's progress.
    pub async fn reset_conversation(&self) {
        let mut turn = self.turn.lock().await;
        self.reset_state(&mut turn).await;
        self.bus
            .publish(TopicEvent::conversation_reset(MANAGER, self.conversation.conversation_id()))
            .await;
    }

    /// Terminates every topic and the conversation. Idempotent.
    pub fn terminate(&self) {
        self.registry.terminate();
        self.conversation.terminate();
    }

    pub async fn terminate_async(&self, cancel: &CancellationToken) {
        self.registry.terminate_async(cancel).await;
        self.conversation.terminate_async(cancel).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityError, ActivityResult, FunctionActivity, InteractiveActivity, TriggerTopicActivity};
    use crate::flow::session::{Conversation, ConversationContext};
    use crate::flow::state::keys;
    use crate::flow::topic_flow::TopicFlow;
    use crate::topic::FlowTopic;
    use serde_json::json;
    use std::time::Duration;

    fn say_topic(name: &str, keyword: &'static str, text: &'static str, conv: &SharedConversation, bus: &EventBus) -> SharedTopic {
        let flow_name = name.to_string();
        Arc::new(
            FlowTopic::builder(name)
                .keywords(&[keyword])
                .flow(move || {
                    let mut flow = TopicFlow::new(&flow_name);
                    flow.push(FunctionActivity::say("say", text))?;
                    Ok(flow)
                })
                .build(conv.clone(), bus.clone())
                .unwrap(),
        )
    }

    fn parent_and_child(conv: &SharedConversation, bus: &EventBus, timeout: Duration) -> (SharedTopic, SharedTopic) {
        let parent = FlowTopic::builder("Parent")
            .keywords(&["start"])
            .flow(move || {
                let mut flow = TopicFlow::new("Parent");
                flow.push(TriggerTopicActivity::wait("hand", "Child", timeout))?;
                flow.push(FunctionActivity::say("done", "Back with {{state.[subtopic.completion].city}}"))?;
                Ok(flow)
            })
            .build(conv.clone(), bus.clone())
            .unwrap();
        let child = FlowTopic::builder("Child")
            .flow(|| {
                let mut flow = TopicFlow::new("Child");
                flow.push(InteractiveActivity::text("city", "City?", "child.city"))?;
                Ok(flow)
            })
            .completion(|wf| json!({ "city": wf.get("child.city", String::new()) }))
            .build(conv.clone(), bus.clone())
            .unwrap();
        (Arc::new(parent), Arc::new(child))
    }

    fn setup() -> (SharedConversation, EventBus) {
        (Conversation::new("conv-1"), EventBus::default())
    }

    #[test]
    fn build_requires_collaborators() {
        let err = TopicManager::builder().bus(EventBus::default()).build().unwrap_err();
        assert!(matches!(err, TopicError::MissingCollaborator("conversation")));
        let err = TopicManager::builder().conversation(Conversation::new("c")).build().unwrap_err();
        assert!(matches!(err, TopicError::MissingCollaborator("event bus")));
    }

    #[tokio::test]
    async fn unknown_message_falls_back() {
        let (conv, bus) = setup();
        let manager = TopicManager::builder()
            .conversation(conv.clone())
            .bus(bus.clone())
            .topic(say_topic("Greeting", "hello", "Hi!", &conv, &bus))
            .build()
            .unwrap();
        let res = manager.handle_message(&Message::text("conv-1", "weather?"), &CancellationToken::new()).await;
        assert!(res.requires_input && res.is_handled);
        assert_eq!(res.text, DEFAULT_REPLY);

        let res = manager.handle_message(&Message::text("conv-1", "hello"), &CancellationToken::new()).await;
        assert_eq!(res.text, "Hi!");
        assert!(res.is_completed);
        assert_eq!(manager.active_topic_name().await, None);
        assert_eq!(conv.workflow().topic_history(), vec!["Default", "Greeting"]);
        assert_eq!(bus.history_for_conversation("conv-1").iter().filter(|e| e.kind == EventKind::ResponseSent).count(), 2);
    }

    #[tokio::test]
    async fn hand_down_and_regain_control() {
        let (conv, bus) = setup();
        let (parent, child) = parent_and_child(&conv, &bus, Duration::from_secs(60));
        let manager = TopicManager::builder()
            .conversation(conv.clone())
            .bus(bus.clone())
            .topic(parent)
            .topic(child)
            .build()
            .unwrap();
        let cancel = CancellationToken::new();

        let res = manager.handle_message(&Message::text("conv-1", "start"), &cancel).await;
        assert_eq!(res.text, "City?");
        assert_eq!(manager.active_topic_name().await.as_deref(), Some("Child"));
        assert_eq!(manager.suspended_topic_names().await, vec!["Parent"]);

        let res = manager.handle_message(&Message::text("conv-1", "Ghent"), &cancel).await;
        assert_eq!(res.text, "Back with Ghent");
        assert!(res.is_completed);
        assert!(manager.suspended_topic_names().await.is_empty());
        let wf = conv.workflow();
        assert_eq!(wf.get(&keys::subtopic_completion("Child"), json!(null)), json!({ "city": "Ghent" }));
        assert!(!wf.subtopic_timed_out());
    }

    #[tokio::test]
    async fn expired_hand_down_returns_to_parent() {
        let (conv, bus) = setup();
        let (parent, child) = parent_and_child(&conv, &bus, Duration::from_millis(1));
        let manager = TopicManager::builder()
            .conversation(conv.clone())
            .bus(bus)
            .topic(parent)
            .topic(child)
            .build()
            .unwrap();
        let cancel = CancellationToken::new();

        manager.handle_message(&Message::text("conv-1", "start"), &cancel).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let res = manager.handle_message(&Message::text("conv-1", "Ghent"), &cancel).await;
        assert!(res.is_completed);
        assert!(conv.workflow().subtopic_timed_out());
        assert_eq!(manager.active_topic_name().await, None);
    }

    fn waiting_parent(target: &'static str, conv: &SharedConversation, bus: &EventBus) -> SharedTopic {
        Arc::new(
            FlowTopic::builder("Parent")
                .keywords(&["start"])
                .flow(move || {
                    let mut flow = TopicFlow::new("Parent");
                    flow.push(TriggerTopicActivity::wait("hand", target, Duration::from_secs(60)))?;
                    flow.push(FunctionActivity::say("done", "parent done"))?;
                    Ok(flow)
                })
                .build(conv.clone(), bus.clone())
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn unrelated_completion_leaves_parent_suspended() {
        let (conv, bus) = setup();
        let broken = FlowTopic::builder("Child")
            .flow(|| {
                let mut flow = TopicFlow::new("Child");
                flow.push(FunctionActivity::sync("explode", |_, _| {
                    ActivityResult::fail(ActivityError::Execution {
                        activity: "explode".into(),
                        reason: "no backend".into(),
                    })
                }))?;
                Ok(flow)
            })
            .build(conv.clone(), bus.clone())
            .unwrap();
        let manager = TopicManager::builder()
            .conversation(conv.clone())
            .bus(bus.clone())
            .topic(waiting_parent("Child", &conv, &bus))
            .topic(Arc::new(broken))
            .topic(say_topic("Greeting", "hello", "Hi!", &conv, &bus))
            .build()
            .unwrap();
        let cancel = CancellationToken::new();

        manager.handle_message(&Message::text("conv-1", "start"), &cancel).await;
        assert_eq!(manager.suspended_topic_names().await, vec!["Parent"]);

        let res = tokio::time::timeout(
            Duration::from_secs(1),
            manager.handle_message(&Message::text("conv-1", "hello"), &cancel),
        )
        .await
        .expect("greeting turn must not wait on the hand-down");
        assert_eq!(res.text, "Hi!");
        assert_eq!(manager.suspended_topic_names().await, vec!["Parent"]);
        assert!(!conv.workflow().contains(keys::SUBTOPIC_TIMED_OUT));
    }

    #[tokio::test]
    async fn hand_down_to_missing_topic_continues_parent() {
        let (conv, bus) = setup();
        let manager = TopicManager::builder()
            .conversation(conv.clone())
            .bus(bus.clone())
            .topic(waiting_parent("Missing", &conv, &bus))
            .build()
            .unwrap();

        let res = tokio::time::timeout(
            Duration::from_secs(1),
            manager.handle_message(&Message::text("conv-1", "start"), &CancellationToken::new()),
        )
        .await
        .expect("parent must not wait on a missing topic");
        assert!(res.is_completed);
        assert_eq!(res.text, "parent done");
        assert!(conv.workflow().subtopic_timed_out());
        assert!(conv.workflow().subtopic_correlation("Missing").is_none());
        assert_eq!(manager.active_topic_name().await, None);
        assert!(manager.suspended_topic_names().await.is_empty());
        assert_eq!(bus.subscriber_count(EventKind::SubTopicCompleted), 0);
    }

    #[tokio::test]
    async fn reset_clears_state_and_topics() {
        let (conv, bus) = setup();
        let (parent, child) = parent_and_child(&conv, &bus, Duration::from_secs(60));
        let manager = TopicManager::builder()
            .conversation(conv.clone())
            .bus(bus.clone())
            .topic(parent)
            .topic(child)
            .build()
            .unwrap();
        manager.handle_message(&Message::text("conv-1", "start"), &CancellationToken::new()).await;
        conv.workflow().set("user.name", "Ada");

        manager.reset_conversation().await;
        assert_eq!(manager.active_topic_name().await, None);
        assert!(manager.suspended_topic_names().await.is_empty());
        assert!(!conv.workflow().contains("user.name"));
        assert!(conv.workflow().conversation_active());
        assert_eq!(bus.history_for_conversation("conv-1").last().unwrap().kind, EventKind::ConversationReset);
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let (conv, bus) = setup();
        let manager = TopicManager::builder()
            .conversation(conv.clone())
            .bus(bus.clone())
            .topic(say_topic("Greeting", "hello", "Hi!", &conv, &bus))
            .build()
            .unwrap();
        manager.terminate();
        manager.terminate_async(&CancellationToken::new()).await;
        manager.terminate();
        assert!(conv.is_terminated());
        assert!(manager.registry().get_all().iter().all(|t| t.is_terminated()));
        let res = manager.handle_message(&Message::text("conv-1", "hello"), &CancellationToken::new()).await;
        assert!(!res.is_handled);
    }
}
