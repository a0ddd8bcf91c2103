use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{keyword_confidence, Topic, TopicError, TopicResult};
use crate::activity::ActivityContext;
use crate::event::{EventBus, TopicEvent};
use crate::flow::session::SharedConversation;
use crate::flow::state::WorkflowContext;
use crate::flow::topic_flow::{FlowError, FlowObserver, FlowState, ObserverId, TopicFlow};
use crate::message::Message;

pub type FlowFactory = Arc<dyn Fn() -> Result<TopicFlow, FlowError> + Send + Sync>;
pub type ConfidenceFn = Arc<dyn Fn(&Message, &WorkflowContext) -> Result<f32, TopicError> + Send + Sync>;
pub type PayloadFn = Arc<dyn Fn(&WorkflowContext) -> Value + Send + Sync>;

/// A topic whose behaviour is a [`TopicFlow`] built by a factory.
///
/// Topics are composed, not subclassed: the factory supplies the ordered
/// activities, the confidence function decides routing. When the flow
/// completes while a parent waits on this topic, the topic publishes the
/// sub-topic completion event carrying the parent's correlation id.
pub struct FlowTopic {
    name: String,
    priority: i32,
    confidence: ConfidenceFn,
    factory: FlowFactory,
    completion: Option<PayloadFn>,
    resume_data: Option<PayloadFn>,
    flow: Mutex<TopicFlow>,
    conversation: SharedConversation,
    bus: EventBus,
    terminated: AtomicBool,
}

impl fmt::Debug for FlowTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowTopic")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

pub struct FlowTopicBuilder {
    name: String,
    priority: i32,
    confidence: Option<ConfidenceFn>,
    factory: Option<FlowFactory>,
    completion: Option<PayloadFn>,
    resume_data: Option<PayloadFn>,
}

impl FlowTopicBuilder {
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn confidence<F>(mut self, f: F) -> Self
    where
        F: Fn(&Message, &WorkflowContext) -> Result<f32, TopicError> + Send + Sync + 'static,
    {
        self.confidence = Some(Arc::new(f));
        self
    }

    pub fn keywords(self, keywords: &[&str]) -> Self {
        let keywords: Vec<String> = keywords.iter().map(|k| k.to_string()).collect();
        self.confidence(move |msg, _| {
            let refs: Vec<&str> = keywords.iter().map(String::as_str).collect();
            Ok(keyword_confidence(msg, &refs))
        })
    }

    pub fn flow<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<TopicFlow, FlowError> + Send + Sync + 'static,
    {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Builds the payload reported to a waiting parent on completion.
    pub fn completion<F>(mut self, f: F) -> Self
    where
        F: Fn(&WorkflowContext) -> Value + Send + Sync + 'static,
    {
        self.completion = Some(Arc::new(f));
        self
    }

    pub fn resume_data<F>(mut self, f: F) -> Self
    where
        F: Fn(&WorkflowContext) -> Value + Send + Sync + 'static,
    {
        self.resume_data = Some(Arc::new(f));
        self
    }

    /// Fails fast when the flow factory is missing or builds an invalid flow.
    pub fn build(self, conversation: SharedConversation, bus: EventBus) -> Result<FlowTopic, TopicError> {
        let factory = self.factory.ok_or(TopicError::MissingCollaborator("flow factory"))?;
        let flow = factory()?;
        Ok(FlowTopic {
            name: self.name,
            priority: self.priority,
            confidence: self.confidence.unwrap_or_else(|| Arc::new(never_confident)),
            factory,
            completion: self.completion,
            resume_data: self.resume_data,
            flow: Mutex::new(flow),
            conversation,
            bus,
            terminated: AtomicBool::new(false),
        })
    }
}

fn never_confident(_: &Message, _: &WorkflowContext) -> Result<f32, TopicError> {
    Ok(0.0)
}

impl FlowTopic {
    pub fn builder(name: &str) -> FlowTopicBuilder {
        FlowTopicBuilder {
            name: name.to_string(),
            priority: super::priority::NORMAL,
            confidence: None,
            factory: None,
            completion: None,
            resume_data: None,
        }
    }

    pub async fn flow_state(&self) -> FlowState {
        self.flow.lock().await.state().clone()
    }

    pub async fn observe(&self, observer: Arc<dyn FlowObserver>) -> ObserverId {
        self.flow.lock().await.observe(observer)
    }

    pub async fn unobserve(&self, id: ObserverId) -> bool {
        self.flow.lock().await.unobserve(id)
    }

    /// Runs `f` against the current flow, e.g. to swap an activity.
    pub async fn with_flow<R>(&self, f: impl FnOnce(&mut TopicFlow) -> R) -> R {
        let mut flow = self.flow.lock().await;
        f(&mut flow)
    }

    fn rebuild(&self, flow: &mut TopicFlow) {
        match (self.factory)() {
            Ok(fresh) => *flow = fresh,
            Err(err) => {
                error!(topic = %self.name, error = %err, "could not rebuild flow");
                flow.reset();
            }
        }
    }

    async fn report_completion(&self, result: &mut TopicResult) {
        let wf = self.conversation.workflow();
        if let Some(f) = &self.completion {
            result.completion = f(&wf);
        }
        let Some(correlation_id) = wf.take_subtopic_correlation(&self.name) else {
            return;
        };
        let resume_data = self.resume_data.as_ref().map(|f| f(&wf)).unwrap_or(Value::Null);
        info!(topic = %self.name, %correlation_id, "sub-topic completed, notifying parent");
        self.bus
            .publish(TopicEvent::sub_topic_completed(
                &self.name,
                self.conversation.conversation_id(),
                &correlation_id,
                result.completion.clone(),
                resume_data,
            ))
            .await;
    }
}

#[async_trait]
impl Topic for FlowTopic {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn can_handle(&self, message: &Message, cancel: &CancellationToken) -> Result<f32, TopicError> {
        if cancel.is_cancelled() {
            return Err(TopicError::Cancelled);
        }
        if self.is_terminated() {
            return Ok(0.0);
        }
        // a parent blocked on a hand-down is resumed by the manager, not by routing
        if let Ok(flow) = self.flow.try_lock() {
            let handing_down = flow.state() == &FlowState::WaitingForInput
                && flow.current_activity().is_some_and(|a| a.kind() == "trigger");
            if handing_down {
                return Ok(0.0);
            }
        }
        let score = (self.confidence)(message, &self.conversation.workflow())?;
        Ok(score.clamp(0.0, 1.0))
    }

    #[tracing::instrument(name = "flow_topic_process", skip(self, message, cancel), fields(topic = %self.name))]
    async fn process_message(&self, message: &Message, cancel: &CancellationToken) -> TopicResult {
        if self.is_terminated() {
            warn!("message sent to a terminated topic");
            return TopicResult::not_handled();
        }

        let mut flow = self.flow.lock().await;
        if matches!(flow.state(), FlowState::Completed | FlowState::Error) {
            self.rebuild(&mut flow);
        }

        let ctx = ActivityContext::new(
            self.conversation.workflow(),
            message.clone(),
            &self.name,
            self.bus.clone(),
            cancel.clone(),
        );

        let mut result = if flow.state() == &FlowState::WaitingForInput {
            match flow.resume(message, &ctx).await {
                Ok(result) => result,
                Err(err) => TopicResult::failed("", err),
            }
        } else {
            flow.run(&ctx).await
        };
        drop(flow);

        if result.is_completed {
            self.report_completion(&mut result).await;
        }
        result
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn terminate(&self) -> Result<(), TopicError> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.flow.try_lock() {
            Ok(mut flow) => flow.reset(),
            Err(_) => warn!(topic = %self.name, "flow busy during terminate, left for drop"),
        }
        info!(topic = %self.name, "topic terminated");
        Ok(())
    }

    async fn terminate_async(&self, _cancel: &CancellationToken) -> Result<(), TopicError> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.flow.lock().await.reset();
        info!(topic = %self.name, "topic terminated");
        Ok(())
    }

    async fn reset(&self) {
        let mut flow = self.flow.lock().await;
        self.rebuild(&mut flow);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{FunctionActivity, InteractiveActivity};
    use crate::event::EventKind;
    use crate::flow::session::{Conversation, ConversationContext};
    use serde_json::json;

    fn name_topic(conv: SharedConversation, bus: EventBus) -> FlowTopic {
        FlowTopic::builder("Name")
            .keywords(&["name"])
            .flow(|| {
                let mut flow = TopicFlow::new("Name");
                flow.push(InteractiveActivity::text("ask", "Your name?", "name.value"))?;
                flow.push(FunctionActivity::say("thanks", "Thanks {{state.[name.value]}}"))?;
                Ok(flow)
            })
            .completion(|wf| json!({ "name": wf.get("name.value", String::new()) }))
            .build(conv, bus)
            .unwrap()
    }

    #[tokio::test]
    async fn runs_and_restarts_after_completion() {
        let conv = Conversation::new("c1");
        let topic = name_topic(conv.clone(), EventBus::default());
        let cancel = CancellationToken::new();

        let first = topic.process_message(&Message::text("c1", "my name"), &cancel).await;
        assert_eq!(first.text, "Your name?");
        let done = topic.process_message(&Message::text("c1", "Ada"), &cancel).await;
        assert!(done.is_completed);
        assert_eq!(done.completion, json!({ "name": "Ada" }));
        assert_eq!(topic.flow_state().await, FlowState::Completed);

        let again = topic.process_message(&Message::text("c1", "name"), &cancel).await;
        assert_eq!(again.text, "Your name?");
    }

    #[tokio::test]
    async fn completion_notifies_waiting_parent() {
        let conv = Conversation::new("c1");
        let bus = EventBus::default();
        let topic = name_topic(conv.clone(), bus.clone());
        conv.workflow().set_subtopic_correlation("Name", "corr-1");
        let cancel = CancellationToken::new();

        topic.process_message(&Message::text("c1", "x"), &cancel).await;
        topic.process_message(&Message::text("c1", "Ada"), &cancel).await;

        let events = bus.history_for_correlation("corr-1");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::SubTopicCompleted);
        assert_eq!(events[0].payload["completion"], json!({ "name": "Ada" }));
        assert!(conv.workflow().subtopic_correlation("Name").is_none());
    }

    #[tokio::test]
    async fn confidence_and_termination() {
        let conv = Conversation::new("c1");
        let topic = name_topic(conv, EventBus::default());
        let cancel = CancellationToken::new();
        assert_eq!(topic.can_handle(&Message::text("c1", "change my name"), &cancel).await.unwrap(), 0.8);

        topic.terminate().unwrap();
        topic.terminate_async(&cancel).await.unwrap();
        assert!(topic.is_terminated());
        assert_eq!(topic.can_handle(&Message::text("c1", "name"), &cancel).await.unwrap(), 0.0);
        assert!(!topic.process_message(&Message::text("c1", "name"), &cancel).await.is_handled);
    }

    #[test]
    fn invalid_flow_fails_at_construction() {
        let res = FlowTopic::builder("Broken")
            .flow(|| {
                let mut flow = TopicFlow::new("Broken");
                flow.push(FunctionActivity::say("a", "x"))?;
                flow.push(FunctionActivity::say("a", "y"))?;
                Ok(flow)
            })
            .build(Conversation::new("c"), EventBus::default());
        assert!(matches!(res, Err(TopicError::Flow(FlowError::DuplicateActivity(_)))));

        let res = FlowTopic::builder("NoFlow").build(Conversation::new("c"), EventBus::default());
        assert!(matches!(res, Err(TopicError::MissingCollaborator(_))));
    }
}
