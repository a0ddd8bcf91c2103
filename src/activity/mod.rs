use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::event::{EventBus, TopicEvent};
use crate::flow::state::WorkflowContext;
use crate::message::Message;

pub mod conditional;
pub mod decision;
pub mod function;
pub mod interactive;
pub mod trigger;

pub use conditional::{BranchTarget, ConditionalActivity};
pub use decision::{DecisionActivity, DecisionError, DecisionFunction, DecisionRequest, FnDecision};
pub use function::FunctionActivity;
pub use interactive::{AnswerType, InteractiveActivity, ValidationRule};
pub use trigger::{TriggerMode, TriggerTopicActivity};

/// Lifecycle of a single activity inside its flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    Pending,
    Running,
    WaitingForInput,
    InputCollected,
    Completed,
    Skipped,
    Failed,
}

impl ActivityState {
    /// Completed, skipped and failed activities never run again.
    pub fn is_final(&self) -> bool {
        matches!(self, ActivityState::Completed | ActivityState::Skipped | ActivityState::Failed)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ActivityError {
    #[error("activity `{activity}` failed: {reason}")]
    Execution { activity: String, reason: String },

    #[error("invalid input for `{activity}`: {reason}")]
    InvalidInput { activity: String, reason: String },

    #[error("decision `{activity}` failed: {reason}")]
    Decision { activity: String, reason: String },

    #[error("no activity `{0}` in this flow")]
    UnknownTarget(String),

    #[error("cannot jump back to already visited activity `{0}`")]
    InvalidTransition(String),

    #[error("turn cancelled")]
    Cancelled,
}

impl ActivityError {
    pub fn execution(activity: &str, reason: impl ToString) -> Self {
        ActivityError::Execution {
            activity: activity.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Where the flow goes after a `Continue`.
#[derive(Clone)]
pub enum Step {
    /// The next activity in insertion order.
    Next,
    /// A later activity of the same flow, skipping everything in between.
    Goto(String),
    /// An activity chosen at runtime. It runs next and the queue resumes after it.
    Run(Arc<dyn Activity>),
}

impl Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Next => f.write_str("Next"),
            Step::Goto(id) => write!(f, "Goto({id})"),
            Step::Run(activity) => write!(f, "Run({})", activity.id()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ActivityResult {
    Continue { payload: Value, step: Step },
    WaitForInput { prompt: String, payload: Value },
    Complete { payload: Value },
    Fail(ActivityError),
}

impl ActivityResult {
    pub fn next(payload: Value) -> Self {
        ActivityResult::Continue {
            payload,
            step: Step::Next,
        }
    }

    pub fn goto(id: &str, payload: Value) -> Self {
        ActivityResult::Continue {
            payload,
            step: Step::Goto(id.to_string()),
        }
    }

    pub fn run(activity: Arc<dyn Activity>) -> Self {
        ActivityResult::Continue {
            payload: Value::Null,
            step: Step::Run(activity),
        }
    }

    pub fn wait(prompt: impl Into<String>) -> Self {
        ActivityResult::WaitForInput {
            prompt: prompt.into(),
            payload: Value::Null,
        }
    }

    /// Suspends with a rendered card next to the prompt.
    pub fn wait_with(prompt: impl Into<String>, payload: Value) -> Self {
        ActivityResult::WaitForInput {
            prompt: prompt.into(),
            payload,
        }
    }

    pub fn complete(payload: Value) -> Self {
        ActivityResult::Complete { payload }
    }

    pub fn fail(error: ActivityError) -> Self {
        ActivityResult::Fail(error)
    }
}

/// Smallest unit of work of a topic flow.
///
/// `input` is only set when the flow resumes an activity that previously
/// returned [`ActivityResult::WaitForInput`].
#[async_trait]
pub trait Activity: Send + Sync + Debug {
    fn id(&self) -> &str;

    fn kind(&self) -> &'static str;

    async fn execute(&self, ctx: &ActivityContext, input: Option<&Message>) -> ActivityResult;
}

/// Everything an activity produced during a turn besides its result.
#[derive(Debug, Default, Clone)]
pub struct TurnOutput {
    pub lines: Vec<String>,
    pub outbox: Vec<TopicEvent>,
    pub next_topic: Option<String>,
}

/// Per-turn handle given to activities.
#[derive(Clone)]
pub struct ActivityContext {
    workflow: Arc<WorkflowContext>,
    message: Message,
    topic_name: String,
    bus: EventBus,
    cancel: CancellationToken,
    output: Arc<Mutex<TurnOutput>>,
}

impl Debug for ActivityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityContext")
            .field("topic", &self.topic_name)
            .field("conversation_id", &self.message.conversation_id())
            .finish()
    }
}

impl ActivityContext {
    pub fn new(
        workflow: Arc<WorkflowContext>,
        message: Message,
        topic_name: &str,
        bus: EventBus,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            workflow,
            message,
            topic_name: topic_name.to_string(),
            bus,
            cancel,
            output: Arc::new(Mutex::new(TurnOutput::default())),
        }
    }

    pub fn workflow(&self) -> &Arc<WorkflowContext> {
        &self.workflow
    }

    /// The message of the current turn.
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn conversation_id(&self) -> &str {
        self.message.conversation_id()
    }

    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }

    fn with_output<R>(&self, f: impl FnOnce(&mut TurnOutput) -> R) -> R {
        let mut out = self.output.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut out)
    }

    /// Adds a line to the text of this turn's reply.
    pub fn say(&self, text: impl Into<String>) {
        let text = text.into();
        if !text.is_empty() {
            self.with_output(|o| o.lines.push(text));
        }
    }

    /// Queues an event for the manager to publish once the turn settles.
    pub fn push_event(&self, event: TopicEvent) {
        self.with_output(|o| o.outbox.push(event));
    }

    /// Asks the manager to activate another topic at the end of this turn.
    pub fn request_topic(&self, topic: &str) {
        self.with_output(|o| o.next_topic = Some(topic.to_string()));
    }

    pub fn take_output(&self) -> TurnOutput {
        self.with_output(std::mem::take)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn ctx_with(workflow: Arc<WorkflowContext>, text: &str) -> ActivityContext {
        ActivityContext::new(
            workflow,
            Message::text("conv-test", text),
            "Test",
            EventBus::default(),
            CancellationToken::new(),
        )
    }

    pub fn ctx(text: &str) -> ActivityContext {
        ctx_with(WorkflowContext::new(), text)
    }
}
