use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{Activity, ActivityContext, ActivityError, ActivityResult};
use crate::event::{CompletionAwaiter, EventKind, TopicEvent, WaitError};
use crate::flow::state::keys;
use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Chain the sub-topic for later and keep going.
    FireAndContinue,
    /// Hand control to the sub-topic and resume once it reports completion.
    WaitForCompletion,
}

#[derive(Debug)]
struct PendingWait {
    correlation_id: String,
    awaiter: CompletionAwaiter,
}

/// Starts another topic from inside a flow.
///
/// In wait mode the activity suspends its flow, asks the manager to activate
/// the target and subscribes for a [`EventKind::SubTopicCompleted`] event
/// carrying a fresh correlation id. When resumed it copies the completion
/// payload and resume data into `subtopic.*` keys and continues. A wait has a
/// deadline; past it the activity sets `subtopic.timed_out` and continues
/// without the sub-topic's result. The pending wait stays in place until it
/// resolves, so a turn dropped mid-wait can be resumed later.
#[derive(Debug)]
pub struct TriggerTopicActivity {
    id: String,
    target: String,
    mode: TriggerMode,
    timeout: Duration,
    pending: Mutex<Option<PendingWait>>,
}

impl TriggerTopicActivity {
    pub fn fire(id: &str, target: &str) -> Self {
        Self::new(id, target, TriggerMode::FireAndContinue, Duration::ZERO)
    }

    pub fn wait(id: &str, target: &str, timeout: Duration) -> Self {
        Self::new(id, target, TriggerMode::WaitForCompletion, timeout)
    }

    fn new(id: &str, target: &str, mode: TriggerMode, timeout: Duration) -> Self {
        Self {
            id: id.to_string(),
            target: target.to_string(),
            mode,
            timeout,
            pending: Mutex::new(None),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn mode(&self) -> TriggerMode {
        self.mode
    }

    fn fire_and_continue(&self, ctx: &ActivityContext) -> ActivityResult {
        ctx.workflow().push_topic_chain(&self.target);
        ctx.push_event(TopicEvent::transition_requested(
            ctx.topic_name(),
            ctx.conversation_id(),
            &self.target,
            "chain",
        ));
        info!(activity = %self.id, target = %self.target, "sub-topic chained");
        ActivityResult::next(json!({ "chained": self.target }))
    }

    async fn hand_down(&self, ctx: &ActivityContext) -> ActivityResult {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let awaiter = ctx.bus().awaiter(EventKind::SubTopicCompleted, &correlation_id);

        let wf = ctx.workflow();
        wf.set_subtopic_correlation(&self.target, &correlation_id);
        let window = i64::try_from(self.timeout.as_millis()).unwrap_or(i64::MAX);
        let deadline = Utc::now().timestamp_millis().saturating_add(window);
        wf.set_subtopic_deadline(&self.target, deadline);
        wf.remove(keys::SUBTOPIC_TIMED_OUT);

        *self.pending.lock().await = Some(PendingWait {
            correlation_id: correlation_id.clone(),
            awaiter,
        });

        ctx.request_topic(&self.target);
        ctx.push_event(
            TopicEvent::transition_requested(ctx.topic_name(), ctx.conversation_id(), &self.target, "wait")
                .with_correlation(&correlation_id),
        );
        info!(activity = %self.id, target = %self.target, %correlation_id, "handing down to sub-topic");
        ActivityResult::wait("")
    }

    async fn regain_control(&self, ctx: &ActivityContext) -> ActivityResult {
        let wf = ctx.workflow();
        let mut pending = self.pending.lock().await;
        let Some(wait) = pending.as_mut() else {
            warn!(activity = %self.id, "resumed without a pending hand-down");
            return ActivityResult::next(Value::Null);
        };
        let correlation_id = wait.correlation_id.clone();

        let remaining = wf
            .subtopic_deadline(&self.target)
            .map(|deadline| deadline.saturating_sub(Utc::now().timestamp_millis()).max(0) as u64)
            .map(Duration::from_millis)
            .unwrap_or(Duration::ZERO);

        let outcome = wait.awaiter.wait(remaining, ctx.cancel()).await;
        if matches!(outcome, Err(WaitError::Cancelled)) {
            // still suspended; a later turn completes or times out the wait
            warn!(activity = %self.id, %correlation_id, "hand-down wait cancelled");
            return ActivityResult::fail(ActivityError::Cancelled);
        }
        *pending = None;
        drop(pending);
        wf.clear_subtopic_deadline(&self.target);
        wf.take_subtopic_correlation(&self.target);

        match outcome {
            Ok(event) => {
                let completion = event.payload.get("completion").cloned().unwrap_or(Value::Null);
                let resume_data = event.payload.get("resume_data").cloned().unwrap_or(Value::Null);
                wf.set_json(keys::SUBTOPIC_COMPLETION, completion.clone());
                wf.set_json(&keys::subtopic_completion(&self.target), completion.clone());
                wf.set_json(keys::SUBTOPIC_RESUME_DATA, resume_data);
                wf.set(keys::SUBTOPIC_TIMED_OUT, false);
                info!(activity = %self.id, target = %self.target, %correlation_id, "regained control from sub-topic");
                ActivityResult::next(completion)
            }
            Err(err) => {
                warn!(activity = %self.id, target = %self.target, %correlation_id, error = %err, "sub-topic did not complete in time, continuing");
                wf.set(keys::SUBTOPIC_TIMED_OUT, true);
                ActivityResult::next(Value::Null)
            }
        }
    }
}

#[async_trait]
impl Activity for TriggerTopicActivity {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "trigger"
    }

    async fn execute(&self, ctx: &ActivityContext, input: Option<&Message>) -> ActivityResult {
        match (self.mode, input) {
            (TriggerMode::FireAndContinue, _) => self.fire_and_continue(ctx),
            (TriggerMode::WaitForCompletion, None) => self.hand_down(ctx).await,
            (TriggerMode::WaitForCompletion, Some(_)) => self.regain_control(ctx).await,
        }
    }
}
