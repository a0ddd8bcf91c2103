use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::activity::{Activity, ActivityContext, ActivityError, ActivityResult, ActivityState, Step};
use crate::event::TopicEvent;
use crate::message::Message;
use crate::topic::result::TopicResult;

/// States of the flow engine. Concrete topics may add their own through
/// [`FlowState::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Idle,
    Starting,
    Running,
    WaitingForInput,
    Completed,
    Error,
    Custom(String),
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowState::Custom(name) => write!(f, "custom({name})"),
            other => write!(f, "{other:?}"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FlowError {
    #[error("activity id `{0}` is already used in this flow")]
    DuplicateActivity(String),
    #[error("no activity `{0}` in this flow")]
    UnknownActivity(String),
    #[error("activity `{0}` already ran and cannot be replaced")]
    AlreadyExecuted(String),
    #[error("flow is {0}, not waiting for input")]
    NotWaiting(FlowState),
}

pub type ObserverId = u64;

/// Structured replacement for per-activity callbacks.
pub trait FlowObserver: Send + Sync {
    fn activity_started(&self, _topic: &str, _activity_id: &str) {}

    fn activity_finished(&self, _topic: &str, _activity_id: &str, _state: ActivityState) {}
}

struct Slot {
    activity: Arc<dyn Activity>,
    state: ActivityState,
}

#[derive(Clone)]
enum Current {
    Slot(usize),
    Dynamic(Arc<dyn Activity>),
}

/// Queue of activities driven one at a time by a small state machine.
///
/// Activities run in insertion order. A conditional may jump forward or slot
/// in a runtime-built activity; nothing ever jumps back, so an activity that
/// finished is never executed again. `WaitForInput` suspends the flow until
/// [`TopicFlow::resume`] hands in the next message.
pub struct TopicFlow {
    name: String,
    slots: Vec<Slot>,
    index: HashMap<String, usize>,
    cursor: usize,
    dynamic: Option<(Arc<dyn Activity>, ActivityState)>,
    state: FlowState,
    last_prompt: Option<(String, Value)>,
    last_payload: Value,
    observers: Vec<(ObserverId, Arc<dyn FlowObserver>)>,
    next_observer: ObserverId,
}

impl fmt::Debug for TopicFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicFlow")
            .field("name", &self.name)
            .field("activities", &self.ids())
            .field("cursor", &self.cursor)
            .field("state", &self.state)
            .finish()
    }
}

impl TopicFlow {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            slots: Vec::new(),
            index: HashMap::new(),
            cursor: 0,
            dynamic: None,
            state: FlowState::Idle,
            last_prompt: None,
            last_payload: Value::Null,
            observers: Vec::new(),
            next_observer: 1,
        }
    }

    pub fn with_activities(name: &str, activities: Vec<Arc<dyn Activity>>) -> Result<Self, FlowError> {
        let mut flow = Self::new(name);
        for activity in activities {
            flow.push_arc(activity)?;
        }
        Ok(flow)
    }

    pub fn push(&mut self, activity: impl Activity + 'static) -> Result<&mut Self, FlowError> {
        self.push_arc(Arc::new(activity))
    }

    /// Enqueues an activity. Ids must be unique within the flow.
    pub fn push_arc(&mut self, activity: Arc<dyn Activity>) -> Result<&mut Self, FlowError> {
        let id = activity.id().to_string();
        if self.index.contains_key(&id) {
            return Err(FlowError::DuplicateActivity(id));
        }
        self.index.insert(id, self.slots.len());
        self.slots.push(Slot {
            activity,
            state: ActivityState::Pending,
        });
        Ok(self)
    }

    /// Swaps an activity that has not run yet, returning the old one.
    pub fn replace_activity(&mut self, id: &str, activity: Arc<dyn Activity>) -> Result<Arc<dyn Activity>, FlowError> {
        let idx = *self
            .index
            .get(id)
            .ok_or_else(|| FlowError::UnknownActivity(id.to_string()))?;
        if self.slots[idx].state != ActivityState::Pending {
            return Err(FlowError::AlreadyExecuted(id.to_string()));
        }
        let new_id = activity.id().to_string();
        if new_id != id && self.index.contains_key(&new_id) {
            return Err(FlowError::DuplicateActivity(new_id));
        }
        self.index.remove(id);
        self.index.insert(new_id, idx);
        let old = std::mem::replace(&mut self.slots[idx].activity, activity);
        debug!(flow = %self.name, replaced = id, "activity replaced");
        Ok(old)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.activity.id().to_string()).collect()
    }

    pub fn state(&self) -> &FlowState {
        &self.state
    }

    /// Moves a flow that is not suspended into a domain specific state.
    pub fn set_custom_state(&mut self, name: &str) {
        if self.state != FlowState::WaitingForInput {
            self.state = FlowState::Custom(name.to_string());
        }
    }

    pub fn activity_state(&self, id: &str) -> Option<ActivityState> {
        self.index.get(id).map(|&i| self.slots[i].state)
    }

    fn current(&self) -> Option<Current> {
        if let Some((activity, _)) = &self.dynamic {
            return Some(Current::Dynamic(activity.clone()));
        }
        (self.cursor < self.slots.len()).then_some(Current::Slot(self.cursor))
    }

    fn activity_of(&self, current: &Current) -> Arc<dyn Activity> {
        match current {
            Current::Slot(i) => self.slots[*i].activity.clone(),
            Current::Dynamic(a) => a.clone(),
        }
    }

    pub fn current_activity(&self) -> Option<Arc<dyn Activity>> {
        self.current().map(|c| self.activity_of(&c))
    }

    pub fn current_activity_id(&self) -> Option<String> {
        self.current_activity().map(|a| a.id().to_string())
    }

    fn set_activity_state(&mut self, current: &Current, state: ActivityState) {
        match current {
            Current::Slot(i) => self.slots[*i].state = state,
            Current::Dynamic(_) => {
                if let Some((_, s)) = self.dynamic.as_mut() {
                    *s = state;
                }
            }
        }
    }

    pub fn observe(&mut self, observer: Arc<dyn FlowObserver>) -> ObserverId {
        let id = self.next_observer;
        self.next_observer += 1;
        self.observers.push((id, observer));
        id
    }

    pub fn unobserve(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(oid, _)| *oid != id);
        before != self.observers.len()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn clear_observers(&mut self) {
        self.observers.clear();
    }

    fn notify_started(&self, activity_id: &str) {
        for (_, o) in &self.observers {
            o.activity_started(&self.name, activity_id);
        }
    }

    fn notify_finished(&self, activity_id: &str, state: ActivityState) {
        for (_, o) in &self.observers {
            o.activity_finished(&self.name, activity_id, state);
        }
    }

    /// Back to an empty, idle flow. Observers are dropped too.
    pub fn reset(&mut self) {
        self.slots.clear();
        self.index.clear();
        self.cursor = 0;
        self.dynamic = None;
        self.state = FlowState::Idle;
        self.last_prompt = None;
        self.last_payload = Value::Null;
        self.observers.clear();
    }

    /// Starts the flow or continues it from the current activity.
    ///
    /// A suspended flow repeats its pending prompt; a finished one reports
    /// completion again without running anything.
    pub async fn run(&mut self, ctx: &ActivityContext) -> TopicResult {
        match self.state.clone() {
            FlowState::Idle => {
                self.state = FlowState::Starting;
                debug!(flow = %self.name, activities = self.slots.len(), "flow starting");
                self.state = FlowState::Running;
                self.drive(ctx, None).await
            }
            FlowState::Starting | FlowState::Running | FlowState::Custom(_) => {
                self.state = FlowState::Running;
                self.drive(ctx, None).await
            }
            FlowState::WaitingForInput => {
                let (prompt, card) = self.last_prompt.clone().unwrap_or_default();
                let mut result = TopicResult::needs_input(prompt);
                if !card.is_null() {
                    result.rendered = Some(card.to_string());
                }
                result
            }
            FlowState::Completed => TopicResult::completed("").with_completion(self.last_payload.clone()),
            FlowState::Error => TopicResult::failed("", "flow already failed"),
        }
    }

    /// Hands `input` to the suspended activity and keeps going.
    pub async fn resume(&mut self, input: &Message, ctx: &ActivityContext) -> Result<TopicResult, FlowError> {
        if self.state != FlowState::WaitingForInput {
            return Err(FlowError::NotWaiting(self.state.clone()));
        }
        if let Some(current) = self.current() {
            self.set_activity_state(&current, ActivityState::InputCollected);
        }
        self.state = FlowState::Running;
        Ok(self.drive(ctx, Some(input.clone())).await)
    }

    async fn drive(&mut self, ctx: &ActivityContext, mut input: Option<Message>) -> TopicResult {
        loop {
            let Some(current) = self.current() else {
                let payload = self.last_payload.clone();
                return self.finish(ctx, payload);
            };
            let activity = self.activity_of(&current);
            let id = activity.id().to_string();
            let resuming = input.is_some();

            self.set_activity_state(&current, ActivityState::Running);
            self.notify_started(&id);
            debug!(flow = %self.name, activity = %id, kind = activity.kind(), resuming, "running activity");

            let result = tokio::select! {
                biased;
                _ = ctx.cancel().cancelled() => ActivityResult::Fail(ActivityError::Cancelled),
                r = activity.execute(ctx, input.as_ref()) => r,
            };
            input = None;

            match result {
                ActivityResult::Continue { payload, step } => {
                    self.set_activity_state(&current, ActivityState::Completed);
                    self.notify_finished(&id, ActivityState::Completed);
                    self.last_payload = payload;
                    let moved = match step {
                        Step::Next => {
                            self.advance(&current);
                            Ok(())
                        }
                        Step::Goto(target) => self.jump(&current, &target),
                        Step::Run(next) => {
                            debug!(flow = %self.name, activity = %next.id(), "running activity chosen at runtime");
                            self.advance(&current);
                            self.dynamic = Some((next, ActivityState::Pending));
                            Ok(())
                        }
                    };
                    if let Err(err) = moved {
                        return self.fail(ctx, &id, err);
                    }
                }
                ActivityResult::WaitForInput { prompt, payload } => {
                    self.set_activity_state(&current, ActivityState::WaitingForInput);
                    self.notify_finished(&id, ActivityState::WaitingForInput);
                    self.state = FlowState::WaitingForInput;
                    self.last_prompt = Some((prompt.clone(), payload.clone()));

                    let mut result = self.settle(ctx, TopicResult::needs_input(""), Some(&prompt));
                    if !payload.is_null() {
                        result.rendered = Some(payload.to_string());
                        result.outbox.push(TopicEvent::card_displayed(
                            ctx.topic_name(),
                            ctx.conversation_id(),
                            &id,
                            payload,
                        ));
                    }
                    return result;
                }
                ActivityResult::Complete { payload } => {
                    self.set_activity_state(&current, ActivityState::Completed);
                    self.notify_finished(&id, ActivityState::Completed);
                    for slot in self.slots.iter_mut().filter(|s| s.state == ActivityState::Pending) {
                        slot.state = ActivityState::Skipped;
                    }
                    self.dynamic = None;
                    self.cursor = self.slots.len();
                    return self.finish(ctx, payload);
                }
                ActivityResult::Fail(ActivityError::Cancelled) => {
                    let (back, state) = if resuming {
                        (ActivityState::WaitingForInput, FlowState::WaitingForInput)
                    } else {
                        (ActivityState::Pending, FlowState::Running)
                    };
                    self.set_activity_state(&current, back);
                    self.state = state;
                    warn!(flow = %self.name, activity = %id, "turn cancelled, activity left resumable");
                    let _ = ctx.take_output();
                    return TopicResult::cancelled();
                }
                ActivityResult::Fail(err) => {
                    self.set_activity_state(&current, ActivityState::Failed);
                    self.notify_finished(&id, ActivityState::Failed);
                    return self.fail(ctx, &id, err);
                }
            }
        }
    }

    fn advance(&mut self, current: &Current) {
        match current {
            Current::Slot(i) => self.cursor = i + 1,
            Current::Dynamic(_) => self.dynamic = None,
        }
    }

    fn jump(&mut self, current: &Current, target: &str) -> Result<(), ActivityError> {
        let idx = *self
            .index
            .get(target)
            .ok_or_else(|| ActivityError::UnknownTarget(target.to_string()))?;
        let floor = match current {
            Current::Slot(i) => i + 1,
            Current::Dynamic(_) => self.cursor,
        };
        if idx < floor {
            return Err(ActivityError::InvalidTransition(target.to_string()));
        }
        for slot in &mut self.slots[floor..idx] {
            slot.state = ActivityState::Skipped;
        }
        self.cursor = idx;
        self.dynamic = None;
        Ok(())
    }

    fn settle(&self, ctx: &ActivityContext, mut result: TopicResult, prompt: Option<&str>) -> TopicResult {
        let output = ctx.take_output();
        let mut lines = output.lines;
        if let Some(prompt) = prompt.filter(|p| !p.is_empty()) {
            lines.push(prompt.to_string());
        }
        result.text = lines.join("\n");
        result.outbox.extend(output.outbox);
        if output.next_topic.is_some() {
            result.next_topic_name = output.next_topic;
        }
        result
    }

    fn finish(&mut self, ctx: &ActivityContext, payload: Value) -> TopicResult {
        self.state = FlowState::Completed;
        self.last_payload = payload.clone();
        info!(flow = %self.name, "flow completed");
        self.settle(ctx, TopicResult::completed("").with_completion(payload), None)
    }

    fn fail(&mut self, ctx: &ActivityContext, activity_id: &str, err: ActivityError) -> TopicResult {
        self.state = FlowState::Error;
        warn!(flow = %self.name, activity = %activity_id, error = %err, "flow failed");
        let event = TopicEvent::activity_failed(ctx.topic_name(), ctx.conversation_id(), activity_id, &err.to_string());
        self.settle(ctx, TopicResult::failed("", &err), None).with_event(event)
    }
}
