use serde_json::Value;

use crate::activity::{ActivityResult, FunctionActivity};
use crate::event::{EventBus, TopicEvent};
use crate::flow::session::SharedConversation;
use crate::flow::topic_flow::TopicFlow;
use crate::topic::{priority, FlowTopic, TopicError};

pub const NAME: &str = "Reset";

/// Wipes the conversation; asked before any content topic.
pub fn topic(conversation: SharedConversation, bus: EventBus) -> Result<FlowTopic, TopicError> {
    FlowTopic::builder(NAME)
        .priority(priority::SYSTEM)
        .keywords(&["reset", "restart", "start over"])
        .flow(|| {
            let mut flow = TopicFlow::new(NAME);
            flow.push(FunctionActivity::sync("reset", |ctx, _| {
                ctx.push_event(TopicEvent::conversation_reset(ctx.topic_name(), ctx.conversation_id()));
                ctx.say("Okay, let's start over.");
                ActivityResult::next(Value::Null)
            }))?;
            Ok(flow)
        })
        .build(conversation, bus)
}
