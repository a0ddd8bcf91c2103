use crate::activity::FunctionActivity;
use crate::event::EventBus;
use crate::flow::session::SharedConversation;
use crate::flow::topic_flow::TopicFlow;
use crate::topic::{priority, FlowTopic, TopicError};

pub const NAME: &str = "Greeting";

pub fn topic(conversation: SharedConversation, bus: EventBus) -> Result<FlowTopic, TopicError> {
    FlowTopic::builder(NAME)
        .priority(priority::NORMAL)
        .keywords(&["hello", "hi", "hey", "good morning", "good evening"])
        .flow(|| {
            let mut flow = TopicFlow::new(NAME);
            flow.push(FunctionActivity::say(
                "welcome",
                "Hello! I can set up your {{#if state.[profile.name]}}profile again{{else}}profile{{/if}} or take your feedback.",
            ))?;
            Ok(flow)
        })
        .build(conversation, bus)
}
