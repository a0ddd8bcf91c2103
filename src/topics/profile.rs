use std::time::Duration;

use serde_json::json;

use crate::activity::{
    AnswerType, BranchTarget, ConditionalActivity, FunctionActivity, InteractiveActivity, TriggerTopicActivity,
    ValidationRule,
};
use crate::event::EventBus;
use crate::flow::session::SharedConversation;
use crate::flow::topic_flow::TopicFlow;
use crate::topic::{priority, FlowTopic, TopicError};

use super::address;

pub const NAME: &str = "Profile";

pub const PROFILE_NAME: &str = "profile.name";
pub const PROFILE_AGE: &str = "profile.age";
pub const WANTS_ADDRESS: &str = "profile.wants_address";

/// Asks for name and age, then optionally hands down to the address topic.
pub fn topic(conversation: SharedConversation, bus: EventBus, address_timeout: Duration) -> Result<FlowTopic, TopicError> {
    FlowTopic::builder(NAME)
        .priority(priority::NORMAL)
        .keywords(&["profile", "sign up", "register", "account"])
        .flow(move || {
            let mut flow = TopicFlow::new(NAME);
            flow.push(InteractiveActivity::text("name", "What's your name?", PROFILE_NAME))?;
            flow.push(
                InteractiveActivity::new(
                    "age",
                    "How old are you, {{state.[profile.name]}}?",
                    AnswerType::Integer,
                    PROFILE_AGE,
                )
                .validate(ValidationRule::Range { min: 1.0, max: 130.0 }),
            )?;
            flow.push(InteractiveActivity::new(
                "wants_address",
                "Do you want to add a postal address?",
                AnswerType::Boolean,
                WANTS_ADDRESS,
            ))?;
            flow.push(
                ConditionalActivity::new(
                    "address_branch",
                    |wf| if wf.get(WANTS_ADDRESS, false) { "yes".into() } else { "no".into() },
                    BranchTarget::goto("summary"),
                )
                .branch("yes", BranchTarget::Continue),
            )?;
            flow.push(TriggerTopicActivity::wait("collect_address", address::NAME, address_timeout))?;
            flow.push(FunctionActivity::say(
                "summary",
                "Thanks {{state.[profile.name]}}, your profile is saved.\
                 {{#if state.[subtopic.timed_out]}} We'll ask for your address another time.\
                 {{else}}{{#if state.[address.city]}} We'll write to you in {{state.[address.city]}}.{{/if}}{{/if}}",
            ))?;
            Ok(flow)
        })
        .completion(|wf| {
            json!({
                "name": wf.get(PROFILE_NAME, String::new()),
                "age": wf.get(PROFILE_AGE, 0i64),
            })
        })
        .build(conversation, bus)
}
