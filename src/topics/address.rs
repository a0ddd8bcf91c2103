use serde_json::json;

use crate::activity::{FunctionActivity, InteractiveActivity, ValidationRule};
use crate::event::EventBus;
use crate::flow::session::SharedConversation;
use crate::flow::topic_flow::TopicFlow;
use crate::topic::{priority, FlowTopic, TopicError};

pub const NAME: &str = "Address";

pub const STREET: &str = "address.street";
pub const CITY: &str = "address.city";
pub const POSTCODE: &str = "address.postcode";

/// Collects a postal address. Only reached through a hand-down.
pub fn topic(conversation: SharedConversation, bus: EventBus) -> Result<FlowTopic, TopicError> {
    FlowTopic::builder(NAME)
        .priority(priority::LOW)
        .flow(|| {
            let mut flow = TopicFlow::new(NAME);
            flow.push(InteractiveActivity::text("street", "What's your street and number?", STREET))?;
            flow.push(InteractiveActivity::text("city", "Which city?", CITY))?;
            flow.push(
                InteractiveActivity::text("postcode", "And the postal code?", POSTCODE)
                    .validate(ValidationRule::Regex(r"^[A-Za-z0-9][A-Za-z0-9 -]{1,9}$".into())),
            )?;
            flow.push(FunctionActivity::say(
                "confirm",
                "Got it: {{state.[address.street]}}, {{state.[address.postcode]}} {{state.[address.city]}}.",
            ))?;
            Ok(flow)
        })
        .completion(|wf| {
            json!({
                "street": wf.get(STREET, String::new()),
                "city": wf.get(CITY, String::new()),
                "postcode": wf.get(POSTCODE, String::new()),
            })
        })
        .resume_data(|_| json!({ "source": NAME }))
        .build(conversation, bus)
}
