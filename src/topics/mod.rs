//! Topics shipped with the console demo.

use std::sync::Arc;

use crate::activity::DecisionFunction;
use crate::config::OrchestratorConfig;
use crate::event::EventBus;
use crate::flow::session::SharedConversation;
use crate::topic::{DefaultTopic, TopicError, TopicManager};

pub mod address;
pub mod feedback;
pub mod greeting;
pub mod profile;
pub mod reset;

pub use feedback::keyword_sentiment;

/// Wires every built-in topic for one conversation.
pub fn build_demo_manager(
    conversation: SharedConversation,
    bus: EventBus,
    config: OrchestratorConfig,
    decision: Arc<dyn DecisionFunction>,
) -> Result<TopicManager, TopicError> {
    TopicManager::builder()
        .topic(Arc::new(DefaultTopic::new(&config.default_topic)))
        .topic(Arc::new(greeting::topic(conversation.clone(), bus.clone())?))
        .topic(Arc::new(reset::topic(conversation.clone(), bus.clone())?))
        .topic(Arc::new(profile::topic(conversation.clone(), bus.clone(), config.subtopic_timeout)?))
        .topic(Arc::new(address::topic(conversation.clone(), bus.clone())?))
        .topic(Arc::new(feedback::topic(conversation.clone(), bus.clone(), decision)?))
        .conversation(conversation)
        .bus(bus)
        .config(config)
        .build()
}
