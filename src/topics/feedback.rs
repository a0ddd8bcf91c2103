use std::sync::Arc;

use serde_json::{json, Value};

use crate::activity::{
    BranchTarget, ConditionalActivity, DecisionActivity, DecisionFunction, DecisionRequest, FnDecision,
    FunctionActivity, InteractiveActivity, TriggerTopicActivity,
};
use crate::event::EventBus;
use crate::flow::session::SharedConversation;
use crate::flow::topic_flow::TopicFlow;
use crate::topic::{priority, FlowTopic, TopicError};

use super::profile;

pub const NAME: &str = "Feedback";

pub const COMMENT: &str = "feedback.comment";
pub const ANALYSIS: &str = "feedback.analysis";

const NEGATIVE: &[&str] = &["bad", "broken", "slow", "hate", "terrible", "awful", "bug", "crash", "worse"];
const POSITIVE: &[&str] = &["good", "great", "love", "excellent", "nice", "fast", "helpful", "awesome"];

/// Word-list sentiment, used when no model is configured.
pub fn keyword_sentiment() -> Arc<dyn DecisionFunction> {
    Arc::new(FnDecision::new("keyword-sentiment", |request: DecisionRequest| async move {
        let text = match &request.input {
            Value::String(s) => s.to_lowercase(),
            other => other.to_string().to_lowercase(),
        };
        let words: Vec<&str> = text.split(|c: char| !c.is_alphanumeric()).collect();
        let count = |list: &[&str]| words.iter().filter(|w| list.contains(w)).count();
        let sentiment = match count(NEGATIVE).cmp(&count(POSITIVE)) {
            std::cmp::Ordering::Greater => "negative",
            std::cmp::Ordering::Less => "positive",
            std::cmp::Ordering::Equal => "neutral",
        };
        let summary: String = text.chars().take(80).collect();
        Ok(json!({ "sentiment": sentiment, "summary": summary }))
    }))
}

/// Takes a comment, classifies it and chains a profile for negative ones.
pub fn topic(
    conversation: SharedConversation,
    bus: EventBus,
    decision: Arc<dyn DecisionFunction>,
) -> Result<FlowTopic, TopicError> {
    FlowTopic::builder(NAME)
        .priority(priority::NORMAL)
        .keywords(&["feedback", "review", "complaint", "suggestion"])
        .flow(move || {
            let mut flow = TopicFlow::new(NAME);
            flow.push(InteractiveActivity::text("comment", "What would you like to tell us?", COMMENT))?;
            flow.push(
                DecisionActivity::new("classify", decision.clone(), ANALYSIS)
                    .input_key(COMMENT)
                    .prompts(
                        "You classify customer feedback as positive, negative or neutral.",
                        "Feedback: {{input}}",
                    )
                    .creativity(0.1)
                    .response_shape(json!({ "sentiment": "neutral", "summary": "" })),
            )?;
            flow.push(
                ConditionalActivity::new(
                    "route",
                    |wf| {
                        wf.get::<Value>(ANALYSIS, Value::Null)["sentiment"]
                            .as_str()
                            .unwrap_or("neutral")
                            .to_string()
                    },
                    BranchTarget::goto("thanks"),
                )
                .branch("negative", BranchTarget::Continue),
            )?;
            flow.push(FunctionActivity::say(
                "apologize",
                "Sorry to hear that. Let's take your details so we can follow up.",
            ))?;
            flow.push(TriggerTopicActivity::fire("follow_up", profile::NAME))?;
            flow.push(FunctionActivity::say(
                "thanks",
                "Thanks for your {{state.[feedback.analysis].sentiment}} feedback!",
            ))?;
            Ok(flow)
        })
        .completion(|wf| wf.get(ANALYSIS, Value::Null))
        .build(conversation, bus)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(input: &str) -> DecisionRequest {
        DecisionRequest {
            input: json!(input),
            evidence: vec![],
            system_prompt: String::new(),
            user_prompt: String::new(),
            creativity: 0.0,
            response_shape: json!({}),
        }
    }

    #[tokio::test]
    async fn keyword_sentiment_classifies() {
        let decide = keyword_sentiment();
        let bad = decide.decide(request("The app is slow and broken")).await.unwrap();
        assert_eq!(bad["sentiment"], "negative");
        let good = decide.decide(request("Great, I love it")).await.unwrap();
        assert_eq!(good["sentiment"], "positive");
        let meh = decide.decide(request("It exists")).await.unwrap();
        assert_eq!(meh["sentiment"], "neutral");
    }
}
