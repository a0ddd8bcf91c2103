use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::{Activity, ActivityContext, ActivityResult};
use crate::message::Message;
use crate::util::{render_handlebars, state_data};

/// How a reply is parsed.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnswerType {
    Text,
    Number,
    Integer,
    /// yes/no style answers
    Boolean,
    /// RFC3339 or YYYY-MM-DD
    Date,
    Choice { options: Vec<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ValidationRule {
    Regex(String),
    Range { min: f64, max: f64 },
}

/// Asks a question, suspends, and stores the parsed answer on resume.
///
/// The prompt is a Handlebars template rendered over the workflow context
/// (`{{state.[profile.name]}}`). An answer that does not parse re-asks the same
/// question without advancing. Specific answers can route to an explicit
/// next activity id.
#[derive(Debug, Clone)]
pub struct InteractiveActivity {
    id: String,
    prompt: String,
    answer_type: AnswerType,
    validate: Option<ValidationRule>,
    state_key: String,
    routes: HashMap<String, String>,
}

impl InteractiveActivity {
    pub fn new(id: &str, prompt: &str, answer_type: AnswerType, state_key: &str) -> Self {
        Self {
            id: id.to_string(),
            prompt: prompt.to_string(),
            answer_type,
            validate: None,
            state_key: state_key.to_string(),
            routes: HashMap::new(),
        }
    }

    pub fn text(id: &str, prompt: &str, state_key: &str) -> Self {
        Self::new(id, prompt, AnswerType::Text, state_key)
    }

    pub fn validate(mut self, rule: ValidationRule) -> Self {
        self.validate = Some(rule);
        self
    }

    /// Jump to `next_id` when the answer equals `answer` (case-insensitive).
    pub fn route(mut self, answer: &str, next_id: &str) -> Self {
        self.routes.insert(answer.to_lowercase(), next_id.to_string());
        self
    }

    pub fn state_key(&self) -> &str {
        &self.state_key
    }

    fn render_prompt(&self, ctx: &ActivityContext) -> String {
        render_handlebars(&self.prompt, &state_data(ctx.workflow()))
    }

    fn card(&self) -> Value {
        match &self.answer_type {
            AnswerType::Choice { options } => json!({ "type": "choice", "options": options }),
            AnswerType::Boolean => json!({ "type": "choice", "options": ["yes", "no"] }),
            _ => Value::Null,
        }
    }

    fn route_for(&self, value: &Value) -> Option<&String> {
        if self.routes.is_empty() {
            return None;
        }
        let key = match value {
            Value::String(s) => s.to_lowercase(),
            other => other.to_string().to_lowercase(),
        };
        self.routes.get(&key)
    }
}

#[async_trait]
impl Activity for InteractiveActivity {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "interactive"
    }

    async fn execute(&self, ctx: &ActivityContext, input: Option<&Message>) -> ActivityResult {
        let Some(input) = input else {
            return ActivityResult::wait_with(self.render_prompt(ctx), self.card());
        };

        let raw = match input.text_content() {
            "" => input.payload().as_str().unwrap_or_default(),
            text => text,
        };

        match parse_and_validate(raw, &self.answer_type, self.validate.as_ref()) {
            Err(err) => {
                debug!(activity = %self.id, error = %err, "answer rejected, asking again");
                let prompt = format!("I didn't understand: {}\n{}", err, self.render_prompt(ctx));
                ActivityResult::wait_with(prompt, self.card())
            }
            Ok(value) => {
                ctx.workflow().set_json(&self.state_key, value.clone());
                match self.route_for(&value) {
                    Some(next) => ActivityResult::goto(next, value),
                    None => ActivityResult::next(value),
                }
            }
        }
    }
}

/// Parses `raw` as `answer_type` and applies the optional validation rule.
///
/// The error string is meant to be shown to the user before re-asking.
pub fn parse_and_validate(
    raw: &str,
    answer_type: &AnswerType,
    validate: Option<&ValidationRule>,
) -> Result<Value, String> {
    let raw = raw.trim();
    if let Some(ValidationRule::Regex(re)) = validate {
        let regex = Regex::new(re).map_err(|e| format!("internal regex error: {}", e))?;
        if !regex.is_match(raw) {
            return Err(format!("must match /{}/", re));
        }
    }

    let value = match answer_type {
        AnswerType::Text => {
            if raw.is_empty() {
                return Err("please type an answer".to_string());
            }
            Value::String(raw.to_owned())
        }

        AnswerType::Number => {
            let v: f64 = raw.parse().map_err(|_| "please enter a number".to_string())?;
            check_range(v, validate)?;
            json!(v)
        }

        AnswerType::Integer => {
            let v: i64 = raw.parse().map_err(|_| "please enter a whole number".to_string())?;
            check_range(v as f64, validate)?;
            json!(v)
        }

        AnswerType::Boolean => match raw.to_lowercase().as_str() {
            "yes" | "y" | "true" | "sure" | "ok" => json!(true),
            "no" | "n" | "false" | "nope" => json!(false),
            _ => return Err("please answer yes or no".to_string()),
        },

        AnswerType::Date => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
                Value::String(dt.with_timezone(&Utc).to_rfc3339())
            } else if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
                Value::String(date.format("%Y-%m-%d").to_string())
            } else {
                return Err("please use YYYY-MM-DD or full ISO8601 timestamp".to_string());
            }
        }

        AnswerType::Choice { options } => {
            match options.iter().find(|opt| opt.eq_ignore_ascii_case(raw)) {
                Some(found) => Value::String(found.clone()),
                None => return Err(format!("please choose one of: {}", options.join(", "))),
            }
        }
    };
    Ok(value)
}

fn check_range(v: f64, validate: Option<&ValidationRule>) -> Result<(), String> {
    if let Some(ValidationRule::Range { min, max }) = validate {
        if v < *min || v > *max {
            return Err(format!("must be between {} and {}", min, max));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::test_support::ctx;
    use crate::activity::Step;

    #[test]
    fn parses_each_answer_type() {
        assert_eq!(parse_and_validate(" Ada ", &AnswerType::Text, None), Ok(json!("Ada")));
        assert_eq!(parse_and_validate("3.5", &AnswerType::Number, None), Ok(json!(3.5)));
        assert_eq!(parse_and_validate("42", &AnswerType::Integer, None), Ok(json!(42)));
        assert_eq!(parse_and_validate("Yes", &AnswerType::Boolean, None), Ok(json!(true)));
        assert_eq!(parse_and_validate("n", &AnswerType::Boolean, None), Ok(json!(false)));
        assert_eq!(parse_and_validate("1990-04-01", &AnswerType::Date, None), Ok(json!("1990-04-01")));
        let choice = AnswerType::Choice {
            options: vec!["Red".into(), "Blue".into()],
        };
        assert_eq!(parse_and_validate("blue", &choice, None), Ok(json!("Blue")));
    }

    #[test]
    fn rejects_bad_answers() {
        assert!(parse_and_validate("abc", &AnswerType::Number, None).is_err());
        assert!(parse_and_validate("4.2", &AnswerType::Integer, None).is_err());
        assert!(parse_and_validate("maybe", &AnswerType::Boolean, None).is_err());
        assert!(parse_and_validate("yesterday", &AnswerType::Date, None).is_err());
        assert!(parse_and_validate("", &AnswerType::Text, None).is_err());
        let choice = AnswerType::Choice { options: vec!["a".into()] };
        assert_eq!(
            parse_and_validate("b", &choice, None),
            Err("please choose one of: a".to_string())
        );
    }

    #[test]
    fn applies_validation_rules() {
        let range = ValidationRule::Range { min: 0.0, max: 120.0 };
        assert!(parse_and_validate("130", &AnswerType::Integer, Some(&range)).is_err());
        assert!(parse_and_validate("30", &AnswerType::Integer, Some(&range)).is_ok());

        let zip = ValidationRule::Regex(r"^\d{4}$".into());
        assert!(parse_and_validate("9000", &AnswerType::Text, Some(&zip)).is_ok());
        assert_eq!(
            parse_and_validate("90a0", &AnswerType::Text, Some(&zip)),
            Err(r"must match /^\d{4}$/".to_string())
        );
    }

    #[tokio::test]
    async fn prompts_then_stores_answer() {
        let act = InteractiveActivity::new("age", "How old are you, {{state.name}}?", AnswerType::Integer, "profile.age");
        let c = ctx("");
        c.workflow().set("name", "Ada");

        match act.execute(&c, None).await {
            ActivityResult::WaitForInput { prompt, payload } => {
                assert_eq!(prompt, "How old are you, Ada?");
                assert!(payload.is_null());
            }
            other => panic!("unexpected {other:?}"),
        }

        let reply = Message::text("conv-test", "36");
        assert!(matches!(act.execute(&c, Some(&reply)).await, ActivityResult::Continue { step: Step::Next, .. }));
        assert_eq!(c.workflow().get("profile.age", 0i64), 36);
    }

    #[tokio::test]
    async fn invalid_answer_reprompts() {
        let act = InteractiveActivity::new("age", "Age?", AnswerType::Integer, "age");
        let c = ctx("");
        let reply = Message::text("conv-test", "old");
        match act.execute(&c, Some(&reply)).await {
            ActivityResult::WaitForInput { prompt, .. } => {
                assert_eq!(prompt, "I didn't understand: please enter a whole number\nAge?");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!c.workflow().contains("age"));
    }

    #[tokio::test]
    async fn answers_can_route() {
        let act = InteractiveActivity::new("more", "More?", AnswerType::Boolean, "more").route("false", "done");
        let c = ctx("");
        match act.execute(&c, None).await {
            ActivityResult::WaitForInput { payload, .. } => assert_eq!(payload["options"], json!(["yes", "no"])),
            other => panic!("unexpected {other:?}"),
        }
        let reply = Message::text("conv-test", "no");
        match act.execute(&c, Some(&reply)).await {
            ActivityResult::Continue { step: Step::Goto(id), .. } => assert_eq!(id, "done"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
