use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use super::{Activity, ActivityContext, ActivityError, ActivityResult};
use crate::message::Message;
use crate::util::render_handlebars;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecisionError {
    #[error("decision backend unavailable: {0}")]
    Unavailable(String),
    #[error("decision timed out after {0:?}")]
    TimedOut(Duration),
    #[error("decision cancelled")]
    Cancelled,
}

/// Everything the external decision function gets to see.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionRequest {
    pub input: Value,
    pub evidence: Vec<String>,
    pub system_prompt: String,
    /// The user prompt, already rendered over `{input, evidence}`.
    pub user_prompt: String,
    /// 0.0 is deterministic, 1.0 is as free as the backend allows.
    pub creativity: f32,
    /// Shape the answer should take, with default values.
    pub response_shape: Value,
}

/// Opaque scoring/response capability, typically a language model.
#[async_trait]
pub trait DecisionFunction: Send + Sync + fmt::Debug {
    async fn decide(&self, request: DecisionRequest) -> Result<Value, DecisionError>;

    fn name(&self) -> &str;
}

type DecideFn = Arc<dyn Fn(DecisionRequest) -> BoxFuture<'static, Result<Value, DecisionError>> + Send + Sync>;

/// Closure-backed decision function, used for rules and tests.
#[derive(Clone)]
pub struct FnDecision {
    name: String,
    f: DecideFn,
}

impl fmt::Debug for FnDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnDecision").field("name", &self.name).finish()
    }
}

impl FnDecision {
    pub fn new<F, Fut>(name: &str, f: F) -> Self
    where
        F: Fn(DecisionRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, DecisionError>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            f: Arc::new(move |req| f(req).boxed()),
        }
    }
}

#[async_trait]
impl DecisionFunction for FnDecision {
    async fn decide(&self, request: DecisionRequest) -> Result<Value, DecisionError> {
        (self.f)(request).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Asks a [`DecisionFunction`] and stores its (shape-coerced) answer.
///
/// Backend errors and timeouts fail the activity. A malformed answer does
/// not: it is coerced to `response_shape`, falling back to the shape's own
/// values wherever the answer does not fit.
#[derive(Debug, Clone)]
pub struct DecisionActivity {
    id: String,
    function: Arc<dyn DecisionFunction>,
    input_key: Option<String>,
    evidence: Vec<String>,
    evidence_key: Option<String>,
    system_prompt: String,
    user_prompt_template: String,
    creativity: f32,
    response_shape: Value,
    output_key: String,
    timeout: Duration,
}

impl DecisionActivity {
    pub fn new(id: &str, function: Arc<dyn DecisionFunction>, output_key: &str) -> Self {
        Self {
            id: id.to_string(),
            function,
            input_key: None,
            evidence: Vec::new(),
            evidence_key: None,
            system_prompt: String::new(),
            user_prompt_template: "{{input}}".to_string(),
            creativity: 0.0,
            response_shape: Value::Null,
            output_key: output_key.to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Read the input from the workflow context instead of the turn message.
    pub fn input_key(mut self, key: &str) -> Self {
        self.input_key = Some(key.to_string());
        self
    }

    pub fn evidence(mut self, evidence: Vec<String>) -> Self {
        self.evidence = evidence;
        self
    }

    /// Extra evidence read from a list stored in the workflow context.
    pub fn evidence_key(mut self, key: &str) -> Self {
        self.evidence_key = Some(key.to_string());
        self
    }

    pub fn prompts(mut self, system_prompt: &str, user_prompt_template: &str) -> Self {
        self.system_prompt = system_prompt.to_string();
        self.user_prompt_template = user_prompt_template.to_string();
        self
    }

    pub fn creativity(mut self, creativity: f32) -> Self {
        self.creativity = creativity.clamp(0.0, 1.0);
        self
    }

    pub fn response_shape(mut self, shape: Value) -> Self {
        self.response_shape = shape;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn request(&self, ctx: &ActivityContext) -> DecisionRequest {
        let input = match &self.input_key {
            Some(key) => ctx.workflow().value(key).map(|v| v.to_json()).unwrap_or(Value::Null),
            None => Value::String(ctx.message().text_content().to_string()),
        };
        let mut evidence = self.evidence.clone();
        if let Some(key) = &self.evidence_key {
            evidence.extend(ctx.workflow().get::<Vec<String>>(key, Vec::new()));
        }
        let user_prompt = render_handlebars(
            &self.user_prompt_template,
            &json!({ "input": input, "evidence": evidence }),
        );
        DecisionRequest {
            input,
            evidence,
            system_prompt: self.system_prompt.clone(),
            user_prompt,
            creativity: self.creativity,
            response_shape: self.response_shape.clone(),
        }
    }
}

#[async_trait]
impl Activity for DecisionActivity {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "decision"
    }

    #[tracing::instrument(name = "decision_activity", skip(self, ctx, _input), fields(activity = %self.id, backend = %self.function.name()))]
    async fn execute(&self, ctx: &ActivityContext, _input: Option<&Message>) -> ActivityResult {
        let request = self.request(ctx);

        let outcome = tokio::select! {
            _ = ctx.cancel().cancelled() => Err(DecisionError::Cancelled),
            res = tokio::time::timeout(self.timeout, self.function.decide(request)) => match res {
                Ok(inner) => inner,
                Err(_) => Err(DecisionError::TimedOut(self.timeout)),
            },
        };

        match outcome {
            Ok(raw) => {
                let value = coerce_to_shape(raw, &self.response_shape);
                info!(output_key = %self.output_key, "decision stored");
                ctx.workflow().set_json(&self.output_key, value.clone());
                ActivityResult::next(value)
            }
            Err(err) => {
                warn!(error = %err, "decision failed");
                ActivityResult::fail(ActivityError::Decision {
                    activity: self.id.clone(),
                    reason: err.to_string(),
                })
            }
        }
    }
}

/// Makes `value` fit `shape`.
///
/// Objects are matched key by key, scalars are converted when the conversion
/// is lossless ("3" to 3, 3 to "3"), and anything that does not fit takes the
/// shape's value. A null shape accepts whatever came back.
pub fn coerce_to_shape(value: Value, shape: &Value) -> Value {
    let value = match value {
        Value::String(s) if !shape.is_string() && !shape.is_null() => {
            serde_json::from_str::<Value>(s.trim()).unwrap_or(Value::String(s))
        }
        other => other,
    };

    match shape {
        Value::Null => value,
        Value::Object(fields) => {
            let mut source = match value {
                Value::Object(map) => map,
                _ => serde_json::Map::new(),
            };
            let mut out = serde_json::Map::new();
            for (key, field_shape) in fields {
                let field = source.remove(key).unwrap_or(Value::Null);
                out.insert(key.clone(), coerce_to_shape(field, field_shape));
            }
            Value::Object(out)
        }
        Value::Array(items) => match value {
            Value::Array(values) => match items.first() {
                Some(item_shape) => Value::Array(
                    values.into_iter().map(|v| coerce_to_shape(v, item_shape)).collect(),
                ),
                None => Value::Array(values),
            },
            _ => Value::Array(Vec::new()),
        },
        Value::Number(_) => match &value {
            Value::Number(_) => value,
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| shape.clone()),
            _ => shape.clone(),
        },
        Value::Bool(_) => match &value {
            Value::Bool(_) => value,
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" => Value::Bool(true),
                "false" | "no" => Value::Bool(false),
                _ => shape.clone(),
            },
            _ => shape.clone(),
        },
        Value::String(_) => match value {
            Value::String(s) => Value::String(s),
            Value::Number(n) => Value::String(n.to_string()),
            Value::Bool(b) => Value::String(b.to_string()),
            _ => shape.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::test_support::ctx;
    use std::sync::Mutex;

    fn shape() -> Value {
        json!({ "sentiment": "neutral", "score": 0.0, "follow_up": false })
    }

    #[test]
    fn coerces_loose_answers() {
        let raw = json!({ "sentiment": "positive", "score": "0.8", "follow_up": "yes", "extra": 1 });
        assert_eq!(
            coerce_to_shape(raw, &shape()),
            json!({ "sentiment": "positive", "score": 0.8, "follow_up": true })
        );
    }

    #[test]
    fn parses_json_inside_strings() {
        let raw = Value::String(r#"{"sentiment":"negative","score":0.1}"#.into());
        assert_eq!(
            coerce_to_shape(raw, &shape()),
            json!({ "sentiment": "negative", "score": 0.1, "follow_up": false })
        );
    }

    #[test]
    fn garbage_falls_back_to_shape() {
        assert_eq!(coerce_to_shape(Value::String("not json".into()), &shape()), shape());
        assert_eq!(coerce_to_shape(json!([1, 2]), &shape()), shape());
        assert_eq!(coerce_to_shape(json!("x"), &json!(["a"])), json!([]));
        assert_eq!(coerce_to_shape(json!({"a": 1}), &Value::Null), json!({"a": 1}));
    }

    #[tokio::test]
    async fn passes_prompt_and_creativity() {
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let f = FnDecision::new("capture", move |req: DecisionRequest| {
            *s.lock().unwrap() = Some(req);
            async { Ok(json!({ "sentiment": "positive" })) }
        });
        let act = DecisionActivity::new("judge", Arc::new(f), "feedback.verdict")
            .prompts("be kind", "Rate: {{input}} given {{#each evidence}}[{{this}}]{{/each}}")
            .evidence(vec!["a".into(), "b".into()])
            .creativity(1.7)
            .response_shape(shape());

        let c = ctx("great service");
        assert!(matches!(act.execute(&c, None).await, ActivityResult::Continue { .. }));

        let req = seen.lock().unwrap().clone().unwrap();
        assert_eq!(req.user_prompt, "Rate: great service given [a][b]");
        assert_eq!(req.creativity, 1.0);
        assert_eq!(req.system_prompt, "be kind");
        assert_eq!(
            c.workflow().value("feedback.verdict").unwrap().to_json(),
            json!({ "sentiment": "positive", "score": 0.0, "follow_up": false })
        );
    }

    #[tokio::test]
    async fn backend_error_fails_activity() {
        let f = FnDecision::new("down", |_| async { Err(DecisionError::Unavailable("offline".into())) });
        let act = DecisionActivity::new("judge", Arc::new(f), "out");
        match act.execute(&ctx("x"), None).await {
            ActivityResult::Fail(ActivityError::Decision { reason, .. }) => assert!(reason.contains("offline")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        let f = FnDecision::new("slow", |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        });
        let act = DecisionActivity::new("judge", Arc::new(f), "out").timeout(Duration::from_millis(20));
        let c = ctx("x");
        assert!(matches!(act.execute(&c, None).await, ActivityResult::Fail(_)));
        assert!(!c.workflow().contains("out"));
    }
}
