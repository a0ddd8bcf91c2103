use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use super::{Activity, ActivityContext, ActivityResult};
use crate::message::Message;
use crate::util::{render_handlebars, state_data};

type AsyncBody = Arc<dyn Fn(ActivityContext, Option<Message>) -> BoxFuture<'static, ActivityResult> + Send + Sync>;
type SyncBody = Arc<dyn Fn(&ActivityContext, Option<&Message>) -> ActivityResult + Send + Sync>;

#[derive(Clone)]
enum Body {
    Async(AsyncBody),
    Sync(SyncBody),
}

/// Glue logic wrapped as an activity.
#[derive(Clone)]
pub struct FunctionActivity {
    id: String,
    body: Body,
}

impl fmt::Debug for FunctionActivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionActivity").field("id", &self.id).finish()
    }
}

impl FunctionActivity {
    pub fn new<F, Fut>(id: &str, f: F) -> Self
    where
        F: Fn(ActivityContext, Option<Message>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActivityResult> + Send + 'static,
    {
        let body: AsyncBody = Arc::new(move |ctx, input| f(ctx, input).boxed());
        Self {
            id: id.to_string(),
            body: Body::Async(body),
        }
    }

    pub fn sync<F>(id: &str, f: F) -> Self
    where
        F: Fn(&ActivityContext, Option<&Message>) -> ActivityResult + Send + Sync + 'static,
    {
        Self {
            id: id.to_string(),
            body: Body::Sync(Arc::new(f)),
        }
    }

    /// Says a templated line (`{{state.key}}`) and moves on.
    pub fn say(id: &str, template: &str) -> Self {
        let template = template.to_string();
        Self::sync(id, move |ctx, _| {
            ctx.say(render_handlebars(&template, &state_data(ctx.workflow())));
            ActivityResult::next(Value::Null)
        })
    }
}

#[async_trait]
impl Activity for FunctionActivity {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "function"
    }

    async fn execute(&self, ctx: &ActivityContext, input: Option<&Message>) -> ActivityResult {
        match &self.body {
            Body::Sync(f) => f(ctx, input),
            Body::Async(f) => f(ctx.clone(), input.cloned()).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::test_support::ctx;
    use serde_json::json;

    #[tokio::test]
    async fn async_body_sees_context() {
        let act = FunctionActivity::new("store", |ctx, _| async move {
            ctx.workflow().set("seen", ctx.message().text_content());
            ActivityResult::next(json!({"ok": true}))
        });
        let c = ctx("hello");
        match act.execute(&c, None).await {
            ActivityResult::Continue { payload, .. } => assert_eq!(payload, json!({"ok": true})),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(c.workflow().get("seen", String::new()), "hello");
        assert_eq!(act.kind(), "function");
    }

    #[tokio::test]
    async fn say_renders_state() {
        let c = ctx("");
        c.workflow().set("name", "Ada");
        FunctionActivity::say("hi", "Hello {{state.name}}").execute(&c, None).await;
        assert_eq!(c.take_output().lines, vec!["Hello Ada"]);
    }
}
