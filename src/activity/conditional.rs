use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::{Activity, ActivityContext, ActivityResult, Step};
use crate::flow::state::WorkflowContext;
use crate::message::Message;

pub type Discriminator = Arc<dyn Fn(&WorkflowContext) -> String + Send + Sync>;
pub type ActivityBuilder = Arc<dyn Fn(&WorkflowContext) -> Arc<dyn Activity> + Send + Sync>;

/// What a branch resolves to.
#[derive(Clone)]
pub enum BranchTarget {
    /// Carry on with the next queued activity.
    Continue,
    /// Jump forward to an activity of the same flow.
    Goto(String),
    /// Run a prepared activity next.
    Run(Arc<dyn Activity>),
    /// Build the activity to run from the current context.
    Build(ActivityBuilder),
}

impl fmt::Debug for BranchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchTarget::Continue => f.write_str("Continue"),
            BranchTarget::Goto(id) => write!(f, "Goto({id})"),
            BranchTarget::Run(a) => write!(f, "Run({})", a.id()),
            BranchTarget::Build(_) => f.write_str("Build(..)"),
        }
    }
}

impl BranchTarget {
    pub fn goto(id: &str) -> Self {
        BranchTarget::Goto(id.to_string())
    }

    pub fn run(activity: impl Activity + 'static) -> Self {
        BranchTarget::Run(Arc::new(activity))
    }

    pub fn build<F>(f: F) -> Self
    where
        F: Fn(&WorkflowContext) -> Arc<dyn Activity> + Send + Sync + 'static,
    {
        BranchTarget::Build(Arc::new(f))
    }
}

/// Switch over a string discriminator. The default branch is mandatory.
#[derive(Clone)]
pub struct ConditionalActivity {
    id: String,
    discriminator: Discriminator,
    branches: HashMap<String, BranchTarget>,
    default: BranchTarget,
}

impl fmt::Debug for ConditionalActivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionalActivity")
            .field("id", &self.id)
            .field("branches", &self.branches)
            .field("default", &self.default)
            .finish()
    }
}

impl ConditionalActivity {
    pub fn new<F>(id: &str, discriminator: F, default: BranchTarget) -> Self
    where
        F: Fn(&WorkflowContext) -> String + Send + Sync + 'static,
    {
        Self {
            id: id.to_string(),
            discriminator: Arc::new(discriminator),
            branches: HashMap::new(),
            default,
        }
    }

    pub fn branch(mut self, key: &str, target: BranchTarget) -> Self {
        self.branches.insert(key.to_string(), target);
        self
    }
}

#[async_trait]
impl Activity for ConditionalActivity {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "conditional"
    }

    async fn execute(&self, ctx: &ActivityContext, _input: Option<&Message>) -> ActivityResult {
        let key = (self.discriminator)(ctx.workflow());
        let (matched, target) = match self.branches.get(&key) {
            Some(target) => (true, target),
            None => (false, &self.default),
        };
        debug!(activity = %self.id, branch = %key, matched, ?target, "conditional resolved");

        let step = match target {
            BranchTarget::Continue => Step::Next,
            BranchTarget::Goto(id) => Step::Goto(id.clone()),
            BranchTarget::Run(activity) => Step::Run(activity.clone()),
            BranchTarget::Build(build) => Step::Run(build(ctx.workflow())),
        };
        ActivityResult::Continue {
            payload: json!({ "branch": key, "matched": matched }),
            step,
        }
    }
}
