use handlebars::Handlebars;
use serde_json::{json, Value};
use tracing::warn;

use crate::flow::state::WorkflowContext;

/// Renders a Handlebars template without HTML escaping.
///
/// A broken template is logged and returned verbatim so a typo in a prompt
/// never takes a conversation down.
pub fn render_handlebars(template: &str, data: &Value) -> String {
    if !template.contains("{{") {
        return template.to_string();
    }
    let mut hb = Handlebars::new();
    hb.register_escape_fn(handlebars::no_escape);
    match hb.render_template(template, data) {
        Ok(rendered) => rendered,
        Err(err) => {
            warn!(error = %err, template, "template render failed");
            template.to_string()
        }
    }
}

/// Template data exposing the workflow context as `state`.
pub fn state_data(workflow: &WorkflowContext) -> Value {
    json!({ "state": workflow.to_json() })
}
