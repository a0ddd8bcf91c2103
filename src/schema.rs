use std::{fs, path::Path, path::PathBuf};

use anyhow::{Context, Result};
use schemars::{schema_for, JsonSchema};

use crate::activity::AnswerType;
use crate::event::TopicEvent;
use crate::flow::state::StateValue;
use crate::message::Message;
use crate::topic::TopicResult;

/// Writes the JSON schemas of the wire types into `out_dir`.
pub fn write_schema(out_dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(out_dir).with_context(|| format!("could not create {}", out_dir.display()))?;
    Ok(vec![
        write_one::<TopicEvent>(out_dir, "topic-event")?,
        write_one::<TopicResult>(out_dir, "topic-result")?,
        write_one::<StateValue>(out_dir, "state-value")?,
        write_one::<Message>(out_dir, "message")?,
        write_one::<AnswerType>(out_dir, "answer-type")?,
    ])
}

fn write_one<T: JsonSchema>(out_dir: &Path, name: &str) -> Result<PathBuf> {
    let schema = schema_for!(T);
    let path = out_dir.join(format!("{name}.schema.json"));
    fs::write(&path, serde_json::to_string_pretty(&schema)?)
        .with_context(|| format!("could not write {}", path.display()))?;
    Ok(path)
}
