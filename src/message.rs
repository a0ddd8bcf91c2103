use std::collections::HashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One inbound turn of a conversation.
///
/// `text` is what the user typed; `payload` carries anything a channel attached
/// to it (button values, form submissions). Topics mostly look at `text`.
#[derive(Debug, Clone, JsonSchema, Serialize, Deserialize, PartialEq)]
pub struct Message {
    id: String,
    conversation_id: String,
    text: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl Message {
    pub fn new(id: &str, conversation_id: &str, text: &str) -> Self {
        Self {
            id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            text: text.to_string(),
            payload: Value::Null,
            metadata: HashMap::new(),
        }
    }

    /// Builds a message with a fresh id, the common case for console and test input.
    pub fn text(conversation_id: &str, text: &str) -> Self {
        Self::new(&uuid::Uuid::new_v4().to_string(), conversation_id, text)
    }

    pub fn from_error(conversation_id: &str, error: String) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("error".to_string(), error.clone());

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            text: String::new(),
            payload: json!({ "error": error }),
            metadata,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn text_content(&self) -> &str {
        &self.text
    }

    /// Lower-cased, trimmed text. Confidence functions match against this.
    pub fn normalized(&self) -> String {
        self.text.trim().to_lowercase()
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn get(&self, name: &str) -> Option<&String> {
        self.metadata.get(name)
    }

    pub fn add(&mut self, name: String, value: String) {
        self.metadata.insert(name, value);
    }

    pub fn remove(&mut self, name: &str) {
        self.metadata.remove(name);
    }
}
