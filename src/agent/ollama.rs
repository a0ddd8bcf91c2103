use async_trait::async_trait;
use ollama_rs::Ollama;
use ollama_rs::generation::chat::{ChatMessage, request::ChatMessageRequest};
use ollama_rs::generation::parameters::FormatType;
use ollama_rs::models::ModelOptions;
use serde_json::Value;
use tracing::{debug, error, warn};
use url::Url;

use crate::activity::decision::{DecisionError, DecisionFunction, DecisionRequest};
use crate::config::ConfigManager;

pub const DEFAULT_MODEL: &str = "llama3:latest";

/// `OllamaDecision` asks a local Ollama server for a JSON answer.
///
/// The request's creativity becomes the sampling temperature and the
/// response shape is appended to the system prompt, so the model knows which
/// fields to fill. Whatever comes back is handed to the decision activity,
/// which coerces it to the shape.
#[derive(Debug, Clone)]
pub struct OllamaDecision {
    model: String,
    url: Option<Url>,
}

impl OllamaDecision {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            url: None,
        }
    }

    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    /// Reads `OLLAMA_MODEL` and `OLLAMA_URL`, ignoring an unparsable URL.
    pub async fn from_config(config: &ConfigManager) -> Self {
        let model = config.0.get("OLLAMA_MODEL").await.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let mut decision = Self::new(&model);
        if let Some(raw) = config.0.get("OLLAMA_URL").await {
            match Url::parse(&raw) {
                Ok(url) => decision.url = Some(url),
                Err(err) => warn!(url = %raw, error = %err, "ignoring invalid OLLAMA_URL"),
            }
        }
        decision
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn client(&self) -> Ollama {
        match &self.url {
            // without an explicit port the url is probably incomplete, use the local default
            Some(url) => match url.port() {
                Some(port) => Ollama::new(url.clone(), port),
                None => Ollama::default(),
            },
            None => Ollama::default(),
        }
    }

    fn system_prompt(request: &DecisionRequest) -> String {
        format!(
            "{}\n\nAnswer with JSON only, shaped like this example:\n{}",
            request.system_prompt, request.response_shape
        )
    }
}

#[async_trait]
impl DecisionFunction for OllamaDecision {
    async fn decide(&self, request: DecisionRequest) -> Result<Value, DecisionError> {
        let messages = vec![
            ChatMessage::system(Self::system_prompt(&request)),
            ChatMessage::user(request.user_prompt.clone()),
        ];
        let options = ModelOptions::default().temperature(request.creativity);
        let chat = ChatMessageRequest::new(self.model.clone(), messages)
            .format(FormatType::Json)
            .options(options);

        let response = self.client().send_chat_messages(chat).await.map_err(|err| {
            error!(model = %self.model, error = %err, "ollama request failed");
            DecisionError::Unavailable(err.to_string())
        })?;

        let content = response.message.content;
        debug!(model = %self.model, %content, "ollama answered");
        // a non-JSON answer is passed on as a string and coerced later
        Ok(serde_json::from_str(&content).unwrap_or(Value::String(content)))
    }

    fn name(&self) -> &str {
        "ollama"
    }
}
