use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::CliContext;
use topicflow::activity::DecisionFunction;
use topicflow::agent::OllamaDecision;
use topicflow::config::OrchestratorConfig;
use topicflow::event::EventBus;
use topicflow::flow::session::{ConversationContext, ConversationStoreType, InMemoryConversationStore};
use topicflow::logger::init_tracing;
use topicflow::message::Message;
use topicflow::topics::{build_demo_manager, keyword_sentiment};

#[derive(Args, Debug)]
pub struct ChatArgs {
    /// Log filter (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    pub log_level: String,

    /// Write rolling logs here instead of stderr
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Conversation id, random when omitted
    #[arg(long)]
    pub conversation: Option<String>,

    /// Classify feedback with a local Ollama model (OLLAMA_URL, OLLAMA_MODEL)
    #[arg(long, default_value_t = false)]
    pub ollama: bool,
}

impl Default for ChatArgs {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            log_dir: None,
            conversation: None,
            ollama: false,
        }
    }
}

const HELP: &str = "commands: /reset /history /state /quit";

pub async fn execute(args: ChatArgs, context: &CliContext) -> anyhow::Result<()> {
    init_tracing(&args.log_level, args.log_dir.as_deref())?;
    let config = OrchestratorConfig::from_manager(&context.config_manager)
        .await
        .context("invalid configuration")?;

    let store = InMemoryConversationStore::new(config.session_ttl_secs);
    let conversation_id = args.conversation.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let conversation = store.get_or_create(&conversation_id).await;
    let bus = EventBus::new(config.history_capacity);

    let decision: Arc<dyn DecisionFunction> = if args.ollama {
        Arc::new(OllamaDecision::from_config(&context.config_manager).await)
    } else {
        keyword_sentiment()
    };
    let manager = build_demo_manager(conversation.clone(), bus.clone(), config, decision)?;
    info!(%conversation_id, "chat started");

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    stdout.write_all(format!("conversation {conversation_id}\n{HELP}\n> ").as_bytes()).await?;
    stdout.flush().await?;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let reply = match line {
            "" => String::new(),
            "/quit" | "/exit" => break,
            "/reset" => {
                manager.reset_conversation().await;
                "conversation reset".to_string()
            }
            "/history" => conversation.workflow().topic_history().join(" -> "),
            "/state" => serde_json::to_string_pretty(&conversation.workflow().to_json())?,
            text => {
                let cancel = CancellationToken::new();
                let message = Message::text(&conversation_id, text);
                let outcome = tokio::select! {
                    result = manager.handle_message(&message, &cancel) => Some(result),
                    _ = tokio::signal::ctrl_c() => None,
                };
                let Some(result) = outcome else {
                    cancel.cancel();
                    break;
                };
                let mut reply = result.text.clone();
                if let Some(rendered) = &result.rendered {
                    reply.push_str(&format!("\n[card] {rendered}"));
                }
                if let Some(err) = &result.error {
                    reply.push_str(&format!("\n[error] {err}"));
                }
                reply
            }
        };
        if !reply.is_empty() {
            stdout.write_all(format!("{reply}\n").as_bytes()).await?;
        }
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
    }

    manager.terminate_async(&CancellationToken::new()).await;
    store.remove(&conversation_id).await;
    info!(%conversation_id, "chat ended");
    Ok(())
}
