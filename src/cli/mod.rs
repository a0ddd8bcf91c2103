use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod chat;
pub mod schema;

use chat::ChatArgs;
use schema::SchemaArgs;

use topicflow::config::ConfigManager;

#[derive(Parser, Debug)]
#[command(
    name = "topicflow",
    about = "Topic-routed conversations on a console",
    version = "0.1.0"
)]
pub struct Cli {
    /// Optional .env file with configuration
    #[arg(long, global = true, default_value = ".env")]
    pub env_file: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Chat with the built-in topics
    Chat(ChatArgs),

    /// Emit JSON-Schema of the wire types
    Schema(SchemaArgs),
}

#[derive(Clone, Debug)]
pub struct CliContext {
    pub config_manager: ConfigManager,
}

impl CliContext {
    pub fn new(config_manager: ConfigManager) -> Self {
        Self { config_manager }
    }
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Chat(args) => chat::execute(args, context).await,
        Commands::Schema(args) => schema::execute(args).await,
    }
}

pub fn default_command() -> Commands {
    Commands::Chat(ChatArgs::default())
}
