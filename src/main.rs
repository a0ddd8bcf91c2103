use clap::Parser;
use topicflow::config::{ConfigManager, EnvConfigManager};

mod cli;

use cli::{default_command, execute, Cli, CliContext};

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_manager = ConfigManager(EnvConfigManager::new(cli.env_file.clone()));
    let context = CliContext::new(config_manager);
    let command = cli.command.unwrap_or_else(default_command);
    execute(&context, command).await
}
