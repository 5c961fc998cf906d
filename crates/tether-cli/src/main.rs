use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tether_gateway::channels::dispatch::Dispatcher;
use tether_gateway::channels::telegram::{self, TelegramClient};
use tether_gateway::config;
use tether_gateway::db::Database;
use tether_gateway::Gateway;
use tether_types::config::TetherConfig;
use tether_types::usage::format_usd;

#[derive(Parser)]
#[command(name = "tether", version, about = "Tether — chat with a coding agent from Telegram")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (default)
    Run,
    /// Show config paths and known conversations
    Status,
    /// Validate and print the effective configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = config::load_config();
    let level = loaded
        .as_ref()
        .map(|c| c.gateway.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("{level},reqwest=warn,hyper=warn"))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cfg = loaded?;
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(cfg).await,
        Commands::Status => status(&cfg),
        Commands::CheckConfig => check_config(&cfg),
    }
}

async fn run(cfg: TetherConfig) -> Result<()> {
    cfg.validate().context("Invalid configuration")?;
    if cfg.telegram.bot_token.is_empty() {
        anyhow::bail!(
            "No Telegram bot token. Set telegram.bot_token in {} or TETHER_TELEGRAM_TOKEN",
            config::config_path()?.display()
        );
    }
    if cfg.telegram.allowed_user_ids.is_empty() {
        warn!("telegram.allowed_user_ids is empty, every message will be ignored");
    }

    let db = Arc::new(Database::open(&config::db_path()?)?);
    let client = TelegramClient::new(cfg.telegram.bot_token.clone());
    let allowed = cfg.telegram.allowed_user_ids.clone();
    let gateway = Arc::new(Gateway::new(cfg, db).context("Failed to start the gateway")?);

    gateway.recover_interrupted(&client).await;

    let shutdown = CancellationToken::new();
    let mut inbound = telegram::start_polling(client.clone(), allowed, shutdown.clone());
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&gateway), Arc::new(client)));
    info!("Tether v{} running", env!("CARGO_PKG_VERSION"));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break;
            }
            msg = inbound.recv() => match msg {
                Some(msg) => {
                    dispatcher.spawn(msg);
                }
                None => break,
            },
        }
    }

    shutdown.cancel();
    gateway.shutdown().await;
    info!("Tether stopped");
    Ok(())
}

fn status(cfg: &TetherConfig) -> Result<()> {
    println!("Tether v{}", env!("CARGO_PKG_VERSION"));
    println!("Agent: {}", cfg.agent.executable.display());
    println!("Default model: {}", cfg.agent.default_model);
    println!("Telegram token: {}", if cfg.telegram.bot_token.is_empty() { "not set" } else { "configured" });
    println!("Config: {}", config::config_path()?.display());
    println!("Database: {}", config::db_path()?.display());

    let db = Database::open(&config::db_path()?)?;
    let conversations = db.list_conversations()?;
    if conversations.is_empty() {
        println!("No conversations yet.");
        return Ok(());
    }
    println!("Conversations:");
    for record in conversations {
        println!(
            "  {}  {}  {}  {}",
            record.conversation_id,
            record.model,
            format_usd(record.cumulative_spend_usd),
            record.workspace_root.display()
        );
    }
    let dirty = db.ledger_entries()?;
    if !dirty.is_empty() {
        println!("{} turn(s) were in flight at the last shutdown.", dirty.len());
    }
    Ok(())
}

fn check_config(cfg: &TetherConfig) -> Result<()> {
    cfg.validate().context("Invalid configuration")?;
    let mut shown = cfg.clone();
    if !shown.telegram.bot_token.is_empty() {
        shown.telegram.bot_token = "<redacted>".to_string();
    }
    println!("{}", config::render_config(&shown)?);
    println!("Configuration OK.");
    Ok(())
}
