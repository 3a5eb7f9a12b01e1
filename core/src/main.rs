use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clipstack::instance::{self, Role};
use clipstack::{ClipboardManager, Config, WlClipboard};
use log::info;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser)]
#[command(name = "clipstack")]
#[command(version)]
#[command(about = "Clipboard history daemon for Wayland")]
struct Cli {
    /// Empty the history before loading it
    #[arg(long)]
    clear_history: bool,

    /// Maximum number of entries to keep (overrides the config file)
    #[arg(long, value_name = "N")]
    max_entries: Option<usize>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the clipboard daemon, or wake the running one
    Daemon,
    /// Print the history, newest first
    Print {
        #[arg(short, long, default_value_t = 100)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(format!("clipstack={}", level)),
    )
    .init();

    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(max_entries) = cli.max_entries {
        config.max_entries = max_entries;
    }

    match cli.command.unwrap_or(Commands::Daemon) {
        Commands::Daemon => {
            let listener = match instance::acquire(&config.socket_path).await? {
                Role::SecondaryExited => return Ok(()),
                Role::Primary(listener) => listener,
            };

            let clipboard = Arc::new(WlClipboard::new(config.command_timeout()));
            let manager = ClipboardManager::new(config, clipboard, cli.clear_history)?;
            let store = manager.store();

            tokio::select! {
                result = manager.run_daemon(listener, move || clipstack::log_show_request(&store)) => {
                    result?;
                }
                _ = signal::ctrl_c() => {
                    info!("Shutting down");
                }
            }
        }
        Commands::Print { limit } => {
            let entries = clipstack::history::read_entries(&config.history_path());
            for entry in entries.iter().rev().take(limit) {
                println!("{}", clipstack::preview(entry, clipstack::PREVIEW_CHARS));
            }
        }
    }

    Ok(())
}
