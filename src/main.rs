use anyhow::Result;
use dotenvy::dotenv;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use tokio::time::sleep;
use url::Url;

use vidra::cli::{Cli, Commands};
use vidra::core::{config, init_logger, log_startup_configuration};
use vidra::download::{probe_formats, JobRegistry};
use vidra::telegram::{create_bot, schema, setup_bot_commands, HandlerDeps};

/// How many times the dispatcher is restarted after a crash before
/// giving up.
const MAX_DISPATCHER_RETRIES: u32 = 5;

/// Main entry point for the Telegram bot
///
/// Parses CLI arguments and dispatches to the appropriate subcommand.
///
/// # Errors
/// Returns an error if initialization fails (logging, bot creation).
#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Set up global panic handler to catch panics in dispatcher tasks.
    // This lets us log the panic instead of dying silently.
    std::panic::set_hook(Box::new(|panic_info| {
        log::error!("Panic caught: {:?}", panic_info);
        if let Some(location) = panic_info.location() {
            log::error!("Panic at {}:{}:{}", location.file(), location.line(), location.column());
        }
        if let Some(msg) = panic_info.payload().downcast_ref::<&str>() {
            log::error!("Panic message: {}", msg);
        }
    }));

    // Load environment variables from .env if present
    let _ = dotenv();

    // Initialize logger (console + file)
    init_logger(&config::LOG_FILE_PATH)?;

    match cli.command {
        Some(Commands::Probe { url, json }) => run_probe(&url, json).await,
        Some(Commands::Run) | None => run_bot().await,
    }
}

/// Probes a URL and prints the catalog without starting the bot.
async fn run_probe(raw_url: &str, as_json: bool) -> Result<()> {
    let url = Url::parse(raw_url)?;
    let probe = probe_formats(&url).await?;

    if as_json {
        let formats: Vec<serde_json::Value> = probe
            .formats
            .iter()
            .map(|option| {
                serde_json::json!({
                    "id": option.id,
                    "label": option.label,
                    "resolution": option.resolution,
                    "audio_only": option.audio_only,
                    "est_size": option.est_size,
                })
            })
            .collect();
        let doc = serde_json::json!({
            "title": probe.title,
            "duration_secs": probe.duration_secs,
            "formats": formats,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        println!("{}", probe.title);
        for option in &probe.formats {
            println!("  {:<8} {}", option.id, option.label);
        }
    }

    Ok(())
}

/// Runs the bot with long polling.
async fn run_bot() -> Result<()> {
    log_startup_configuration().await;

    let bot = create_bot()?;

    // Get bot information, retrying while the Bot API comes up
    let bot_info = {
        let startup_max_retries = 12;
        let mut startup_retry = 0;
        loop {
            match bot.get_me().await {
                Ok(info) => break info,
                Err(e) => {
                    let err_str = e.to_string();
                    let is_retryable = err_str.contains("restart")
                        || err_str.contains("network")
                        || err_str.contains("connection")
                        || err_str.contains("timed out")
                        || err_str.contains("Connection refused");

                    startup_retry += 1;
                    if startup_retry >= startup_max_retries || !is_retryable {
                        return Err(anyhow::anyhow!(
                            "Failed to connect to Bot API after {} retries: {}",
                            startup_retry,
                            e
                        ));
                    }

                    log::warn!(
                        "Bot API not ready (attempt {}/{}): {}. Retrying in 5 seconds...",
                        startup_retry,
                        startup_max_retries,
                        err_str
                    );
                    sleep(Duration::from_secs(5)).await;
                }
            }
        }
    };
    log::info!("Bot username: {:?}, Bot ID: {}", bot_info.username, bot_info.id);

    setup_bot_commands(&bot).await?;

    let registry = Arc::new(JobRegistry::new());
    let deps = HandlerDeps::new(registry);

    let mut retry_count = 0;
    loop {
        let handler = schema(deps.clone());
        let bot_clone = bot.clone();

        let dispatcher_task = tokio::spawn(async move {
            Dispatcher::builder(bot_clone, handler)
                .dependencies(DependencyMap::new())
                .enable_ctrlc_handler()
                .build()
                .dispatch()
                .await;
        });

        match dispatcher_task.await {
            Ok(()) => {
                log::info!("Dispatcher shutdown gracefully");
                break;
            }
            Err(join_err) => {
                retry_count += 1;
                if join_err.is_panic() {
                    log::error!("Dispatcher panicked: {}", join_err);
                } else {
                    log::warn!("Dispatcher task was cancelled: {}", join_err);
                }
                if retry_count >= MAX_DISPATCHER_RETRIES {
                    return Err(anyhow::anyhow!(
                        "Dispatcher failed {} times in a row, giving up",
                        retry_count
                    ));
                }
                log::info!("Restarting dispatcher (attempt {}/{})", retry_count, MAX_DISPATCHER_RETRIES);
                sleep(Duration::from_secs(5)).await;
            }
        }
    }

    Ok(())
}
