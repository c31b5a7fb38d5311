// ABOUTME: Main entry point for the bihua agent fleet
// ABOUTME: Initializes logging and config, then dispatches the chosen CLI command

use anyhow::Result;
use bihua::{cli::Cli, cli::Command, commands, paths};
use bihua_core::Config;
use clap::Parser;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "info,matrix_sdk_crypto=warn";

/// Stdout plus a daily-rolling JSON file under `<data_home>/logs`
fn init_tracing(config: &Config) -> Result<WorkerGuard> {
    let log_dir = paths::log_dir(&config.data_home());
    std::fs::create_dir_all(&log_dir)?;
    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "bihua.log"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(file_writer),
        )
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Log panics before the process goes down
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("\nPANIC! bihua crashed with the following error:\n");
        eprintln!("{}", panic_info);
        eprintln!("\nBacktrace:");
        eprintln!("{:?}", std::backtrace::Backtrace::force_capture());
    }));

    let cli = Cli::parse();

    dotenvy::dotenv().ok();
    let config = Config::load()?;
    let _guard = init_tracing(&config)?;

    tracing::info!(
        home_server = %config.messenger.home_server,
        server_name = ?config.server_name(),
        data_home = %config.store.data_home,
        handler_dir = %config.fleet.handler_dir,
        "Configuration loaded"
    );

    match cli.command {
        Command::Run {
            room_alias,
            room_topic,
            handler_dir,
        } => {
            let options = commands::RunOptions {
                room_alias,
                room_topic,
                handler_dir,
            };
            let report = commands::run(Arc::new(config), options).await?;
            println!("{}", commands::format_report(&report));
        }
        Command::Sync { kind } => commands::sync(&config, kind).await?,
        Command::List { kind } => commands::list(&config, kind).await?,
        Command::Set { kind, id, fields } => commands::set(&config, kind, &id, &fields).await?,
        Command::Note { kind, id, set } => commands::note(&config, kind, &id, set).await?,
    }

    Ok(())
}
