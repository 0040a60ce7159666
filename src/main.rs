use anyhow::Result;
use clap::Parser;
use std::fs::OpenOptions;
use tracing_appender::non_blocking;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

mod cache;
mod cli;
mod commands;
mod config;
mod disk;
mod error;
mod ftp;
mod item;
mod opened_files;
mod operation;
mod operations_list;
mod parse;
mod queue;
mod server;
mod speed;
mod util;
mod worker;

pub use error::EngineError;
pub use error::ProblemKind;

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    let config = config::Config::init(0);
    // Initialize tracing/logging (used by `fp --debug`); logs live under the
    // config storage directory: <config_dir>/logs. This path is not
    // configurable.
    init_tracing_if_requested(&config, cli.debug);

    let res = match cli.command {
        cli::Commands::Create { alias, remote_host } => {
            commands::handle_create(&config, alias, remote_host)
        }
        cli::Commands::List {} => commands::handle_list(&config),
        cli::Commands::Remove { alias } => commands::handle_remove(&config, alias),
        cli::Commands::Rename { alias, new_alias } => {
            commands::handle_rename(&config, alias, new_alias)
        }
        cli::Commands::Del { targets, opts } => commands::handle_del(&config, targets, opts),
        cli::Commands::Get { source, target, r#move, opts } => {
            commands::handle_get(&config, source, target, r#move, opts)
        }
        cli::Commands::Put { source, target, r#move, opts } => {
            commands::handle_put(&config, source, target, r#move, opts)
        }
        cli::Commands::Chattr { target, mode, opts } => {
            commands::handle_chattr(&config, target, mode, opts)
        }
    };

    res?;
    Ok(())
}

fn init_tracing_if_requested(cfg: &config::Config, debug: bool) {
    // Determine the canonical logs dir next to config.json; fall back to the
    // server DB's parent when the home dir cannot be resolved.
    let logs_dir = match cfg.logs_dir() {
        Some(d) => d,
        None => {
            if let Some(parent) = cfg.server_file_path.parent() {
                parent.join("logs")
            } else {
                let home = dirs::home_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
                home.join(".".to_string() + env!("CARGO_PKG_NAME")).join("logs")
            }
        }
    };
    let _ = std::fs::create_dir_all(&logs_dir);

    // All tracing output goes into the canonical debug log file only; no
    // console fmt layer so terminal output stays clean for progress bars.
    let log_path = logs_dir.join("debug.log");
    let level_str = if debug { "debug" } else { "warn" };

    match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => {
            let (non_blocking_writer, guard) = non_blocking(file);
            // Leak the worker guard so the background thread remains alive for
            // the duration of the process. If the guard is dropped when this
            // function returns, the writer thread will stop and logs may be
            // lost.
            let _ = Box::leak(Box::new(guard));
            let file_layer = fmt::layer()
                .with_writer(non_blocking_writer)
                .with_ansi(false)
                .with_filter(EnvFilter::new(level_str));
            tracing_subscriber::registry().with(file_layer).init();
        }
        Err(e) => {
            eprintln!("warning: could not open debug log at {}: {}", log_path.display(), e);
        }
    }
}
