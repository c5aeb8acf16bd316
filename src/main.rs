//! Watch duplicate call suppression at work.
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{debug, error};

mod app_config;
mod storm;
mod trc;

use crate::app_config::Config;
use crate::trc::Trc;

#[derive(Parser)]
#[command(version, about = "Duplicate call suppression demo.")]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to a flightgroup config TOML."
    )]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Race many callers for one key and report how often the work actually ran.
    Storm {
        /// Number of concurrent callers. Overrides the config file.
        #[arg(long)]
        callers: Option<usize>,

        /// Duration of the work function in milliseconds. Overrides the config file.
        #[arg(long)]
        delay_ms: Option<u64>,

        /// The key every caller uses. Overrides the config file.
        #[arg(long)]
        key: Option<String>,

        /// Use tokio tasks and the async group instead of threads.
        #[arg(long = "async")]
        use_async: bool,
    },
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    // Errors use eprintln since tracing isn't initialized yet.
    let mut config = Config::load_or_default(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });

    Trc::default().init().unwrap_or_else(|e| {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        std::process::exit(1);
    });

    let Command::Storm {
        callers,
        delay_ms,
        key,
        use_async,
    } = args.command.unwrap_or(Command::Storm {
        callers: None,
        delay_ms: None,
        key: None,
        use_async: false,
    });

    if let Some(callers) = callers {
        config.storm.callers = callers;
    }
    if let Some(delay_ms) = delay_ms {
        config.storm.delay_ms = delay_ms;
    }
    if let Some(key) = key {
        config.storm.key = key;
    }
    if let Err(error_messages) = config.validate() {
        for msg in &error_messages {
            error!("{msg}");
        }
        std::process::exit(1);
    }
    debug!(config = ?config, "Running storm with configuration...");

    let report = if use_async {
        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                error!("Failed to start the tokio runtime: {e}");
                std::process::exit(1);
            }
        };
        runtime.block_on(storm::run_tasks(config.group.clone(), &config.storm))
    } else {
        storm::run_threads(config.group.clone(), &config.storm)
    };

    report.log(config.storm.callers);
}
