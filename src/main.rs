//! threadctl demo binary.

mod cli;
mod demo;

use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use threadctl_config::{Config, ConfigLoader, ConfigValidator, LoggingConfig};

use crate::cli::{Cli, Commands};

/// Initialize tracing with console and optional rolling file output.
fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let file_layer = match &logging.file {
        Some(prefix) => {
            let log_dir = logging.log_dir();
            std::fs::create_dir_all(&log_dir)
                .with_context(|| format!("creating log directory {}", log_dir.display()))?;
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(prefix.as_str())
                .filename_suffix("log")
                .max_log_files(14)
                .build(&log_dir)?;
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            // Flushes on drop; must live as long as the process.
            static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
                std::sync::OnceLock::new();
            let _ = GUARD.set(guard);

            Some(fmt::layer().with_writer(non_blocking).with_ansi(false))
        }
        None => None,
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_thread_names(true))
        .with(file_layer)
        .init();

    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = ConfigLoader::load_or_default(cli.config.as_deref())
        .context("loading configuration")?;

    let command = cli.command.unwrap_or(Commands::Run {
        duration: None,
        scan_steps: None,
    });
    if let Commands::Run {
        duration,
        scan_steps,
    } = &command
    {
        if let Some(secs) = duration {
            config.demo.duration_secs = *secs;
        }
        if let Some(steps) = scan_steps {
            config.demo.scan_steps = *steps;
        }
    }

    init_tracing(&config.logging)?;

    let validation = ConfigValidator::validate(&config);
    for warning in &validation.warnings {
        warn!(path = %warning.path, "{}", warning.message);
    }
    if let Some(err) = validation.into_error() {
        bail!(err);
    }

    match command {
        Commands::Run { .. } => run(config),
        Commands::CheckConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn run(config: Config) -> anyhow::Result<()> {
    info!("Starting threadctl v{}", env!("CARGO_PKG_VERSION"));
    watch_shutdown(config.demo.duration())?;
    demo::run(&config)?;
    info!("threadctl stopped");
    Ok(())
}

/// Stop the main controller on Ctrl-C or when `limit` elapses.
fn watch_shutdown(limit: Option<Duration>) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building signal runtime")?;

    std::thread::Builder::new()
        .name("shutdown".to_string())
        .spawn(move || {
            runtime.block_on(async {
                let interrupt = async {
                    if let Err(err) = tokio::signal::ctrl_c().await {
                        warn!(error = %err, "Failed to listen for Ctrl-C");
                        std::future::pending::<()>().await;
                    }
                };
                let deadline = async {
                    match limit {
                        Some(limit) => tokio::time::sleep(limit).await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    _ = interrupt => info!("Interrupt received, shutting down"),
                    _ = deadline => info!("Run time elapsed, shutting down"),
                }
            });
            let stopped = threadctl_core::get_controller(demo::MAIN, true, None)
                .and_then(|main| main.stop());
            if let Err(err) = stopped {
                debug!(error = %err, "Main controller already stopped");
            }
        })
        .context("spawning shutdown thread")?;
    Ok(())
}
