//! clima-ingest - DWD climate archive ingestion

use anyhow::Context;
use clap::Parser;
use clima_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use clima_ingest::{commands, Cli, IngestError};
use std::process;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Stdout is reserved for command output
    let log_config = LogConfig::builder()
        .level(log_level)
        .output(LogOutput::Stderr)
        .log_file_prefix("clima-ingest".to_string())
        .build();

    // Environment variables take precedence
    let mut log_config = match log_config.clone().merge_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Ignoring invalid LOG_* settings: {}", e);
            log_config
        },
    };

    // Worker stdout carries the report
    if cli.command.is_worker() && matches!(log_config.output, LogOutput::Stdout | LogOutput::Both) {
        log_config.output = LogOutput::Stderr;
    }

    let guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            None
        },
    };

    let code = match run(&cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Command failed");
            eprintln!("Error: {:#}", e);
            exit_code(&e)
        },
    };

    // process::exit skips destructors; flush file logs first
    drop(guard);
    process::exit(code);
}

async fn run(cli: &Cli) -> anyhow::Result<i32> {
    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone(), !cli.command.is_worker()));

    let code = commands::execute(cli, cancel)
        .await
        .with_context(|| format!("clima-ingest {}", cli.command.name()))?;
    Ok(code)
}

/// 2 for configuration errors, 4 for manifest integrity errors, 1 otherwise
fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<IngestError>()
        .map_or(commands::EXIT_FAILURE, IngestError::exit_code)
}

/// Cancel `token` on Ctrl+C or SIGTERM
///
/// Running work is not interrupted; workers stop claiming after their
/// current file. With `exit_on_second`, a further Ctrl+C exits at once.
/// Worker processes leave that to their parent, since they can see both the
/// terminal's interrupt and the parent's forwarded SIGTERM.
async fn cancel_on_signal(token: CancellationToken, exit_on_second: bool) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, finishing in-flight files"),
        _ = terminate => info!("Received terminate signal, finishing in-flight files"),
    }
    token.cancel();
    if !exit_on_second {
        return;
    }

    // A second signal exits immediately; abandoned claims are reclaimed later
    if signal::ctrl_c().await.is_ok() {
        warn!("Second interrupt, exiting");
        process::exit(130);
    }
}
