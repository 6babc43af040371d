//! `forrst` command-line entry point.
//!
//! Composition root for the workspace:
//!
//! 1. **Load configuration** from `forrst.toml`, `FORRST_*` variables and flags.
//! 2. **Install observability**: an `EnvFilter`-driven `tracing-subscriber`
//!    with a text or JSON layer, plus optional OTLP span export.
//! 3. **Assemble the engine** with the bundled extensions and system functions.
//! 4. **Serve requests** read from a file or stdin, writing encoded responses
//!    to stdout.

mod app;
mod config;
mod telemetry;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use engine::RequestHandler;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

use crate::config::{Config, Overrides};

#[derive(Debug, Parser)]
#[command(name = "forrst", version, about = "Handle Forrst protocol requests")]
struct Cli {
    /// Configuration file. Defaults to ./forrst.toml when present.
    #[arg(long, global = true, env = "FORRST_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter directive, e.g. `debug` or `engine=trace,info`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Include failure details in internal error responses.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Handle one request read from a file or stdin.
    ///
    /// Exits with status 1 when the response carries errors.
    Call {
        /// Request file. Reads stdin when omitted.
        #[arg(long)]
        file: Option<PathBuf>,

        /// Pretty-print the response.
        #[arg(long)]
        pretty: bool,
    },

    /// Handle newline-delimited requests from stdin, one response per line.
    Lines,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("forrst: {err:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = Config::load(cli.config.as_deref())?;
    config.apply_env(|name| std::env::var(name).ok())?;
    config.apply_overrides(&Overrides {
        log_level: cli.log_level,
        json_logs: cli.json_logs,
        debug: cli.debug,
    });

    let telemetry = telemetry::init(&config.logging)?;
    tracing::debug!(?config, "configuration loaded");

    let outcome = match cli.command {
        Command::Call { file, pretty } => {
            let handler = app::build_handler(&config, pretty)?;
            call(&handler, file).await
        }
        Command::Lines => {
            let handler = app::build_handler(&config, false)?;
            lines(&handler).await.map(|()| ExitCode::SUCCESS)
        }
    };

    telemetry.shutdown();
    outcome
}

async fn call(handler: &RequestHandler, file: Option<PathBuf>) -> Result<ExitCode> {
    let raw = match &file {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read request file {}", path.display()))?,
        None => {
            let mut raw = String::new();
            tokio::io::stdin()
                .read_to_string(&mut raw)
                .await
                .context("failed to read request from stdin")?;
            raw
        }
    };

    let response = handler.handle_raw(&raw).await;
    let encoded = handler.encode(&response).context("failed to encode response")?;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(encoded.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;

    Ok(if response.is_error() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn lines(handler: &RequestHandler) -> Result<()> {
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut handled = 0usize;

    while let Some(line) = input.next_line().await.context("failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let encoded = handler
            .handle_raw_to_string(&line)
            .await
            .context("failed to encode response")?;
        stdout.write_all(encoded.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
        handled += 1;
    }

    tracing::info!(handled, "input exhausted");
    Ok(())
}
