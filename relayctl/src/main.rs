//! Command-line front end of the registry relay.
//!
//! Every command prints a single JSON object on stdout, `{"success": true, ...}` or
//! `{"success": false, "error": "..."}`. Logs go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use relay::download::Downloader;
use relay::publish::Publisher;
use relay::registry::HttpRegistry;
use relay::sync::Scheduler;
use relay::{Settings, TransferCode};
use serde_json::{json, Value};

const EXIT_FAILURE: u8 = 1;
const EXIT_NOT_FOUND: u8 = 3;

#[derive(Debug, Parser)]
#[command(name = "relayctl")]
#[command(about = "Send and receive files through a package registry")]
#[command(version)]
struct Cli {
    /// Configuration file, overridden by `REGRELAY_*` environment variables
    #[arg(long, short, env = "REGRELAY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Publish a file and print its transfer code
    Send {
        file: PathBuf,
        /// Name announced to receivers (default: file name)
        #[arg(long)]
        name: Option<String>,
        /// MIME type announced to receivers (default: application/octet-stream)
        #[arg(long)]
        mime_type: Option<String>,
    },
    /// Print the metadata of a transfer
    Metadata { code: TransferCode },
    /// Download a transfer into the download directory
    Fetch { code: TransferCode },
    /// Keep retrying transfers in the background until interrupted
    Watch { codes: Vec<TransferCode> },
    /// List completed downloads, most recent first
    History,
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let cli = Cli::parse();

    let (output, code) = match run(cli).await {
        Ok(value) => (respond(value), ExitCode::SUCCESS),
        Err(err) => {
            let code = match err.downcast_ref::<relay::Error>() {
                Some(relay::Error::NotFound(_)) => EXIT_NOT_FOUND,
                _ => EXIT_FAILURE,
            };

            (json!({ "success": false, "error": format!("{err:#}") }), ExitCode::from(code))
        }
    };

    println!("{output}");

    code
}

async fn run(cli: Cli) -> anyhow::Result<Value> {
    let settings = Settings::load(cli.config.as_deref()).context("cannot load settings")?;

    let registry = HttpRegistry::new(&settings.registry_url)?.with_token(settings.registry_token.clone());

    match cli.command {
        Command::Send { file, name, mime_type } => {
            let publisher = Publisher::new(registry, &settings)?;
            let published = publisher.publish_file(&file, name.as_deref(), mime_type.as_deref()).await?;

            Ok(serde_json::to_value(published)?)
        }
        Command::Metadata { code } => {
            let downloader = Downloader::new(registry, &settings)?;
            let resolved = downloader.resolve(&code).await?;

            Ok(json!({ "metadata": resolved.metadata }))
        }
        Command::Fetch { code } => {
            let downloader = Downloader::new(registry, &settings)?;
            let downloaded = downloader.download(&code).await?;

            Ok(serde_json::to_value(downloaded)?)
        }
        Command::Watch { codes } => {
            let scheduler = Arc::new(Scheduler::new(Downloader::new(registry, &settings)?, &settings));
            let handle = Arc::clone(&scheduler).start(settings.sync_interval);

            for code in codes {
                handle.submit(code);
            }

            tokio::signal::ctrl_c().await.context("cannot listen for Ctrl-C")?;
            tracing::info!("Interrupted, stopping...");

            handle.close().await;

            let pending: Vec<_> = scheduler.pending().await.into_iter().map(|task| task.transfer_code).collect();

            Ok(json!({ "pending": pending }))
        }
        Command::History => {
            let downloader = Downloader::new(registry, &settings)?;
            let history = downloader.store().history().await?;

            Ok(json!({ "history": history }))
        }
    }
}

/// Flag a command output as successful.
fn respond(value: Value) -> Value {
    match value {
        Value::Object(mut fields) => {
            fields.insert("success".into(), Value::Bool(true));
            Value::Object(fields)
        }
        value => json!({ "success": true, "result": value }),
    }
}
