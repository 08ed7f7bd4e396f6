use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use checkwatch::engine::EngineEvent;
use checkwatch::{Document, Engine, EngineHandle, JsonLineSink, StreamSource};

#[derive(Parser, Debug)]
#[command(name = "checkwatch")]
#[command(about = "Evaluates streamed metrics and submits passive check reports")]
struct Args {
    /// Path to the configuration document (reloaded on SIGHUP)
    #[arg(short, long, default_value = "checkwatch.json")]
    config: PathBuf,

    /// Host name to file reports under (overrides the configuration)
    #[arg(long)]
    reporting_host: Option<String>,

    /// Read metric events from a TCP endpoint (host:port) instead of stdin
    #[arg(long)]
    connect: Option<String>,

    /// Log filter when RUST_LOG is unset (e.g. "debug", "checkwatch=trace")
    #[arg(long, default_value = "info")]
    log: String,
}

/// Reports are filed under the first of: command-line flag, configuration
/// document, the HOSTNAME environment variable.
fn resolve_reporting_host(args: &Args, document: &Document) -> Result<String> {
    args.reporting_host
        .clone()
        .or_else(|| document.reporting_host.clone())
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
        .context("no reporting host: pass --reporting-host, set it in the configuration, or set HOSTNAME")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log)),
        )
        .with_writer(std::io::stderr)
        .init();

    let document = Document::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;
    let host = resolve_reporting_host(&args, &document)?;

    let sink = Arc::new(JsonLineSink::new(tokio::io::stdout()));
    let (engine, handle) = Engine::new(host, &document, sink)?;
    let engine_task = tokio::spawn(engine.run());

    spawn_reload_handler(args.config.clone(), handle.clone());

    let source = match &args.connect {
        Some(addr) => {
            info!(%addr, "connecting to metric stream");
            let stream = tokio::net::TcpStream::connect(addr)
                .await
                .with_context(|| format!("connecting to {addr}"))?;
            StreamSource::spawn(stream, handle.clone(), addr)
        }
        None => {
            info!("reading metric events from stdin");
            StreamSource::spawn(tokio::io::stdin(), handle.clone(), "stdin")
        }
    };

    tokio::select! {
        _ = source.closed() => {
            info!("metric stream ended");
        }
        result = tokio::signal::ctrl_c() => {
            result.context("listening for ctrl-c")?;
            info!("interrupted");
        }
    }

    let _ = handle.send(EngineEvent::Shutdown);
    engine_task.await.context("engine task panicked")?;
    Ok(())
}

/// Reload the configuration on SIGHUP. A document that fails to load is
/// logged and ignored; the engine keeps its current configuration.
fn spawn_reload_handler(config_path: PathBuf, handle: EngineHandle) {
    tokio::spawn(async move {
        let mut hangup =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(hangup) => hangup,
                Err(err) => {
                    warn!(%err, "cannot listen for SIGHUP, live reload disabled");
                    return;
                }
            };

        while hangup.recv().await.is_some() {
            info!(config = %config_path.display(), "reloading configuration");
            match Document::load(&config_path) {
                Ok(document) => {
                    if handle.send(EngineEvent::Reconfigure(document)).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    error!(%err, "reload failed, keeping current configuration");
                }
            }
        }
    });
}
