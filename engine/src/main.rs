use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use palimpsest_core::sniff_media_type;
use palimpsest_observability::{canonical_logs_dir_from_root, init_process_logging, ProcessKind};
use palimpsest_orchestrator::run_pipeline;
use palimpsest_server::{serve, AppState};
use palimpsest_types::StreamEvent;

#[derive(Parser, Debug)]
#[command(name = "palimpsest-engine")]
#[command(about = "Historical document restoration engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP engine.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 3000)]
        port: u16,
        #[arg(long)]
        state_dir: Option<String>,
    },
    /// Restore a single document image and print the agent transcript.
    Restore {
        image: PathBuf,
        #[arg(long)]
        state_dir: Option<String>,
        /// Emit the full event stream as JSON lines instead of a transcript.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let _log_guard = init_process_logging(
                ProcessKind::Engine,
                &canonical_logs_dir_from_root(&state_dir),
                14,
            )?;
            let state = AppState::from_state_dir(&state_dir).await?;
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            log_startup_paths(&state_dir, &addr);
            serve(addr, state).await?;
        }
        Command::Restore {
            image,
            state_dir,
            json,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let _log_guard = init_process_logging(
                ProcessKind::Cli,
                &canonical_logs_dir_from_root(&state_dir),
                14,
            )?;
            let state = AppState::from_state_dir(&state_dir).await?;
            restore_one(&state, &image, json).await?;
        }
    }

    Ok(())
}

async fn restore_one(state: &AppState, image_path: &PathBuf, json: bool) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(image_path)
        .await
        .with_context(|| format!("reading {}", image_path.display()))?;
    let media_type = sniff_media_type(&bytes)
        .context("unsupported image format (expected PNG, JPEG, GIF, TIFF, BMP, or WebP)")?;

    let (tx, mut rx) = mpsc::channel(64);
    let deps = state.deps.clone();
    let media = media_type.to_string();
    let cancel = CancellationToken::new();
    let run = tokio::spawn(async move { run_pipeline(&deps, bytes, media, tx, cancel).await });

    while let Some(message) = rx.recv().await {
        if json {
            println!("{}", serde_json::to_string(&StreamEvent::Message(message))?);
        } else {
            let confidence = message
                .confidence
                .map(|c| format!(" ({c:.0})"))
                .unwrap_or_default();
            println!("[{}]{} {}", message.role, confidence, message.text);
        }
    }

    let result = run.await??;
    if json {
        println!(
            "{}",
            serde_json::to_string(&StreamEvent::Complete(
                palimpsest_types::CompletionEvent::fresh(result)
            ))?
        );
    } else {
        println!(
            "overall confidence: {:.0} | {} recommendation(s) | {} hotspot(s) | {} ms",
            result.overall_confidence,
            result.repair_recommendations.len(),
            result.damage_hotspots.len(),
            result.processing_time_ms
        );
        println!("{}", serde_json::to_string_pretty(&result)?);
    }
    Ok(())
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("PALIMPSEST_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".palimpsest")
}

fn log_startup_paths(state_dir: &PathBuf, addr: &SocketAddr) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let config_path = state_dir.join("config.json");
    info!("starting palimpsest-engine on http://{addr}");
    info!(
        "startup paths: exe={} cwd={} state_dir={} config_path={}",
        exe.display(),
        cwd.display(),
        state_dir.display(),
        config_path.display()
    );
}
