//! mirsync - mirror a local directory onto a server-side dataset.
//!
//! One invocation runs one sync round: scan, diff against the server,
//! upload what changed, optionally request deletes, persist state.

use clap::Parser;
use mirsync::cli::ClientOpts;
use mirsync::client::SyncRunner;
use mirsync::error::ClientError;
use std::sync::atomic::Ordering;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mirsync=info")),
        )
        .init();
}

#[tokio::main]
async fn main() {
    init_logging();
    let opts = ClientOpts::parse();

    let runner = match SyncRunner::new(opts.into_config()) {
        Ok(runner) => runner,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(e.exit_code());
        }
    };

    // First ctrl-c requests a clean abort at the next chunk boundary; the
    // round then ends without persisting state.
    let cancel = runner.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("cancellation requested; finishing in-flight chunk");
            cancel.store(true, Ordering::Relaxed);
        }
    });

    match runner.run_round().await {
        Ok(summary) => {
            tracing::info!(
                scanned = summary.scanned,
                uploaded_files = summary.uploaded_files,
                uploaded_bytes = summary.uploaded_bytes,
                skipped = summary.skipped_files,
                deletes_requested = summary.deleted_paths,
                "sync round complete"
            );
        }
        Err(ClientError::Cancelled) => {
            tracing::warn!("sync round cancelled; state file left untouched");
            std::process::exit(ClientError::Cancelled.exit_code());
        }
        Err(e) => {
            tracing::error!(error = %e, "sync round failed; state file left untouched");
            std::process::exit(e.exit_code());
        }
    }
}
