//! mirsyncd - the mirror-sync server daemon.

use clap::Parser;
use mirsync::cli::DaemonOpts;
use mirsync::server;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("mirsync=info,tower_http=info")
            }),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let opts = DaemonOpts::parse();
    server::serve(opts.into_config()).await
}
