//! Bundle CLI entry point.

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use bundle_cli::commands::run_from;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling load");
            on_signal.cancel();
        }
    });

    if let Err(e) = run_from(std::env::args_os(), cancel).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
