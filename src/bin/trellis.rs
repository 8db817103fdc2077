/// Trellis CLI
///
/// Runs branch trees from the command line without embedding the engine in
/// another program.
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use trellis_core::cli;

#[tokio::main]
async fn main() {
    // Respects RUST_LOG
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    if let Err(e) = cli::run_cli().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
