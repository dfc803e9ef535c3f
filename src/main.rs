use anyhow::Result;
use tracing_subscriber::EnvFilter;

use manta_gc::{config, handlers};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup (stdout carries data) ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // --- Parse config + command ---
    let (cfg, command) = config::GcConfig::from_env_and_args()?;
    tracing::debug!(?cfg, ?command, "starting");

    // --- Run the tool over stdin/stdout ---
    if let Err(err) =
        handlers::run_command(&cfg, command, tokio::io::stdin(), tokio::io::stdout()).await
    {
        tracing::error!("{:#}", err);
        std::process::exit(1);
    }

    Ok(())
}
