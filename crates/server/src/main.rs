use clap::Parser;
use tracing_subscriber::EnvFilter;

use visage_server::cli::{self, Cli};

fn load_config() -> visage_core::Config {
    visage_core::config::load_dotenv();
    visage_core::Config::from_env()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    let config = load_config();
    config.log_summary();

    cli::dispatch(&config, cli).await
}
