//! AFK voice bot entry point.
//!
//! Reads configuration from the environment (and `.env`), installs the log
//! subscriber, then hands over to [`afk_voice::bot::run`].

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use afk_voice::{bot, BotConfig};

#[tokio::main]
async fn main() {
    // Loads .env first, which may set RUST_LOG.
    let config = BotConfig::from_env();
    init_tracing();

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    info!(
        default_channel = %config.default_channel(),
        auto_join = config.auto_join,
        "starting AFK voice bot"
    );

    if let Err(e) = bot::run(config).await {
        error!(error = %e, "bot stopped");
        std::process::exit(1);
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}
