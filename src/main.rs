use ptt_voice::app::App;
use ptt_voice::config::Config;

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    tracing::info!("Starting ptt-voice push-to-talk host");

    // Load configuration
    let config = Config::load()?;
    config.validate()?;

    // Create LocalSet for !Send futures (the session controller holds the cpal stream)
    let local = tokio::task::LocalSet::new();

    local.run_until(async move { App::new(config).run().await }).await
}
