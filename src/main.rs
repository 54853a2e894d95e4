use anyhow::Context;
use inverter_emeter::{logging, Config, Scheduler};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load_from_env().context("Failed to load configuration")?;
    let _log_guard = logging::init(&config.logging);

    info!("Starting inverter energy-meter aggregator");
    let scheduler = Scheduler::from_config(config).context("Failed to start")?;
    scheduler.run().await;

    Ok(())
}
