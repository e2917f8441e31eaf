use anyhow::Result;
use clap::Parser;
use rendezvous_server::{Cli, ServerConfig};
use tracing::info;

mod telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = telemetry::Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        path = %config.signal_path,
        heartbeat_interval_secs = config.heartbeat_interval.as_secs(),
        idle_timeout_secs = config.idle_timeout().as_secs(),
        "starting rendezvous server"
    );

    rendezvous_server::run(config, Some(telemetry.metrics_handle())).await
}
