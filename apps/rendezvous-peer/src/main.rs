use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rendezvous_peer::{Cli, PeerConfig, Role, WebRtcEngine};
use tokio::signal;
use tracing::{info, warn};

mod telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init()?;

    let cli = Cli::parse();
    let config = PeerConfig::try_from(cli)?;
    info!(
        cid = %config.cid,
        role = config.role.label(),
        signal_url = %config.signal_url,
        "starting rendezvous peer"
    );

    let initiator = matches!(config.role, Role::Initiator { .. });
    let (engine, events) = WebRtcEngine::new(&config.ice_servers, initiator)
        .await
        .context("failed to create webrtc engine")?;
    let mut session = rendezvous_peer::start(&config, Arc::new(engine), events)
        .await
        .context("failed to start signaling session")?;

    tokio::select! {
        ready = session.wait_writable() => {
            ready.context("session ended before the data channel opened")?;
        }
        _ = signal::ctrl_c() => {
            info!("interrupted before the data channel opened");
            session.close().await;
            return Ok(());
        }
    }

    let greeting = format!("hello from {}", config.cid);
    if let Err(err) = session.send_text(greeting).await {
        warn!(error = %err, "failed to send greeting");
    }

    loop {
        tokio::select! {
            message = session.recv() => match message {
                Some(bytes) => info!(message = %String::from_utf8_lossy(&bytes), "received"),
                None => break,
            },
            _ = signal::ctrl_c() => break,
        }
    }

    info!(state = ?session.state(), "shutting down");
    session.close().await;
    Ok(())
}
