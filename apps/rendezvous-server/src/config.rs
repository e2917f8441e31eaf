use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "rendezvous-server",
    author,
    version,
    about = "Relays session descriptions and candidates between registered peers"
)]
pub struct Cli {
    /// Address to bind the websocket listener to.
    #[arg(long, env = "RENDEZVOUS_LISTEN_ADDR", default_value = "0.0.0.0:18900")]
    pub listen_addr: String,

    /// Route the signaling websocket is served on.
    #[arg(long, env = "RENDEZVOUS_PATH", default_value = "/signal")]
    pub path: String,

    /// Expected spacing between client heartbeats.
    #[arg(long, env = "RENDEZVOUS_HEARTBEAT_INTERVAL_SECS", default_value_t = 20)]
    pub heartbeat_interval_secs: u64,

    /// Heartbeats a connection may miss before its identities are evicted.
    #[arg(long, env = "RENDEZVOUS_MAX_MISSED_HEARTBEATS", default_value_t = 3)]
    pub max_missed_heartbeats: u32,

    /// Grace period applied during shutdown.
    #[arg(long, env = "RENDEZVOUS_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub signal_path: String,
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        self.heartbeat_interval * self.max_missed_heartbeats
    }
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if !cli.path.starts_with('/') {
            bail!("signal path must start with '/': {}", cli.path);
        }
        if cli.heartbeat_interval_secs == 0 {
            bail!("heartbeat interval must be at least one second");
        }
        if cli.max_missed_heartbeats == 0 {
            bail!("max missed heartbeats must be at least one");
        }
        Ok(ServerConfig {
            listen_addr,
            signal_path: cli.path,
            heartbeat_interval: Duration::from_secs(cli.heartbeat_interval_secs),
            max_missed_heartbeats: cli.max_missed_heartbeats,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
