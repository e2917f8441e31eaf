use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use url::Url;

#[derive(Debug, Parser)]
#[command(
    name = "rendezvous-peer",
    author,
    version,
    about = "Registers with a rendezvous server and opens a direct data channel to another peer"
)]
pub struct Cli {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct CommonArgs {
    /// Websocket URL of the rendezvous server.
    #[arg(
        long,
        global = true,
        env = "RENDEZVOUS_SIGNAL_URL",
        default_value = "ws://127.0.0.1:18900/signal"
    )]
    pub signal_url: String,

    /// STUN/TURN server used for path discovery. Repeat for several.
    #[arg(
        long = "ice-server",
        global = true,
        env = "RENDEZVOUS_ICE_SERVER",
        default_value = "stun:stun.l.google.com:19302"
    )]
    pub ice_servers: Vec<String>,

    /// Identity to register under.
    #[arg(long, global = true, env = "RENDEZVOUS_CID")]
    pub cid: Option<String>,

    /// Secret other peers must present to reach this identity.
    #[arg(long, global = true, env = "RENDEZVOUS_AUTH_CODE")]
    pub auth_code: Option<String>,

    /// Seconds between heartbeats on the signaling connection.
    #[arg(long, global = true, default_value_t = 20)]
    pub ping_interval_secs: u64,

    /// Seconds to wait for the server to confirm registration.
    #[arg(long, global = true, default_value_t = 5)]
    pub register_timeout_secs: u64,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Offer a session to a known peer.
    Offer {
        /// Identity of the peer to reach.
        #[arg(long)]
        to_cid: String,
        /// That peer's secret.
        #[arg(long)]
        to_auth_code: String,
    },
    /// Wait for an offer and answer it.
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Initiator {
        remote_cid: String,
        remote_auth_code: String,
    },
    Responder,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Role::Initiator { .. } => "initiator",
            Role::Responder => "responder",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub signal_url: Url,
    pub ice_servers: Vec<String>,
    pub cid: String,
    pub auth_code: String,
    pub role: Role,
    pub ping_interval: Duration,
    pub register_timeout: Duration,
}

impl PeerConfig {
    /// Config with the usual timings; handy for embedding and tests.
    pub fn new(signal_url: Url, cid: impl Into<String>, auth_code: impl Into<String>, role: Role) -> Self {
        Self {
            signal_url,
            ice_servers: Vec::new(),
            cid: cid.into(),
            auth_code: auth_code.into(),
            role,
            ping_interval: Duration::from_secs(20),
            register_timeout: Duration::from_secs(5),
        }
    }
}

impl TryFrom<Cli> for PeerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let common = cli.common;
        let signal_url = Url::parse(&common.signal_url)
            .with_context(|| format!("invalid signal url: {}", common.signal_url))?;
        if !matches!(signal_url.scheme(), "ws" | "wss") {
            bail!("signal url must use ws:// or wss://: {}", signal_url);
        }
        let cid = common.cid.context("--cid is required")?;
        let auth_code = common.auth_code.context("--auth-code is required")?;
        if common.ping_interval_secs == 0 {
            bail!("ping interval must be at least one second");
        }
        let role = match cli.command {
            Command::Offer {
                to_cid,
                to_auth_code,
            } => {
                if to_cid == cid {
                    bail!("cannot offer a session to ourselves ({cid})");
                }
                Role::Initiator {
                    remote_cid: to_cid,
                    remote_auth_code: to_auth_code,
                }
            }
            Command::Answer => Role::Responder,
        };
        Ok(PeerConfig {
            signal_url,
            ice_servers: common.ice_servers,
            cid,
            auth_code,
            role,
            ping_interval: Duration::from_secs(common.ping_interval_secs),
            register_timeout: Duration::from_secs(common.register_timeout_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn offer_subcommand_builds_initiator() {
        let cli = Cli::parse_from([
            "rendezvous-peer",
            "--cid",
            "c1",
            "--auth-code",
            "pw1",
            "offer",
            "--to-cid",
            "c2",
            "--to-auth-code",
            "pw2",
        ]);
        let config = PeerConfig::try_from(cli).unwrap();
        assert_eq!(config.signal_url.as_str(), "ws://127.0.0.1:18900/signal");
        assert_eq!(config.ice_servers, vec!["stun:stun.l.google.com:19302"]);
        assert_eq!(
            config.role,
            Role::Initiator {
                remote_cid: "c2".into(),
                remote_auth_code: "pw2".into(),
            }
        );
        assert_eq!(config.ping_interval, Duration::from_secs(20));
    }

    #[test_timeout::timeout]
    fn answer_subcommand_builds_responder() {
        let cli = Cli::parse_from(["rendezvous-peer", "answer", "--cid", "c2", "--auth-code", "pw2"]);
        let config = PeerConfig::try_from(cli).unwrap();
        assert_eq!(config.role, Role::Responder);
        assert_eq!(config.cid, "c2");
    }

    #[test_timeout::timeout]
    fn missing_identity_is_an_error() {
        let cli = Cli::parse_from(["rendezvous-peer", "answer", "--auth-code", "pw2"]);
        assert!(PeerConfig::try_from(cli).is_err());
    }

    #[test_timeout::timeout]
    fn http_signal_url_is_rejected() {
        let cli = Cli::parse_from([
            "rendezvous-peer",
            "--signal-url",
            "http://127.0.0.1:18900/signal",
            "--cid",
            "c2",
            "--auth-code",
            "pw2",
            "answer",
        ]);
        assert!(PeerConfig::try_from(cli).is_err());
    }
}
