//! Boundary between the signaling coordinator and whatever actually moves
//! bytes between the two endpoints once they know about each other.

use async_trait::async_trait;
use bytes::Bytes;
use rendezvous_proto::SessionDescription;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Terminal states end the session; `Disconnected` may still recover.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

/// Notifications an engine pushes to its coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    LocalCandidate(String),
    ChannelOpen,
    ChannelMessage(Bytes),
    ChannelClosed,
    ConnectionState(ConnectionState),
}

pub type EngineEvents = mpsc::UnboundedReceiver<EngineEvent>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to create {kind} description: {reason}")]
    CreateDescription { kind: &'static str, reason: String },
    #[error("failed to commit {side} description: {reason}")]
    CommitDescription { side: &'static str, reason: String },
    #[error("session description has unexpected shape: {0}")]
    InvalidDescription(#[from] serde_json::Error),
    #[error("failed to add remote candidate: {0}")]
    Candidate(String),
    #[error("data channel is not open")]
    ChannelNotOpen,
    #[error("data channel send failed: {0}")]
    Send(String),
    #[error("engine setup failed: {0}")]
    Setup(String),
    #[error("engine shutdown failed: {0}")]
    Close(String),
}

#[async_trait]
pub trait TransportEngine: Send + Sync {
    async fn create_local_offer(&self) -> Result<SessionDescription, EngineError>;

    async fn create_local_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), EngineError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError>;

    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), EngineError>;

    async fn send_text(&self, text: String) -> Result<(), EngineError>;

    async fn send_bytes(&self, bytes: Bytes) -> Result<(), EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}
