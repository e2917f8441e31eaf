//! Endpoint side of the rendezvous protocol: registers an identity, runs the
//! offer/answer exchange through the relay, and hands candidates to a
//! transport engine until a direct data channel opens.

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod signaling;
pub mod webrtc_engine;

pub use config::{Cli, PeerConfig, Role};
pub use coordinator::{start, CoordinatorError, SessionHandle, SessionState};
pub use engine::{ConnectionState, EngineError, EngineEvent, EngineEvents, TransportEngine};
pub use signaling::{SignalingClient, SignalingError};
pub use webrtc_engine::WebRtcEngine;
