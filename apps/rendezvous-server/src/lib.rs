//! Rendezvous relay: peers register an identity with a shared secret, then
//! exchange session descriptions and connectivity candidates through the
//! server until they can talk directly.

pub mod config;
pub mod registry;
pub mod relay;
pub mod server;

pub use config::{Cli, ServerConfig};
pub use registry::Registry;
pub use server::{build_router, run, serve, AppState};
