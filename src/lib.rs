//! Rustscape Network Library
//!
//! Session-oriented networking for game servers: connection admission,
//! binary framing, per-session priority queues and worker pools that move
//! bytes between sockets and the application.
//!
//! ## Modules
//!
//! - `config` - Network configuration management
//! - `error` - Error types and result definitions
//! - `net` - Sessions, codec, queues, reader and writer engines
//! - `server` - Listener wiring and lifecycle
//! - `state` - Shared network state

pub mod config;
pub mod error;
pub mod net;
pub mod server;
pub mod state;

// Re-export commonly used types
pub use config::NetworkConfig;
pub use error::{Result, RustscapeError};
pub use server::NetworkServer;
pub use state::NetworkState;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
