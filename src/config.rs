//! Network configuration module
//!
//! Handles loading and parsing of network configuration from files and environment variables.

use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::net::codec::{DEFAULT_COMPRESSION_THRESHOLD, DEFAULT_MAX_FRAME_SIZE};
use crate::net::filter::DEFAULT_MAX_CONNECTIONS_PER_IP;
use crate::net::queue::{
    AcceptAllPolicy, DefaultPacketQueuePolicy, PacketQueuePolicy, DEFAULT_PACKET_QUEUE_SIZE,
};
use crate::net::session::SessionSettings;

/// Which queue policy new sessions get
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueuePolicyKind {
    /// Shed low-priority packets as the queue fills up
    Default,
    /// Capacity limit only
    AcceptAll,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Path to the configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Address all listeners bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// Stream socket port (0 picks an ephemeral port)
    #[serde(default = "default_socket_port")]
    pub socket_port: u16,

    #[serde(default = "default_true")]
    pub socket_enabled: bool,

    /// WebSocket port for browser clients
    #[serde(default = "default_websocket_port")]
    pub websocket_port: u16,

    #[serde(default = "default_true")]
    pub websocket_enabled: bool,

    /// Datagram port for bound UDP peers
    #[serde(default = "default_datagram_port")]
    pub datagram_port: u16,

    #[serde(default)]
    pub datagram_enabled: bool,

    /// Number of stream reader workers
    #[serde(default = "default_workers")]
    pub reader_workers: usize,

    /// Number of writer workers
    #[serde(default = "default_workers")]
    pub writer_workers: usize,

    /// Scratch buffer size of each reader, in bytes
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,

    /// Largest payload length a peer may declare
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Live connections allowed per IP
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: usize,

    /// Addresses refused at accept time
    #[serde(default)]
    pub banned_addresses: Vec<IpAddr>,

    /// Outbound queue capacity per session
    #[serde(default = "default_packet_queue_size")]
    pub packet_queue_size: usize,

    #[serde(default = "default_packet_queue_policy")]
    pub packet_queue_policy: QueuePolicyKind,

    /// Payloads above this many bytes are compressed
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,

    /// Seconds without activity before a session is closed (0 to disable)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Seconds a lost associated session is kept for reconnection (0 to disable)
    #[serde(default)]
    pub reconnection_secs: u64,

    /// Milliseconds a session may stay unassociated
    #[serde(default = "default_orphan_allowance")]
    pub orphan_allowance_ms: u64,

    /// Interval of the idle/orphan/reconnection sweep
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

// Default value functions
fn default_bind_address() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_socket_port() -> u16 {
    43594
}

fn default_websocket_port() -> u16 {
    43596
}

fn default_datagram_port() -> u16 {
    43597
}

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    4
}

fn default_max_buffer_size() -> usize {
    65536
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_max_connections_per_ip() -> usize {
    DEFAULT_MAX_CONNECTIONS_PER_IP
}

fn default_packet_queue_size() -> usize {
    DEFAULT_PACKET_QUEUE_SIZE
}

fn default_packet_queue_policy() -> QueuePolicyKind {
    QueuePolicyKind::Default
}

fn default_compression_threshold() -> usize {
    DEFAULT_COMPRESSION_THRESHOLD
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_orphan_allowance() -> u64 {
    3000
}

fn default_sweep_interval() -> u64 {
    1
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config/network.toml"),
            bind_address: default_bind_address(),
            socket_port: default_socket_port(),
            socket_enabled: default_true(),
            websocket_port: default_websocket_port(),
            websocket_enabled: default_true(),
            datagram_port: default_datagram_port(),
            datagram_enabled: false,
            reader_workers: default_workers(),
            writer_workers: default_workers(),
            max_buffer_size: default_max_buffer_size(),
            max_frame_size: default_max_frame_size(),
            max_connections_per_ip: default_max_connections_per_ip(),
            banned_addresses: Vec::new(),
            packet_queue_size: default_packet_queue_size(),
            packet_queue_policy: default_packet_queue_policy(),
            compression_threshold: default_compression_threshold(),
            idle_timeout_secs: default_idle_timeout(),
            reconnection_secs: 0,
            orphan_allowance_ms: default_orphan_allowance(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl NetworkConfig {
    /// Load configuration from file and environment variables
    pub async fn load() -> Result<Self> {
        // Determine config path from environment or use default
        let config_path = env::var("RUSTSCAPE_NET_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/network.toml"));

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| {
                    format!("Failed to read config file: {}", config_path.display())
                })?;

            toml::from_str(&content).with_context(|| {
                format!("Failed to parse config file: {}", config_path.display())
            })?
        } else {
            tracing::warn!(
                "Config file not found at {}, using defaults",
                config_path.display()
            );
            Self::default()
        };

        config.config_path = config_path;
        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("RUSTSCAPE_BIND_ADDRESS") {
            if let Ok(addr) = val.parse() {
                self.bind_address = addr;
            }
        }
        if let Ok(val) = env::var("RUSTSCAPE_SOCKET_PORT") {
            if let Ok(port) = val.parse() {
                self.socket_port = port;
            }
        }
        if let Ok(val) = env::var("RUSTSCAPE_WEBSOCKET_PORT") {
            if let Ok(port) = val.parse() {
                self.websocket_port = port;
            }
        }
        if let Ok(val) = env::var("RUSTSCAPE_DATAGRAM_PORT") {
            if let Ok(port) = val.parse() {
                self.datagram_port = port;
            }
        }
        if let Ok(val) = env::var("RUSTSCAPE_DATAGRAM_ENABLED") {
            self.datagram_enabled = val.to_lowercase() == "true" || val == "1";
        }
        if let Ok(val) = env::var("RUSTSCAPE_READER_WORKERS") {
            if let Ok(workers) = val.parse() {
                self.reader_workers = workers;
            }
        }
        if let Ok(val) = env::var("RUSTSCAPE_WRITER_WORKERS") {
            if let Ok(workers) = val.parse() {
                self.writer_workers = workers;
            }
        }
        if let Ok(val) = env::var("RUSTSCAPE_MAX_CONNECTIONS_PER_IP") {
            if let Ok(max) = val.parse() {
                self.max_connections_per_ip = max;
            }
        }
        if let Ok(val) = env::var("RUSTSCAPE_IDLE_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse() {
                self.idle_timeout_secs = secs;
            }
        }
        if let Ok(val) = env::var("RUSTSCAPE_RECONNECTION_SECS") {
            if let Ok(secs) = val.parse() {
                self.reconnection_secs = secs;
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.socket_enabled && !self.websocket_enabled {
            anyhow::bail!("At least one of the socket and WebSocket listeners must be enabled");
        }

        // Fixed ports must be unique; 0 means ephemeral
        let tcp_ports = [
            (self.socket_enabled, self.socket_port),
            (self.websocket_enabled, self.websocket_port),
        ];
        if tcp_ports.iter().all(|(enabled, port)| *enabled && *port != 0)
            && self.socket_port == self.websocket_port
        {
            anyhow::bail!("Socket port and WebSocket port must be different");
        }

        if self.reader_workers == 0 || self.writer_workers == 0 {
            anyhow::bail!("Reader and writer worker counts must be at least 1");
        }
        if self.max_buffer_size < 512 {
            anyhow::bail!("Read buffer must be at least 512 bytes");
        }
        if self.packet_queue_size == 0 {
            anyhow::bail!("Packet queue size must be at least 1");
        }
        if self.sweep_interval_secs == 0 {
            anyhow::bail!("Sweep interval must be at least 1 second");
        }

        Ok(())
    }

    pub fn socket_address(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.socket_port)
    }

    pub fn websocket_address(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.websocket_port)
    }

    pub fn datagram_address(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.datagram_port)
    }

    /// Session timeouts derived from this configuration
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            max_idle: Duration::from_secs(self.idle_timeout_secs),
            reconnection_window: Duration::from_secs(self.reconnection_secs),
            orphan_allowance: Duration::from_millis(self.orphan_allowance_ms),
        }
    }

    pub fn queue_policy(&self) -> Arc<dyn PacketQueuePolicy> {
        match self.packet_queue_policy {
            QueuePolicyKind::Default => Arc::new(DefaultPacketQueuePolicy),
            QueuePolicyKind::AcceptAll => Arc::new(AcceptAllPolicy),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NetworkConfig::default();
        assert_eq!(config.socket_port, 43594);
        assert_eq!(config.websocket_port, 43596);
        assert_eq!(config.max_connections_per_ip, 10);
        assert_eq!(config.packet_queue_size, 100);
        assert_eq!(config.compression_threshold, 3000);
        assert_eq!(config.orphan_allowance_ms, 3000);
        assert!(!config.datagram_enabled);
    }

    #[test]
    fn test_parse_toml() {
        let config: NetworkConfig = toml::from_str(
            r#"
            socket_port = 0
            websocket_enabled = false
            packet_queue_policy = "accept-all"
            banned_addresses = ["10.0.0.7"]
            reconnection_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.socket_port, 0);
        assert_eq!(config.packet_queue_policy, QueuePolicyKind::AcceptAll);
        assert_eq!(config.banned_addresses, vec!["10.0.0.7".parse::<IpAddr>().unwrap()]);
        assert_eq!(config.session_settings().reconnection_window, Duration::from_secs(30));
        assert_eq!(config.writer_workers, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = NetworkConfig::default();

        // Valid config should pass
        assert!(config.validate().is_ok());

        // Duplicate ports
        config.websocket_port = config.socket_port;
        assert!(config.validate().is_err());

        // Ephemeral ports may repeat
        config.socket_port = 0;
        config.websocket_port = 0;
        assert!(config.validate().is_ok());

        config.writer_workers = 0;
        assert!(config.validate().is_err());
    }
}
