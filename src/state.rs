//! Network state module
//!
//! Contains the shared state used by listeners, readers and writers.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

use crate::config::NetworkConfig;
use crate::error::{Result, RustscapeError};
use crate::net::codec::{
    BinaryPacketDecoder, BinaryPacketEncoder, BinaryPacketEncryptor, ZlibCompressor,
};
use crate::net::event::NetworkEventHandler;
use crate::net::filter::ConnectionFilter;
use crate::net::session::SessionManager;
use crate::net::stats::{NetworkReaderStatistic, NetworkWriterStatistic};

/// Network state shared across all connections
pub struct NetworkState {
    /// Network configuration
    pub config: NetworkConfig,
    /// Session manager for tracking connected peers
    pub session_manager: Arc<SessionManager>,
    /// Admission control shared with the session manager
    pub connection_filter: Arc<ConnectionFilter>,
    /// Outbound frame encoder
    pub encoder: Arc<BinaryPacketEncoder>,
    /// Inbound frame decoder
    pub decoder: Arc<BinaryPacketDecoder>,
    pub reader_statistic: Arc<NetworkReaderStatistic>,
    pub writer_statistic: Arc<NetworkWriterStatistic>,
    /// Application callbacks
    pub events: Arc<dyn NetworkEventHandler>,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
}

impl NetworkState {
    /// Create a new network state with zlib compression and no encryption
    pub fn new(
        config: NetworkConfig,
        events: Arc<dyn NetworkEventHandler>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| RustscapeError::Config(e.to_string()))?;

        let connection_filter = Arc::new(ConnectionFilter::with_max_connections(
            config.max_connections_per_ip,
        ));
        for ip in &config.banned_addresses {
            connection_filter.ban(*ip);
        }

        let session_manager = Arc::new(
            SessionManager::new(connection_filter.clone(), events.clone())
                .with_packet_queue(config.packet_queue_size, config.queue_policy())
                .with_settings(config.session_settings()),
        );

        let compressor = Arc::new(ZlibCompressor::new());
        let encoder = BinaryPacketEncoder::new()
            .with_compressor(compressor.clone())
            .with_compression_threshold(config.compression_threshold);
        let decoder = BinaryPacketDecoder::new()
            .with_compressor(compressor)
            .with_max_frame_size(config.max_frame_size);

        info!(
            max_connections_per_ip = config.max_connections_per_ip,
            banned = config.banned_addresses.len(),
            packet_queue_size = config.packet_queue_size,
            packet_queue_policy = ?config.packet_queue_policy,
            compression_threshold = config.compression_threshold,
            "Network state initialized"
        );

        Ok(Self {
            config,
            session_manager,
            connection_filter,
            encoder: Arc::new(encoder),
            decoder: Arc::new(decoder),
            reader_statistic: Arc::new(NetworkReaderStatistic::new()),
            writer_statistic: Arc::new(NetworkWriterStatistic::new()),
            events,
            shutdown_tx,
        })
    }

    /// Install an encryptor on both codec directions
    pub fn with_encryptor(mut self, encryptor: Arc<dyn BinaryPacketEncryptor>) -> Self {
        let compressor = Arc::new(ZlibCompressor::new());
        self.encoder = Arc::new(
            BinaryPacketEncoder::new()
                .with_compressor(compressor.clone())
                .with_encryptor(encryptor.clone())
                .with_compression_threshold(self.config.compression_threshold),
        );
        self.decoder = Arc::new(
            BinaryPacketDecoder::new()
                .with_compressor(compressor)
                .with_encryptor(encryptor)
                .with_max_frame_size(self.config.max_frame_size),
        );
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::event::ChannelEventHandler;

    fn state(config: NetworkConfig) -> Result<NetworkState> {
        let (events, _rx) = ChannelEventHandler::new();
        let (shutdown_tx, _) = broadcast::channel(1);
        NetworkState::new(config, Arc::new(events), shutdown_tx)
    }

    #[test]
    fn test_state_applies_config() {
        let mut config = NetworkConfig::default();
        config.max_connections_per_ip = 2;
        config.banned_addresses = vec!["10.1.2.3".parse().unwrap()];
        config.compression_threshold = 64;

        let state = state(config).unwrap();
        assert_eq!(state.connection_filter.max_connections_per_ip(), 2);
        assert!(state.connection_filter.is_banned("10.1.2.3".parse().unwrap()));
        assert_eq!(state.encoder.compression_threshold(), 64);
        assert_eq!(state.session_manager.count(), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = NetworkConfig::default();
        config.reader_workers = 0;
        assert!(matches!(state(config), Err(RustscapeError::Config(_))));
    }
}
