//! Server lifecycle
//!
//! Binds the configured listeners and starts the reader engine, writer engine,
//! accept loops and session sweeper on the current tokio runtime.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::error::Result;
use crate::net::acceptor::{accept_socket_connections, accept_websocket_connections};
use crate::net::event::DisconnectReason;
use crate::net::reader::{run_datagram_reader, InboundHandler, ReaderEngine};
use crate::net::session::SessionManager;
use crate::net::writer::WriterEngine;
use crate::state::NetworkState;

/// A running network server
pub struct NetworkServer {
    state: Arc<NetworkState>,
    reader: Arc<ReaderEngine>,
    writer: Arc<WriterEngine>,
    inbound: Arc<InboundHandler>,
    socket_addr: Option<SocketAddr>,
    websocket_addr: Option<SocketAddr>,
    datagram_socket: Option<Arc<UdpSocket>>,
    tasks: Vec<JoinHandle<()>>,
}

impl NetworkServer {
    /// Bind every enabled listener and start serving
    pub async fn start(state: Arc<NetworkState>) -> Result<Self> {
        let config = &state.config;
        let session_manager = state.session_manager.clone();
        let shutdown_tx = state.shutdown_tx.clone();

        let inbound = Arc::new(InboundHandler::new(
            session_manager.clone(),
            state.decoder.clone(),
            state.reader_statistic.clone(),
        ));
        let reader = Arc::new(ReaderEngine::start(
            inbound.clone(),
            config.reader_workers,
            config.max_buffer_size,
            &shutdown_tx,
        ));
        let writer = Arc::new(WriterEngine::start(
            session_manager.clone(),
            state.encoder.clone(),
            state.writer_statistic.clone(),
            config.writer_workers,
            &shutdown_tx,
        ));

        let mut tasks = Vec::new();

        let socket_addr = if config.socket_enabled {
            let listener = TcpListener::bind(config.socket_address()).await?;
            let addr = listener.local_addr()?;
            info!("Socket server listening on: {}", addr);
            tasks.push(tokio::spawn(accept_socket_connections(
                listener,
                session_manager.clone(),
                reader.clone(),
                shutdown_tx.subscribe(),
            )));
            Some(addr)
        } else {
            None
        };

        let websocket_addr = if config.websocket_enabled {
            let listener = TcpListener::bind(config.websocket_address()).await?;
            let addr = listener.local_addr()?;
            info!("WebSocket server listening on: {}", addr);
            tasks.push(tokio::spawn(accept_websocket_connections(
                listener,
                session_manager.clone(),
                inbound.clone(),
                shutdown_tx.clone(),
            )));
            Some(addr)
        } else {
            None
        };

        let datagram_socket = if config.datagram_enabled {
            let socket = Arc::new(UdpSocket::bind(config.datagram_address()).await?);
            info!("Datagram server listening on: {}", socket.local_addr()?);
            tasks.push(tokio::spawn(run_datagram_reader(
                inbound.clone(),
                socket.clone(),
                config.max_buffer_size,
                shutdown_tx.subscribe(),
            )));
            Some(socket)
        } else {
            None
        };

        tasks.push(tokio::spawn(run_sweeper(
            session_manager,
            config.sweep_interval(),
            shutdown_tx.subscribe(),
        )));

        Ok(Self {
            state,
            reader,
            writer,
            inbound,
            socket_addr,
            websocket_addr,
            datagram_socket,
            tasks,
        })
    }

    pub fn state(&self) -> &Arc<NetworkState> {
        &self.state
    }

    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.state.session_manager
    }

    /// Outbound entry point for the application
    pub fn writer(&self) -> &Arc<WriterEngine> {
        &self.writer
    }

    pub fn inbound(&self) -> &Arc<InboundHandler> {
        &self.inbound
    }

    pub fn reader_workers(&self) -> usize {
        self.reader.worker_count()
    }

    /// Bound stream socket address, if enabled
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.socket_addr
    }

    pub fn websocket_addr(&self) -> Option<SocketAddr> {
        self.websocket_addr
    }

    pub fn datagram_addr(&self) -> Option<SocketAddr> {
        self.datagram_socket
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
    }

    /// Datagram socket, for binding peers with `SessionManager::bind_datagram`
    pub fn datagram_socket(&self) -> Option<&Arc<UdpSocket>> {
        self.datagram_socket.as_ref()
    }

    /// Signal shutdown, wait for the accept loops and close every session
    pub async fn shutdown(self) {
        let _ = self.state.shutdown_tx.send(());
        for task in self.tasks {
            let _ = task.await;
        }

        let closed = self
            .state
            .session_manager
            .close_all(DisconnectReason::ServerShutdown);
        info!(sessions = closed, "All sessions disconnected");

        let reader = self.state.reader_statistic.snapshot();
        let writer = self.writer.snapshot();
        info!(
            read_bytes = reader.read_bytes,
            read_packets = reader.read_packets,
            read_dropped = reader.read_dropped_packets,
            written_bytes = writer.written_bytes,
            written_packets = writer.written_packets,
            dropped_by_policy = writer.dropped_by_policy,
            dropped_by_full = writer.dropped_by_full,
            encode_fallbacks = writer.encode_fallbacks,
            "Network statistics"
        );
    }
}

/// Periodically close idle, orphaned and expired frozen sessions
async fn run_sweeper(
    session_manager: Arc<SessionManager>,
    period: std::time::Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let idle = session_manager.close_idle_sessions();
                let orphans = session_manager.close_orphan_sessions();
                let expired = session_manager.close_expired_frozen_sessions();
                if idle + orphans + expired > 0 {
                    debug!(idle, orphans, expired, "Session sweep");
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }
}
