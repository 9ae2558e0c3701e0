//! Rustscape Network Server
//!
//! Standalone echo server over the network core: every peer that sends a
//! connection request is associated, and every later frame is sent back on
//! the transport it arrived on.

use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use rustscape_net::config::NetworkConfig;
use rustscape_net::net::event::{ChannelEventHandler, NetworkEvent};
use rustscape_net::net::packet::Packet;
use rustscape_net::net::session::AssociatedState;
use rustscape_net::net::writer::WriterEngine;
use rustscape_net::server::NetworkServer;
use rustscape_net::state::NetworkState;
use rustscape_net::VERSION;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("╔══════════════════════════════════════════════╗");
    info!("║       Rustscape Network Server v{}          ║", VERSION);
    info!("╚══════════════════════════════════════════════╝");

    // Load configuration
    let config = NetworkConfig::load().await?;
    info!(
        "Configuration loaded from: {}",
        config.config_path.display()
    );

    // Create shutdown channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let (events, events_rx) = ChannelEventHandler::new();
    let state = Arc::new(NetworkState::new(
        config,
        Arc::new(events),
        shutdown_tx.clone(),
    )?);
    info!("Network state initialized");

    let server = NetworkServer::start(state).await?;
    let event_handle = tokio::spawn(run_echo(
        events_rx,
        server.writer().clone(),
        shutdown_tx.subscribe(),
    ));

    info!("Server startup complete!");

    // Wait for shutdown signal
    wait_for_shutdown(shutdown_tx).await;

    info!("Shutting down server...");
    server.shutdown().await;
    let _ = event_handle.await;

    info!("Server shutdown complete. Goodbye!");
    Ok(())
}

/// Initialize the logging/tracing system
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rustscape_net=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .init();
}

/// Associate every requesting peer and echo its frames back
async fn run_echo(
    mut events: mpsc::UnboundedReceiver<NetworkEvent>,
    writer: Arc<WriterEngine>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = shutdown_rx.recv() => break,
        };

        match event {
            NetworkEvent::ConnectionRequest { session, frame } => {
                session.set_associated_state(AssociatedState::Done);
                let packet = Packet::new(frame).with_transport(session.transport_type());
                if let Err(e) = writer.send(&session, packet) {
                    warn!(session_id = session.id, error = %e, "Failed to acknowledge connection");
                }
            }
            NetworkEvent::Message {
                session,
                transport,
                frame,
            } => {
                let packet = Packet::new(frame).with_transport(transport);
                if let Err(e) = writer.send(&session, packet) {
                    debug!(session_id = session.id, error = %e, "Echo dropped");
                }
            }
            NetworkEvent::SessionClosed { session, reason } => {
                debug!(session_id = session.id, %reason, "Session closed");
            }
            NetworkEvent::ConnectionRefused { address, error } => {
                debug!(%address, %error, "Connection refused");
            }
            NetworkEvent::DatagramRequest { peer, .. } => {
                debug!(%peer, "Datagram from unbound peer ignored");
            }
            NetworkEvent::SessionCreated(_) | NetworkEvent::SessionFrozen(_) => {}
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());
}
