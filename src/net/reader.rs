//! Inbound side of the network engine
//!
//! Stream sockets are spread over a fixed set of reader workers. Each worker
//! owns its connections, waits on their read readiness together and reads
//! whatever is available into one scratch buffer, so a slow peer never holds
//! a worker. WebSocket connections get a reader task each; datagrams are read
//! by one task per bound socket.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, SplitStream};
use futures_util::StreamExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};

use super::codec::BinaryPacketDecoder;
use super::event::DisconnectReason;
use super::packet::TransportType;
use super::session::{AssociatedState, Session, SessionManager};
use super::stats::NetworkReaderStatistic;
use super::transport::WebSocketChannel;
use crate::error::{NetworkError, Result};

/// Turns inbound bytes into application events
pub struct InboundHandler {
    session_manager: Arc<SessionManager>,
    decoder: Arc<BinaryPacketDecoder>,
    statistic: Arc<NetworkReaderStatistic>,
}

impl InboundHandler {
    pub fn new(
        session_manager: Arc<SessionManager>,
        decoder: Arc<BinaryPacketDecoder>,
        statistic: Arc<NetworkReaderStatistic>,
    ) -> Self {
        Self {
            session_manager,
            decoder,
            statistic,
        }
    }

    pub fn statistic(&self) -> &Arc<NetworkReaderStatistic> {
        &self.statistic
    }

    /// Feed bytes read from a stream session.
    ///
    /// Complete frames are dispatched in order; a trailing partial frame stays
    /// buffered on the session. Returns false once the session is closed, in
    /// which case the caller stops reading it.
    pub fn on_stream_bytes(&self, session: &Arc<Session>, data: &[u8]) -> bool {
        if !session.is_activated() {
            return false;
        }
        session.mark_read(data.len());
        self.statistic.update_read_bytes(data.len() as u64);

        let mut frames = Vec::new();
        let failure = {
            let mut buffer = session.read_buffer();
            buffer.extend_from_slice(data);
            loop {
                match self.decoder.decode(&mut buffer) {
                    Ok(Some(frame)) => frames.push(frame),
                    Ok(None) => break None,
                    Err(e) => {
                        buffer.clear();
                        break Some(e);
                    }
                }
            }
        };

        for frame in frames {
            self.dispatch(session, TransportType::Tcp, frame);
        }

        match failure {
            Some(e) => {
                warn!(session_id = session.id, address = %session.address, error = %e, "Malformed frame");
                self.session_manager.close(session, DisconnectReason::ProtocolError);
                false
            }
            None => session.is_activated(),
        }
    }

    /// Deliver one message-oriented frame (WebSocket, datagram)
    pub fn on_message_frame(&self, session: &Arc<Session>, transport: TransportType, frame: Bytes) {
        if !session.is_activated() {
            return;
        }
        session.mark_read(frame.len());
        self.statistic.update_read_bytes(frame.len() as u64);
        self.dispatch(session, transport, frame);
    }

    /// Route a datagram by its peer address
    pub fn on_datagram(&self, socket: &Arc<UdpSocket>, peer: SocketAddr, payload: Bytes) {
        match self.session_manager.get_by_datagram(&peer) {
            Some(session) => self.on_message_frame(&session, TransportType::Udp, payload),
            None => {
                self.statistic.update_read_bytes(payload.len() as u64);
                self.session_manager
                    .events()
                    .on_datagram_request(socket, peer, payload);
            }
        }
    }

    /// The primary transport of `session` failed or was closed by the peer
    pub fn connection_lost(&self, session: &Arc<Session>, reason: DisconnectReason) {
        self.session_manager.connection_lost(session, reason);
    }

    fn dispatch(&self, session: &Arc<Session>, transport: TransportType, frame: Bytes) {
        self.statistic.update_read_packets(1);
        session.increase_read_messages();

        match session.associated_state() {
            AssociatedState::None => {
                trace!(session_id = session.id, len = frame.len(), "Connection request frame");
                self.session_manager
                    .events()
                    .on_connection_request(session, frame);
            }
            AssociatedState::Doing => {
                self.statistic.update_read_dropped_packets(1);
                trace!(session_id = session.id, "Frame dropped while association is in progress");
            }
            AssociatedState::Done => {
                trace!(session_id = session.id, transport = %transport, len = frame.len(), "Message frame");
                self.session_manager
                    .events()
                    .on_message(session, transport, frame);
            }
        }
    }
}

/// A stream socket handed to a reader worker
struct StreamRegistration {
    session: Arc<Session>,
    stream: Arc<TcpStream>,
}

type Readiness = BoxFuture<'static, (StreamRegistration, io::Result<()>)>;

fn wait_readable(registration: StreamRegistration) -> Readiness {
    Box::pin(async move {
        let ready = registration.stream.readable().await;
        (registration, ready)
    })
}

/// Fixed pool of stream reader workers
pub struct ReaderEngine {
    workers: Vec<mpsc::UnboundedSender<StreamRegistration>>,
    next_worker: AtomicUsize,
}

impl ReaderEngine {
    /// Spawn `workers` reader tasks, each with a `buffer_size` scratch buffer
    pub fn start(
        handler: Arc<InboundHandler>,
        workers: usize,
        buffer_size: usize,
        shutdown: &broadcast::Sender<()>,
    ) -> Self {
        let workers = workers.max(1);
        let senders = (0..workers)
            .map(|index| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(run_reader_worker(
                    index,
                    handler.clone(),
                    rx,
                    buffer_size,
                    shutdown.subscribe(),
                ));
                tx
            })
            .collect();

        debug!(workers, buffer_size, "Reader engine started");
        Self {
            workers: senders,
            next_worker: AtomicUsize::new(0),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Hand a stream session to a worker, round robin
    pub fn register(&self, session: Arc<Session>, stream: Arc<TcpStream>) -> Result<()> {
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[index]
            .send(StreamRegistration { session, stream })
            .map_err(|_| NetworkError::ConnectionClosed.into())
    }
}

async fn run_reader_worker(
    index: usize,
    handler: Arc<InboundHandler>,
    mut registrations: mpsc::UnboundedReceiver<StreamRegistration>,
    buffer_size: usize,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut scratch = vec![0u8; buffer_size.max(1)];
    let mut pending: FuturesUnordered<Readiness> = FuturesUnordered::new();

    loop {
        tokio::select! {
            registration = registrations.recv() => match registration {
                Some(registration) => {
                    trace!(worker = index, session_id = registration.session.id, "Stream registered");
                    pending.push(wait_readable(registration));
                }
                None => break,
            },
            Some((registration, ready)) = pending.next() => {
                if let Some(registration) = read_ready(&handler, registration, ready, &mut scratch) {
                    pending.push(wait_readable(registration));
                }
            }
            _ = shutdown.recv() => break,
        }
    }

    debug!(worker = index, connections = pending.len(), "Reader worker stopped");
}

/// Read once from a ready stream. Returns the registration if the stream
/// should be waited on again.
fn read_ready(
    handler: &InboundHandler,
    registration: StreamRegistration,
    ready: io::Result<()>,
    scratch: &mut [u8],
) -> Option<StreamRegistration> {
    let session = &registration.session;
    if !session.is_activated() {
        return None;
    }
    if let Err(e) = ready {
        debug!(session_id = session.id, error = %e, "Readiness failed");
        handler.connection_lost(session, DisconnectReason::ConnectionLost);
        return None;
    }

    match registration.stream.try_read(scratch) {
        Ok(0) => {
            debug!(session_id = session.id, address = %session.address, "Peer closed the connection");
            handler.connection_lost(session, DisconnectReason::ConnectionLost);
            None
        }
        Ok(n) => {
            trace!(session_id = session.id, bytes = n, "Read");
            if handler.on_stream_bytes(session, &scratch[..n]) {
                Some(registration)
            } else {
                None
            }
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Some(registration),
        Err(e) => {
            debug!(session_id = session.id, error = %e, "Read failed");
            handler.connection_lost(session, DisconnectReason::ConnectionLost);
            None
        }
    }
}

/// Read loop of one WebSocket connection. Each binary or text message is one frame.
pub async fn serve_websocket(
    handler: Arc<InboundHandler>,
    session: Arc<Session>,
    mut stream: SplitStream<WebSocketStream<TcpStream>>,
    channel: WebSocketChannel,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let message = tokio::select! {
            message = stream.next() => message,
            _ = shutdown.recv() => break,
        };

        match message {
            Some(Ok(Message::Binary(data))) => {
                handler.on_message_frame(&session, TransportType::WebSocket, Bytes::from(data));
            }
            Some(Ok(Message::Text(text))) => {
                handler.on_message_frame(&session, TransportType::WebSocket, Bytes::from(text.into_bytes()));
            }
            Some(Ok(Message::Ping(data))) => {
                trace!(session_id = session.id, "Received ping");
                match channel.try_send_message(Message::Pong(data)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        trace!(session_id = session.id, "Outbound full, pong skipped");
                    }
                    Err(_) => break,
                }
            }
            Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
            Some(Ok(Message::Close(_))) => {
                debug!(session_id = session.id, "WebSocket closed by peer");
                handler.connection_lost(&session, DisconnectReason::ClientRequest);
                break;
            }
            Some(Err(e)) => {
                debug!(session_id = session.id, error = %e, "WebSocket read failed");
                handler.connection_lost(&session, DisconnectReason::ConnectionLost);
                break;
            }
            None => {
                handler.connection_lost(&session, DisconnectReason::ConnectionLost);
                break;
            }
        }

        if !session.is_activated() {
            break;
        }
    }
}

/// Read loop of a datagram socket
pub async fn run_datagram_reader(
    handler: Arc<InboundHandler>,
    socket: Arc<UdpSocket>,
    buffer_size: usize,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut scratch = vec![0u8; buffer_size.max(1)];
    loop {
        let (len, peer) = tokio::select! {
            received = socket.recv_from(&mut scratch) => match received {
                Ok(received) => received,
                Err(e) => {
                    trace!(error = %e, "Datagram receive failed");
                    continue;
                }
            },
            _ = shutdown.recv() => break,
        };
        handler.on_datagram(&socket, peer, Bytes::copy_from_slice(&scratch[..len]));
    }
    debug!("Datagram reader stopped");
}
