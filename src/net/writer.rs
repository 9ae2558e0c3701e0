//! Outbound side of the network engine
//!
//! Enqueueing a packet puts it into each recipient's queue and hands the
//! session a ticket. Tickets are sharded over writer workers by session id,
//! so one session is always serviced by the same worker. A worker writes the
//! head packet of a ticketed session without blocking: a partial stream write
//! keeps the remainder on the packet and parks the session until its socket
//! is writable again.

use std::io;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use super::codec::BinaryPacketEncoder;
use super::event::DisconnectReason;
use super::packet::{Packet, TransportType};
use super::queue::PacketQueueGuard;
use super::session::{Session, SessionManager};
use super::stats::{NetworkWriterStatistic, WriterSnapshot};
use super::transport::Transport;
use crate::error::{NetworkError, PacketQueueError, Result};

/// One ticket queue per writer worker
#[derive(Clone)]
struct SessionTickets {
    queues: Arc<[mpsc::UnboundedSender<Arc<Session>>]>,
}

impl SessionTickets {
    fn new(workers: usize) -> (Self, Vec<mpsc::UnboundedReceiver<Arc<Session>>>) {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..workers.max(1)).map(|_| mpsc::unbounded_channel()).unzip();
        (
            Self {
                queues: Arc::from(senders),
            },
            receivers,
        )
    }

    fn push(&self, session: Arc<Session>) {
        let index = (session.id % self.queues.len() as u64) as usize;
        if self.queues[index].send(session).is_err() {
            trace!(worker = index, "Writer worker gone, ticket dropped");
        }
    }
}

/// Outcome of one write attempt on the head packet
enum WriteOutcome {
    /// Packet fully handed to the transport
    Complete,
    /// Remainder kept on the packet; wait for the transport
    Pending(BoxFuture<'static, io::Result<()>>),
    /// Packet could not be delivered and was discarded
    Dropped,
    /// Primary transport failed
    Failed,
}

/// Drains session queues onto their transports
struct SessionWriter {
    session_manager: Arc<SessionManager>,
    statistic: Arc<NetworkWriterStatistic>,
    tickets: SessionTickets,
}

impl SessionWriter {
    /// Service one ticket
    fn process(&self, session: Arc<Session>) {
        if session.is_closed() || session.is_awaiting_writable() {
            return;
        }
        session.clear_ticket();

        let mut queue = session.packet_queue().lock();
        if !session.is_activated() {
            // Drain without sending
            if queue.take().is_some() && !queue.is_empty() {
                drop(queue);
                self.reticket(&session);
            }
            return;
        }

        let outcome = match queue.peek_mut() {
            Some(packet) => self.write_head(&session, packet),
            None => return,
        };

        match outcome {
            WriteOutcome::Complete => self.complete_head(&session, queue),
            WriteOutcome::Dropped => {
                queue.take();
                let more = !queue.is_empty();
                drop(queue);
                session.add_dropped_packets(1);
                self.statistic.update_dropped_other(1);
                if more {
                    self.reticket(&session);
                }
            }
            WriteOutcome::Pending(writable) => {
                drop(queue);
                self.park(session, writable);
            }
            WriteOutcome::Failed => {
                drop(queue);
                self.session_manager
                    .connection_lost(&session, DisconnectReason::ConnectionLost);
            }
        }
    }

    fn write_head(&self, session: &Arc<Session>, packet: &mut Packet) -> WriteOutcome {
        match packet.transport() {
            TransportType::Tcp => match session.transport() {
                Transport::Socket(handle) => {
                    let pending = packet.pending().clone();
                    let accepted = match handle.channel().try_write(&pending) {
                        Ok(n) => n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
                        Err(e) => {
                            debug!(session_id = session.id, error = %e, "Socket write failed");
                            return WriteOutcome::Failed;
                        }
                    };
                    if accepted > 0 {
                        self.account_written(session, accepted);
                    }
                    if accepted >= pending.len() {
                        return WriteOutcome::Complete;
                    }

                    trace!(
                        session_id = session.id,
                        written = accepted,
                        remaining = pending.len() - accepted,
                        "Partial write"
                    );
                    packet.set_fragment(pending.slice(accepted..));
                    let channel = handle.channel().clone();
                    WriteOutcome::Pending(Box::pin(async move { channel.writable().await }))
                }
                Transport::WebSocket(_) => {
                    warn!(session_id = session.id, "Stream packet addressed to a WebSocket session");
                    WriteOutcome::Dropped
                }
            },
            TransportType::WebSocket => match session.transport() {
                Transport::WebSocket(handle) => match handle.channel().try_send(packet.data().clone()) {
                    Ok(()) => {
                        self.account_written(session, packet.data().len());
                        WriteOutcome::Complete
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        trace!(session_id = session.id, "WebSocket outbound full");
                        WriteOutcome::Pending(handle.channel().writable())
                    }
                    Err(e) => {
                        debug!(session_id = session.id, error = %e, "WebSocket write failed");
                        WriteOutcome::Failed
                    }
                },
                Transport::Socket(_) => {
                    warn!(session_id = session.id, "WebSocket packet addressed to a stream session");
                    WriteOutcome::Dropped
                }
            },
            TransportType::Udp => {
                let Some(binding) = session.datagram() else {
                    trace!(session_id = session.id, "No datagram binding, packet dropped");
                    return WriteOutcome::Dropped;
                };
                match binding.try_send(packet.data()) {
                    Ok(n) => {
                        self.account_written(session, n);
                        WriteOutcome::Complete
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        WriteOutcome::Pending(Box::pin(async move { binding.socket().writable().await }))
                    }
                    Err(e) => {
                        debug!(session_id = session.id, error = %e, "Datagram send failed");
                        WriteOutcome::Dropped
                    }
                }
            }
            TransportType::Kcp => {
                let Some(kcp) = session.kcp().filter(|_| session.is_kcp_enabled()) else {
                    trace!(session_id = session.id, "No KCP tunnel, packet dropped");
                    return WriteOutcome::Dropped;
                };
                match kcp.send(packet.data()) {
                    Ok(()) => {
                        self.account_written(session, packet.data().len());
                        WriteOutcome::Complete
                    }
                    Err(e) => {
                        debug!(session_id = session.id, error = %e, "KCP send failed");
                        WriteOutcome::Dropped
                    }
                }
            }
        }
    }

    fn complete_head(&self, session: &Arc<Session>, mut queue: PacketQueueGuard<'_>) {
        let Some(packet) = queue.take() else {
            return;
        };
        self.statistic.update_written_packets(1);

        if packet.is_last() {
            queue.clear();
            drop(queue);
            debug!(session_id = session.id, "Last packet written, closing session");
            self.session_manager
                .close(session, DisconnectReason::ClientRequest);
            return;
        }

        let more = !queue.is_empty();
        drop(queue);
        if more {
            self.reticket(session);
        }
    }

    fn account_written(&self, session: &Session, bytes: usize) {
        session.mark_written(bytes);
        self.statistic.update_written_bytes(bytes as u64);
    }

    fn reticket(&self, session: &Arc<Session>) {
        if session.try_ticket() {
            self.tickets.push(session.clone());
        }
    }

    /// Keep the session ticketed until its transport is writable, then hand
    /// it back to its worker
    fn park(&self, session: Arc<Session>, writable: BoxFuture<'static, io::Result<()>>) {
        if !session.begin_writable_wait() {
            return;
        }
        session.try_ticket();

        let tickets = self.tickets.clone();
        tokio::spawn(async move {
            if let Err(e) = writable.await {
                trace!(session_id = session.id, error = %e, "Writable wait failed");
            }
            session.end_writable_wait();
            tickets.push(session);
        });
    }
}

/// Fixed pool of writer workers
pub struct WriterEngine {
    writer: Arc<SessionWriter>,
    encoder: Arc<BinaryPacketEncoder>,
}

impl WriterEngine {
    /// Spawn `workers` writer tasks
    pub fn start(
        session_manager: Arc<SessionManager>,
        encoder: Arc<BinaryPacketEncoder>,
        statistic: Arc<NetworkWriterStatistic>,
        workers: usize,
        shutdown: &broadcast::Sender<()>,
    ) -> Self {
        let (tickets, receivers) = SessionTickets::new(workers);
        let writer = Arc::new(SessionWriter {
            session_manager,
            statistic,
            tickets,
        });

        for (index, receiver) in receivers.into_iter().enumerate() {
            tokio::spawn(run_writer_worker(
                index,
                writer.clone(),
                receiver,
                shutdown.subscribe(),
            ));
        }

        debug!(workers = workers.max(1), "Writer engine started");
        Self { writer, encoder }
    }

    pub fn statistic(&self) -> &Arc<NetworkWriterStatistic> {
        &self.writer.statistic
    }

    /// Writer counters plus the encoder's fallback count
    pub fn snapshot(&self) -> WriterSnapshot {
        self.writer.statistic.snapshot(self.encoder.fallback_count())
    }

    /// Send a packet to every recipient it names.
    ///
    /// Stream packets are framed once and the frame is shared by all copies.
    /// Returns how many recipients accepted the packet; rejected copies are
    /// counted on the session and in the writer statistics.
    pub fn enqueue_packet(&self, mut packet: Packet) -> usize {
        let mut recipients = packet.take_recipients();
        let Some(last) = recipients.pop() else {
            return 0;
        };
        self.frame(&mut packet);

        let mut accepted = 0;
        for session in &recipients {
            if self.enqueue_framed(session, packet.copy_for_recipient()).is_ok() {
                accepted += 1;
            }
        }
        if self.enqueue_framed(&last, packet).is_ok() {
            accepted += 1;
        }
        accepted
    }

    /// Send a packet to one session
    pub fn send(&self, session: &Arc<Session>, mut packet: Packet) -> Result<()> {
        packet.take_recipients();
        self.frame(&mut packet);
        self.enqueue_framed(session, packet)
    }

    fn frame(&self, packet: &mut Packet) {
        if packet.transport() == TransportType::Tcp {
            let framed = self.encoder.encode_packet(packet);
            packet.replace_data(framed);
        }
    }

    fn enqueue_framed(&self, session: &Arc<Session>, packet: Packet) -> Result<()> {
        if !session.is_activated() {
            return Err(NetworkError::SessionInactive(session.id).into());
        }

        let statistic = &self.writer.statistic;
        match session.packet_queue().put(packet) {
            Ok(()) if session.is_closed() => {
                // Lost a race with close, which may have cleared the queue already
                session.packet_queue().clear();
                Err(NetworkError::SessionInactive(session.id).into())
            }
            Ok(()) => {
                self.writer.reticket(session);
                Ok(())
            }
            Err(e) => {
                session.add_dropped_packets(1);
                match &e {
                    PacketQueueError::Full { .. } => statistic.update_dropped_by_full(1),
                    PacketQueueError::PolicyViolation(_) => statistic.update_dropped_by_policy(1),
                }
                trace!(session_id = session.id, error = %e, "Packet dropped");
                Err(e.into())
            }
        }
    }
}

async fn run_writer_worker(
    index: usize,
    writer: Arc<SessionWriter>,
    mut tickets: mpsc::UnboundedReceiver<Arc<Session>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            ticket = tickets.recv() => match ticket {
                Some(session) => writer.process(session),
                None => break,
            },
            _ = shutdown.recv() => break,
        }
    }
    debug!(worker = index, "Writer worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::codec::BinaryPacketDecoder;
    use crate::net::event::NetworkEvent;
    use crate::net::packet::Priority;
    use crate::net::session::AssociatedState;
    use crate::net::queue::AcceptAllPolicy;
    use crate::net::session::SessionSettings;
    use crate::net::test_support::{
        drain, stream_session, test_manager, test_manager_with, websocket_session,
        websocket_session_with_capacity,
    };
    use bytes::BytesMut;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message;

    struct Harness {
        manager: Arc<SessionManager>,
        events: mpsc::UnboundedReceiver<NetworkEvent>,
        engine: WriterEngine,
        tickets: mpsc::UnboundedReceiver<Arc<Session>>,
    }

    /// Writer engine with one ticket queue and no worker task, so tests
    /// drive `process` by hand
    fn harness() -> Harness {
        harness_for(test_manager())
    }

    fn harness_for(
        (manager, events): (Arc<SessionManager>, mpsc::UnboundedReceiver<NetworkEvent>),
    ) -> Harness {
        let (tickets, mut receivers) = SessionTickets::new(1);
        let writer = Arc::new(SessionWriter {
            session_manager: manager.clone(),
            statistic: Arc::new(NetworkWriterStatistic::new()),
            tickets,
        });
        let engine = WriterEngine {
            writer,
            encoder: Arc::new(BinaryPacketEncoder::new()),
        };
        Harness {
            manager,
            events,
            engine,
            tickets: receivers.remove(0),
        }
    }

    fn decode_all(wire: &[u8]) -> Vec<Vec<u8>> {
        let decoder = BinaryPacketDecoder::new();
        let mut buf = BytesMut::from(wire);
        std::iter::from_fn(|| decoder.decode(&mut buf).unwrap())
            .map(|frame| frame.to_vec())
            .collect()
    }

    #[tokio::test]
    async fn test_partial_write_loses_nothing() {
        let mut h = harness();
        let (session, channel) = stream_session(&h.manager);
        let payload = vec![0xabu8; 100];

        h.engine.send(&session, Packet::new(payload.clone())).unwrap();
        h.engine.send(&session, Packet::new(&b"tail"[..])).unwrap();
        channel.script([10, 0]);

        // First attempt writes 10 bytes and parks the session
        let ticket = h.tickets.recv().await.unwrap();
        h.engine.writer.process(ticket);
        assert_eq!(channel.written().len(), 10);
        assert!(session.packet_queue().peek().unwrap().is_fragmented());

        // Writable again: the scripted WouldBlock parks it once more
        let ticket = h.tickets.recv().await.unwrap();
        h.engine.writer.process(ticket);
        assert_eq!(channel.written().len(), 10);

        // Then the remainder and the next packet go out in order
        let ticket = h.tickets.recv().await.unwrap();
        h.engine.writer.process(ticket);
        let ticket = h.tickets.recv().await.unwrap();
        h.engine.writer.process(ticket);

        assert!(session.packet_queue().is_empty());
        assert_eq!(decode_all(&channel.written()), vec![payload, b"tail".to_vec()]);
        assert_eq!(h.engine.statistic().written_packets(), 2);
        assert_eq!(
            h.engine.statistic().written_bytes(),
            channel.written().len() as u64
        );
    }

    #[tokio::test]
    async fn test_priority_order_on_the_wire() {
        let mut h = harness();
        let (session, channel) = stream_session(&h.manager);

        // Fill the queue before the ticket is serviced
        h.engine
            .send(&session, Packet::new(&b"five"[..]).with_priority(Priority(5)))
            .unwrap();
        h.engine
            .send(&session, Packet::new(&b"nine"[..]).with_priority(Priority(9)))
            .unwrap();

        while !session.packet_queue().is_empty() {
            let ticket = h.tickets.recv().await.unwrap();
            h.engine.writer.process(ticket);
        }

        assert_eq!(
            decode_all(&channel.written()),
            vec![b"nine".to_vec(), b"five".to_vec()]
        );
    }

    #[test]
    fn test_backpressure_accounting() {
        let (manager, _events) = test_manager();
        let manager = Arc::new(
            SessionManager::new(manager.connection_filter().clone(), manager.events().clone())
                .with_packet_queue(2, Arc::new(crate::net::queue::DefaultPacketQueuePolicy)),
        );
        let (tickets, _receivers) = SessionTickets::new(1);
        let engine = WriterEngine {
            writer: Arc::new(SessionWriter {
                session_manager: manager.clone(),
                statistic: Arc::new(NetworkWriterStatistic::new()),
                tickets,
            }),
            encoder: Arc::new(BinaryPacketEncoder::new()),
        };
        let (session, _) = stream_session(&manager);

        let accepted = (0..3)
            .filter(|_| engine.send(&session, Packet::new(&b"p"[..])).is_ok())
            .count();

        assert_eq!(accepted, 2);
        assert_eq!(session.packet_queue().len(), 2);
        assert_eq!(session.dropped_packets(), 1);
        assert_eq!(engine.statistic().dropped_by_full(), 1);
        assert_eq!(engine.statistic().dropped_by_policy(), 0);
    }

    #[test]
    fn test_multicast_frames_once() {
        let mut h = harness();
        let (a, _) = stream_session(&h.manager);
        let (b, _) = stream_session(&h.manager);

        let packet = Packet::new(&b"hello"[..]).with_recipients([a.clone(), b.clone()]);
        assert_eq!(h.engine.enqueue_packet(packet), 2);

        let head_a = a.packet_queue().peek().unwrap();
        let head_b = b.packet_queue().peek().unwrap();
        assert_ne!(head_a.id(), head_b.id());
        assert_eq!(head_a.data(), head_b.data());
        assert_eq!(decode_all(head_a.data()), vec![b"hello".to_vec()]);

        // One ticket per session
        assert!(h.tickets.try_recv().is_ok());
        assert!(h.tickets.try_recv().is_ok());
        assert!(h.tickets.try_recv().is_err());
    }

    #[test]
    fn test_last_packet_closes_session() {
        let mut h = harness();
        let (session, channel) = stream_session(&h.manager);
        h.engine
            .send(&session, Packet::new(&b"bye"[..]).mark_as_last().with_priority(Priority::URGENT))
            .unwrap();
        h.engine.send(&session, Packet::new(&b"never"[..])).unwrap();

        let ticket = h.tickets.try_recv().unwrap();
        h.engine.writer.process(ticket);

        assert_eq!(decode_all(&channel.written()), vec![b"bye".to_vec()]);
        assert!(session.is_closed());
        assert!(session.packet_queue().is_empty());
        assert!(matches!(
            drain(&mut h.events).as_slice(),
            [NetworkEvent::SessionClosed {
                reason: DisconnectReason::ClientRequest,
                ..
            }]
        ));
    }

    #[test]
    fn test_write_failure_closes_session() {
        let mut h = harness();
        let (session, channel) = stream_session(&h.manager);
        session.set_associated_state(AssociatedState::Done);
        h.engine.send(&session, Packet::new(&b"x"[..])).unwrap();
        channel.fail_writes();

        let ticket = h.tickets.try_recv().unwrap();
        h.engine.writer.process(ticket);

        assert!(session.is_closed());
        assert!(matches!(
            drain(&mut h.events).as_slice(),
            [NetworkEvent::SessionClosed {
                reason: DisconnectReason::ConnectionLost,
                ..
            }]
        ));
    }

    #[test]
    fn test_closed_session_ticket_is_noop() {
        let mut h = harness();
        let (session, channel) = stream_session(&h.manager);
        h.engine.send(&session, Packet::new(&b"x"[..])).unwrap();
        h.manager.close(&session, DisconnectReason::Kicked);

        let ticket = h.tickets.try_recv().unwrap();
        h.engine.writer.process(ticket);
        assert!(channel.written().is_empty());

        assert!(h.engine.send(&session, Packet::new(&b"y"[..])).is_err());
    }

    #[test]
    fn test_websocket_packets_sent_raw() {
        let mut h = harness();
        let (session, mut outbound) = websocket_session(&h.manager);
        h.engine
            .send(
                &session,
                Packet::new(&b"raw"[..]).with_transport(TransportType::WebSocket),
            )
            .unwrap();

        let ticket = h.tickets.try_recv().unwrap();
        h.engine.writer.process(ticket);

        match outbound.try_recv() {
            Some(Message::Binary(data)) => assert_eq!(data, b"raw".to_vec()),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_udp_packet_without_binding_is_dropped() {
        let mut h = harness();
        let (session, channel) = stream_session(&h.manager);
        h.engine
            .send(&session, Packet::new(&b"u"[..]).with_transport(TransportType::Udp))
            .unwrap();

        let ticket = h.tickets.try_recv().unwrap();
        h.engine.writer.process(ticket);

        assert!(channel.written().is_empty());
        assert!(session.packet_queue().is_empty());
        assert_eq!(session.dropped_packets(), 1);
        assert_eq!(h.engine.statistic().dropped_other(), 1);
    }

    #[tokio::test]
    async fn test_slow_websocket_peer_is_bounded_by_queue() {
        let mut h = harness_for(test_manager_with(|manager| {
            manager.with_packet_queue(2, Arc::new(AcceptAllPolicy))
        }));
        let (session, mut outbound) = websocket_session_with_capacity(&h.manager, 2);

        let mut accepted = 0;
        for _ in 0..100 {
            let packet = Packet::new(vec![0u8; 1024]).with_transport(TransportType::WebSocket);
            if h.engine.send(&session, packet).is_ok() {
                accepted += 1;
            }
            while let Ok(ticket) = h.tickets.try_recv() {
                h.engine.writer.process(ticket);
            }
        }

        // Two messages sit in the sink channel, two are held in the session queue
        assert_eq!(accepted, 4);
        assert_eq!(session.packet_queue().len(), 2);
        assert_eq!(session.dropped_packets(), 96);
        assert_eq!(h.engine.statistic().dropped_by_full(), 96);
        assert_eq!(h.engine.statistic().written_packets(), 2);
        assert!(!session.is_closed());

        // Once the peer catches up the held packets follow
        for _ in 0..2 {
            assert!(outbound.recv().await.is_some());
        }
        for _ in 0..2 {
            let ticket = timeout(Duration::from_secs(5), h.tickets.recv())
                .await
                .unwrap()
                .unwrap();
            h.engine.writer.process(ticket);
        }
        assert!(session.packet_queue().is_empty());
        assert_eq!(h.engine.statistic().written_packets(), 4);
        assert!(outbound.try_recv().is_some());
        assert!(outbound.try_recv().is_some());
    }

    #[test]
    fn test_deactivated_session_drains_without_writing() {
        let mut h = harness_for(test_manager_with(|manager| {
            manager.with_settings(SessionSettings {
                reconnection_window: Duration::from_secs(30),
                ..SessionSettings::default()
            })
        }));
        let (session, channel) = stream_session(&h.manager);
        session.set_associated_state(AssociatedState::Done);
        h.engine.send(&session, Packet::new(&b"a"[..])).unwrap();

        h.manager
            .connection_lost(&session, DisconnectReason::ConnectionLost);
        assert!(session.is_frozen());
        assert!(!session.is_activated());
        assert!(!session.is_closed());

        // Packets that reached the queue after the transport was lost
        for payload in [&b"b"[..], &b"c"[..], &b"d"[..]] {
            session.packet_queue().put(Packet::new(payload)).unwrap();
        }

        let mut serviced = 0;
        while let Ok(ticket) = h.tickets.try_recv() {
            h.engine.writer.process(ticket);
            serviced += 1;
        }

        assert_eq!(serviced, 3);
        assert!(channel.written().is_empty());
        assert!(session.packet_queue().is_empty());
        assert!(h.tickets.try_recv().is_err());
        assert_eq!(h.engine.statistic().written_packets(), 0);
        assert!(!session.is_closed());
    }

    #[test]
    fn test_send_racing_close_leaves_nothing_queued() {
        let mut h = harness();
        let (session, channel) = stream_session(&h.manager);

        // Close has started on another thread but not yet deactivated the session
        assert!(session.mark_closed());
        assert!(session.is_activated());

        assert!(h.engine.send(&session, Packet::new(&b"x"[..])).is_err());
        assert!(session.packet_queue().is_empty());
        assert!(h.tickets.try_recv().is_err());
        assert!(channel.written().is_empty());
    }
}
