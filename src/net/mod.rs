//! Networking module
//!
//! Connection handling for stream sockets, WebSockets and bound datagram peers:
//! - Admission filtering per IP
//! - Binary frame codec
//! - Session tracking and lifecycle
//! - Prioritised outbound queues drained by writer workers
//! - Reader workers dispatching inbound frames to the application

pub mod acceptor;
pub mod codec;
pub mod event;
pub mod filter;
pub mod packet;
pub mod queue;
pub mod reader;
pub mod session;
pub mod stats;
pub mod transport;
pub mod writer;

#[cfg(test)]
pub(crate) mod test_support;

pub use event::{ChannelEventHandler, DisconnectReason, NetworkEvent, NetworkEventHandler};
pub use filter::ConnectionFilter;
pub use packet::{Packet, Priority, TransportType};
pub use queue::{PacketQueue, PacketQueuePolicy};
pub use reader::{InboundHandler, ReaderEngine};
pub use session::{AssociatedState, Session, SessionManager, SessionSettings};
pub use writer::WriterEngine;
