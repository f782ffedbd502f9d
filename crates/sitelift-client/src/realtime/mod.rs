//! Realtime duplex channel: state machine, transports and test doubles.

pub mod connection;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

pub use connection::{ConnectionState, RealtimeConfig, RealtimeConnection};
pub use transport::{InboundStream, OutboundSink, Transport, WebSocketTransport};
