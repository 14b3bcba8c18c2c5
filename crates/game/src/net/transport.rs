use std::fmt;
use std::io;

/// Peer identity as assigned by the transport.
///
/// [`ConnectionId::LOCAL`] refers to the endpoint's own session, so a
/// `Connect(LOCAL)` event means the relay session was joined and a
/// `Disconnect(LOCAL)` means it was lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ConnectionId(pub u8);

impl ConnectionId {
    pub const LOCAL: ConnectionId = ConnectionId(0);
    /// The session host, i.e. the server.
    pub const HOST: ConnectionId = ConnectionId(1);

    pub fn is_local(self) -> bool {
        self == Self::LOCAL
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connect(ConnectionId),
    Disconnect(ConnectionId),
    Data(ConnectionId, Vec<u8>),
}

/// Kind of a message handed to [`Transport::send_data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Data = 10,
    Connect = 11,
    Disconnect = 12,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            10 => Some(Self::Data),
            11 => Some(Self::Connect),
            12 => Some(Self::Disconnect),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("datagram encoding failed: {0}")]
    Encode(rkyv::rancor::Error),
    #[error("datagram decoding failed: {0}")]
    Decode(rkyv::rancor::Error),
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("transport is not connected")]
    NotConnected,
}

/// Unreliable, unordered, message oriented channel to one or more peers.
///
/// Implementations never block: `update` collects whatever arrived and
/// queues events which the owner drains with `next_event`.
pub trait Transport {
    fn connect(&mut self) -> Result<(), TransportError>;
    fn disconnect(&mut self);
    fn shutdown(&mut self);
    fn update(&mut self) -> Result<(), TransportError>;
    fn next_event(&mut self) -> Option<TransportEvent>;
    fn send_data(
        &mut self,
        connection: ConnectionId,
        kind: MessageKind,
        data: &[u8],
    ) -> Result<(), TransportError>;
    fn connection_description(&self, connection: ConnectionId) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_kind_roundtrip() {
        for kind in [MessageKind::Data, MessageKind::Connect, MessageKind::Disconnect] {
            assert_eq!(MessageKind::from_u8(kind as u8), Some(kind));
        }
        assert_eq!(MessageKind::from_u8(0), None);
    }

    #[test]
    fn test_local_id() {
        assert!(ConnectionId::LOCAL.is_local());
        assert!(!ConnectionId::HOST.is_local());
        assert_eq!(ConnectionId(7).to_string(), "#7");
    }
}
