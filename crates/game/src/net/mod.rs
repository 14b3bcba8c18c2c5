mod bits;
mod connection;
mod loopback;
mod protocol;
mod sequence_buffer;
mod stats;
mod tracking;
mod transport;
mod udp;

pub use bits::{BitReader, BitWriter, sign_extend, zigzag_decode, zigzag_encode};
pub use connection::{Delivery, NetworkConnection, ReceivedPackage};
pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use protocol::{
    ACK_WINDOW, DEFAULT_PORT, DEFAULT_TICK_RATE, FRAGMENT_HEADER_SIZE, FRAGMENT_PAYLOAD_SIZE,
    Fragment, MAX_FRAGMENTS, MAX_PACKAGE_BODY, MAX_PACKAGE_SIZE, NetworkMessage, PACKAGE_HEADER_SIZE, PROTOCOL_MAGIC, PROTOCOL_VERSION,
    PackageHeader, ProtocolError, sequence_diff, sequence_greater_than, tick_diff,
    tick_greater_than,
};
pub use sequence_buffer::SequenceBuffer;
pub use stats::{ConnectionCounters, ConnectionStats, PacketLossSimulation, format_stats_table};
pub use tracking::{Arrival, ReceiveWindow, RttEstimator};
pub use transport::{ConnectionId, MessageKind, Transport, TransportError, TransportEvent};
pub use udp::{Datagram, UdpTransport};
