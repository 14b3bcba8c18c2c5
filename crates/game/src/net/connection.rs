use log::{debug, warn};

use super::protocol::{
    ACK_WINDOW, FRAGMENT_PAYLOAD_SIZE, Fragment, MAX_FRAGMENTS, MAX_PACKAGE_SIZE, NetworkMessage,
    PACKAGE_HEADER_SIZE, PackageHeader, ProtocolError, sequence_diff,
};
use super::sequence_buffer::SequenceBuffer;
use super::stats::{ConnectionCounters, ConnectionStats};
use super::tracking::{Arrival, ReceiveWindow, RttEstimator};
use super::transport::{ConnectionId, MessageKind, Transport};

const OUTSTANDING_CAPACITY: usize = ACK_WINDOW * 2;

#[derive(Debug, Default)]
struct OutstandingPackage<P> {
    sent_ms: u64,
    content: NetworkMessage,
    info: P,
}

/// Resolution of a sent package: acknowledged by the peer or presumed lost.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery<P> {
    pub sequence: u16,
    pub content: NetworkMessage,
    pub info: P,
    pub made_it: bool,
}

/// An accepted package with its reassembled body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPackage {
    pub sequence: u16,
    pub content: NetworkMessage,
    pub body: Vec<u8>,
}

#[derive(Debug)]
struct Reassembly {
    sequence: u16,
    header: PackageHeader,
    parts: Vec<Option<Vec<u8>>>,
    received: usize,
}

/// Sequencing, acknowledgement and fragmentation for one peer.
///
/// `P` is whatever the owner wants back when a package resolves: the server
/// keeps the snapshot it carried, the client the newest command tick.
#[derive(Debug)]
pub struct NetworkConnection<P> {
    id: ConnectionId,
    out_sequence: u16,
    out_sequence_ack: u16,
    pending_send: Option<u16>,
    in_sequence_time_ms: u64,
    window: ReceiveWindow,
    outstanding: SequenceBuffer<OutstandingPackage<P>>,
    deliveries: Vec<Delivery<P>>,
    reassembly: Option<Reassembly>,
    rtt: RttEstimator,
    counters: ConnectionCounters,
    update_rate: u32,
    next_send_ms: u64,
}

impl<P: Default> NetworkConnection<P> {
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            out_sequence: 0,
            out_sequence_ack: 0,
            pending_send: None,
            in_sequence_time_ms: 0,
            window: ReceiveWindow::new(),
            outstanding: SequenceBuffer::new(OUTSTANDING_CAPACITY),
            deliveries: Vec::new(),
            reassembly: None,
            rtt: RttEstimator::new(),
            counters: ConnectionCounters::default(),
            update_rate: 0,
            next_send_ms: 0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn out_sequence(&self) -> u16 {
        self.out_sequence
    }

    pub fn out_sequence_ack(&self) -> u16 {
        self.out_sequence_ack
    }

    pub fn in_sequence(&self) -> u16 {
        self.window.latest().unwrap_or(0)
    }

    pub fn in_sequence_time_ms(&self) -> u64 {
        self.in_sequence_time_ms
    }

    pub fn rtt_ms(&self) -> f32 {
        self.rtt.srtt()
    }

    pub fn counters(&self) -> &ConnectionCounters {
        &self.counters
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    /// Send budget in bytes per second, zero for unlimited.
    pub fn set_update_rate(&mut self, bytes_per_sec: u32) {
        self.update_rate = bytes_per_sec;
    }

    pub fn ready_to_send(&self, now_ms: u64) -> bool {
        self.update_rate == 0 || now_ms >= self.next_send_ms
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            id: self.id,
            rtt_ms: self.rtt_ms(),
            in_sequence: self.in_sequence(),
            in_sequence_time_ms: self.in_sequence_time_ms,
            out_sequence: self.out_sequence,
            out_sequence_ack: self.out_sequence_ack,
            counters: self.counters,
        }
    }

    /// Counts a snapshot that was left out of a package for its size.
    pub fn record_skipped_snapshot(&mut self) {
        self.counters.snapshots_skipped_out += 1;
    }

    /// Allocates the next outgoing sequence.
    ///
    /// A package still unresolved in the slot being reused is reported lost.
    pub fn begin_send_package(&mut self) -> u16 {
        assert!(
            self.pending_send.is_none(),
            "begin_send_package called twice without completing"
        );

        self.out_sequence = self.out_sequence.wrapping_add(1);
        let sequence = self.out_sequence;

        if let Some((old, package)) = self.outstanding.evict(sequence as u32) {
            self.resolve_lost(old as u16, package);
        }

        self.pending_send = Some(sequence);
        sequence
    }

    /// Frames `body` behind a header, fragmenting when needed, and hands the
    /// datagrams to the transport. Returns the number of bytes submitted.
    ///
    /// A body too large for [`MAX_FRAGMENTS`] fragments is not sent; the
    /// package is reported lost right away so `info` comes back through
    /// [`Self::drain_deliveries`].
    pub fn complete_send_package(
        &mut self,
        info: P,
        content: NetworkMessage,
        body: &[u8],
        now_ms: u64,
        transport: &mut dyn Transport,
    ) -> Result<usize, ProtocolError> {
        let sequence = self
            .pending_send
            .take()
            .expect("complete_send_package without begin_send_package");

        let (ack_sequence, ack_mask) = self.window.ack_data();
        let mut header = PackageHeader::new(sequence, ack_sequence, ack_mask, content);

        let mut datagrams = Vec::new();
        if PACKAGE_HEADER_SIZE + body.len() <= MAX_PACKAGE_SIZE {
            let mut data = Vec::with_capacity(PACKAGE_HEADER_SIZE + body.len());
            header.write(&mut data);
            data.extend_from_slice(body);
            datagrams.push(data);
        } else {
            let count = body.len().div_ceil(FRAGMENT_PAYLOAD_SIZE);
            if count > MAX_FRAGMENTS {
                self.counters.packages_oversized_out += 1;
                self.resolve_lost(sequence, OutstandingPackage {
                    sent_ms: now_ms,
                    content,
                    info,
                });
                return Err(ProtocolError::PackageTooLarge { size: body.len() });
            }
            for (index, chunk) in body.chunks(FRAGMENT_PAYLOAD_SIZE).enumerate() {
                header.fragment = Some(Fragment {
                    index: index as u8,
                    count: count as u8,
                });
                let mut data = Vec::with_capacity(header.encoded_len() + chunk.len());
                header.write(&mut data);
                data.extend_from_slice(chunk);
                datagrams.push(data);
            }
            self.counters.fragmented_packages_out += 1;
        }

        let mut sent = 0;
        for data in &datagrams {
            if let Err(e) = transport.send_data(self.id, MessageKind::Data, data) {
                warn!("Connection {}: send failed: {e}", self.id);
            }
            sent += data.len();
        }

        self.counters.packages_out += 1;
        self.counters.bytes_out += sent as u64;

        if self.update_rate > 0 {
            let cost = sent as u64 * 1000 / self.update_rate as u64;
            self.next_send_ms = self.next_send_ms.max(now_ms) + cost;
        }

        *self.outstanding.acquire(sequence as u32) = OutstandingPackage {
            sent_ms: now_ms,
            content,
            info,
        };

        Ok(sent)
    }

    /// Runs an incoming datagram through reassembly and sequencing.
    ///
    /// Returns `None` when the datagram must be dropped: malformed header,
    /// duplicate, older than the ack window, or a fragment of a package that
    /// is not complete yet.
    pub fn process_package(&mut self, data: &[u8], now_ms: u64) -> Option<ReceivedPackage> {
        self.counters.bytes_in += data.len() as u64;

        let (header, header_len) = match PackageHeader::read(data) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.counters.packages_invalid_in += 1;
                debug!("Connection {}: dropping datagram: {e}", self.id);
                return None;
            }
        };

        let payload = &data[header_len..];
        let (header, body) = match header.fragment {
            None => (header, payload.to_vec()),
            Some(fragment) => self.reassemble(header, fragment, payload)?,
        };

        self.counters.packages_in += 1;

        match self.window.record(header.sequence) {
            Arrival::Newer { skipped } => {
                self.counters.packages_lost_in += skipped as u64;
                self.in_sequence_time_ms = now_ms;
            }
            Arrival::OutOfOrder => {
                self.counters.packages_out_of_order_in += 1;
                self.counters.packages_lost_in = self.counters.packages_lost_in.saturating_sub(1);
            }
            Arrival::Duplicate => {
                self.counters.packages_duplicate_in += 1;
                debug!(
                    "Connection {}: duplicate package {}",
                    self.id, header.sequence
                );
                return None;
            }
            Arrival::Stale => {
                self.counters.packages_stale_in += 1;
                debug!("Connection {}: stale package {}", self.id, header.sequence);
                return None;
            }
        }

        self.process_acks(header.ack_sequence, header.ack_mask, now_ms);

        Some(ReceivedPackage {
            sequence: header.sequence,
            content: header.content,
            body,
        })
    }

    fn reassemble(
        &mut self,
        header: PackageHeader,
        fragment: Fragment,
        payload: &[u8],
    ) -> Option<(PackageHeader, Vec<u8>)> {
        let restart = match &self.reassembly {
            None => true,
            Some(current) => {
                let diff = sequence_diff(header.sequence, current.sequence);
                if diff < 0 {
                    debug!(
                        "Connection {}: fragment of superseded package {}",
                        self.id, header.sequence
                    );
                    return None;
                }
                diff > 0 || current.parts.len() != fragment.count as usize
            }
        };

        if restart {
            if let Some(abandoned) = &self.reassembly {
                debug!(
                    "Connection {}: abandoning incomplete package {}",
                    self.id, abandoned.sequence
                );
            }
            self.reassembly = Some(Reassembly {
                sequence: header.sequence,
                header,
                parts: vec![None; fragment.count as usize],
                received: 0,
            });
        }

        let reassembly = self.reassembly.as_mut()?;
        let slot = &mut reassembly.parts[fragment.index as usize];
        if slot.is_none() {
            *slot = Some(payload.to_vec());
            reassembly.received += 1;
        }
        if fragment.index == 0 {
            reassembly.header = header;
        }

        if reassembly.received < reassembly.parts.len() {
            return None;
        }

        let complete = self.reassembly.take()?;
        let body = complete.parts.into_iter().flatten().flatten().collect();
        let mut header = complete.header;
        header.fragment = None;
        self.counters.fragmented_packages_in += 1;
        Some((header, body))
    }

    fn process_acks(&mut self, ack_sequence: u16, ack_mask: u64, now_ms: u64) {
        if ack_mask == 0 {
            return;
        }

        if sequence_diff(ack_sequence, self.out_sequence_ack) > 0 {
            self.out_sequence_ack = ack_sequence;
        }

        for age in 0..ACK_WINDOW {
            if ack_mask & (1u64 << age) == 0 {
                continue;
            }
            let sequence = ack_sequence.wrapping_sub(age as u16);
            if let Some(package) = self.outstanding.remove(sequence as u32) {
                if age == 0 {
                    self.rtt
                        .sample(now_ms.saturating_sub(package.sent_ms) as f32);
                }
                self.deliveries.push(Delivery {
                    sequence,
                    content: package.content,
                    info: package.info,
                    made_it: true,
                });
            }
        }

        let expired: Vec<u32> = self
            .outstanding
            .sequences()
            .filter(|&s| sequence_diff(self.out_sequence_ack, s as u16) >= ACK_WINDOW as i32)
            .collect();
        for sequence in expired {
            if let Some(package) = self.outstanding.remove(sequence) {
                self.resolve_lost(sequence as u16, package);
            }
        }
    }

    fn resolve_lost(&mut self, sequence: u16, package: OutstandingPackage<P>) {
        self.counters.packages_lost_out += 1;
        self.deliveries.push(Delivery {
            sequence,
            content: package.content,
            info: package.info,
            made_it: false,
        });
    }

    /// Delivery notifications accumulated since the last drain, in resolution order.
    pub fn drain_deliveries(&mut self) -> std::vec::Drain<'_, Delivery<P>> {
        self.deliveries.drain(..)
    }

    /// Forgets all outstanding packages without notifying about them.
    pub fn shutdown(&mut self) {
        self.outstanding.clear();
        self.deliveries.clear();
        self.reassembly = None;
        self.pending_send = None;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::net::transport::{TransportError, TransportEvent};

    #[derive(Default)]
    struct CaptureTransport {
        sent: VecDeque<Vec<u8>>,
    }

    impl Transport for CaptureTransport {
        fn connect(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
        fn disconnect(&mut self) {}
        fn shutdown(&mut self) {}
        fn update(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
        fn next_event(&mut self) -> Option<TransportEvent> {
            None
        }
        fn send_data(
            &mut self,
            _connection: ConnectionId,
            _kind: MessageKind,
            data: &[u8],
        ) -> Result<(), TransportError> {
            self.sent.push_back(data.to_vec());
            Ok(())
        }
        fn connection_description(&self, connection: ConnectionId) -> String {
            connection.to_string()
        }
    }

    fn send(
        connection: &mut NetworkConnection<u32>,
        transport: &mut CaptureTransport,
        body: &[u8],
        now_ms: u64,
    ) -> u16 {
        let sequence = connection.begin_send_package();
        connection
            .complete_send_package(
                sequence as u32,
                NetworkMessage::EVENTS,
                body,
                now_ms,
                transport,
            )
            .unwrap();
        sequence
    }

    #[test]
    fn test_acked_package_delivers_once() {
        let mut a = NetworkConnection::<u32>::new(ConnectionId(1));
        let mut b = NetworkConnection::<u32>::new(ConnectionId(2));
        let mut wire_a = CaptureTransport::default();
        let mut wire_b = CaptureTransport::default();

        send(&mut a, &mut wire_a, b"hello", 0);
        let received = b.process_package(&wire_a.sent.pop_front().unwrap(), 10).unwrap();
        assert_eq!(received.body, b"hello");
        assert_eq!(received.content, NetworkMessage::EVENTS);

        send(&mut b, &mut wire_b, b"", 20);
        a.process_package(&wire_b.sent.pop_front().unwrap(), 40).unwrap();

        let deliveries: Vec<_> = a.drain_deliveries().collect();
        assert_eq!(deliveries.len(), 1);
        assert!(deliveries[0].made_it);
        assert_eq!(deliveries[0].sequence, 1);
        assert_eq!(deliveries[0].info, 1);
        assert_eq!(a.out_sequence_ack(), 1);
        assert_eq!(a.drain_deliveries().count(), 0);
    }

    #[test]
    fn test_unacked_package_is_lost_when_window_passes() {
        let mut a = NetworkConnection::<u32>::new(ConnectionId(1));
        let mut b = NetworkConnection::<u32>::new(ConnectionId(2));
        let mut wire_a = CaptureTransport::default();
        let mut wire_b = CaptureTransport::default();

        send(&mut a, &mut wire_a, b"lost", 0);
        wire_a.sent.clear();

        for i in 0..ACK_WINDOW as u64 {
            send(&mut a, &mut wire_a, b"x", i);
            b.process_package(&wire_a.sent.pop_front().unwrap(), i);
        }
        send(&mut b, &mut wire_b, b"", 100);
        a.process_package(&wire_b.sent.pop_front().unwrap(), 100);

        let deliveries: Vec<_> = a.drain_deliveries().collect();
        let lost: Vec<_> = deliveries.iter().filter(|d| !d.made_it).collect();
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].sequence, 1);
        assert_eq!(deliveries.len(), ACK_WINDOW + 1);
        assert_eq!(a.counters().packages_lost_out, 1);
        assert_eq!(a.outstanding_count(), 0);
    }

    #[test]
    fn test_slot_reuse_reports_loss() {
        let mut a = NetworkConnection::<u32>::new(ConnectionId(1));
        let mut wire = CaptureTransport::default();

        for i in 0..OUTSTANDING_CAPACITY as u64 {
            send(&mut a, &mut wire, b"", i);
        }
        assert_eq!(a.drain_deliveries().count(), 0);

        send(&mut a, &mut wire, b"", 500);
        let lost: Vec<_> = a.drain_deliveries().collect();
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].sequence, 1);
        assert!(!lost[0].made_it);
    }

    #[test]
    fn test_duplicates_and_reordering() {
        let mut a = NetworkConnection::<u32>::new(ConnectionId(1));
        let mut b = NetworkConnection::<u32>::new(ConnectionId(2));
        let mut wire = CaptureTransport::default();

        send(&mut a, &mut wire, b"p", 0);
        b.process_package(&wire.sent.pop_front().unwrap(), 0).unwrap();

        for _ in 0..3 {
            send(&mut a, &mut wire, b"p", 0);
        }
        let second = wire.sent.pop_front().unwrap();
        let third = wire.sent.pop_front().unwrap();
        let fourth = wire.sent.pop_front().unwrap();

        assert_eq!(b.process_package(&fourth, 0).unwrap().sequence, 4);
        assert_eq!(b.counters().packages_lost_in, 2);
        assert_eq!(b.process_package(&second, 0).unwrap().sequence, 2);
        assert!(b.process_package(&second, 0).is_none());
        assert_eq!(b.process_package(&third, 0).unwrap().sequence, 3);

        let counters = b.counters();
        assert_eq!(counters.packages_out_of_order_in, 2);
        assert_eq!(counters.packages_duplicate_in, 1);
        assert_eq!(counters.packages_lost_in, 0);
        assert_eq!(b.in_sequence(), 4);
    }

    #[test]
    fn test_large_body_is_fragmented_and_reassembled() {
        let mut a = NetworkConnection::<u32>::new(ConnectionId(1));
        let mut b = NetworkConnection::<u32>::new(ConnectionId(2));
        let mut wire = CaptureTransport::default();

        let body: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        send(&mut a, &mut wire, &body, 0);
        assert_eq!(wire.sent.len(), 3);
        assert!(wire.sent.iter().all(|d| d.len() <= MAX_PACKAGE_SIZE));

        let mut parts: Vec<_> = wire.sent.drain(..).collect();
        parts.reverse();
        assert!(b.process_package(&parts[0], 0).is_none());
        assert!(b.process_package(&parts[1], 0).is_none());
        let received = b.process_package(&parts[2], 0).unwrap();
        assert_eq!(received.body, body);
        assert_eq!(b.counters().fragmented_packages_in, 1);
    }

    #[test]
    fn test_oversized_body_is_rejected() {
        let mut a = NetworkConnection::<u32>::new(ConnectionId(1));
        let mut wire = CaptureTransport::default();

        let body = vec![0u8; FRAGMENT_PAYLOAD_SIZE * MAX_FRAGMENTS + 1];
        let sequence = a.begin_send_package();
        let result =
            a.complete_send_package(7, NetworkMessage::SNAPSHOT, &body, 0, &mut wire);
        assert_eq!(
            result,
            Err(ProtocolError::PackageTooLarge { size: body.len() })
        );
        assert_eq!(sequence, 1);
        assert!(wire.sent.is_empty());

        let lost: Vec<_> = a.drain_deliveries().collect();
        assert_eq!(lost.len(), 1);
        assert!(!lost[0].made_it);
        assert_eq!(lost[0].sequence, 1);
        assert_eq!(lost[0].info, 7);
        assert_eq!(a.counters().packages_oversized_out, 1);
        assert_eq!(a.outstanding_count(), 0);

        send(&mut a, &mut wire, b"next", 10);
        assert_eq!(wire.sent.len(), 1);
    }

    #[test]
    fn test_sequence_wraps() {
        let mut a = NetworkConnection::<u32>::new(ConnectionId(1));
        let mut b = NetworkConnection::<u32>::new(ConnectionId(2));
        let mut wire_a = CaptureTransport::default();
        let mut wire_b = CaptureTransport::default();

        for i in 0..70_000u64 {
            let sequence = send(&mut a, &mut wire_a, b"", i);
            assert!(b.process_package(&wire_a.sent.pop_front().unwrap(), i).is_some());
            if i % 16 == 0 {
                send(&mut b, &mut wire_b, b"", i);
                a.process_package(&wire_b.sent.pop_front().unwrap(), i);
                assert_eq!(a.out_sequence_ack(), sequence);
            }
        }
        assert_eq!(b.counters().packages_lost_in, 0);
        assert_eq!(a.counters().packages_lost_out, 0);
    }

    #[test]
    fn test_rate_limit() {
        let mut a = NetworkConnection::<u32>::new(ConnectionId(1));
        let mut wire = CaptureTransport::default();
        a.set_update_rate(10_000);

        assert!(a.ready_to_send(0));
        send(&mut a, &mut wire, &[0u8; 987], 0);
        assert!(!a.ready_to_send(50));
        assert!(a.ready_to_send(100));
    }

    #[test]
    fn test_shutdown_discards_without_notification() {
        let mut a = NetworkConnection::<u32>::new(ConnectionId(1));
        let mut wire = CaptureTransport::default();
        send(&mut a, &mut wire, b"", 0);
        a.shutdown();
        assert_eq!(a.outstanding_count(), 0);
        assert_eq!(a.drain_deliveries().count(), 0);
    }
}
