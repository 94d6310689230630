//! Packet routing and the credit-based flow-control protocol.
//!
//! Every connection carries two counters: packets received since the last
//! cumulative ack we sent, and packets sent that the other side has not yet
//! acknowledged. Acks are amortized (one per [`ACK_INTERVAL`] received
//! packets); a connection whose unacked count reaches the pause watermark
//! stops having payload scheduled to it until the count falls back to the
//! resume watermark. The high/low split avoids chattering between the two
//! states.

use crate::clientmanager::ClientRegistry;
use crate::common::{ContentId, NodeIdentity, ACK_INTERVAL, UNACK_PACKET_PAUSE, UNACK_PACKET_RESUME};
use crate::connection::{Connection, SendError};
use crate::connectionmanager::PeerRegistry;
use crate::frame::{FrameHeader, FrameKind};
use crate::metrics::RouterMetrics;
use crate::pool::Packet;
use crate::stream::{ConnId, OutFrame};
use slog::{debug, warn, Logger};
use std::collections::HashMap;
use thiserror::Error;

/// Per-connection flow-control counters.
#[derive(Debug, Default)]
pub struct FlowState {
    sent_unacked: u32,
    recv_since_ack: u32,
    paused: bool,
}

impl FlowState {
    /// Records a data packet scheduled on this connection. Returns true when
    /// this packet hit the pause watermark.
    pub fn on_data_sent(&mut self) -> bool {
        self.sent_unacked += 1;
        if !self.paused && self.sent_unacked >= UNACK_PACKET_PAUSE {
            self.paused = true;
            return true;
        }
        false
    }

    /// Records a cumulative ack from the other side. Returns true when the
    /// connection just fell back to the resume watermark.
    pub fn on_ack(&mut self, count: u32) -> bool {
        self.sent_unacked = self.sent_unacked.saturating_sub(count);
        if self.paused && self.sent_unacked <= UNACK_PACKET_RESUME {
            self.paused = false;
            return true;
        }
        false
    }

    /// Records a received data packet. Returns the count to acknowledge when
    /// an ack is due.
    pub fn on_data_received(&mut self) -> Option<u32> {
        self.recv_since_ack += 1;
        if self.recv_since_ack >= ACK_INTERVAL {
            let count = self.recv_since_ack;
            self.recv_since_ack = 0;
            return Some(count);
        }
        None
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn sent_unacked(&self) -> u32 {
        self.sent_unacked
    }
}

/// Where a connection id leads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Peer(ContentId),
    Client(ConnId),
}

/// Flow-control protocol violations. These indicate a peer or client that
/// ignores acks entirely; the process terminates rather than dropping data
/// silently.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error(
        "flow-control violation: {dest} already has {queued} packets held back (capacity {capacity})"
    )]
    PendingOverflow {
        dest: String,
        queued: usize,
        capacity: usize,
    },
    #[error("flow-control violation: send queue overflow towards {dest}")]
    SendQueueOverflow { dest: String },
}

pub struct Router {
    log: Logger,
    metrics: RouterMetrics,
    my_id: NodeIdentity,
    pending_capacity: usize,
    conns: HashMap<ConnId, Endpoint>,
}

impl Router {
    pub fn new(
        log: Logger,
        metrics: RouterMetrics,
        my_id: NodeIdentity,
        pending_capacity: usize,
    ) -> Self {
        Self {
            log,
            metrics,
            my_id,
            pending_capacity,
            conns: HashMap::new(),
        }
    }

    pub fn register(&mut self, conn: ConnId, endpoint: Endpoint) {
        self.conns.insert(conn, endpoint);
    }

    pub fn unregister(&mut self, conn: ConnId) -> Option<Endpoint> {
        self.conns.remove(&conn)
    }

    pub fn endpoint_of(&self, conn: ConnId) -> Option<Endpoint> {
        self.conns.get(&conn).copied()
    }

    /// Handles one frame received on `src_conn`. All registry mutations stay
    /// inside this call; the only asynchronous effect is frames appearing on
    /// send queues.
    pub fn handle_frame(
        &mut self,
        src_conn: ConnId,
        header: FrameHeader,
        payload: Option<Packet>,
        peers: &mut PeerRegistry,
        clients: &mut ClientRegistry,
    ) -> Result<(), FatalError> {
        match header.kind {
            FrameKind::Data => self.route_data(src_conn, header, payload, peers, clients),
            FrameKind::Ack => self.handle_ack(src_conn, header, peers, clients),
            FrameKind::Hello => {
                // A client may register additional session routes on an
                // established connection.
                match self.conns.get(&src_conn) {
                    Some(Endpoint::Client(id)) => {
                        let id = *id;
                        clients.add_route(id, header.aux);
                    }
                    _ => warn!(
                        self.log,
                        "unexpected hello on established connection {}", src_conn
                    ),
                }
                Ok(())
            }
            FrameKind::HelloAck => {
                warn!(
                    self.log,
                    "unexpected hello ack on established connection {}", src_conn
                );
                Ok(())
            }
        }
    }

    fn route_data(
        &mut self,
        src_conn: ConnId,
        header: FrameHeader,
        payload: Option<Packet>,
        peers: &mut PeerRegistry,
        clients: &mut ClientRegistry,
    ) -> Result<(), FatalError> {
        // A peer may only send packets as the identity it handshook with.
        if let Some(Endpoint::Peer(content)) = self.conns.get(&src_conn) {
            if header.src.content != *content {
                warn!(
                    self.log,
                    "packet from {} on the connection of content {}; dropping",
                    header.src,
                    content
                );
                return Ok(());
            }
        }

        // Amortized cumulative ack back to the sender.
        if let Some(src) = self.connection_mut(src_conn, peers, clients) {
            if let Some(count) = src.flow.on_data_received() {
                let ack = FrameHeader::ack(self.my_id, header.src, count);
                match src.handle.try_send(OutFrame {
                    header: ack,
                    payload: None,
                }) {
                    Ok(()) => self.metrics.acks_emitted.inc(),
                    Err(SendError::Overflow) => {
                        return Err(FatalError::SendQueueOverflow {
                            dest: header.src.to_string(),
                        })
                    }
                    Err(SendError::Closing) => {}
                }
            }
        }

        // Resolve the destination: our own identity means delivery to a
        // local client by session token, anything else is a peer hop.
        let mut gate_source = false;
        {
            let dest = if header.dst == self.my_id {
                clients.route_connection_mut(header.aux)
            } else {
                match peers.connected_mut(header.dst.content) {
                    Some((id, conn)) if id == header.dst => Some(conn),
                    _ => None,
                }
            };
            let Some(conn) = dest else {
                // Stale route after a disconnect; the origin detects the
                // disconnect on its own, so the packet is not retried.
                self.metrics.dropped_unknown_destination.inc();
                debug!(
                    self.log,
                    "dropping packet for unknown destination {} (session {})",
                    header.dst,
                    header.aux
                );
                return Ok(());
            };
            let frame = OutFrame { header, payload };
            if conn.flow.is_paused() {
                if conn.pending.len() >= self.pending_capacity {
                    return Err(FatalError::PendingOverflow {
                        dest: header.dst.to_string(),
                        queued: conn.pending.len(),
                        capacity: self.pending_capacity,
                    });
                }
                conn.pending.push_back(frame);
                self.metrics.pending_packets.inc();
                if !conn.gated_sources.contains(&src_conn) {
                    conn.gated_sources.push(src_conn);
                }
                gate_source = true;
            } else {
                self.deliver(conn, frame)?;
            }
        }
        if gate_source {
            // Stop pulling payload from the upstream source until the
            // destination resumes.
            if let Some(src) = self.connection_mut(src_conn, peers, clients) {
                src.handle.set_read_gate(true);
            }
        }
        Ok(())
    }

    fn handle_ack(
        &mut self,
        src_conn: ConnId,
        header: FrameHeader,
        peers: &mut PeerRegistry,
        clients: &mut ClientRegistry,
    ) -> Result<(), FatalError> {
        self.metrics.acks_received.inc();
        let mut ungate = Vec::new();
        if let Some(conn) = self.connection_mut(src_conn, peers, clients) {
            if conn.flow.on_ack(header.aux) {
                self.metrics.resumes.inc();
                // Drain held-back frames in arrival order; the drain itself
                // may push the connection back over the pause watermark.
                while !conn.flow.is_paused() {
                    match conn.pending.pop_front() {
                        Some(frame) => {
                            self.metrics.pending_packets.dec();
                            self.deliver(conn, frame)?;
                        }
                        None => break,
                    }
                }
                if !conn.flow.is_paused() && conn.pending.is_empty() {
                    ungate = std::mem::take(&mut conn.gated_sources);
                }
            }
        }
        self.ungate_sources(&ungate, peers, clients);
        Ok(())
    }

    fn deliver(&self, dest: &mut Connection, frame: OutFrame) -> Result<(), FatalError> {
        let kind = dest.handle.kind();
        let dst = frame.header.dst;
        match dest.handle.try_send(frame) {
            Ok(()) => {
                self.metrics
                    .forwarded
                    .with_label_values(&[kind.as_ref()])
                    .inc();
                if dest.flow.on_data_sent() {
                    self.metrics.pauses.inc();
                    debug!(
                        self.log,
                        "pausing {} connection {}: {} packets unacked",
                        kind.as_ref(),
                        dest.handle.conn_id(),
                        dest.flow.sent_unacked()
                    );
                }
                Ok(())
            }
            Err(SendError::Overflow) => Err(FatalError::SendQueueOverflow {
                dest: dst.to_string(),
            }),
            // The writer is already gone; the packet is dropped and its
            // buffer returns to the pool.
            Err(SendError::Closing) => Ok(()),
        }
    }

    /// Reopens the read gates of `sources`; connections that disappeared in
    /// the meantime are skipped.
    pub fn ungate_sources(
        &self,
        sources: &[ConnId],
        peers: &mut PeerRegistry,
        clients: &mut ClientRegistry,
    ) {
        for src in sources {
            if let Some(conn) = self.connection_mut(*src, peers, clients) {
                conn.handle.set_read_gate(false);
            }
        }
    }

    fn connection_mut<'a>(
        &self,
        conn: ConnId,
        peers: &'a mut PeerRegistry,
        clients: &'a mut ClientRegistry,
    ) -> Option<&'a mut Connection> {
        match self.conns.get(&conn)? {
            Endpoint::Peer(content) => match peers.connected_mut(*content) {
                Some((_, connection)) if connection.handle.conn_id() == conn => Some(connection),
                _ => None,
            },
            Endpoint::Client(id) => clients.connection_mut(*id),
        }
    }
}


#[cfg(test)]
mod router_tests {
    use super::*;
    use crate::clientmanager::ClientRegistry;
    use crate::connection::ConnectionHandle;
    use crate::connectionmanager::PeerRegistry;
    use crate::metrics::{ControlPlaneMetrics, DataPlaneMetrics};
    use crate::pool::PacketPool;
    use crate::stream::{read_header, ConnKind, ProxyEvent};
    use slog::Drain;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard.fuse(), slog::o!())
    }

    struct Rig {
        router: Router,
        peers: PeerRegistry,
        clients: ClientRegistry,
        pool: PacketPool,
        data_metrics: DataPlaneMetrics,
        router_metrics: RouterMetrics,
        events_tx: mpsc::Sender<ProxyEvent>,
        _events_rx: mpsc::Receiver<ProxyEvent>,
        next_conn: ConnId,
    }

    impl Rig {
        fn new(my_id: NodeIdentity) -> Self {
            let registry = prometheus::Registry::new();
            let log = test_logger();
            let router_metrics = RouterMetrics::new(&registry);
            let control = ControlPlaneMetrics::new(&registry);
            let (events_tx, _events_rx) = mpsc::channel(1024);
            Self {
                router: Router::new(log.clone(), router_metrics.clone(), my_id, 8),
                peers: PeerRegistry::new(log.clone(), control.clone(), my_id),
                clients: ClientRegistry::new(log, control),
                pool: PacketPool::new(1024),
                data_metrics: DataPlaneMetrics::new(&registry),
                router_metrics,
                events_tx,
                _events_rx,
                next_conn: 1,
            }
        }

        /// Registers a client connection and returns our end of the wire.
        fn add_client(&mut self, token: u32) -> (ConnId, DuplexStream) {
            let conn_id = self.next_conn;
            self.next_conn += 1;
            let (local, remote) = tokio::io::duplex(1 << 20);
            let (reader, writer) = tokio::io::split(local);
            let handle = ConnectionHandle::spawn(
                conn_id,
                ConnKind::Client,
                reader,
                writer,
                self.pool.clone(),
                self.events_tx.clone(),
                1024,
                test_logger(),
                self.data_metrics.clone(),
            );
            self.clients
                .register(Connection::new(handle), token);
            self.router.register(conn_id, Endpoint::Client(conn_id));
            (conn_id, remote)
        }

        fn data_frame(&mut self, src: NodeIdentity, dst: NodeIdentity, token: u32) -> (FrameHeader, Option<Packet>) {
            let mut packet = self.pool.alloc();
            packet.extend_from_slice(b"tuple");
            (FrameHeader::data(src, dst, token, 5), Some(packet))
        }
    }

    #[tokio::test]
    async fn ack_emitted_back_to_sender_every_interval() {
        let me = NodeIdentity::new(0, 2);
        let sender = NodeIdentity::new(2, 6);
        let mut rig = Rig::new(me);
        let (src_conn, mut src_wire) = rig.add_client(1);
        let (_dst_conn, mut dst_wire) = rig.add_client(7);

        for _ in 0..ACK_INTERVAL {
            let (header, payload) = rig.data_frame(sender, me, 7);
            rig.router
                .handle_frame(src_conn, header, payload, &mut rig.peers, &mut rig.clients)
                .unwrap();
        }
        // One cumulative ack went back to the source connection.
        let ack = read_header(&mut src_wire).await.unwrap();
        assert_eq!(ack.kind, FrameKind::Ack);
        assert_eq!(ack.aux, ACK_INTERVAL);
        assert_eq!(rig.router_metrics.acks_emitted.get(), 1);

        // And the payloads were forwarded to the destination client.
        let first = read_header(&mut dst_wire).await.unwrap();
        assert_eq!(first.kind, FrameKind::Data);
        assert_eq!(first.aux, 7);
    }

    #[tokio::test]
    async fn unknown_destination_is_dropped_with_a_diagnostic() {
        let me = NodeIdentity::new(0, 2);
        let mut rig = Rig::new(me);
        let (src_conn, _src_wire) = rig.add_client(1);

        let (header, payload) = rig.data_frame(NodeIdentity::new(2, 6), me, 99);
        rig.router
            .handle_frame(src_conn, header, payload, &mut rig.peers, &mut rig.clients)
            .unwrap();
        assert_eq!(rig.router_metrics.dropped_unknown_destination.get(), 1);
        // The dropped payload went back to the pool.
        assert_eq!(rig.pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn paused_destination_queues_and_gates_the_source() {
        let me = NodeIdentity::new(0, 2);
        let sender = NodeIdentity::new(2, 6);
        let mut rig = Rig::new(me);
        let (src_conn, _src_wire) = rig.add_client(1);
        let (dst_conn, _dst_wire) = rig.add_client(7);

        // Drive the destination to the pause watermark.
        for _ in 0..UNACK_PACKET_PAUSE {
            let (header, payload) = rig.data_frame(sender, me, 7);
            rig.router
                .handle_frame(src_conn, header, payload, &mut rig.peers, &mut rig.clients)
                .unwrap();
        }
        {
            let dest = rig.clients.connection_mut(dst_conn).unwrap();
            assert!(dest.flow.is_paused());
            assert_eq!(dest.flow.sent_unacked(), UNACK_PACKET_PAUSE);
        }

        // The next packet is held back, not sent and not dropped.
        let (header, payload) = rig.data_frame(sender, me, 7);
        rig.router
            .handle_frame(src_conn, header, payload, &mut rig.peers, &mut rig.clients)
            .unwrap();
        {
            let dest = rig.clients.connection_mut(dst_conn).unwrap();
            assert_eq!(dest.pending.len(), 1);
            assert_eq!(dest.gated_sources, vec![src_conn]);
        }

        // An ack that undershoots the resume watermark drains the backlog
        // and reopens the source.
        let ack = FrameHeader::ack(me, sender, UNACK_PACKET_PAUSE - UNACK_PACKET_RESUME);
        rig.router
            .handle_frame(dst_conn, ack, None, &mut rig.peers, &mut rig.clients)
            .unwrap();
        let dest = rig.clients.connection_mut(dst_conn).unwrap();
        assert!(!dest.flow.is_paused());
        assert!(dest.pending.is_empty());
        assert!(dest.gated_sources.is_empty());
        assert_eq!(dest.flow.sent_unacked(), UNACK_PACKET_RESUME + 1);
        assert_eq!(rig.router_metrics.resumes.get(), 1);
    }

    #[tokio::test]
    async fn pending_overflow_is_fatal() {
        let me = NodeIdentity::new(0, 2);
        let sender = NodeIdentity::new(2, 6);
        let mut rig = Rig::new(me);
        let (src_conn, _src_wire) = rig.add_client(1);
        let (_dst_conn, _dst_wire) = rig.add_client(7);

        let mut result = Ok(());
        // Pause the destination, then keep pushing past the pending bound
        // (capacity 8 in this rig).
        for _ in 0..(UNACK_PACKET_PAUSE + 16) {
            let (header, payload) = rig.data_frame(sender, me, 7);
            result = rig.router.handle_frame(
                src_conn,
                header,
                payload,
                &mut rig.peers,
                &mut rig.clients,
            );
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(FatalError::PendingOverflow { .. })));
    }
}
