//! Management of the proxy-to-proxy connections.
//!
//! A proxy connects to all the other proxies and these connections form the
//! proxy network. Only one connection is needed between two proxies, which
//! is ensured by the policy that a proxy dials exactly the peers with a
//! smaller content-id. To support mirror promotion a proxy dials an address
//! without knowing whether it currently hosts a primary or a mirror; the
//! accept path sorts out stale instances by comparing the hello identity
//! with the peer slot.
//!
//! Each remote content-id owns at most one peer slot. A slot that reaches
//! `Closed` is removed; a replacement (for example after a promotion changed
//! the dbid) can only be created afterwards, so there is never a window with
//! two live connections for one content-id.

use crate::addressbook::{AddressBook, ProxyAddr};
use crate::common::{ContentId, NodeIdentity};
use crate::connection::Connection;
use crate::metrics::ControlPlaneMetrics;
use crate::stream::{peer_dial_handshake, ConnId, ProxyEvent, StreamError};
use slog::{debug, Logger};
use std::collections::HashMap;
use std::fmt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// The connection state machine for a peer slot.
pub enum PeerState {
    /// Identity known, no socket yet.
    Placeholder,
    /// Outbound dial and hello exchange in flight.
    Connecting { dial_task: JoinHandle<()> },
    /// Inbound socket received, hello exchange done, connection being
    /// installed.
    Accepting,
    /// Handshake complete, flow control active.
    Connected { conn: Connection },
    /// Disconnect requested; the write queue is draining.
    Closing { conn_id: ConnId },
    /// Terminal. Reaching it frees the slot.
    Closed,
}

impl PeerState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Placeholder => "placeholder",
            Self::Connecting { .. } => "connecting",
            Self::Accepting => "accepting",
            Self::Connected { .. } => "connected",
            Self::Closing { .. } => "closing",
            Self::Closed => "closed",
        }
    }

    fn idx(&self) -> i64 {
        match self {
            Self::Placeholder => 1,
            Self::Connecting { .. } => 2,
            Self::Accepting => 3,
            Self::Connected { .. } => 4,
            Self::Closing { .. } => 5,
            Self::Closed => 6,
        }
    }

    /// Verifies that the state transition is allowed by the state machine.
    fn is_valid_transition(&self, next: &Self) -> bool {
        matches!(
            (self, next),
            (
                Self::Placeholder,
                Self::Connecting { .. } | Self::Accepting | Self::Closed
            ) | (
                Self::Connecting { .. },
                Self::Connected { .. } | Self::Placeholder | Self::Closed
            ) | (Self::Accepting, Self::Connected { .. } | Self::Closed)
                | (Self::Connected { .. }, Self::Closing { .. })
                | (Self::Closing { .. }, Self::Closed)
        )
    }
}

impl fmt::Debug for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerState::{}", self.label())
    }
}

pub struct Peer {
    pub id: NodeIdentity,
    state: PeerState,
}

/// What the accept path should do with an inbound connection, decided
/// purely from the hello identity and the current slot. Duplicate and
/// promotion conflicts are resolved by content-id comparison, never by
/// arrival order.
#[derive(Debug, PartialEq, Eq)]
pub enum AcceptDecision {
    /// Fresh identity; install the connection.
    Install,
    /// We dialed this peer although it is the designated initiator; cancel
    /// the dial and take the inbound connection instead.
    CancelDialAndInstall,
    /// A live connection for this content-id exists (stale instance or
    /// duplicate). Close it first and drop the inbound socket; the
    /// initiator retries once the old slot is fully closed.
    CloseExistingAndReject { reason: &'static str },
    /// Drop the inbound socket.
    Reject { reason: &'static str },
}

pub struct PeerRegistry {
    log: Logger,
    metrics: ControlPlaneMetrics,
    my_id: NodeIdentity,
    peers: HashMap<ContentId, Peer>,
}

impl PeerRegistry {
    pub fn new(log: Logger, metrics: ControlPlaneMetrics, my_id: NodeIdentity) -> Self {
        Self {
            log,
            metrics,
            my_id,
            peers: HashMap::new(),
        }
    }

    /// The mesh rule: this node dials exactly the peers with a smaller
    /// content-id, and never an instance sharing its own dbid (its own
    /// primary or mirror).
    pub fn should_initiate(&self, id: NodeIdentity) -> bool {
        id.content < self.my_id.content && id.dbid != self.my_id.dbid
    }

    /// Periodic reconciliation: make sure a peer slot exists and is being
    /// dialed for every current address the mesh rule assigns to us.
    pub fn ensure_peers(&mut self, book: &AddressBook, events: &mpsc::Sender<ProxyEvent>) {
        let addrs: Vec<ProxyAddr> = book
            .current()
            .iter()
            .filter(|a| self.should_initiate(a.id))
            .cloned()
            .collect();
        for addr in addrs {
            self.ensure_peer(&addr, events);
        }
    }

    /// Looks up or creates the slot for an address and dials it if idle.
    /// The slot can be mid-dial, connected, or draining; those cases are
    /// left alone and the next tick retries whatever still needs doing.
    pub fn ensure_peer(&mut self, addr: &ProxyAddr, events: &mpsc::Sender<ProxyEvent>) {
        debug_assert!(self.should_initiate(addr.id));
        match self.peers.get_mut(&addr.id.content) {
            None => {
                let mut peer = Peer {
                    id: addr.id,
                    state: PeerState::Placeholder,
                };
                let dial_task =
                    spawn_dial_task(addr.clone(), self.my_id, events.clone(), self.log.clone());
                Self::transition(
                    &self.metrics,
                    &mut peer,
                    PeerState::Connecting { dial_task },
                );
                self.peers.insert(addr.id.content, peer);
            }
            Some(peer) => {
                if let PeerState::Placeholder = peer.state {
                    // The instance behind the address may have changed while
                    // the slot sat idle.
                    peer.id = addr.id;
                    let dial_task =
                        spawn_dial_task(addr.clone(), self.my_id, events.clone(), self.log.clone());
                    Self::transition(
                        &self.metrics,
                        peer,
                        PeerState::Connecting { dial_task },
                    );
                }
            }
        }
    }

    /// An outbound dial finished without a usable connection; the slot goes
    /// back to idle and the reconciliation timer retries.
    pub fn dial_failed(&mut self, content: ContentId) {
        if let Some(peer) = self.peers.get_mut(&content) {
            if let PeerState::Connecting { .. } = peer.state {
                Self::transition(&self.metrics, peer, PeerState::Placeholder);
            }
        }
    }

    /// Is this slot waiting for exactly this dial to finish?
    pub fn is_connecting(&self, content: ContentId) -> bool {
        matches!(
            self.peers.get(&content).map(|p| &p.state),
            Some(PeerState::Connecting { .. })
        )
    }

    /// Installs the connection produced by our own successful dial.
    pub fn install_dialed(&mut self, content: ContentId, conn: Connection) {
        let peer = self
            .peers
            .get_mut(&content)
            .expect("dialed peer must have a slot");
        self.metrics
            .tcp_connects
            .with_label_values(&[crate::metrics::STATUS_SUCCESS])
            .inc();
        Self::transition(&self.metrics, peer, PeerState::Connected { conn });
        self.update_connected_gauge();
    }

    /// Decides what to do with an inbound connection that completed its
    /// hello exchange as `remote`.
    pub fn on_accepted(&self, remote: NodeIdentity) -> AcceptDecision {
        if remote.content <= self.my_id.content || remote.dbid == self.my_id.dbid {
            return AcceptDecision::Reject {
                reason: "remote is not the designated initiator",
            };
        }
        match self.peers.get(&remote.content).map(|p| (&p.state, p.id)) {
            None => AcceptDecision::Install,
            Some((PeerState::Placeholder, _)) => AcceptDecision::Install,
            Some((PeerState::Connecting { .. }, _)) => {
                // Both sides believed themselves the initiator (possible
                // for a moment during a promotion); the content-id
                // comparison above already proved the remote right.
                AcceptDecision::CancelDialAndInstall
            }
            Some((PeerState::Accepting, _)) => AcceptDecision::Reject {
                reason: "another inbound connection is being installed",
            },
            Some((PeerState::Connected { .. }, id)) => {
                if id != remote {
                    AcceptDecision::CloseExistingAndReject {
                        reason: "stale instance still connected",
                    }
                } else {
                    AcceptDecision::CloseExistingAndReject {
                        reason: "duplicate connection for a live peer",
                    }
                }
            }
            Some((PeerState::Closing { .. }, _)) => AcceptDecision::Reject {
                reason: "previous connection still draining",
            },
            Some((PeerState::Closed, _)) => AcceptDecision::Install,
        }
    }

    /// Cancels an in-flight dial (the remote turned out to be the
    /// initiator).
    pub fn cancel_dial(&mut self, content: ContentId) {
        if let Some(peer) = self.peers.get_mut(&content) {
            if let PeerState::Connecting { dial_task } = &peer.state {
                dial_task.abort();
                Self::transition(&self.metrics, peer, PeerState::Placeholder);
            }
        }
    }

    /// Installs an accepted inbound connection for `remote`.
    pub fn install_accepted(&mut self, remote: NodeIdentity, conn: Connection) {
        let peer = self.peers.entry(remote.content).or_insert(Peer {
            id: remote,
            state: PeerState::Placeholder,
        });
        peer.id = remote;
        Self::transition(&self.metrics, peer, PeerState::Accepting);
        Self::transition(&self.metrics, peer, PeerState::Connected { conn });
        self.update_connected_gauge();
    }

    /// Requests a disconnect. Valid from any non-closed state: an idle or
    /// dialing slot closes immediately, a connected one starts draining and
    /// its connection is handed back to the caller for cleanup.
    pub fn disconnect(&mut self, content: ContentId) -> Option<Connection> {
        let peer = self.peers.get_mut(&content)?;
        match &peer.state {
            PeerState::Placeholder | PeerState::Accepting => {
                Self::transition(&self.metrics, peer, PeerState::Closed);
                self.remove_closed(content);
                None
            }
            PeerState::Connecting { dial_task } => {
                dial_task.abort();
                Self::transition(&self.metrics, peer, PeerState::Closed);
                self.remove_closed(content);
                None
            }
            PeerState::Connected { conn } => {
                let conn_id = conn.handle.conn_id();
                let prev = std::mem::replace(&mut peer.state, PeerState::Closing { conn_id });
                self.metrics
                    .peer_state
                    .with_label_values(&[&peer.id.to_string()])
                    .set(peer.state.idx());
                self.update_connected_gauge();
                match prev {
                    PeerState::Connected { conn } => Some(conn),
                    _ => unreachable!(),
                }
            }
            PeerState::Closing { .. } | PeerState::Closed => None,
        }
    }

    /// Disconnects the peers whose addresses were removed or changed by a
    /// reload. Only slots this node dials are considered, mirroring the
    /// dial rule: inbound stale peers are closed by their own side or by
    /// the accept-path resolution.
    pub fn drop_legacy_peers(&mut self, removed: &[ProxyAddr]) -> Vec<Connection> {
        let mut closed = Vec::new();
        for addr in removed {
            if !self.should_initiate(addr.id) {
                continue;
            }
            let stale = match self.peers.get(&addr.id.content) {
                Some(peer) if peer.id == addr.id => true,
                _ => false,
            };
            if stale {
                debug!(self.log, "dropping legacy peer {}", addr.id);
                if let Some(conn) = self.disconnect(addr.id.content) {
                    closed.push(conn);
                }
            }
        }
        closed
    }

    /// The write side of a draining slot finished; the slot reaches
    /// `Closed` and is freed.
    pub fn finish_close(&mut self, conn_id: ConnId) -> Option<ContentId> {
        let content = self.peers.iter().find_map(|(content, peer)| match peer.state {
            PeerState::Closing { conn_id: id } if id == conn_id => Some(*content),
            _ => None,
        })?;
        let peer = self.peers.get_mut(&content).unwrap();
        Self::transition(&self.metrics, peer, PeerState::Closed);
        self.remove_closed(content);
        Some(content)
    }

    /// Finds the slot currently owning this connection id.
    pub fn content_by_conn(&self, conn_id: ConnId) -> Option<(ContentId, &'static str)> {
        self.peers.iter().find_map(|(content, peer)| match &peer.state {
            PeerState::Connected { conn } if conn.handle.conn_id() == conn_id => {
                Some((*content, peer.state.label()))
            }
            PeerState::Closing { conn_id: id } if *id == conn_id => {
                Some((*content, peer.state.label()))
            }
            _ => None,
        })
    }

    pub fn connected_mut(
        &mut self,
        content: ContentId,
    ) -> Option<(NodeIdentity, &mut Connection)> {
        let peer = self.peers.get_mut(&content)?;
        match &mut peer.state {
            PeerState::Connected { conn } => Some((peer.id, conn)),
            _ => None,
        }
    }

    /// Graceful shutdown: close every slot; connected ones start draining.
    pub fn disconnect_all(&mut self) -> Vec<Connection> {
        let contents: Vec<ContentId> = self.peers.keys().copied().collect();
        let mut closed = Vec::new();
        for content in contents {
            if let Some(conn) = self.disconnect(content) {
                closed.push(conn);
            }
        }
        closed
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn connected_count(&self) -> usize {
        self.peers
            .values()
            .filter(|p| matches!(p.state, PeerState::Connected { .. }))
            .count()
    }

    pub fn snapshot(&self) -> Vec<(NodeIdentity, &'static str)> {
        self.peers
            .values()
            .map(|p| (p.id, p.state.label()))
            .collect()
    }

    fn transition(metrics: &ControlPlaneMetrics, peer: &mut Peer, next: PeerState) {
        // An invalid transition is a broken invariant, not a recoverable
        // error; terminate so the supervisor restarts us clean.
        assert!(
            peer.state.is_valid_transition(&next),
            "invalid peer state change for {}: {:?} -> {:?}",
            peer.id,
            peer.state,
            next
        );
        peer.state = next;
        metrics
            .peer_state
            .with_label_values(&[&peer.id.to_string()])
            .set(peer.state.idx());
    }

    fn remove_closed(&mut self, content: ContentId) {
        if let Some(peer) = self.peers.remove(&content) {
            debug_assert!(matches!(peer.state, PeerState::Closed));
            let _ = self
                .metrics
                .peer_state
                .remove_label_values(&[&peer.id.to_string()]);
        }
        self.update_connected_gauge();
    }

    fn update_connected_gauge(&self) {
        self.metrics
            .peers_connected
            .set(self.connected_count() as i64);
    }
}

fn spawn_dial_task(
    addr: ProxyAddr,
    my_id: NodeIdentity,
    events: mpsc::Sender<ProxyEvent>,
    log: Logger,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let expected = addr.id;
        let result = dial(&addr, my_id).await;
        if let Err(err) = &result {
            debug!(log, "failed to connect to {}: {}", addr, err);
        }
        let _ = events
            .send(ProxyEvent::PeerDialed {
                content: expected.content,
                expected,
                result,
            })
            .await;
    })
}

async fn dial(
    addr: &ProxyAddr,
    my_id: NodeIdentity,
) -> Result<(NodeIdentity, TcpStream), StreamError> {
    let stream = TcpStream::connect((addr.host.as_str(), addr.port)).await?;
    // TCP_NODELAY is required: without it small control and data packets
    // stall behind Nagle and latency collapses.
    stream.set_nodelay(true)?;
    let mut stream = stream;
    let remote = peer_dial_handshake(&mut stream, my_id).await?;
    Ok((remote, stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressbook::parse_addresses;
    use crate::connection::ConnectionHandle;
    use crate::metrics::DataPlaneMetrics;
    use crate::pool::PacketPool;
    use crate::stream::ConnKind;
    use slog::Drain;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard.fuse(), slog::o!())
    }

    fn identity(content: i16, dbid: i16) -> NodeIdentity {
        NodeIdentity::new(content, dbid)
    }

    fn registry(my_id: NodeIdentity) -> PeerRegistry {
        let metrics = ControlPlaneMetrics::new(&prometheus::Registry::new());
        PeerRegistry::new(test_logger(), metrics, my_id)
    }

    fn fake_connection(conn_id: ConnId) -> Connection {
        let registry = prometheus::Registry::new();
        let (events_tx, events_rx) = tokio::sync::mpsc::channel(16);
        // The receiver is dropped; the tasks exit as soon as they touch it,
        // which is fine for state-machine tests.
        drop(events_rx);
        let (local, _remote) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(local);
        Connection::new(ConnectionHandle::spawn(
            conn_id,
            ConnKind::Peer,
            reader,
            writer,
            PacketPool::new(256),
            events_tx,
            16,
            test_logger(),
            DataPlaneMetrics::new(&registry),
        ))
    }

    fn connecting_state() -> PeerState {
        PeerState::Connecting {
            dial_task: tokio::spawn(async {}),
        }
    }

    fn connected_state() -> PeerState {
        PeerState::Connected {
            conn: fake_connection(1),
        }
    }

    fn verify_state_transitions(current: PeerState, expected: Vec<(PeerState, bool)>) {
        for (next, valid) in expected {
            assert_eq!(
                current.is_valid_transition(&next),
                valid,
                "{:?} -> {:?}",
                current,
                next
            );
        }
    }

    #[tokio::test]
    async fn state_machine_placeholder() {
        verify_state_transitions(
            PeerState::Placeholder,
            vec![
                (connecting_state(), true),
                (PeerState::Accepting, true),
                (connected_state(), false),
                (PeerState::Closing { conn_id: 1 }, false),
                (PeerState::Closed, true),
            ],
        );
    }

    #[tokio::test]
    async fn state_machine_connecting() {
        verify_state_transitions(
            connecting_state(),
            vec![
                (connecting_state(), false),
                (PeerState::Accepting, false),
                (connected_state(), true),
                (PeerState::Placeholder, true),
                (PeerState::Closing { conn_id: 1 }, false),
                (PeerState::Closed, true),
            ],
        );
    }

    #[tokio::test]
    async fn state_machine_connected_closes_through_closing() {
        verify_state_transitions(
            connected_state(),
            vec![
                (PeerState::Placeholder, false),
                (connecting_state(), false),
                (PeerState::Closing { conn_id: 1 }, true),
                (PeerState::Closed, false),
            ],
        );
        verify_state_transitions(
            PeerState::Closing { conn_id: 1 },
            vec![
                (PeerState::Closed, true),
                (connected_state(), false),
                (PeerState::Placeholder, false),
            ],
        );
        verify_state_transitions(
            PeerState::Closed,
            vec![
                (PeerState::Placeholder, false),
                (connecting_state(), false),
                (connected_state(), false),
            ],
        );
    }

    #[test]
    fn initiator_rule_is_content_id_comparison() {
        let reg = registry(identity(2, 6));
        assert!(reg.should_initiate(identity(0, 2)));
        assert!(reg.should_initiate(identity(1, 4)));
        assert!(!reg.should_initiate(identity(3, 8)));
        // Never dial the instance sharing our dbid.
        assert!(!reg.should_initiate(identity(1, 6)));
    }

    #[tokio::test]
    async fn accept_rejects_non_initiators() {
        let reg = registry(identity(2, 6));
        // Smaller content-ids must be dialed by us, not the other way round.
        assert!(matches!(
            reg.on_accepted(identity(1, 4)),
            AcceptDecision::Reject { .. }
        ));
        assert!(matches!(
            reg.on_accepted(identity(2, 6)),
            AcceptDecision::Reject { .. }
        ));
        // A larger content-id is the designated initiator.
        assert_eq!(reg.on_accepted(identity(3, 8)), AcceptDecision::Install);
    }

    #[tokio::test]
    async fn accept_resolves_duplicates_and_promotions_by_closing_first() {
        let mut reg = registry(identity(0, 2));
        let remote = identity(2, 6);
        reg.install_accepted(remote, fake_connection(1));

        // Same identity again: the old connection drains first.
        assert!(matches!(
            reg.on_accepted(remote),
            AcceptDecision::CloseExistingAndReject { .. }
        ));
        // Promoted instance (new dbid): same resolution, old closes first.
        assert!(matches!(
            reg.on_accepted(identity(2, 9)),
            AcceptDecision::CloseExistingAndReject { .. }
        ));

        // While the old connection drains, nothing may be installed.
        let conn = reg.disconnect(remote.content).unwrap();
        assert!(matches!(
            reg.on_accepted(identity(2, 9)),
            AcceptDecision::Reject { .. }
        ));
        drop(conn);

        // Only after the writer finishes is the slot free again.
        let closing_conn_id = 1;
        assert_eq!(reg.finish_close(closing_conn_id), Some(remote.content));
        assert_eq!(reg.on_accepted(identity(2, 9)), AcceptDecision::Install);
    }

    #[tokio::test]
    async fn promotion_of_a_dialed_peer_closes_before_reconnecting() {
        let my_id = identity(5, 9);
        let mut reg = registry(my_id);
        let (events_tx, mut events_rx) = tokio::sync::mpsc::channel(64);

        let mut book = AddressBook::new(my_id);
        book.reload("2:6:127.0.0.1:1,5:9:127.0.0.1:2").unwrap();
        reg.ensure_peers(&book, &events_tx);
        assert!(reg.is_connecting(2));

        // Pretend the dial completed.
        let conn = fake_connection(42);
        reg.install_dialed(2, conn);
        assert_eq!(reg.connected_count(), 1);

        // The mirror for content 2 is promoted: dbid 6 -> 11.
        book.reload("2:11:127.0.0.1:3,5:9:127.0.0.1:2").unwrap();
        let closed = reg.drop_legacy_peers(book.removed());
        assert_eq!(closed.len(), 1);
        assert_eq!(reg.connected_count(), 0);

        // Reconciliation must not create a replacement while draining.
        reg.ensure_peers(&book, &events_tx);
        let snapshot = reg.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, identity(2, 6));
        assert_eq!(snapshot[0].1, "closing");

        // Old slot fully closed: now, and only now, the new instance is
        // dialed.
        assert_eq!(reg.finish_close(42), Some(2));
        assert!(reg.is_empty());
        reg.ensure_peers(&book, &events_tx);
        let snapshot = reg.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, identity(2, 11));
        assert_eq!(snapshot[0].1, "connecting");

        // Drain dial results so the channel sender side stays open.
        let _ = events_rx.try_recv();
    }

    #[tokio::test]
    async fn drop_legacy_skips_peers_we_do_not_dial() {
        let my_id = identity(0, 2);
        let mut reg = registry(my_id);
        let remote = identity(2, 6);
        reg.install_accepted(remote, fake_connection(1));

        let removed = parse_addresses("2:6:127.0.0.1:1").unwrap();
        let closed = reg.drop_legacy_peers(&removed);
        // Content 2 is dialed by the remote side; the accept path, not the
        // reload, resolves its staleness.
        assert!(closed.is_empty());
        assert_eq!(reg.connected_count(), 1);
    }
}
