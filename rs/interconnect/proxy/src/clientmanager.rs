//! Management of the local execution-process connections.
//!
//! Clients arrive over the Unix-domain listener, identify the session route
//! they carry in their hello frame, and from then on send data frames
//! addressed by node identity. A client's disconnect releases only its own
//! session routes; peers and other clients are untouched.

use crate::common::SessionToken;
use crate::connection::Connection;
use crate::metrics::ControlPlaneMetrics;
use crate::stream::ConnId;
use slog::{warn, Logger};
use std::collections::HashMap;

pub struct Client {
    pub conn: Connection,
    /// Session routes registered on this connection.
    pub tokens: Vec<SessionToken>,
}

pub struct ClientRegistry {
    log: Logger,
    metrics: ControlPlaneMetrics,
    clients: HashMap<ConnId, Client>,
    routes: HashMap<SessionToken, ConnId>,
}

impl ClientRegistry {
    pub fn new(log: Logger, metrics: ControlPlaneMetrics) -> Self {
        Self {
            log,
            metrics,
            clients: HashMap::new(),
            routes: HashMap::new(),
        }
    }

    /// Registers a freshly accepted client under its first session route.
    pub fn register(&mut self, conn: Connection, token: SessionToken) -> ConnId {
        let conn_id = conn.handle.conn_id();
        if let Some(old) = self.routes.insert(token, conn_id) {
            // A crashed client can leave its route behind until the write
            // side notices; the fresh registration wins.
            warn!(
                self.log,
                "session {} re-registered by connection {} (was {})", token, conn_id, old
            );
        }
        self.clients.insert(
            conn_id,
            Client {
                conn,
                tokens: vec![token],
            },
        );
        self.metrics
            .clients_connected
            .set(self.clients.len() as i64);
        conn_id
    }

    /// Adds another session route to an established client.
    pub fn add_route(&mut self, conn_id: ConnId, token: SessionToken) {
        let Some(client) = self.clients.get_mut(&conn_id) else {
            warn!(
                self.log,
                "route {} for unknown client connection {}", token, conn_id
            );
            return;
        };
        if !client.tokens.contains(&token) {
            client.tokens.push(token);
        }
        if let Some(old) = self.routes.insert(token, conn_id) {
            if old != conn_id {
                warn!(
                    self.log,
                    "session {} moved from connection {} to {}", token, old, conn_id
                );
            }
        }
    }

    pub fn route_connection_mut(&mut self, token: SessionToken) -> Option<&mut Connection> {
        let conn_id = *self.routes.get(&token)?;
        self.clients.get_mut(&conn_id).map(|c| &mut c.conn)
    }

    pub fn connection_mut(&mut self, conn_id: ConnId) -> Option<&mut Connection> {
        self.clients.get_mut(&conn_id).map(|c| &mut c.conn)
    }

    /// Removes a client and releases all of its session routes. Routes that
    /// were re-registered by a newer connection are left alone.
    pub fn remove(&mut self, conn_id: ConnId) -> Option<Client> {
        let client = self.clients.remove(&conn_id)?;
        for token in &client.tokens {
            if self.routes.get(token) == Some(&conn_id) {
                self.routes.remove(token);
            }
        }
        self.metrics
            .clients_connected
            .set(self.clients.len() as i64);
        Some(client)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Graceful shutdown: stop reading and let every write queue drain.
    pub fn begin_close_all(&mut self) {
        for client in self.clients.values_mut() {
            client.conn.handle.begin_close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionHandle;
    use crate::metrics::DataPlaneMetrics;
    use crate::pool::PacketPool;
    use crate::stream::{ConnKind, ProxyEvent};
    use slog::Drain;
    use tokio::sync::mpsc;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard.fuse(), slog::o!())
    }

    struct Rig {
        registry: ClientRegistry,
        pool: PacketPool,
        data_metrics: DataPlaneMetrics,
        events_tx: mpsc::Sender<ProxyEvent>,
        _events_rx: mpsc::Receiver<ProxyEvent>,
        next_conn: ConnId,
    }

    impl Rig {
        fn new() -> Self {
            let registry = prometheus::Registry::new();
            let (events_tx, _events_rx) = mpsc::channel(64);
            Self {
                registry: ClientRegistry::new(
                    test_logger(),
                    ControlPlaneMetrics::new(&registry),
                ),
                pool: PacketPool::new(256),
                data_metrics: DataPlaneMetrics::new(&registry),
                events_tx,
                _events_rx,
                next_conn: 1,
            }
        }

        fn connect(&mut self, token: SessionToken) -> ConnId {
            let conn_id = self.next_conn;
            self.next_conn += 1;
            let (local, _remote) = tokio::io::duplex(4096);
            let (reader, writer) = tokio::io::split(local);
            let handle = ConnectionHandle::spawn(
                conn_id,
                ConnKind::Client,
                reader,
                writer,
                self.pool.clone(),
                self.events_tx.clone(),
                16,
                test_logger(),
                self.data_metrics.clone(),
            );
            self.registry.register(Connection::new(handle), token)
        }
    }

    #[tokio::test]
    async fn register_lookup_remove() {
        let mut rig = Rig::new();
        let a = rig.connect(7);
        let b = rig.connect(8);
        assert_eq!(rig.registry.len(), 2);

        let conn = rig.registry.route_connection_mut(7).unwrap();
        assert_eq!(conn.handle.conn_id(), a);

        let removed = rig.registry.remove(a).unwrap();
        assert_eq!(removed.tokens, vec![7]);
        assert!(rig.registry.route_connection_mut(7).is_none());
        // The unrelated client keeps its route.
        assert_eq!(
            rig.registry.route_connection_mut(8).unwrap().handle.conn_id(),
            b
        );
    }

    #[tokio::test]
    async fn extra_routes_follow_the_client() {
        let mut rig = Rig::new();
        let a = rig.connect(7);
        rig.registry.add_route(a, 9);
        assert_eq!(
            rig.registry.route_connection_mut(9).unwrap().handle.conn_id(),
            a
        );
        rig.registry.remove(a);
        assert!(rig.registry.route_connection_mut(9).is_none());
    }

    #[tokio::test]
    async fn stale_route_does_not_clobber_its_successor() {
        let mut rig = Rig::new();
        let old = rig.connect(7);
        let new = rig.connect(7);
        // Removing the stale client must not tear down the re-registered
        // route.
        rig.registry.remove(old);
        assert_eq!(
            rig.registry.route_connection_mut(7).unwrap().handle.conn_id(),
            new
        );
    }
}
