//! Proxy related metrics.

use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_ERROR: &str = "error";

fn int_counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).unwrap();
    registry.register(Box::new(counter.clone())).unwrap();
    counter
}

fn int_counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let counter = IntCounterVec::new(Opts::new(name, help), labels).unwrap();
    registry.register(Box::new(counter.clone())).unwrap();
    counter
}

fn int_gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).unwrap();
    registry.register(Box::new(gauge.clone())).unwrap();
    gauge
}

fn int_gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(Opts::new(name, help), labels).unwrap();
    registry.register(Box::new(gauge.clone())).unwrap();
    gauge
}

#[derive(Clone)]
pub struct ControlPlaneMetrics {
    /// Current state of each peer slot.
    pub peer_state: IntGaugeVec,
    /// Live peers in `Connected` state.
    pub peers_connected: IntGauge,
    /// Registered local clients.
    pub clients_connected: IntGauge,
    pub tcp_accepts: IntCounterVec,
    pub tcp_connects: IntCounterVec,
    pub handshakes: IntCounterVec,
    /// Inbound connections closed by duplicate/promotion resolution.
    pub duplicate_yields: IntCounter,
    pub peer_listener_failures: IntCounter,
    pub peer_listener_reinits: IntCounter,
}

impl ControlPlaneMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            peer_state: int_gauge_vec(
                registry,
                "proxy_peer_state",
                "Current state of the peer connection",
                &["peer"],
            ),
            peers_connected: int_gauge(
                registry,
                "proxy_peers_connected",
                "Number of peer connections in the connected state",
            ),
            clients_connected: int_gauge(
                registry,
                "proxy_clients_connected",
                "Number of registered local clients",
            ),
            tcp_accepts: int_counter_vec(
                registry,
                "proxy_tcp_accepts",
                "Total incoming peer connections",
                &["status"],
            ),
            tcp_connects: int_counter_vec(
                registry,
                "proxy_tcp_connects",
                "Total outgoing peer dials",
                &["status"],
            ),
            handshakes: int_counter_vec(
                registry,
                "proxy_handshakes",
                "Hello handshakes by role and status",
                &["role", "status"],
            ),
            duplicate_yields: int_counter(
                registry,
                "proxy_duplicate_yields",
                "Connections closed to preserve the one-connection-per-pair rule",
            ),
            peer_listener_failures: int_counter(
                registry,
                "proxy_peer_listener_failures",
                "Failed attempts to bind or listen on the peer address",
            ),
            peer_listener_reinits: int_counter(
                registry,
                "proxy_peer_listener_reinits",
                "Times the peer listener was closed for re-initialization",
            ),
        }
    }
}

#[derive(Clone)]
pub struct DataPlaneMetrics {
    pub read_bytes: IntCounterVec,
    pub write_bytes: IntCounterVec,
    pub frames_received: IntCounterVec,
    pub read_errors: IntCounterVec,
}

impl DataPlaneMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            read_bytes: int_counter_vec(
                registry,
                "proxy_read_bytes",
                "Bytes read from connections",
                &["conn_kind"],
            ),
            write_bytes: int_counter_vec(
                registry,
                "proxy_write_bytes",
                "Bytes written to connections",
                &["conn_kind"],
            ),
            frames_received: int_counter_vec(
                registry,
                "proxy_frames_received",
                "Frames received by kind",
                &["kind"],
            ),
            read_errors: int_counter_vec(
                registry,
                "proxy_read_errors",
                "Read side failures by kind",
                &["conn_kind"],
            ),
        }
    }
}

#[derive(Clone)]
pub struct RouterMetrics {
    pub forwarded: IntCounterVec,
    pub dropped_unknown_destination: IntCounter,
    pub acks_emitted: IntCounter,
    pub acks_received: IntCounter,
    pub pauses: IntCounter,
    pub resumes: IntCounter,
    pub pending_packets: IntGauge,
}

impl RouterMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            forwarded: int_counter_vec(
                registry,
                "proxy_forwarded_packets",
                "Data packets forwarded to a destination",
                &["dest_kind"],
            ),
            dropped_unknown_destination: int_counter(
                registry,
                "proxy_dropped_unknown_destination",
                "Data packets dropped because no destination was registered",
            ),
            acks_emitted: int_counter(
                registry,
                "proxy_acks_emitted",
                "Cumulative acknowledgements sent",
            ),
            acks_received: int_counter(
                registry,
                "proxy_acks_received",
                "Cumulative acknowledgements received",
            ),
            pauses: int_counter(
                registry,
                "proxy_flow_pauses",
                "Times a destination hit the pause watermark",
            ),
            resumes: int_counter(
                registry,
                "proxy_flow_resumes",
                "Times a paused destination fell back to the resume watermark",
            ),
            pending_packets: int_gauge(
                registry,
                "proxy_pending_packets",
                "Packets queued for paused destinations",
            ),
        }
    }
}

/// All metric groups of one proxy instance.
#[derive(Clone)]
pub struct ProxyMetrics {
    pub control_plane: ControlPlaneMetrics,
    pub data_plane: DataPlaneMetrics,
    pub router: RouterMetrics,
}

impl ProxyMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            control_plane: ControlPlaneMetrics::new(registry),
            data_plane: DataPlaneMetrics::new(registry),
            router: RouterMetrics::new(registry),
        }
    }
}
