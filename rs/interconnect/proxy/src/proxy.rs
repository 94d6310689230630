//! The proxy context and its main loop.
//!
//! One `Proxy` owns every table: the address book, the peer and client
//! registries, the router, both listeners and the shared failure flag.
//! Everything is mutated from the single event loop in [`Proxy::run`], so
//! the instance needs no locks and several instances can coexist in one
//! process (which is how the integration tests run a whole cluster).
//!
//! The loop integrates the listeners, a periodic reconciliation timer (short
//! initial delay, then a fixed interval), the reload and stop signals, and
//! the parent liveness pipe. A reload is processed start to finish within
//! one loop iteration so no other event can observe a half-applied
//! topology.

use crate::addressbook::{AddressBook, ProxyAddr};
use crate::clientmanager::ClientRegistry;
use crate::common::{ContentId, NodeIdentity, SessionToken, LISTEN_BACKLOG};
use crate::config::Config;
use crate::connection::{Connection, ConnectionHandle};
use crate::connectionmanager::{AcceptDecision, PeerRegistry};
use crate::flag::FailureFlag;
use crate::metrics::{ControlPlaneMetrics, ProxyMetrics, STATUS_ERROR, STATUS_SUCCESS};
use crate::pool::PacketPool;
use crate::router::{Endpoint, Router};
use crate::stream::{
    client_accept_handshake, peer_accept_handshake, ConnId, ConnKind, ProxyEvent, StreamError,
};
use slog::{debug, error, info, warn, Logger};
use std::io;
use std::ops::ControlFlow;
use std::os::unix::io::FromRawFd;
use std::path::PathBuf;
use tokio::net::{TcpListener, TcpSocket, TcpStream, UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

/// Exit code asking the supervisor to restart us.
pub const EXIT_RESTART: i32 = 1;
/// Exit code for an intentional clean stop.
pub const EXIT_CLEAN: i32 = 0;

/// First reconciliation runs shortly after startup, then on a fixed cadence.
const RECONCILE_INITIAL_DELAY: Duration = Duration::from_millis(100);
const RECONCILE_INTERVAL: Duration = Duration::from_secs(1);

/// Control operations, available to embedders and tests. The reload and
/// stop signals feed the same paths.
pub enum ProxyCommand {
    Reload { proxy_addresses: String },
    GracefulStop,
    Snapshot(oneshot::Sender<ProxySnapshot>),
}

#[derive(Debug, Clone)]
pub struct ProxySnapshot {
    pub peers: Vec<(NodeIdentity, &'static str)>,
    pub clients: usize,
    pub peer_listening: bool,
}

#[derive(Clone)]
pub struct ProxyHandle {
    cmd: mpsc::Sender<ProxyCommand>,
}

impl ProxyHandle {
    pub async fn reload(&self, proxy_addresses: impl Into<String>) {
        let _ = self
            .cmd
            .send(ProxyCommand::Reload {
                proxy_addresses: proxy_addresses.into(),
            })
            .await;
    }

    pub async fn graceful_stop(&self) {
        let _ = self.cmd.send(ProxyCommand::GracefulStop).await;
    }

    pub async fn snapshot(&self) -> Option<ProxySnapshot> {
        let (tx, rx) = oneshot::channel();
        self.cmd.send(ProxyCommand::Snapshot(tx)).await.ok()?;
        rx.await.ok()
    }
}

/// The peer listener's re-init machine. `Draining` means the previous
/// listener is being torn down; a requested reopen is recorded there and
/// applied exactly once, so a close and a reopen can never interleave into
/// two bound listeners.
enum PeerListenerState {
    Idle,
    Listening {
        task: JoinHandle<()>,
        addr: (String, u16),
    },
    Draining {
        task: JoinHandle<()>,
        reopen: bool,
    },
}

enum Wake {
    Event(ProxyEvent),
    Command(ProxyCommand),
    Tick,
    ReloadSignal,
    StopSignal(&'static str),
}

pub struct Proxy {
    log: Logger,
    config: Config,
    config_path: Option<PathBuf>,
    metrics: ProxyMetrics,
    my_id: NodeIdentity,
    book: AddressBook,
    pool: PacketPool,
    peers: PeerRegistry,
    clients: ClientRegistry,
    router: Router,
    events_tx: mpsc::Sender<ProxyEvent>,
    events_rx: mpsc::Receiver<ProxyEvent>,
    cmd_rx: mpsc::Receiver<ProxyCommand>,
    next_conn_id: ConnId,
    peer_listener: PeerListenerState,
    client_listener: Option<JoinHandle<()>>,
    failure_flag: FailureFlag,
    shutting_down: bool,
    exit_code: i32,
}

impl Proxy {
    /// Builds a proxy instance. `config_path` is re-read on a reload signal;
    /// embedded instances pass `None` and reload through the handle.
    pub fn new(
        config: Config,
        config_path: Option<PathBuf>,
        log: Logger,
        registry: &prometheus::Registry,
    ) -> io::Result<(Self, ProxyHandle)> {
        let metrics = ProxyMetrics::new(registry);
        let my_id = config.identity();
        let failure_flag = match &config.failure_flag_path {
            Some(path) => FailureFlag::open(path)?,
            None => FailureFlag::local(),
        };
        failure_flag.set(false);

        let mut book = AddressBook::new(my_id);
        if !config.proxy_addresses.is_empty() {
            if let Err(err) = book.reload(&config.proxy_addresses) {
                error!(log, "invalid proxy address list: {}", err);
            }
        }

        let (events_tx, events_rx) = mpsc::channel(1024);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let pool = PacketPool::new(config.max_packet_size);
        let peers = PeerRegistry::new(log.clone(), metrics.control_plane.clone(), my_id);
        let clients = ClientRegistry::new(log.clone(), metrics.control_plane.clone());
        let router = Router::new(
            log.clone(),
            metrics.router.clone(),
            my_id,
            config.pending_queue_capacity,
        );

        let proxy = Self {
            log,
            config,
            config_path,
            metrics,
            my_id,
            book,
            pool,
            peers,
            clients,
            router,
            events_tx,
            events_rx,
            cmd_rx,
            next_conn_id: 0,
            peer_listener: PeerListenerState::Idle,
            client_listener: None,
            failure_flag,
            shutting_down: false,
            exit_code: EXIT_RESTART,
        };
        Ok((proxy, ProxyHandle { cmd: cmd_tx }))
    }

    /// Runs the proxy until it is stopped; returns the process exit code.
    pub async fn run(mut self) -> i32 {
        use tokio::signal::unix::{signal, SignalKind};

        info!(self.log, "proxy starting as {}", self.my_id);
        let mut sighup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigquit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");
        let mut timer = tokio::time::interval_at(
            Instant::now() + RECONCILE_INITIAL_DELAY,
            RECONCILE_INTERVAL,
        );
        if let Some(fd) = self.config.parent_watch_fd {
            spawn_parent_watch(fd, self.events_tx.clone(), self.log.clone());
        }

        loop {
            let wake = tokio::select! {
                Some(event) = self.events_rx.recv() => Wake::Event(event),
                Some(cmd) = self.cmd_rx.recv() => Wake::Command(cmd),
                _ = timer.tick(), if !self.shutting_down => Wake::Tick,
                _ = sighup.recv(), if !self.shutting_down => Wake::ReloadSignal,
                _ = sigint.recv() => Wake::StopSignal("SIGINT"),
                _ = sigterm.recv() => Wake::StopSignal("SIGTERM"),
                _ = sigquit.recv() => Wake::StopSignal("SIGQUIT"),
            };
            let flow = match wake {
                Wake::Event(event) => self.handle_event(event),
                Wake::Command(cmd) => self.handle_command(cmd).await,
                Wake::Tick => {
                    self.on_tick().await;
                    ControlFlow::Continue(())
                }
                Wake::ReloadSignal => {
                    self.on_reload_signal().await;
                    ControlFlow::Continue(())
                }
                Wake::StopSignal(name) => self.begin_graceful_stop(name),
            };
            if let ControlFlow::Break(code) = flow {
                info!(self.log, "proxy terminating with code {}", code);
                return code;
            }
            if self.shutting_down && self.peers.is_empty() && self.clients.is_empty() {
                info!(self.log, "proxy closed with code {}", self.exit_code);
                return self.exit_code;
            }
        }
    }

    fn handle_event(&mut self, event: ProxyEvent) -> ControlFlow<i32> {
        match event {
            ProxyEvent::PeerDialed {
                content,
                expected,
                result,
            } => {
                self.on_peer_dialed(content, expected, result);
                ControlFlow::Continue(())
            }
            ProxyEvent::PeerAccepted { remote, stream } => {
                self.on_peer_accepted(remote, stream);
                ControlFlow::Continue(())
            }
            ProxyEvent::ClientHello { token, stream } => {
                self.on_client_hello(token, stream);
                ControlFlow::Continue(())
            }
            ProxyEvent::Frame {
                conn,
                header,
                payload,
            } => match self
                .router
                .handle_frame(conn, header, payload, &mut self.peers, &mut self.clients)
            {
                Ok(()) => ControlFlow::Continue(()),
                Err(fatal) => {
                    error!(self.log, "{}; terminating", fatal);
                    ControlFlow::Break(EXIT_RESTART)
                }
            },
            ProxyEvent::Disconnected { conn, reason } => {
                self.on_disconnected(conn, reason);
                ControlFlow::Continue(())
            }
            ProxyEvent::WriterDone { conn } => {
                self.on_writer_done(conn);
                ControlFlow::Continue(())
            }
            ProxyEvent::ParentGone => {
                error!(self.log, "parent process is gone; terminating");
                ControlFlow::Break(EXIT_RESTART)
            }
        }
    }

    async fn handle_command(&mut self, cmd: ProxyCommand) -> ControlFlow<i32> {
        match cmd {
            ProxyCommand::Reload { proxy_addresses } => {
                if !self.shutting_down {
                    self.apply_reload(&proxy_addresses).await;
                }
                ControlFlow::Continue(())
            }
            ProxyCommand::GracefulStop => self.begin_graceful_stop("command"),
            ProxyCommand::Snapshot(tx) => {
                let _ = tx.send(self.snapshot());
                ControlFlow::Continue(())
            }
        }
    }

    fn snapshot(&self) -> ProxySnapshot {
        ProxySnapshot {
            peers: self.peers.snapshot(),
            clients: self.clients.len(),
            peer_listening: matches!(self.peer_listener, PeerListenerState::Listening { .. }),
        }
    }

    /// Periodic maintenance: the listeners and the peer mesh.
    async fn on_tick(&mut self) {
        self.maintain_peer_listener().await;
        self.peers.ensure_peers(&self.book, &self.events_tx);
        self.maintain_client_listener();
    }

    async fn on_reload_signal(&mut self) {
        info!(self.log, "reload requested");
        if let Some(path) = self.config_path.clone() {
            let loaded = std::fs::File::open(&path)
                .map_err(|e| e.to_string())
                .and_then(|file| {
                    serde_json::from_reader::<_, Config>(io::BufReader::new(file))
                        .map_err(|e| e.to_string())
                });
            match loaded {
                Ok(new_config) => self.config.proxy_addresses = new_config.proxy_addresses,
                Err(err) => {
                    error!(
                        self.log,
                        "failed to re-read config {}: {}",
                        path.display(),
                        err
                    );
                    return;
                }
            }
        }
        let addresses = self.config.proxy_addresses.clone();
        self.apply_reload(&addresses).await;
    }

    /// Applies a new address list: diff, drop stale peers, re-init the
    /// listener if our own address moved, then reconcile. All of it happens
    /// here, synchronously, before the next event is processed.
    async fn apply_reload(&mut self, raw: &str) {
        if let Err(err) = self.book.reload(raw) {
            error!(self.log, "keeping the previous address list: {}", err);
            return;
        }
        self.config.proxy_addresses = raw.to_string();
        let my_addr_removed = self.book.removed().iter().any(|a| a.id == self.my_id);
        if my_addr_removed || self.book.my_addr().is_none() {
            self.peer_listener_reinit();
        }
        // Removal strictly precedes re-creation: a promoted instance may
        // only be dialed once its predecessor's slot is fully closed.
        let closed = self.peers.drop_legacy_peers(self.book.removed());
        for mut conn in closed {
            self.release_connection(&mut conn);
            conn.handle.begin_close();
        }
        self.maintain_peer_listener().await;
        self.peers.ensure_peers(&self.book, &self.events_tx);
        self.maintain_client_listener();
    }

    fn begin_graceful_stop(&mut self, why: &str) -> ControlFlow<i32> {
        if self.shutting_down {
            return ControlFlow::Continue(());
        }
        info!(self.log, "graceful stop requested ({})", why);
        self.shutting_down = true;
        self.exit_code = EXIT_CLEAN;
        match std::mem::replace(&mut self.peer_listener, PeerListenerState::Idle) {
            PeerListenerState::Listening { task, .. }
            | PeerListenerState::Draining { task, .. } => task.abort(),
            PeerListenerState::Idle => {}
        }
        if let Some(task) = self.client_listener.take() {
            task.abort();
        }
        // No new traffic, but queued writes drain before the sockets close.
        let closed = self.peers.disconnect_all();
        for mut conn in closed {
            self.release_connection(&mut conn);
            conn.handle.begin_close();
        }
        self.clients.begin_close_all();
        ControlFlow::Continue(())
    }

    fn on_peer_dialed(
        &mut self,
        content: ContentId,
        expected: NodeIdentity,
        result: Result<(NodeIdentity, TcpStream), StreamError>,
    ) {
        if !self.peers.is_connecting(content) {
            // The slot was closed or re-purposed while the dial ran.
            return;
        }
        match result {
            Err(err) => {
                self.metrics
                    .control_plane
                    .tcp_connects
                    .with_label_values(&[STATUS_ERROR])
                    .inc();
                warn!(self.log, "connection to {} failed: {}", expected, err);
                self.peers.dial_failed(content);
            }
            Ok((remote, _stream)) if remote != expected => {
                self.metrics
                    .control_plane
                    .handshakes
                    .with_label_values(&["client", STATUS_ERROR])
                    .inc();
                warn!(
                    self.log,
                    "dial for {} reached {} instead; dropping the connection", expected, remote
                );
                self.peers.dial_failed(content);
            }
            Ok((remote, stream)) => {
                self.metrics
                    .control_plane
                    .handshakes
                    .with_label_values(&["client", STATUS_SUCCESS])
                    .inc();
                let conn = self.spawn_peer_connection(stream);
                let conn_id = conn.handle.conn_id();
                self.router.register(conn_id, Endpoint::Peer(content));
                self.peers.install_dialed(content, conn);
                info!(self.log, "connected to {}", remote);
            }
        }
    }

    fn on_peer_accepted(&mut self, remote: NodeIdentity, stream: TcpStream) {
        if self.shutting_down {
            return;
        }
        match self.peers.on_accepted(remote) {
            AcceptDecision::Install => self.install_accepted(remote, stream),
            AcceptDecision::CancelDialAndInstall => {
                debug!(
                    self.log,
                    "{} is the designated initiator; cancelling our own dial", remote
                );
                self.peers.cancel_dial(remote.content);
                self.install_accepted(remote, stream);
            }
            AcceptDecision::CloseExistingAndReject { reason } => {
                warn!(
                    self.log,
                    "inbound connection from {}: {}; closing the old connection first",
                    remote,
                    reason
                );
                self.metrics.control_plane.duplicate_yields.inc();
                self.teardown_peer(remote.content);
                // The inbound socket drops here; the initiator retries once
                // the old slot is fully closed.
            }
            AcceptDecision::Reject { reason } => {
                warn!(
                    self.log,
                    "rejecting inbound connection from {}: {}", remote, reason
                );
            }
        }
    }

    fn install_accepted(&mut self, remote: NodeIdentity, stream: TcpStream) {
        let conn = self.spawn_peer_connection(stream);
        let conn_id = conn.handle.conn_id();
        self.router.register(conn_id, Endpoint::Peer(remote.content));
        self.peers.install_accepted(remote, conn);
        info!(self.log, "accepted connection from {}", remote);
    }

    fn on_client_hello(&mut self, token: SessionToken, stream: UnixStream) {
        if self.shutting_down {
            return;
        }
        let (reader, writer) = stream.into_split();
        let conn = self.spawn_connection(ConnKind::Client, reader, writer);
        let conn_id = conn.handle.conn_id();
        self.router.register(conn_id, Endpoint::Client(conn_id));
        self.clients.register(conn, token);
        debug!(
            self.log,
            "client connection {} routes session {}", conn_id, token
        );
    }

    fn on_disconnected(&mut self, conn: ConnId, reason: Option<StreamError>) {
        match self.router.endpoint_of(conn) {
            Some(Endpoint::Peer(_)) => {
                match &reason {
                    Some(err) => warn!(self.log, "peer connection {} failed: {}", conn, err),
                    None => debug!(self.log, "peer connection {} closed by remote", conn),
                }
                if let Some((content, "connected")) = self.peers.content_by_conn(conn) {
                    self.teardown_peer(content);
                }
            }
            Some(Endpoint::Client(id)) => {
                match &reason {
                    Some(err) => warn!(self.log, "client connection {} failed: {}", conn, err),
                    None => debug!(self.log, "client connection {} closed", conn),
                }
                self.remove_client(id);
            }
            None => {}
        }
    }

    fn on_writer_done(&mut self, conn: ConnId) {
        match self.router.endpoint_of(conn) {
            Some(Endpoint::Peer(_)) => {
                match self.peers.content_by_conn(conn) {
                    Some((content, "connected")) => {
                        // The write side failed while the slot was live;
                        // nothing is left to drain, so close out in one go.
                        self.teardown_peer(content);
                        self.peers.finish_close(conn);
                        self.router.unregister(conn);
                    }
                    Some((content, _)) => {
                        self.peers.finish_close(conn);
                        self.router.unregister(conn);
                        debug!(self.log, "peer for content {} fully closed", content);
                    }
                    None => {
                        self.router.unregister(conn);
                    }
                }
            }
            Some(Endpoint::Client(id)) => {
                self.remove_client(id);
            }
            None => {}
        }
    }

    /// Starts draining a connected peer. The slot stays occupied (state
    /// `Closing`) until the writer reports done, which is what prevents a
    /// replacement from connecting while the old socket is alive.
    fn teardown_peer(&mut self, content: ContentId) {
        if let Some(mut conn) = self.peers.disconnect(content) {
            self.release_connection(&mut conn);
            conn.handle.begin_close();
        }
    }

    fn remove_client(&mut self, conn_id: ConnId) {
        if let Some(mut client) = self.clients.remove(conn_id) {
            self.release_connection(&mut client.conn);
            client.conn.handle.begin_close();
            self.router.unregister(conn_id);
        }
    }

    /// Reopens the read gates of everything that was blocked on this
    /// connection and discards its held-back packets.
    fn release_connection(&mut self, conn: &mut Connection) {
        let gated = std::mem::take(&mut conn.gated_sources);
        self.router
            .ungate_sources(&gated, &mut self.peers, &mut self.clients);
        self.metrics
            .router
            .pending_packets
            .sub(conn.pending.len() as i64);
        conn.pending.clear();
    }

    fn spawn_peer_connection(&mut self, stream: TcpStream) -> Connection {
        let (reader, writer) = stream.into_split();
        self.spawn_connection(ConnKind::Peer, reader, writer)
    }

    fn spawn_connection<R, W>(&mut self, kind: ConnKind, reader: R, writer: W) -> Connection
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        self.next_conn_id += 1;
        Connection::new(ConnectionHandle::spawn(
            self.next_conn_id,
            kind,
            reader,
            writer,
            self.pool.clone(),
            self.events_tx.clone(),
            self.config.pending_queue_capacity,
            self.log.clone(),
            self.metrics.data_plane.clone(),
        ))
    }

    /// Idempotent listener maintenance: advances a draining listener, and
    /// binds a new one when idle and an address is assigned to us.
    async fn maintain_peer_listener(&mut self) {
        if matches!(self.peer_listener, PeerListenerState::Draining { .. }) {
            let finished = matches!(
                &self.peer_listener,
                PeerListenerState::Draining { task, .. } if task.is_finished()
            );
            if !finished {
                return;
            }
            let reopen =
                match std::mem::replace(&mut self.peer_listener, PeerListenerState::Idle) {
                    PeerListenerState::Draining { reopen, .. } => reopen,
                    _ => unreachable!(),
                };
            if !reopen {
                return;
            }
        }
        if matches!(self.peer_listener, PeerListenerState::Listening { .. }) || self.shutting_down
        {
            return;
        }
        let Some(addr) = self.book.my_addr().cloned() else {
            return;
        };
        match bind_peer_listener(&addr).await {
            Ok(listener) => {
                info!(
                    self.log,
                    "peer listener on {}:{}", addr.host, addr.port
                );
                self.failure_flag.set(false);
                let task = spawn_peer_accept_task(
                    listener,
                    self.my_id,
                    self.events_tx.clone(),
                    self.log.clone(),
                    self.metrics.control_plane.clone(),
                );
                self.peer_listener = PeerListenerState::Listening {
                    task,
                    addr: addr.endpoint(),
                };
            }
            Err(err) => {
                warn!(
                    self.log,
                    "failed to listen on {}:{}: {}", addr.host, addr.port, err
                );
                self.metrics.control_plane.peer_listener_failures.inc();
                self.failure_flag.set(true);
            }
        }
    }

    /// Close-then-reopen, never both open at once. A second request while
    /// draining is folded into the pending one.
    fn peer_listener_reinit(&mut self) {
        let reopen = self.book.my_addr().is_some();
        self.peer_listener =
            match std::mem::replace(&mut self.peer_listener, PeerListenerState::Idle) {
                PeerListenerState::Listening { task, .. } => {
                    info!(self.log, "closing the legacy peer listener");
                    self.metrics.control_plane.peer_listener_reinits.inc();
                    task.abort();
                    PeerListenerState::Draining { task, reopen }
                }
                PeerListenerState::Draining {
                    task,
                    reopen: pending,
                } => PeerListenerState::Draining {
                    task,
                    reopen: pending || reopen,
                },
                PeerListenerState::Idle => PeerListenerState::Idle,
            };
    }

    /// The client listener binds once and persists for the daemon's
    /// lifetime; a failed bind is retried on the next tick.
    fn maintain_client_listener(&mut self) {
        if self.client_listener.is_some() || self.shutting_down {
            return;
        }
        let path = self.config.client_sock_path();
        // The path is unique per instance, so an existing file is a leftover
        // from a previous life of this same instance.
        let _ = std::fs::remove_file(&path);
        match UnixListener::bind(&path) {
            Ok(listener) => {
                info!(self.log, "client listener on {}", path.display());
                self.client_listener = Some(spawn_client_accept_task(
                    listener,
                    self.my_id,
                    self.events_tx.clone(),
                    self.log.clone(),
                    self.metrics.control_plane.clone(),
                ));
            }
            Err(err) => {
                warn!(
                    self.log,
                    "failed to listen on {}: {}",
                    path.display(),
                    err
                );
            }
        }
    }
}

async fn bind_peer_listener(addr: &ProxyAddr) -> io::Result<TcpListener> {
    let mut last_err = None;
    for sockaddr in tokio::net::lookup_host(addr.endpoint()).await? {
        let socket = if sockaddr.is_ipv6() {
            TcpSocket::new_v6()?
        } else {
            TcpSocket::new_v4()?
        };
        socket.set_reuseaddr(true)?;
        if let Err(err) = socket.bind(sockaddr) {
            last_err = Some(err);
            continue;
        }
        match socket.listen(LISTEN_BACKLOG) {
            Ok(listener) => return Ok(listener),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "address resolved to nothing")
    }))
}

fn spawn_peer_accept_task(
    listener: TcpListener,
    my_id: NodeIdentity,
    events: mpsc::Sender<ProxyEvent>,
    log: Logger,
    metrics: ControlPlaneMetrics,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    metrics
                        .tcp_accepts
                        .with_label_values(&[STATUS_SUCCESS])
                        .inc();
                    // TCP_NODELAY is required: without it small control and
                    // data packets stall behind Nagle.
                    if let Err(err) = stream.set_nodelay(true) {
                        warn!(log, "set_nodelay failed for {}: {}", peer_addr, err);
                        continue;
                    }
                    debug!(log, "new peer connection from {}", peer_addr);
                    let events = events.clone();
                    let log = log.clone();
                    let metrics = metrics.clone();
                    tokio::spawn(async move {
                        let mut stream = stream;
                        match peer_accept_handshake(&mut stream, my_id).await {
                            Ok(remote) => {
                                metrics
                                    .handshakes
                                    .with_label_values(&["server", STATUS_SUCCESS])
                                    .inc();
                                let _ = events
                                    .send(ProxyEvent::PeerAccepted { remote, stream })
                                    .await;
                            }
                            Err(err) => {
                                metrics
                                    .handshakes
                                    .with_label_values(&["server", STATUS_ERROR])
                                    .inc();
                                warn!(log, "peer handshake with {} failed: {}", peer_addr, err);
                            }
                        }
                    });
                }
                Err(err) => {
                    metrics.tcp_accepts.with_label_values(&[STATUS_ERROR]).inc();
                    warn!(log, "failed to accept a peer connection: {}", err);
                }
            }
        }
    })
}

fn spawn_client_accept_task(
    listener: UnixListener,
    my_id: NodeIdentity,
    events: mpsc::Sender<ProxyEvent>,
    log: Logger,
    metrics: ControlPlaneMetrics,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    debug!(log, "new client connection");
                    let events = events.clone();
                    let log = log.clone();
                    let metrics = metrics.clone();
                    tokio::spawn(async move {
                        let mut stream = stream;
                        match client_accept_handshake(&mut stream, my_id).await {
                            Ok(token) => {
                                metrics
                                    .handshakes
                                    .with_label_values(&["local", STATUS_SUCCESS])
                                    .inc();
                                let _ = events
                                    .send(ProxyEvent::ClientHello { token, stream })
                                    .await;
                            }
                            Err(err) => {
                                metrics
                                    .handshakes
                                    .with_label_values(&["local", STATUS_ERROR])
                                    .inc();
                                warn!(log, "client handshake failed: {}", err);
                            }
                        }
                    });
                }
                Err(err) => {
                    warn!(log, "failed to accept a client connection: {}", err);
                }
            }
        }
    })
}

/// Watches the read end of the parent's liveness pipe. The parent never
/// writes; end of stream (or anything else) means it is gone and the proxy
/// must not outlive it.
fn spawn_parent_watch(fd: i32, events: mpsc::Sender<ProxyEvent>, log: Logger) -> JoinHandle<()> {
    tokio::spawn(async move {
        use tokio::io::AsyncReadExt;
        // SAFETY: the config hands us ownership of this fd; nothing else in
        // this process touches it.
        let std_file = unsafe { std::fs::File::from_raw_fd(fd) };
        let mut file = tokio::fs::File::from_std(std_file);
        let mut buf = [0u8; 16];
        match file.read(&mut buf).await {
            Ok(0) => {}
            Ok(n) => error!(log, "unexpected {} bytes on the parent liveness pipe", n),
            Err(err) => error!(log, "read on the parent liveness pipe failed: {}", err),
        }
        let _ = events.send(ProxyEvent::ParentGone).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test::ConfigBuilder;
    use slog::Drain;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard.fuse(), slog::o!())
    }

    fn test_proxy(content: i16, dbid: i16, addresses: &str) -> (Proxy, ProxyHandle) {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigBuilder::new(content, dbid)
            .with_proxy_addresses(addresses)
            .with_sock_dir(dir.into_path())
            .build();
        let registry = prometheus::Registry::new();
        Proxy::new(config, None, test_logger(), &registry).unwrap()
    }

    #[tokio::test]
    async fn snapshot_of_an_idle_proxy() {
        let (proxy, handle) = test_proxy(0, 2, "");
        let run = tokio::spawn(proxy.run());
        let snapshot = handle.snapshot().await.unwrap();
        assert!(snapshot.peers.is_empty());
        assert_eq!(snapshot.clients, 0);
        assert!(!snapshot.peer_listening);
        handle.graceful_stop().await;
        assert_eq!(run.await.unwrap(), EXIT_CLEAN);
    }

    #[tokio::test]
    async fn bad_reload_keeps_running_with_previous_topology() {
        let (proxy, handle) = test_proxy(1, 3, "");
        let run = tokio::spawn(proxy.run());
        handle.reload("0:2:localhost:nope").await;
        // Still alive and answering.
        let snapshot = handle.snapshot().await.unwrap();
        assert!(snapshot.peers.is_empty());
        handle.graceful_stop().await;
        assert_eq!(run.await.unwrap(), EXIT_CLEAN);
    }

    #[tokio::test]
    async fn listener_init_is_idempotent_and_follows_the_address_book() {
        let port = 57921u16;
        let addresses = format!("0:2:127.0.0.1:{}", port);
        let (mut proxy, _handle) = test_proxy(0, 2, &addresses);

        proxy.maintain_peer_listener().await;
        assert!(matches!(
            proxy.peer_listener,
            PeerListenerState::Listening { .. }
        ));
        // Calling init again must not bind a second listener.
        proxy.maintain_peer_listener().await;
        assert!(matches!(
            proxy.peer_listener,
            PeerListenerState::Listening { .. }
        ));
        assert_eq!(
            proxy.metrics.control_plane.peer_listener_reinits.get(),
            0
        );

        // Our address disappears: the listener drains and stays closed.
        proxy.apply_reload("").await;
        // Draining needs the accept task to unwind first.
        tokio::time::sleep(Duration::from_millis(50)).await;
        proxy.maintain_peer_listener().await;
        assert!(matches!(proxy.peer_listener, PeerListenerState::Idle));
        // The port is free again.
        let rebind = TcpListener::bind(("127.0.0.1", port)).await;
        assert!(rebind.is_ok());
    }

    #[tokio::test]
    async fn listener_failure_sets_the_shared_flag() {
        let port = 57931u16;
        let _holder = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let addresses = format!("0:2:127.0.0.1:{}", port);
        let (mut proxy, _handle) = test_proxy(0, 2, &addresses);

        proxy.maintain_peer_listener().await;
        assert!(matches!(proxy.peer_listener, PeerListenerState::Idle));
        assert!(proxy.failure_flag.get());

        // Once the port frees up, the next tick succeeds and clears it.
        drop(_holder);
        proxy.maintain_peer_listener().await;
        assert!(matches!(
            proxy.peer_listener,
            PeerListenerState::Listening { .. }
        ));
        assert!(!proxy.failure_flag.get());
    }
}
