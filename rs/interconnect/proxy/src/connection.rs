//! Management of a single established connection.
//!
//! A [`ConnectionHandle`] owns the channels into a connection's read and
//! write tasks. Dropping the handle aborts the read task; the write task is
//! never aborted on the graceful path. Closing the send queue lets it drain
//! pending frames, shut the socket down and report `WriterDone`.

use crate::pool::PacketPool;
use crate::router::FlowState;
use crate::stream::{
    spawn_read_task, spawn_write_task, ConnId, ConnKind, OutFrame, ProxyEvent,
};
use crate::metrics::DataPlaneMetrics;
use slog::Logger;
use std::collections::VecDeque;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum SendError {
    /// The connection's send queue is full. The flow-control protocol keeps
    /// in-flight data far below the queue bound, so hitting this is a
    /// protocol violation, not an overload.
    #[error("send queue overflow")]
    Overflow,
    /// The write task is gone; the frame was discarded.
    #[error("connection closing")]
    Closing,
}

pub struct ConnectionHandle {
    conn_id: ConnId,
    kind: ConnKind,
    sender: Option<mpsc::Sender<OutFrame>>,
    gate: watch::Sender<bool>,
    read_task: JoinHandle<()>,
}

impl ConnectionHandle {
    /// Splits the connection into read and write tasks and returns the
    /// handle the registries keep.
    pub fn spawn<R, W>(
        conn_id: ConnId,
        kind: ConnKind,
        reader: R,
        writer: W,
        pool: PacketPool,
        events: mpsc::Sender<ProxyEvent>,
        queue_capacity: usize,
        log: Logger,
        metrics: DataPlaneMetrics,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let (gate_tx, gate_rx) = watch::channel(false);
        let read_task = spawn_read_task(
            conn_id,
            kind,
            reader,
            pool,
            events.clone(),
            gate_rx,
            metrics.clone(),
        );
        // The write task owns its JoinHandle-free life: it ends when every
        // sender is dropped and announces itself with WriterDone.
        let _ = spawn_write_task(conn_id, kind, writer, rx, events, log, metrics);
        Self {
            conn_id,
            kind,
            sender: Some(tx),
            gate: gate_tx,
            read_task,
        }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn kind(&self) -> ConnKind {
        self.kind
    }

    /// Schedules a frame for writing. Never blocks: the queue bound is a
    /// protocol invariant, not a backpressure mechanism.
    pub fn try_send(&self, frame: OutFrame) -> Result<(), SendError> {
        match &self.sender {
            Some(tx) => tx.try_send(frame).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => SendError::Overflow,
                mpsc::error::TrySendError::Closed(_) => SendError::Closing,
            }),
            None => Err(SendError::Closing),
        }
    }

    /// Pauses or resumes the read side. Takes effect between frames.
    pub fn set_read_gate(&self, gated: bool) {
        let _ = self.gate.send(gated);
    }

    /// Starts a graceful close: no more frames can be scheduled, the read
    /// task stops, and the write task drains what is queued before shutting
    /// the socket down.
    pub fn begin_close(&mut self) {
        self.sender = None;
        self.read_task.abort();
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

/// One established connection as the registries see it: the task handle plus
/// the flow-control state and the queue of frames held back while the
/// connection is paused.
pub struct Connection {
    pub handle: ConnectionHandle,
    pub flow: FlowState,
    pub pending: VecDeque<OutFrame>,
    /// Connections whose read side is gated because they routed a packet
    /// here while this connection was paused.
    pub gated_sources: Vec<ConnId>,
}

impl Connection {
    pub fn new(handle: ConnectionHandle) -> Self {
        Self {
            handle,
            flow: FlowState::default(),
            pending: VecDeque::new(),
            gated_sources: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::NodeIdentity;
    use crate::frame::FrameHeader;
    use crate::stream::read_header;

    fn test_logger() -> Logger {
        use slog::Drain;
        Logger::root(slog::Discard.fuse(), slog::o!())
    }

    #[tokio::test]
    async fn frames_scheduled_before_close_are_flushed() {
        let pool = PacketPool::new(1024);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (local, mut remote) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(local);
        let registry = prometheus::Registry::new();
        let metrics = DataPlaneMetrics::new(&registry);

        let mut handle = ConnectionHandle::spawn(
            7,
            ConnKind::Peer,
            reader,
            writer,
            pool,
            events_tx,
            16,
            test_logger(),
            metrics,
        );
        let src = NodeIdentity::new(1, 3);
        let dst = NodeIdentity::new(0, 2);
        handle
            .try_send(OutFrame {
                header: FrameHeader::ack(src, dst, 10),
                payload: None,
            })
            .unwrap();
        handle.begin_close();
        assert!(matches!(
            handle.try_send(OutFrame {
                header: FrameHeader::ack(src, dst, 1),
                payload: None,
            }),
            Err(SendError::Closing)
        ));

        // The queued ack still reaches the wire before the writer closes.
        let header = read_header(&mut remote).await.unwrap();
        assert_eq!(header.aux, 10);
        loop {
            match events_rx.recv().await.unwrap() {
                ProxyEvent::WriterDone { conn } => {
                    assert_eq!(conn, 7);
                    break;
                }
                ProxyEvent::Disconnected { .. } => continue,
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }
}
