//! Framed I/O shared by the peer and client transports.
//!
//! Established connections are split into a read task and a write task. The
//! read task decodes frames and hands them to the event loop; the write task
//! drains the connection's send queue. Neither task touches any table: all
//! state transitions happen in the event loop, which observes these tasks
//! only through [`ProxyEvent`]s.

use crate::common::{ContentId, NodeIdentity, SessionToken};
use crate::frame::{
    pack_header, unpack_header, FrameError, FrameHeader, FrameKind, HEADER_SIZE,
};
use crate::metrics::DataPlaneMetrics;
use crate::pool::{Packet, PacketPool};
use slog::{warn, Logger};
use std::io;
use std::time::Duration;
use strum_macros::AsRefStr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Time to wait for the hello exchange (both sides).
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Identifies a live connection within one proxy instance.
pub type ConnId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ConnKind {
    Peer,
    Client,
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("timed out waiting for the hello exchange")]
    HandshakeTimeout,
    #[error("expected a {expected} frame, got {got}")]
    UnexpectedFrame {
        expected: &'static str,
        got: &'static str,
    },
}

/// A frame queued for writing. The payload buffer returns to its pool when
/// the frame is dropped, whether it was flushed or discarded.
#[derive(Debug)]
pub struct OutFrame {
    pub header: FrameHeader,
    pub payload: Option<Packet>,
}

/// Everything the event loop can observe.
#[derive(Debug)]
pub enum ProxyEvent {
    /// An outbound dial and hello exchange finished.
    PeerDialed {
        content: ContentId,
        expected: NodeIdentity,
        result: Result<(NodeIdentity, TcpStream), StreamError>,
    },
    /// An inbound peer finished its hello exchange.
    PeerAccepted {
        remote: NodeIdentity,
        stream: TcpStream,
    },
    /// A local client finished its hello exchange.
    ClientHello {
        token: SessionToken,
        stream: UnixStream,
    },
    /// A complete frame arrived on an established connection.
    Frame {
        conn: ConnId,
        header: FrameHeader,
        payload: Option<Packet>,
    },
    /// The read side of a connection hit EOF (`reason` is `None`) or failed.
    Disconnected {
        conn: ConnId,
        reason: Option<StreamError>,
    },
    /// The write side drained its queue and shut down, or failed.
    WriterDone { conn: ConnId },
    /// The parent process's liveness pipe reported end of stream.
    ParentGone,
}

pub async fn read_header<R>(reader: &mut R) -> Result<FrameHeader, StreamError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut buf).await?;
    Ok(unpack_header(&buf)?)
}

/// Reads one complete frame; the payload, if any, lives in a pooled buffer.
pub async fn read_frame<R>(
    reader: &mut R,
    pool: &PacketPool,
) -> Result<(FrameHeader, Option<Packet>), StreamError>
where
    R: AsyncRead + Unpin,
{
    let header = read_header(reader).await?;
    if header.length == 0 {
        return Ok((header, None));
    }
    if header.length as usize > pool.buf_size() {
        return Err(FrameError::Oversize {
            got: header.length,
            limit: pool.buf_size() as u32,
        }
        .into());
    }
    let mut packet = pool.alloc();
    packet.resize(header.length as usize, 0);
    reader.read_exact(&mut packet[..]).await?;
    Ok((header, Some(packet)))
}

pub async fn write_frame<W>(
    writer: &mut W,
    header: &FrameHeader,
    payload: Option<&[u8]>,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&pack_header(header)).await?;
    if let Some(payload) = payload {
        writer.write_all(payload).await?;
    }
    Ok(())
}

fn expect_kind(header: &FrameHeader, kind: FrameKind) -> Result<(), StreamError> {
    if header.kind != kind || header.length != 0 {
        return Err(StreamError::UnexpectedFrame {
            expected: kind.into(),
            got: header.kind.into(),
        });
    }
    Ok(())
}

/// Dial-side hello exchange: send our identity, read the acceptor's.
pub async fn peer_dial_handshake(
    stream: &mut TcpStream,
    my_id: NodeIdentity,
) -> Result<NodeIdentity, StreamError> {
    let exchange = async {
        write_frame(stream, &FrameHeader::hello(FrameKind::Hello, my_id, 0), None).await?;
        stream.flush().await?;
        let header = read_header(stream).await?;
        expect_kind(&header, FrameKind::HelloAck)?;
        Ok(header.src)
    };
    tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange)
        .await
        .map_err(|_| StreamError::HandshakeTimeout)?
}

/// Accept-side hello exchange: read the dialer's identity, answer with ours.
pub async fn peer_accept_handshake(
    stream: &mut TcpStream,
    my_id: NodeIdentity,
) -> Result<NodeIdentity, StreamError> {
    let exchange = async {
        let header = read_header(stream).await?;
        expect_kind(&header, FrameKind::Hello)?;
        write_frame(
            stream,
            &FrameHeader::hello(FrameKind::HelloAck, my_id, 0),
            None,
        )
        .await?;
        stream.flush().await?;
        Ok(header.src)
    };
    tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange)
        .await
        .map_err(|_| StreamError::HandshakeTimeout)?
}

/// Client-side hello exchange: the client names the session route it will
/// carry; we answer with our identity so it learns who it is talking to.
pub async fn client_accept_handshake(
    stream: &mut UnixStream,
    my_id: NodeIdentity,
) -> Result<SessionToken, StreamError> {
    let exchange = async {
        let header = read_header(stream).await?;
        expect_kind(&header, FrameKind::Hello)?;
        let token = header.aux;
        write_frame(
            stream,
            &FrameHeader::hello(FrameKind::HelloAck, my_id, token),
            None,
        )
        .await?;
        stream.flush().await?;
        Ok(token)
    };
    tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange)
        .await
        .map_err(|_| StreamError::HandshakeTimeout)?
}

/// Per-connection read task. Decodes frames and hands them to the event
/// loop; honors the flow-control gate between frames, never mid-frame.
pub fn spawn_read_task<R>(
    conn: ConnId,
    kind: ConnKind,
    mut reader: R,
    pool: PacketPool,
    events: mpsc::Sender<ProxyEvent>,
    mut gate: watch::Receiver<bool>,
    metrics: DataPlaneMetrics,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            while *gate.borrow() {
                if gate.changed().await.is_err() {
                    return;
                }
            }
            match read_frame(&mut reader, &pool).await {
                Ok((header, payload)) => {
                    metrics
                        .read_bytes
                        .with_label_values(&[kind.as_ref()])
                        .inc_by(HEADER_SIZE as u64 + header.length as u64);
                    metrics
                        .frames_received
                        .with_label_values(&[header.kind.as_ref()])
                        .inc();
                    if events
                        .send(ProxyEvent::Frame {
                            conn,
                            header,
                            payload,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(err) => {
                    let reason = match err {
                        StreamError::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => None,
                        other => Some(other),
                    };
                    if reason.is_some() {
                        metrics.read_errors.with_label_values(&[kind.as_ref()]).inc();
                    }
                    let _ = events.send(ProxyEvent::Disconnected { conn, reason }).await;
                    return;
                }
            }
        }
    })
}

/// Per-connection write task. Drains the send queue and flushes each frame;
/// TCP_NODELAY is set on peer sockets, so a flush pushes the frame out
/// immediately. Ends when every sender is gone (graceful close) or on a
/// write error, and reports completion either way.
pub fn spawn_write_task<W>(
    conn: ConnId,
    kind: ConnKind,
    mut writer: W,
    mut queue: mpsc::Receiver<OutFrame>,
    events: mpsc::Sender<ProxyEvent>,
    log: Logger,
    metrics: DataPlaneMetrics,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = queue.recv().await {
            let payload = frame.payload.as_ref().map(|p| &p[..]);
            let write = async {
                write_frame(&mut writer, &frame.header, payload).await?;
                writer.flush().await
            };
            match write.await {
                Ok(()) => {
                    metrics
                        .write_bytes
                        .with_label_values(&[kind.as_ref()])
                        .inc_by(HEADER_SIZE as u64 + frame.header.length as u64);
                }
                Err(err) => {
                    warn!(
                        log,
                        "write failed on {} connection {}: {}",
                        kind.as_ref(),
                        conn,
                        err
                    );
                    // Discard whatever is still queued so the buffers return
                    // to the pool, then report the writer as gone.
                    queue.close();
                    while queue.try_recv().is_ok() {}
                    let _ = events.send(ProxyEvent::WriterDone { conn }).await;
                    return;
                }
            }
        }
        let _ = writer.shutdown().await;
        let _ = events.send(ProxyEvent::WriterDone { conn }).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameKind;

    fn identity(content: i16, dbid: i16) -> NodeIdentity {
        NodeIdentity::new(content, dbid)
    }

    #[tokio::test]
    async fn frame_roundtrip_over_a_stream() {
        let pool = PacketPool::new(1024);
        let (mut a, mut b) = tokio::io::duplex(4096);
        let header = FrameHeader::data(identity(1, 3), identity(0, 2), 9, 6);
        write_frame(&mut a, &header, Some(b"motion")).await.unwrap();

        let (got, payload) = read_frame(&mut b, &pool).await.unwrap();
        assert_eq!(got, header);
        assert_eq!(&payload.unwrap()[..], b"motion");
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn oversize_frames_are_rejected() {
        let pool = PacketPool::new(8);
        let (mut a, mut b) = tokio::io::duplex(4096);
        let header = FrameHeader::data(identity(1, 3), identity(0, 2), 0, 64);
        write_frame(&mut a, &header, Some(&[0u8; 64])).await.unwrap();
        assert!(matches!(
            read_frame(&mut b, &pool).await,
            Err(StreamError::Frame(FrameError::Oversize { .. }))
        ));
    }

    #[tokio::test]
    async fn zero_length_frames_carry_no_packet() {
        let pool = PacketPool::new(1024);
        let (mut a, mut b) = tokio::io::duplex(4096);
        let header = FrameHeader::ack(identity(0, 2), identity(1, 3), 10);
        write_frame(&mut a, &header, None).await.unwrap();
        let (got, payload) = read_frame(&mut b, &pool).await.unwrap();
        assert_eq!(got.kind, FrameKind::Ack);
        assert_eq!(got.aux, 10);
        assert!(payload.is_none());
        assert_eq!(pool.outstanding(), 0);
    }
}
