//! The wire format shared by the peer and client transports.
//!
//! A frame is sent on the wire as a fixed-size header followed by an opaque
//! payload. For message framing the header must serialize to the same size
//! irrespective of its contents, so it is packed manually, little endian.

use crate::common::NodeIdentity;
use strum_macros::{AsRefStr, IntoStaticStr};
use thiserror::Error;

/// The size (in bytes) of the frame header.
pub const HEADER_SIZE: usize = 20;

/// The version of the wire format being used (currently 0).
pub const FRAME_VERSION: u8 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, AsRefStr, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum FrameKind {
    /// First frame on any connection; carries the sender's identity, and for
    /// clients the session token being registered in `aux`.
    Hello = 0,
    /// Acceptor's answer to `Hello`, carrying its own identity.
    HelloAck = 1,
    /// A routed payload. `dst` addresses the target node, `aux` the session
    /// token on that node.
    Data = 2,
    /// Cumulative acknowledgement; `aux` is the number of packets covered.
    Ack = 3,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0 => Ok(FrameKind::Hello),
            1 => Ok(FrameKind::HelloAck),
            2 => Ok(FrameKind::Data),
            3 => Ok(FrameKind::Ack),
            other => Err(FrameError::BadKind(other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unsupported frame version {0}")]
    BadVersion(u8),
    #[error("unknown frame kind {0}")]
    BadKind(u8),
    #[error("frame payload of {got} bytes exceeds the {limit} byte limit")]
    Oversize { got: u32, limit: u32 },
}

/// The frame header.
///
/// Layout (little endian): version u8, kind u8, flags u16, src content i16,
/// src dbid i16, dst content i16, dst dbid i16, aux u32, payload length u32.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    /// Reserved; currently always 0.
    pub flags: u16,
    pub src: NodeIdentity,
    pub dst: NodeIdentity,
    /// Session token on `Hello`/`Data`, acknowledged count on `Ack`.
    pub aux: u32,
    /// Length of the payload that follows the header.
    pub length: u32,
}

impl FrameHeader {
    pub fn data(src: NodeIdentity, dst: NodeIdentity, session: u32, length: u32) -> Self {
        Self {
            kind: FrameKind::Data,
            flags: 0,
            src,
            dst,
            aux: session,
            length,
        }
    }

    pub fn ack(src: NodeIdentity, dst: NodeIdentity, count: u32) -> Self {
        Self {
            kind: FrameKind::Ack,
            flags: 0,
            src,
            dst,
            aux: count,
            length: 0,
        }
    }

    pub fn hello(kind: FrameKind, src: NodeIdentity, session: u32) -> Self {
        debug_assert!(matches!(kind, FrameKind::Hello | FrameKind::HelloAck));
        Self {
            kind,
            flags: 0,
            src,
            dst: src,
            aux: session,
            length: 0,
        }
    }
}

pub fn pack_header(header: &FrameHeader) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    buf[0] = FRAME_VERSION;
    buf[1] = header.kind as u8;
    buf[2..4].copy_from_slice(&header.flags.to_le_bytes());
    buf[4..6].copy_from_slice(&header.src.content.to_le_bytes());
    buf[6..8].copy_from_slice(&header.src.dbid.to_le_bytes());
    buf[8..10].copy_from_slice(&header.dst.content.to_le_bytes());
    buf[10..12].copy_from_slice(&header.dst.dbid.to_le_bytes());
    buf[12..16].copy_from_slice(&header.aux.to_le_bytes());
    buf[16..20].copy_from_slice(&header.length.to_le_bytes());
    buf
}

pub fn unpack_header(buf: &[u8; HEADER_SIZE]) -> Result<FrameHeader, FrameError> {
    let version = buf[0];
    if version != FRAME_VERSION {
        return Err(FrameError::BadVersion(version));
    }
    let kind = FrameKind::try_from(buf[1])?;
    Ok(FrameHeader {
        kind,
        flags: u16::from_le_bytes(buf[2..4].try_into().unwrap()),
        src: NodeIdentity {
            content: i16::from_le_bytes(buf[4..6].try_into().unwrap()),
            dbid: i16::from_le_bytes(buf[6..8].try_into().unwrap()),
        },
        dst: NodeIdentity {
            content: i16::from_le_bytes(buf[8..10].try_into().unwrap()),
            dbid: i16::from_le_bytes(buf[10..12].try_into().unwrap()),
        },
        aux: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        length: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
    })
}
