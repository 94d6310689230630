//! Constants and types shared by many modules.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Stable logical identifier of a cluster member; survives primary/mirror
/// promotion.
pub type ContentId = i16;

/// Identifier of the physical instance currently serving a content-id.
pub type DbId = i16;

/// Token naming a logical session route between a local execution process
/// and its counterpart on another node.
pub type SessionToken = u32;

/// Pause the sender when its unacked packet count reaches this threshold.
pub const UNACK_PACKET_PAUSE: u32 = 100;
/// Resume the sender when the unacked packet count falls to this threshold.
pub const UNACK_PACKET_RESUME: u32 = 30;
/// Send one cumulative ack after this many received packets.
pub const ACK_INTERVAL: u32 = 10;

pub const LISTEN_BACKLOG: u32 = 1024;

/// Identity of a node: which logical member it is and which physical
/// instance currently serves it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub content: ContentId,
    pub dbid: DbId,
}

impl NodeIdentity {
    pub fn new(content: ContentId, dbid: DbId) -> Self {
        Self { content, dbid }
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seg{}:dbid{}", self.content, self.dbid)
    }
}

/// Builds the client listener socket path.
///
/// Every proxy on the same host must use a different path, so that proxies
/// from different segments or even different clusters can coexist. This is
/// ensured by including the host process's port and pid in the path.
pub fn client_sock_path(sock_dir: &Path, host_port: u16, host_pid: u32) -> PathBuf {
    sock_dir.join(format!(".s.motion_proxy.{}.{}", host_port, host_pid))
}
