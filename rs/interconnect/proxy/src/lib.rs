//! The interconnect proxy multiplexes motion traffic between the
//! query-execution processes of a shared-nothing cluster. Instead of every
//! execution process opening a connection to every peer node, each node runs
//! one proxy daemon; the proxies keep exactly one long-lived TCP connection
//! per node pair and apply credit-based flow control, so a slow consumer
//! cannot exhaust memory on a fast producer's node.

/// This module contains the address table: parsing of the proxy address
/// list and the diff between reload generations.
pub mod addressbook;
/// This module contains the registry of local execution-process
/// connections and their session routes.
pub mod clientmanager;
/// This module contains constants and types that are shared by many
/// modules.
pub mod common;
/// This module contains the basic configuration struct used to start up a
/// proxy instance.
pub mod config;
/// This module contains code that is used to manage a single established
/// connection.
pub mod connection;
/// This module contains the peer registry: one connection slot per remote
/// content-id and its state machine.
pub mod connectionmanager;
/// This module contains the failure flag shared with the host system.
pub mod flag;
/// This module contains the wire format shared by the peer and client
/// transports.
pub mod frame;
/// Proxy metrics.
pub mod metrics;
/// This module contains the fixed-size buffer pool that wire packets live
/// in.
pub mod pool;
/// This module contains the proxy context and its main loop.
pub mod proxy;
/// This module contains the router: packet forwarding and the credit-based
/// flow-control protocol.
pub mod router;
/// This module contains framed stream I/O and the per-connection read and
/// write tasks.
pub mod stream;

mod cli;

pub use cli::Cli;
pub use config::Config;
pub use proxy::{Proxy, ProxyHandle, ProxySnapshot, EXIT_CLEAN, EXIT_RESTART};
