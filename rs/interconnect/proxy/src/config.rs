//! The basic configuration struct used to start up a proxy instance.

use crate::common::{client_sock_path, NodeIdentity};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const DEFAULT_PENDING_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_MAX_PACKET_SIZE: usize = 32 * 1024;

/// Logging options; the daemon logs to stderr.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggerConfig {
    /// One of `trace`, `debug`, `info`, `warning`, `error`, `critical`.
    pub level: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggerConfig {
    pub fn slog_level(&self) -> slog::Level {
        match self.level.as_str() {
            "trace" => slog::Level::Trace,
            "debug" => slog::Level::Debug,
            "warning" => slog::Level::Warning,
            "error" => slog::Level::Error,
            "critical" => slog::Level::Critical,
            _ => slog::Level::Info,
        }
    }
}

/// This struct contains configuration options for one interconnect proxy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The content-id of the segment this proxy serves.
    pub content_id: i16,
    /// The dbid of the segment instance this proxy serves.
    pub dbid: i16,
    /// The port of the owning database process; part of the client socket
    /// path so co-located instances never collide.
    pub host_port: u16,
    /// The pid of the owning database process; defaults to this process.
    #[serde(default)]
    pub host_pid: Option<u32>,
    /// The proxy address list, one `content:dbid:host:port` entry per node.
    /// Re-read from the config file on a reload signal.
    #[serde(default)]
    pub proxy_addresses: String,
    /// Directory for the client listener socket.
    #[serde(default)]
    pub sock_dir: Option<PathBuf>,
    /// Per-connection bound on packets queued for a paused destination.
    /// Overflow is a flow-control protocol violation and is fatal.
    #[serde(default = "default_pending_queue_capacity")]
    pub pending_queue_capacity: usize,
    /// Size of pooled wire buffers; the largest payload a frame may carry.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// Read end of the parent process's liveness pipe. EOF on it means the
    /// parent is gone and the proxy must terminate immediately.
    #[serde(default)]
    pub parent_watch_fd: Option<i32>,
    /// Backing file for the failure flag shared with the host system. When
    /// unset the flag is process-local.
    #[serde(default)]
    pub failure_flag_path: Option<PathBuf>,
    /// Logger config.
    #[serde(default)]
    pub logger: LoggerConfig,
}

fn default_pending_queue_capacity() -> usize {
    DEFAULT_PENDING_QUEUE_CAPACITY
}

fn default_max_packet_size() -> usize {
    DEFAULT_MAX_PACKET_SIZE
}

impl Config {
    /// A config with everything defaulted except the identity; the starting
    /// point for tests and tools.
    pub fn for_node(content_id: i16, dbid: i16, host_port: u16) -> Self {
        Self {
            content_id,
            dbid,
            host_port,
            host_pid: None,
            proxy_addresses: String::new(),
            sock_dir: None,
            pending_queue_capacity: DEFAULT_PENDING_QUEUE_CAPACITY,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            parent_watch_fd: None,
            failure_flag_path: None,
            logger: LoggerConfig::default(),
        }
    }

    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity::new(self.content_id, self.dbid)
    }

    pub fn host_pid(&self) -> u32 {
        self.host_pid.unwrap_or_else(std::process::id)
    }

    pub fn sock_dir(&self) -> PathBuf {
        self.sock_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
    }

    /// The client listener socket path for this instance.
    pub fn client_sock_path(&self) -> PathBuf {
        client_sock_path(&self.sock_dir(), self.host_port, self.host_pid())
    }
}

#[cfg(test)]
pub mod test {
    use super::*;

    pub struct ConfigBuilder {
        config: Config,
    }

    impl ConfigBuilder {
        pub fn new(content_id: i16, dbid: i16) -> Self {
            Self {
                config: Config::for_node(content_id, dbid, 6000),
            }
        }

        pub fn with_proxy_addresses(mut self, addresses: &str) -> Self {
            self.config.proxy_addresses = addresses.to_string();
            self
        }

        pub fn with_sock_dir(mut self, dir: PathBuf) -> Self {
            self.config.sock_dir = Some(dir);
            self
        }

        pub fn build(self) -> Config {
            self.config
        }
    }

    #[test]
    fn defaults_are_filled_in() {
        let config: Config = serde_json::from_str(
            r#"{"content_id": 0, "dbid": 2, "host_port": 5432}"#,
        )
        .unwrap();
        assert_eq!(config.pending_queue_capacity, 1024);
        assert_eq!(config.max_packet_size, 32 * 1024);
        assert_eq!(config.logger.level, "info");
        assert_eq!(config.identity(), NodeIdentity::new(0, 2));
    }

    #[test]
    fn sock_path_uses_host_port_and_pid() {
        let mut config = Config::for_node(1, 3, 6432);
        config.host_pid = Some(4242);
        assert_eq!(
            config.client_sock_path(),
            PathBuf::from("/tmp/.s.motion_proxy.6432.4242")
        );
    }
}
