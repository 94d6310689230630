//! The address table: which proxy lives where.
//!
//! The raw address list arrives as one configuration string with one entry
//! per node identity. The table keeps the previously loaded generation so a
//! reload can be diffed: entries that disappeared or whose address changed
//! must have their peers disconnected before any reconnection happens, which
//! is what keeps a promotion from ever producing two live connections for
//! one content-id.

use crate::common::NodeIdentity;
use std::fmt;
use thiserror::Error;

/// One parsed `content:dbid:host:port` entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyAddr {
    pub id: NodeIdentity,
    /// Hostname or IP literal.
    pub host: String,
    /// Port number. Only numeric ports are supported: every proxy needs a
    /// unique port on its host, so service names are rejected as syntax
    /// errors.
    pub port: u16,
}

impl ProxyAddr {
    /// Connect/bind endpoint; resolution of non-literal hostnames is left to
    /// the socket layer.
    pub fn endpoint(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }
}

impl fmt::Display for ProxyAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}:{}", self.id, self.host, self.port)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed proxy address entry {entry:?}")]
    Syntax { entry: String },
    #[error("unsupported port {port:?} in entry {entry:?}: only port numbers are accepted")]
    BadPort { entry: String, port: String },
    #[error("duplicate proxy address for {id}")]
    DuplicateIdentity { id: NodeIdentity },
}

/// Current and previous address generations plus the diff between them.
pub struct AddressBook {
    my_id: NodeIdentity,
    current: Vec<ProxyAddr>,
    previous: Vec<ProxyAddr>,
    /// Entries new in the current generation, including changed ones.
    added: Vec<ProxyAddr>,
    /// Entries gone from the previous generation, including changed ones:
    /// a changed address is a removal followed by an addition.
    removed: Vec<ProxyAddr>,
}

impl AddressBook {
    pub fn new(my_id: NodeIdentity) -> Self {
        Self {
            my_id,
            current: Vec::new(),
            previous: Vec::new(),
            added: Vec::new(),
            removed: Vec::new(),
        }
    }

    /// Replaces the current generation with a freshly parsed one and records
    /// the diff. On a parse error the previously loaded list stays in force.
    pub fn reload(&mut self, raw: &str) -> Result<(), ConfigError> {
        let next = parse_addresses(raw)?;
        let (added, removed) = diff(&self.current, &next);
        self.previous = std::mem::replace(&mut self.current, next);
        self.added = added;
        self.removed = removed;
        Ok(())
    }

    pub fn current(&self) -> &[ProxyAddr] {
        &self.current
    }

    pub fn added(&self) -> &[ProxyAddr] {
        &self.added
    }

    pub fn removed(&self) -> &[ProxyAddr] {
        &self.removed
    }

    /// This node's own entry in the current list, if any.
    pub fn my_addr(&self) -> Option<&ProxyAddr> {
        self.current.iter().find(|a| a.id == self.my_id)
    }
}

/// Parses a comma/whitespace separated list of `content:dbid:host:port`
/// entries.
pub fn parse_addresses(raw: &str) -> Result<Vec<ProxyAddr>, ConfigError> {
    let mut addrs: Vec<ProxyAddr> = Vec::new();
    for entry in raw.split([',', ' ', '\t', '\n']) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let syntax = || ConfigError::Syntax {
            entry: entry.to_string(),
        };
        // The host may itself contain ':' (IPv6 literal), so take the port
        // from the right and the identity from the left.
        let (rest, port_str) = entry.rsplit_once(':').ok_or_else(syntax)?;
        let mut left = rest.splitn(3, ':');
        let content = left.next().ok_or_else(syntax)?;
        let dbid = left.next().ok_or_else(syntax)?;
        let host = left.next().ok_or_else(syntax)?;
        if host.is_empty() {
            return Err(syntax());
        }
        let content = content.parse().map_err(|_| syntax())?;
        let dbid = dbid.parse().map_err(|_| syntax())?;
        let port = port_str.parse().map_err(|_| ConfigError::BadPort {
            entry: entry.to_string(),
            port: port_str.to_string(),
        })?;
        let id = NodeIdentity::new(content, dbid);
        if addrs.iter().any(|a| a.id == id) {
            return Err(ConfigError::DuplicateIdentity { id });
        }
        addrs.push(ProxyAddr {
            id,
            host: host.to_string(),
            port,
        });
    }
    Ok(addrs)
}

/// Compares two generations by node identity and by address. Returns
/// `(added, removed)`; an entry whose address changed shows up in both, so
/// callers naturally treat "changed" as remove-then-add.
pub fn diff(old: &[ProxyAddr], new: &[ProxyAddr]) -> (Vec<ProxyAddr>, Vec<ProxyAddr>) {
    let added = new
        .iter()
        .filter(|entry| !old.contains(entry))
        .cloned()
        .collect();
    let removed = old
        .iter()
        .filter(|entry| !new.contains(entry))
        .cloned()
        .collect();
    (added, removed)
}
