// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Configuration data model (spec §3). Parsing a config file is explicitly
//! out of scope for the core (spec §1); this module only holds the types the
//! core consumes once some external collaborator has built them.

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::domain::Name;

/// A single upstream nameserver entry.
///
/// An empty `zones` set marks the server as a default (spec §3): it never
/// matches a query via the suffix rule, only via the "no zoned server
/// matched" fallback (spec §4.2).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub zones: HashSet<Name>,
    pub address: SocketAddr,
}

impl ServerConfig {
    pub fn new(address: SocketAddr, zones: impl IntoIterator<Item = Name>) -> Self {
        Self {
            zones: zones.into_iter().collect(),
            address,
        }
    }

    pub fn default_server(address: SocketAddr) -> Self {
        Self {
            zones: HashSet::new(),
            address,
        }
    }

    pub fn is_default(&self) -> bool {
        self.zones.is_empty()
    }

    /// True if `name` matches one of this server's zones by suffix (spec
    /// §4.2). Always false for a default server.
    pub fn matches(&self, name: &Name) -> bool {
        self.zones.iter().any(|zone| name.has_suffix(zone))
    }
}

/// Immutable once installed in a forwarder (spec §3).
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    pub servers: Vec<ServerConfig>,
    /// Search-suffix list carried through unopened; expanding a bare query
    /// name against it is a configuration-ingestion concern, out of scope
    /// for the core (spec §1).
    pub search: Vec<String>,
}

/// Returned by [`Configuration::validate`] when the invariant in spec §3 is
/// violated: "no two entries share the same address".
#[derive(Debug, thiserror::Error)]
#[error("duplicate server address in configuration: {0}")]
pub struct DuplicateAddress(pub SocketAddr);

impl Configuration {
    pub fn new(servers: Vec<ServerConfig>, search: Vec<String>) -> Self {
        Self { servers, search }
    }

    /// Checks the "no two entries share the same address" invariant. The
    /// core does not call this itself (construction is an external
    /// collaborator's job per spec §1), but it's provided so that collaborator
    /// can enforce it the way the core expects.
    pub fn validate(&self) -> Result<(), DuplicateAddress> {
        let mut seen = HashSet::new();
        for server in &self.servers {
            if !seen.insert(server.address) {
                return Err(DuplicateAddress(server.address));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_server_matches_nothing() {
        let s = ServerConfig::default_server("127.0.0.1:53".parse().unwrap());
        assert!(!s.matches(&Name::parse("foo.com")));
    }

    #[test]
    fn zoned_server_matches_suffix() {
        let s = ServerConfig::new(
            "127.0.0.1:53".parse().unwrap(),
            [Name::parse("example.com")],
        );
        assert!(s.matches(&Name::parse("foo.example.com")));
        assert!(!s.matches(&Name::parse("foo.net")));
    }

    #[test]
    fn validate_rejects_duplicate_addresses() {
        let addr: SocketAddr = "127.0.0.1:53".parse().unwrap();
        let config = Configuration::new(
            vec![
                ServerConfig::default_server(addr),
                ServerConfig::new(addr, [Name::parse("example.com")]),
            ],
            vec![],
        );
        assert!(config.validate().is_err());
    }
}
