// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! TOML configuration ingestion.
//!
//! Parsing a config file is explicitly out of the core's scope (spec §1);
//! this module is the external collaborator the core expects, translating
//! a `serde`-deserialized [`FileConfig`] into `dnsfwd_proto::config::Configuration`
//! the way `hickory-dns`'s bin crate turns its `toml`-deserialized
//! `hickory_server::config::Config` into the server's runtime types.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use dnsfwd_proto::config::{Configuration, DuplicateAddress, ServerConfig};
use dnsfwd_proto::domain::Name;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("could not parse upstream address {address:?} for server entry: {source}")]
    Address {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error(transparent)]
    Duplicate(#[from] DuplicateAddress),
}

/// On-disk shape of one `[[servers]]` table.
#[derive(Debug, Deserialize)]
struct FileServer {
    address: String,
    #[serde(default)]
    zones: Vec<String>,
}

/// On-disk shape of the whole config file.
#[derive(Debug, Deserialize)]
struct FileConfig {
    #[serde(default)]
    search: Vec<String>,
    #[serde(default)]
    servers: Vec<FileServer>,
}

/// Loads and validates a configuration file, returning the core's
/// `Configuration` type. Zone labels are parsed with [`Name::parse`]; an
/// empty `zones` list marks a default server (spec §3).
pub fn load(path: &Path) -> Result<Configuration, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;

    let file: FileConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;

    let mut servers = Vec::with_capacity(file.servers.len());
    for server in file.servers {
        let address: SocketAddr =
            server
                .address
                .parse()
                .map_err(|source| ConfigError::Address {
                    address: server.address.clone(),
                    source,
                })?;
        let zones = server.zones.iter().map(|z| Name::parse(z));
        servers.push(ServerConfig::new(address, zones));
    }

    let config = Configuration::new(servers, file.search);
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn parses_defaults_and_zoned_servers() {
        let f = write_config(
            r#"
            search = ["example.com"]

            [[servers]]
            address = "8.8.8.8:53"

            [[servers]]
            address = "1.1.1.1:53"
            zones = ["example.com"]
            "#,
        );

        let config = load(f.path()).unwrap();
        assert_eq!(config.search, vec!["example.com".to_string()]);
        assert_eq!(config.servers.len(), 2);
        assert!(config.servers[0].is_default());
        assert!(!config.servers[1].is_default());
        assert!(config.servers[1].matches(&Name::parse("foo.example.com")));
    }

    #[test]
    fn rejects_duplicate_addresses() {
        let f = write_config(
            r#"
            [[servers]]
            address = "8.8.8.8:53"

            [[servers]]
            address = "8.8.8.8:53"
            zones = ["example.com"]
            "#,
        );

        assert!(matches!(load(f.path()), Err(ConfigError::Duplicate(_))));
    }

    #[test]
    fn rejects_unparseable_address() {
        let f = write_config(
            r#"
            [[servers]]
            address = "not-an-address"
            "#,
        );

        assert!(matches!(load(f.path()), Err(ConfigError::Address { .. })));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let missing = Path::new("/nonexistent/dnsfwd-test-config.toml");
        assert!(matches!(load(missing), Err(ConfigError::Read { .. })));
    }
}
