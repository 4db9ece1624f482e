// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The error taxonomy shared by every layer of the forwarding engine.
//!
//! Id-pool exhaustion has no variant here: the pool never surfaces it as an
//! error, it just makes `IdPool::get` pend until a `put` wakes it.

use std::fmt;
use std::io;

/// Uniform result type used throughout `dnsfwd-proto` and its dependents.
pub type Result<T> = std::result::Result<T, Error>;

/// The forwarder's error kinds, realized as variants of a single enum.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A DNS message buffer could not be decoded far enough to route or
    /// remap it.
    #[error("parse: {0}")]
    Parse(String),

    /// TCP framing violation: short read, oversized write, or truncated
    /// write.
    #[error("framing: {0}")]
    Framing(String),

    /// A transport-level read/write/connect failure.
    #[error("io: {0}")]
    Io(#[from] io::Error),

    /// The connection backing this request was torn down underneath it.
    #[error("connection to server was closed")]
    Closed,

    /// The engine's outer deadline elapsed with no upstream answering.
    #[error("timeout")]
    Timeout,
}

impl Error {
    /// Shorthand for the common "couldn't parse this" case, matching the
    /// wording spec §4.4.2 mandates for a malformed query.
    pub fn parse(msg: impl fmt::Display) -> Self {
        Self::Parse(msg.to_string())
    }

    /// Shorthand for a framing violation.
    pub fn framing(msg: impl fmt::Display) -> Self {
        Self::Framing(msg.to_string())
    }

    /// Shorthand for a listener bind failure (spec §7: "Binding the listen
    /// port fails the whole server with `msg("please supply a free port
    /// number")`"). Still an `io` kind per the taxonomy; this just pins the
    /// wording.
    pub fn bind(msg: impl fmt::Display) -> Self {
        Self::Io(io::Error::other(msg.to_string()))
    }
}
