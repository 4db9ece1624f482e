// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The answer-cache lookup hook: a seam for a prospective answer cache,
//! with only the lookup/store hook specified here. Real caching — TTL
//! tracking, eviction, negative caching — is out of scope; this is the seam
//! a future cache attaches to, left here as a trait with a no-op default
//! the way `hickory-dns` leaves optional subsystems (DNSSEC, recursion)
//! behind a trait and a feature-gated default implementation.

use async_trait::async_trait;

use crate::domain::Name;

/// Consulted by the forwarder before fan-out, and updated after a winning
/// response.
#[async_trait]
pub trait AnswerCache: Send + Sync + 'static {
    /// Returns a previously-stored response buffer for `(qname, qtype)`, if
    /// any. A hit lets the engine skip fan-out entirely.
    async fn lookup(&self, qname: &Name, qtype: u16) -> Option<Vec<u8>>;

    /// Offers a winning response for possible storage. The default no-op
    /// cache ignores this.
    async fn store(&self, qname: &Name, qtype: u16, response: &[u8]);
}

/// The default cache: never hits, never stores.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

#[async_trait]
impl AnswerCache for NoopCache {
    async fn lookup(&self, _qname: &Name, _qtype: u16) -> Option<Vec<u8>> {
        None
    }

    async fn store(&self, _qname: &Name, _qtype: u16, _response: &[u8]) {}
}
