// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The zone router: picks the set of upstreams for a question by
//! longest-suffix zone match, falling back to the configured defaults.
//! Stateless and pure, so — unlike `droute`'s `Router`, which bundles a
//! cache and filter state — this is just a free function over borrowed
//! configuration (grounded on `droute`'s `Filter::get_upstream`, simplified
//! since routing here owns no state of its own).

use crate::config::{Configuration, ServerConfig};
use crate::domain::Name;

/// Returns every server matching `qname`, or the configured defaults if none
/// match. Ordering within the returned slice is irrelevant to correctness —
/// the forwarder races them.
pub fn choose<'c>(config: &'c Configuration, qname: &Name) -> Vec<&'c ServerConfig> {
    let matched: Vec<&ServerConfig> = config
        .servers
        .iter()
        .filter(|s| s.matches(qname))
        .collect();

    if !matched.is_empty() {
        return matched;
    }

    config.servers.iter().filter(|s| s.is_default()).collect()
}
