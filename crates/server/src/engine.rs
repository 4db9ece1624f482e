// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The forwarder engine (spec §4.5): accepts one client query, fans it out
//! to the zone router's chosen upstreams, races their replies against a
//! 2-second timeout, and returns the first success.
//!
//! Grounded on the `clawpot` DNS proxy's `process_dns_query` (forward one
//! query, race a timeout, log and drop on failure —
//! `other_examples/6feebabf_..._dns_proxy.rs.rs`), generalized from a single
//! upstream to a fan-out race per spec §4.5, and on `hickory-proto`'s
//! connector/clock genericity for the upstream clients it owns.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dnsfwd_proto::cache::{AnswerCache, NoopCache};
use dnsfwd_proto::clock::Clock;
use dnsfwd_proto::config::Configuration;
use dnsfwd_proto::message::{self, MessageView};
use dnsfwd_proto::metrics::{Metrics, NoopMetrics};
use dnsfwd_proto::router;
use dnsfwd_proto::transport::Connector;
use dnsfwd_proto::upstream::UpstreamClient;
use futures_util::future::FutureExt;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Mutex;
use tracing::warn;

/// The engine's outer wall-clock budget for one downstream query (spec §4.5
/// step 4, §5 "2 s wall-clock budget").
const ANSWER_TIMEOUT: Duration = Duration::from_secs(2);

/// Owns the lazily-created upstream clients for one configuration and
/// drives the fan-out race for each query (spec §4.5).
pub struct Forwarder<C: Connector, CL: Clock> {
    config: Configuration,
    connector: C,
    clock: CL,
    cache: Arc<dyn AnswerCache>,
    metrics: Arc<dyn Metrics>,
    clients: Mutex<HashMap<SocketAddr, Arc<UpstreamClient<C, CL>>>>,
}

impl<C: Connector, CL: Clock> Forwarder<C, CL> {
    pub fn new(config: Configuration, connector: C, clock: CL) -> Arc<Self> {
        Self::with_cache_and_metrics(config, connector, clock, Arc::new(NoopCache), Arc::new(NoopMetrics))
    }

    pub fn with_cache_and_metrics(
        config: Configuration,
        connector: C,
        clock: CL,
        cache: Arc<dyn AnswerCache>,
        metrics: Arc<dyn Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            connector,
            clock,
            cache,
            metrics,
            clients: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Returns the first valid answer to `buffer`, or `None` if the query
    /// was unroutable, no upstream answered in time, or the upstream set
    /// was empty (spec §4.5, §8 S6).
    pub async fn answer(self: &Arc<Self>, buffer: Vec<u8>) -> Option<Vec<u8>> {
        self.metrics.query_received();

        let (client_id, question, qtype) = {
            let view = MessageView::parse(&buffer).ok()?;
            let client_id = view.id();
            let question = view.question()?.clone();
            let qtype = view.question_type()?;
            (client_id, question, qtype)
        };

        if let Some(mut cached) = self.cache.lookup(&question, qtype).await {
            // A cached response carries whatever transaction id was current
            // when it was stored; it must be rewritten to this caller's id
            // before delivery, same as a live upstream response (spec §6
            // "Transaction id rewriting").
            if message::set_id(&mut cached, client_id).is_err() {
                return None;
            }
            self.metrics.query_answered();
            return Some(cached);
        }

        let upstreams: Vec<SocketAddr> = router::choose(&self.config, &question)
            .into_iter()
            .map(|server| server.address)
            .collect();

        if upstreams.is_empty() {
            return None;
        }

        let response = self.race(&upstreams, buffer).await;

        match &response {
            Some(answer) => {
                self.metrics.query_answered();
                self.cache.store(&question, qtype, answer).await;
            }
            None => self.metrics.query_timed_out(),
        }

        response
    }

    /// Spawns one fan-out task per candidate upstream plus a timeout task,
    /// and returns the first successful response (spec §4.5 steps 3-5).
    /// Losing tasks are dropped (and thus cancelled) once this returns,
    /// which tears down their in-flight `rpc` cleanly (spec §5
    /// "Cancellation").
    async fn race(self: &Arc<Self>, upstreams: &[SocketAddr], buffer: Vec<u8>) -> Option<Vec<u8>> {
        let mut fan_out = FuturesUnordered::new();
        for &address in upstreams {
            let engine = Arc::clone(self);
            let query = buffer.clone();
            fan_out.push(
                async move {
                    let client = engine.client_for(address).await;
                    match client.rpc(query).await {
                        Ok(response) => Some(response),
                        Err(e) => {
                            warn!(upstream = %address, error = %e, "upstream did not answer");
                            None
                        }
                    }
                }
                .boxed(),
            );
        }

        let sleep = self.clock.sleep(ANSWER_TIMEOUT);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                next = fan_out.next(), if !fan_out.is_empty() => {
                    match next {
                        Some(Some(response)) => return Some(response),
                        // This candidate failed; keep racing the others. Per
                        // spec §7 the engine only gives up when *every*
                        // candidate has failed or the timeout wins — once
                        // `fan_out` is empty the guard above simply leaves
                        // the timeout as the only live arm, so a fully
                        // failed race still waits out the full budget
                        // before resolving to `None`.
                        Some(None) => continue,
                        None => return None,
                    }
                }
                _ = &mut sleep => return None,
            }
        }
    }

    /// Returns the upstream client for `address`, creating it lazily on
    /// first use (spec §3 "Upstream client state ... is created lazily on
    /// first use").
    async fn client_for(self: &Arc<Self>, address: SocketAddr) -> Arc<UpstreamClient<C, CL>> {
        let mut clients = self.clients.lock().await;
        clients
            .entry(address)
            .or_insert_with(|| {
                UpstreamClient::connect_with_metrics(
                    address,
                    self.connector.clone(),
                    self.clock.clone(),
                    Arc::clone(&self.metrics),
                )
            })
            .clone()
    }
}
