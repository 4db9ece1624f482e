// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-upstream persistent connection with transaction-id remapping.
//!
//! One `UpstreamClient` owns at most one live connection to its configured
//! nameserver at a time. Concurrent `rpc` calls multiplex onto that
//! connection by borrowing a transaction id from an [`IdPool`] and
//! registering a one-shot completion slot in `pending`, keyed by that id.
//! A dispatcher task, spawned alongside each connection, reads frames off
//! the wire and wakes whichever slot matches the id in the response.
//!
//! Grounded on `hickory-proto`'s `UdpClientStream`/`RuntimeProvider` split
//! (`crates/proto/src/udp/udp_client_stream.rs`): a transport-agnostic
//! client parameterized by a connector and a clock, so tests can swap in an
//! in-memory transport and a manual clock. The pending-table/dispatcher
//! shape beyond that split is this crate's own, since `hickory-proto`'s UDP
//! stream is a one-shot-per-query design with no analogous
//! persistent-connection multiplexer to imitate directly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::clock::Clock;
use crate::error::Error;
use crate::ids::IdPool;
use crate::message;
use crate::metrics::{Metrics, NoopMetrics};
use crate::transport::{Connector, FramedIo};

/// Disconnect after this much inactivity on a live connection.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

type Waiter = oneshot::Sender<Result<Vec<u8>, Error>>;

/// A `pending` entry's generation never matches a live dispatcher's unless
/// `attempt` has replaced the placeholder with the real one (see
/// `attempt`'s comment). No real generation is ever this value, so a frame
/// arriving in the narrow window before that replacement can't be mistaken
/// for belonging to any connection.
const NO_GENERATION: u64 = u64::MAX;

struct Inner<Conn> {
    conn: Option<Arc<Conn>>,
    /// Identifies the connection currently stored in `conn`, incremented
    /// each time a new connection replaces a torn-down one. Tags every
    /// `pending` entry and every dispatcher, so a response that arrives on
    /// a connection that has since been superseded can never be mistaken
    /// for belonging to whichever newer connection's request reused the
    /// same numeric id.
    generation: u64,
    /// Notified when the current `conn` is torn down, so the dispatcher
    /// bound to it can stop reading without waiting on the socket to error
    /// out on its own. A fresh `Notify` is created per connection
    /// generation; an old dispatcher never sees a later generation's.
    close_notify: Option<Arc<Notify>>,
    idle_timer: Option<JoinHandle<()>>,
}

impl<Conn> Default for Inner<Conn> {
    fn default() -> Self {
        Self {
            conn: None,
            generation: 0,
            close_notify: None,
            idle_timer: None,
        }
    }
}

/// One configured upstream's connection, id-remapping table, and dispatcher.
pub struct UpstreamClient<C: Connector, CL: Clock> {
    address: SocketAddr,
    connector: C,
    clock: CL,
    metrics: Arc<dyn Metrics>,
    ids: IdPool,
    pending: StdMutex<HashMap<u16, (u64, Waiter)>>,
    inner: Mutex<Inner<C::Conn>>,
}

impl<C: Connector, CL: Clock> UpstreamClient<C, CL> {
    /// Constructs client state; does not open a socket. The connection is
    /// opened lazily by the first call to [`UpstreamClient::rpc`].
    pub fn connect(address: SocketAddr, connector: C, clock: CL) -> Arc<Self> {
        Self::connect_with_metrics(address, connector, clock, Arc::new(NoopMetrics))
    }

    pub fn connect_with_metrics(
        address: SocketAddr,
        connector: C,
        clock: CL,
        metrics: Arc<dyn Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            address,
            connector,
            clock,
            metrics,
            ids: IdPool::new(),
            pending: StdMutex::new(HashMap::new()),
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Number of ids currently checked out; exposed for tests asserting
    /// properties 2 and 3 (id exclusivity, id reclamation).
    pub fn ids_in_flight(&self) -> usize {
        (crate::ids::MAX_ID as usize) - self.ids.available()
    }

    /// Sends exactly one query and returns exactly one response. Suspends
    /// while the connection is being established, while ids are exhausted,
    /// or while the response is outstanding. A write failure is retried
    /// once against a fresh connection; anything else is returned as-is.
    pub async fn rpc(self: &Arc<Self>, mut query: Vec<u8>) -> Result<Vec<u8>, Error> {
        message::MessageView::parse(&query).map_err(|_| Error::parse("failed to parse request"))?;
        let client_id = message::peek_id(&query)?;

        match self.attempt(&mut query).await {
            Ok(response) => return Ok(restore_id(response, client_id)),
            Err((e, retryable)) if !retryable => return Err(e),
            Err(_) => {}
        }

        debug!(address = %self.address, "rpc: write failed, reconnecting and retrying once");
        self.disconnect().await;
        let response = self.attempt(&mut query).await.map_err(|(e, _)| e)?;
        Ok(restore_id(response, client_id))
    }

    /// Terminates the connection if any: closes the framed transport,
    /// notifies its dispatcher, and fails every pending waiter registered
    /// against that connection's generation with `Error::Closed`,
    /// returning their ids to the pool. Idempotent.
    ///
    /// `close_notify.notify_waiters()` alone cannot be trusted to reach the
    /// dispatcher: tokio's `Notify` only wakes tasks already parked on a
    /// `notified()` call, so a dispatcher that hasn't reached its first
    /// poll yet misses the wakeup and keeps reading off this now-stale
    /// connection. Explicitly closing the transport handles the common
    /// case (the dispatcher's read then fails); draining only the entries
    /// tagged with this connection's generation handles the rest, since it
    /// means a stray frame the stale dispatcher goes on to read can never
    /// match a `pending` entry a newer generation registered after this
    /// connection was torn down, even if the same numeric id was reused.
    pub async fn disconnect(self: &Arc<Self>) {
        let (conn, close_notify, generation) = {
            let mut inner = self.inner.lock().await;
            if inner.conn.is_none() {
                return;
            }
            let conn = inner.conn.take();
            let close_notify = inner.close_notify.take();
            if let Some(timer) = inner.idle_timer.take() {
                timer.abort();
            }
            (conn, close_notify, inner.generation)
        };

        if let Some(conn) = &conn {
            if let Err(e) = conn.close().await {
                debug!(address = %self.address, error = %e, "disconnect: error closing transport");
            }
        }

        if let Some(notify) = close_notify {
            notify.notify_waiters();
        }

        let drained: Vec<(u16, Waiter)> = {
            let mut pending = self.pending.lock().expect("pending mutex poisoned");
            let stale_ids: Vec<u16> = pending
                .iter()
                .filter(|(_, (gen, _))| *gen == generation)
                .map(|(id, _)| *id)
                .collect();
            stale_ids
                .into_iter()
                .filter_map(|id| pending.remove(&id).map(|(_, tx)| (id, tx)))
                .collect()
        };

        for (id, tx) in drained {
            self.ids.put(id);
            let _ = tx.send(Err(Error::Closed));
        }
    }

    /// One full attempt at sending and receiving a query: borrow an id,
    /// register a waiter, ensure a live connection, write, and await the
    /// response. The bool in the error tuple is true exactly when the
    /// failure was a write error eligible for the single retry in `rpc`.
    async fn attempt(self: &Arc<Self>, query: &mut [u8]) -> Result<Vec<u8>, (Error, bool)> {
        let upstream_id = self.ids.get().await;
        message::set_id(query, upstream_id).map_err(|e| (e, false))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("pending mutex poisoned");
            // Tagged with a generation no live dispatcher can ever carry
            // until `get_conn` below reports the real one. Nothing can
            // complete this entry before then anyway: no frame bearing
            // `upstream_id` can be in flight on any connection until this
            // same call writes the query to the wire.
            pending.insert(upstream_id, (NO_GENERATION, tx));
        }
        // Guards the pending entry for the rest of this call: if the
        // caller's future is dropped (cancelled) at any await point below,
        // this still runs and returns the id to the pool.
        let guard = PendingGuard {
            client: Arc::clone(self),
            id: upstream_id,
            armed: true,
        };

        let (conn, generation) = self.get_conn().await.map_err(|e| (e, false))?;
        {
            let mut pending = self.pending.lock().expect("pending mutex poisoned");
            if let Some(entry) = pending.get_mut(&upstream_id) {
                entry.0 = generation;
            }
        }

        if let Err(e) = conn.write_frame(query).await {
            self.metrics.upstream_request_failed(self.address);
            return Err((e, true));
        }
        self.metrics.upstream_request_sent(self.address);

        let result = rx.await;
        guard.disarm();

        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err((e, false)),
            Err(_canceled) => Err((Error::Closed, false)),
        }
    }

    fn abandon(&self, id: u16) {
        let removed = {
            let mut pending = self.pending.lock().expect("pending mutex poisoned");
            pending.remove(&id).is_some()
        };
        if removed {
            self.ids.put(id);
        }
    }

    /// Ensures a live connection: cancels and re-arms the idle timer, reuses
    /// an open connection, or opens a new one and spawns its dispatcher.
    /// Returns the connection alongside the generation it was established
    /// under, so the caller can tag its own `pending` entry correctly.
    async fn get_conn(self: &Arc<Self>) -> Result<(Arc<C::Conn>, u64), Error> {
        let mut inner = self.inner.lock().await;

        if let Some(timer) = inner.idle_timer.take() {
            timer.abort();
        }

        if let Some(conn) = inner.conn.clone() {
            let generation = inner.generation;
            self.arm_idle_timer(&mut inner);
            return Ok((conn, generation));
        }

        let conn = Arc::new(self.connector.connect(self.address).await?);
        let close_notify = Arc::new(Notify::new());
        inner.generation += 1;
        let generation = inner.generation;
        inner.conn = Some(Arc::clone(&conn));
        inner.close_notify = Some(Arc::clone(&close_notify));

        let dispatcher = Arc::clone(self);
        let dispatcher_conn = Arc::clone(&conn);
        tokio::spawn(async move {
            dispatcher
                .dispatch_loop(dispatcher_conn, generation, close_notify)
                .await;
        });

        self.arm_idle_timer(&mut inner);
        debug!(address = %self.address, generation, "connected to upstream");
        Ok((conn, generation))
    }

    fn arm_idle_timer(self: &Arc<Self>, inner: &mut Inner<C::Conn>) {
        let client = Arc::clone(self);
        let clock = self.clock.clone();
        inner.idle_timer = Some(tokio::spawn(async move {
            clock.sleep(IDLE_TIMEOUT).await;
            trace!(address = %client.address, "idle timeout elapsed");
            client.disconnect().await;
        }));
    }

    /// The long-lived per-connection dispatcher: reads frames, demuxes on
    /// id, and wakes the matching waiter. Stray ids are logged and dropped,
    /// never tearing down the connection; a read or parse failure is fatal
    /// for this connection only.
    async fn dispatch_loop(
        self: Arc<Self>,
        conn: Arc<C::Conn>,
        generation: u64,
        close_notify: Arc<Notify>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = close_notify.notified() => {
                    trace!(address = %self.address, generation, "dispatcher exiting: connection superseded");
                    return;
                }
                frame = conn.read_frame() => {
                    let buf = match frame {
                        Ok(buf) => buf,
                        Err(e) => {
                            debug!(address = %self.address, error = %e, "dispatcher: read failed");
                            break;
                        }
                    };

                    let id = match message::peek_id(&buf) {
                        Ok(id) => id,
                        Err(e) => {
                            warn!(address = %self.address, error = %e, "dispatcher: malformed response, closing connection");
                            break;
                        }
                    };

                    if !self.complete_pending(id, generation, buf) {
                        trace!(address = %self.address, id, generation, "dispatcher: stray or superseded response, dropping");
                    }
                }
            }
        }

        self.disconnect().await;
    }

    /// Completes the pending waiter for `id` with `buf`, but only if it was
    /// registered under `generation` — a response read off a connection
    /// that has since been superseded must never satisfy a different
    /// generation's waiter that happens to have reused the same id
    /// (property 9 / scenario S5: disconnect must fail pending cleanly,
    /// never misdeliver). Returns whether a waiter was completed.
    fn complete_pending(&self, id: u16, generation: u64, buf: Vec<u8>) -> bool {
        let waiter = {
            let mut pending = self.pending.lock().expect("pending mutex poisoned");
            match pending.get(&id) {
                Some((gen, _)) if *gen == generation => pending.remove(&id).map(|(_, tx)| tx),
                _ => None,
            }
        };

        match waiter {
            Some(tx) => {
                self.ids.put(id);
                let _ = tx.send(Ok(buf));
                true
            }
            None => false,
        }
    }
}

struct PendingGuard<C: Connector, CL: Clock> {
    client: Arc<UpstreamClient<C, CL>>,
    id: u16,
    armed: bool,
}

impl<C: Connector, CL: Clock> PendingGuard<C, CL> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<C: Connector, CL: Clock> Drop for PendingGuard<C, CL> {
    fn drop(&mut self) {
        if self.armed {
            self.client.abandon(self.id);
        }
    }
}

/// Restores bytes `[0..2)` to the downstream's original id before delivery.
/// `client_id` came from a buffer that passed `peek_id`, and a dispatched
/// response is always at least 2 bytes (it too passed `peek_id`), so this
/// cannot fail.
fn restore_id(mut response: Vec<u8>, client_id: u16) -> Vec<u8> {
    message::set_id(&mut response, client_id).expect("dispatched response shorter than an id");
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::transport::testing::{InMemoryConnector, InMemoryNetwork};

    fn query_for(id: u16, name: &str) -> Vec<u8> {
        let mut buf = vec![0u8; 12];
        buf[0..2].copy_from_slice(&id.to_be_bytes());
        buf[5] = 1; // qdcount = 1
        for label in name.split('.') {
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
        buf.push(0);
        buf.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        buf
    }

    #[tokio::test]
    async fn rpc_round_trips_client_id() {
        let net = InMemoryNetwork::new();
        let upstream_addr = "127.0.0.1:5300".parse().unwrap();
        let server = net.listen(upstream_addr);
        let client = UpstreamClient::connect(upstream_addr, InMemoryConnector::new(net), ManualClock::new());

        let echo = tokio::spawn(async move {
            let (conn, _peer) = server.accept().await.unwrap();
            let req = conn.read_frame().await.unwrap();
            let mut resp = req.clone();
            resp[3] = 0x80; // arbitrary marker distinguishing response bytes
            conn.write_frame(&resp).await.unwrap();
        });

        let query = query_for(0xBEEF, "foo.com");
        let response = client.rpc(query).await.unwrap();
        assert_eq!(&response[0..2], &0xBEEFu16.to_be_bytes());
        assert_eq!(response[3], 0x80);

        echo.await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_fails_all_pending_and_reclaims_ids() {
        let net = InMemoryNetwork::new();
        let upstream_addr = "127.0.0.1:5301".parse().unwrap();
        let server = net.listen(upstream_addr);
        let client = UpstreamClient::connect(upstream_addr, InMemoryConnector::new(net), ManualClock::new());

        // A server that accepts and reads requests but never answers them.
        let sink = tokio::spawn(async move {
            let (conn, _peer) = server.accept().await.unwrap();
            let _ = conn.read_frame().await;
            let _ = conn.read_frame().await;
            futures_util::future::pending::<()>().await;
        });

        let c1 = Arc::clone(&client);
        let c2 = Arc::clone(&client);
        let t1 = tokio::spawn(async move { c1.rpc(query_for(1, "a.com")).await });
        let t2 = tokio::spawn(async move { c2.rpc(query_for(2, "b.com")).await });

        // give both attempts a chance to register before disconnecting.
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.disconnect().await;

        let r1 = t1.await.unwrap();
        let r2 = t2.await.unwrap();
        assert!(matches!(r1, Err(Error::Closed)));
        assert!(matches!(r2, Err(Error::Closed)));
        assert_eq!(client.ids_in_flight(), 0);

        sink.abort();
    }

    #[tokio::test]
    async fn cancelling_an_rpc_reclaims_its_id() {
        let net = InMemoryNetwork::new();
        let upstream_addr = "127.0.0.1:5302".parse().unwrap();
        let server = net.listen(upstream_addr);
        let client = UpstreamClient::connect(upstream_addr, InMemoryConnector::new(net), ManualClock::new());

        let sink = tokio::spawn(async move {
            let (conn, _peer) = server.accept().await.unwrap();
            let _ = conn.read_frame().await;
            futures_util::future::pending::<()>().await;
        });

        let c1 = Arc::clone(&client);
        let handle = tokio::spawn(async move { c1.rpc(query_for(3, "c.com")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.ids_in_flight(), 1);

        handle.abort();
        let _ = handle.await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.ids_in_flight(), 0);

        sink.abort();
    }

    /// S4: 600 concurrent rpcs against one upstream. The id pool caps
    /// in-flight requests at 512 (spec §4.3, §8 property 2); the remainder
    /// block until ids already in flight are reclaimed, and all 600
    /// eventually succeed with no id ever double-allocated.
    #[tokio::test]
    async fn six_hundred_concurrent_rpcs_respect_the_id_cap() {
        let net = InMemoryNetwork::new();
        let upstream_addr = "127.0.0.1:5303".parse().unwrap();
        let server = net.listen(upstream_addr);
        let client = UpstreamClient::connect(upstream_addr, InMemoryConnector::new(net), ManualClock::new());

        let echo = tokio::spawn(async move {
            let (conn, _peer) = server.accept().await.unwrap();
            loop {
                let req = match conn.read_frame().await {
                    Ok(req) => req,
                    Err(_) => break,
                };
                let mut resp = req;
                resp[3] = 0x80;
                if conn.write_frame(&resp).await.is_err() {
                    break;
                }
            }
        });

        let handles: Vec<_> = (0..600u16)
            .map(|i| {
                let c = Arc::clone(&client);
                tokio::spawn(async move { c.rpc(query_for(i, "x.com")).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(client.ids_in_flight() <= crate::ids::MAX_ID as usize);

        for (i, handle) in handles.into_iter().enumerate() {
            let response = handle.await.unwrap().unwrap();
            assert_eq!(&response[0..2], &(i as u16).to_be_bytes());
        }
        assert_eq!(client.ids_in_flight(), 0);

        echo.abort();
    }

    /// S5: the upstream's connection drops out from under two pending
    /// rpcs. Both resolve with `Error::Closed`, both ids return to the
    /// pool, and a subsequent rpc reconnects from scratch.
    #[tokio::test]
    async fn upstream_closing_mid_flight_fails_pending_and_allows_reconnect() {
        let net = InMemoryNetwork::new();
        let upstream_addr = "127.0.0.1:5304".parse().unwrap();
        let first_server = net.listen(upstream_addr);
        let client = UpstreamClient::connect(
            upstream_addr,
            InMemoryConnector::new(net.clone()),
            ManualClock::new(),
        );

        let first_conn = tokio::spawn(async move {
            let (conn, _peer) = first_server.accept().await.unwrap();
            let _ = conn.read_frame().await;
            let _ = conn.read_frame().await;
            // `conn` is dropped here: the upstream closes its socket with
            // both rpcs still pending.
        });

        let c1 = Arc::clone(&client);
        let c2 = Arc::clone(&client);
        let t1 = tokio::spawn(async move { c1.rpc(query_for(20, "a.com")).await });
        let t2 = tokio::spawn(async move { c2.rpc(query_for(21, "b.com")).await });

        let r1 = tokio::time::timeout(Duration::from_millis(200), t1)
            .await
            .expect("rpc should resolve once the connection drops")
            .unwrap();
        let r2 = tokio::time::timeout(Duration::from_millis(200), t2)
            .await
            .expect("rpc should resolve once the connection drops")
            .unwrap();
        assert!(matches!(r1, Err(Error::Closed)));
        assert!(matches!(r2, Err(Error::Closed)));
        assert_eq!(client.ids_in_flight(), 0);

        first_conn.await.unwrap();

        // Re-register the upstream address so the next connect succeeds,
        // standing in for the server listening again after going away.
        let second_server = net.listen(upstream_addr);
        let echo = tokio::spawn(async move {
            let (conn, _peer) = second_server.accept().await.unwrap();
            let req = conn.read_frame().await.unwrap();
            let mut resp = req;
            resp[3] = 0x80;
            conn.write_frame(&resp).await.unwrap();
        });

        let response = client.rpc(query_for(22, "c.com")).await.unwrap();
        assert_eq!(&response[0..2], &22u16.to_be_bytes());
        assert_eq!(response[3], 0x80);

        echo.await.unwrap();
    }

    /// A dispatcher bound to a superseded connection generation reads a
    /// frame whose id has since been reassigned to a newer generation's
    /// request. Reproduces the client-initiated-disconnect-races-dispatcher
    /// scenario from the reviewer's concern directly against the pending
    /// table, independent of however tokio happens to schedule the two
    /// dispatcher tasks: this is the exact check `dispatch_loop` performs
    /// before completing a waiter, not an end-to-end timing race.
    #[tokio::test]
    async fn stale_generation_response_cannot_satisfy_a_newer_generations_waiter() {
        let net = InMemoryNetwork::new();
        let upstream_addr = "127.0.0.1:5306".parse().unwrap();
        let client = UpstreamClient::connect(upstream_addr, InMemoryConnector::new(net), ManualClock::new());

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = client.pending.lock().unwrap();
            pending.insert(1, (2, tx));
        }

        // A response for id 1 arrives tagged with generation 1, already
        // superseded by generation 2's request reusing the same id.
        let delivered = client.complete_pending(1, 1, vec![0u8; 12]);
        assert!(!delivered, "a stale generation must not complete a newer one's waiter");

        // Generation 2's waiter is untouched and its id still checked out.
        assert!(rx.try_recv().is_err());
        assert!(client.pending.lock().unwrap().contains_key(&1));

        // The legitimate generation completes it normally.
        let delivered = client.complete_pending(1, 2, vec![0xABu8; 12]);
        assert!(delivered);
        assert_eq!(rx.await.unwrap().unwrap(), vec![0xABu8; 12]);
        assert!(!client.pending.lock().unwrap().contains_key(&1));
    }

    /// `disconnect` must close the transport, not just rely on the
    /// best-effort `close_notify`. Exercised by checking the in-memory
    /// connection's own observable post-close state rather than the
    /// dispatcher's behavior, which depends on scheduling.
    #[tokio::test]
    async fn disconnect_closes_the_underlying_transport() {
        let net = InMemoryNetwork::new();
        let upstream_addr = "127.0.0.1:5307".parse().unwrap();
        let server = net.listen(upstream_addr);
        let client = UpstreamClient::connect(upstream_addr, InMemoryConnector::new(net), ManualClock::new());

        let accepted = tokio::spawn(async move { server.accept().await.unwrap() });

        let (conn, _generation) = client.get_conn().await.unwrap();
        let (server_conn, _peer) = accepted.await.unwrap();

        client.disconnect().await;

        assert!(conn.write_frame(b"closed").await.is_err());
        assert!(server_conn.read_frame().await.is_err());
    }
}
