// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The downstream listener (spec §4.6): binds the client-facing UDP and TCP
//! sockets, frames requests, invokes the forwarder engine, and writes
//! responses back. A framing error on a TCP connection ends only that
//! connection; nothing here ever terminates the process (spec §7).
//!
//! Grounded on the `clawpot` DNS proxy's `run_inner` (`other_examples/
//! 6feebabf_..._dns_proxy.rs.rs`): one `tokio::select!` loop per transport,
//! each accepted unit of work spawned so the accept/recv loop is never
//! blocked by one slow client, plus a `watch`-driven shutdown arm (spec.md
//! doesn't require this, but no embeddable forwarder can do without it —
//! see SPEC_FULL.md's ambient additions).

use std::net::SocketAddr;
use std::sync::Arc;

use dnsfwd_proto::clock::Clock;
use dnsfwd_proto::error::Error;
use dnsfwd_proto::transport::{
    Connector, FramedIo, TcpConn as TokioTcpConn, TokioTcpAcceptor, TokioUdpSocket,
    MAX_UDP_MESSAGE_SIZE,
};
use tokio::sync::watch;
use tracing::warn;

use crate::engine::Forwarder;

/// Binds spec §4.6's UDP and TCP accept loops against a shared [`Forwarder`].
pub struct Listener<C: Connector, CL: Clock> {
    forwarder: Arc<Forwarder<C, CL>>,
}

impl<C: Connector, CL: Clock> Listener<C, CL> {
    pub fn new(forwarder: Arc<Forwarder<C, CL>>) -> Self {
        Self { forwarder }
    }

    /// Binds `addr` and serves DNS-over-UDP until `shutdown` fires. Each
    /// datagram is answered by an independently spawned task (spec §4.6:
    /// "Datagrams are processed concurrently; each is independent"; spec §9
    /// resolves the source's UDP/TCP asymmetry by processing each request
    /// concurrently here too).
    pub async fn serve_udp(
        &self,
        addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), Error> {
        let socket = Arc::new(
            TokioUdpSocket::bind(addr)
                .await
                .map_err(|_| Error::bind("please supply a free port number"))?,
        );

        loop {
            let mut buf = vec![0u8; MAX_UDP_MESSAGE_SIZE];
            tokio::select! {
                biased;
                _ = shutdown.changed() => return Ok(()),
                received = socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(%addr, error = %e, "udp listener: recv failed");
                            continue;
                        }
                    };
                    buf.truncate(len);

                    let forwarder = Arc::clone(&self.forwarder);
                    let reply_socket = Arc::clone(&socket);
                    tokio::spawn(async move {
                        if let Some(response) = forwarder.answer(buf).await {
                            if let Err(e) = reply_socket.send_to(&response, peer).await {
                                warn!(%peer, error = %e, "udp listener: failed to send response");
                            }
                        }
                    });
                }
            }
        }
    }

    /// Binds `addr` and serves DNS-over-TCP until `shutdown` fires. Each
    /// accepted connection runs its own read-answer-write loop until the
    /// peer disconnects or a framing error occurs, independent of every
    /// other connection (spec §6: "multiple queries per connection are
    /// supported serially per connection but concurrent across
    /// connections").
    pub async fn serve_tcp(
        &self,
        addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), Error> {
        let acceptor = TokioTcpAcceptor::bind(addr)
            .await
            .map_err(|_| Error::bind("please supply a free port number"))?;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => return Ok(()),
                accepted = acceptor.accept() => {
                    let (conn, peer) = match accepted {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(%addr, error = %e, "tcp listener: accept failed");
                            continue;
                        }
                    };

                    let forwarder = Arc::clone(&self.forwarder);
                    let conn_shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        serve_tcp_connection(forwarder, conn, peer, conn_shutdown).await;
                    });
                }
            }
        }
    }
}

async fn serve_tcp_connection<C: Connector, CL: Clock>(
    forwarder: Arc<Forwarder<C, CL>>,
    conn: TokioTcpConn,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            frame = conn.read_frame() => {
                let query = match frame {
                    Ok(buf) => buf,
                    Err(e) => {
                        // EOF or a short read: the peer is gone or sent a
                        // malformed frame. Either way this connection, and
                        // only this connection, ends here (spec §4.6, §7).
                        tracing::debug!(%peer, error = %e, "tcp listener: connection ended");
                        return;
                    }
                };

                let Some(response) = forwarder.answer(query).await else {
                    continue;
                };

                if let Err(e) = conn.write_frame(&response).await {
                    warn!(%peer, error = %e, "tcp listener: failed to write response");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dnsfwd_proto::clock::ManualClock;
    use dnsfwd_proto::config::{Configuration, ServerConfig};
    use dnsfwd_proto::transport::{TcpConnector, UdpConnector};
    use tokio::net::UdpSocket;

    fn query_for(name: &str) -> Vec<u8> {
        let mut buf = vec![0xAB, 0xCD, 0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        for label in name.split('.') {
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
        buf.push(0);
        buf.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        buf
    }

    /// S1: a single default upstream answering over UDP; a UDP query to the
    /// forwarder comes back with the query's original id.
    #[tokio::test]
    async fn udp_end_to_end_round_trip() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (len, peer) = upstream.recv_from(&mut buf).await.unwrap();
            buf.truncate(len);
            buf[3] = 0x80;
            upstream.send_to(&buf, peer).await.unwrap();
        });

        let config = Configuration::new(vec![ServerConfig::default_server(upstream_addr)], vec![]);
        let forwarder = Forwarder::new(config, UdpConnector, ManualClock::new());
        let listener = Listener::new(Arc::clone(&forwarder));

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();

        // Bind first so we can learn the ephemeral port, then hand the
        // bound listener off to a background task.
        let probe = tokio::net::UdpSocket::bind(bind_addr).await.unwrap();
        let forwarder_addr = probe.local_addr().unwrap();
        drop(probe);

        let serve = tokio::spawn(async move {
            listener.serve_udp(forwarder_addr, shutdown_rx).await
        });

        // Give the listener a moment to bind before sending.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&query_for("foo.com"), forwarder_addr)
            .await
            .unwrap();

        let mut response = vec![0u8; 512];
        let (len, _) = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            client.recv_from(&mut response),
        )
        .await
        .unwrap()
        .unwrap();
        response.truncate(len);

        assert_eq!(&response[0..2], &[0xAB, 0xCD]);
        assert_eq!(response[3], 0x80);

        serve.abort();
    }

    #[tokio::test]
    async fn tcp_end_to_end_round_trip() {
        let upstream = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();

        tokio::spawn(async move {
            use dnsfwd_proto::transport::TcpConn;
            let (stream, _peer) = upstream.accept().await.unwrap();
            let conn = TcpConn::new(stream);
            let req = conn.read_frame().await.unwrap();
            let mut resp = req;
            resp[3] = 0x80;
            conn.write_frame(&resp).await.unwrap();
        });

        let config = Configuration::new(vec![ServerConfig::default_server(upstream_addr)], vec![]);
        let forwarder = Forwarder::new(config, TcpConnector, ManualClock::new());
        let listener = Listener::new(Arc::clone(&forwarder));

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let forwarder_addr = probe.local_addr().unwrap();
        drop(probe);

        let serve = tokio::spawn(async move {
            listener.serve_tcp(forwarder_addr, shutdown_rx).await
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        use dnsfwd_proto::transport::TcpConn;
        let stream = tokio::net::TcpStream::connect(forwarder_addr).await.unwrap();
        let client_conn = TcpConn::new(stream);
        client_conn.write_frame(&query_for("foo.com")).await.unwrap();
        let response = tokio::time::timeout(std::time::Duration::from_secs(1), client_conn.read_frame())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(&response[0..2], &[0xAB, 0xCD]);
        assert_eq!(response[3], 0x80);

        serve.abort();
    }
}
